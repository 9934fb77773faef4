use crate::context;
use crate::runtime::timer::Timer;
use crate::task::{RunQueue, SuspendToken, TaskList, TaskQueue, TaskRef, TaskState};
use anyhow::Result;
use parking_lot::{Condvar, Mutex};
use std::cell::Cell;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::trace;

/// Retired pile size that triggers a collection on the done path.
const GC_THRESHOLD: usize = 16;

/// Upper bound on an idle park. Wakeups normally arrive through the condvar;
/// the timeout is only the polling floor.
const PARK_TIMEOUT: Duration = Duration::from_millis(100);

/// A single-thread executor owning a set of stackful coroutines.
///
/// One OS thread runs [`Processor::process`]; every other thread is a
/// producer: peers steal from the inbox and run queue, wakeups re-enroll
/// suspended tasks, `add` injects new ones. All cross-thread traffic goes
/// through the per-queue locks, plus the park condvar for unparking.
pub(crate) struct Processor {
    id: usize,

    /// Shared scheduler stop flag, re-read on every loop iteration.
    stop: Arc<AtomicBool>,

    timer: Arc<Timer>,

    /// Cross-thread ingress: producers push, the owner drains batches into
    /// the run queue, stealers harvest from the back.
    inbox: TaskQueue,

    /// Runnable tasks plus the running/next execution slots.
    run_queue: RunQueue,

    /// Tasks suspended on this processor, until a wakeup moves them back.
    wait_queue: TaskQueue,

    /// Completed tasks awaiting their final reference drop. Pushed and
    /// drained by the owner thread only.
    retired: Mutex<Vec<TaskRef>>,

    /// Per-round budget for mid-round inbox drains, so producer traffic
    /// cannot starve the already-runnable set. Owner thread only.
    inbox_quota: Cell<u32>,

    switches: AtomicU64,

    // Watchdog snapshot: the switch count last observed by `mark` and when
    // it was taken, in micros since `epoch`.
    mark_switch: AtomicU64,
    mark_at_us: AtomicU64,
    epoch: Instant,
    cycle_timeout: Duration,

    parked: Mutex<bool>,
    unparked: Condvar,
}

// Safety: `inbox_quota` is only touched from the owner thread (the one
// inside `process`); every other field is a lock, an atomic or immutable.
unsafe impl Sync for Processor {}

impl Processor {
    pub(crate) fn new(
        id: usize,
        stop: Arc<AtomicBool>,
        timer: Arc<Timer>,
        cycle_timeout: Duration,
    ) -> Self {
        Self {
            id,
            stop,
            timer,
            inbox: TaskQueue::new(),
            run_queue: RunQueue::new(),
            wait_queue: TaskQueue::new(),
            retired: Mutex::new(Vec::new()),
            inbox_quota: Cell::new(0),
            switches: AtomicU64::new(0),
            mark_switch: AtomicU64::new(0),
            mark_at_us: AtomicU64::new(0),
            epoch: Instant::now(),
            cycle_timeout,
            parked: Mutex::new(false),
            unparked: Condvar::new(),
        }
    }

    pub(crate) fn id(&self) -> usize {
        self.id
    }

    // --- ingress -----------------------------------------------------------

    /// Enqueue one task. Callable from any thread; unparks an idle owner.
    pub(crate) fn add(&self, task: TaskRef) {
        trace!(proc = self.id, task = task.id(), "task added");
        self.inbox.push(task);
        self.unpark_if_parked();
    }

    /// Bulk ingress, one lock acquisition for the whole run.
    pub(crate) fn add_all(&self, tasks: TaskList) {
        if tasks.is_empty() {
            return;
        }
        trace!(proc = self.id, count = tasks.len(), "tasks added");
        self.inbox.push_all(tasks);
        self.unpark_if_parked();
    }

    /// Approximate amount of work queued here (runnable + inbox).
    pub(crate) fn runnable_len(&self) -> usize {
        self.run_queue.len_hint() + self.inbox.len_hint()
    }

    // --- run loop ----------------------------------------------------------

    /// Drive tasks until the stop flag is set. Owner thread only; at most
    /// one call at a time.
    ///
    /// Returns `Err` when a completed task carried a failure; the caller
    /// (the scheduler's worker loop) decides whether to restart.
    pub(crate) fn process(self: &Arc<Self>) -> Result<()> {
        while !self.stop.load(Ordering::Acquire) {
            let mut running = self.run_queue.lock().peek_front_as_running();
            if running.is_none() {
                if self.drain_inbox() {
                    running = self.run_queue.lock().peek_front_as_running();
                }
                if running.is_none() {
                    self.park();
                    self.drain_inbox();
                    continue;
                }
            }

            self.inbox_quota.set(1);
            while let Some(task) = running {
                if self.stop.load(Ordering::Acquire) {
                    return Ok(());
                }
                task.set_state(TaskState::Runnable);
                task.set_processor(self);
                self.switches.fetch_add(1, Ordering::Relaxed);

                task.resume();

                running = match task.state() {
                    TaskState::Runnable => self.pick_after_yield(),
                    // The suspend path already staged `next` and moved the
                    // task to the wait queue; just adopt the successor.
                    TaskState::Blocked => self.run_queue.lock().adopt_next(),
                    TaskState::Done => self.retire(task)?,
                };
            }
        }
        Ok(())
    }

    /// The task yielded cooperatively: follow its link, draining the inbox
    /// mid-round at most `inbox_quota` times.
    fn pick_after_yield(&self) -> Option<TaskRef> {
        let mut queue = self.run_queue.lock();
        if let Some(next) = queue.advance_running() {
            return Some(next);
        }
        if self.inbox_quota.get() == 0 || self.inbox.is_empty_hint() {
            queue.clear_running();
            return None;
        }
        // Splicing takes the run-queue lock as well, so release it first;
        // advancing afterwards picks up the freshly appended batch.
        drop(queue);
        if self.drain_inbox() {
            self.inbox_quota.set(self.inbox_quota.get() - 1);
            let mut queue = self.run_queue.lock();
            match queue.advance_running() {
                Some(next) => Some(next),
                None => {
                    queue.clear_running();
                    None
                }
            }
        } else {
            self.run_queue.lock().clear_running();
            None
        }
    }

    /// The task finished: stage a successor, move the task to the retired
    /// pile and surface a captured failure once the slots are normalized.
    fn retire(&self, task: TaskRef) -> Result<Option<TaskRef>> {
        let staged = self.run_queue.lock().compute_next();
        if !staged && self.inbox_quota.get() > 0 && self.drain_inbox() {
            self.inbox_quota.set(self.inbox_quota.get() - 1);
            self.run_queue.lock().compute_next();
        }

        trace!(proc = self.id, task = task.id(), "task done");
        let retired = self
            .run_queue
            .lock()
            .erase_running()
            .expect("completed task was not enrolled in the run queue");
        if self.retired.lock().len() > GC_THRESHOLD {
            self.collect();
        }
        self.retired.lock().push(retired);

        // Normalize the slots before propagating so no other thread can
        // observe them still naming a retired task.
        let failure = task.take_failure();
        let next = self.run_queue.lock().adopt_next();
        match failure {
            Some(err) => Err(err),
            None => Ok(next),
        }
    }

    /// Splice the entire inbox into the run queue. Returns whether anything
    /// moved.
    fn drain_inbox(&self) -> bool {
        if self.inbox.is_empty_hint() {
            return false;
        }
        let batch = self.inbox.pop_all();
        if batch.is_empty() {
            return false;
        }
        self.run_queue.push_all(batch);
        true
    }

    // --- idle parking ------------------------------------------------------

    fn park(&self) {
        // Bound the memory held across a quiescent period.
        self.collect();
        let mut parked = self.parked.lock();
        *parked = true;
        self.unparked.wait_for(&mut parked, PARK_TIMEOUT);
        *parked = false;
    }

    pub(crate) fn unpark_if_parked(&self) {
        let mut parked = self.parked.lock();
        if *parked {
            *parked = false;
            self.unparked.notify_all();
        }
    }

    pub(crate) fn is_parked(&self) -> bool {
        *self.parked.lock()
    }

    // --- suspend / wakeup --------------------------------------------------

    /// Prepare the currently-running task for suspension and hand back the
    /// wakeup capability. The body must still yield (`yield_now`) to leave
    /// the thread; a wakeup arriving in between is safe because the task is
    /// already enrolled in the wait queue and the running slot is
    /// steal-protected.
    pub(crate) fn suspend_current(&self) -> SuspendToken {
        let task = self
            .run_queue
            .running_task()
            .expect("suspend with no running task");
        assert_eq!(
            task.state(),
            TaskState::Runnable,
            "suspend from a task that is not running"
        );

        task.set_state(TaskState::Blocked);
        let id = task.begin_suspend();

        let staged = self.run_queue.lock().compute_next();
        if !staged && self.inbox_quota.get() > 0 && self.drain_inbox() {
            self.inbox_quota.set(self.inbox_quota.get() - 1);
            self.run_queue.lock().compute_next();
        }

        let moved = self
            .run_queue
            .lock()
            .erase_running()
            .expect("suspending task was not enrolled in the run queue");
        self.wait_queue.push(moved);
        trace!(proc = self.id, task = task.id(), id, "task suspended");

        SuspendToken {
            task: Arc::downgrade(&task),
            id,
        }
    }

    /// Suspend with a deferred wakeup after `timeout`.
    pub(crate) fn suspend_current_for(&self, timeout: Duration) -> SuspendToken {
        let token = self.suspend_current();
        self.timer.schedule_after(timeout, token.clone());
        token
    }

    /// Suspend with a deferred wakeup at `deadline`.
    pub(crate) fn suspend_current_until(&self, deadline: Instant) -> SuspendToken {
        let token = self.suspend_current();
        self.timer.schedule_at(deadline, token.clone());
        token
    }

    /// Resume a suspended task from any thread. Returns `false` when the
    /// token is stale or the task is gone.
    ///
    /// Delegates to the processor recorded in the task, which may not be the
    /// caller's: the task re-enters the run queue it was suspended on.
    pub(crate) fn wakeup(token: &SuspendToken) -> bool {
        let Some(task) = token.task.upgrade() else {
            return false;
        };
        let Some(proc) = task.processor() else {
            return false;
        };
        proc.wakeup_local(&task, token.id)
    }

    pub(crate) fn is_expired(token: &SuspendToken) -> bool {
        match token.task.upgrade() {
            Some(task) => token.id != task.suspend_seq(),
            None => true,
        }
    }

    fn wakeup_local(&self, task: &TaskRef, id: u64) -> bool {
        if id != task.suspend_seq() {
            return false;
        }
        let woken = {
            let mut wait_queue = self.wait_queue.lock();
            // Re-check under the lock: of any number of concurrent wakeups,
            // exactly one observes the matching id.
            if id != task.suspend_seq() {
                return false;
            }
            task.finish_suspend(id);
            wait_queue
                .erase(task)
                .expect("woken task was not enrolled in the wait queue")
        };
        trace!(proc = self.id, task = task.id(), id, "task woken");
        self.run_queue.push(woken);
        self.unpark_if_parked();
        true
    }

    // --- stealing ----------------------------------------------------------

    /// Donate up to `n` tasks to a peer; `n == 0` takes everything
    /// available. The victim's running and staged-next tasks are never
    /// donated: if the harvest picked them up they are re-enrolled before
    /// the lock drops.
    ///
    /// Lock order: inbox, then run queue. Any other site touching both must
    /// match it.
    pub(crate) fn steal(&self, n: usize) -> TaskList {
        let mut from_inbox = self.inbox.pop_back(n);
        if n > 0 && from_inbox.len() >= n {
            trace!(proc = self.id, count = from_inbox.len(), "stolen from inbox");
            return from_inbox;
        }

        let mut queue = self.run_queue.lock();
        let running_guard = queue.running_ptr().and_then(|ptr| {
            queue
                .unlink_if_enrolled(ptr)
                // Safety: the slot keeps the task alive (it is enrolled in a
                // queue or the retired pile of this processor).
                .or_else(|| from_inbox.erase(unsafe { ptr.as_ref() }))
        });
        let next_guard = queue.next_ptr().and_then(|ptr| {
            queue
                .unlink_if_enrolled(ptr)
                .or_else(|| from_inbox.erase(unsafe { ptr.as_ref() }))
        });

        let want = if n == 0 { 0 } else { n - from_inbox.len() };
        let mut harvest = queue.harvest_back(want);
        if let Some(task) = running_guard {
            queue.push_back(task);
        }
        if let Some(task) = next_guard {
            queue.push_back(task);
        }
        drop(queue);

        harvest.append(from_inbox);
        if !harvest.is_empty() {
            trace!(proc = self.id, count = harvest.len(), "stolen");
        }
        harvest
    }

    // --- blocking detection ------------------------------------------------

    /// Watchdog snapshot; called periodically from the dispatcher thread.
    pub(crate) fn mark(&self) {
        let switches = self.switches.load(Ordering::Relaxed);
        if self.run_queue.has_running() && self.mark_switch.load(Ordering::Relaxed) != switches {
            self.mark_switch.store(switches, Ordering::Relaxed);
            self.mark_at_us.store(self.now_us(), Ordering::Relaxed);
        }
    }

    /// Whether a task is currently occupying the run loop. Combined with
    /// [`Processor::is_blocking`] by the dispatcher: the blocking hint stays
    /// latched after the offending task completes, so it only means "stuck"
    /// while a task is actually executing.
    pub(crate) fn is_executing(&self) -> bool {
        self.run_queue.has_running()
    }

    /// Whether the processor has sat inside a single task for longer than
    /// the cycle timeout. A hint only; the dispatcher acts on it.
    pub(crate) fn is_blocking(&self) -> bool {
        let mark = self.mark_switch.load(Ordering::Relaxed);
        if mark == 0 || mark != self.switches.load(Ordering::Relaxed) {
            return false;
        }
        self.now_us() > self.mark_at_us.load(Ordering::Relaxed) + self.cycle_timeout.as_micros() as u64
    }

    fn now_us(&self) -> u64 {
        self.epoch.elapsed().as_micros() as u64
    }

    // --- gc ----------------------------------------------------------------

    /// Drop the references of completed tasks. Destruction happens here or,
    /// when suspend tokens still point at a task, at the last token upgrade
    /// failure.
    pub(crate) fn collect(&self) {
        let drained: Vec<TaskRef> = {
            let mut retired = self.retired.lock();
            retired.drain(..).collect()
        };
        // Destructors run outside the lock.
        drop(drained);
    }

    // --- accessors ---------------------------------------------------------

    pub(crate) fn current() -> Option<Arc<Processor>> {
        context::current_processor()
    }

    pub(crate) fn current_task(&self) -> Option<TaskRef> {
        self.run_queue.running_task()
    }

    pub(crate) fn switch_count(&self) -> u64 {
        self.switches.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    pub(crate) fn retired_len(&self) -> usize {
        self.retired.lock().len()
    }

    #[cfg(test)]
    pub(crate) fn wait_len(&self) -> usize {
        self.wait_queue.len_hint()
    }
}

impl std::fmt::Debug for Processor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Processor")
            .field("id", &self.id)
            .field("runnable", &self.run_queue.len_hint())
            .field("inbox", &self.inbox.len_hint())
            .field("waiting", &self.wait_queue.len_hint())
            .field("switches", &self.switches.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
