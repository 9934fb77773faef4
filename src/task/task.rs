use crate::context;
use crate::runtime::processor::Processor;
use crate::task::queue::{Node, TaskRef};
use anyhow::anyhow;
use corosensei::stack::DefaultStack;
use corosensei::{Coroutine, CoroutineResult};
use parking_lot::Mutex;
use std::any::Any;
use std::cell::{Cell, UnsafeCell};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Execution state observed by the run loop when a swap-in returns.
///
/// The processor normalizes the state to `Runnable` before every swap-in; a
/// task that plainly yields leaves it there, the suspend path flips it to
/// `Blocked` before yielding, and the swap-in wrapper records `Done` when the
/// body returns or panics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TaskState {
    Runnable,
    Blocked,
    Done,
}

type Coro = Coroutine<(), (), (), DefaultStack>;

/// A stackful coroutine plus the bookkeeping the processors need: the
/// intrusive queue link, a state cell, the monotonic suspend-id and a
/// back-pointer to the processor currently responsible for it.
///
/// `Arc<Task>` is the reference-counting identity; a queue holds one strong
/// reference per enrolled task.
pub(crate) struct Task {
    id: u64,

    /// Intrusive link; see the ownership rules on [`Node`].
    pub(in crate::task) node: UnsafeCell<Node>,

    state: Cell<TaskState>,

    /// Bumped on every suspend and again on the winning wakeup, making each
    /// suspend token a single-shot capability.
    suspend_id: AtomicU64,

    /// Processor that last ran (and would resume) this task. Read by wakeups
    /// from arbitrary threads.
    proc: Mutex<Option<Arc<Processor>>>,

    coro: UnsafeCell<Coro>,

    /// Panic payload captured at the swap-in boundary, surfaced by the done
    /// path.
    failure: Cell<Option<anyhow::Error>>,
}

// Safety: `node` is guarded by queue locks (see queue.rs). `state`, `coro`
// and `failure` are only touched by the thread currently responsible for the
// task, and responsibility is only ever transferred through a queue mutex,
// which orders those accesses. The remaining fields are an atomic, a mutex
// and plain immutable data.
unsafe impl Send for Task {}
unsafe impl Sync for Task {}

impl Task {
    pub(crate) fn new<F>(id: u64, stack_size: usize, body: F) -> anyhow::Result<TaskRef>
    where
        F: FnOnce() + Send + 'static,
    {
        let stack = DefaultStack::new(stack_size)
            .map_err(|e| anyhow!("failed to allocate a {stack_size} byte coroutine stack: {e}"))?;
        let coro = Coroutine::with_stack(stack, move |yielder, ()| {
            // Publish the yielder so `yield_now` can reach it without
            // threading it through the body.
            context::set_yielder(NonNull::from(yielder));
            body();
        });

        Ok(Arc::new(Self {
            id,
            node: UnsafeCell::new(Node::unlinked()),
            state: Cell::new(TaskState::Runnable),
            suspend_id: AtomicU64::new(0),
            proc: Mutex::new(None),
            coro: UnsafeCell::new(coro),
            failure: Cell::new(None),
        }))
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn state(&self) -> TaskState {
        self.state.get()
    }

    pub(crate) fn set_state(&self, state: TaskState) {
        self.state.set(state);
    }

    pub(crate) fn suspend_seq(&self) -> u64 {
        self.suspend_id.load(Ordering::Acquire)
    }

    /// Open a new suspend epoch and return its id.
    pub(crate) fn begin_suspend(&self) -> u64 {
        self.suspend_id.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Close epoch `id` so every other wakeup racing for it fails. Must be
    /// called under the wait-queue lock after re-checking the id.
    pub(crate) fn finish_suspend(&self, id: u64) {
        self.suspend_id.store(id + 1, Ordering::Release);
    }

    pub(crate) fn processor(&self) -> Option<Arc<Processor>> {
        self.proc.lock().clone()
    }

    pub(crate) fn set_processor(&self, proc: &Arc<Processor>) {
        *self.proc.lock() = Some(Arc::clone(proc));
    }

    pub(crate) fn take_failure(&self) -> Option<anyhow::Error> {
        self.failure.take()
    }

    /// Switch onto the task's stack. On return the task has either yielded
    /// (state `Runnable`, or `Blocked` when the suspend path ran) or
    /// finished, in which case a panic payload is captured as the failure.
    pub(crate) fn resume(&self) {
        // Safety: only the owning processor thread reaches the coroutine,
        // and never reentrantly; see the Send/Sync note above.
        let coro = unsafe { &mut *self.coro.get() };
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| coro.resume(())));
        context::clear_yielder();
        match outcome {
            Ok(CoroutineResult::Yield(())) => {}
            Ok(CoroutineResult::Return(())) => self.state.set(TaskState::Done),
            Err(payload) => {
                self.state.set(TaskState::Done);
                self.failure.set(Some(panic_to_error(self.id, payload)));
            }
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("state", &self.state.get())
            .field("suspend_id", &self.suspend_id.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

fn panic_to_error(id: u64, payload: Box<dyn Any + Send>) -> anyhow::Error {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        anyhow!("task {id} panicked: {msg}")
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        anyhow!("task {id} panicked: {msg}")
    } else {
        anyhow!("task {id} panicked")
    }
}

/// Single-shot wakeup capability returned by the suspend paths.
///
/// The weak reference lets tokens outlive their task: a timer or user thread
/// holding one after the task completed gets `false` from `wake` instead of a
/// dangling pointer. The id pins the token to one suspend epoch.
#[derive(Clone)]
pub struct SuspendToken {
    pub(crate) task: Weak<Task>,
    pub(crate) id: u64,
}

impl fmt::Debug for SuspendToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("SuspendToken");
        match self.task.upgrade() {
            Some(task) => s.field("task", &task.id()),
            None => s.field("task", &"<gone>"),
        };
        s.field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::assert_impl_all;
    use std::sync::atomic::AtomicUsize;

    assert_impl_all!(Task: Send, Sync);
    assert_impl_all!(SuspendToken: Send, Sync, Clone);

    const TEST_STACK: usize = 64 * 1024;

    #[test]
    fn resume_runs_the_body_to_completion() {
        let hits = Arc::new(AtomicUsize::new(0));
        let task = {
            let hits = hits.clone();
            Task::new(1, TEST_STACK, move || {
                hits.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap()
        };

        assert_eq!(task.state(), TaskState::Runnable);
        task.resume();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(task.state(), TaskState::Done);
        assert!(task.take_failure().is_none());
    }

    #[test]
    fn yielding_leaves_the_state_runnable() {
        let task = Task::new(1, TEST_STACK, || {
            crate::yield_now();
        })
        .unwrap();

        task.resume();
        assert_eq!(task.state(), TaskState::Runnable);
        task.resume();
        assert_eq!(task.state(), TaskState::Done);
    }

    #[test]
    fn panic_is_captured_as_a_failure() {
        let task = Task::new(9, TEST_STACK, || panic!("boom")).unwrap();
        task.resume();
        assert_eq!(task.state(), TaskState::Done);

        let failure = task.take_failure().expect("panic captured");
        let msg = format!("{failure}");
        assert!(msg.contains("task 9"), "unexpected message: {msg}");
        assert!(msg.contains("boom"), "unexpected message: {msg}");
    }

    #[test]
    fn suspend_epochs_are_monotonic_and_single_shot() {
        let task = Task::new(1, TEST_STACK, || {}).unwrap();
        assert_eq!(task.suspend_seq(), 0);

        let first = task.begin_suspend();
        assert_eq!(first, 1);
        assert_eq!(task.suspend_seq(), 1);

        task.finish_suspend(first);
        assert_eq!(task.suspend_seq(), 2);

        let second = task.begin_suspend();
        assert!(second > first);
    }
}
