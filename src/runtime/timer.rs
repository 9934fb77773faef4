use crate::runtime::processor::Processor;
use crate::task::SuspendToken;
use crate::utils::thread::set_current_thread_name;
use parking_lot::{Condvar, Mutex};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::trace;

/// Deferred-wakeup collaborator: a deadline heap serviced by one thread.
///
/// Entries cannot be cancelled. A fired entry whose token went stale is a
/// no-op, because the suspend-id acts as the cancellation epoch.
pub(crate) struct Timer {
    inner: Mutex<TimerInner>,
    tick: Condvar,
}

struct TimerInner {
    heap: BinaryHeap<TimerEntry>,
    /// Orders entries with equal deadlines by arrival.
    seq: u64,
    closed: bool,
}

struct TimerEntry {
    deadline: Instant,
    seq: u64,
    token: SuspendToken,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    // Reversed so the BinaryHeap pops the earliest deadline first.
    fn cmp(&self, other: &Self) -> Ordering {
        (other.deadline, other.seq).cmp(&(self.deadline, self.seq))
    }
}

impl Timer {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(TimerInner {
                heap: BinaryHeap::new(),
                seq: 0,
                closed: false,
            }),
            tick: Condvar::new(),
        }
    }

    pub(crate) fn schedule_after(&self, timeout: Duration, token: SuspendToken) {
        self.schedule_at(Instant::now() + timeout, token);
    }

    pub(crate) fn schedule_at(&self, deadline: Instant, token: SuspendToken) {
        let mut inner = self.inner.lock();
        if inner.closed {
            return;
        }
        let seq = inner.seq;
        inner.seq += 1;
        inner.heap.push(TimerEntry {
            deadline,
            seq,
            token,
        });
        self.tick.notify_one();
    }

    pub(crate) fn shutdown(&self) {
        self.inner.lock().closed = true;
        self.tick.notify_all();
    }

    pub(crate) fn start(self: Arc<Self>, name: String) -> thread::JoinHandle<()> {
        thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                set_current_thread_name(&name);
                self.run();
            })
            .expect("failed to spawn timer thread")
    }

    fn run(&self) {
        let mut due = Vec::new();
        loop {
            let mut inner = self.inner.lock();
            if inner.closed {
                return;
            }

            let now = Instant::now();
            while inner.heap.peek().is_some_and(|e| e.deadline <= now) {
                due.push(inner.heap.pop().expect("peeked entry pops"));
            }

            if due.is_empty() {
                match inner.heap.peek().map(|e| e.deadline) {
                    Some(deadline) => {
                        self.tick.wait_until(&mut inner, deadline);
                    }
                    None => self.tick.wait(&mut inner),
                }
                continue;
            }
            drop(inner);

            // Fire outside the lock; `false` just means the task beat the
            // timer to its wakeup.
            for entry in due.drain(..) {
                if !Processor::wakeup(&entry.token) {
                    trace!("timer fired on a stale suspend token");
                }
            }
        }
    }
}
