//! An M:N stackful-coroutine runtime.
//!
//! N processors, each pinned to one OS thread, cooperatively run tasks
//! (stackful coroutines) that can yield, suspend against a wakeup token and
//! migrate between processors through work stealing.
//!
//! ```no_run
//! let runtime = weft::Builder::new().worker_threads(4).try_build()?;
//! runtime.start();
//! runtime.spawn(|| {
//!     weft::sleep(std::time::Duration::from_millis(10));
//!     println!("hello from a coroutine");
//! })?;
//! runtime.shutdown()?;
//! # Ok::<(), anyhow::Error>(())
//! ```

use crate::runtime::processor::Processor;
use anyhow::Result;
use std::sync::Arc;
use std::time::{Duration, Instant};

mod context;

pub mod runtime;
pub use runtime::{Builder, Runtime};

mod task;
pub use task::SuspendToken;

mod utils;

/// Yield the current task back to its processor; it stays runnable and will
/// be resumed in queue order.
///
/// Also the second half of the suspend protocol: after [`suspend`] the task
/// keeps running until this is called, which is what lets the body publish
/// the token first.
///
/// # Panics
///
/// Panics when called outside of a running task.
#[track_caller]
pub fn yield_now() {
    let yielder = context::take_yielder()
        .expect("yield_now() called outside of a running task");
    // Safety: the pointer was published by the coroutine entry on this very
    // stack and stays valid until the body returns.
    unsafe { yielder.as_ref() }.suspend(());
    context::set_yielder(yielder);
}

/// Prepare the current task for suspension and return the single-shot wakeup
/// token. The task keeps executing until it calls [`yield_now`]; hand the
/// token to whoever will call [`wake`] before yielding.
///
/// # Panics
///
/// Panics when called outside of a running task.
#[track_caller]
pub fn suspend() -> SuspendToken {
    current_processor("suspend").suspend_current()
}

/// Like [`suspend`], with a deferred wakeup after `timeout`. An explicit
/// [`wake`] beforehand wins; the timer's attempt then returns `false`.
#[track_caller]
pub fn suspend_for(timeout: Duration) -> SuspendToken {
    current_processor("suspend_for").suspend_current_for(timeout)
}

/// Like [`suspend`], with a deferred wakeup at `deadline`.
#[track_caller]
pub fn suspend_until(deadline: Instant) -> SuspendToken {
    current_processor("suspend_until").suspend_current_until(deadline)
}

/// Put the current task to sleep for at least `timeout`.
#[track_caller]
pub fn sleep(timeout: Duration) {
    let _token = suspend_for(timeout);
    yield_now();
}

/// Resume a suspended task. Callable from any thread, including ones outside
/// the runtime. Returns `false` when the token was already consumed, the
/// suspension epoch has moved on or the task is gone.
pub fn wake(token: &SuspendToken) -> bool {
    Processor::wakeup(token)
}

/// Whether a token can no longer wake anything.
pub fn is_expired(token: &SuspendToken) -> bool {
    Processor::is_expired(token)
}

/// Id of the processor bound to this thread, when it is a runtime worker.
pub fn current_processor_id() -> Option<usize> {
    Processor::current().map(|p| p.id())
}

/// Id of the task currently running on this thread, if any.
pub fn current_task_id() -> Option<u64> {
    Processor::current()
        .and_then(|p| p.current_task())
        .map(|t| t.id())
}

/// Spawn a task from inside the runtime (the current processor picks it up
/// directly). From other threads, use [`Runtime::spawn`].
///
/// # Panics
///
/// Panics when called from a thread that is not a runtime worker.
#[track_caller]
pub fn spawn<F>(body: F) -> Result<()>
where
    F: FnOnce() + Send + 'static,
{
    let scheduler = context::current_scheduler()
        .expect("spawn() called off the runtime; use Runtime::spawn instead");
    scheduler.spawn(body)
}

#[track_caller]
fn current_processor(what: &str) -> Arc<Processor> {
    context::current_processor()
        .unwrap_or_else(|| panic!("{what}() called outside of a running task"))
}
