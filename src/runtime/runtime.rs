use crate::runtime::scheduler::{Handle, Scheduler};
use anyhow::{Result, anyhow};
use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Default coroutine stack size. Large enough for unremarkable bodies; tune
/// per workload with [`Builder::coroutine_stack_size`].
const DEFAULT_STACK_SIZE: usize = 1 << 20;

/// Floor below which corosensei stacks stop being useful.
const MIN_STACK_SIZE: usize = 16 * 1024;

/// How long a processor may sit inside one task before the watchdog calls it
/// blocking.
const DEFAULT_CYCLE_TIMEOUT: Duration = Duration::from_millis(100);

/// Cadence of the dispatcher's mark + rebalance pass.
const DEFAULT_DISPATCH_INTERVAL: Duration = Duration::from_millis(1);

/// Names the runtime's threads. Receives the thread's role ("0".."N" for
/// workers, "disp", "timer") and returns the full name.
#[derive(Clone)]
pub(crate) struct ThreadNameFn(Arc<dyn Fn(&str) -> String + Send + Sync + 'static>);

impl ThreadNameFn {
    fn with_prefix(prefix: String) -> Self {
        Self(Arc::new(move |role| format!("{prefix}-{role}")))
    }

    pub(crate) fn name(&self, role: &str) -> String {
        (self.0)(role)
    }
}

impl Default for ThreadNameFn {
    fn default() -> Self {
        Self::with_prefix("weft".into())
    }
}

impl fmt::Debug for ThreadNameFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The closure itself isn't printable.
        f.debug_tuple("ThreadNameFn").field(&"<function>").finish()
    }
}

#[derive(Debug)]
pub struct Builder {
    /// Number of processors (one OS thread each). Defaults to one per core.
    worker_threads: Option<usize>,

    coroutine_stack_size: usize,

    cycle_timeout: Duration,

    dispatch_interval: Duration,

    /// Name fn for threads spawned by the runtime.
    thread_name: ThreadNameFn,
}

impl Builder {
    pub fn new() -> Self {
        Self {
            worker_threads: None,
            coroutine_stack_size: DEFAULT_STACK_SIZE,
            cycle_timeout: DEFAULT_CYCLE_TIMEOUT,
            dispatch_interval: DEFAULT_DISPATCH_INTERVAL,
            thread_name: ThreadNameFn::default(),
        }
    }

    #[track_caller]
    pub fn worker_threads(mut self, val: usize) -> Self {
        assert!(val > 0, "worker threads cannot be set to 0");
        self.worker_threads = Some(val);
        self
    }

    /// Stack size (in bytes) for every task coroutine.
    pub fn coroutine_stack_size(mut self, val: usize) -> Self {
        self.coroutine_stack_size = val;
        self
    }

    /// How long a processor may run a single task before the dispatcher
    /// treats it as blocking and reassigns its queued work.
    pub fn cycle_timeout(mut self, val: Duration) -> Self {
        self.cycle_timeout = val;
        self
    }

    /// Cadence of the watchdog / load-balance pass.
    pub fn dispatch_interval(mut self, val: Duration) -> Self {
        self.dispatch_interval = val;
        self
    }

    /// Sets the name prefix for threads spawned by the runtime.
    ///
    /// The default prefix is "weft", yielding "weft-0".."weft-N" for the
    /// workers plus "weft-disp" and "weft-timer".
    pub fn thread_name(mut self, val: impl Into<String>) -> Self {
        self.thread_name = ThreadNameFn::with_prefix(val.into());
        self
    }

    /// Sets a function used to name the runtime's threads from their role
    /// ("0".."N" for workers, "disp", "timer").
    pub fn thread_name_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(&str) -> String + Send + Sync + 'static,
    {
        self.thread_name = ThreadNameFn(Arc::new(f));
        self
    }

    /// Creates the configured [`Runtime`]. The runtime is inert until
    /// [`Runtime::start`] is called; tasks spawned before that simply wait
    /// in the processors' inboxes.
    pub fn try_build(self) -> Result<Runtime> {
        let cfg: RuntimeConfig = self.try_into()?;
        Ok(Runtime {
            scheduler: Scheduler::new(cfg).into_handle(),
        })
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder, validated and frozen, as consumed by the scheduler and its
/// processors.
#[derive(Debug, Clone)]
pub(crate) struct RuntimeConfig {
    pub(crate) worker_threads: usize,
    pub(crate) coroutine_stack_size: usize,
    pub(crate) cycle_timeout: Duration,
    pub(crate) dispatch_interval: Duration,
    pub(crate) thread_name: ThreadNameFn,
}

impl RuntimeConfig {
    fn validate(&self) -> Result<()> {
        if self.coroutine_stack_size < MIN_STACK_SIZE {
            return Err(anyhow!(
                "coroutine_stack_size must be at least {MIN_STACK_SIZE} bytes"
            ));
        }
        if self.cycle_timeout.is_zero() {
            return Err(anyhow!("cycle_timeout must be non-zero"));
        }
        if self.dispatch_interval.is_zero() {
            return Err(anyhow!("dispatch_interval must be non-zero"));
        }
        Ok(())
    }
}

impl TryFrom<Builder> for RuntimeConfig {
    type Error = anyhow::Error;

    fn try_from(builder: Builder) -> Result<Self, Self::Error> {
        let worker_threads = match builder.worker_threads {
            Some(n) => n,
            None => thread::available_parallelism()?.get(),
        };

        let cfg = RuntimeConfig {
            worker_threads,
            coroutine_stack_size: builder.coroutine_stack_size,
            cycle_timeout: builder.cycle_timeout,
            dispatch_interval: builder.dispatch_interval,
            thread_name: builder.thread_name,
        };

        cfg.validate()?;

        Ok(cfg)
    }
}

/// An M:N stackful-coroutine runtime: N processors, each pinned to its own
/// OS thread, sharing work through task injection and stealing.
#[derive(Debug)]
pub struct Runtime {
    scheduler: Handle,
}

impl Runtime {
    /// Spawn the worker, timer and dispatcher threads. Idempotent.
    pub fn start(&self) {
        self.scheduler.start();
    }

    /// Spawn a task onto the runtime. Fire-and-forget: there is no join
    /// handle; completion is communicated however the body chooses.
    pub fn spawn<F>(&self, body: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.scheduler.spawn(body)
    }

    /// Stop the runtime and join its threads. Queued tasks are dropped, not
    /// drained. Idempotent; must not be called from inside a task.
    pub fn shutdown(&self) -> Result<()> {
        self.scheduler.shutdown()
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        let _ = self.scheduler.shutdown();
    }
}

// Test-only access to the internals.
#[cfg(test)]
impl Runtime {
    pub(crate) fn scheduler(&self) -> &Handle {
        &self.scheduler
    }
}
