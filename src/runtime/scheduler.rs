use crate::context;
use crate::runtime::RuntimeConfig;
use crate::runtime::processor::Processor;
use crate::runtime::timer::Timer;
use crate::task::{Task, TaskList};
use crate::utils::thread::set_current_thread_name;
use anyhow::{Result, anyhow};
use parking_lot::Mutex;
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, OnceLock};
use std::thread;
use tracing::{debug, error, warn};

/// Owner of the processors: distributes new tasks, runs one worker thread
/// per processor plus the dispatcher (watchdog + rebalance) and the timer.
pub(crate) struct Scheduler {
    pub(crate) cfg: RuntimeConfig,

    /// Shared stop flag handed to every processor.
    pub(crate) stop: Arc<AtomicBool>,

    /// Ensures the shutdown sequence runs once.
    shutdown_guard: AtomicBool,

    pub(crate) processors: Vec<Arc<Processor>>,

    timer: Arc<Timer>,

    next_task_id: AtomicU64,

    /// Round-robin cursor for spawns arriving from outside the runtime.
    dispatch_cursor: AtomicUsize,

    threads: Mutex<Vec<thread::JoinHandle<()>>>,

    started: OnceLock<()>,
}

impl Scheduler {
    pub(crate) fn new(cfg: RuntimeConfig) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let timer = Arc::new(Timer::new());
        let processors = (0..cfg.worker_threads)
            .map(|id| {
                Arc::new(Processor::new(
                    id,
                    Arc::clone(&stop),
                    Arc::clone(&timer),
                    cfg.cycle_timeout,
                ))
            })
            .collect();

        Self {
            cfg,
            stop,
            shutdown_guard: AtomicBool::new(false),
            processors,
            timer,
            next_task_id: AtomicU64::new(1),
            dispatch_cursor: AtomicUsize::new(0),
            threads: Mutex::new(Vec::new()),
            started: OnceLock::new(),
        }
    }

    pub(crate) fn into_handle(self) -> Handle {
        Handle(Arc::new(self))
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("workers", &self.processors.len())
            .field("stop", &self.stop.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Handle(Arc<Scheduler>);

impl Deref for Handle {
    type Target = Arc<Scheduler>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Handle {
    /// Spawn the worker, timer and dispatcher threads. Idempotent; returns
    /// once every worker has bound its thread-local context.
    pub(crate) fn start(&self) {
        self.started.get_or_init(|| {
            let barrier = Arc::new(Barrier::new(self.cfg.worker_threads + 1));
            {
                let mut threads = self.threads.lock();
                for proc in &self.processors {
                    threads.push(spawn_worker_thread(
                        self.clone(),
                        Arc::clone(proc),
                        Arc::clone(&barrier),
                    ));
                }
                threads.push(Arc::clone(&self.timer).start(self.cfg.thread_name.name("timer")));
                threads.push(spawn_dispatcher_thread(self.clone()));
            }
            barrier.wait();
            debug!(workers = self.cfg.worker_threads, "scheduler started");
        });
    }

    /// Create a task running `body` and hand it to a processor: the current
    /// one when called from a worker thread, round-robin otherwise.
    pub(crate) fn spawn<F>(&self, body: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.stop.load(Ordering::Acquire) {
            warn!("task spawned after shutdown; dropping it");
            return Err(anyhow!("runtime is shut down"));
        }
        let id = self.next_task_id.fetch_add(1, Ordering::Relaxed);
        let task = Task::new(id, self.cfg.coroutine_stack_size, body)?;
        self.processor_for_spawn().add(task);
        Ok(())
    }

    fn processor_for_spawn(&self) -> Arc<Processor> {
        if let Some(current) = context::current_processor() {
            return current;
        }
        let idx = self.dispatch_cursor.fetch_add(1, Ordering::Relaxed) % self.processors.len();
        Arc::clone(&self.processors[idx])
    }

    /// Stop everything and join the runtime threads. Idempotent. Remaining
    /// tasks are not drained; their references die with the processors.
    ///
    /// Must not be called from a worker thread (it joins them).
    pub(crate) fn shutdown(&self) -> Result<()> {
        if self.shutdown_guard.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        debug_assert!(
            context::current_processor().is_none(),
            "shutdown called from a worker thread"
        );

        debug!("scheduler shutting down");
        self.stop.store(true, Ordering::Release);
        self.timer.shutdown();
        for proc in &self.processors {
            proc.unpark_if_parked();
        }

        let mut threads = self.threads.lock();
        let panicked = threads
            .drain(..)
            .filter_map(|handle| handle.join().err())
            .count();
        if panicked == 0 {
            Ok(())
        } else {
            Err(anyhow!("{panicked} runtime thread(s) panicked"))
        }
    }

    /// Watchdog and load-balance pass, run by the dispatcher thread.
    fn rebalance(&self) {
        for proc in &self.processors {
            proc.mark();
        }

        // The blocking hint stays latched once a processor goes idle; only
        // treat it as stuck while a task actually occupies the run loop.
        let stuck = |p: &Arc<Processor>| p.is_blocking() && p.is_executing();

        // Pull everything off processors stuck inside one task; their thread
        // cannot service the queue anyway.
        let mut pool = TaskList::new();
        for proc in &self.processors {
            if stuck(proc) && proc.runnable_len() > 0 {
                pool.append(proc.steal(0));
            }
        }

        let mut starved: Vec<&Arc<Processor>> = self
            .processors
            .iter()
            .filter(|p| p.runnable_len() == 0 && !stuck(p))
            .collect();
        // Vary who gets refilled first between passes.
        fastrand::shuffle(&mut starved);

        if pool.is_empty() {
            // Hand each starved processor half of the busiest queue.
            for target in starved {
                let victim = self
                    .processors
                    .iter()
                    .filter(|p| !Arc::ptr_eq(p, target))
                    .max_by_key(|p| p.runnable_len());
                let Some(victim) = victim else { break };
                let surplus = victim.runnable_len() / 2;
                if surplus == 0 {
                    continue;
                }
                target.add_all(victim.steal(surplus));
            }
        } else {
            debug!(count = pool.len(), "redistributing work from blocking processors");
            if starved.is_empty() {
                // Everyone is busy; give the pool to the least loaded worker
                // that is still switching.
                let target = self
                    .processors
                    .iter()
                    .filter(|p| !stuck(p))
                    .min_by_key(|p| p.runnable_len())
                    .or_else(|| self.processors.first());
                if let Some(target) = target {
                    target.add_all(pool);
                }
            } else {
                let mut shares: Vec<TaskList> =
                    starved.iter().map(|_| TaskList::new()).collect();
                let mut i = 0;
                let n = shares.len();
                while let Some(task) = pool.pop_front() {
                    shares[i % n].push_back(task);
                    i += 1;
                }
                for (target, share) in starved.iter().zip(shares) {
                    target.add_all(share);
                }
            }
        }
    }
}

fn spawn_worker_thread(
    scheduler: Handle,
    proc: Arc<Processor>,
    barrier: Arc<Barrier>,
) -> thread::JoinHandle<()> {
    let name = scheduler.cfg.thread_name.name(&proc.id().to_string());
    thread::Builder::new()
        .name(name.clone())
        .spawn(move || {
            set_current_thread_name(&name);
            context::init_worker(Arc::clone(&proc), scheduler);
            barrier.wait();
            loop {
                match proc.process() {
                    Ok(()) => break,
                    // A task body failed. Policy: log it and put the
                    // processor back to work until the stop flag says
                    // otherwise.
                    Err(e) => {
                        error!(proc = proc.id(), error = %e, "task failure surfaced from the run loop")
                    }
                }
            }
        })
        .expect("failed to spawn worker thread")
}

fn spawn_dispatcher_thread(scheduler: Handle) -> thread::JoinHandle<()> {
    let name = scheduler.cfg.thread_name.name("disp");
    thread::Builder::new()
        .name(name.clone())
        .spawn(move || {
            set_current_thread_name(&name);
            while !scheduler.stop.load(Ordering::Acquire) {
                thread::sleep(scheduler.cfg.dispatch_interval);
                scheduler.rebalance();
            }
        })
        .expect("failed to spawn dispatcher thread")
}
