use crate::runtime::processor::Processor;
use crate::runtime::scheduler::Handle;
use corosensei::Yielder;
use std::cell::{Cell, RefCell};
use std::ptr::NonNull;
use std::sync::Arc;

/// Pointer to the yielder of the coroutine currently executing on this
/// thread. Only valid while that coroutine is running; the swap-in wrapper
/// clears it on every return.
type RawYielder = NonNull<Yielder<(), ()>>;

struct Worker {
    processor: Arc<Processor>,
    scheduler: Handle,
}

thread_local! {
    static WORKER: RefCell<Option<Worker>> = const { RefCell::new(None) };
    static YIELDER: Cell<Option<RawYielder>> = const { Cell::new(None) };
}

/// Bind this thread to a processor. Called once at worker-thread startup.
pub(crate) fn init_worker(processor: Arc<Processor>, scheduler: Handle) {
    WORKER.with(|slot| {
        let prev = slot.borrow_mut().replace(Worker {
            processor,
            scheduler,
        });
        debug_assert!(prev.is_none(), "worker context initialized twice");
    });
}

pub(crate) fn current_processor() -> Option<Arc<Processor>> {
    WORKER.with(|slot| slot.borrow().as_ref().map(|w| Arc::clone(&w.processor)))
}

pub(crate) fn current_scheduler() -> Option<Handle> {
    WORKER.with(|slot| slot.borrow().as_ref().map(|w| w.scheduler.clone()))
}

pub(crate) fn set_yielder(yielder: RawYielder) {
    YIELDER.with(|slot| slot.set(Some(yielder)));
}

pub(crate) fn take_yielder() -> Option<RawYielder> {
    YIELDER.with(|slot| slot.take())
}

pub(crate) fn clear_yielder() {
    YIELDER.with(|slot| slot.set(None));
}
