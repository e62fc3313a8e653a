//! Thread-local fiber pointers
//!
//! Every OS thread that touches fibers carries three pointers:
//!
//! - `CURRENT` - the fiber whose stack is executing right now (non-owning)
//! - `THREAD_ROOT` - the fiber standing for the thread's native stack (owning)
//! - `SCHEDULER_FIBER` - the yield target for `run_in_scheduler` fibers
//!   (non-owning; defaults to the thread root)
//!
//! The non-owning pointers always derive from a live `Arc<Fiber>`: the
//! thread root is kept here, child fibers are kept alive by whoever
//! resumes them.

use std::cell::{Cell, RefCell};
use std::sync::Arc;

use crate::fiber::Fiber;

thread_local! {
    static CURRENT: Cell<*const Fiber> = const { Cell::new(std::ptr::null()) };
    static THREAD_ROOT: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };
    static SCHEDULER_FIBER: Cell<*const Fiber> = const { Cell::new(std::ptr::null()) };
}

/// The fiber currently executing on this thread (null before the first
/// `Fiber::current()`)
#[inline]
pub(crate) fn current() -> *const Fiber {
    CURRENT.with(|c| c.get())
}

#[inline]
pub(crate) fn set_current(f: *const Fiber) {
    CURRENT.with(|c| c.set(f));
}

/// This thread's root fiber, as a raw pointer (null until installed)
#[inline]
pub(crate) fn thread_root() -> *const Fiber {
    THREAD_ROOT.with(|r| {
        r.borrow()
            .as_ref()
            .map(Arc::as_ptr)
            .unwrap_or(std::ptr::null())
    })
}

/// The scheduling fiber every `run_in_scheduler` yield returns to
#[inline]
pub(crate) fn scheduler_fiber() -> *const Fiber {
    SCHEDULER_FIBER.with(|c| c.get())
}

#[inline]
pub(crate) fn set_scheduler_fiber(f: *const Fiber) {
    SCHEDULER_FIBER.with(|c| c.set(f));
}

/// Install `root` as this thread's root fiber
///
/// Also makes it the current fiber and the default scheduling fiber.
pub(crate) fn install_thread_root(root: Arc<Fiber>) {
    let ptr = Arc::as_ptr(&root);
    THREAD_ROOT.with(|r| *r.borrow_mut() = Some(root));
    CURRENT.with(|c| c.set(ptr));
    SCHEDULER_FIBER.with(|c| c.set(ptr));
}
