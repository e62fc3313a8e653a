//! The stackful coroutine primitive
//!
//! A `Fiber` owns a guard-paged stack and a saved register context, and is
//! driven by explicit `resume`/`yield_now`. Ownership is shared through
//! `Arc<Fiber>`; the thread-local `CURRENT` pointer is non-owning and
//! always derives from a live handle.
//!
//! Per-thread there are three roles (see `tls`): the thread-root fiber
//! (the OS thread's native stack, lazily created), the scheduling fiber
//! (defaults to the root) and whatever fiber is currently executing. A
//! fiber built with `run_in_scheduler` yields to the scheduling fiber,
//! otherwise to the thread root.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use weft_core::{wdebug, FiberId, FiberState, SchedResult};

use crate::arch;
use crate::config::config;
use crate::stack::FiberStack;
use crate::tls;

/// A fiber body: run once to completion
pub type FiberFn = Box<dyn FnOnce() + Send + 'static>;

/// Number of fibers currently alive (thread roots included)
static LIVE_FIBERS: AtomicU64 = AtomicU64::new(0);

/// A stackful coroutine
pub struct Fiber {
    id: FiberId,
    state: AtomicU8,
    /// Yield to the scheduling fiber instead of the thread root
    run_in_scheduler: bool,
    /// None for thread-root fibers, which run on the OS stack
    stack: Option<FiberStack>,
    ctx: UnsafeCell<arch::Context>,
    cb: UnsafeCell<Option<FiberFn>>,
}

// Safety: a fiber is RUNNING on at most one thread at any instant; `ctx`
// is only touched inside `resume`/`yield_now` on the threads at either
// end of the switch, and `cb` only by the executing thread (trampoline)
// or while the fiber is READY/TERM and exclusively held (new/reset).
// Cross-thread hand-off happens through the scheduler's task-queue mutex.
unsafe impl Send for Fiber {}
unsafe impl Sync for Fiber {}

impl Fiber {
    /// Create a child fiber in READY state
    ///
    /// `stack_size == 0` selects the configured default. The closure runs
    /// on the first `resume`; when it returns the fiber transitions to
    /// TERM and yields a final time.
    pub fn new(cb: FiberFn, stack_size: usize, run_in_scheduler: bool) -> SchedResult<Arc<Fiber>> {
        let size = if stack_size == 0 {
            config().default_stack_size
        } else {
            stack_size
        };
        let stack = FiberStack::allocate(size)?;

        let fiber = Arc::new(Fiber {
            id: FiberId::next(),
            state: AtomicU8::new(FiberState::Ready as u8),
            run_in_scheduler,
            stack: Some(stack),
            ctx: UnsafeCell::new(arch::Context::zeroed()),
            cb: UnsafeCell::new(Some(cb)),
        });

        unsafe {
            arch::init_context(
                fiber.ctx.get(),
                fiber.stack.as_ref().unwrap().top(),
                fiber_main as usize,
            );
        }

        LIVE_FIBERS.fetch_add(1, Ordering::Relaxed);
        wdebug!("fiber {}: created", fiber.id);
        Ok(fiber)
    }

    /// Thread-root fiber: represents the OS thread's own stack
    fn root() -> Fiber {
        LIVE_FIBERS.fetch_add(1, Ordering::Relaxed);
        let id = FiberId::next();
        wdebug!("fiber {}: thread root created", id);
        Fiber {
            id,
            state: AtomicU8::new(FiberState::Running as u8),
            run_in_scheduler: false,
            stack: None,
            ctx: UnsafeCell::new(arch::Context::zeroed()),
            cb: UnsafeCell::new(None),
        }
    }

    #[inline]
    pub fn id(&self) -> FiberId {
        self.id
    }

    #[inline]
    pub fn state(&self) -> FiberState {
        FiberState::from(self.state.load(Ordering::Acquire))
    }

    #[inline]
    fn set_state(&self, s: FiberState) {
        self.state.store(s as u8, Ordering::Release);
    }

    /// Switch from the current context into this fiber
    ///
    /// The fiber must be READY. Control comes back here when the fiber
    /// yields or terminates.
    pub fn resume(self: &Arc<Self>) {
        assert_eq!(
            self.state(),
            FiberState::Ready,
            "resume on fiber {} in state {}",
            self.id,
            self.state()
        );

        // A first resume from a bare thread needs the root fiber in place.
        if tls::thread_root().is_null() {
            Fiber::current();
        }

        let from = if self.run_in_scheduler {
            tls::scheduler_fiber()
        } else {
            tls::thread_root()
        };
        debug_assert!(!from.is_null());
        debug_assert!(!std::ptr::eq(from, Arc::as_ptr(self)), "fiber resumed itself");

        self.set_state(FiberState::Running);
        tls::set_current(Arc::as_ptr(self));
        unsafe {
            arch::context_switch((*from).ctx.get(), self.ctx.get());
        }
    }

    /// Yield back to this thread's scheduling fiber (or thread root)
    ///
    /// Must be called on the fiber that is currently executing. A RUNNING
    /// fiber goes back to READY; a TERM fiber performs its terminal yield.
    pub fn yield_now(&self) {
        let st = self.state();
        assert!(
            st == FiberState::Running || st == FiberState::Term,
            "yield on fiber {} in state {}",
            self.id,
            st
        );
        if st != FiberState::Term {
            self.set_state(FiberState::Ready);
        }

        let to = if self.run_in_scheduler {
            tls::scheduler_fiber()
        } else {
            tls::thread_root()
        };
        debug_assert!(!to.is_null());
        debug_assert!(!std::ptr::eq(to, self as *const _), "fiber yielded to itself");

        tls::set_current(to);
        unsafe {
            arch::context_switch(self.ctx.get(), (*to).ctx.get());
        }
    }

    /// Rearm a TERM fiber with a new closure, reusing its stack
    pub fn reset(&self, cb: FiberFn) {
        assert!(
            self.state().is_term(),
            "reset on fiber {} in state {}",
            self.id,
            self.state()
        );
        let stack = self.stack.as_ref().expect("reset on a stackless fiber");
        unsafe {
            *self.cb.get() = Some(cb);
            arch::init_context(self.ctx.get(), stack.top(), fiber_main as usize);
        }
        self.set_state(FiberState::Ready);
    }

    /// Owning handle to the fiber executing on this thread
    ///
    /// On a thread with no fiber context yet, lazily constructs the
    /// thread-root fiber (RUNNING, no stack of its own) and installs it
    /// as both the root and the default scheduling fiber.
    pub fn current() -> Arc<Fiber> {
        let ptr = tls::current();
        if ptr.is_null() {
            let root = Arc::new(Fiber::root());
            tls::install_thread_root(root.clone());
            return root;
        }
        // Safety: CURRENT always derives from a live Arc<Fiber>.
        unsafe {
            Arc::increment_strong_count(ptr);
            Arc::from_raw(ptr)
        }
    }

    /// Id of the executing fiber, or `FiberId::NONE` outside any fiber
    pub fn current_id() -> FiberId {
        let ptr = tls::current();
        if ptr.is_null() {
            FiberId::NONE
        } else {
            unsafe { (*ptr).id }
        }
    }

    /// True when this thread is inside a fiber context
    pub fn in_fiber() -> bool {
        !tls::current().is_null()
    }

    /// Yield whatever fiber is currently executing on this thread
    pub fn yield_current() {
        let ptr = tls::current();
        assert!(!ptr.is_null(), "yield_current outside any fiber");
        unsafe { (*ptr).yield_now() }
    }

    /// Override this thread's scheduling fiber
    ///
    /// The pointer is non-owning; the caller keeps `f` alive for as long
    /// as fibers on this thread may yield into it.
    pub fn set_scheduler_fiber(f: &Arc<Fiber>) {
        tls::set_scheduler_fiber(Arc::as_ptr(f));
    }

    /// Number of live fibers in the process
    pub fn live_count() -> u64 {
        LIVE_FIBERS.load(Ordering::Relaxed)
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        LIVE_FIBERS.fetch_sub(1, Ordering::Relaxed);
        wdebug!("fiber {}: destroyed", self.id);
    }
}

/// Trampoline target: runs the closure, marks TERM, yields a final time
///
/// The owning handle is dropped before the terminal yield so nothing on
/// this stack owns the fiber when the stack is abandoned; the scheduler
/// (or whoever resumed us) still holds its own handle.
extern "C" fn fiber_main() {
    let curr = Fiber::current();
    let cb = unsafe { (*curr.cb.get()).take() };
    if let Some(cb) = cb {
        cb();
    }
    curr.set_state(FiberState::Term);

    let raw = Arc::as_ptr(&curr);
    drop(curr);
    unsafe { (*raw).yield_now() };
    unreachable!("TERM fiber resumed without reset");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_resume_yield_term() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let l = log.clone();
        let fiber = Fiber::new(
            Box::new(move || {
                l.lock().unwrap().push(1);
                Fiber::yield_current();
                l.lock().unwrap().push(2);
            }),
            0,
            false,
        )
        .unwrap();

        assert_eq!(fiber.state(), FiberState::Ready);
        fiber.resume();
        assert_eq!(fiber.state(), FiberState::Ready);
        assert_eq!(*log.lock().unwrap(), vec![1]);

        fiber.resume();
        assert_eq!(fiber.state(), FiberState::Term);
        assert_eq!(*log.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn test_reset_runs_again_once() {
        let counter = Arc::new(Mutex::new(0));
        let c = counter.clone();
        let fiber = Fiber::new(
            Box::new(move || {
                *c.lock().unwrap() += 1;
            }),
            16 * 1024,
            false,
        )
        .unwrap();

        fiber.resume();
        assert_eq!(fiber.state(), FiberState::Term);
        assert_eq!(*counter.lock().unwrap(), 1);

        let c = counter.clone();
        fiber.reset(Box::new(move || {
            *c.lock().unwrap() += 10;
        }));
        assert_eq!(fiber.state(), FiberState::Ready);
        fiber.resume();
        assert_eq!(fiber.state(), FiberState::Term);
        assert_eq!(*counter.lock().unwrap(), 11);
    }

    #[test]
    fn test_current_id_inside_and_outside() {
        // Touching current() installs the root for this test thread.
        let root = Fiber::current();
        assert_eq!(Fiber::current_id(), root.id());
        assert_eq!(root.state(), FiberState::Running);

        let seen = Arc::new(Mutex::new(FiberId::NONE));
        let s = seen.clone();
        let fiber = Fiber::new(
            Box::new(move || {
                *s.lock().unwrap() = Fiber::current_id();
            }),
            0,
            false,
        )
        .unwrap();
        let expect = fiber.id();
        fiber.resume();
        assert_eq!(*seen.lock().unwrap(), expect);

        // Back on the root
        assert_eq!(Fiber::current_id(), root.id());
    }

    #[test]
    fn test_nested_fibers() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let l1 = log.clone();
        let l2 = log.clone();

        let inner = Fiber::new(
            Box::new(move || {
                l2.lock().unwrap().push("inner");
            }),
            0,
            false,
        )
        .unwrap();

        let outer = Fiber::new(
            Box::new(move || {
                l1.lock().unwrap().push("outer-pre");
                Fiber::yield_current();
                l1.lock().unwrap().push("outer-post");
            }),
            0,
            false,
        )
        .unwrap();

        // Interleave two independent fibers from the thread root

        outer.resume();
        inner.resume();
        outer.resume();
        assert_eq!(
            *log.lock().unwrap(),
            vec!["outer-pre", "inner", "outer-post"]
        );
        assert_eq!(inner.state(), FiberState::Term);
        assert_eq!(outer.state(), FiberState::Term);
    }
}
