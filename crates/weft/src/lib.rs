//! # weft - stackful fibers over a small thread pool
//!
//! Many logically blocking tasks, multiplexed onto a few OS threads.
//! Fibers suspend on timers or fd readiness and resume when the reactor
//! observes their precondition.
//!
//! ## Quick start
//!
//! ```ignore
//! use weft::{Event, Fiber, IoManager};
//!
//! fn main() {
//!     let io = IoManager::new(2, false, "main").unwrap();
//!
//!     io.schedule(|| {
//!         println!("hello from a fiber");
//!         weft::sleep_ms(50);
//!         println!("... and again, 50ms later");
//!     })
//!     .unwrap();
//!
//!     io.schedule(move || {
//!         // register interest, park, resume on readiness
//!         let io = IoManager::current().unwrap();
//!         // io.add_event(fd, Event::READ, None).unwrap();
//!         // weft::yield_now();
//!         // ... read(fd) now succeeds
//!     })
//!     .unwrap();
//!
//!     io.stop();
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//!   schedule() / add_timer() / add_event()
//!                  |
//!                  v
//!   +---------------------------------------+
//!   | Scheduler: FIFO task queue, N workers |
//!   +---------------------------------------+
//!        |                |
//!        v                v
//!   task fibers      idle fiber per worker
//!   (resume/yield)   (epoll_wait + timer heap + self-pipe)
//! ```

pub use weft_core::error::{SchedError, SchedResult};
pub use weft_core::id::FiberId;
pub use weft_core::state::FiberState;
pub use weft_core::wlog::{self, LogLevel};
pub use weft_core::{wdebug, werror, winfo, wprintln, wtrace, wwarn};

pub use weft_runtime::fiber::{Fiber, FiberFn};
pub use weft_runtime::iomanager::{Event, IoManager};
pub use weft_runtime::scheduler::{Schedule, ScheduleTask, Scheduler};
pub use weft_runtime::thread::Thread;
pub use weft_runtime::timer::{Timer, TimerManager};
pub use weft_runtime::{config, RuntimeConfig};

use std::sync::Arc;

/// Yield the current fiber; outside a fiber, yield the OS thread
pub fn yield_now() {
    if Fiber::in_fiber() {
        Fiber::yield_current();
    } else {
        std::thread::yield_now();
    }
}

/// Park the calling fiber for `ms` milliseconds
///
/// Inside a reactor-driven fiber this suspends without holding a worker:
/// a one-shot timer re-schedules the fiber and the fiber yields. On a
/// plain thread it degrades to an OS sleep.
pub fn sleep_ms(ms: u64) {
    let Some(io) = IoManager::current() else {
        std::thread::sleep(std::time::Duration::from_millis(ms));
        return;
    };

    let me = Fiber::current();
    debug_assert_eq!(me.state(), FiberState::Running);

    let weak = Arc::downgrade(&io);
    let target = me.clone();
    io.add_timer(
        ms,
        move || {
            if let Some(io) = weak.upgrade() {
                let _ = io.schedule_fiber(target.clone(), weft_core::constants::ANY_THREAD);
            }
        },
        false,
    );
    me.yield_now();
}
