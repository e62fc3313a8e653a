//! # weft-runtime
//!
//! The OS- and architecture-specific half of the weft fiber runtime:
//!
//! - Context switching (hand-written assembly per architecture)
//! - Fiber stacks (mmap with guard pages)
//! - The `Fiber` coroutine primitive
//! - Worker threads, the cooperative `Scheduler` and its task queue
//! - `TimerManager` with rollover detection
//! - `IoManager`: the epoll-driven scheduler specialization

pub mod arch;
pub mod config;
pub mod fiber;
pub mod iomanager;
pub mod scheduler;
pub mod stack;
pub mod thread;
pub mod timer;
pub mod tls;

// Re-exports
pub use config::{config, RuntimeConfig};
pub use fiber::Fiber;
pub use iomanager::{Event, IoManager};
pub use scheduler::{Schedule, ScheduleTask, Scheduler, TaskFn};
pub use thread::Thread;
pub use timer::{Timer, TimerManager};

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        // epoll, pipe-based wakeup and gettid are Linux-only.
    } else {
        compile_error!("weft-runtime requires Linux (epoll)");
    }
}
