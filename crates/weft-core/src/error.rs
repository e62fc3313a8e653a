//! Error types for the weft runtime

use core::fmt;

/// Result type for scheduler and I/O manager operations
pub type SchedResult<T> = Result<T, SchedError>;

/// Errors surfaced by public runtime operations
///
/// Programmer errors (resume while RUNNING, reset while not TERM) are
/// asserts, not variants; these are the recoverable failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedError {
    /// Scheduler already started
    AlreadyStarted,

    /// Scheduler not started yet
    NotStarted,

    /// ScheduleTask carried neither a fiber nor a callable
    InvalidTask,

    /// Task pinned to a thread id no worker owns
    NoSuchThread(i32),

    /// (fd, direction) already armed
    DuplicateEvent,

    /// Fiber stack allocation failed
    StackAllocation,

    /// Rejected runtime configuration value
    InvalidConfig(&'static str),

    /// Kernel call failed
    Syscall {
        /// C name of the failing call
        call: &'static str,
        /// errno at the time of failure
        errno: i32,
    },

    /// OS thread spawn failed
    SpawnFailed,
}

impl SchedError {
    /// Build a `Syscall` variant from the current `errno`
    pub fn last_os(call: &'static str) -> Self {
        SchedError::Syscall {
            call,
            errno: std::io::Error::last_os_error().raw_os_error().unwrap_or(0),
        }
    }
}

impl fmt::Display for SchedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedError::AlreadyStarted => write!(f, "scheduler already started"),
            SchedError::NotStarted => write!(f, "scheduler not started"),
            SchedError::InvalidTask => write!(f, "task has neither fiber nor callable"),
            SchedError::NoSuchThread(tid) => {
                write!(f, "no worker thread with id {}", tid)
            }
            SchedError::DuplicateEvent => write!(f, "event already registered for fd"),
            SchedError::StackAllocation => write!(f, "fiber stack allocation failed"),
            SchedError::InvalidConfig(what) => write!(f, "invalid configuration: {}", what),
            SchedError::Syscall { call, errno } => {
                write!(f, "{} failed: errno {}", call, errno)
            }
            SchedError::SpawnFailed => write!(f, "failed to spawn worker thread"),
        }
    }
}

impl std::error::Error for SchedError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = SchedError::DuplicateEvent;
        assert_eq!(format!("{}", e), "event already registered for fd");

        let e = SchedError::Syscall { call: "epoll_ctl", errno: 22 };
        assert_eq!(format!("{}", e), "epoll_ctl failed: errno 22");

        let e = SchedError::NoSuchThread(77);
        assert_eq!(format!("{}", e), "no worker thread with id 77");
    }
}
