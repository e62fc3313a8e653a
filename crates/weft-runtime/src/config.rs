//! Runtime configuration
//!
//! Defaults with environment overrides, read once per process.

use std::sync::OnceLock;

use weft_core::constants::DEFAULT_STACK_SIZE;
use weft_core::env::env_get;
use weft_core::{SchedError, SchedResult};

/// Tunables for the runtime
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Stack size used when `Fiber::new` is passed 0 (`WEFT_STACK_SIZE`)
    pub default_stack_size: usize,

    /// Cap on the idle fiber's epoll timeout (`WEFT_EPOLL_TIMEOUT_MS`)
    ///
    /// Bounds wakeup latency when the wall clock misbehaves.
    pub max_epoll_timeout_ms: u64,

    /// epoll_wait buffer capacity (`WEFT_EPOLL_EVENTS`)
    pub epoll_event_capacity: usize,

    /// Initial FdContext table size (`WEFT_FD_SLOTS`)
    pub initial_fd_slots: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            default_stack_size: DEFAULT_STACK_SIZE,
            max_epoll_timeout_ms: 5000,
            epoll_event_capacity: 256,
            initial_fd_slots: 32,
        }
    }
}

impl RuntimeConfig {
    /// Build from defaults plus environment overrides
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            default_stack_size: env_get("WEFT_STACK_SIZE", d.default_stack_size),
            max_epoll_timeout_ms: env_get("WEFT_EPOLL_TIMEOUT_MS", d.max_epoll_timeout_ms),
            epoll_event_capacity: env_get("WEFT_EPOLL_EVENTS", d.epoll_event_capacity),
            initial_fd_slots: env_get("WEFT_FD_SLOTS", d.initial_fd_slots),
        }
    }

    /// Sanity-check the configuration
    pub fn validate(&self) -> SchedResult<()> {
        if self.default_stack_size < 4096 {
            return Err(SchedError::InvalidConfig("stack size below one page"));
        }
        if self.epoll_event_capacity == 0 {
            return Err(SchedError::InvalidConfig("epoll event capacity is zero"));
        }
        if self.initial_fd_slots == 0 {
            return Err(SchedError::InvalidConfig("fd slot count is zero"));
        }
        Ok(())
    }
}

static CONFIG: OnceLock<RuntimeConfig> = OnceLock::new();

/// The process-wide runtime configuration
pub fn config() -> &'static RuntimeConfig {
    CONFIG.get_or_init(|| {
        let cfg = RuntimeConfig::from_env();
        cfg.validate().expect("invalid weft runtime configuration");
        cfg
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(RuntimeConfig::default().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_tiny_stack() {
        let cfg = RuntimeConfig {
            default_stack_size: 16,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }
}
