//! Architecture-specific context switching
//!
//! Each architecture module provides a callee-saved register `Context`,
//! `init_context` to aim a fresh context at an entry function, and the
//! symmetric `context_switch`.

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        pub mod x86_64;
        pub use x86_64::{Context, context_switch, init_context};
    } else if #[cfg(target_arch = "aarch64")] {
        pub mod aarch64;
        pub use aarch64::{Context, context_switch, init_context};
    } else {
        compile_error!("weft-runtime supports x86_64 and aarch64 only");
    }
}
