//! Runtime diagnostics
//!
//! A single severity gate in front of locked stderr writes. The gate is
//! read once from the environment and can be moved at runtime; records
//! below it cost one atomic load and no formatting.
//!
//! # Environment Variables
//!
//! - `WEFT_LOG_LEVEL` - `off|error|warn|info|debug|trace` (default `info`)
//! - `WEFT_LOG_FLUSH` - flush stderr after every record

use std::fmt;
use std::io::Write;
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::OnceLock;

use crate::env::{env_get_bool, env_get_opt};

/// Record severity; a record is emitted when its level is at or above
/// the configured gate
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl FromStr for LogLevel {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "off" | "none" => Ok(LogLevel::Off),
            "error" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            _ => Err(()),
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            LogLevel::Off => "OFF",
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
            LogLevel::Trace => "TRACE",
        };
        f.write_str(tag)
    }
}

struct LogGate {
    level: AtomicU8,
    flush: bool,
}

static GATE: OnceLock<LogGate> = OnceLock::new();

fn gate() -> &'static LogGate {
    GATE.get_or_init(|| LogGate {
        level: AtomicU8::new(
            env_get_opt::<LogLevel>("WEFT_LOG_LEVEL").unwrap_or(LogLevel::Info) as u8,
        ),
        flush: env_get_bool("WEFT_LOG_FLUSH", false),
    })
}

/// Would a record at `level` be emitted?
#[inline]
pub fn level_enabled(level: LogLevel) -> bool {
    level != LogLevel::Off && level as u8 <= gate().level.load(Ordering::Relaxed)
}

/// Move the severity gate
pub fn set_log_level(level: LogLevel) {
    gate().level.store(level as u8, Ordering::Relaxed);
}

/// Current severity gate
pub fn log_level() -> LogLevel {
    match gate().level.load(Ordering::Relaxed) {
        0 => LogLevel::Off,
        1 => LogLevel::Error,
        2 => LogLevel::Warn,
        3 => LogLevel::Info,
        4 => LogLevel::Debug,
        _ => LogLevel::Trace,
    }
}

/// Write one tagged record; the stderr lock keeps lines whole across
/// workers. Callers gate on `level_enabled` first so disabled records
/// never reach the formatter.
#[doc(hidden)]
pub fn emit(level: LogLevel, args: fmt::Arguments<'_>) {
    let g = gate();
    let stderr = std::io::stderr();
    let mut out = stderr.lock();
    let _ = writeln!(out, "[{}] {}", level, args);
    if g.flush {
        let _ = out.flush();
    }
}

/// Write one untagged line, same locking rules
#[doc(hidden)]
pub fn emit_raw(args: fmt::Arguments<'_>) {
    let g = gate();
    let stderr = std::io::stderr();
    let mut out = stderr.lock();
    let _ = writeln!(out, "{}", args);
    if g.flush {
        let _ = out.flush();
    }
}

/// Emit a record at an explicit level
///
/// The leveled shorthands below all expand to this.
#[macro_export]
macro_rules! wlog {
    ($level:expr, $($arg:tt)*) => {{
        let level = $level;
        if $crate::wlog::level_enabled(level) {
            $crate::wlog::emit(level, format_args!($($arg)*));
        }
    }};
}

/// Untagged line to stderr, unconditionally
#[macro_export]
macro_rules! wprintln {
    () => {{
        $crate::wlog::emit_raw(format_args!(""));
    }};
    ($($arg:tt)*) => {{
        $crate::wlog::emit_raw(format_args!($($arg)*));
    }};
}

/// Error level record
#[macro_export]
macro_rules! werror {
    ($($arg:tt)*) => { $crate::wlog!($crate::wlog::LogLevel::Error, $($arg)*) };
}

/// Warning level record
#[macro_export]
macro_rules! wwarn {
    ($($arg:tt)*) => { $crate::wlog!($crate::wlog::LogLevel::Warn, $($arg)*) };
}

/// Info level record
#[macro_export]
macro_rules! winfo {
    ($($arg:tt)*) => { $crate::wlog!($crate::wlog::LogLevel::Info, $($arg)*) };
}

/// Debug level record
#[macro_export]
macro_rules! wdebug {
    ($($arg:tt)*) => { $crate::wlog!($crate::wlog::LogLevel::Debug, $($arg)*) };
}

/// Trace level record
#[macro_export]
macro_rules! wtrace {
    ($($arg:tt)*) => { $crate::wlog!($crate::wlog::LogLevel::Trace, $($arg)*) };
}
