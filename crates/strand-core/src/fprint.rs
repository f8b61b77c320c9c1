//! Leveled diagnostic printing
//!
//! Thread-safe stderr macros used by the runtime for lifecycle and
//! teardown diagnostics.
//!
//! # Environment Variables
//!
//! - `STRAND_LOG_LEVEL=<level>` - 0=off, 1=error, 2=warn, 3=info, 4=debug, 5=trace
//! - `STRAND_FLUSH_LOG=1` - flush stderr after each line

use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

/// Diagnostic levels
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Off = 0,
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

impl LogLevel {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => LogLevel::Off,
            1 => LogLevel::Error,
            2 => LogLevel::Warn,
            3 => LogLevel::Info,
            4 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }

    fn prefix(&self) -> &'static str {
        match self {
            LogLevel::Off => "",
            LogLevel::Error => "[ERROR]",
            LogLevel::Warn => "[WARN] ",
            LogLevel::Info => "[INFO] ",
            LogLevel::Debug => "[DEBUG]",
            LogLevel::Trace => "[TRACE]",
        }
    }
}

static LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Warn as u8);
static FLUSH: AtomicBool = AtomicBool::new(false);
static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Initialize from environment variables
///
/// Runs automatically on first use; calling it explicitly makes
/// initialization deterministic.
pub fn init() {
    if INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }
    if let Some(level) = crate::env::env_get_opt::<u8>("STRAND_LOG_LEVEL") {
        LOG_LEVEL.store(LogLevel::from_u8(level) as u8, Ordering::Relaxed);
    }
    FLUSH.store(
        crate::env::env_get_bool("STRAND_FLUSH_LOG", false),
        Ordering::Relaxed,
    );
}

/// Set the level programmatically
pub fn set_log_level(level: LogLevel) {
    INITIALIZED.store(true, Ordering::SeqCst);
    LOG_LEVEL.store(level as u8, Ordering::Relaxed);
}

/// Check whether `level` would currently be printed
#[inline]
pub fn level_enabled(level: LogLevel) -> bool {
    if !INITIALIZED.load(Ordering::Relaxed) {
        init();
    }
    level as u8 <= LOG_LEVEL.load(Ordering::Relaxed)
}

#[doc(hidden)]
pub fn _log_impl(level: LogLevel, args: std::fmt::Arguments<'_>) {
    if !level_enabled(level) {
        return;
    }
    let stderr = std::io::stderr();
    let mut handle = stderr.lock();
    let _ = write!(handle, "{} ", level.prefix());
    let _ = handle.write_fmt(args);
    let _ = handle.write_all(b"\n");
    if FLUSH.load(Ordering::Relaxed) {
        let _ = handle.flush();
    }
}

/// Error level log
#[macro_export]
macro_rules! ferror {
    ($($arg:tt)*) => {{
        $crate::fprint::_log_impl($crate::fprint::LogLevel::Error, format_args!($($arg)*));
    }};
}

/// Warning level log
#[macro_export]
macro_rules! fwarn {
    ($($arg:tt)*) => {{
        $crate::fprint::_log_impl($crate::fprint::LogLevel::Warn, format_args!($($arg)*));
    }};
}

/// Info level log
#[macro_export]
macro_rules! finfo {
    ($($arg:tt)*) => {{
        $crate::fprint::_log_impl($crate::fprint::LogLevel::Info, format_args!($($arg)*));
    }};
}

/// Debug level log
#[macro_export]
macro_rules! fdebug {
    ($($arg:tt)*) => {{
        $crate::fprint::_log_impl($crate::fprint::LogLevel::Debug, format_args!($($arg)*));
    }};
}

/// Trace level log (most verbose)
#[macro_export]
macro_rules! ftrace {
    ($($arg:tt)*) => {{
        $crate::fprint::_log_impl($crate::fprint::LogLevel::Trace, format_args!($($arg)*));
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_ordering() {
        assert!(LogLevel::Error < LogLevel::Warn);
        assert!(LogLevel::Warn < LogLevel::Info);
        assert!(LogLevel::Debug < LogLevel::Trace);
    }

    #[test]
    fn test_level_from_u8() {
        assert_eq!(LogLevel::from_u8(0), LogLevel::Off);
        assert_eq!(LogLevel::from_u8(3), LogLevel::Info);
        assert_eq!(LogLevel::from_u8(200), LogLevel::Trace);
    }

    #[test]
    fn test_macros_compile() {
        set_log_level(LogLevel::Off);

        ferror!("error {}", 1);
        fwarn!("warn");
        finfo!("info {}", "msg");
        fdebug!("debug");
        ftrace!("trace");
    }
}
