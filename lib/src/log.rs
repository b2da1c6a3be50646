//! Stack logging subsystem.
//!
//! All log output funnels through a single **backend** function pointer. The
//! library ships with no backend — a freestanding build stays silent until the
//! embedder registers one, at which point every log line goes through the
//! embedder's serial console, RTT channel, or host stdout.
//!
//! # Backend contract
//!
//! The backend receives the level and the pre-formatted arguments for a
//! **single log line** and is responsible for:
//!
//! 1. Writing the formatted text atomically (no interleaving from other
//!    execution contexts).
//! 2. Appending a trailing newline after the text.
//!
//! # Registration
//!
//! ```ignore
//! fn serial_backend(level: LogLevel, args: core::fmt::Arguments<'_>) { /* ... */ }
//! rill_lib::netlog_register_backend(serial_backend);
//! ```

use core::fmt;
use core::sync::atomic::{AtomicPtr, AtomicU8, Ordering};

// ---------------------------------------------------------------------------
// Log levels
// ---------------------------------------------------------------------------

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
    Trace = 4,
}

impl LogLevel {
    fn from_raw(raw: u8) -> Self {
        match raw {
            0 => LogLevel::Error,
            1 => LogLevel::Warn,
            2 => LogLevel::Info,
            3 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }
}

static CURRENT_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);

/// `true` if a line at `level` would currently be emitted.
#[inline]
pub fn netlog_is_enabled(level: LogLevel) -> bool {
    level as u8 <= CURRENT_LEVEL.load(Ordering::Relaxed)
}

/// Raise or lower the global log threshold.
pub fn netlog_set_level(level: LogLevel) {
    CURRENT_LEVEL.store(level as u8, Ordering::Relaxed);
}

/// Current global log threshold.
pub fn netlog_get_level() -> LogLevel {
    LogLevel::from_raw(CURRENT_LEVEL.load(Ordering::Relaxed))
}

// ---------------------------------------------------------------------------
// Backend dispatch
// ---------------------------------------------------------------------------

/// Signature of a log backend.
///
/// The backend must write the formatted text **and** a trailing newline under
/// a single lock acquisition (if applicable) so that lines from different
/// contexts do not interleave.
pub type LogBackend = fn(level: LogLevel, args: fmt::Arguments<'_>);

/// Stored as a raw pointer; `null` means "no backend registered, drop lines".
static BACKEND: AtomicPtr<()> = AtomicPtr::new(core::ptr::null_mut());

/// Install the active backend. Replaces any previously registered one.
pub fn netlog_register_backend(backend: LogBackend) {
    BACKEND.store(backend as *mut (), Ordering::Release);
}

/// Dispatch a log line through the active backend, if any.
#[doc(hidden)]
pub fn netlog_dispatch(level: LogLevel, args: fmt::Arguments<'_>) {
    if !netlog_is_enabled(level) {
        return;
    }

    let raw = BACKEND.load(Ordering::Acquire);
    if raw.is_null() {
        return;
    }

    // SAFETY: The pointer was produced from a `LogBackend` fn pointer in
    // `netlog_register_backend` and is only ever read back here.
    let backend: LogBackend = unsafe { core::mem::transmute(raw) };
    backend(level, args);
}

// ---------------------------------------------------------------------------
// Macros
// ---------------------------------------------------------------------------

#[macro_export]
macro_rules! netlog_error {
    ($($arg:tt)*) => {
        $crate::log::netlog_dispatch($crate::log::LogLevel::Error, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! netlog_warn {
    ($($arg:tt)*) => {
        $crate::log::netlog_dispatch($crate::log::LogLevel::Warn, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! netlog_info {
    ($($arg:tt)*) => {
        $crate::log::netlog_dispatch($crate::log::LogLevel::Info, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! netlog_debug {
    ($($arg:tt)*) => {
        $crate::log::netlog_dispatch($crate::log::LogLevel::Debug, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! netlog_trace {
    ($($arg:tt)*) => {
        $crate::log::netlog_dispatch($crate::log::LogLevel::Trace, format_args!($($arg)*))
    };
}
