//! Kernel log records.
//!
//! Messages are emitted through the [`info!`](crate::info), [`warn!`](crate::warn) and [`error!`](crate::error)
//! macros, with a short context string inserted at the beginning of the message (`"apic"`, `"smp"`, ...).
//!
//! The subsystem does not own any output device: records are forwarded to a single [`LogSink`] registered at boot
//! (usually the framebuffer console or a serial port). Records emitted before a sink is registered are dropped.

use core::fmt::{self, Display, Formatter};

use conquer_once::spin::OnceCell;

/// Registered output of the log macros.
static LOG_SINK: OnceCell<&'static dyn LogSink> = OnceCell::uninit();

/// Severity of a log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    /// Standard information message.
    Info,

    /// Degraded but recoverable situation.
    Warning,

    /// Failure of an operation.
    Error,
}

impl Display for LogLevel {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Info => f.write_str("info"),
            Self::Warning => f.write_str("warn"),
            Self::Error => f.write_str("error"),
        }
    }
}

/// Output device for log records.
pub trait LogSink: Sync {
    /// Writes a single record.
    fn log(&self, level: LogLevel, context: &str, args: fmt::Arguments<'_>);
}

/// Registers the output used by the log macros.
///
/// Returns `false` if a sink was already registered, in which case the previous one is kept.
pub fn register_sink(sink: &'static dyn LogSink) -> bool {
    LOG_SINK.try_init_once(|| sink).is_ok()
}

/// Forwards a record to the registered sink, if any.
#[doc(hidden)]
pub fn dispatch(level: LogLevel, context: &str, args: fmt::Arguments<'_>) {
    if let Some(sink) = LOG_SINK.get() {
        sink.log(level, context, args);
    }
}

/// Formats a record the way the console prints it: `[level] context : message`.
pub fn format_record(
    out: &mut dyn fmt::Write,
    level: LogLevel,
    context: &str,
    args: fmt::Arguments<'_>,
) -> fmt::Result {
    write!(out, "[{level}] {context} : {args}")
}

/// Emits a standard information message.
///
/// # Examples
///
/// ```
/// use fzkernel::info;
///
/// info!("apic", "local apic initialized");
/// ```
#[macro_export]
macro_rules! info {
    ($ctx: literal, $($arg: tt)*) => {
        $crate::fzboot::log::dispatch(
            $crate::fzboot::log::LogLevel::Info,
            $ctx,
            format_args!($($arg)*),
        )
    };
}

/// Emits a warning message.
#[macro_export]
macro_rules! warn {
    ($ctx: literal, $($arg: tt)*) => {
        $crate::fzboot::log::dispatch(
            $crate::fzboot::log::LogLevel::Warning,
            $ctx,
            format_args!($($arg)*),
        )
    };
}

/// Emits an error message.
///
/// # Examples
///
/// ```
/// use fzkernel::error;
///
/// error!("smp", "CPU [{}] is not responding", 3);
/// ```
#[macro_export]
macro_rules! error {
    ($ctx: literal, $($arg: tt)*) => {
        $crate::fzboot::log::dispatch(
            $crate::fzboot::log::LogLevel::Error,
            $ctx,
            format_args!($($arg)*),
        )
    };
}
