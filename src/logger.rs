//! Logging bridge to the host process
//!
//! The host registers one `(context, callback)` pair for the whole process
//! and may replace or clear it at any time. Every message is rendered into its
//! own buffer on the caller's thread and handed to the callback as
//! `(context, level, message)`. While no callback is bound the bridge drops
//! messages silently.
//!
//! Internals that do not hold a bridge reference log through the `log`
//! facade; the process-wide bridge is installed as the `log` logger the first
//! time the host binds a callback.

use std::ffi::{c_char, c_void, CStr, CString};
use std::fmt::{self, Write};
use std::sync::{Once, PoisonError, RwLock};

/// Native callback signature: `(context, level, message)`
pub type LoggerFn = unsafe extern "C" fn(context: *mut c_void, level: i32, msg: *const c_char);

/// The two channels understood by the host
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Verbose = 0,
    Error = 1,
}

#[derive(Clone, Copy)]
struct LoggerBinding {
    callback: LoggerFn,
    context: *mut c_void,
}

// The context pointer is owned by the host, which guarantees it stays valid
// until it replaces or clears the binding.
unsafe impl Send for LoggerBinding {}
unsafe impl Sync for LoggerBinding {}

/// Replaceable holder for the host logger binding
pub struct LogBridge {
    binding: RwLock<Option<LoggerBinding>>,
}

impl LogBridge {
    /// Create an unbound bridge; all log calls are no-ops until [`LogBridge::set`]
    pub const fn new() -> Self {
        Self {
            binding: RwLock::new(None),
        }
    }

    /// Bind, replace or clear the host callback
    ///
    /// A null callback clears the binding. Once `set` returns, no call into
    /// the previous callback is still running, so the host may release the
    /// old context.
    ///
    /// # Returns
    /// - `true` if a callback was bound before the call
    pub fn set(&self, context: *mut c_void, callback: Option<LoggerFn>) -> bool {
        let binding = callback.map(|callback| LoggerBinding { callback, context });
        let mut current = self.binding.write().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *current, binding).is_some()
    }

    /// Whether messages currently reach a host callback
    pub fn is_bound(&self) -> bool {
        self.binding
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Render `args` and forward the result on `level`
    pub fn forward(&self, level: LogLevel, args: fmt::Arguments<'_>) {
        // Skip rendering entirely when nobody listens.
        if !self.is_bound() {
            return;
        }
        let message = render(args);
        self.forward_cstr(level, &message);
    }

    /// Forward an already terminated message
    pub fn forward_cstr(&self, level: LogLevel, message: &CStr) {
        // The read guard is held across the call so `set` waits it out.
        let current = self.binding.read().unwrap_or_else(PoisonError::into_inner);
        if let Some(binding) = current.as_ref() {
            unsafe { (binding.callback)(binding.context, level as i32, message.as_ptr()) };
        }
    }
}

impl Default for LogBridge {
    fn default() -> Self {
        Self::new()
    }
}

impl log::Log for LogBridge {
    fn enabled(&self, _metadata: &log::Metadata<'_>) -> bool {
        self.is_bound()
    }

    fn log(&self, record: &log::Record<'_>) {
        let level = match record.level() {
            log::Level::Error | log::Level::Warn => LogLevel::Error,
            _ => LogLevel::Verbose,
        };
        self.forward(level, *record.args());
    }

    fn flush(&self) {}
}

/// Render a message for the host, never failing
///
/// A `Display` impl that errors leaves the text written before it. Interior
/// NULs are replaced so the message survives the trip through a C string.
pub fn render(args: fmt::Arguments<'_>) -> CString {
    let mut text = String::new();
    let _ = text.write_fmt(args);
    let trimmed = text.trim_end_matches('\n');
    let bytes = if trimmed.contains('\0') {
        trimmed.replace('\0', "\u{fffd}").into_bytes()
    } else {
        trimmed.as_bytes().to_vec()
    };
    CString::new(bytes).unwrap_or_default()
}

static HOST_LOGGER: LogBridge = LogBridge::new();
static LOG_FACADE: Once = Once::new();

/// The process-wide bridge used by the exported entry points
pub fn host_logger() -> &'static LogBridge {
    &HOST_LOGGER
}

/// Bind the process-wide bridge and route the `log` facade through it
pub fn set_host_logger(context: *mut c_void, callback: Option<LoggerFn>) -> bool {
    let replaced = HOST_LOGGER.set(context, callback);
    if callback.is_some() {
        LOG_FACADE.call_once(|| {
            if log::set_logger(&HOST_LOGGER).is_ok() {
                log::set_max_level(log::LevelFilter::Debug);
            }
        });
    }
    replaced
}

/// Log on the verbose channel of a bridge
#[macro_export]
macro_rules! verbosef {
    ($bridge:expr, $($arg:tt)+) => {
        $bridge.forward($crate::logger::LogLevel::Verbose, format_args!($($arg)+))
    };
}

/// Log on the error channel of a bridge
#[macro_export]
macro_rules! errorf {
    ($bridge:expr, $($arg:tt)+) => {
        $bridge.forward($crate::logger::LogLevel::Error, format_args!($($arg)+))
    };
}
