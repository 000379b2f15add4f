//! Process-wide log routing to a host-installed C sink.
//!
//! Plain records are filtered by level, breadcrumbs by category mask. Nothing
//! is formatted until a sink is installed.

use crate::ffi::BridgeLogSink;
use bitflags::bitflags;
use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use std::ffi::{c_char, c_void, CString};
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::time::{Duration, Instant};

type LogCallback = unsafe extern "C" fn(
    level: *const c_char,
    message: *const c_char,
    breadcrumbs: u32,
    context: *mut c_void,
);

bitflags! {
    /// Categories of high-volume diagnostic records.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct BreadcrumbFlags: u32 {
        const REGISTRY  = 0b0000_0001;
        const COOKIE    = 0b0000_0010;
        const DISPATCH  = 0b0000_0100;
        const THREAD    = 0b0000_1000;
        const FFI       = 0b0001_0000;
        const OWNERSHIP = 0b0010_0000;
        const ALL       = u32::MAX;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
}

impl LogLevel {
    /// Unknown names fall back to `Info`.
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "error" | "err" => Self::Error,
            "warn" | "warning" => Self::Warn,
            "debug" | "dbg" | "trace" => Self::Debug,
            _ => Self::Info,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Error,
            1 => Self::Warn,
            2 => Self::Info,
            _ => Self::Debug,
        }
    }

    fn as_c_str(self) -> &'static [u8] {
        match self {
            Self::Error => b"error\0",
            Self::Warn => b"warn\0",
            Self::Info => b"info\0",
            Self::Debug => b"debug\0",
        }
    }
}

#[derive(Clone, Copy)]
struct Sink {
    callback: LogCallback,
    context: *mut c_void,
}

// The host guarantees the callback may be invoked from any thread.
unsafe impl Send for Sink {}
unsafe impl Sync for Sink {}

struct Router {
    sink: RwLock<Option<Sink>>,
    level: AtomicU8,
    mask: AtomicU32,
    prefix: String,
}

static ROUTER: Lazy<Router> = Lazy::new(|| Router {
    sink: RwLock::new(None),
    level: AtomicU8::new(LogLevel::Info as u8),
    mask: AtomicU32::new(0),
    prefix: format!("[bridge-p{}]", std::process::id()),
});

impl Router {
    fn wants(&self, level: LogLevel, breadcrumbs: BreadcrumbFlags) -> Option<Sink> {
        let sink = (*self.sink.read())?;
        let accepted = if breadcrumbs.is_empty() {
            level <= LogLevel::from_u8(self.level.load(Ordering::Relaxed))
        } else {
            BreadcrumbFlags::from_bits_truncate(self.mask.load(Ordering::Relaxed))
                .intersects(breadcrumbs)
        };
        accepted.then_some(sink)
    }

    fn emit(&self, sink: Sink, level: LogLevel, breadcrumbs: BreadcrumbFlags, line: String) {
        let Ok(line) = CString::new(line) else {
            return;
        };
        // Called without holding the sink lock; the host may log re-entrantly.
        unsafe {
            (sink.callback)(
                level.as_c_str().as_ptr().cast::<c_char>(),
                line.as_ptr(),
                breadcrumbs.bits(),
                sink.context,
            );
        }
    }
}

fn record(level: LogLevel, message: String) {
    if message.is_empty() {
        return;
    }
    let Some(sink) = ROUTER.wants(level, BreadcrumbFlags::empty()) else {
        return;
    };
    let line = format!("{} {message}", ROUTER.prefix);
    ROUTER.emit(sink, level, BreadcrumbFlags::empty(), line);
}

pub fn error(message: impl Into<String>) {
    record(LogLevel::Error, message.into());
}

pub fn warn(message: impl Into<String>) {
    record(LogLevel::Warn, message.into());
}

pub fn info(message: impl Into<String>) {
    record(LogLevel::Info, message.into());
}

pub fn debug(message: impl Into<String>) {
    record(LogLevel::Debug, message.into());
}

/// Emits `message` at debug level if any of `flag`'s categories is enabled.
/// Callers pay for the formatting of `message` either way; keep it cheap.
pub fn breadcrumb(flag: BreadcrumbFlags, message: impl Into<String>) {
    if flag.is_empty() {
        return;
    }
    let Some(sink) = ROUTER.wants(LogLevel::Debug, flag) else {
        return;
    };
    let labels = flag
        .iter_names()
        .filter(|(name, _)| *name != "ALL")
        .map(|(name, _)| name)
        .collect::<Vec<_>>()
        .join("|");
    let line = format!("{} [{labels}] {}", ROUTER.prefix, message.into());
    ROUTER.emit(sink, LogLevel::Debug, flag, line);
}

/// Installs or, with `None`, removes the host sink. `level` sets the minimum
/// level of plain records; the sink's `enabled_breadcrumbs` becomes the mask.
pub fn install_sink(
    sink: Option<&BridgeLogSink>,
    level: Option<&str>,
) -> Result<(), &'static str> {
    let Some(sink) = sink else {
        *ROUTER.sink.write() = None;
        return Ok(());
    };
    let callback = sink.log.ok_or("log callback missing")?;
    let level = level.map_or(LogLevel::Info, LogLevel::parse);
    ROUTER.level.store(level as u8, Ordering::Relaxed);
    ROUTER.mask.store(sink.enabled_breadcrumbs, Ordering::Relaxed);
    *ROUTER.sink.write() = Some(Sink {
        callback,
        context: sink.context,
    });
    Ok(())
}

pub fn set_breadcrumb_mask(mask: u32) {
    ROUTER.mask.store(mask, Ordering::Relaxed);
}

const RATE_LIMIT_INTERVAL: Duration = Duration::from_secs(1);

/// Errors that can repeat once per backend callback and are throttled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCategory {
    /// A worker thread could not be attached to the managed runtime.
    AttachFailed,
    /// A managed handler panicked or returned an error.
    HandlerFault,
    /// A backend callback arrived with no bridge registered.
    Unrouted,
    /// The deferred notification queue was full.
    QueueFull,
}

impl ErrorCategory {
    const COUNT: usize = 4;

    fn label(self) -> &'static str {
        match self {
            Self::AttachFailed => "ATTACH_FAILED",
            Self::HandlerFault => "HANDLER_FAULT",
            Self::Unrouted => "UNROUTED",
            Self::QueueFull => "QUEUE_FULL",
        }
    }
}

#[derive(Clone, Copy, Default)]
struct Throttle {
    last: Option<Instant>,
    suppressed: u64,
}

static THROTTLES: Mutex<[Throttle; ErrorCategory::COUNT]> = parking_lot::const_mutex(
    [Throttle {
        last: None,
        suppressed: 0,
    }; ErrorCategory::COUNT],
);

/// Logs at error level, at most once per second per category. The next line
/// that gets through reports how many were dropped in between. Returns
/// whether this line was emitted.
pub fn rate_limited_error(category: ErrorCategory, message: impl Into<String>) -> bool {
    let now = Instant::now();
    let suppressed = {
        let mut throttles = THROTTLES.lock();
        let throttle = &mut throttles[category as usize];
        if throttle
            .last
            .is_some_and(|last| now.duration_since(last) < RATE_LIMIT_INTERVAL)
        {
            throttle.suppressed += 1;
            return false;
        }
        throttle.last = Some(now);
        std::mem::take(&mut throttle.suppressed)
    };
    let message = message.into();
    if suppressed == 0 {
        error(format!("[{}] {message}", category.label()));
    } else {
        error(format!(
            "[{}] {message} ({suppressed} similar suppressed)",
            category.label()
        ));
    }
    true
}
