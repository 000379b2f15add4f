//! Gives a backend worker thread temporary access to the managed runtime.

use crate::error::{BridgeError, BridgeResult};
use crate::logger::{self, BreadcrumbFlags, ErrorCategory};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Thread association primitives of a managed runtime.
pub trait ManagedRuntime: Send + Sync {
    /// Whether the calling thread is already associated with the runtime.
    fn is_attached(&self) -> bool;
    /// Associates the calling thread.
    fn attach(&self) -> anyhow::Result<()>;
    /// Dissociates the calling thread. Only called after a successful
    /// `attach` on the same thread.
    fn detach(&self);
}

/// Runtime for hosts whose callbacks are plain Rust or C code: every thread
/// may call in without association.
#[derive(Debug, Default, Clone, Copy)]
pub struct DirectRuntime;

impl ManagedRuntime for DirectRuntime {
    fn is_attached(&self) -> bool {
        true
    }

    fn attach(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn detach(&self) {}
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AttachStats {
    pub attaches: u64,
    pub detaches: u64,
    pub failures: u64,
}

#[derive(Default)]
struct AttachCounters {
    attaches: AtomicU64,
    detaches: AtomicU64,
    failures: AtomicU64,
}

#[derive(Clone)]
pub struct ThreadBridge {
    runtime: Arc<dyn ManagedRuntime>,
    counters: Arc<AttachCounters>,
}

impl ThreadBridge {
    pub fn new(runtime: Arc<dyn ManagedRuntime>) -> Self {
        Self {
            runtime,
            counters: Arc::new(AttachCounters::default()),
        }
    }

    /// Runs `run` with the current thread associated to the runtime.
    ///
    /// A thread that was already attached is left attached. A thread this
    /// call attaches is detached before returning, including when `run`
    /// unwinds. If attaching fails `run` is not invoked.
    pub fn with_managed_thread<R>(&self, run: impl FnOnce() -> R) -> BridgeResult<R> {
        if self.runtime.is_attached() {
            return Ok(run());
        }

        if let Err(error) = self.runtime.attach() {
            self.counters.failures.fetch_add(1, Ordering::Relaxed);
            let reason = format!("{error:#}");
            logger::rate_limited_error(
                ErrorCategory::AttachFailed,
                format!(
                    "thread {:?} could not attach: {reason}",
                    std::thread::current().id()
                ),
            );
            return Err(BridgeError::RuntimeAttachFailed(reason));
        }
        self.counters.attaches.fetch_add(1, Ordering::Relaxed);
        logger::breadcrumb(
            BreadcrumbFlags::THREAD,
            format!("attached {:?}", std::thread::current().id()),
        );

        let _detach = DetachOnExit { bridge: self };
        Ok(run())
    }

    pub fn stats(&self) -> AttachStats {
        AttachStats {
            attaches: self.counters.attaches.load(Ordering::Relaxed),
            detaches: self.counters.detaches.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
        }
    }
}

struct DetachOnExit<'a> {
    bridge: &'a ThreadBridge,
}

impl Drop for DetachOnExit<'_> {
    fn drop(&mut self) {
        self.bridge.runtime.detach();
        self.bridge.counters.detaches.fetch_add(1, Ordering::Relaxed);
        logger::breadcrumb(
            BreadcrumbFlags::THREAD,
            format!("detached {:?}", std::thread::current().id()),
        );
    }
}
