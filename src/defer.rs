//! Moves one-way notifications off the backend worker.
//!
//! `DeferredTarget` answers state transitions and token reads inline, since
//! the backend waits for their result, and queues token writes and proxy
//! notifications for a single worker thread. Queued events keep their order.

use crate::logger::{self, BreadcrumbFlags, ErrorCategory};
use crate::registry::{CallbackTarget, Capabilities};
use crate::thread_bridge::ThreadBridge;
use crossbeam_channel::{Receiver, Sender, TrySendError};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

#[derive(Debug)]
enum Deferred {
    TokenWrite {
        server_id: String,
        token: Option<String>,
    },
    ProxyDescriptor(i32),
    ProxyReady,
}

pub struct DeferredTarget {
    inner: Arc<dyn CallbackTarget>,
    sender: Option<Sender<Deferred>>,
    worker: Option<JoinHandle<()>>,
}

impl DeferredTarget {
    /// Spawns the worker. It runs `inner` through `threads`, so it attaches
    /// to the managed runtime like any backend thread would.
    pub fn new(
        inner: Arc<dyn CallbackTarget>,
        threads: ThreadBridge,
        capacity: usize,
    ) -> anyhow::Result<Self> {
        let (sender, receiver) = crossbeam_channel::bounded(capacity.max(1));
        let worker_target = Arc::clone(&inner);
        let worker = thread::Builder::new()
            .name("bridge-deferred".into())
            .spawn(move || drain(receiver, worker_target, threads))?;
        Ok(Self {
            inner,
            sender: Some(sender),
            worker: Some(worker),
        })
    }

    /// Events waiting for the worker.
    pub fn pending(&self) -> usize {
        self.sender.as_ref().map_or(0, Sender::len)
    }

    fn enqueue(&self, event: Deferred) -> anyhow::Result<()> {
        let Some(sender) = self.sender.as_ref() else {
            anyhow::bail!("deferred worker stopped");
        };
        match sender.try_send(event) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(event)) => {
                logger::rate_limited_error(
                    ErrorCategory::QueueFull,
                    format!("deferred queue full, dropping {event:?}"),
                );
                Ok(())
            }
            Err(TrySendError::Disconnected(_)) => anyhow::bail!("deferred worker exited"),
        }
    }
}

fn drain(receiver: Receiver<Deferred>, target: Arc<dyn CallbackTarget>, threads: ThreadBridge) {
    for event in receiver {
        let outcome = threads.with_managed_thread(|| {
            panic::catch_unwind(AssertUnwindSafe(|| match &event {
                Deferred::TokenWrite { server_id, token } => {
                    target.set_token(server_id, token.as_deref())
                }
                Deferred::ProxyDescriptor(fd) => target.on_proxy_file_descriptor(*fd),
                Deferred::ProxyReady => target.on_proxy_guard_ready(),
            }))
        });
        let fault = match outcome {
            Ok(Ok(Ok(()))) => continue,
            Ok(Ok(Err(error))) => format!("failed: {error:#}"),
            Ok(Err(_)) => "panicked".to_owned(),
            Err(error) => {
                logger::breadcrumb(
                    BreadcrumbFlags::DISPATCH,
                    format!("deferred {event:?} dropped: {error}"),
                );
                continue;
            }
        };
        logger::rate_limited_error(
            ErrorCategory::HandlerFault,
            format!("deferred {event:?} {fault}"),
        );
    }
    logger::breadcrumb(BreadcrumbFlags::DISPATCH, "deferred worker drained");
}

impl CallbackTarget for DeferredTarget {
    fn on_new_state(&self, code: i32, data: Option<&str>) -> anyhow::Result<bool> {
        self.inner.on_new_state(code, data)
    }

    fn get_token(&self, server_id: &str) -> anyhow::Result<Option<String>> {
        self.inner.get_token(server_id)
    }

    fn set_token(&self, server_id: &str, token: Option<&str>) -> anyhow::Result<()> {
        self.enqueue(Deferred::TokenWrite {
            server_id: server_id.to_owned(),
            token: token.map(str::to_owned),
        })
    }

    fn on_proxy_file_descriptor(&self, fd: i32) -> anyhow::Result<()> {
        self.enqueue(Deferred::ProxyDescriptor(fd))
    }

    fn on_proxy_guard_ready(&self) -> anyhow::Result<()> {
        self.enqueue(Deferred::ProxyReady)
    }

    fn capabilities(&self) -> Capabilities {
        self.inner.capabilities()
    }
}

impl Drop for DeferredTarget {
    /// Delivers whatever is still queued, then joins the worker.
    fn drop(&mut self) {
        self.sender.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                logger::error("deferred worker panicked");
            }
        }
    }
}
