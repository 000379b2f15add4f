//! The single live binding to the managed callback target.

use crate::logger::{self, BreadcrumbFlags};
use bitflags::bitflags;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

bitflags! {
    /// Callback methods a target implements, resolved once at registration.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Capabilities: u32 {
        const NEW_STATE       = 0b0000_0001;
        const GET_TOKEN       = 0b0000_0010;
        const SET_TOKEN       = 0b0000_0100;
        const PROXY_FD        = 0b0000_1000;
        const PROXY_READY     = 0b0001_0000;
    }
}

/// Managed object receiving backend callbacks.
///
/// Calls arrive on backend worker threads and block that worker until they
/// return. Errors and panics are caught by the dispatcher and treated as
/// "not handled".
pub trait CallbackTarget: Send + Sync {
    fn on_new_state(&self, code: i32, data: Option<&str>) -> anyhow::Result<bool>;
    fn get_token(&self, server_id: &str) -> anyhow::Result<Option<String>>;
    fn set_token(&self, server_id: &str, token: Option<&str>) -> anyhow::Result<()>;
    fn on_proxy_file_descriptor(&self, fd: i32) -> anyhow::Result<()>;
    fn on_proxy_guard_ready(&self) -> anyhow::Result<()>;

    /// Which of the methods above do something. Queried once per
    /// registration.
    fn capabilities(&self) -> Capabilities {
        Capabilities::all()
    }
}

/// A registered target plus the handles resolved for it.
pub struct Registration {
    target: Arc<dyn CallbackTarget>,
    capabilities: Capabilities,
    generation: u64,
}

impl Registration {
    pub fn target(&self) -> &dyn CallbackTarget {
        self.target.as_ref()
    }

    pub fn supports(&self, capability: Capabilities) -> bool {
        self.capabilities.contains(capability)
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

#[derive(Default)]
pub struct CallbackRegistry {
    slot: RwLock<Option<Arc<Registration>>>,
    generation: AtomicU64,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `target`, replacing (and first releasing) any previous binding.
    /// Returns the generation number of the new binding.
    pub fn register(&self, target: Arc<dyn CallbackTarget>) -> u64 {
        let capabilities = target.capabilities();
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let registration = Arc::new(Registration {
            target,
            capabilities,
            generation,
        });

        // The registry's reference to the old target goes away before the
        // replacement lands. Dispatches that already took a snapshot keep
        // their own Arc and finish against the old target.
        let previous = self.slot.write().take();
        let previous_generation = previous.as_ref().map(|old| old.generation);
        drop(previous);
        let displaced = self.slot.write().replace(registration);
        drop(displaced);

        logger::breadcrumb(
            BreadcrumbFlags::REGISTRY,
            match previous_generation {
                Some(old) => format!(
                    "registration {generation} replaced {old} (capabilities={capabilities:?})"
                ),
                None => format!("registration {generation} bound (capabilities={capabilities:?})"),
            },
        );
        generation
    }

    /// Drops the binding. Returns whether one was present.
    pub fn deregister(&self) -> bool {
        let previous = self.slot.write().take();
        match previous {
            Some(registration) => {
                logger::breadcrumb(
                    BreadcrumbFlags::REGISTRY,
                    format!("registration {} released", registration.generation),
                );
                true
            }
            None => false,
        }
    }

    /// Snapshot of the current binding.
    pub fn current(&self) -> Option<Arc<Registration>> {
        self.slot.read().clone()
    }

    pub fn is_registered(&self) -> bool {
        self.slot.read().is_some()
    }

    /// Generation of the most recent `register`, or 0 when never registered.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Relaxed)
    }
}
