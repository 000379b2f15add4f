//! Routes backend callbacks to the registered target.
//!
//! Every event goes through the same path: snapshot the registration, attach
//! via [`ThreadBridge`], invoke the target with panics caught, detach. A
//! missing target, a missing capability, an attach failure or a handler
//! fault all end the call with the event's "nothing happened" result.

use crate::backend::Backend;
use crate::error::BridgeError;
use crate::logger::{self, BreadcrumbFlags, ErrorCategory};
use crate::ownership::{self, fields, FieldOwnership, OwnedString};
use crate::registry::{CallbackRegistry, CallbackTarget, Capabilities};
use crate::thread_bridge::ThreadBridge;
use std::any::Any;
use std::ffi::c_char;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Event {
    StateTransition,
    TokenRead,
    TokenWrite,
    ProxyDescriptor,
    ProxyReady,
}

impl Event {
    fn capability(self) -> Capabilities {
        match self {
            Event::StateTransition => Capabilities::NEW_STATE,
            Event::TokenRead => Capabilities::GET_TOKEN,
            Event::TokenWrite => Capabilities::SET_TOKEN,
            Event::ProxyDescriptor => Capabilities::PROXY_FD,
            Event::ProxyReady => Capabilities::PROXY_READY,
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Event::StateTransition => "state transition",
            Event::TokenRead => "token read",
            Event::TokenWrite => "token write",
            Event::ProxyDescriptor => "proxy descriptor",
            Event::ProxyReady => "proxy ready",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DispatchStats {
    /// Calls that reached the target and returned normally.
    pub delivered: u64,
    /// Calls dropped before reaching the target.
    pub dropped: u64,
    /// Calls where the target panicked or returned an error.
    pub faults: u64,
}

#[derive(Default)]
struct DispatchCounters {
    delivered: AtomicU64,
    dropped: AtomicU64,
    faults: AtomicU64,
}

pub struct CallbackDispatcher {
    threads: ThreadBridge,
    registry: Arc<CallbackRegistry>,
    backend: Arc<dyn Backend>,
    state_payload: FieldOwnership,
    counters: DispatchCounters,
}

impl CallbackDispatcher {
    pub fn new(
        threads: ThreadBridge,
        registry: Arc<CallbackRegistry>,
        backend: Arc<dyn Backend>,
    ) -> Self {
        Self {
            threads,
            registry,
            backend,
            state_payload: fields::STATE_PAYLOAD,
            counters: DispatchCounters::default(),
        }
    }

    pub fn with_state_payload(mut self, ownership: FieldOwnership) -> Self {
        self.state_payload = ownership;
        self
    }

    /// `StateCB` as the backend calls it. The payload is copied and, when
    /// ownership was transferred, released before the target runs, so it is
    /// released exactly once whatever happens to the dispatch.
    ///
    /// # Safety
    /// A non-null `data` must be a NUL-terminated backend string valid for
    /// the call.
    pub unsafe fn state_transition_raw(
        &self,
        old_state: i32,
        new_state: i32,
        data: *mut c_char,
    ) -> bool {
        let payload =
            unsafe { OwnedString::from_raw(data, self.backend.as_ref(), self.state_payload) }
                .map(OwnedString::into_string);
        self.state_transition(old_state, new_state, payload.as_deref())
    }

    /// Returns whether the target handled the transition.
    pub fn state_transition(&self, old_state: i32, new_state: i32, payload: Option<&str>) -> bool {
        logger::breadcrumb(
            BreadcrumbFlags::DISPATCH,
            format!("state {old_state} -> {new_state}"),
        );
        self.invoke(Event::StateTransition, |target| target.on_new_state(new_state, payload))
            .unwrap_or(false)
    }

    /// Writes the token for `server_id` into `out`, NUL terminated and
    /// truncated to fit. Writes an empty string when there is no token.
    /// Returns the number of token bytes written.
    pub fn token_read(&self, server_id: &str, out: &mut [u8]) -> usize {
        let token = self
            .invoke(Event::TokenRead, |target| target.get_token(server_id))
            .flatten()
            .unwrap_or_default();
        let written = ownership::copy_truncated(&token, out);
        if written < token.len() {
            logger::breadcrumb(
                BreadcrumbFlags::OWNERSHIP,
                format!(
                    "token for {server_id} truncated from {} to {written} bytes",
                    token.len()
                ),
            );
        }
        written
    }

    /// # Safety
    /// `server_id` must be null or a valid C string; `out` must be null or
    /// point to `len` writable bytes.
    pub unsafe fn token_read_raw(&self, server_id: *const c_char, out: *mut c_char, len: usize) {
        if out.is_null() || len == 0 {
            return;
        }
        let out = unsafe { std::slice::from_raw_parts_mut(out.cast::<u8>(), len) };
        out[0] = 0;
        let Some(server_id) = (unsafe { ownership::borrowed_string(server_id) }) else {
            return;
        };
        self.token_read(&server_id, out);
    }

    pub fn token_write(&self, server_id: &str, token: Option<&str>) {
        self.invoke(Event::TokenWrite, |target| target.set_token(server_id, token));
    }

    /// # Safety
    /// Both pointers must be null or valid C strings for the call.
    pub unsafe fn token_write_raw(&self, server_id: *const c_char, token: *const c_char) {
        debug_assert_eq!(fields::TOKEN_SERVER_ID, FieldOwnership::Retained);
        debug_assert_eq!(fields::TOKEN_VALUE, FieldOwnership::Retained);
        let Some(server_id) = (unsafe { ownership::borrowed_string(server_id) }) else {
            return;
        };
        let token = unsafe { ownership::borrowed_string(token) };
        self.token_write(&server_id, token.as_deref());
    }

    pub fn proxy_descriptor(&self, fd: i32) {
        self.invoke(Event::ProxyDescriptor, |target| target.on_proxy_file_descriptor(fd));
    }

    pub fn proxy_ready(&self) {
        self.invoke(Event::ProxyReady, |target| target.on_proxy_guard_ready());
    }

    pub(crate) fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub(crate) fn state_payload(&self) -> FieldOwnership {
        self.state_payload
    }

    pub fn registry(&self) -> &Arc<CallbackRegistry> {
        &self.registry
    }

    pub fn threads(&self) -> &ThreadBridge {
        &self.threads
    }

    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            faults: self.counters.faults.load(Ordering::Relaxed),
        }
    }

    fn invoke<T>(
        &self,
        event: Event,
        call: impl FnOnce(&dyn CallbackTarget) -> anyhow::Result<T>,
    ) -> Option<T> {
        let Some(registration) = self.registry.current() else {
            self.drop_event(event, &BridgeError::NoActiveTarget);
            return None;
        };
        if !registration.supports(event.capability()) {
            logger::breadcrumb(
                BreadcrumbFlags::DISPATCH,
                format!("{event} skipped: target does not implement it"),
            );
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        let outcome = self.threads.with_managed_thread(|| {
            panic::catch_unwind(AssertUnwindSafe(|| call(registration.target())))
        });
        let fault = match outcome {
            Ok(Ok(Ok(value))) => {
                self.counters.delivered.fetch_add(1, Ordering::Relaxed);
                return Some(value);
            }
            Err(error) => {
                self.drop_event(event, &error);
                return None;
            }
            Ok(Ok(Err(error))) => format!("{error:#}"),
            Ok(Err(payload)) => format!("panicked: {}", panic_message(payload.as_ref())),
        };

        self.counters.faults.fetch_add(1, Ordering::Relaxed);
        let error = BridgeError::ManagedHandlerFault(fault);
        logger::rate_limited_error(
            ErrorCategory::HandlerFault,
            format!(
                "{event} handler (registration {}): {error}",
                registration.generation()
            ),
        );
        None
    }

    fn drop_event(&self, event: Event, reason: &BridgeError) {
        self.counters.dropped.fetch_add(1, Ordering::Relaxed);
        logger::breadcrumb(
            BreadcrumbFlags::DISPATCH,
            format!("{event} dropped: {reason}"),
        );
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}
