//! `extern "C"` entry points handed to the backend.
//!
//! The backend's callback signatures carry no context pointer, so the live
//! dispatcher sits in a single process-wide slot. Every trampoline catches
//! panics; unwinding into backend frames is undefined behaviour.

use crate::backend::Backend;
use crate::dispatch::CallbackDispatcher;
use crate::logger::{self, BreadcrumbFlags, ErrorCategory};
use crate::ownership::{FieldOwnership, OwnedString};
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use std::ffi::{c_char, c_int, c_void};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

static DISPATCHER: Lazy<RwLock<Option<Arc<CallbackDispatcher>>>> =
    Lazy::new(|| RwLock::new(None));

/// How the most recently routed backend releases state payloads. Outlives
/// the dispatcher so a callback racing deregistration still frees its data.
struct PayloadRelease {
    backend: Arc<dyn Backend>,
    ownership: FieldOwnership,
}

static LAST_RELEASE: Lazy<RwLock<Option<PayloadRelease>>> = Lazy::new(|| RwLock::new(None));

/// Routes backend callbacks to `dispatcher` and returns the one it replaced.
pub(crate) fn install(dispatcher: Arc<CallbackDispatcher>) -> Option<Arc<CallbackDispatcher>> {
    logger::breadcrumb(BreadcrumbFlags::FFI, "trampolines routed to new dispatcher");
    *LAST_RELEASE.write() = Some(PayloadRelease {
        backend: Arc::clone(dispatcher.backend()),
        ownership: dispatcher.state_payload(),
    });
    DISPATCHER.write().replace(dispatcher)
}

/// Whether the slot currently routes to `dispatcher`.
pub(crate) fn is_installed(dispatcher: &Arc<CallbackDispatcher>) -> bool {
    DISPATCHER
        .read()
        .as_ref()
        .is_some_and(|current| Arc::ptr_eq(current, dispatcher))
}

/// Empties the slot if it still holds `dispatcher`. Returns whether it did.
pub(crate) fn clear(dispatcher: &Arc<CallbackDispatcher>) -> bool {
    let removed = {
        let mut slot = DISPATCHER.write();
        match slot.as_ref() {
            Some(current) if Arc::ptr_eq(current, dispatcher) => slot.take(),
            _ => None,
        }
    };
    let cleared = removed.is_some();
    drop(removed);
    if cleared {
        logger::breadcrumb(BreadcrumbFlags::FFI, "trampolines unrouted");
    }
    cleared
}

pub(crate) fn current() -> Option<Arc<CallbackDispatcher>> {
    DISPATCHER.read().clone()
}

fn route<T>(entry: &'static str, fallback: T, run: impl FnOnce(&CallbackDispatcher) -> T) -> T {
    route_or(entry, fallback, || {}, run)
}

/// Like `route`, running `unrouted` first when no dispatcher is installed.
fn route_or<T>(
    entry: &'static str,
    fallback: T,
    unrouted: impl FnOnce(),
    run: impl FnOnce(&CallbackDispatcher) -> T,
) -> T {
    let Some(dispatcher) = current() else {
        if panic::catch_unwind(AssertUnwindSafe(unrouted)).is_err() {
            logger::error(format!("{entry} panicked while unrouted"));
        }
        logger::rate_limited_error(
            ErrorCategory::Unrouted,
            format!("{entry} called with no bridge registered"),
        );
        return fallback;
    };
    match panic::catch_unwind(AssertUnwindSafe(|| run(&dispatcher))) {
        Ok(value) => value,
        Err(_) => {
            logger::error(format!("{entry} panicked inside the bridge"));
            fallback
        }
    }
}

/// `StateCB`. Returns 1 when the managed side handled the transition.
///
/// # Safety
/// `data` must be null or a NUL-terminated string allocated by the backend.
pub unsafe extern "C" fn bridge_state_callback(
    old_state: c_int,
    new_state: c_int,
    data: *mut c_void,
) -> c_int {
    let data = data.cast::<c_char>();
    let handled = route_or(
        "state callback",
        false,
        || unsafe { release_unrouted_payload(data) },
        |dispatcher| unsafe { dispatcher.state_transition_raw(old_state, new_state, data) },
    );
    c_int::from(handled)
}

/// Applies the last routed backend's payload rule to `data`.
///
/// # Safety
/// Same contract as the `data` argument of [`bridge_state_callback`].
unsafe fn release_unrouted_payload(data: *mut c_char) {
    if data.is_null() {
        return;
    }
    let release = LAST_RELEASE.read();
    match release.as_ref() {
        Some(release) => {
            let payload =
                unsafe { OwnedString::from_raw(data, release.backend.as_ref(), release.ownership) };
            drop(payload);
        }
        None => logger::warn("state payload arrived before any registration; not released"),
    }
}

/// # Safety
/// `server_id` must be null or a valid C string; `out` must be null or point
/// to `len` writable bytes.
pub unsafe extern "C" fn bridge_token_read(
    server_id: *const c_char,
    out: *mut c_char,
    len: usize,
) {
    if !out.is_null() && len > 0 {
        // Leave an empty string behind even when nothing is routed.
        unsafe { *out = 0 };
    }
    route("token getter", (), |dispatcher| unsafe {
        dispatcher.token_read_raw(server_id, out, len)
    });
}

/// # Safety
/// Both pointers must be null or valid C strings for the duration of the call.
pub unsafe extern "C" fn bridge_token_write(server_id: *const c_char, token: *const c_char) {
    route("token setter", (), |dispatcher| unsafe {
        dispatcher.token_write_raw(server_id, token)
    });
}

pub unsafe extern "C" fn bridge_proxy_fd(fd: c_int) {
    route("proxy fd callback", (), |dispatcher| dispatcher.proxy_descriptor(fd));
}

pub unsafe extern "C" fn bridge_proxy_ready() {
    route("proxy ready callback", (), |dispatcher| dispatcher.proxy_ready());
}

#[cfg(test)]
pub(crate) mod tests;
