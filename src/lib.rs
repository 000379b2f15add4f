#![deny(unsafe_op_in_unsafe_fn)]

#[cfg(feature = "android")]
mod android;
pub mod backend;
pub mod config;
pub mod cookie;
pub mod defer;
pub mod dispatch;
pub mod error;
pub mod ffi;
pub mod host;
pub mod logger;
pub mod ownership;
pub mod registry;
pub mod thread_bridge;
mod trampoline;

pub use crate::backend::{Backend, NativeBackend, ProxyGuardRequest};
pub use crate::config::RegisterOptions;
pub use crate::cookie::{Cookie, CookieBroker, CookieState};
pub use crate::dispatch::CallbackDispatcher;
pub use crate::error::{BridgeError, BridgeResult};
pub use crate::registry::{CallbackRegistry, CallbackTarget, Capabilities};
pub use crate::thread_bridge::{DirectRuntime, ManagedRuntime, ThreadBridge};

use crate::ffi::{
    BackendVTable, BridgeLogSink, BridgeRegisterOptions, HostCallbacks, HostRuntime,
};
use crate::host::{HostTarget, HostThreads};
use crate::logger::BreadcrumbFlags;
use parking_lot::Mutex;
use std::ffi::{c_char, c_int, CStr};
use std::fmt;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Serializes backend registration against teardown, so a bridge that is
/// being replaced cannot deregister its successor.
static REGISTRATION: Mutex<()> = parking_lot::const_mutex(());

/// State codes the client reacts to. Every other code is passed through to
/// the target as a plain integer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StateCode(pub i32);

impl StateCode {
    pub const INITIAL: StateCode = StateCode(1);
    /// Payload carries the authorization URL and the cookie to reply to.
    pub const OAUTH_STARTED: StateCode = StateCode(6);
    /// Payload carries the profiles to choose from and a cookie.
    pub const ASK_PROFILE: StateCode = StateCode(9);

    pub fn name(self) -> Option<&'static str> {
        match self {
            Self::INITIAL => Some("initial"),
            Self::OAUTH_STARTED => Some("oauth started"),
            Self::ASK_PROFILE => Some("ask profile"),
            _ => None,
        }
    }
}

impl fmt::Display for StateCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{name} ({})", self.0),
            None => write!(f, "state {}", self.0),
        }
    }
}

/// A live registration with the backend.
///
/// Created by [`Bridge::register`]; dropping it (or calling
/// [`Bridge::deregister`]) releases the target, deletes every cookie still
/// tracked and, unless a later bridge replaced it, deregisters from the
/// backend.
pub struct Bridge {
    backend: Arc<dyn Backend>,
    dispatcher: Arc<CallbackDispatcher>,
    cookies: CookieBroker,
    options: RegisterOptions,
    live: AtomicBool,
}

impl Bridge {
    /// Binds `target`, routes the backend's callbacks to it and registers
    /// with the backend. Any partial setup is undone on failure.
    pub fn register(
        backend: Arc<dyn Backend>,
        runtime: Arc<dyn ManagedRuntime>,
        target: Arc<dyn CallbackTarget>,
        options: RegisterOptions,
    ) -> BridgeResult<Self> {
        let _registration = REGISTRATION.lock();
        let registry = Arc::new(CallbackRegistry::new());
        registry.register(target);
        let dispatcher = Arc::new(
            CallbackDispatcher::new(
                ThreadBridge::new(runtime),
                Arc::clone(&registry),
                Arc::clone(&backend),
            )
            .with_state_payload(options.state_payload),
        );

        if let Some(previous) = trampoline::install(Arc::clone(&dispatcher)) {
            logger::warn(format!(
                "registering {} while another bridge is live; its callbacks are rerouted",
                options.name
            ));
            drop(previous);
        }

        if let Err(error) = backend.register(&options, trampoline::bridge_state_callback) {
            trampoline::clear(&dispatcher);
            registry.deregister();
            logger::error(format!("backend registration failed: {error}"));
            return Err(error);
        }

        if let Err(error) =
            backend.set_token_handler(trampoline::bridge_token_read, trampoline::bridge_token_write)
        {
            if let Err(rollback) = backend.deregister() {
                logger::warn(format!("rollback deregistration failed: {rollback}"));
            }
            trampoline::clear(&dispatcher);
            registry.deregister();
            logger::error(format!("installing the token handler failed: {error}"));
            return Err(error);
        }

        logger::info(format!(
            "registered {} {} (config dir: {})",
            options.name,
            options.version,
            options
                .config_dir
                .as_ref()
                .map_or_else(|| "none".to_owned(), |dir| dir.display().to_string())
        ));

        Ok(Self {
            cookies: CookieBroker::new(Arc::clone(&backend)),
            backend,
            dispatcher,
            options,
            live: AtomicBool::new(true),
        })
    }

    /// Swaps the callback target without touching the backend registration.
    pub fn replace_target(&self, target: Arc<dyn CallbackTarget>) -> u64 {
        self.dispatcher.registry().register(target)
    }

    pub fn cookies(&self) -> &CookieBroker {
        &self.cookies
    }

    pub fn dispatcher(&self) -> &Arc<CallbackDispatcher> {
        &self.dispatcher
    }

    pub fn options(&self) -> &RegisterOptions {
        &self.options
    }

    /// Starts the proxy guard bound to `cookie` and blocks until it stops.
    /// Cancel the cookie from another thread to stop it.
    pub fn start_proxy_guard(
        &self,
        cookie: Cookie,
        request: &ProxyGuardRequest,
    ) -> BridgeResult<()> {
        logger::breadcrumb(
            BreadcrumbFlags::COOKIE,
            format!("proxy guard {} -> {} on cookie {cookie}", request.listen, request.peer),
        );
        self.cookies.issue(cookie, |handle| {
            self.backend.start_proxy_guard(
                handle,
                request,
                trampoline::bridge_proxy_fd,
                trampoline::bridge_proxy_ready,
            )
        })
    }

    /// Deregisters from the backend. Local teardown happens even when the
    /// backend reports an error, which is returned afterwards.
    pub fn deregister(self) -> BridgeResult<()> {
        self.close()
    }

    /// Tears the bridge down while other owners may still hold it; later
    /// calls and the final drop do nothing. A bridge whose callbacks were
    /// rerouted to a newer one leaves the backend registration alone.
    pub(crate) fn close(&self) -> BridgeResult<()> {
        if !self.live.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        let _registration = REGISTRATION.lock();
        let owns_backend = trampoline::is_installed(&self.dispatcher);
        let result = if owns_backend {
            self.backend.deregister()
        } else {
            logger::info(format!(
                "{} was replaced; leaving the backend registration to its successor",
                self.options.name
            ));
            Ok(())
        };
        self.dispatcher.registry().deregister();
        trampoline::clear(&self.dispatcher);
        self.cookies.retire_all();
        match &result {
            Ok(()) if owns_backend => logger::info(format!("deregistered {}", self.options.name)),
            Ok(()) => {}
            Err(error) => logger::warn(format!("backend deregistration failed: {error}")),
        }
        result
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

fn error_string(error: &BridgeError) -> *mut c_char {
    ownership::into_bridge_string(&error.to_string())
}

fn status_string(result: BridgeResult<()>) -> *mut c_char {
    match result {
        Ok(()) => ptr::null_mut(),
        Err(error) => error_string(&error),
    }
}

fn backend_from_vtable(vtable: *const BackendVTable) -> BridgeResult<NativeBackend> {
    if let Some(vtable) = unsafe { vtable.as_ref() } {
        return Ok(NativeBackend::new(*vtable));
    }
    #[cfg(feature = "link-backend")]
    {
        Ok(NativeBackend::linked())
    }
    #[cfg(not(feature = "link-backend"))]
    {
        Err(BridgeError::InvalidArgument("backend vtable is required".into()))
    }
}

/// Registers a C host. Returns null on failure and, when `error_out` is not
/// null, stores a message to be released with [`BridgeFreeString`].
///
/// A null `vtable` selects the linked backend library when the crate is
/// built with it. A null `runtime` means every thread may call the host.
///
/// # Safety
/// Every non-null pointer must be valid for reads; the callback tables must
/// stay callable until [`BridgeDeregister`] returns.
#[no_mangle]
pub unsafe extern "C" fn BridgeRegister(
    vtable: *const BackendVTable,
    callbacks: *const HostCallbacks,
    runtime: *const HostRuntime,
    options: *const BridgeRegisterOptions,
    error_out: *mut *mut c_char,
) -> *mut Bridge {
    let outcome = (|| {
        let callbacks = unsafe { callbacks.as_ref() }
            .ok_or_else(|| BridgeError::InvalidArgument("callbacks are required".into()))?;
        let options = unsafe { options.as_ref() }
            .ok_or_else(|| BridgeError::InvalidArgument("options are required".into()))?;
        let options = unsafe { RegisterOptions::from_c(options) }?;
        let runtime = unsafe { runtime.as_ref() }.copied().unwrap_or_default();
        let threads = unsafe { HostThreads::new(runtime) }?;
        let backend = backend_from_vtable(vtable)?;
        Bridge::register(
            Arc::new(backend),
            Arc::new(threads),
            Arc::new(unsafe { HostTarget::new(*callbacks) }),
            options,
        )
    })();

    match outcome {
        Ok(bridge) => Box::into_raw(Box::new(bridge)),
        Err(error) => {
            logger::error(format!("BridgeRegister failed: {error}"));
            if let Some(slot) = unsafe { error_out.as_mut() } {
                *slot = error_string(&error);
            }
            ptr::null_mut()
        }
    }
}

/// Deregisters and frees `bridge`. Returns the backend's error, if any.
///
/// # Safety
/// `bridge` must come from [`BridgeRegister`] and not be used afterwards.
#[no_mangle]
pub unsafe extern "C" fn BridgeDeregister(bridge: *mut Bridge) -> *mut c_char {
    let Some(bridge) = NonNull::new(bridge) else {
        return ptr::null_mut();
    };
    let bridge = unsafe { Box::from_raw(bridge.as_ptr()) };
    status_string(bridge.deregister())
}

/// Returns a new cookie value, or 0 when `bridge` is null.
///
/// # Safety
/// `bridge` must be null or a live pointer from [`BridgeRegister`].
#[no_mangle]
pub unsafe extern "C" fn BridgeCookieNew(bridge: *const Bridge) -> u64 {
    unsafe { bridge.as_ref() }.map_or(0, |bridge| bridge.cookies().new_cookie().as_raw())
}

/// Tracks a cookie the backend handed out in a state payload. Returns 0
/// when `bridge` is null or the handle's cookie was already deleted.
///
/// # Safety
/// `bridge` must be null or a live pointer from [`BridgeRegister`].
#[no_mangle]
pub unsafe extern "C" fn BridgeCookieAdopt(bridge: *const Bridge, backend_handle: usize) -> u64 {
    let Some(bridge) = (unsafe { bridge.as_ref() }) else {
        return 0;
    };
    bridge
        .cookies()
        .adopt(backend_handle)
        .map_or(0, Cookie::as_raw)
}

/// # Safety
/// `bridge` must be null or a live pointer from [`BridgeRegister`]; `data`
/// must be null or a valid C string.
#[no_mangle]
pub unsafe extern "C" fn BridgeCookieReply(
    bridge: *const Bridge,
    cookie: u64,
    data: *const c_char,
) -> *mut c_char {
    let Some(bridge) = (unsafe { bridge.as_ref() }) else {
        return error_string(&BridgeError::InvalidArgument("bridge is null".into()));
    };
    let data = if data.is_null() {
        String::new()
    } else {
        unsafe { CStr::from_ptr(data) }.to_string_lossy().into_owned()
    };
    status_string(bridge.cookies().reply(Cookie::from_raw(cookie), &data))
}

/// # Safety
/// `bridge` must be null or a live pointer from [`BridgeRegister`].
#[no_mangle]
pub unsafe extern "C" fn BridgeCookieCancel(bridge: *const Bridge, cookie: u64) -> *mut c_char {
    let Some(bridge) = (unsafe { bridge.as_ref() }) else {
        return error_string(&BridgeError::InvalidArgument("bridge is null".into()));
    };
    status_string(bridge.cookies().cancel(Cookie::from_raw(cookie)))
}

/// # Safety
/// `bridge` must be null or a live pointer from [`BridgeRegister`].
#[no_mangle]
pub unsafe extern "C" fn BridgeCookieDelete(bridge: *const Bridge, cookie: u64) -> *mut c_char {
    let Some(bridge) = (unsafe { bridge.as_ref() }) else {
        return error_string(&BridgeError::InvalidArgument("bridge is null".into()));
    };
    status_string(bridge.cookies().delete(Cookie::from_raw(cookie)))
}

/// Runs the proxy guard on `cookie`; blocks until it stops.
///
/// # Safety
/// `bridge` must be a live pointer from [`BridgeRegister`]; `listen` and
/// `peer` must be valid C strings.
#[no_mangle]
pub unsafe extern "C" fn BridgeStartProxyGuard(
    bridge: *const Bridge,
    cookie: u64,
    listen: *const c_char,
    tcp_source_port: c_int,
    peer: *const c_char,
) -> *mut c_char {
    let Some(bridge) = (unsafe { bridge.as_ref() }) else {
        return error_string(&BridgeError::InvalidArgument("bridge is null".into()));
    };
    let (Some(listen), Some(peer)) = (unsafe { ownership::borrowed_string(listen) }, unsafe {
        ownership::borrowed_string(peer)
    }) else {
        return error_string(&BridgeError::InvalidArgument("listen and peer are required".into()));
    };
    let request = ProxyGuardRequest {
        listen,
        tcp_source_port,
        peer,
    };
    status_string(bridge.start_proxy_guard(Cookie::from_raw(cookie), &request))
}

/// Releases a string returned by any `Bridge*` function.
///
/// # Safety
/// `value` must be null or a string returned by this library, released once.
#[no_mangle]
pub unsafe extern "C" fn BridgeFreeString(value: *mut c_char) {
    unsafe { ownership::free_bridge_string(value) };
}

#[no_mangle]
pub unsafe extern "C" fn BridgeSetLogSink(
    sink: *const BridgeLogSink,
    level: *const c_char,
) -> bool {
    let sink_ref = unsafe { sink.as_ref() };
    let level_str = if level.is_null() {
        None
    } else {
        unsafe { CStr::from_ptr(level) }.to_str().ok()
    };
    logger::install_sink(sink_ref, level_str).is_ok()
}

#[no_mangle]
pub extern "C" fn BridgeSetBreadcrumbMask(mask: u32) {
    logger::set_breadcrumb_mask(mask);
}

#[cfg(test)]
mod tests;
