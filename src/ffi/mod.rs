//! `#[repr(C)]` mirrors of everything that crosses the C boundary: the
//! callback signatures the backend invokes, the backend's own entry points,
//! and the structs a C host fills in to register with the bridge.

use std::ffi::{c_char, c_int, c_void};
use std::ptr;

/// `int (*StateCB)(int oldstate, int newstate, void* data)`. Non-zero means
/// the managed side handled the transition.
pub type StateCallbackFn =
    unsafe extern "C" fn(old_state: c_int, new_state: c_int, data: *mut c_void) -> c_int;
/// Fills `out` (capacity `len` bytes, including the terminator) with the token.
pub type TokenReadFn =
    unsafe extern "C" fn(server_id: *const c_char, out: *mut c_char, len: usize);
pub type TokenWriteFn = unsafe extern "C" fn(server_id: *const c_char, token: *const c_char);
pub type ProxyFdFn = unsafe extern "C" fn(fd: c_int);
pub type ProxyReadyFn = unsafe extern "C" fn();

/// Entry points of the native backend. Every `*mut c_char` return value is
/// owned by the caller and must go back through `free_string`.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct BackendVTable {
    pub register: unsafe extern "C" fn(
        name: *const c_char,
        version: *const c_char,
        config_directory: *const c_char,
        state_callback: StateCallbackFn,
        debug: c_int,
    ) -> *mut c_char,
    pub deregister: unsafe extern "C" fn() -> *mut c_char,
    pub set_token_handler:
        unsafe extern "C" fn(read: TokenReadFn, write: TokenWriteFn) -> *mut c_char,
    pub cookie_new: unsafe extern "C" fn() -> usize,
    pub cookie_delete: unsafe extern "C" fn(cookie: usize),
    pub cookie_reply:
        unsafe extern "C" fn(cookie: usize, data: *const c_char) -> *mut c_char,
    pub cookie_cancel: unsafe extern "C" fn(cookie: usize) -> *mut c_char,
    pub start_proxy_guard: unsafe extern "C" fn(
        cookie: usize,
        listen: *const c_char,
        tcp_source_port: c_int,
        peer: *const c_char,
        proxy_fd: ProxyFdFn,
        proxy_ready: ProxyReadyFn,
    ) -> *mut c_char,
    pub free_string: unsafe extern "C" fn(value: *mut c_char),
}

/// Managed callback capability set expressed as C function pointers. A null
/// entry means the host does not implement that callback.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct HostCallbacks {
    pub on_new_state: Option<
        unsafe extern "C" fn(code: c_int, data: *const c_char, context: *mut c_void) -> bool,
    >,
    /// Returns a token allocated by the host or null. The bridge copies it and
    /// hands it back through `release_string`.
    pub get_token:
        Option<unsafe extern "C" fn(server_id: *const c_char, context: *mut c_void) -> *mut c_char>,
    pub set_token: Option<
        unsafe extern "C" fn(server_id: *const c_char, token: *const c_char, context: *mut c_void),
    >,
    pub on_proxy_file_descriptor: Option<unsafe extern "C" fn(fd: c_int, context: *mut c_void)>,
    pub on_proxy_guard_ready: Option<unsafe extern "C" fn(context: *mut c_void)>,
    pub release_string: Option<unsafe extern "C" fn(value: *mut c_char, context: *mut c_void)>,
    pub context: *mut c_void,
}

unsafe impl Send for HostCallbacks {}
unsafe impl Sync for HostCallbacks {}

/// Thread association hooks of the host runtime. When all three are null the
/// host is treated as runtime-free and every thread counts as attached.
/// `attach` or `detach` without `is_attached` is rejected at registration.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct HostRuntime {
    pub is_attached: Option<unsafe extern "C" fn(context: *mut c_void) -> bool>,
    /// Returns 0 on success.
    pub attach: Option<unsafe extern "C" fn(context: *mut c_void) -> c_int>,
    pub detach: Option<unsafe extern "C" fn(context: *mut c_void)>,
    pub context: *mut c_void,
}

unsafe impl Send for HostRuntime {}
unsafe impl Sync for HostRuntime {}

impl Default for HostRuntime {
    fn default() -> Self {
        Self {
            is_attached: None,
            attach: None,
            detach: None,
            context: ptr::null_mut(),
        }
    }
}

/// Mirror of `RegisterOptions`. `config_directory` may be null.
#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub struct BridgeRegisterOptions {
    pub name: *const c_char,
    pub version: *const c_char,
    pub config_directory: *const c_char,
    pub debug: bool,
    /// When true the backend releases the state payload itself after the
    /// callback returns and the bridge must not.
    pub state_payload_released_by_backend: bool,
}

impl Default for BridgeRegisterOptions {
    fn default() -> Self {
        Self {
            name: ptr::null(),
            version: ptr::null(),
            config_directory: ptr::null(),
            debug: false,
            state_payload_released_by_backend: false,
        }
    }
}

#[repr(C)]
pub struct BridgeLogSink {
    pub log: Option<
        unsafe extern "C" fn(
            level: *const c_char,
            message: *const c_char,
            breadcrumbs: u32,
            context: *mut c_void,
        ),
    >,
    pub context: *mut c_void,
    pub enabled_breadcrumbs: u32,
}
