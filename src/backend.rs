//! The native backend as seen from the bridge.

use crate::config::RegisterOptions;
use crate::error::BridgeResult;
use crate::ffi::{
    BackendVTable, ProxyFdFn, ProxyReadyFn, StateCallbackFn, TokenReadFn, TokenWriteFn,
};
use crate::ownership::{self, StringRelease};
use std::ffi::{c_char, c_int, CString};
use std::ptr;

/// Arguments of `StartProxyguard` other than the cookie and callbacks.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProxyGuardRequest {
    pub listen: String,
    pub tcp_source_port: i32,
    pub peer: String,
}

/// Entry points of the backend. Error-returning calls follow the ownership
/// protocol: the implementation converts and releases the backend's error
/// string before returning.
pub trait Backend: StringRelease {
    fn register(
        &self,
        options: &RegisterOptions,
        state_callback: StateCallbackFn,
    ) -> BridgeResult<()>;
    fn deregister(&self) -> BridgeResult<()>;
    fn set_token_handler(&self, read: TokenReadFn, write: TokenWriteFn) -> BridgeResult<()>;
    fn cookie_new(&self) -> usize;
    fn cookie_delete(&self, cookie: usize);
    fn cookie_reply(&self, cookie: usize, data: &str) -> BridgeResult<()>;
    fn cookie_cancel(&self, cookie: usize) -> BridgeResult<()>;
    /// Blocks for as long as the proxy runs; cancel the cookie to stop it.
    fn start_proxy_guard(
        &self,
        cookie: usize,
        request: &ProxyGuardRequest,
        proxy_fd: ProxyFdFn,
        proxy_ready: ProxyReadyFn,
    ) -> BridgeResult<()>;
}

/// Backend reached through a table of C function pointers.
pub struct NativeBackend {
    vtable: BackendVTable,
}

impl NativeBackend {
    pub fn new(vtable: BackendVTable) -> Self {
        Self { vtable }
    }

    /// Backend resolved from the symbols of the linked backend library.
    #[cfg(feature = "link-backend")]
    pub fn linked() -> Self {
        Self::new(linked::vtable())
    }

    fn finish(&self, error: *mut c_char) -> BridgeResult<()> {
        unsafe { ownership::take_error(error, self) }
    }
}

impl StringRelease for NativeBackend {
    unsafe fn release(&self, value: *mut c_char) {
        unsafe { (self.vtable.free_string)(value) };
    }
}

impl Backend for NativeBackend {
    fn register(
        &self,
        options: &RegisterOptions,
        state_callback: StateCallbackFn,
    ) -> BridgeResult<()> {
        let name = ownership::to_c_string(&options.name, "name")?;
        let version = ownership::to_c_string(&options.version, "version")?;
        let config_dir = options
            .config_dir
            .as_ref()
            .map(|dir| ownership::to_c_string(&dir.to_string_lossy(), "config directory"))
            .transpose()?;
        let config_ptr = config_dir.as_ref().map_or(ptr::null(), |dir| dir.as_ptr());
        let error = unsafe {
            (self.vtable.register)(
                name.as_ptr(),
                version.as_ptr(),
                config_ptr,
                state_callback,
                c_int::from(options.debug),
            )
        };
        self.finish(error)
    }

    fn deregister(&self) -> BridgeResult<()> {
        let error = unsafe { (self.vtable.deregister)() };
        self.finish(error)
    }

    fn set_token_handler(&self, read: TokenReadFn, write: TokenWriteFn) -> BridgeResult<()> {
        let error = unsafe { (self.vtable.set_token_handler)(read, write) };
        self.finish(error)
    }

    fn cookie_new(&self) -> usize {
        unsafe { (self.vtable.cookie_new)() }
    }

    fn cookie_delete(&self, cookie: usize) {
        unsafe { (self.vtable.cookie_delete)(cookie) };
    }

    fn cookie_reply(&self, cookie: usize, data: &str) -> BridgeResult<()> {
        let data: CString = ownership::to_c_string(data, "cookie reply")?;
        let error = unsafe { (self.vtable.cookie_reply)(cookie, data.as_ptr()) };
        self.finish(error)
    }

    fn cookie_cancel(&self, cookie: usize) -> BridgeResult<()> {
        let error = unsafe { (self.vtable.cookie_cancel)(cookie) };
        self.finish(error)
    }

    fn start_proxy_guard(
        &self,
        cookie: usize,
        request: &ProxyGuardRequest,
        proxy_fd: ProxyFdFn,
        proxy_ready: ProxyReadyFn,
    ) -> BridgeResult<()> {
        let listen = ownership::to_c_string(&request.listen, "listen")?;
        let peer = ownership::to_c_string(&request.peer, "peer")?;
        let error = unsafe {
            (self.vtable.start_proxy_guard)(
                cookie,
                listen.as_ptr(),
                request.tcp_source_port,
                peer.as_ptr(),
                proxy_fd,
                proxy_ready,
            )
        };
        self.finish(error)
    }
}

#[cfg(feature = "link-backend")]
mod linked {
    use crate::ffi::{
        BackendVTable, ProxyFdFn, ProxyReadyFn, StateCallbackFn, TokenReadFn, TokenWriteFn,
    };
    use std::ffi::{c_char, c_int};

    extern "C" {
        fn Register(
            name: *const c_char,
            version: *const c_char,
            config_directory: *const c_char,
            state_callback: StateCallbackFn,
            debug: c_int,
        ) -> *mut c_char;
        fn Deregister() -> *mut c_char;
        fn SetTokenHandler(read: TokenReadFn, write: TokenWriteFn) -> *mut c_char;
        fn CookieNew() -> usize;
        fn CookieDelete(cookie: usize);
        fn CookieReply(cookie: usize, data: *const c_char) -> *mut c_char;
        fn CookieCancel(cookie: usize) -> *mut c_char;
        fn StartProxyguard(
            cookie: usize,
            listen: *const c_char,
            tcp_source_port: c_int,
            peer: *const c_char,
            proxy_fd: ProxyFdFn,
            proxy_ready: ProxyReadyFn,
        ) -> *mut c_char;
        fn FreeString(value: *mut c_char);
    }

    pub(super) fn vtable() -> BackendVTable {
        BackendVTable {
            register: Register,
            deregister: Deregister,
            set_token_handler: SetTokenHandler,
            cookie_new: CookieNew,
            cookie_delete: CookieDelete,
            cookie_reply: CookieReply,
            cookie_cancel: CookieCancel,
            start_proxy_guard: StartProxyguard,
            free_string: FreeString,
        }
    }
}
