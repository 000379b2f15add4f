use super::*;
use crate::backend::tests::{BackendCall, MockBackend};
use crate::ffi::{StateCallbackFn, TokenReadFn, TokenWriteFn};
use crate::registry::tests::{Call, RecordingTarget};
use crate::thread_bridge::tests::FakeRuntime;
use crate::trampoline::tests::lock_slot;
use parking_lot::Mutex;
use std::ffi::{c_void, CString};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

fn options() -> RegisterOptions {
    RegisterOptions::new("org.eduvpn.app.android", "3.1.0").with_config_dir("/data/eduvpn")
}

fn register(backend: &Arc<MockBackend>, target: &Arc<RecordingTarget>) -> BridgeResult<Bridge> {
    Bridge::register(
        backend.clone(),
        Arc::new(FakeRuntime::default()),
        target.clone(),
        options(),
    )
}

#[test]
fn state_code_names() {
    assert_eq!(StateCode::OAUTH_STARTED.to_string(), "oauth started (6)");
    assert_eq!(StateCode(42).to_string(), "state 42");
    assert_eq!(StateCode::ASK_PROFILE.name(), Some("ask profile"));
}

#[test]
fn registration_routes_backend_callbacks_to_the_target() {
    let _guard = lock_slot();
    let backend = Arc::new(MockBackend::default());
    let target = Arc::new(RecordingTarget::new());
    let bridge = register(&backend, &target).unwrap();

    assert_eq!(
        backend.calls(),
        vec![BackendCall::Register(options()), BackendCall::SetTokenHandler]
    );

    let (handled, payload) = backend.emit_state(1, 6, Some("{\"url\":\"https://idp\"}"));
    assert_eq!(handled, 1);
    assert_eq!(backend.strings.release_count(payload), 1);

    *target.token.lock() = Some("token-json".into());
    let buffer = backend.read_token("https://vpn.example/", 64);
    assert_eq!(&buffer[..11], b"token-json\0");
    backend.write_token("https://vpn.example/", "next");

    assert_eq!(
        target.calls(),
        vec![
            Call::NewState(6, Some("{\"url\":\"https://idp\"}".into())),
            Call::GetToken("https://vpn.example/".into()),
            Call::SetToken("https://vpn.example/".into(), Some("next".into())),
        ]
    );
    let threads = bridge.dispatcher().threads().stats();
    assert_eq!(threads.attaches, threads.detaches);

    bridge.deregister().unwrap();
}

#[test]
fn backend_workers_dispatch_concurrently() {
    let _guard = lock_slot();
    let backend = Arc::new(MockBackend::default());
    let target = Arc::new(RecordingTarget::new());
    let bridge = register(&backend, &target).unwrap();

    let workers: Vec<_> = (0..6)
        .map(|worker| {
            let backend = Arc::clone(&backend);
            thread::spawn(move || {
                for index in 0..50 {
                    let payload = format!("w{worker}");
                    let (handled, _) = backend.emit_state(index, index + 1, Some(&payload));
                    assert_eq!(handled, 1);
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    assert_eq!(target.calls().len(), 300);
    assert_eq!(backend.strings.total_releases(), 300);
    assert_eq!(backend.strings.outstanding(), 0);
    bridge.deregister().unwrap();
}

#[test]
fn failed_backend_registration_leaves_nothing_behind() {
    let _guard = lock_slot();
    let backend = Arc::new(MockBackend::default());
    *backend.register_error.lock() = Some("invalid config directory".into());
    let target = Arc::new(RecordingTarget::new());
    let drops = target.drop_counter();

    let error = register(&backend, &target).err().unwrap();
    assert_eq!(error, BridgeError::BackendCallFailed("invalid config directory".into()));
    assert!(trampoline::current().is_none());
    drop(target);
    assert_eq!(drops.load(Ordering::SeqCst), 1);
}

#[test]
fn failed_token_handler_rolls_back_registration() {
    let _guard = lock_slot();
    let backend = Arc::new(MockBackend::default());
    *backend.token_handler_error.lock() = Some("already set".into());
    let target = Arc::new(RecordingTarget::new());

    assert!(register(&backend, &target).is_err());
    assert_eq!(backend.calls().last(), Some(&BackendCall::Deregister));
    assert!(trampoline::current().is_none());
}

#[test]
fn registering_without_config_directory_succeeds() {
    let _guard = lock_slot();
    let backend = Arc::new(MockBackend::default());
    let bridge = Bridge::register(
        backend.clone(),
        Arc::new(DirectRuntime),
        Arc::new(RecordingTarget::new()),
        RegisterOptions::new("client", "1"),
    )
    .unwrap();
    assert_eq!(bridge.options().config_dir, None);
}

#[test]
fn deregister_stops_delivery_and_retires_cookies() {
    let _guard = lock_slot();
    let backend = Arc::new(MockBackend::default());
    let target = Arc::new(RecordingTarget::new());
    let drops = target.drop_counter();
    let bridge = register(&backend, &target).unwrap();
    let cookie = bridge.cookies().new_cookie();
    let handle = bridge.cookies().backend_handle(cookie).unwrap();
    let dispatcher = Arc::clone(bridge.dispatcher());

    bridge.deregister().unwrap();
    assert!(backend.calls().contains(&BackendCall::CookieDelete(handle)));
    assert!(trampoline::current().is_none());
    assert!(!dispatcher.state_transition(1, 2, None));
    drop(target);
    assert_eq!(drops.load(Ordering::SeqCst), 1);
}

#[test]
fn dropping_the_bridge_deregisters() {
    let _guard = lock_slot();
    let backend = Arc::new(MockBackend::default());
    let target = Arc::new(RecordingTarget::new());
    drop(register(&backend, &target).unwrap());
    assert_eq!(
        backend.calls().iter().filter(|call| **call == BackendCall::Deregister).count(),
        1
    );
    assert!(trampoline::current().is_none());
}

fn deregister_count(backend: &MockBackend) -> usize {
    backend
        .calls()
        .iter()
        .filter(|call| **call == BackendCall::Deregister)
        .count()
}

#[test]
fn dropping_a_replaced_bridge_keeps_its_successor_registered() {
    let _guard = lock_slot();
    let backend = Arc::new(MockBackend::default());
    let first_target = Arc::new(RecordingTarget::new());
    let first = register(&backend, &first_target).unwrap();
    let second_target = Arc::new(RecordingTarget::new());
    let second = register(&backend, &second_target).unwrap();

    drop(first);
    assert_eq!(deregister_count(&backend), 0);
    let (handled, _) = backend.emit_state(1, 9, None);
    assert_eq!(handled, 1);
    assert!(first_target.calls().is_empty());
    assert_eq!(second_target.calls(), vec![Call::NewState(9, None)]);

    second.deregister().unwrap();
    assert_eq!(deregister_count(&backend), 1);
    assert!(trampoline::current().is_none());
}

#[test]
fn closing_a_shared_bridge_tears_down_once() {
    let _guard = lock_slot();
    let backend = Arc::new(MockBackend::default());
    let bridge = Arc::new(register(&backend, &Arc::new(RecordingTarget::new())).unwrap());
    let held = Arc::clone(&bridge);

    bridge.close().unwrap();
    assert_eq!(deregister_count(&backend), 1);
    assert!(trampoline::current().is_none());

    let successor = register(&backend, &Arc::new(RecordingTarget::new())).unwrap();
    drop(bridge);
    drop(held);
    assert_eq!(deregister_count(&backend), 1);
    assert!(trampoline::is_installed(successor.dispatcher()));
}

#[test]
fn backend_handle_cannot_be_answered_after_delete() {
    let _guard = lock_slot();
    let backend = Arc::new(MockBackend::default());
    let bridge = register(&backend, &Arc::new(RecordingTarget::new())).unwrap();
    let raw: *const Bridge = &bridge;

    let cookie = unsafe { BridgeCookieAdopt(raw, 77) };
    assert_ne!(cookie, 0);
    let ok = CString::new("ok").unwrap();
    assert!(unsafe { BridgeCookieReply(raw, cookie, ok.as_ptr()) }.is_null());
    assert!(unsafe { BridgeCookieDelete(raw, cookie) }.is_null());

    assert_eq!(unsafe { BridgeCookieAdopt(raw, 77) }, 0);
    let again = CString::new("again").unwrap();
    for error in [
        unsafe { BridgeCookieReply(raw, cookie, again.as_ptr()) },
        unsafe { BridgeCookieCancel(raw, cookie) },
    ] {
        assert!(!error.is_null());
        unsafe { BridgeFreeString(error) };
    }

    let forwarded: Vec<_> = backend
        .calls()
        .into_iter()
        .filter(|call| matches!(call, BackendCall::CookieReply(..) | BackendCall::CookieCancel(_)))
        .collect();
    assert_eq!(forwarded, vec![BackendCall::CookieReply(77, "ok".into())]);
}

#[test]
fn replacing_the_target_redirects_dispatch() {
    let _guard = lock_slot();
    let backend = Arc::new(MockBackend::default());
    let first = Arc::new(RecordingTarget::new());
    let bridge = register(&backend, &first).unwrap();

    let second = Arc::new(RecordingTarget::new());
    bridge.replace_target(second.clone());
    backend.emit_state(1, 9, None);

    assert!(first.calls().is_empty());
    assert_eq!(second.calls(), vec![Call::NewState(9, None)]);
}

#[test]
fn proxy_guard_reports_through_the_target() {
    let _guard = lock_slot();
    let backend = Arc::new(MockBackend::default());
    let target = Arc::new(RecordingTarget::new());
    let bridge = register(&backend, &target).unwrap();
    let cookie = bridge.cookies().new_cookie();
    let request = ProxyGuardRequest {
        listen: "127.0.0.1:1337".into(),
        tcp_source_port: 40123,
        peer: "https://proxy.example".into(),
    };

    bridge.start_proxy_guard(cookie, &request).unwrap();
    assert_eq!(target.calls(), vec![Call::ProxyFd(40123), Call::ProxyReady]);
    assert_eq!(bridge.cookies().state(cookie), Some(CookieState::AwaitingReply));
    assert!(bridge.start_proxy_guard(cookie, &request).is_err());

    bridge.cookies().cancel(cookie).unwrap();
    bridge.cookies().delete(cookie).unwrap();
}

// C ABI over a table of C test functions. Only one test drives it, so the
// statics below are not shared.

static C_STATE_CALLBACK: Mutex<Option<StateCallbackFn>> = parking_lot::const_mutex(None);
static C_FREED: AtomicUsize = AtomicUsize::new(0);

unsafe extern "C" fn c_register(
    _name: *const c_char,
    _version: *const c_char,
    _config_directory: *const c_char,
    state_callback: StateCallbackFn,
    _debug: c_int,
) -> *mut c_char {
    *C_STATE_CALLBACK.lock() = Some(state_callback);
    ptr::null_mut()
}

unsafe extern "C" fn c_deregister() -> *mut c_char {
    *C_STATE_CALLBACK.lock() = None;
    ptr::null_mut()
}

unsafe extern "C" fn c_set_token_handler(_read: TokenReadFn, _write: TokenWriteFn) -> *mut c_char {
    ptr::null_mut()
}

unsafe extern "C" fn c_cookie_new() -> usize {
    77
}

unsafe extern "C" fn c_cookie_delete(_cookie: usize) {}

unsafe extern "C" fn c_cookie_reply(_cookie: usize, _data: *const c_char) -> *mut c_char {
    CString::new("reply rejected").unwrap().into_raw()
}

unsafe extern "C" fn c_cookie_cancel(_cookie: usize) -> *mut c_char {
    ptr::null_mut()
}

unsafe extern "C" fn c_start_proxy_guard(
    _cookie: usize,
    _listen: *const c_char,
    _tcp_source_port: c_int,
    _peer: *const c_char,
    _proxy_fd: crate::ffi::ProxyFdFn,
    _proxy_ready: crate::ffi::ProxyReadyFn,
) -> *mut c_char {
    ptr::null_mut()
}

unsafe extern "C" fn c_free_string(value: *mut c_char) {
    drop(unsafe { CString::from_raw(value) });
    C_FREED.fetch_add(1, Ordering::SeqCst);
}

unsafe extern "C" fn host_on_new_state(
    code: c_int,
    _data: *const c_char,
    context: *mut c_void,
) -> bool {
    let seen = unsafe { &*context.cast::<AtomicUsize>() };
    seen.fetch_add(1, Ordering::SeqCst);
    code == StateCode::ASK_PROFILE.0
}

fn c_vtable() -> BackendVTable {
    BackendVTable {
        register: c_register,
        deregister: c_deregister,
        set_token_handler: c_set_token_handler,
        cookie_new: c_cookie_new,
        cookie_delete: c_cookie_delete,
        cookie_reply: c_cookie_reply,
        cookie_cancel: c_cookie_cancel,
        start_proxy_guard: c_start_proxy_guard,
        free_string: c_free_string,
    }
}

#[test]
fn c_host_round_trip() {
    let _guard = lock_slot();
    let seen = AtomicUsize::new(0);
    let callbacks = HostCallbacks {
        on_new_state: Some(host_on_new_state),
        get_token: None,
        set_token: None,
        on_proxy_file_descriptor: None,
        on_proxy_guard_ready: None,
        release_string: None,
        context: &seen as *const AtomicUsize as *mut c_void,
    };
    let name = CString::new("c-host").unwrap();
    let options = BridgeRegisterOptions {
        name: name.as_ptr(),
        ..BridgeRegisterOptions::default()
    };
    let vtable = c_vtable();

    let bridge = unsafe {
        BridgeRegister(&vtable, &callbacks, ptr::null(), &options, ptr::null_mut())
    };
    assert!(!bridge.is_null());

    let state_callback = C_STATE_CALLBACK.lock().expect("registered");
    let payload = CString::new("{\"profiles\":{}}").unwrap().into_raw();
    let handled = unsafe { state_callback(1, StateCode::ASK_PROFILE.0, payload.cast()) };
    assert_eq!(handled, 1);
    assert_eq!(seen.load(Ordering::SeqCst), 1);
    assert_eq!(C_FREED.load(Ordering::SeqCst), 1);

    let cookie = unsafe { BridgeCookieAdopt(bridge, 77) };
    assert_ne!(cookie, 0);
    assert_eq!(unsafe { BridgeCookieAdopt(bridge, 77) }, cookie);
    let data = CString::new("profile-1").unwrap();
    let error = unsafe { BridgeCookieReply(bridge, cookie, data.as_ptr()) };
    assert!(!error.is_null());
    assert_eq!(
        unsafe { CStr::from_ptr(error) }.to_str().unwrap(),
        "backend call failed: reply rejected"
    );
    unsafe { BridgeFreeString(error) };
    // A rejected reply leaves the cookie open for cancellation.
    assert!(unsafe { BridgeCookieCancel(bridge, cookie) }.is_null());
    assert!(unsafe { BridgeCookieDelete(bridge, cookie) }.is_null());
    let again = unsafe { BridgeCookieDelete(bridge, cookie) };
    assert!(!again.is_null());
    unsafe { BridgeFreeString(again) };

    assert!(unsafe { BridgeDeregister(bridge) }.is_null());
    assert!(C_STATE_CALLBACK.lock().is_none());
}

#[test]
fn c_register_reports_missing_arguments() {
    let _guard = lock_slot();
    let vtable = c_vtable();
    let mut error: *mut c_char = ptr::null_mut();
    let bridge =
        unsafe { BridgeRegister(&vtable, ptr::null(), ptr::null(), ptr::null(), &mut error) };
    assert!(bridge.is_null());
    assert!(!error.is_null());
    let message = unsafe { CStr::from_ptr(error) }.to_string_lossy().into_owned();
    assert!(message.contains("callbacks are required"), "{message}");
    unsafe { BridgeFreeString(error) };
}

#[test]
fn c_calls_on_a_null_bridge_fail_cleanly() {
    assert_eq!(unsafe { BridgeCookieNew(ptr::null()) }, 0);
    let error = unsafe { BridgeCookieCancel(ptr::null(), 1) };
    assert!(!error.is_null());
    unsafe { BridgeFreeString(error) };
    assert!(unsafe { BridgeDeregister(ptr::null_mut()) }.is_null());
}

unsafe extern "C" fn host_attach(_context: *mut c_void) -> c_int {
    0
}

unsafe extern "C" fn host_detach(_context: *mut c_void) {}

#[test]
fn c_register_rejects_attach_hooks_without_is_attached() {
    let _guard = lock_slot();
    let callbacks = HostCallbacks {
        on_new_state: Some(host_on_new_state),
        get_token: None,
        set_token: None,
        on_proxy_file_descriptor: None,
        on_proxy_guard_ready: None,
        release_string: None,
        context: ptr::null_mut(),
    };
    let runtime = HostRuntime {
        is_attached: None,
        attach: Some(host_attach),
        detach: Some(host_detach),
        context: ptr::null_mut(),
    };
    let name = CString::new("c-host").unwrap();
    let options = BridgeRegisterOptions {
        name: name.as_ptr(),
        ..BridgeRegisterOptions::default()
    };
    let vtable = c_vtable();
    let mut error: *mut c_char = ptr::null_mut();

    let bridge = unsafe { BridgeRegister(&vtable, &callbacks, &runtime, &options, &mut error) };
    assert!(bridge.is_null());
    let message = unsafe { CStr::from_ptr(error) }.to_string_lossy().into_owned();
    assert!(message.contains("is_attached"), "{message}");
    unsafe { BridgeFreeString(error) };
    assert!(trampoline::current().is_none());
}
