//! Drives the bridge through its C ABI against an in-process simulated
//! backend. Each backend worker walks through an OAuth and profile selection
//! flow, so every callback path is exercised from foreign threads.

use backend_bridge::ffi::{
    BackendVTable, BridgeLogSink, BridgeRegisterOptions, HostCallbacks, ProxyFdFn, ProxyReadyFn,
    StateCallbackFn, TokenReadFn, TokenWriteFn,
};
use backend_bridge::{
    Bridge, BridgeCookieAdopt, BridgeCookieDelete, BridgeCookieReply, BridgeDeregister,
    BridgeFreeString, BridgeRegister, BridgeSetBreadcrumbMask, BridgeSetLogSink, StateCode,
};
use crossbeam_channel::{Receiver, Sender};
use libc::{self, c_char, c_int, c_void};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::env;
use std::ffi::{CStr, CString};
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

struct Settings {
    workers: usize,
    debug: bool,
}

impl Settings {
    fn parse() -> anyhow::Result<Self> {
        let mut workers = 4;
        let mut debug = false;
        let mut args = env::args().skip(1);
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--workers" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow::anyhow!("--workers requires a value"))?;
                    workers = value.parse().map_err(|_| anyhow::anyhow!("invalid worker count"))?;
                }
                "--debug" => debug = true,
                _ => {
                    anyhow::bail!(
                        "unknown argument '{}'. Supported flags: --workers <count>, --debug",
                        arg
                    );
                }
            }
        }
        Ok(Self { workers, debug })
    }
}

// Simulated backend. Strings it hands out come from strdup and go back
// through FreeString, like the real library.

#[derive(Default)]
struct SimBackend {
    state_callback: Option<StateCallbackFn>,
    token_handlers: Option<(TokenReadFn, TokenWriteFn)>,
    waiting: FxHashMap<usize, Sender<Option<String>>>,
}

static SIM: Lazy<Mutex<SimBackend>> = Lazy::new(|| Mutex::new(SimBackend::default()));
static NEXT_COOKIE: AtomicUsize = AtomicUsize::new(1);
static SIM_FREED: AtomicUsize = AtomicUsize::new(0);

fn backend_string(value: &str) -> *mut c_char {
    let value = CString::new(value).unwrap_or_default();
    unsafe { libc::strdup(value.as_ptr()) }
}

fn read_c(value: *const c_char) -> String {
    if value.is_null() {
        return String::new();
    }
    unsafe { CStr::from_ptr(value) }.to_string_lossy().into_owned()
}

unsafe extern "C" fn sim_register(
    name: *const c_char,
    version: *const c_char,
    config_directory: *const c_char,
    state_callback: StateCallbackFn,
    debug: c_int,
) -> *mut c_char {
    println!(
        "[backend] register {} {} (config dir {:?}, debug {debug})",
        read_c(name),
        read_c(version),
        (!config_directory.is_null()).then(|| read_c(config_directory))
    );
    SIM.lock().state_callback = Some(state_callback);
    ptr::null_mut()
}

unsafe extern "C" fn sim_deregister() -> *mut c_char {
    let mut sim = SIM.lock();
    if sim.state_callback.take().is_none() {
        return backend_string("not registered");
    }
    sim.token_handlers = None;
    ptr::null_mut()
}

unsafe extern "C" fn sim_set_token_handler(read: TokenReadFn, write: TokenWriteFn) -> *mut c_char {
    SIM.lock().token_handlers = Some((read, write));
    ptr::null_mut()
}

unsafe extern "C" fn sim_cookie_new() -> usize {
    NEXT_COOKIE.fetch_add(1, Ordering::Relaxed)
}

unsafe extern "C" fn sim_cookie_delete(cookie: usize) {
    SIM.lock().waiting.remove(&cookie);
}

unsafe extern "C" fn sim_cookie_reply(cookie: usize, data: *const c_char) -> *mut c_char {
    match SIM.lock().waiting.remove(&cookie) {
        Some(waiter) => {
            let _ = waiter.send(Some(read_c(data)));
            ptr::null_mut()
        }
        None => backend_string("cookie is not waiting for a reply"),
    }
}

unsafe extern "C" fn sim_cookie_cancel(cookie: usize) -> *mut c_char {
    if let Some(waiter) = SIM.lock().waiting.remove(&cookie) {
        let _ = waiter.send(None);
    }
    ptr::null_mut()
}

unsafe extern "C" fn sim_start_proxy_guard(
    _cookie: usize,
    _listen: *const c_char,
    tcp_source_port: c_int,
    _peer: *const c_char,
    proxy_fd: ProxyFdFn,
    proxy_ready: ProxyReadyFn,
) -> *mut c_char {
    unsafe {
        proxy_fd(tcp_source_port);
        proxy_ready();
    }
    ptr::null_mut()
}

unsafe extern "C" fn sim_free_string(value: *mut c_char) {
    SIM_FREED.fetch_add(1, Ordering::Relaxed);
    unsafe { libc::free(value.cast::<c_void>()) };
}

fn vtable() -> BackendVTable {
    BackendVTable {
        register: sim_register,
        deregister: sim_deregister,
        set_token_handler: sim_set_token_handler,
        cookie_new: sim_cookie_new,
        cookie_delete: sim_cookie_delete,
        cookie_reply: sim_cookie_reply,
        cookie_cancel: sim_cookie_cancel,
        start_proxy_guard: sim_start_proxy_guard,
        free_string: sim_free_string,
    }
}

/// Emits `new_state` with a cookie and the JSON value `question` in the
/// payload, then waits for the reply.
fn ask(old_state: i32, new_state: StateCode, question: &str) -> anyhow::Result<Option<String>> {
    let cookie = NEXT_COOKIE.fetch_add(1, Ordering::Relaxed);
    let (reply_tx, reply_rx): (Sender<Option<String>>, Receiver<Option<String>>) =
        crossbeam_channel::bounded(1);
    let callback = {
        let mut sim = SIM.lock();
        sim.waiting.insert(cookie, reply_tx);
        sim.state_callback
            .ok_or_else(|| anyhow::anyhow!("backend is not registered"))?
    };
    let payload = backend_string(&format!("{{\"cookie\":{cookie},\"data\":{question}}}"));
    let handled = unsafe { callback(old_state, new_state.0, payload.cast::<c_void>()) };
    if handled == 0 {
        SIM.lock().waiting.remove(&cookie);
        anyhow::bail!("{new_state} was not handled");
    }
    Ok(reply_rx.recv_timeout(Duration::from_secs(5))?)
}

fn worker_flow(worker: usize) -> anyhow::Result<()> {
    let server = format!("https://vpn{worker}.example.org/");
    let redirect = ask(
        StateCode::INITIAL.0,
        StateCode::OAUTH_STARTED,
        "\"https://idp.example.org/authorize\"",
    )?;
    println!("[backend:{worker}] authorization finished with {redirect:?}");

    let (read, write) = SIM
        .lock()
        .token_handlers
        .ok_or_else(|| anyhow::anyhow!("token handler missing"))?;
    let server_c = CString::new(server.as_str())?;
    let token = CString::new(format!("{{\"access\":\"a{worker}\",\"refresh\":\"r{worker}\"}}"))?;
    unsafe { write(server_c.as_ptr(), token.as_ptr()) };

    let mut buffer = [0u8; 24];
    unsafe { read(server_c.as_ptr(), buffer.as_mut_ptr().cast::<c_char>(), buffer.len()) };
    let stored = CStr::from_bytes_until_nul(&buffer)?.to_string_lossy();
    println!(
        "[backend:{worker}] token read back (truncated to {} bytes): {stored}",
        buffer.len() - 1
    );

    let profile = ask(
        StateCode::OAUTH_STARTED.0,
        StateCode::ASK_PROFILE,
        "[\"default\",\"internal\"]",
    )?;
    println!("[backend:{worker}] selected profile {profile:?}");
    Ok(())
}

// Host side: what a managed client would plug in through HostCallbacks.

static BRIDGE: AtomicPtr<Bridge> = AtomicPtr::new(ptr::null_mut());
static TOKENS: Lazy<Mutex<FxHashMap<String, String>>> =
    Lazy::new(|| Mutex::new(FxHashMap::default()));

fn payload_cookie(payload: &str) -> Option<usize> {
    let start = payload.find("\"cookie\":")? + "\"cookie\":".len();
    let digits: String = payload[start..].chars().take_while(char::is_ascii_digit).collect();
    digits.parse().ok()
}

unsafe extern "C" fn host_on_new_state(
    code: c_int,
    data: *const c_char,
    _context: *mut c_void,
) -> bool {
    let payload = read_c(data);
    let state = StateCode(code);
    println!("[host] {state}: {payload}");
    let Some(handle) = payload_cookie(&payload) else {
        return false;
    };
    let answer = match state {
        StateCode::OAUTH_STARTED => "http://127.0.0.1:8000/callback?code=demo",
        StateCode::ASK_PROFILE => "default",
        _ => return false,
    };
    // Reply from another thread, the way a UI answers after user input.
    thread::spawn(move || {
        let bridge = BRIDGE.load(Ordering::Acquire);
        let answer = CString::new(answer).unwrap_or_default();
        unsafe {
            let cookie = BridgeCookieAdopt(bridge, handle);
            let error = BridgeCookieReply(bridge, cookie, answer.as_ptr());
            if !error.is_null() {
                eprintln!("[host] reply failed: {}", read_c(error));
                BridgeFreeString(error);
            }
            BridgeFreeString(BridgeCookieDelete(bridge, cookie));
        }
    });
    true
}

unsafe extern "C" fn host_get_token(
    server_id: *const c_char,
    _context: *mut c_void,
) -> *mut c_char {
    match TOKENS.lock().get(&read_c(server_id)) {
        Some(token) => backend_string(token),
        None => ptr::null_mut(),
    }
}

unsafe extern "C" fn host_set_token(
    server_id: *const c_char,
    token: *const c_char,
    _context: *mut c_void,
) {
    let server_id = read_c(server_id);
    let mut tokens = TOKENS.lock();
    if token.is_null() {
        tokens.remove(&server_id);
    } else {
        tokens.insert(server_id, read_c(token));
    }
}

unsafe extern "C" fn host_release_string(value: *mut c_char, _context: *mut c_void) {
    unsafe { libc::free(value.cast::<c_void>()) };
}

fn install_log_sink() {
    unsafe extern "C" fn log_sink(
        level: *const c_char,
        message: *const c_char,
        _breadcrumbs: u32,
        _context: *mut c_void,
    ) {
        if message.is_null() {
            return;
        }
        let entry = unsafe { CStr::from_ptr(message) }.to_string_lossy();
        let level = if level.is_null() {
            "info".into()
        } else {
            unsafe { CStr::from_ptr(level) }.to_string_lossy()
        };
        println!("[bridge][{level}] {entry}");
    }

    let sink = BridgeLogSink {
        log: Some(log_sink),
        context: ptr::null_mut(),
        enabled_breadcrumbs: u32::MAX,
    };
    let level = CString::new("debug").unwrap_or_default();
    unsafe {
        BridgeSetLogSink(&sink, level.as_ptr());
    }
}

fn main() -> anyhow::Result<()> {
    let settings = Settings::parse()?;
    install_log_sink();
    BridgeSetBreadcrumbMask(u32::MAX);

    let callbacks = HostCallbacks {
        on_new_state: Some(host_on_new_state),
        get_token: Some(host_get_token),
        set_token: Some(host_set_token),
        on_proxy_file_descriptor: None,
        on_proxy_guard_ready: None,
        release_string: Some(host_release_string),
        context: ptr::null_mut(),
    };
    let name = CString::new("org.eduvpn.standalone")?;
    let version = CString::new(env!("CARGO_PKG_VERSION"))?;
    let options = BridgeRegisterOptions {
        name: name.as_ptr(),
        version: version.as_ptr(),
        debug: settings.debug,
        ..BridgeRegisterOptions::default()
    };
    let vtable = vtable();

    let mut error: *mut c_char = ptr::null_mut();
    let bridge = unsafe { BridgeRegister(&vtable, &callbacks, ptr::null(), &options, &mut error) };
    if bridge.is_null() {
        let message = read_c(error);
        unsafe { BridgeFreeString(error) };
        anyhow::bail!("BridgeRegister failed: {message}");
    }
    BRIDGE.store(bridge, Ordering::Release);

    let workers: Vec<_> = (0..settings.workers)
        .map(|worker| {
            thread::Builder::new()
                .name(format!("backend-worker-{worker}"))
                .spawn(move || worker_flow(worker))
        })
        .collect::<Result<_, _>>()?;
    let mut failures = 0;
    for worker in workers {
        match worker.join() {
            Ok(Ok(())) => {}
            Ok(Err(error)) => {
                failures += 1;
                eprintln!("[standalone] worker failed: {error:#}");
            }
            Err(_) => {
                failures += 1;
                eprintln!("[standalone] worker panicked");
            }
        }
    }

    BRIDGE.store(ptr::null_mut(), Ordering::Release);
    let error = unsafe { BridgeDeregister(bridge) };
    if !error.is_null() {
        eprintln!("[standalone] deregister failed: {}", read_c(error));
        unsafe { BridgeFreeString(error) };
    }
    println!(
        "[standalone] {} workers done, {failures} failed, {} backend strings released",
        settings.workers,
        SIM_FREED.load(Ordering::Relaxed)
    );
    if failures > 0 {
        anyhow::bail!("{failures} workers failed");
    }
    Ok(())
}
