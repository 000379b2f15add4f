use super::*;
use crate::backend::tests::{BackendCall, MockBackend};
use crate::registry::tests::RecordingTarget;
use crate::thread_bridge::tests::FakeRuntime;
use crate::trampoline::tests::lock_slot;

fn install(backend: &Arc<MockBackend>) -> Arc<Bridge> {
    let bridge = Bridge::register(
        backend.clone(),
        Arc::new(FakeRuntime::default()),
        Arc::new(RecordingTarget::new()),
        RegisterOptions::new("org.eduvpn.app.android", "3.1.0"),
    )
    .unwrap();
    let bridge = Arc::new(bridge);
    SESSION.lock().bridge = Some(bridge.clone());
    bridge
}

/// Runs `cookie` through the backend the way a blocking proxy guard does.
fn start_guard(bridge: &Bridge, cookie: Cookie) -> usize {
    bridge.cookies().issue(cookie, Ok).unwrap()
}

fn cancelled(backend: &MockBackend) -> Vec<usize> {
    backend
        .calls()
        .into_iter()
        .filter_map(|call| match call {
            BackendCall::CookieCancel(handle) => Some(handle),
            _ => None,
        })
        .collect()
}

#[test]
fn every_running_proxy_guard_is_cancelled_on_deregister() {
    let _guard = lock_slot();
    let backend = Arc::new(MockBackend::default());
    let bridge = install(&backend);

    let (_, first) = track_proxy_cookie().unwrap();
    let (_, second) = track_proxy_cookie().unwrap();
    let mut handles = vec![start_guard(&bridge, first), start_guard(&bridge, second)];

    deregister_session().unwrap();
    let mut seen = cancelled(&backend);
    handles.sort_unstable();
    seen.sort_unstable();
    assert_eq!(seen, handles);
    assert!(SESSION.lock().proxy_cookies.is_empty());
}

#[test]
fn finished_guard_of_an_old_session_keeps_the_new_list() {
    let _guard = lock_slot();
    let old_backend = Arc::new(MockBackend::default());
    let old = install(&old_backend);
    let (_, stale) = track_proxy_cookie().unwrap();
    deregister_session().unwrap();

    let backend = Arc::new(MockBackend::default());
    let bridge = install(&backend);
    let (_, running) = track_proxy_cookie().unwrap();
    let handle = start_guard(&bridge, running);

    forget_proxy_cookie(&old, stale);
    assert_eq!(SESSION.lock().proxy_cookies, vec![running]);

    deregister_session().unwrap();
    assert_eq!(cancelled(&backend), vec![handle]);
}

#[test]
fn proxy_guard_needs_a_live_session() {
    let _guard = lock_slot();
    SESSION.lock().bridge = None;
    assert!(matches!(track_proxy_cookie(), Err(BridgeError::NoActiveTarget)));
}
