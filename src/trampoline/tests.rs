use super::*;
use crate::backend::tests::MockBackend;
use crate::ownership::FieldOwnership;
use crate::registry::tests::{Call, RecordingTarget};
use crate::registry::CallbackRegistry;
use crate::thread_bridge::{DirectRuntime, ThreadBridge};
use parking_lot::{Mutex, MutexGuard};
use std::ffi::CString;

/// Serializes every test that touches the process-wide dispatcher slot.
static SLOT_LOCK: Mutex<()> = parking_lot::const_mutex(());

pub(crate) fn lock_slot() -> MutexGuard<'static, ()> {
    SLOT_LOCK.lock()
}

fn dispatcher(backend: &Arc<MockBackend>) -> (Arc<CallbackDispatcher>, Arc<RecordingTarget>) {
    let registry = Arc::new(CallbackRegistry::new());
    let target = Arc::new(RecordingTarget::new());
    registry.register(target.clone());
    let dispatcher = CallbackDispatcher::new(
        ThreadBridge::new(Arc::new(DirectRuntime)),
        registry,
        backend.clone(),
    );
    (Arc::new(dispatcher), target)
}

#[test]
fn unrouted_callbacks_report_not_handled() {
    let _guard = lock_slot();
    assert!(current().is_none());

    assert_eq!(unsafe { bridge_state_callback(1, 2, std::ptr::null_mut()) }, 0);
    let mut out = [0x7Fu8; 8];
    let server = CString::new("srv").unwrap();
    unsafe { bridge_token_read(server.as_ptr(), out.as_mut_ptr().cast(), out.len()) };
    assert_eq!(out[0], 0);
    unsafe {
        bridge_token_write(server.as_ptr(), std::ptr::null());
        bridge_proxy_fd(3);
        bridge_proxy_ready();
    }
}

#[test]
fn installed_dispatcher_receives_backend_callbacks() {
    let _guard = lock_slot();
    let backend = Arc::new(MockBackend::default());
    let (dispatcher, target) = dispatcher(&backend);
    install(Arc::clone(&dispatcher));

    let payload = backend.strings.alloc("{\"profiles\":[]}");
    let handled = unsafe { bridge_state_callback(1, 9, payload.cast()) };
    assert_eq!(handled, 1);
    assert_eq!(backend.strings.release_count(payload), 1);

    *target.token.lock() = Some("secret".into());
    let server = CString::new("srv").unwrap();
    let mut out = [0xFFu8; 32];
    unsafe { bridge_token_read(server.as_ptr(), out.as_mut_ptr().cast(), out.len()) };
    assert_eq!(&out[..7], b"secret\0");

    unsafe {
        bridge_proxy_fd(17);
        bridge_proxy_ready();
    }
    assert_eq!(
        target.calls(),
        vec![
            Call::NewState(9, Some("{\"profiles\":[]}".into())),
            Call::GetToken("srv".into()),
            Call::ProxyFd(17),
            Call::ProxyReady,
        ]
    );

    assert!(clear(&dispatcher));
    assert!(current().is_none());
}

#[test]
fn clear_ignores_a_dispatcher_that_was_replaced() {
    let _guard = lock_slot();
    let backend = Arc::new(MockBackend::default());
    let (first, _) = dispatcher(&backend);
    let (second, _) = dispatcher(&backend);

    install(Arc::clone(&first));
    let replaced = install(Arc::clone(&second)).expect("first was installed");
    assert!(Arc::ptr_eq(&replaced, &first));

    assert!(!clear(&first));
    assert!(current().is_some_and(|live| Arc::ptr_eq(&live, &second)));
    assert!(clear(&second));
}

#[test]
fn late_payload_is_released_by_the_last_backend() {
    let _guard = lock_slot();
    let backend = Arc::new(MockBackend::default());
    let (dispatcher, target) = dispatcher(&backend);
    install(Arc::clone(&dispatcher));
    assert!(clear(&dispatcher));

    let payload = backend.strings.alloc("{\"late\":true}");
    assert_eq!(unsafe { bridge_state_callback(2, 3, payload.cast()) }, 0);
    assert_eq!(backend.strings.release_count(payload), 1);
    assert!(target.calls().is_empty());
}

#[test]
fn late_payload_honours_a_retained_rule() {
    let _guard = lock_slot();
    let backend = Arc::new(MockBackend::default());
    let registry = Arc::new(CallbackRegistry::new());
    let dispatcher = Arc::new(
        CallbackDispatcher::new(
            ThreadBridge::new(Arc::new(DirectRuntime)),
            registry,
            backend.clone(),
        )
        .with_state_payload(FieldOwnership::Retained),
    );
    install(Arc::clone(&dispatcher));
    assert!(clear(&dispatcher));

    let payload = backend.strings.alloc("{}");
    unsafe { bridge_state_callback(2, 3, payload.cast()) };
    assert_eq!(backend.strings.release_count(payload), 0);
    backend.strings.reclaim(payload);
}

#[test]
fn ownership_check_follows_the_slot() {
    let _guard = lock_slot();
    let backend = Arc::new(MockBackend::default());
    let (first, _) = dispatcher(&backend);
    let (second, _) = dispatcher(&backend);

    install(Arc::clone(&first));
    assert!(is_installed(&first));
    install(Arc::clone(&second));
    assert!(!is_installed(&first));
    assert!(is_installed(&second));
    assert!(clear(&second));
    assert!(!is_installed(&second));
}
