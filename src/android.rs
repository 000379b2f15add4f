//! JNI surface of `org.eduvpn.common.GoBackend`.
//!
//! The Java class has no native handle, so the live [`Bridge`] is kept in a
//! process-wide slot owned by this module. The callback object is read once
//! from the static field `GoBackend.callbackFunction` at registration.

use crate::backend::{NativeBackend, ProxyGuardRequest};
use crate::config::RegisterOptions;
use crate::cookie::Cookie;
use crate::error::{BridgeError, BridgeResult};
use crate::logger::{self, BreadcrumbFlags};
use crate::registry::{CallbackTarget, Capabilities};
use crate::thread_bridge::ManagedRuntime;
use crate::Bridge;
use anyhow::{anyhow, bail};
use jni::objects::{GlobalRef, JClass, JMethodID, JObject, JString, JValue};
use jni::signature::{Primitive, ReturnType};
use jni::sys::{jboolean, jint, jstring, jvalue, JNI_FALSE};
use jni::{JNIEnv, JavaVM};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::sync::Arc;

const GO_BACKEND_CLASS: &str = "org/eduvpn/common/GoBackend";
const CALLBACK_FIELD: &str = "callbackFunction";
const CALLBACK_SIGNATURE: &str = "Lorg/eduvpn/common/GoBackend$Callback;";
const GET_TOKEN_SIGNATURE: &str = "(Ljava/lang/String;)Ljava/lang/String;";
const SET_TOKEN_SIGNATURE: &str = "(Ljava/lang/String;Ljava/lang/String;)V";
const LOCAL_FRAME: i32 = 8;

/// [`ManagedRuntime`] backed by the process `JavaVM`.
pub struct JniRuntime {
    vm: JavaVM,
}

impl ManagedRuntime for JniRuntime {
    fn is_attached(&self) -> bool {
        self.vm.get_env().is_ok()
    }

    fn attach(&self) -> anyhow::Result<()> {
        self.vm.attach_current_thread_permanently()?;
        Ok(())
    }

    fn detach(&self) {
        // Only reached for threads attached by `attach` above, which hold no
        // local references once the dispatch returns.
        unsafe { self.vm.detach_current_thread() };
    }
}

#[derive(Clone, Copy, Default)]
struct CallbackMethods {
    on_new_state: Option<JMethodID>,
    get_token: Option<JMethodID>,
    set_token: Option<JMethodID>,
    on_proxy_file_descriptor: Option<JMethodID>,
    on_proxy_guard_ready: Option<JMethodID>,
}

/// The Java `GoBackend.Callback` object with its method ids resolved once.
pub struct JavaCallbackTarget {
    vm: JavaVM,
    callback: GlobalRef,
    methods: CallbackMethods,
}

impl JavaCallbackTarget {
    /// Reads `GoBackend.callbackFunction` and resolves its methods.
    fn from_static_field(env: &mut JNIEnv) -> anyhow::Result<Self> {
        let callback = env
            .get_static_field(GO_BACKEND_CLASS, CALLBACK_FIELD, CALLBACK_SIGNATURE)?
            .l()?;
        if callback.is_null() {
            bail!("GoBackend.callbackFunction is not set");
        }
        let class = env.get_object_class(&callback)?;
        let methods = CallbackMethods {
            on_new_state: optional_method(env, &class, "onNewState", "(ILjava/lang/String;)Z"),
            get_token: optional_method(env, &class, "getToken", GET_TOKEN_SIGNATURE),
            set_token: optional_method(env, &class, "setToken", SET_TOKEN_SIGNATURE),
            on_proxy_file_descriptor: optional_method(env, &class, "onProxyFileDescriptor", "(I)V"),
            on_proxy_guard_ready: optional_method(env, &class, "onProxyGuardReady", "()V"),
        };
        Ok(Self {
            vm: env.get_java_vm()?,
            callback: env.new_global_ref(&callback)?,
            methods,
        })
    }

    /// `method` must take `args` and return `void`.
    fn call_void(
        &self,
        env: &mut JNIEnv,
        method: JMethodID,
        args: &[jvalue],
    ) -> anyhow::Result<()> {
        let void = ReturnType::Primitive(Primitive::Void);
        unsafe { env.call_method_unchecked(&self.callback, method, void, args) }?;
        Ok(())
    }

    fn with_env<T>(
        &self,
        run: impl FnOnce(&mut JNIEnv) -> anyhow::Result<T>,
    ) -> anyhow::Result<T> {
        let mut env = self.vm.get_env()?;
        let result = env.with_local_frame(LOCAL_FRAME, |env| run(env));
        if env.exception_check()? {
            env.exception_describe()?;
            env.exception_clear()?;
            bail!("callback threw a Java exception");
        }
        result
    }
}

fn optional_method(
    env: &mut JNIEnv,
    class: &JClass,
    name: &str,
    signature: &str,
) -> Option<JMethodID> {
    match env.get_method_id(class, name, signature) {
        Ok(id) => Some(id),
        Err(_) => {
            let _ = env.exception_clear();
            logger::breadcrumb(
                BreadcrumbFlags::REGISTRY,
                format!("callback does not implement {name}{signature}"),
            );
            None
        }
    }
}

fn optional_string<'local>(
    env: &mut JNIEnv<'local>,
    value: Option<&str>,
) -> anyhow::Result<JObject<'local>> {
    Ok(match value {
        Some(text) => env.new_string(text)?.into(),
        None => JObject::null(),
    })
}

impl CallbackTarget for JavaCallbackTarget {
    fn on_new_state(&self, code: i32, data: Option<&str>) -> anyhow::Result<bool> {
        let method = self.methods.on_new_state.ok_or_else(|| anyhow!("onNewState missing"))?;
        self.with_env(|env| {
            let data = optional_string(env, data)?;
            let args = [JValue::Int(code).as_jni(), JValue::Object(&data).as_jni()];
            let value = unsafe {
                env.call_method_unchecked(
                    &self.callback,
                    method,
                    ReturnType::Primitive(Primitive::Boolean),
                    &args,
                )
            }?;
            Ok(value.z()?)
        })
    }

    fn get_token(&self, server_id: &str) -> anyhow::Result<Option<String>> {
        let method = self.methods.get_token.ok_or_else(|| anyhow!("getToken missing"))?;
        self.with_env(|env| {
            let server_id = env.new_string(server_id)?;
            let args = [JValue::Object(&server_id).as_jni()];
            let value = unsafe {
                env.call_method_unchecked(&self.callback, method, ReturnType::Object, &args)
            }?;
            let token = value.l()?;
            if token.is_null() {
                return Ok(None);
            }
            let token = JString::from(token);
            let token: String = env.get_string(&token)?.into();
            Ok(Some(token))
        })
    }

    fn set_token(&self, server_id: &str, token: Option<&str>) -> anyhow::Result<()> {
        let method = self.methods.set_token.ok_or_else(|| anyhow!("setToken missing"))?;
        self.with_env(|env| {
            let server_id = env.new_string(server_id)?;
            let token = optional_string(env, token)?;
            let args = [JValue::Object(&server_id).as_jni(), JValue::Object(&token).as_jni()];
            self.call_void(env, method, &args)
        })
    }

    fn on_proxy_file_descriptor(&self, fd: i32) -> anyhow::Result<()> {
        let method = self
            .methods
            .on_proxy_file_descriptor
            .ok_or_else(|| anyhow!("onProxyFileDescriptor missing"))?;
        self.with_env(|env| {
            let args = [JValue::Int(fd).as_jni()];
            self.call_void(env, method, &args)
        })
    }

    fn on_proxy_guard_ready(&self) -> anyhow::Result<()> {
        let method = self
            .methods
            .on_proxy_guard_ready
            .ok_or_else(|| anyhow!("onProxyGuardReady missing"))?;
        self.with_env(|env| self.call_void(env, method, &[]))
    }

    fn capabilities(&self) -> Capabilities {
        let methods = &self.methods;
        let mut capabilities = Capabilities::empty();
        capabilities.set(Capabilities::NEW_STATE, methods.on_new_state.is_some());
        capabilities.set(Capabilities::GET_TOKEN, methods.get_token.is_some());
        capabilities.set(Capabilities::SET_TOKEN, methods.set_token.is_some());
        capabilities.set(Capabilities::PROXY_FD, methods.on_proxy_file_descriptor.is_some());
        capabilities.set(Capabilities::PROXY_READY, methods.on_proxy_guard_ready.is_some());
        capabilities
    }
}

#[derive(Default)]
struct AndroidSession {
    bridge: Option<Arc<Bridge>>,
    /// Cookies of running proxy guards, cancelled on deregistration.
    proxy_cookies: Vec<Cookie>,
}

static SESSION: Lazy<Mutex<AndroidSession>> = Lazy::new(|| Mutex::new(AndroidSession::default()));

fn live_bridge() -> BridgeResult<Arc<Bridge>> {
    SESSION.lock().bridge.clone().ok_or(BridgeError::NoActiveTarget)
}

fn java_string(env: &mut JNIEnv, value: &JString) -> Option<String> {
    if value.is_null() {
        return None;
    }
    env.get_string(value).ok().map(Into::into)
}

fn backend_handle(cookie: jint) -> BridgeResult<usize> {
    usize::try_from(cookie).map_err(|_| BridgeError::InvalidArgument(format!("cookie {cookie}")))
}

/// Turns the outcome of a JNI entry point into `null` or an error message.
fn to_jstring(
    env: &mut JNIEnv,
    entry: &str,
    run: impl FnOnce(&mut JNIEnv) -> anyhow::Result<()>,
) -> jstring {
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| run(env)))
        .unwrap_or_else(|_| Err(anyhow!("{entry} panicked")));
    let Err(error) = outcome else {
        return ptr::null_mut();
    };
    let message = format!("{error:#}");
    logger::error(format!("{entry}: {message}"));
    env.new_string(message).map_or(ptr::null_mut(), JString::into_raw)
}

fn deregister_session() -> BridgeResult<()> {
    let (bridge, proxy_cookies) = {
        let mut session = SESSION.lock();
        (session.bridge.take(), std::mem::take(&mut session.proxy_cookies))
    };
    let Some(bridge) = bridge else {
        return Ok(());
    };
    for cookie in proxy_cookies {
        if let Err(error) = bridge.cookies().cancel(cookie) {
            logger::warn(format!("cancelling proxy guard cookie {cookie}: {error}"));
        }
    }
    // Proxy guard calls may still hold the bridge; closing it now keeps
    // their late drop from touching a newer registration.
    bridge.close()
}

/// Allocates the cookie of a new proxy guard on the live session.
fn track_proxy_cookie() -> BridgeResult<(Arc<Bridge>, Cookie)> {
    let mut session = SESSION.lock();
    let bridge = session.bridge.clone().ok_or(BridgeError::NoActiveTarget)?;
    let cookie = bridge.cookies().new_cookie();
    session.proxy_cookies.push(cookie);
    Ok((bridge, cookie))
}

/// Cookie values restart with every bridge, so only the session that
/// issued `cookie` may drop it from its list.
fn forget_proxy_cookie(bridge: &Arc<Bridge>, cookie: Cookie) {
    let mut session = SESSION.lock();
    if session.bridge.as_ref().is_some_and(|live| Arc::ptr_eq(live, bridge)) {
        session.proxy_cookies.retain(|running| *running != cookie);
    }
}

#[no_mangle]
pub extern "system" fn Java_org_eduvpn_common_GoBackend_register(
    mut env: JNIEnv,
    _this: JObject,
    name: JString,
    version: JString,
    config_directory: JString,
    debug: jboolean,
) -> jstring {
    to_jstring(&mut env, "register", |env| {
        let name = java_string(env, &name).ok_or_else(|| anyhow!("name is required"))?;
        let version = java_string(env, &version).unwrap_or_default();
        let mut options = RegisterOptions::new(name, version).with_debug(debug != JNI_FALSE);
        if let Some(dir) = java_string(env, &config_directory).filter(|dir| !dir.is_empty()) {
            options = options.with_config_dir(dir);
        }

        let target = JavaCallbackTarget::from_static_field(env)?;
        let runtime = JniRuntime {
            vm: env.get_java_vm()?,
        };
        deregister_session()?;
        let bridge = Bridge::register(
            Arc::new(NativeBackend::linked()),
            Arc::new(runtime),
            Arc::new(target),
            options,
        )?;
        SESSION.lock().bridge = Some(Arc::new(bridge));
        Ok(())
    })
}

#[no_mangle]
pub extern "system" fn Java_org_eduvpn_common_GoBackend_deregister(
    mut env: JNIEnv,
    _this: JObject,
) -> jstring {
    to_jstring(&mut env, "deregister", |_| Ok(deregister_session()?))
}

/// `cookie` is the backend handle delivered in a state payload.
#[no_mangle]
pub extern "system" fn Java_org_eduvpn_common_GoBackend_cookieReply(
    mut env: JNIEnv,
    _this: JObject,
    cookie: jint,
    data: JString,
) -> jstring {
    to_jstring(&mut env, "cookieReply", |env| {
        let data = java_string(env, &data).unwrap_or_default();
        let bridge = live_bridge()?;
        let cookies = bridge.cookies();
        let cookie = cookies.adopt(backend_handle(cookie)?)?;
        cookies.reply(cookie, &data)?;
        cookies.delete(cookie)?;
        Ok(())
    })
}

#[no_mangle]
pub extern "system" fn Java_org_eduvpn_common_GoBackend_cancelCookie(
    mut env: JNIEnv,
    _this: JObject,
    cookie: jint,
) -> jstring {
    to_jstring(&mut env, "cancelCookie", |_| {
        let bridge = live_bridge()?;
        let cookies = bridge.cookies();
        let cookie = cookies.adopt(backend_handle(cookie)?)?;
        cookies.cancel(cookie)?;
        cookies.delete(cookie)?;
        Ok(())
    })
}

/// Blocks the calling Java thread for as long as the proxy runs.
#[no_mangle]
pub extern "system" fn Java_org_eduvpn_common_GoBackend_startProxyGuard(
    mut env: JNIEnv,
    _this: JObject,
    source_port: jint,
    listen: JString,
    peer: JString,
) -> jstring {
    to_jstring(&mut env, "startProxyGuard", |env| {
        let listen = java_string(env, &listen).ok_or_else(|| anyhow!("listen is required"))?;
        let peer = java_string(env, &peer).ok_or_else(|| anyhow!("peer is required"))?;
        let (bridge, cookie) = track_proxy_cookie()?;

        let request = ProxyGuardRequest {
            listen,
            tcp_source_port: source_port,
            peer,
        };
        let result = bridge.start_proxy_guard(cookie, &request);

        forget_proxy_cookie(&bridge, cookie);
        // Already gone if deregistration retired it.
        let _ = bridge.cookies().delete(cookie);
        Ok(result?)
    })
}

#[cfg(test)]
mod tests;
