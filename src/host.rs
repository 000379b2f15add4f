//! Adapters for hosts that register through the C ABI.

use crate::error::{BridgeError, BridgeResult};
use crate::ffi::{HostCallbacks, HostRuntime};
use crate::ownership::{self, FieldOwnership, OwnedString, StringRelease};
use crate::registry::{CallbackTarget, Capabilities};
use crate::thread_bridge::ManagedRuntime;
use anyhow::bail;
use std::ffi::c_char;
use std::ptr;

/// Callback target backed by a [`HostCallbacks`] table.
pub struct HostTarget {
    callbacks: HostCallbacks,
}

impl HostTarget {
    /// # Safety
    /// Every non-null function pointer must stay callable, from any thread,
    /// with `callbacks.context` until the target is dropped.
    pub unsafe fn new(callbacks: HostCallbacks) -> Self {
        Self { callbacks }
    }
}

impl StringRelease for HostTarget {
    unsafe fn release(&self, value: *mut c_char) {
        if let Some(release) = self.callbacks.release_string {
            unsafe { release(value, self.callbacks.context) };
        }
    }
}

impl CallbackTarget for HostTarget {
    fn on_new_state(&self, code: i32, data: Option<&str>) -> anyhow::Result<bool> {
        let Some(on_new_state) = self.callbacks.on_new_state else {
            return Ok(false);
        };
        let data = data
            .map(|text| ownership::to_c_string(text, "state payload"))
            .transpose()?;
        let data_ptr = data.as_ref().map_or(ptr::null(), |text| text.as_ptr());
        Ok(unsafe { on_new_state(code, data_ptr, self.callbacks.context) })
    }

    fn get_token(&self, server_id: &str) -> anyhow::Result<Option<String>> {
        let Some(get_token) = self.callbacks.get_token else {
            return Ok(None);
        };
        let server_id = ownership::to_c_string(server_id, "server id")?;
        let token = unsafe { get_token(server_id.as_ptr(), self.callbacks.context) };
        let ownership = if self.callbacks.release_string.is_some() {
            FieldOwnership::Transferred
        } else {
            FieldOwnership::Retained
        };
        Ok(unsafe { OwnedString::from_raw(token, self, ownership) }.map(OwnedString::into_string))
    }

    fn set_token(&self, server_id: &str, token: Option<&str>) -> anyhow::Result<()> {
        let Some(set_token) = self.callbacks.set_token else {
            return Ok(());
        };
        let server_id = ownership::to_c_string(server_id, "server id")?;
        let token = token.map(|value| ownership::to_c_string(value, "token")).transpose()?;
        let token_ptr = token.as_ref().map_or(ptr::null(), |value| value.as_ptr());
        unsafe { set_token(server_id.as_ptr(), token_ptr, self.callbacks.context) };
        Ok(())
    }

    fn on_proxy_file_descriptor(&self, fd: i32) -> anyhow::Result<()> {
        if let Some(on_fd) = self.callbacks.on_proxy_file_descriptor {
            unsafe { on_fd(fd, self.callbacks.context) };
        }
        Ok(())
    }

    fn on_proxy_guard_ready(&self) -> anyhow::Result<()> {
        if let Some(on_ready) = self.callbacks.on_proxy_guard_ready {
            unsafe { on_ready(self.callbacks.context) };
        }
        Ok(())
    }

    fn capabilities(&self) -> Capabilities {
        let callbacks = &self.callbacks;
        let mut capabilities = Capabilities::empty();
        capabilities.set(Capabilities::NEW_STATE, callbacks.on_new_state.is_some());
        capabilities.set(Capabilities::GET_TOKEN, callbacks.get_token.is_some());
        capabilities.set(Capabilities::SET_TOKEN, callbacks.set_token.is_some());
        capabilities.set(Capabilities::PROXY_FD, callbacks.on_proxy_file_descriptor.is_some());
        capabilities.set(Capabilities::PROXY_READY, callbacks.on_proxy_guard_ready.is_some());
        capabilities
    }
}

/// [`ManagedRuntime`] over the host's attach hooks.
pub struct HostThreads {
    hooks: HostRuntime,
}

impl HostThreads {
    /// A host without any hooks is treated as attached on every thread.
    /// Hooks that can attach or detach also need `is_attached`; without it
    /// the bridge could detach threads the host attached itself.
    ///
    /// # Safety
    /// Non-null hooks must stay callable with `hooks.context` from any
    /// thread for the lifetime of the value.
    pub unsafe fn new(hooks: HostRuntime) -> BridgeResult<Self> {
        let manages_threads = hooks.attach.is_some() || hooks.detach.is_some();
        if manages_threads && hooks.is_attached.is_none() {
            return Err(BridgeError::InvalidArgument(
                "runtime attach/detach hooks require is_attached".into(),
            ));
        }
        Ok(Self { hooks })
    }
}

impl ManagedRuntime for HostThreads {
    fn is_attached(&self) -> bool {
        match self.hooks.is_attached {
            Some(is_attached) => unsafe { is_attached(self.hooks.context) },
            None => true,
        }
    }

    fn attach(&self) -> anyhow::Result<()> {
        let Some(attach) = self.hooks.attach else {
            return Ok(());
        };
        let status = unsafe { attach(self.hooks.context) };
        if status != 0 {
            bail!("host attach hook returned {status}");
        }
        Ok(())
    }

    fn detach(&self) {
        if let Some(detach) = self.hooks.detach {
            unsafe { detach(self.hooks.context) };
        }
    }
}
