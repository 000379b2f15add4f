//! Who releases what. Strings that the backend allocates and returns belong
//! to the receiver, which copies them into a Rust `String` and then hands the
//! original buffer back to the backend's `FreeString` exactly once. Strings
//! passed *into* a callback are still owned by whoever invoked the callback
//! unless the field's [`FieldOwnership`] says otherwise.

use crate::error::{BridgeError, BridgeResult};
use crate::logger::{self, BreadcrumbFlags};
use std::ffi::{c_char, CStr, CString};
use std::ptr::NonNull;

/// The release half of the ownership protocol.
pub trait StringRelease: Send + Sync {
    /// # Safety
    /// `value` must be a non-null buffer allocated by the same side, not yet
    /// released, and not used after this call.
    unsafe fn release(&self, value: *mut c_char);
}

/// Ownership rule for one boundary field.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldOwnership {
    /// Receiver converts, then releases the buffer.
    Transferred,
    /// Sender keeps the buffer (or has already released it on its own); the
    /// receiver only copies.
    Retained,
}

/// Per-field rules of the backend boundary.
pub mod fields {
    use super::FieldOwnership;

    /// `data` argument of the state callback. Some backend builds release it
    /// themselves once the callback returns; `RegisterOptions::state_payload`
    /// overrides this default for those.
    pub const STATE_PAYLOAD: FieldOwnership = FieldOwnership::Transferred;
    pub const TOKEN_SERVER_ID: FieldOwnership = FieldOwnership::Retained;
    pub const TOKEN_VALUE: FieldOwnership = FieldOwnership::Retained;
    pub const RESULT_DATA: FieldOwnership = FieldOwnership::Transferred;
    pub const RESULT_ERROR: FieldOwnership = FieldOwnership::Transferred;
}

/// A foreign buffer whose release is tied to this value. Dropping it (or
/// converting it with [`OwnedString::into_string`]) applies the field's rule
/// exactly once.
pub struct OwnedString<'a, R: StringRelease + ?Sized> {
    ptr: NonNull<c_char>,
    release: &'a R,
    ownership: FieldOwnership,
}

impl<'a, R: StringRelease + ?Sized> OwnedString<'a, R> {
    /// Wraps `ptr`, returning `None` for null.
    ///
    /// # Safety
    /// A non-null `ptr` must be a NUL-terminated buffer that stays valid until
    /// the returned value is dropped, and, for `Transferred`, must be
    /// releasable through `release`.
    pub unsafe fn from_raw(
        ptr: *mut c_char,
        release: &'a R,
        ownership: FieldOwnership,
    ) -> Option<Self> {
        NonNull::new(ptr).map(|ptr| Self {
            ptr,
            release,
            ownership,
        })
    }

    /// Copies the contents into managed memory. The foreign buffer is
    /// released afterwards, when `self` goes out of scope.
    pub fn into_string(self) -> String {
        unsafe { CStr::from_ptr(self.ptr.as_ptr()) }
            .to_string_lossy()
            .into_owned()
    }

    pub fn ownership(&self) -> FieldOwnership {
        self.ownership
    }
}

impl<R: StringRelease + ?Sized> Drop for OwnedString<'_, R> {
    fn drop(&mut self) {
        if self.ownership == FieldOwnership::Transferred {
            unsafe { self.release.release(self.ptr.as_ptr()) };
        }
    }
}

/// Converts and releases one transferred string.
///
/// # Safety
/// See [`OwnedString::from_raw`] with `FieldOwnership::Transferred`.
pub unsafe fn take_string<R: StringRelease + ?Sized>(
    ptr: *mut c_char,
    release: &R,
) -> Option<String> {
    unsafe { OwnedString::from_raw(ptr, release, FieldOwnership::Transferred) }
        .map(OwnedString::into_string)
}

/// Consumes an error-only backend return.
///
/// # Safety
/// See [`take_string`].
pub unsafe fn take_error<R: StringRelease + ?Sized>(
    error: *mut c_char,
    release: &R,
) -> BridgeResult<()> {
    BridgeError::from_backend(unsafe { take_string(error, release) })
}

/// Consumes a `(data, error)` pair. Both fields are released, even when the
/// error makes the data irrelevant.
///
/// # Safety
/// Both pointers follow [`take_string`].
pub unsafe fn take_result<R: StringRelease + ?Sized>(
    data: *mut c_char,
    error: *mut c_char,
    release: &R,
) -> BridgeResult<Option<String>> {
    let data = unsafe { OwnedString::from_raw(data, release, fields::RESULT_DATA) }
        .map(OwnedString::into_string);
    let error = unsafe { OwnedString::from_raw(error, release, fields::RESULT_ERROR) }
        .map(OwnedString::into_string);
    BridgeError::from_backend(error)?;
    Ok(data)
}

/// Copies a string the caller keeps ownership of.
///
/// # Safety
/// A non-null `ptr` must be NUL-terminated and valid for the call.
pub unsafe fn borrowed_string(ptr: *const c_char) -> Option<String> {
    if ptr.is_null() {
        return None;
    }
    Some(unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned())
}

/// Builds a C string for an argument the bridge passes into the backend.
pub fn to_c_string(value: &str, field: &'static str) -> BridgeResult<CString> {
    CString::new(value).map_err(|_| {
        logger::breadcrumb(
            BreadcrumbFlags::OWNERSHIP,
            format!("rejecting {field}: interior NUL byte"),
        );
        BridgeError::InvalidArgument(format!("{field} contains a NUL byte"))
    })
}

/// Copies `value` into a caller-owned buffer of `out.len()` bytes, always
/// leaving room for the NUL terminator. Excess bytes are dropped at the last
/// full character that fits. Returns the number of bytes written before the
/// terminator.
pub fn copy_truncated(value: &str, out: &mut [u8]) -> usize {
    let Some(room) = out.len().checked_sub(1) else {
        return 0;
    };
    let mut len = value.len().min(room);
    while !value.is_char_boundary(len) {
        len -= 1;
    }
    out[..len].copy_from_slice(&value.as_bytes()[..len]);
    out[len] = 0;
    len
}

/// Hands a bridge-allocated string to a C host. The host returns it through
/// [`free_bridge_string`].
pub fn into_bridge_string(value: &str) -> *mut c_char {
    CString::new(value.replace('\0', " "))
        .map(CString::into_raw)
        .unwrap_or(std::ptr::null_mut())
}

/// # Safety
/// `value` must come from [`into_bridge_string`] and not be released twice.
pub unsafe fn free_bridge_string(value: *mut c_char) {
    if !value.is_null() {
        drop(unsafe { CString::from_raw(value) });
    }
}
