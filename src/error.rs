use crate::cookie::Cookie;
use thiserror::Error;

pub type BridgeResult<T> = Result<T, BridgeError>;

/// Failures observable at the bridge boundary.
///
/// `NoActiveTarget` is never returned from a dispatch; the dispatcher swallows
/// it and reports a negative "handled" result instead. It exists so the
/// registry and the C ABI can name the condition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BridgeError {
    #[error("backend call failed: {0}")]
    BackendCallFailed(String),
    #[error("unknown cookie {0}")]
    UnknownCookie(Cookie),
    #[error("no callback target registered")]
    NoActiveTarget,
    #[error("failed to attach thread to the managed runtime: {0}")]
    RuntimeAttachFailed(String),
    #[error("managed handler fault: {0}")]
    ManagedHandlerFault(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl BridgeError {
    /// Maps the backend's optional error string onto a result. The backend
    /// signals success with a null or empty string.
    pub fn from_backend(error: Option<String>) -> BridgeResult<()> {
        match error {
            Some(message) if !message.is_empty() => Err(BridgeError::BackendCallFailed(message)),
            _ => Ok(()),
        }
    }
}
