use crate::error::{BridgeError, BridgeResult};
use crate::ffi::BridgeRegisterOptions;
use crate::ownership::{self, fields, FieldOwnership};
use std::path::PathBuf;

/// Everything registration needs besides the target and the runtime.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegisterOptions {
    /// Client identifier reported to the backend.
    pub name: String,
    pub version: String,
    /// Where the backend keeps its state. `None` means no directory.
    pub config_dir: Option<PathBuf>,
    pub debug: bool,
    /// Ownership of the state callback payload.
    pub state_payload: FieldOwnership,
}

impl RegisterOptions {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            config_dir: None,
            debug: false,
            state_payload: fields::STATE_PAYLOAD,
        }
    }

    pub fn with_config_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config_dir = Some(dir.into());
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn with_state_payload(mut self, ownership: FieldOwnership) -> Self {
        self.state_payload = ownership;
        self
    }

    /// Reads the C mirror. Null or empty `config_directory` maps to `None`.
    ///
    /// # Safety
    /// Every non-null string field must be NUL-terminated and valid for the
    /// duration of the call.
    pub unsafe fn from_c(options: &BridgeRegisterOptions) -> BridgeResult<Self> {
        let name = unsafe { ownership::borrowed_string(options.name) }
            .ok_or_else(|| BridgeError::InvalidArgument("name is required".into()))?;
        let version = unsafe { ownership::borrowed_string(options.version) }.unwrap_or_default();
        let config_dir = unsafe { ownership::borrowed_string(options.config_directory) }
            .filter(|dir| !dir.is_empty())
            .map(PathBuf::from);
        Ok(Self {
            name,
            version,
            config_dir,
            debug: options.debug,
            state_payload: if options.state_payload_released_by_backend {
                FieldOwnership::Retained
            } else {
                fields::STATE_PAYLOAD
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CString;
    use std::ptr;

    #[test]
    fn null_config_directory_means_none() {
        let name = CString::new("org.eduvpn.app.android").unwrap();
        let options = BridgeRegisterOptions {
            name: name.as_ptr(),
            ..BridgeRegisterOptions::default()
        };
        let parsed = unsafe { RegisterOptions::from_c(&options) }.unwrap();
        assert_eq!(parsed.name, "org.eduvpn.app.android");
        assert_eq!(parsed.version, "");
        assert_eq!(parsed.config_dir, None);
        assert_eq!(parsed.state_payload, FieldOwnership::Transferred);
    }

    #[test]
    fn backend_released_payload_flag_maps_to_retained() {
        let name = CString::new("client").unwrap();
        let dir = CString::new("/data/cache/backend_config_files").unwrap();
        let options = BridgeRegisterOptions {
            name: name.as_ptr(),
            config_directory: dir.as_ptr(),
            debug: true,
            state_payload_released_by_backend: true,
            ..BridgeRegisterOptions::default()
        };
        let parsed = unsafe { RegisterOptions::from_c(&options) }.unwrap();
        assert_eq!(
            parsed.config_dir,
            Some(PathBuf::from("/data/cache/backend_config_files"))
        );
        assert!(parsed.debug);
        assert_eq!(parsed.state_payload, FieldOwnership::Retained);
    }

    #[test]
    fn missing_name_is_rejected() {
        let options = BridgeRegisterOptions {
            name: ptr::null(),
            ..BridgeRegisterOptions::default()
        };
        assert!(matches!(
            unsafe { RegisterOptions::from_c(&options) },
            Err(BridgeError::InvalidArgument(_))
        ));
    }
}
