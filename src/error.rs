//! Error types and handling for the tunnel bridge

use libc::{EADDRINUSE, EBADF, EINVAL, EIO, ENODEV, ENOSPC};
use thiserror::Error;

/// Why the engine refused a configuration blob
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigErrorKind {
    /// Malformed line, unknown key or out-of-range value
    Invalid,
    /// The requested listen port could not be bound
    PortInUse,
    /// Socket or device I/O failed while applying
    Io,
}

/// Main error type for bridge operations
#[derive(Error, Debug)]
pub enum BridgeError {
    /// Duplicating the host descriptor failed
    #[error("Unable to dup tun fd: {0}")]
    Duplicate(std::io::Error),

    /// Switching the duplicate to non-blocking mode failed
    #[error("Unable to set tun fd as non blocking: {0}")]
    NonBlocking(std::io::Error),

    /// The platform refused to hand out a virtual interface
    #[error("Unable to create new tun device: {0}")]
    Interface(String),

    /// Interface identifier text is not a GUID
    #[error("Invalid interface identifier {text:?}: {reason}")]
    InvalidIdentifier { text: String, reason: String },

    /// Configuration was rejected by the engine
    #[error("Unable to set IPC settings: {message}")]
    Config {
        kind: ConfigErrorKind,
        message: String,
    },

    /// Opening or closing the UDP sockets failed
    #[error("Unable to update bind: {0}")]
    Bind(std::io::Error),

    /// The handle registry refused the instance
    #[error("Unable to find empty handle: {0}")]
    Registration(String),

    /// No live tunnel under that handle
    #[error("Invalid tunnel handle: {0}")]
    InvalidHandle(i32),

    /// Host passed a null or non UTF-8 string
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;

impl BridgeError {
    /// Shorthand for an invalid configuration line
    pub fn invalid_config(message: impl Into<String>) -> Self {
        BridgeError::Config {
            kind: ConfigErrorKind::Invalid,
            message: message.into(),
        }
    }

    /// errno-style code reported (negated) through `wgSetConfig`
    pub fn errno(&self) -> i32 {
        match self {
            BridgeError::Config { kind, .. } => match kind {
                ConfigErrorKind::Invalid => EINVAL,
                ConfigErrorKind::PortInUse => EADDRINUSE,
                ConfigErrorKind::Io => EIO,
            },
            BridgeError::InvalidHandle(_) => EBADF,
            BridgeError::InvalidParameter(_) | BridgeError::InvalidIdentifier { .. } => EINVAL,
            BridgeError::Duplicate(e)
            | BridgeError::NonBlocking(e)
            | BridgeError::Bind(e)
            | BridgeError::Io(e) => {
                e.raw_os_error().unwrap_or(EIO)
            }
            BridgeError::Interface(_) => ENODEV,
            BridgeError::Registration(_) => ENOSPC,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = BridgeError::invalid_config("failed to parse line \"garbage\"");
        assert_eq!(
            err.to_string(),
            "Unable to set IPC settings: failed to parse line \"garbage\""
        );
    }

    #[test]
    fn test_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: BridgeError = io_err.into();
        assert!(matches!(err, BridgeError::Io(_)));
    }

    #[test]
    fn test_errno_mapping() {
        assert_eq!(BridgeError::InvalidHandle(3).errno(), EBADF);
        assert_eq!(BridgeError::invalid_config("x").errno(), EINVAL);
        let in_use = BridgeError::Config {
            kind: ConfigErrorKind::PortInUse,
            message: "bind".to_string(),
        };
        assert_eq!(in_use.errno(), EADDRINUSE);
        let dup = BridgeError::Duplicate(std::io::Error::from_raw_os_error(libc::EMFILE));
        assert_eq!(dup.errno(), libc::EMFILE);
        assert_eq!(BridgeError::Interface("gone".to_string()).errno(), ENODEV);
        assert_eq!(BridgeError::Registration("full".to_string()).errno(), ENOSPC);
    }
}
