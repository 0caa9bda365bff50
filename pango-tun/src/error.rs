//! Error types for pango-tun

use std::io;
use thiserror::Error;

/// Result type alias for pango-tun operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur on the OS side of the tunnel
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error from underlying system calls
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The requested network settings are malformed
    #[error("invalid network settings: {0}")]
    InvalidSettings(String),

    /// Invalid IP address
    #[error("invalid IP address: {0}")]
    InvalidAddress(String),

    /// Operation not supported on this platform
    #[error("operation not supported: {0}")]
    NotSupported(String),

    /// Settings could not be serialized
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl Error {
    /// Check if the error is a permission-related error
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, Error::Io(e) if e.kind() == io::ErrorKind::PermissionDenied)
    }

    /// Check if the error comes from a malformed settings request
    pub fn is_invalid_settings(&self) -> bool {
        matches!(self, Error::InvalidSettings(_) | Error::InvalidAddress(_))
    }
}
