//! Error types for the tunnel controller

use std::time::Duration;

use pango_tun::ApplyError;
use thiserror::Error;

/// Result type alias for controller operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while driving the tunnel engine
#[derive(Debug, Error)]
pub enum Error {
    /// Start requested while the controller is not stopped
    #[error("tunnel is already running")]
    AlreadyRunning,

    /// Stop or a runtime operation requested while nothing is running
    #[error("tunnel is not running")]
    NotRunning,

    /// The OS rejected the network settings
    #[error("failed to apply network settings: {0}")]
    SettingsApplyFailed(#[from] ApplyError),

    /// No utun control socket was found; the sentinel handle is used instead
    #[error("tunnel interface handle not discovered")]
    HandleNotDiscovered,

    /// The engine reported an error-flagged status
    #[error("engine invocation failed: {0}")]
    EngineInvocationFailed(String),

    /// The background task did not join within the bound; the controller is stopped anyway
    #[error("background task did not finish within {0:?}")]
    ShutdownTimeout(Duration),

    /// A stop arrived while the start was still in progress
    #[error("start aborted by a concurrent stop")]
    StartAborted,

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Failed to parse configuration file
    #[error("failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding or decoding error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// OS-side error from pango-tun
    #[error("tunnel error: {0}")]
    Tun(#[from] pango_tun::Error),

    /// Control socket error
    #[error("control socket error: {0}")]
    Control(String),
}

impl Error {
    /// Whether the failed operation left the controller in a degraded but consistent state
    ///
    /// Non-fatal errors are reported for visibility only; the requested
    /// transition still happened.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Error::HandleNotDiscovered | Error::ShutdownTimeout(_))
    }

    /// Check if this is a lifecycle (state) error rather than an operational failure
    pub fn is_state_error(&self) -> bool {
        matches!(self, Error::AlreadyRunning | Error::NotRunning)
    }

    /// Check if this is a configuration error
    pub fn is_config_error(&self) -> bool {
        matches!(self, Error::Config(_) | Error::ConfigParse(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatality() {
        assert!(!Error::ShutdownTimeout(Duration::from_secs(5)).is_fatal());
        assert!(!Error::HandleNotDiscovered.is_fatal());
        assert!(Error::EngineInvocationFailed("Error: boom".into()).is_fatal());
        assert!(Error::AlreadyRunning.is_fatal());
    }

    #[test]
    fn test_classification() {
        assert!(Error::NotRunning.is_state_error());
        assert!(!Error::StartAborted.is_state_error());
        assert!(Error::Config("bad".into()).is_config_error());
    }

    #[test]
    fn test_apply_error_conversion() {
        let err: Error = ApplyError::Rejected("denied".into()).into();
        assert!(matches!(err, Error::SettingsApplyFailed(_)));
        assert_eq!(
            err.to_string(),
            "failed to apply network settings: settings rejected: denied"
        );
    }
}
