//! Settings application
//!
//! Applying tunnel network settings is done by the OS on its own schedule:
//! the request returns immediately and a completion callback fires later, on
//! whatever thread the OS chooses, with success or a transport error.
//! [`SettingsApplier`] is the async face the controller awaits;
//! [`apply_channel`] adapts a callback-style OS API to it.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::oneshot;

use crate::settings::TunnelNetworkSettings;

/// Failure reported by the settings collaborator
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApplyError {
    /// The OS refused the configuration
    #[error("settings rejected: {0}")]
    Rejected(String),

    /// The settings failed validation before being submitted
    #[error("invalid settings: {0}")]
    Invalid(String),

    /// The completion was dropped without ever being called
    #[error("settings completion was dropped without a result")]
    Abandoned,
}

/// Asks the OS to instantiate the virtual interface
#[async_trait]
pub trait SettingsApplier: Send + Sync {
    /// Apply `settings`, resolving once the OS completion has fired
    async fn apply(&self, settings: &TunnelNetworkSettings) -> Result<(), ApplyError>;
}

/// One-shot completion handed to a callback-style OS API
#[derive(Debug)]
pub struct ApplyCompletion {
    tx: oneshot::Sender<Result<(), ApplyError>>,
}

impl ApplyCompletion {
    /// Report the outcome; safe to call from any thread
    pub fn complete(self, result: Result<(), ApplyError>) {
        if self.tx.send(result).is_err() {
            log::debug!("Settings completion fired after the requester went away");
        }
    }

    pub fn succeed(self) {
        self.complete(Ok(()));
    }

    pub fn fail(self, reason: impl Into<String>) {
        self.complete(Err(ApplyError::Rejected(reason.into())));
    }
}

/// The awaiting side of an [`ApplyCompletion`]
#[derive(Debug)]
pub struct PendingApply {
    rx: oneshot::Receiver<Result<(), ApplyError>>,
}

impl PendingApply {
    /// Wait for the completion to fire
    ///
    /// A completion dropped without a result counts as a failure.
    pub async fn wait(self) -> Result<(), ApplyError> {
        self.rx.await.unwrap_or(Err(ApplyError::Abandoned))
    }
}

/// Create a linked completion/waiter pair
pub fn apply_channel() -> (ApplyCompletion, PendingApply) {
    let (tx, rx) = oneshot::channel();
    (ApplyCompletion { tx }, PendingApply { rx })
}

/// Applier that only validates and logs the settings
///
/// Used for dry runs where no OS interface is created.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingApplier;

#[async_trait]
impl SettingsApplier for LoggingApplier {
    async fn apply(&self, settings: &TunnelNetworkSettings) -> Result<(), ApplyError> {
        settings
            .validate()
            .map_err(|e| ApplyError::Invalid(e.to_string()))?;

        log::info!(
            "Applying tunnel settings: remote={}, mtu={:?}, ipv4={:?}, dns={:?}",
            settings.tunnel_remote_address,
            settings.mtu,
            settings.ipv4_addresses,
            settings.dns_servers
        );
        log::debug!(
            "IPv4 routes: {} included, {} excluded; IPv6 routes: {} included, {} excluded",
            settings.ipv4_included_routes.len(),
            settings.ipv4_excluded_routes.len(),
            settings.ipv6_included_routes.len(),
            settings.ipv6_excluded_routes.len()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_completion_from_other_thread() {
        let (completion, pending) = apply_channel();

        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            completion.succeed();
        });

        assert_eq!(pending.wait().await, Ok(()));
    }

    #[tokio::test]
    async fn test_completion_failure() {
        let (completion, pending) = apply_channel();
        completion.fail("permission denied");

        assert_eq!(
            pending.wait().await,
            Err(ApplyError::Rejected("permission denied".into()))
        );
    }

    #[tokio::test]
    async fn test_dropped_completion() {
        let (completion, pending) = apply_channel();
        drop(completion);

        assert_eq!(pending.wait().await, Err(ApplyError::Abandoned));
    }

    #[tokio::test]
    async fn test_logging_applier_validates() {
        let applier = LoggingApplier;

        let good = TunnelNetworkSettings::new("127.0.0.1").with_mtu(1500);
        assert!(applier.apply(&good).await.is_ok());

        let bad = TunnelNetworkSettings::new("127.0.0.1").with_mtu(10);
        assert!(matches!(
            applier.apply(&bad).await,
            Err(ApplyError::Invalid(_))
        ));
    }
}
