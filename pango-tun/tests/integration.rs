//! Integration tests for pango-tun
//!
//! Discovery of a real utun socket needs a running packet tunnel provider and
//! cannot be exercised here; `test_privileged_*` tests are ignored by default.

use std::net::Ipv4Addr;
use std::thread;
use std::time::Duration;

use async_trait::async_trait;
use pango_tun::{
    apply_channel, ApplyError, ControlSocketScanner, HandleDiscovery, Ipv4Route, LoggingApplier,
    SettingsApplier, TunnelNetworkSettings,
};

/// Applier shaped like the OS API: submit, then complete on another thread
struct CallbackApplier {
    reject_with: Option<String>,
    drop_completion: bool,
}

#[async_trait]
impl SettingsApplier for CallbackApplier {
    async fn apply(&self, _settings: &TunnelNetworkSettings) -> Result<(), ApplyError> {
        let (completion, pending) = apply_channel();
        let reject_with = self.reject_with.clone();
        let drop_completion = self.drop_completion;

        thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            if drop_completion {
                drop(completion);
            } else if let Some(reason) = reject_with {
                completion.fail(reason);
            } else {
                completion.succeed();
            }
        });

        pending.wait().await
    }
}

fn settings() -> TunnelNetworkSettings {
    TunnelNetworkSettings::new("127.0.0.1")
        .with_mtu(1500)
        .with_ipv4_address(Ipv4Addr::new(100, 89, 128, 2), Ipv4Addr::new(255, 255, 255, 0))
        .with_ipv4_route(Ipv4Route::new(
            Ipv4Addr::new(100, 89, 128, 0),
            Ipv4Addr::new(255, 255, 255, 0),
        ))
}

#[tokio::test]
async fn test_completion_from_foreign_thread() {
    let applier = CallbackApplier {
        reject_with: None,
        drop_completion: false,
    };
    assert_eq!(applier.apply(&settings()).await, Ok(()));
}

#[tokio::test]
async fn test_rejection_from_foreign_thread() {
    let applier = CallbackApplier {
        reject_with: Some("The operation couldn't be completed".into()),
        drop_completion: false,
    };
    assert_eq!(
        applier.apply(&settings()).await,
        Err(ApplyError::Rejected(
            "The operation couldn't be completed".into()
        ))
    );
}

#[tokio::test]
async fn test_dropped_completion_is_failure() {
    let applier = CallbackApplier {
        reject_with: None,
        drop_completion: true,
    };
    assert_eq!(applier.apply(&settings()).await, Err(ApplyError::Abandoned));
}

#[tokio::test]
async fn test_logging_applier_validates() {
    assert!(LoggingApplier.apply(&settings()).await.is_ok());

    let bad = TunnelNetworkSettings::new("");
    assert!(matches!(
        LoggingApplier.apply(&bad).await,
        Err(ApplyError::Invalid(_))
    ));
}

#[test]
fn test_settings_survive_engine_json() {
    let json = settings().to_json().unwrap();
    assert!(json.contains(r#""ipv4_subnet_masks":["255.255.255.0"]"#));
    assert!(!json.contains("ipv6"));

    let parsed = TunnelNetworkSettings::from_json(&json).unwrap();
    assert_eq!(parsed, settings());
}

#[test]
fn test_scanner_as_discovery_object() {
    let scanner: Box<dyn HandleDiscovery> = Box::new(ControlSocketScanner::new().with_limit(32));
    assert_eq!(scanner.scan_limit(), 32);
}

#[cfg(not(any(target_os = "macos", target_os = "ios")))]
#[test]
fn test_no_control_socket_off_apple() {
    assert_eq!(ControlSocketScanner::new().discover(), None);
}

/// Run inside a packet tunnel extension after settings were applied
#[cfg(any(target_os = "macos", target_os = "ios"))]
#[test]
#[ignore]
fn test_privileged_discovers_utun() {
    let handle = ControlSocketScanner::new().discover();
    assert!(handle.is_some(), "no utun control socket found");
    assert!(!handle.unwrap().is_sentinel());
}
