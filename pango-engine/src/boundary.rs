//! Engine invocation boundary
//!
//! The tunnel engine is a pre-built library reached through a narrow, blocking
//! interface ([`EngineBoundary`]). Its calls answer with short human-readable
//! status lines rather than structured errors; a line containing "error" or
//! "fail" (any case) is a failure.
//!
//! [`EngineInvoker`] is the only place those lines are interpreted. Everything
//! past it sees [`EngineError`].

use std::sync::Arc;

use pango_tun::TunnelHandle;
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::config::{EngineInitConfig, TunnelOptions};
use crate::event::LogLevel;

/// Raw interface exported by the tunnel engine
///
/// All calls block the calling thread. Implementations wrap whatever runtime
/// boundary the engine lives behind.
pub trait EngineBoundary: Send + Sync + 'static {
    /// One-time engine initialization with a JSON init payload
    fn init(&self, config_json: &str) -> String;

    /// Start the tunnel on descriptor `fd` with a JSON tunnel payload
    ///
    /// Returns once the engine has taken over the descriptor; the engine keeps
    /// working on its own threads afterwards.
    fn start_tunnel(&self, fd: i32, config_json: &str) -> String;

    /// Stop the running tunnel
    fn stop_tunnel(&self) -> String;

    /// Whether the engine's tunnel loop is still alive
    fn is_running(&self) -> bool;

    /// Version of the engine's current network settings (0 = none)
    fn settings_version(&self) -> i64;

    /// The engine's current network settings as JSON
    fn settings_json(&self) -> String;

    /// Set the engine log level (0 = debug .. 3 = error)
    fn set_log_level(&self, level: u8);

    /// Rebind the engine's UDP socket after a network path change
    fn rebind_socket(&self) -> String;

    /// Switch the engine's power profile
    fn set_power_mode(&self, mode: &str) -> String;
}

/// Failure reported by the engine
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    /// The engine has no running tunnel
    #[error("engine not running: {0}")]
    NotRunning(String),

    /// The engine returned an error-flagged status
    #[error("{0}")]
    Failed(String),

    /// The blocking call never returned a status (worker panicked or was cancelled)
    #[error("engine call aborted: {0}")]
    Aborted(String),
}

/// Result of a successful engine start
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartedHandle {
    /// Handle the engine now owns
    pub handle: TunnelHandle,
    /// Status line returned by the engine
    pub status: String,
}

/// Turn an engine status line into a result
fn classify(status: String) -> Result<String, EngineError> {
    let lowered = status.to_ascii_lowercase();
    if lowered.contains("error") || lowered.contains("fail") {
        if lowered.contains("not running") {
            return Err(EngineError::NotRunning(status));
        }
        return Err(EngineError::Failed(status));
    }
    Ok(status)
}

/// Init payload in the engine's field naming
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct InitPayload<'a> {
    #[serde(rename = "enableAPI")]
    enable_api: bool,
    socket_path: &'a str,
    log_level: &'a str,
    version: &'a str,
    agent: &'a str,
}

/// Start payload in the engine's field naming
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StartPayload<'a> {
    endpoint: &'a str,
    id: &'a str,
    secret: &'a str,
    mtu: u16,
    dns: &'a str,
    holepunch: bool,
    ping_interval_seconds: u64,
    ping_timeout_seconds: u64,
    user_token: &'a str,
    org_id: &'a str,
    #[serde(rename = "upstreamDNS")]
    upstream_dns: &'a [String],
    #[serde(rename = "overrideDNS")]
    override_dns: bool,
    #[serde(rename = "tunnelDNS")]
    tunnel_dns: bool,
    #[serde(skip_serializing_if = "Map::is_empty")]
    fingerprint: &'a Map<String, Value>,
    #[serde(skip_serializing_if = "Map::is_empty")]
    postures: &'a Map<String, Value>,
}

/// Structured front of an [`EngineBoundary`]
#[derive(Clone)]
pub struct EngineInvoker {
    engine: Arc<dyn EngineBoundary>,
}

impl EngineInvoker {
    pub fn new(engine: Arc<dyn EngineBoundary>) -> Self {
        Self { engine }
    }

    /// Initialize the engine
    pub fn init(&self, config: &EngineInitConfig) -> Result<String, EngineError> {
        let payload = InitPayload {
            enable_api: config.enable_api,
            socket_path: config.socket_path.as_deref().unwrap_or(""),
            log_level: config.log_level.as_str(),
            version: &config.version,
            agent: &config.agent,
        };
        let json = serde_json::to_string(&payload).map_err(|e| {
            EngineError::Failed(format!("Error: failed to encode init config: {}", e))
        })?;

        classify(self.engine.init(&json))
    }

    /// Start the tunnel on `handle`
    pub fn start(
        &self,
        handle: TunnelHandle,
        options: &TunnelOptions,
    ) -> Result<StartedHandle, EngineError> {
        let json = start_payload(options)?;
        let status = classify(self.engine.start_tunnel(handle.raw(), &json))?;
        Ok(StartedHandle { handle, status })
    }

    /// Stop the tunnel
    ///
    /// Stopping an engine that has no tunnel yields [`EngineError::NotRunning`].
    pub fn stop(&self) -> Result<(), EngineError> {
        classify(self.engine.stop_tunnel()).map(|status| {
            log::debug!("Engine stop: {}", status);
        })
    }

    pub fn is_running(&self) -> bool {
        self.engine.is_running()
    }

    pub fn settings_version(&self) -> i64 {
        self.engine.settings_version()
    }

    pub fn settings_json(&self) -> String {
        self.engine.settings_json()
    }

    pub fn set_log_level(&self, level: LogLevel) {
        self.engine.set_log_level(level.as_engine_level());
    }

    pub fn rebind_socket(&self) -> Result<String, EngineError> {
        classify(self.engine.rebind_socket())
    }

    pub fn set_power_mode(&self, mode: &str) -> Result<String, EngineError> {
        classify(self.engine.set_power_mode(mode))
    }
}

fn start_payload(options: &TunnelOptions) -> Result<String, EngineError> {
    let payload = StartPayload {
        endpoint: &options.endpoint,
        id: &options.id,
        secret: &options.secret,
        mtu: options.mtu,
        dns: &options.dns,
        holepunch: options.holepunch,
        ping_interval_seconds: options.ping_interval_secs,
        ping_timeout_seconds: options.ping_timeout_secs,
        user_token: &options.user_token,
        org_id: &options.org_id,
        upstream_dns: &options.upstream_dns,
        override_dns: options.override_dns,
        tunnel_dns: options.tunnel_dns,
        fingerprint: &options.fingerprint,
        postures: &options.postures,
    };
    serde_json::to_string(&payload)
        .map_err(|e| EngineError::Failed(format!("Error: failed to encode tunnel config: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn test_classify_success() {
        assert_eq!(
            classify("Tunnel started with FD: 7".into()),
            Ok("Tunnel started with FD: 7".into())
        );
        assert!(classify("Init completed successfully".into()).is_ok());
    }

    #[test]
    fn test_classify_failure_case_insensitive() {
        assert!(matches!(
            classify("Error: Tunnel already running".into()),
            Err(EngineError::Failed(_))
        ));
        assert!(matches!(
            classify("handshake FAILED".into()),
            Err(EngineError::Failed(_))
        ));
        assert!(matches!(
            classify("ERROR: olm has not been initialized yet!".into()),
            Err(EngineError::Failed(_))
        ));
    }

    #[test]
    fn test_classify_not_running() {
        assert_eq!(
            classify("Error: Tunnel not running".into()),
            Err(EngineError::NotRunning("Error: Tunnel not running".into()))
        );
        // Without an error keyword the line is a plain success
        assert!(classify("Tunnel stopped".into()).is_ok());
    }

    /// Records the payloads it receives and answers with canned lines
    #[derive(Default)]
    struct Recorder {
        last_fd: Mutex<Option<i32>>,
        last_json: Mutex<String>,
        level: Mutex<Option<u8>>,
    }

    impl EngineBoundary for Recorder {
        fn init(&self, config_json: &str) -> String {
            *self.last_json.lock() = config_json.to_string();
            "Init completed successfully".into()
        }
        fn start_tunnel(&self, fd: i32, config_json: &str) -> String {
            *self.last_fd.lock() = Some(fd);
            *self.last_json.lock() = config_json.to_string();
            format!("Tunnel started with FD: {}", fd)
        }
        fn stop_tunnel(&self) -> String {
            "Error: Tunnel not running".into()
        }
        fn is_running(&self) -> bool {
            false
        }
        fn settings_version(&self) -> i64 {
            0
        }
        fn settings_json(&self) -> String {
            "{}".into()
        }
        fn set_log_level(&self, level: u8) {
            *self.level.lock() = Some(level);
        }
        fn rebind_socket(&self) -> String {
            "Socket rebound successfully".into()
        }
        fn set_power_mode(&self, mode: &str) -> String {
            format!("Power mode set to: {}", mode)
        }
    }

    #[test]
    fn test_start_payload() {
        let recorder = Arc::new(Recorder::default());
        let invoker = EngineInvoker::new(recorder.clone());

        let options = TunnelOptions {
            endpoint: "https://pangolin.example.com".into(),
            id: "olm-1".into(),
            secret: "s3cret".into(),
            upstream_dns: vec!["1.1.1.1:53".into()],
            ..Default::default()
        };

        let started = invoker.start(TunnelHandle::new(7), &options).unwrap();
        assert_eq!(started.handle, TunnelHandle::new(7));
        assert_eq!(started.status, "Tunnel started with FD: 7");
        assert_eq!(*recorder.last_fd.lock(), Some(7));

        let json: serde_json::Value = serde_json::from_str(&recorder.last_json.lock()).unwrap();
        assert_eq!(json["endpoint"], "https://pangolin.example.com");
        assert_eq!(json["pingIntervalSeconds"], 3);
        assert_eq!(json["upstreamDNS"][0], "1.1.1.1:53");
        assert_eq!(json["overrideDNS"], false);
        assert!(json.get("fingerprint").is_none());
        assert!(json.get("postures").is_none());
    }

    #[test]
    fn test_start_payload_fingerprint_and_postures() {
        let recorder = Arc::new(Recorder::default());
        let invoker = EngineInvoker::new(recorder.clone());

        let mut options = TunnelOptions::default();
        options
            .fingerprint
            .insert("platform".into(), Value::from("ios"));
        options
            .postures
            .insert("biometricsEnabled".into(), Value::from(true));

        invoker.start(TunnelHandle::new(4), &options).unwrap();

        let json: Value = serde_json::from_str(&recorder.last_json.lock()).unwrap();
        assert_eq!(json["fingerprint"]["platform"], "ios");
        assert_eq!(json["postures"]["biometricsEnabled"], true);
    }

    #[test]
    fn test_init_payload() {
        let recorder = Arc::new(Recorder::default());
        let invoker = EngineInvoker::new(recorder.clone());

        let config = EngineInitConfig {
            log_level: LogLevel::Debug,
            agent: "pango-cli".into(),
            ..Default::default()
        };
        assert!(invoker.init(&config).is_ok());

        let json: serde_json::Value = serde_json::from_str(&recorder.last_json.lock()).unwrap();
        assert_eq!(json["enableAPI"], false);
        assert_eq!(json["logLevel"], "debug");
        assert_eq!(json["agent"], "pango-cli");
    }

    #[test]
    fn test_stop_not_running() {
        let invoker = EngineInvoker::new(Arc::new(Recorder::default()));
        assert!(matches!(invoker.stop(), Err(EngineError::NotRunning(_))));
    }

    #[test]
    fn test_log_level_forwarded() {
        let recorder = Arc::new(Recorder::default());
        let invoker = EngineInvoker::new(recorder.clone());
        invoker.set_log_level(LogLevel::Warn);
        assert_eq!(*recorder.level.lock(), Some(2));
    }
}
