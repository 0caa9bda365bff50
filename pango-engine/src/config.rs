//! Configuration types for the tunnel controller

use std::path::{Path, PathBuf};
use std::time::Duration;

use pango_tun::{TunnelNetworkSettings, DEFAULT_MTU, DEFAULT_SCAN_LIMIT, MIN_MTU};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::event::LogLevel;

/// Main configuration structure
///
/// The configuration file uses TOML format:
///
/// ```toml
/// [controller]
/// scan_limit = 1024
/// shutdown_timeout_secs = 5
///
/// [engine]
/// log_level = "info"
/// agent = "pango-cli"
///
/// [tunnel]
/// endpoint = "https://pangolin.example.com"
/// id = "olm-id"
/// secret = "olm-secret"
///
/// [network]
/// tunnel_remote_address = "127.0.0.1"
/// mtu = 1280
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Lifecycle controller settings
    #[serde(default)]
    pub controller: ControllerConfig,

    /// One-time engine initialization
    #[serde(default)]
    pub engine: EngineInitConfig,

    /// Per-start engine options
    #[serde(default)]
    pub tunnel: TunnelOptions,

    /// Settings for the virtual interface
    pub network: Option<TunnelNetworkSettings>,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.controller.validate()?;
        self.tunnel.validate()?;

        if let Some(ref network) = self.network {
            network
                .validate()
                .map_err(|e| Error::Config(format!("network: {}", e)))?;
        }

        Ok(())
    }

    /// Get the network settings, or error if not present
    pub fn network_settings(&self) -> Result<&TunnelNetworkSettings> {
        self.network
            .as_ref()
            .ok_or_else(|| Error::Config("network configuration is required".into()))
    }

    /// Generate a sample configuration
    pub fn sample() -> String {
        r#"# Pango tunnel configuration

[controller]
# Highest descriptor number inspected when looking for the utun control socket.
# The socket is usually a low descriptor; raise this if the extension keeps
# many files open.
scan_limit = 1024

# Seconds to wait for the background engine task when stopping.
# The tunnel is reported stopped after this even if the task is stuck.
shutdown_timeout_secs = 5

# How often the engine's network settings are polled, in milliseconds
settings_poll_ms = 500

# Control socket for `pango status` / `pango stop` (optional)
# control_socket = "/tmp/pango.sock"

[engine]
# Engine log level: "debug", "info", "warn", "error"
log_level = "info"

# Expose the engine's own local API
enable_api = false
# socket_path = "/tmp/olm.sock"

version = "0.1.0"
agent = "pango-cli"

[tunnel]
endpoint = "https://pangolin.example.com"
id = "your-client-id"
secret = "your-client-secret"
mtu = 1280
holepunch = false
ping_interval_secs = 3
ping_timeout_secs = 5
upstream_dns = ["8.8.8.8:53"]
override_dns = false
tunnel_dns = false

# Device details reported to the server on connect (optional)
# [tunnel.fingerprint]
# platform = "macos"

[network]
tunnel_remote_address = "127.0.0.1"
mtu = 1280
dns_servers = ["100.96.128.1"]
ipv4_addresses = ["100.89.128.2"]
ipv4_subnet_masks = ["255.255.255.0"]

[[network.ipv4_included_routes]]
destination_address = "100.89.128.0"
subnet_mask = "255.255.255.0"
"#
        .to_string()
    }
}

/// Lifecycle controller settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Highest descriptor number scanned for the utun control socket
    #[serde(default = "default_scan_limit")]
    pub scan_limit: i32,

    /// Bound on waiting for the background task during stop, in seconds
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,

    /// Engine settings poll interval, in milliseconds
    #[serde(default = "default_settings_poll")]
    pub settings_poll_ms: u64,

    /// Control socket path (optional)
    pub control_socket: Option<PathBuf>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            scan_limit: default_scan_limit(),
            shutdown_timeout_secs: default_shutdown_timeout(),
            settings_poll_ms: default_settings_poll(),
            control_socket: None,
        }
    }
}

impl ControllerConfig {
    /// Validate controller settings
    pub fn validate(&self) -> Result<()> {
        if !(0..=65535).contains(&self.scan_limit) {
            return Err(Error::Config(format!(
                "scan_limit {} out of range (0-65535)",
                self.scan_limit
            )));
        }

        if self.shutdown_timeout_secs == 0 {
            return Err(Error::Config(
                "shutdown_timeout_secs must be greater than 0".into(),
            ));
        }

        if self.settings_poll_ms < 10 {
            return Err(Error::Config(format!(
                "settings_poll_ms {} is too small (minimum 10)",
                self.settings_poll_ms
            )));
        }

        Ok(())
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn settings_poll_interval(&self) -> Duration {
        Duration::from_millis(self.settings_poll_ms)
    }
}

/// Engine initialization settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineInitConfig {
    /// Expose the engine's local API
    #[serde(default)]
    pub enable_api: bool,

    /// Socket path for the engine's local API
    pub socket_path: Option<String>,

    /// Engine log level
    #[serde(default)]
    pub log_level: LogLevel,

    /// Application version reported by the engine
    #[serde(default)]
    pub version: String,

    /// Agent string reported by the engine
    #[serde(default)]
    pub agent: String,
}

/// Options handed to the engine with each tunnel start
#[derive(Clone, Serialize, Deserialize)]
pub struct TunnelOptions {
    /// Coordination server URL
    #[serde(default)]
    pub endpoint: String,

    /// Client identifier
    #[serde(default)]
    pub id: String,

    /// Client secret
    #[serde(default)]
    pub secret: String,

    /// Tunnel MTU
    #[serde(default = "default_mtu")]
    pub mtu: u16,

    /// In-tunnel DNS server address
    #[serde(default)]
    pub dns: String,

    /// Attempt direct peer connections
    #[serde(default)]
    pub holepunch: bool,

    /// Keepalive ping interval in seconds
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,

    /// Keepalive ping timeout in seconds
    #[serde(default = "default_ping_timeout")]
    pub ping_timeout_secs: u64,

    /// Session token of the signed-in user
    #[serde(default)]
    pub user_token: String,

    /// Organization the session belongs to
    #[serde(default)]
    pub org_id: String,

    /// Upstream DNS resolvers ("host:port")
    #[serde(default)]
    pub upstream_dns: Vec<String>,

    /// Override the system DNS while connected
    #[serde(default)]
    pub override_dns: bool,

    /// Resolve through the tunnel
    #[serde(default)]
    pub tunnel_dns: bool,

    /// Device fingerprint reported on connect
    #[serde(default)]
    pub fingerprint: serde_json::Map<String, serde_json::Value>,

    /// Posture checks reported on connect
    #[serde(default)]
    pub postures: serde_json::Map<String, serde_json::Value>,
}

impl Default for TunnelOptions {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            id: String::new(),
            secret: String::new(),
            mtu: default_mtu(),
            dns: String::new(),
            holepunch: false,
            ping_interval_secs: default_ping_interval(),
            ping_timeout_secs: default_ping_timeout(),
            user_token: String::new(),
            org_id: String::new(),
            upstream_dns: Vec::new(),
            override_dns: false,
            tunnel_dns: false,
            fingerprint: serde_json::Map::new(),
            postures: serde_json::Map::new(),
        }
    }
}

impl TunnelOptions {
    /// Validate tunnel options
    pub fn validate(&self) -> Result<()> {
        if self.mtu < MIN_MTU {
            return Err(Error::Config(format!(
                "MTU {} is too small (minimum {})",
                self.mtu, MIN_MTU
            )));
        }

        if self.ping_timeout_secs != 0 && self.ping_timeout_secs < self.ping_interval_secs {
            return Err(Error::Config(format!(
                "ping_timeout_secs ({}) must not be shorter than ping_interval_secs ({})",
                self.ping_timeout_secs, self.ping_interval_secs
            )));
        }

        Ok(())
    }
}

// Secrets stay out of logs
impl std::fmt::Debug for TunnelOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelOptions")
            .field("endpoint", &self.endpoint)
            .field("id", &self.id)
            .field("secret", &redacted(&self.secret))
            .field("mtu", &self.mtu)
            .field("dns", &self.dns)
            .field("holepunch", &self.holepunch)
            .field("ping_interval_secs", &self.ping_interval_secs)
            .field("ping_timeout_secs", &self.ping_timeout_secs)
            .field("user_token", &redacted(&self.user_token))
            .field("org_id", &self.org_id)
            .field("upstream_dns", &self.upstream_dns)
            .field("override_dns", &self.override_dns)
            .field("tunnel_dns", &self.tunnel_dns)
            .field("fingerprint", &self.fingerprint)
            .field("postures", &self.postures)
            .finish()
    }
}

fn redacted(value: &str) -> &'static str {
    if value.is_empty() {
        ""
    } else {
        "<redacted>"
    }
}

fn default_scan_limit() -> i32 {
    DEFAULT_SCAN_LIMIT
}

fn default_shutdown_timeout() -> u64 {
    5
}

fn default_settings_poll() -> u64 {
    500
}

fn default_mtu() -> u16 {
    DEFAULT_MTU
}

fn default_ping_interval() -> u64 {
    3
}

fn default_ping_timeout() -> u64 {
    5
}
