//! In-process engine that simulates the tunnel engine
//!
//! `DryRunEngine` answers every [`EngineBoundary`] call with the same status
//! lines the real engine uses, keeps a network-settings store with a version
//! counter, and never touches the network. The CLI uses it to exercise the
//! controller end to end; tests use it as a well-behaved engine.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use parking_lot::Mutex;
use pango_tun::{Ipv4Route, Ipv6Route, TunnelNetworkSettings};
use serde::Deserialize;

use crate::boundary::EngineBoundary;
use crate::snapshot::EMPTY_SETTINGS_JSON;

/// Fields of the start payload the dry run cares about
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartFields {
    #[serde(default)]
    endpoint: String,
    #[serde(default)]
    mtu: Option<u16>,
}

#[derive(Default)]
struct DryRunState {
    initialized: bool,
    running: bool,
    last_fd: Option<i32>,
    starts: usize,
    stops: usize,
    log_level: Option<u8>,
    power_mode: Option<String>,
    settings: TunnelNetworkSettings,
    version: i64,
}

impl DryRunState {
    fn not_running(&self) -> Option<String> {
        if self.running {
            None
        } else {
            log::warn!("Tunnel is not running");
            Some("Error: Tunnel not running".to_string())
        }
    }
}

/// Simulated tunnel engine
#[derive(Default)]
pub struct DryRunEngine {
    state: Mutex<DryRunState>,
}

impl DryRunEngine {
    /// Engine that still needs `init` before it accepts a start
    pub fn new() -> Self {
        Self::default()
    }

    /// Engine that has already been through `init`
    pub fn initialized() -> Self {
        let engine = Self::default();
        engine.state.lock().initialized = true;
        engine
    }

    /// Whether a tunnel is up
    pub fn is_tunnel_running(&self) -> bool {
        self.state.lock().running
    }

    /// Whether `init` has succeeded
    pub fn is_initialized(&self) -> bool {
        self.state.lock().initialized
    }

    /// Descriptor passed to the most recent start
    pub fn last_fd(&self) -> Option<i32> {
        self.state.lock().last_fd
    }

    /// Number of accepted starts
    pub fn start_count(&self) -> usize {
        self.state.lock().starts
    }

    /// Number of stop calls, successful or not
    pub fn stop_count(&self) -> usize {
        self.state.lock().stops
    }

    /// Last numeric log level received
    pub fn log_level(&self) -> Option<u8> {
        self.state.lock().log_level
    }

    /// Last power mode received
    pub fn power_mode(&self) -> Option<String> {
        self.state.lock().power_mode.clone()
    }

    /// Make the tunnel loop exit as if the engine shut itself down
    pub fn terminate(&self) {
        let mut state = self.state.lock();
        if state.running {
            log::info!("Dry-run tunnel terminated");
        }
        state.running = false;
    }

    fn update<F>(&self, change: F)
    where
        F: FnOnce(&mut TunnelNetworkSettings),
    {
        let mut state = self.state.lock();
        change(&mut state.settings);
        state.version += 1;
    }

    pub fn set_tunnel_remote_address(&self, address: impl Into<String>) {
        let address = address.into();
        log::info!("Set tunnel remote address: {}", address);
        self.update(|s| s.tunnel_remote_address = address);
    }

    pub fn set_mtu(&self, mtu: u16) {
        self.update(|s| s.mtu = Some(mtu));
    }

    pub fn set_dns_servers(&self, servers: Vec<IpAddr>) {
        self.update(|s| s.dns_servers = servers);
    }

    pub fn set_ipv4_settings(&self, addresses: Vec<Ipv4Addr>, subnet_masks: Vec<Ipv4Addr>) {
        self.update(|s| {
            s.ipv4_addresses = addresses;
            s.ipv4_subnet_masks = subnet_masks;
        });
    }

    pub fn set_ipv4_included_routes(&self, routes: Vec<Ipv4Route>) {
        self.update(|s| s.ipv4_included_routes = routes);
    }

    pub fn set_ipv4_excluded_routes(&self, routes: Vec<Ipv4Route>) {
        self.update(|s| s.ipv4_excluded_routes = routes);
    }

    pub fn set_ipv6_settings(&self, addresses: Vec<Ipv6Addr>, network_prefixes: Vec<u8>) {
        self.update(|s| {
            s.ipv6_addresses = addresses;
            s.ipv6_network_prefixes = network_prefixes;
        });
    }

    pub fn set_ipv6_included_routes(&self, routes: Vec<Ipv6Route>) {
        self.update(|s| s.ipv6_included_routes = routes);
    }

    pub fn set_ipv6_excluded_routes(&self, routes: Vec<Ipv6Route>) {
        self.update(|s| s.ipv6_excluded_routes = routes);
    }

    /// Drop all network settings; still counts as a change
    pub fn clear_network_settings(&self) {
        log::info!("Cleared all network settings");
        self.update(|s| *s = TunnelNetworkSettings::default());
    }
}

impl EngineBoundary for DryRunEngine {
    fn init(&self, config_json: &str) -> String {
        if let Err(e) = serde_json::from_str::<serde_json::Value>(config_json) {
            return format!("Error: Failed to parse config JSON: {}", e);
        }
        self.state.lock().initialized = true;
        "Init completed successfully".to_string()
    }

    fn start_tunnel(&self, fd: i32, config_json: &str) -> String {
        let mut state = self.state.lock();
        if !state.initialized {
            return "Error: olm has not been initialized yet!".to_string();
        }
        if state.running {
            log::warn!("Tunnel is already running");
            return "Error: Tunnel already running".to_string();
        }

        let fields: StartFields = match serde_json::from_str(config_json) {
            Ok(fields) => fields,
            Err(e) => return format!("Error: Failed to parse config JSON: {}", e),
        };

        state.running = true;
        state.last_fd = Some(fd);
        state.starts += 1;

        // Publish an initial set, as the engine does once connected
        if !fields.endpoint.is_empty() {
            state.settings.tunnel_remote_address = fields.endpoint;
        }
        if fields.mtu.is_some() {
            state.settings.mtu = fields.mtu;
        }
        state.version += 1;

        log::debug!("Dry-run tunnel started on fd {}", fd);
        "Tunnel started".to_string()
    }

    fn stop_tunnel(&self) -> String {
        let mut state = self.state.lock();
        state.stops += 1;
        if let Some(status) = state.not_running() {
            return status;
        }
        state.running = false;
        "Tunnel stopped".to_string()
    }

    fn is_running(&self) -> bool {
        self.state.lock().running
    }

    fn settings_version(&self) -> i64 {
        let state = self.state.lock();
        if state.running {
            state.version
        } else {
            0
        }
    }

    fn settings_json(&self) -> String {
        let state = self.state.lock();
        if !state.running {
            return EMPTY_SETTINGS_JSON.to_string();
        }
        state.settings.to_json().unwrap_or_else(|e| {
            log::error!("Failed to marshal network settings: {}", e);
            EMPTY_SETTINGS_JSON.to_string()
        })
    }

    fn set_log_level(&self, level: u8) {
        self.state.lock().log_level = Some(level);
    }

    fn rebind_socket(&self) -> String {
        let state = self.state.lock();
        if let Some(status) = state.not_running() {
            return status;
        }
        "Socket rebound successfully".to_string()
    }

    fn set_power_mode(&self, mode: &str) -> String {
        let mut state = self.state.lock();
        if let Some(status) = state.not_running() {
            return status;
        }
        state.power_mode = Some(mode.to_string());
        format!("Power mode set to: {}", mode)
    }
}
