//! Tunnel network settings
//!
//! The settings describe the virtual interface the OS should create: the
//! remote endpoint, MTU, DNS servers and per-family addresses and routes.
//! The serialized form uses the same flat snake_case keys as the engine's
//! settings snapshot, so a snapshot can be read back with
//! [`TunnelNetworkSettings::from_json`].

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::MIN_MTU;

/// An IPv4 route
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ipv4Route {
    /// Destination address
    pub destination_address: Ipv4Addr,
    /// Subnet mask
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subnet_mask: Option<Ipv4Addr>,
    /// Gateway (optional)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway_address: Option<Ipv4Addr>,
    /// Whether this is the default route
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_default: bool,
}

impl Ipv4Route {
    /// Create a new route
    pub fn new(destination: Ipv4Addr, subnet_mask: Ipv4Addr) -> Self {
        Self {
            destination_address: destination,
            subnet_mask: Some(subnet_mask),
            gateway_address: None,
            is_default: false,
        }
    }

    /// Create the default route (0.0.0.0/0) - routes all traffic
    pub fn default_route() -> Self {
        Self {
            destination_address: Ipv4Addr::UNSPECIFIED,
            subnet_mask: Some(Ipv4Addr::UNSPECIFIED),
            gateway_address: None,
            is_default: true,
        }
    }

    /// Set the gateway
    pub fn with_gateway(mut self, gateway: Ipv4Addr) -> Self {
        self.gateway_address = Some(gateway);
        self
    }

    fn validate(&self) -> Result<()> {
        if let Some(mask) = self.subnet_mask {
            if !is_contiguous_mask(mask) {
                return Err(Error::InvalidAddress(format!(
                    "non-contiguous subnet mask {} for route {}",
                    mask, self.destination_address
                )));
            }
        }
        Ok(())
    }
}

/// An IPv6 route
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ipv6Route {
    /// Destination address
    pub destination_address: Ipv6Addr,
    /// Network prefix length
    #[serde(default)]
    pub network_prefix_length: u8,
    /// Gateway (optional)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway_address: Option<Ipv6Addr>,
    /// Whether this is the default route
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_default: bool,
}

impl Ipv6Route {
    /// Create a new route
    pub fn new(destination: Ipv6Addr, prefix_length: u8) -> Self {
        Self {
            destination_address: destination,
            network_prefix_length: prefix_length,
            gateway_address: None,
            is_default: false,
        }
    }

    /// Create the default route (::/0) - routes all traffic
    pub fn default_route() -> Self {
        Self {
            destination_address: Ipv6Addr::UNSPECIFIED,
            network_prefix_length: 0,
            gateway_address: None,
            is_default: true,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.network_prefix_length > 128 {
            return Err(Error::InvalidSettings(format!(
                "prefix length {} for route {} exceeds 128",
                self.network_prefix_length, self.destination_address
            )));
        }
        Ok(())
    }
}

/// Network settings for the virtual tunnel interface
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelNetworkSettings {
    /// Remote tunnel address (server endpoint)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tunnel_remote_address: String,
    /// Interface MTU
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtu: Option<u16>,
    /// DNS servers
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dns_servers: Vec<IpAddr>,
    /// Local IPv4 addresses
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ipv4_addresses: Vec<Ipv4Addr>,
    /// Subnet masks (one per IPv4 address)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ipv4_subnet_masks: Vec<Ipv4Addr>,
    /// IPv4 routes sent through the tunnel
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ipv4_included_routes: Vec<Ipv4Route>,
    /// IPv4 routes that bypass the tunnel
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ipv4_excluded_routes: Vec<Ipv4Route>,
    /// Local IPv6 addresses
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ipv6_addresses: Vec<Ipv6Addr>,
    /// Prefix lengths (one per IPv6 address), carried as strings on the wire
    #[serde(
        default,
        skip_serializing_if = "Vec::is_empty",
        with = "prefix_strings"
    )]
    pub ipv6_network_prefixes: Vec<u8>,
    /// IPv6 routes sent through the tunnel
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ipv6_included_routes: Vec<Ipv6Route>,
    /// IPv6 routes that bypass the tunnel
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ipv6_excluded_routes: Vec<Ipv6Route>,
}

impl TunnelNetworkSettings {
    /// Create settings for the given remote endpoint
    pub fn new(tunnel_remote_address: impl Into<String>) -> Self {
        Self {
            tunnel_remote_address: tunnel_remote_address.into(),
            ..Default::default()
        }
    }

    /// Set MTU
    pub fn with_mtu(mut self, mtu: u16) -> Self {
        self.mtu = Some(mtu);
        self
    }

    /// Set DNS servers
    pub fn with_dns(mut self, servers: Vec<IpAddr>) -> Self {
        self.dns_servers = servers;
        self
    }

    /// Add a local IPv4 address
    pub fn with_ipv4_address(mut self, address: Ipv4Addr, subnet_mask: Ipv4Addr) -> Self {
        self.ipv4_addresses.push(address);
        self.ipv4_subnet_masks.push(subnet_mask);
        self
    }

    /// Route all IPv4 traffic through the tunnel
    pub fn route_all_ipv4(mut self) -> Self {
        self.ipv4_included_routes.push(Ipv4Route::default_route());
        self
    }

    /// Add an IPv4 route through the tunnel
    pub fn with_ipv4_route(mut self, route: Ipv4Route) -> Self {
        self.ipv4_included_routes.push(route);
        self
    }

    /// Exclude an IPv4 route from the tunnel
    pub fn exclude_ipv4_route(mut self, route: Ipv4Route) -> Self {
        self.ipv4_excluded_routes.push(route);
        self
    }

    /// Add a local IPv6 address
    pub fn with_ipv6_address(mut self, address: Ipv6Addr, prefix_length: u8) -> Self {
        self.ipv6_addresses.push(address);
        self.ipv6_network_prefixes.push(prefix_length);
        self
    }

    /// Route all IPv6 traffic through the tunnel
    pub fn route_all_ipv6(mut self) -> Self {
        self.ipv6_included_routes.push(Ipv6Route::default_route());
        self
    }

    /// Add an IPv6 route through the tunnel
    pub fn with_ipv6_route(mut self, route: Ipv6Route) -> Self {
        self.ipv6_included_routes.push(route);
        self
    }

    /// Exclude an IPv6 route from the tunnel
    pub fn exclude_ipv6_route(mut self, route: Ipv6Route) -> Self {
        self.ipv6_excluded_routes.push(route);
        self
    }

    /// Validate the settings before handing them to the OS
    pub fn validate(&self) -> Result<()> {
        if self.tunnel_remote_address.trim().is_empty() {
            return Err(Error::InvalidSettings(
                "tunnel remote address is required".into(),
            ));
        }

        if let Some(mtu) = self.mtu {
            if mtu < MIN_MTU {
                return Err(Error::InvalidSettings(format!(
                    "MTU {} is too small (minimum {})",
                    mtu, MIN_MTU
                )));
            }
        }

        if self.ipv4_addresses.len() != self.ipv4_subnet_masks.len() {
            return Err(Error::InvalidSettings(format!(
                "{} IPv4 addresses but {} subnet masks",
                self.ipv4_addresses.len(),
                self.ipv4_subnet_masks.len()
            )));
        }
        for mask in &self.ipv4_subnet_masks {
            if !is_contiguous_mask(*mask) {
                return Err(Error::InvalidAddress(format!(
                    "non-contiguous subnet mask {}",
                    mask
                )));
            }
        }

        if self.ipv6_addresses.len() != self.ipv6_network_prefixes.len() {
            return Err(Error::InvalidSettings(format!(
                "{} IPv6 addresses but {} network prefixes",
                self.ipv6_addresses.len(),
                self.ipv6_network_prefixes.len()
            )));
        }
        if let Some(prefix) = self.ipv6_network_prefixes.iter().find(|p| **p > 128) {
            return Err(Error::InvalidSettings(format!(
                "IPv6 prefix length {} exceeds 128",
                prefix
            )));
        }

        self.ipv4_included_routes
            .iter()
            .chain(&self.ipv4_excluded_routes)
            .try_for_each(Ipv4Route::validate)?;
        self.ipv6_included_routes
            .iter()
            .chain(&self.ipv6_excluded_routes)
            .try_for_each(Ipv6Route::validate)?;

        Ok(())
    }

    /// Whether the IPv4 default route is sent through the tunnel
    pub fn routes_all_ipv4(&self) -> bool {
        self.ipv4_included_routes.iter().any(|r| r.is_default)
    }

    /// Serialize to the engine's JSON form
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse the engine's JSON form
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Engine writes prefix lengths as `["64"]`; bare numbers are accepted too
mod prefix_strings {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Prefix {
        Number(u8),
        Text(String),
    }

    pub fn serialize<S>(value: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_seq(value.iter().map(|p| p.to_string()))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Vec::<Prefix>::deserialize(deserializer)?
            .into_iter()
            .map(|prefix| match prefix {
                Prefix::Number(n) => Ok(n),
                Prefix::Text(text) => text.trim().parse().map_err(|_| {
                    D::Error::custom(format!("invalid IPv6 prefix length: {:?}", text))
                }),
            })
            .collect()
    }
}

fn is_false(value: &bool) -> bool {
    !*value
}

fn is_contiguous_mask(mask: Ipv4Addr) -> bool {
    let bits = u32::from(mask);
    bits.leading_ones() + bits.trailing_zeros() == 32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> TunnelNetworkSettings {
        TunnelNetworkSettings::new("127.0.0.1")
            .with_mtu(1500)
            .with_ipv4_address(Ipv4Addr::new(100, 89, 0, 2), Ipv4Addr::new(255, 255, 255, 0))
            .route_all_ipv4()
            .with_dns(vec!["100.96.128.1".parse().unwrap()])
    }

    #[test]
    fn test_builder() {
        let settings = sample();
        assert_eq!(settings.tunnel_remote_address, "127.0.0.1");
        assert_eq!(settings.mtu, Some(1500));
        assert!(settings.routes_all_ipv4());
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_json_keys_and_omitted_fields() {
        let json = sample().to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(value["tunnel_remote_address"], "127.0.0.1");
        assert_eq!(value["mtu"], 1500);
        assert_eq!(value["ipv4_subnet_masks"][0], "255.255.255.0");
        assert_eq!(value["ipv4_included_routes"][0]["destination_address"], "0.0.0.0");
        assert_eq!(value["ipv4_included_routes"][0]["is_default"], true);
        assert!(value.get("ipv6_addresses").is_none());
        assert!(value.get("ipv4_excluded_routes").is_none());
    }

    #[test]
    fn test_empty_settings_serialize_to_empty_object() {
        assert_eq!(TunnelNetworkSettings::default().to_json().unwrap(), "{}");
    }

    #[test]
    fn test_parse_engine_json() {
        let json = r#"{
            "tunnel_remote_address": "203.0.113.9",
            "mtu": 1280,
            "ipv4_addresses": ["100.89.0.5"],
            "ipv4_subnet_masks": ["255.255.255.255"],
            "ipv4_included_routes": [
                {"destination_address": "100.89.0.0", "subnet_mask": "255.255.0.0"}
            ],
            "ipv6_included_routes": [
                {"destination_address": "::", "is_default": true}
            ]
        }"#;

        let settings = TunnelNetworkSettings::from_json(json).unwrap();
        assert_eq!(settings.mtu, Some(1280));
        assert_eq!(settings.ipv4_included_routes[0].gateway_address, None);
        assert!(settings.ipv6_included_routes[0].is_default);
        assert_eq!(settings.ipv6_included_routes[0].network_prefix_length, 0);
    }

    #[test]
    fn test_ipv6_prefixes_as_strings() {
        let json = r#"{
            "tunnel_remote_address": "203.0.113.9",
            "ipv6_addresses": ["fd00::5", "fd01::5"],
            "ipv6_network_prefixes": ["64", 48],
            "ipv6_included_routes": [
                {"destination_address": "fd00::", "network_prefix_length": 64}
            ]
        }"#;

        let settings = TunnelNetworkSettings::from_json(json).unwrap();
        assert_eq!(settings.ipv6_network_prefixes, vec![64, 48]);
        assert_eq!(settings.ipv6_included_routes[0].network_prefix_length, 64);
        assert!(settings.validate().is_ok());

        let value: serde_json::Value =
            serde_json::from_str(&settings.to_json().unwrap()).unwrap();
        assert_eq!(value["ipv6_network_prefixes"][0], "64");
        assert_eq!(value["ipv6_network_prefixes"][1], "48");

        let bad = r#"{"ipv6_addresses": ["fd00::5"], "ipv6_network_prefixes": ["/64"]}"#;
        assert!(TunnelNetworkSettings::from_json(bad).is_err());
    }

    #[test]
    fn test_validation_requires_remote() {
        let settings = TunnelNetworkSettings::new("  ").with_mtu(1500);
        assert!(settings.validate().unwrap_err().is_invalid_settings());
    }

    #[test]
    fn test_validation_mtu() {
        let settings = TunnelNetworkSettings::new("127.0.0.1").with_mtu(100);
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_validation_mask_count() {
        let mut settings = sample();
        settings.ipv4_subnet_masks.clear();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_validation_non_contiguous_mask() {
        let settings = TunnelNetworkSettings::new("127.0.0.1")
            .with_ipv4_address(Ipv4Addr::new(10, 0, 0, 2), Ipv4Addr::new(255, 0, 255, 0));
        assert!(settings.validate().is_err());

        let settings = TunnelNetworkSettings::new("127.0.0.1").exclude_ipv4_route(Ipv4Route::new(
            Ipv4Addr::new(192, 168, 0, 0),
            Ipv4Addr::new(255, 255, 0, 255),
        ));
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_validation_ipv6_prefix() {
        let settings = TunnelNetworkSettings::new("127.0.0.1")
            .with_ipv6_address("fd00::2".parse().unwrap(), 129);
        assert!(settings.validate().is_err());

        let settings = TunnelNetworkSettings::new("127.0.0.1")
            .with_ipv6_address("fd00::2".parse().unwrap(), 64)
            .route_all_ipv6();
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_ipv4_route() {
        let route = Ipv4Route::default_route();
        assert_eq!(route.destination_address, Ipv4Addr::UNSPECIFIED);
        assert!(route.is_default);

        let route = Ipv4Route::new(Ipv4Addr::new(10, 0, 0, 0), Ipv4Addr::new(255, 0, 0, 0))
            .with_gateway(Ipv4Addr::new(10, 0, 0, 1));
        assert!(route.gateway_address.is_some());
        assert!(!route.is_default);
    }
}
