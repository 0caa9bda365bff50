//! Versioned cache of the engine's network settings

use pango_tun::TunnelNetworkSettings;

use crate::error::Result;

/// JSON returned when no settings are available
pub const EMPTY_SETTINGS_JSON: &str = "{}";

/// Last network settings published by the engine
///
/// The JSON is relayed verbatim. The version only moves forward; an update
/// carrying a version at or below the cached one is ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettingsSnapshot {
    version: i64,
    json: String,
}

impl Default for SettingsSnapshot {
    fn default() -> Self {
        Self::empty()
    }
}

impl SettingsSnapshot {
    /// Snapshot meaning "no settings yet"
    pub fn empty() -> Self {
        Self {
            version: 0,
            json: EMPTY_SETTINGS_JSON.to_string(),
        }
    }

    pub fn version(&self) -> i64 {
        self.version
    }

    pub fn json(&self) -> &str {
        &self.json
    }

    pub fn is_empty(&self) -> bool {
        self.version == 0
    }

    /// Store a newer snapshot
    ///
    /// Returns `true` if the snapshot was replaced.
    pub fn update(&mut self, version: i64, json: String) -> bool {
        if version <= self.version {
            return false;
        }
        self.version = version;
        self.json = if json.trim().is_empty() {
            EMPTY_SETTINGS_JSON.to_string()
        } else {
            json
        };
        true
    }

    /// Forget everything, back to version 0
    pub fn reset(&mut self) {
        *self = Self::empty();
    }

    /// Decode the relayed JSON
    pub fn settings(&self) -> Result<TunnelNetworkSettings> {
        Ok(TunnelNetworkSettings::from_json(&self.json)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty() {
        let snapshot = SettingsSnapshot::empty();
        assert_eq!(snapshot.version(), 0);
        assert_eq!(snapshot.json(), "{}");
        assert!(snapshot.is_empty());
        assert_eq!(snapshot.settings().unwrap(), TunnelNetworkSettings::default());
    }

    #[test]
    fn test_version_never_decreases() {
        let mut snapshot = SettingsSnapshot::empty();

        assert!(snapshot.update(2, r#"{"mtu":1280}"#.into()));
        assert!(!snapshot.update(1, r#"{"mtu":9000}"#.into()));
        assert!(!snapshot.update(2, r#"{"mtu":9000}"#.into()));

        assert_eq!(snapshot.version(), 2);
        assert_eq!(snapshot.json(), r#"{"mtu":1280}"#);
    }

    #[test]
    fn test_reset() {
        let mut snapshot = SettingsSnapshot::empty();
        snapshot.update(5, r#"{"mtu":1280}"#.into());
        snapshot.reset();

        assert_eq!(snapshot, SettingsSnapshot::empty());
        // A new generation may start counting from 1 again
        assert!(snapshot.update(1, r#"{"mtu":1400}"#.into()));
    }

    #[test]
    fn test_blank_json_becomes_empty_object() {
        let mut snapshot = SettingsSnapshot::empty();
        snapshot.update(1, "  ".into());
        assert_eq!(snapshot.json(), "{}");
    }

    #[test]
    fn test_settings_decode() {
        let mut snapshot = SettingsSnapshot::empty();
        snapshot.update(1, r#"{"tunnel_remote_address":"127.0.0.1","mtu":1500}"#.into());

        let settings = snapshot.settings().unwrap();
        assert_eq!(settings.tunnel_remote_address, "127.0.0.1");
        assert_eq!(settings.mtu, Some(1500));
    }
}
