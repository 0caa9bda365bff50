//! OS-side plumbing for the Pango packet tunnel extension
//!
//! This crate covers everything the tunnel controller needs from the
//! operating system before the external tunnel engine can be started:
//!
//! - **Network settings**: the addressing, routing and DNS parameters the OS is
//!   asked to apply to the virtual interface ([`TunnelNetworkSettings`]).
//! - **Settings application**: the asynchronous "apply settings" collaborator
//!   ([`SettingsApplier`]) and a bridge for callback-style completions
//!   ([`apply_channel`]).
//! - **Handle discovery**: a scan of the process descriptor table for the utun
//!   control socket the OS created for the interface ([`ControlSocketScanner`]).
//!
//! # Platform Notes
//!
//! ## macOS / iOS
//!
//! When a Packet Tunnel Provider applies its network settings, the system
//! creates a `utun` interface and hands the extension a connected
//! `PF_SYSTEM`/`SYSPROTO_CONTROL` socket for it. The socket is not exposed
//! through a public API, so the scanner walks descriptors and matches the peer
//! address against the control id of `com.apple.net.utun_control`.
//!
//! ## Other platforms
//!
//! There is no control-socket family; discovery always reports nothing and the
//! controller falls back to the sentinel handle.
//!
//! # Example
//!
//! ```ignore
//! use pango_tun::{ControlSocketScanner, TunnelNetworkSettings};
//!
//! let settings = TunnelNetworkSettings::new("127.0.0.1")
//!     .with_mtu(1500)
//!     .with_ipv4_address("100.89.0.2".parse()?, "255.255.255.0".parse()?)
//!     .route_all_ipv4();
//!
//! applier.apply(&settings).await?;
//! let handle = ControlSocketScanner::new().discover();
//! ```

pub mod applier;
pub mod error;
pub mod handle;
pub mod scanner;
pub mod settings;

pub use applier::{
    apply_channel, ApplyCompletion, ApplyError, LoggingApplier, PendingApply, SettingsApplier,
};
pub use error::{Error, Result};
pub use handle::TunnelHandle;
pub use scanner::{
    ControlSocketScanner, DescriptorTable, HandleDiscovery, SystemDescriptors, DEFAULT_SCAN_LIMIT,
    UTUN_CONTROL_NAME,
};
pub use settings::{Ipv4Route, Ipv6Route, TunnelNetworkSettings};

/// Default MTU for the tunnel interface
pub const DEFAULT_MTU: u16 = 1280;

/// Smallest MTU accepted for an IPv4 tunnel
pub const MIN_MTU: u16 = 576;
