//! Pango Engine
//!
//! This crate drives the lifecycle of a tunnel engine inside a packet tunnel
//! extension: it applies the interface settings, finds the utun handle, starts
//! the engine on it, supervises the run, and tears it down within a bound.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Host Layer                               │
//! │  ┌─────────────────┐              ┌─────────────────────┐   │
//! │  │   pango-cli     │              │  Packet tunnel ext. │   │
//! │  └────────┬────────┘              └──────────┬──────────┘   │
//! │           └───────────────┬──────────────────┘              │
//! │                           ▼                                 │
//! │  ┌────────────────────────────────────────────────────────┐ │
//! │  │                   pango-engine                         │ │
//! │  │  - TunnelController (lifecycle state machine)          │ │
//! │  │  - EngineInvoker (status-line boundary)                │ │
//! │  │  - SettingsSnapshot (versioned settings relay)         │ │
//! │  │  - Config / events / control socket                    │ │
//! │  └────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────┘
//!                           │
//!                           ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │  pango-tun: network settings, apply handshake, utun scanner │
//! │  tunnel engine: behind the EngineBoundary trait             │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod boundary;
pub mod config;
#[cfg(unix)]
pub mod control;
pub mod controller;
pub mod dry_run;
pub mod error;
pub mod event;
pub mod shutdown;
pub mod snapshot;

pub use boundary::{EngineBoundary, EngineError, EngineInvoker, StartedHandle};
pub use config::{Config, ControllerConfig, EngineInitConfig, TunnelOptions};
#[cfg(unix)]
pub use control::{
    ControlClient, ControlRequest, ControlResponse, ControlServer, StatusInfo, DEFAULT_SOCKET_PATH,
};
pub use controller::{ControllerBuilder, StartRequest, TunnelController};
pub use dry_run::DryRunEngine;
pub use error::{Error, Result};
pub use event::{
    ControllerEvent, EventHandler, LifecycleState, LogLevel, LoggingEventHandler, StopReason,
};
pub use shutdown::{CancelSignal, CancellableTask, JoinOutcome};
pub use snapshot::{SettingsSnapshot, EMPTY_SETTINGS_JSON};
