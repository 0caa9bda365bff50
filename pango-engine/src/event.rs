//! Lifecycle states and controller events

use std::str::FromStr;

use pango_tun::TunnelHandle;
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Lifecycle state of the tunnel engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    /// No engine instance exists
    Stopped,
    /// Settings are being applied and the engine started
    Starting,
    /// Engine is running and owned by a background task
    Running,
    /// Background work is being cancelled and the engine stopped
    Stopping,
}

impl LifecycleState {
    /// Check if an engine generation is in flight
    pub fn is_active(&self) -> bool {
        !matches!(self, LifecycleState::Stopped)
    }

    /// Check if a stop request is accepted in this state
    pub fn is_stoppable(&self) -> bool {
        matches!(self, LifecycleState::Starting | LifecycleState::Running)
    }

    /// Check whether `self -> next` is a legal transition
    pub fn can_transition_to(&self, next: LifecycleState) -> bool {
        use LifecycleState::*;
        matches!(
            (self, next),
            (Stopped, Starting)
                | (Starting, Running)
                | (Starting, Stopped)
                | (Starting, Stopping)
                | (Running, Stopping)
                | (Running, Stopped)
                | (Stopping, Stopped)
        )
    }

    /// Get a human-readable description
    pub fn description(&self) -> &'static str {
        match self {
            LifecycleState::Stopped => "Stopped",
            LifecycleState::Starting => "Starting...",
            LifecycleState::Running => "Running",
            LifecycleState::Stopping => "Stopping...",
        }
    }
}

impl Default for LifecycleState {
    fn default() -> Self {
        LifecycleState::Stopped
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Why an engine generation ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// A stop was requested by the controlling process
    Requested,
    /// The engine stopped on its own
    EngineExited,
    /// The start attempt failed before the engine was running
    StartFailed(String),
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StopReason::Requested => write!(f, "stop requested"),
            StopReason::EngineExited => write!(f, "engine exited"),
            StopReason::StartFailed(reason) => write!(f, "start failed: {}", reason),
        }
    }
}

/// Events emitted by the controller
#[derive(Debug, Clone)]
pub enum ControllerEvent {
    /// State changed
    StateChanged {
        old: LifecycleState,
        new: LifecycleState,
    },

    /// Engine accepted the tunnel handle
    Started {
        /// Handle passed to the engine
        handle: TunnelHandle,
        /// Engine status line
        status: String,
    },

    /// The scanner found no control socket; the sentinel handle is used
    HandleNotDiscovered {
        /// Highest descriptor inspected
        scan_limit: i32,
    },

    /// Engine generation ended
    Stopped {
        reason: StopReason,
    },

    /// The engine published new network settings
    SettingsUpdated {
        version: i64,
    },

    /// A non-fatal problem; the operation still completed
    Degraded {
        message: String,
    },

    /// Error occurred
    Error {
        message: String,
        recoverable: bool,
    },
}

impl ControllerEvent {
    /// Build an error event from a controller error
    pub fn from_error(err: &Error) -> Self {
        ControllerEvent::Error {
            message: err.to_string(),
            recoverable: !err.is_fatal(),
        }
    }
}

/// Engine log levels
///
/// The numeric form is what the engine's `setLogLevel` expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    #[serde(alias = "warning")]
    Warn,
    Error,
}

impl LogLevel {
    /// Numeric level for the engine (0 = debug .. 3 = error)
    pub fn as_engine_level(self) -> u8 {
        match self {
            LogLevel::Debug => 0,
            LogLevel::Info => 1,
            LogLevel::Warn => 2,
            LogLevel::Error => 3,
        }
    }

    /// Lowercase name, as used in config files and the engine init payload
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl FromStr for LogLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "debug" | "trace" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(Error::Config(format!("unknown log level: {}", other))),
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Debug => write!(f, "DEBUG"),
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Warn => write!(f, "WARN"),
            LogLevel::Error => write!(f, "ERROR"),
        }
    }
}

/// Event handler trait for receiving controller events
#[async_trait::async_trait]
pub trait EventHandler: Send + Sync {
    /// Handle a controller event
    async fn on_event(&self, event: ControllerEvent);
}

/// Simple event handler that logs events
pub struct LoggingEventHandler;

#[async_trait::async_trait]
impl EventHandler for LoggingEventHandler {
    async fn on_event(&self, event: ControllerEvent) {
        match event {
            ControllerEvent::StateChanged { old, new } => {
                log::info!("Tunnel state: {} -> {}", old, new);
            }
            ControllerEvent::Started { handle, status } => {
                log::info!("Engine started on {}: {}", handle, status);
            }
            ControllerEvent::HandleNotDiscovered { scan_limit } => {
                log::warn!(
                    "No utun control socket among descriptors 0..={}, continuing with sentinel handle",
                    scan_limit
                );
            }
            ControllerEvent::Stopped { reason } => {
                log::info!("Tunnel stopped: {}", reason);
            }
            ControllerEvent::SettingsUpdated { version } => {
                log::debug!("Network settings updated to version {}", version);
            }
            ControllerEvent::Degraded { message } => {
                log::warn!("{}", message);
            }
            ControllerEvent::Error {
                message,
                recoverable,
            } => {
                if recoverable {
                    log::warn!("Recoverable error: {}", message);
                } else {
                    log::error!("Error: {}", message);
                }
            }
        }
    }
}
