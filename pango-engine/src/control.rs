//! Control socket for querying a running tunnel
//!
//! Newline-delimited JSON over a Unix domain socket: the client writes one
//! request line, the server answers with one response line.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};

use crate::controller::TunnelController;
use crate::error::{Error, Result};
use crate::event::LifecycleState;

/// Default socket path for the control socket
pub const DEFAULT_SOCKET_PATH: &str = "/var/run/pango.sock";

/// How long a client waits for an answer
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);

/// Request messages sent to the control socket
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ControlRequest {
    /// Get the lifecycle state
    #[serde(rename = "status")]
    Status,

    /// Get the relayed network settings
    #[serde(rename = "settings")]
    Settings,

    /// Stop the tunnel
    #[serde(rename = "stop")]
    Stop,
}

/// Response messages from the control socket
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ControlResponse {
    /// Status response
    #[serde(rename = "status")]
    Status(StatusInfo),

    /// Current network settings snapshot
    #[serde(rename = "settings")]
    Settings { version: i64, json: String },

    /// Error response
    #[serde(rename = "error")]
    Error { message: String },

    /// Success acknowledgment
    #[serde(rename = "ok")]
    Ok,
}

/// Tunnel status information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusInfo {
    /// Lifecycle state
    pub state: LifecycleState,
    /// Descriptor handed to the engine, if running
    pub handle: Option<i32>,
    /// Version of the relayed network settings
    pub settings_version: i64,
    /// Seconds since the control socket came up
    pub uptime_secs: u64,
}

/// Control socket server bound to a controller
pub struct ControlServer {
    socket_path: PathBuf,
    listener: UnixListener,
    controller: TunnelController,
    started: Instant,
}

impl ControlServer {
    /// Bind the socket, replacing a stale socket file if present
    ///
    /// Must be called within a Tokio runtime.
    pub fn bind(socket_path: impl AsRef<Path>, controller: TunnelController) -> Result<Self> {
        let socket_path = socket_path.as_ref().to_path_buf();

        let _ = std::fs::remove_file(&socket_path);
        if let Some(parent) = socket_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }

        let listener = UnixListener::bind(&socket_path)
            .map_err(|e| Error::Control(format!("Failed to bind control socket: {}", e)))?;

        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            let _ = std::fs::set_permissions(&socket_path, perms);
        }

        log::info!("Control socket listening on {:?}", socket_path);

        Ok(Self {
            socket_path,
            listener,
            controller,
            started: Instant::now(),
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Accept connections until the future is dropped
    pub async fn serve(self) {
        loop {
            match self.listener.accept().await {
                Ok((stream, _)) => {
                    let controller = self.controller.clone();
                    let started = self.started;
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, controller, started).await {
                            log::debug!("Control connection error: {}", e);
                        }
                    });
                }
                Err(e) => {
                    log::warn!("Control socket accept error: {}", e);
                }
            }
        }
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.socket_path);
    }
}

async fn handle_connection(
    stream: UnixStream,
    controller: TunnelController,
    started: Instant,
) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    reader
        .read_line(&mut line)
        .await
        .map_err(|e| Error::Control(format!("Failed to read request: {}", e)))?;

    if line.is_empty() {
        return Ok(());
    }

    let response = match serde_json::from_str::<ControlRequest>(line.trim()) {
        Ok(request) => handle_request(request, &controller, started).await,
        Err(e) => ControlResponse::Error {
            message: format!("Invalid request: {}", e),
        },
    };

    let mut response_json = serde_json::to_string(&response)?;
    response_json.push('\n');
    writer
        .write_all(response_json.as_bytes())
        .await
        .map_err(|e| Error::Control(format!("Failed to write response: {}", e)))?;

    Ok(())
}

async fn handle_request(
    request: ControlRequest,
    controller: &TunnelController,
    started: Instant,
) -> ControlResponse {
    match request {
        ControlRequest::Status => {
            let snapshot = controller.snapshot();
            ControlResponse::Status(StatusInfo {
                state: controller.status(),
                handle: controller.handle().map(|h| h.raw()),
                settings_version: snapshot.version(),
                uptime_secs: started.elapsed().as_secs(),
            })
        }
        ControlRequest::Settings => {
            let snapshot = controller.snapshot();
            ControlResponse::Settings {
                version: snapshot.version(),
                json: snapshot.json().to_string(),
            }
        }
        ControlRequest::Stop => match controller.stop().await {
            Ok(()) => ControlResponse::Ok,
            Err(e) => ControlResponse::Error {
                message: e.to_string(),
            },
        },
    }
}

/// Control socket client for a running tunnel
pub struct ControlClient {
    socket_path: PathBuf,
}

impl ControlClient {
    pub fn new(socket_path: impl AsRef<Path>) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
        }
    }

    /// Send a request and get a response
    pub async fn request(&self, request: ControlRequest) -> Result<ControlResponse> {
        let stream = UnixStream::connect(&self.socket_path).await.map_err(|e| {
            Error::Control(format!(
                "Failed to connect to control socket at {:?}: {}. Is the tunnel running?",
                self.socket_path, e
            ))
        })?;

        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);

        let mut request_json = serde_json::to_string(&request)?;
        request_json.push('\n');
        writer
            .write_all(request_json.as_bytes())
            .await
            .map_err(|e| Error::Control(format!("Failed to send request: {}", e)))?;

        let mut line = String::new();
        tokio::time::timeout(RESPONSE_TIMEOUT, reader.read_line(&mut line))
            .await
            .map_err(|_| Error::Control("Timeout waiting for response".into()))?
            .map_err(|e| Error::Control(format!("Failed to read response: {}", e)))?;

        let response: ControlResponse = serde_json::from_str(line.trim())
            .map_err(|e| Error::Control(format!("Invalid response: {}", e)))?;

        Ok(response)
    }

    /// Get the tunnel status
    pub async fn status(&self) -> Result<StatusInfo> {
        match self.request(ControlRequest::Status).await? {
            ControlResponse::Status(info) => Ok(info),
            ControlResponse::Error { message } => Err(Error::Control(message)),
            _ => Err(Error::Control("Unexpected response".into())),
        }
    }

    /// Get the relayed network settings as `(version, json)`
    pub async fn settings(&self) -> Result<(i64, String)> {
        match self.request(ControlRequest::Settings).await? {
            ControlResponse::Settings { version, json } => Ok((version, json)),
            ControlResponse::Error { message } => Err(Error::Control(message)),
            _ => Err(Error::Control("Unexpected response".into())),
        }
    }

    /// Stop the tunnel
    pub async fn stop(&self) -> Result<()> {
        match self.request(ControlRequest::Stop).await? {
            ControlResponse::Ok => Ok(()),
            ControlResponse::Error { message } => Err(Error::Control(message)),
            _ => Err(Error::Control("Unexpected response".into())),
        }
    }
}
