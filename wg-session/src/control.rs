// Control socket

//! Line-delimited JSON control protocol over a Unix socket
//!
//! Each connection carries exactly one request line and receives exactly
//! one reply line.

use crate::api::ProvisioningApi;
use crate::backend::TunnelBackend;
use crate::controller::StatusSnapshot;
use crate::error::{ProvisioningError, ServiceError};
use crate::liveness::TransportProbe;
use crate::service::{CommandOutcome, ServiceCommand, ServiceLifecycle};
use crate::types::ServerDescriptor;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};

const SOCKET_FILE: &str = "control.sock";

/// Requests are capped so a misbehaving client cannot exhaust memory
const MAX_REQUEST_LEN: u64 = 64 * 1024;

/// Path of the control socket inside `runtime_dir`
pub fn socket_path(runtime_dir: &Path) -> PathBuf {
    runtime_dir.join(SOCKET_FILE)
}

/// A request line
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum ControlRequest {
    Connect {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        descriptor: Option<ServerDescriptor>,
    },
    Disconnect,
    Resume,
    Forget,
    Status,
}

impl From<ControlRequest> for ServiceCommand {
    fn from(request: ControlRequest) -> Self {
        match request {
            ControlRequest::Connect { descriptor } => ServiceCommand::Connect(descriptor),
            ControlRequest::Disconnect => ServiceCommand::Disconnect,
            ControlRequest::Resume => ServiceCommand::Resume,
            ControlRequest::Forget => ServiceCommand::Forget,
            ControlRequest::Status => ServiceCommand::Status,
        }
    }
}

/// A reply line
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reply", rename_all = "snake_case")]
pub enum ControlReply {
    Ok {
        message: String,
        status: StatusSnapshot,
    },
    /// The fetched configuration lacks fields; the user should be told
    Incomplete { missing: Vec<String> },
    Error { message: String },
}

impl ControlReply {
    fn from_result(result: Result<CommandOutcome, ServiceError>, status: StatusSnapshot) -> Self {
        match result {
            Ok(outcome) => {
                let status = match outcome {
                    CommandOutcome::Status(probed) => probed,
                    _ => status,
                };
                ControlReply::Ok {
                    message: outcome.to_string(),
                    status,
                }
            }
            Err(ServiceError::Provisioning(ProvisioningError::Incomplete(incomplete))) => {
                ControlReply::Incomplete {
                    missing: incomplete
                        .missing
                        .iter()
                        .map(|f| f.as_str().to_string())
                        .collect(),
                }
            }
            Err(e) => ControlReply::Error {
                message: e.to_string(),
            },
        }
    }
}

/// Listening control socket
pub struct ControlServer {
    listener: UnixListener,
    path: PathBuf,
}

impl ControlServer {
    /// Bind `<runtime_dir>/control.sock`, replacing a stale socket
    pub fn bind(runtime_dir: &Path) -> Result<Self> {
        if !runtime_dir.exists() {
            fs::create_dir_all(runtime_dir).context("Failed to create runtime directory")?;
        }

        let path = socket_path(runtime_dir);
        if path.exists() {
            fs::remove_file(&path)
                .with_context(|| format!("Failed to remove stale socket {:?}", path))?;
        }

        let listener = UnixListener::bind(&path)
            .with_context(|| format!("Failed to bind control socket {:?}", path))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&path, fs::Permissions::from_mode(0o600))
                .context("Failed to restrict control socket permissions")?;
        }

        log::info!("Control socket listening on {:?}", path);
        Ok(Self { listener, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accept connections until the listener fails
    pub async fn serve<B, P, A>(self, service: Arc<ServiceLifecycle<B, P, A>>) -> Result<()>
    where
        B: TunnelBackend,
        P: TransportProbe,
        A: ProvisioningApi,
    {
        loop {
            let (stream, _addr) = self
                .listener
                .accept()
                .await
                .context("Failed to accept control connection")?;

            let service = service.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, service).await {
                    log::warn!("Control connection failed: {:#}", e);
                }
            });
        }
    }
}

async fn handle_connection<B, P, A>(
    stream: UnixStream,
    service: Arc<ServiceLifecycle<B, P, A>>,
) -> Result<()>
where
    B: TunnelBackend,
    P: TransportProbe,
    A: ProvisioningApi,
{
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader).take(MAX_REQUEST_LEN);

    let mut line = String::new();
    reader
        .read_line(&mut line)
        .await
        .context("Failed to read request")?;

    let reply = match serde_json::from_str::<ControlRequest>(line.trim()) {
        Ok(request) => {
            log::info!("Control request: {:?}", request);
            let result = service.handle(request.into()).await;
            if let Err(e) = &result {
                log::warn!("Command failed: {}", e);
            }
            ControlReply::from_result(result, service.status())
        }
        Err(e) => ControlReply::Error {
            message: format!("invalid request: {}", e),
        },
    };

    let mut encoded = serde_json::to_string(&reply).context("Failed to encode reply")?;
    encoded.push('\n');
    writer
        .write_all(encoded.as_bytes())
        .await
        .context("Failed to write reply")?;
    writer.shutdown().await.ok();
    Ok(())
}

/// Remove the socket file on shutdown
pub fn cleanup(runtime_dir: &Path) {
    let _ = fs::remove_file(socket_path(runtime_dir));
}

/// Send one request to the daemon and wait for its reply
pub async fn send_request(socket: &Path, request: &ControlRequest) -> Result<ControlReply> {
    let stream = UnixStream::connect(socket)
        .await
        .with_context(|| format!("Failed to connect to {:?}; is the daemon running?", socket))?;
    let (reader, mut writer) = stream.into_split();

    let mut encoded = serde_json::to_string(request).context("Failed to encode request")?;
    encoded.push('\n');
    writer
        .write_all(encoded.as_bytes())
        .await
        .context("Failed to send request")?;

    let mut line = String::new();
    BufReader::new(reader)
        .read_line(&mut line)
        .await
        .context("Failed to read reply")?;
    if line.is_empty() {
        anyhow::bail!("Daemon closed the connection without replying");
    }

    serde_json::from_str(line.trim()).context("Failed to decode reply")
}
