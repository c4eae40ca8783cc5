// Native tunnel backend and its init-once handle

//! Tunnel backend
//!
//! [`TunnelBackend`] is the capability that actually creates and destroys
//! the tunnel interface. [`WgQuickBackend`] drives `wg-quick` with a
//! generated configuration file. [`BackendHandle`] gates access to the one
//! backend instance of the process until its initialization has settled.

use crate::error::BackendError;
use crate::tunnel_config::{Dialect, TunnelConfig};
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::process::Command;
use tokio::sync::{mpsc, watch};
use wireguard_control::{Backend, Device};

/// Linux interface names are limited to IFNAMSIZ - 1 bytes
pub const MAX_TUNNEL_NAME_LEN: usize = 15;

/// Validates that a tunnel name is a usable interface name and safe to pass
/// to `wg-quick`. Only alphanumeric characters, hyphens, and underscores are
/// allowed to prevent command injection.
pub fn validate_tunnel_name(name: &str) -> Result<(), BackendError> {
    let invalid = |reason| BackendError::InvalidTunnelName {
        name: name.to_string(),
        reason,
    };

    if name.is_empty() {
        return Err(invalid("cannot be empty"));
    }

    if name.len() > MAX_TUNNEL_NAME_LEN {
        return Err(invalid("longer than 15 characters"));
    }

    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(invalid(
            "only alphanumeric characters, hyphens and underscores are allowed",
        ));
    }

    Ok(())
}

/// Requested or reported tunnel state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelUpDown {
    Up,
    Down,
}

/// State change reported by the backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelEvent {
    pub tunnel: String,
    pub state: TunnelUpDown,
}

/// Native tunnel capability
pub trait TunnelBackend: Send + Sync + 'static {
    /// Bring `tunnel` up with `config`, or down. Completion is reported
    /// separately as a [`TunnelEvent`].
    fn set_state(
        &self,
        tunnel: &str,
        state: TunnelUpDown,
        config: Option<&TunnelConfig>,
    ) -> impl Future<Output = Result<(), BackendError>> + Send;

    /// Names of the tunnels the backend currently has running
    fn running_tunnel_names(&self) -> impl Future<Output = Result<Vec<String>, BackendError>> + Send;
}

/// Backend driving `wg-quick` against generated config files
pub struct WgQuickBackend {
    config_dir: PathBuf,
    events: mpsc::UnboundedSender<TunnelEvent>,
}

impl WgQuickBackend {
    /// Prepare the config directory and check that the kernel WireGuard
    /// backend is reachable
    pub async fn init(
        config_dir: impl Into<PathBuf>,
        events: mpsc::UnboundedSender<TunnelEvent>,
    ) -> Result<Self, BackendError> {
        let config_dir = config_dir.into();
        tokio::fs::create_dir_all(&config_dir).await?;

        list_kernel_devices()
            .await
            .map_err(|e| BackendError::InitFailed(format!("cannot list WireGuard devices: {}", e)))?;

        log::info!("WireGuard backend ready (configs in {:?})", config_dir);
        Ok(Self { config_dir, events })
    }

    fn config_path(&self, tunnel: &str) -> PathBuf {
        self.config_dir.join(format!("{}.conf", tunnel))
    }

    /// Write the wg-quick file for `tunnel`, readable by the owner only
    async fn write_config(&self, tunnel: &str, config: &TunnelConfig) -> Result<PathBuf, BackendError> {
        let path = self.config_path(tunnel);
        tokio::fs::write(&path, config.render(Dialect::WgQuick)).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600)).await?;
        }
        Ok(path)
    }

    fn notify(&self, tunnel: &str, state: TunnelUpDown) {
        let event = TunnelEvent {
            tunnel: tunnel.to_string(),
            state,
        };
        if self.events.send(event).is_err() {
            log::debug!("No listener for tunnel events");
        }
    }

    async fn up(&self, tunnel: &str, config: &TunnelConfig) -> Result<(), BackendError> {
        if !config.excluded_applications().is_empty() {
            log::debug!(
                "Application exclusions {:?} are not enforced by wg-quick",
                config.excluded_applications()
            );
        }

        let path = self.write_config(tunnel, config).await?;
        log::info!("Bringing up WireGuard tunnel: {}", tunnel);

        let output = wg_quick("up", &path).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(BackendError::Command {
                action: "up",
                stderr: stderr.trim().to_string(),
            });
        }

        log::info!("WireGuard tunnel {} is up", tunnel);
        Ok(())
    }

    async fn down(&self, tunnel: &str) -> Result<(), BackendError> {
        log::info!("Bringing down WireGuard tunnel: {}", tunnel);

        let path = self.config_path(tunnel);
        let target = if path.exists() { path } else { PathBuf::from(tunnel) };

        let output = wg_quick("down", &target).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            // Don't fail if the interface is already gone
            if !stderr.contains("is not a WireGuard interface") {
                return Err(BackendError::Command {
                    action: "down",
                    stderr: stderr.trim().to_string(),
                });
            }
        }

        log::info!("WireGuard tunnel {} is down", tunnel);
        Ok(())
    }
}

impl TunnelBackend for WgQuickBackend {
    async fn set_state(
        &self,
        tunnel: &str,
        state: TunnelUpDown,
        config: Option<&TunnelConfig>,
    ) -> Result<(), BackendError> {
        validate_tunnel_name(tunnel)?;

        match state {
            TunnelUpDown::Up => {
                let config = config.ok_or_else(|| BackendError::MissingConfig(tunnel.to_string()))?;
                self.up(tunnel, config).await?;
            }
            TunnelUpDown::Down => self.down(tunnel).await?,
        }

        self.notify(tunnel, state);
        Ok(())
    }

    async fn running_tunnel_names(&self) -> Result<Vec<String>, BackendError> {
        Ok(list_kernel_devices().await?)
    }
}

async fn wg_quick(action: &'static str, target: &Path) -> Result<std::process::Output, BackendError> {
    Command::new("wg-quick")
        .arg(action)
        .arg(target)
        .output()
        .await
        .map_err(|e| {
            BackendError::Io(io::Error::new(
                e.kind(),
                format!("failed to execute wg-quick {}: {}", action, e),
            ))
        })
}

/// Kernel WireGuard interfaces, listed over netlink
pub(crate) async fn list_kernel_devices() -> io::Result<Vec<String>> {
    tokio::task::spawn_blocking(|| {
        Device::list(Backend::Kernel).map(|names| names.iter().map(|n| n.to_string()).collect())
    })
    .await
    .map_err(io::Error::other)?
}

enum Readiness<B> {
    Pending,
    Ready(Arc<B>),
    Failed(String),
}

impl<B> Readiness<B> {
    fn settled(&self) -> Option<Result<Arc<B>, BackendError>> {
        match self {
            Readiness::Pending => None,
            Readiness::Ready(backend) => Some(Ok(backend.clone())),
            Readiness::Failed(reason) => Some(Err(BackendError::InitFailed(reason.clone()))),
        }
    }
}

/// Shared handle to the single backend instance
pub struct BackendHandle<B> {
    tx: Arc<watch::Sender<Readiness<B>>>,
}

impl<B> Clone for BackendHandle<B> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<B: Send + Sync + 'static> BackendHandle<B> {
    fn with(readiness: Readiness<B>) -> Self {
        let (tx, _rx) = watch::channel(readiness);
        Self { tx: Arc::new(tx) }
    }

    /// Handle around an already initialized backend
    pub fn ready(backend: B) -> Self {
        Self::with(Readiness::Ready(Arc::new(backend)))
    }

    /// Run `init` in the background; callers of [`get`](Self::get) wait
    /// for it to settle
    pub fn spawn<F>(init: F) -> Self
    where
        F: Future<Output = Result<B, BackendError>> + Send + 'static,
    {
        let handle = Self::with(Readiness::Pending);
        let tx = handle.tx.clone();

        tokio::spawn(async move {
            let readiness = match init.await {
                Ok(backend) => Readiness::Ready(Arc::new(backend)),
                Err(e) => {
                    log::error!("Tunnel backend initialization failed: {}", e);
                    Readiness::Failed(e.to_string())
                }
            };
            tx.send_replace(readiness);
        });

        handle
    }

    /// Wait until initialization has settled
    pub async fn get(&self) -> Result<Arc<B>, BackendError> {
        let mut rx = self.tx.subscribe();
        loop {
            let settled = rx.borrow_and_update().settled();
            if let Some(result) = settled {
                return result;
            }
            rx.changed()
                .await
                .map_err(|_| BackendError::InitFailed("initializer went away".to_string()))?;
        }
    }

    /// The backend if it is ready, without waiting
    pub fn try_get(&self) -> Option<Arc<B>> {
        self.tx.borrow().settled().and_then(Result::ok)
    }
}
