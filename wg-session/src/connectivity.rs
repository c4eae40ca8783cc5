// NetworkManager connectivity monitor via D-Bus

//! Network connectivity detection and tunnel recovery
//!
//! [`NmConnectivitySource`] watches NetworkManager's global state over the
//! system bus and forwards edge-triggered events into a channel.
//! [`ConnectivityMonitor`] consumes that channel on its own task and asks
//! the controller to reconnect when connectivity comes back.

use crate::backend::TunnelBackend;
use crate::controller::{StartOutcome, TunnelController};
use crate::liveness::TransportProbe;
use crate::store::VpnStore;
use anyhow::{Context, Result};
use futures::stream::StreamExt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use zbus::{proxy, Connection};

/// NM_STATE_CONNECTED_LOCAL; higher values are site and global connectivity
const NM_STATE_CONNECTED_LOCAL: u32 = 50;

/// Network event types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkEvent {
    /// A usable network became available
    Available,
    /// The last usable network went away
    Lost,
}

/// D-Bus proxy for NetworkManager
#[proxy(
    interface = "org.freedesktop.NetworkManager",
    default_service = "org.freedesktop.NetworkManager",
    default_path = "/org/freedesktop/NetworkManager"
)]
trait NetworkManager {
    /// Overall networking state (NMState)
    #[zbus(property)]
    fn state(&self) -> zbus::Result<u32>;
}

fn is_online(nm_state: u32) -> bool {
    nm_state >= NM_STATE_CONNECTED_LOCAL
}

/// Connectivity notifications from NetworkManager
pub struct NmConnectivitySource {
    connection: Connection,
}

impl NmConnectivitySource {
    pub async fn new() -> Result<Self> {
        let connection = Connection::system()
            .await
            .context("Failed to connect to system D-Bus")?;

        Ok(Self { connection })
    }

    /// Whether NetworkManager currently reports connectivity
    pub async fn is_online(&self) -> Result<bool> {
        let nm = NetworkManagerProxy::new(&self.connection)
            .await
            .context("Failed to create NetworkManager proxy")?;
        Ok(is_online(nm.state().await?))
    }

    /// Send an event on every online/offline edge until the bus goes away
    pub async fn watch(self, tx: mpsc::Sender<NetworkEvent>) -> Result<()> {
        let nm = NetworkManagerProxy::new(&self.connection)
            .await
            .context("Failed to create NetworkManager proxy")?;
        let mut stream = nm.receive_state_changed().await;

        let mut was_online = is_online(nm.state().await?);
        log::info!(
            "Watching network connectivity (currently {})",
            if was_online { "online" } else { "offline" }
        );

        while let Some(change) = stream.next().await {
            let online = match change.get().await {
                Ok(state) => is_online(state),
                Err(e) => {
                    log::warn!("Failed to read NetworkManager state: {}", e);
                    continue;
                }
            };

            if online != was_online {
                let event = if online {
                    NetworkEvent::Available
                } else {
                    NetworkEvent::Lost
                };
                if tx.send(event).await.is_err() {
                    break;
                }
            }
            was_online = online;
        }

        Ok(())
    }
}

/// Reconnects a configured tunnel when connectivity returns
pub struct ConnectivityMonitor<B, P> {
    controller: Arc<TunnelController<B, P>>,
    store: Arc<VpnStore>,
    online: Option<bool>,
}

impl<B: TunnelBackend, P: TransportProbe> ConnectivityMonitor<B, P> {
    pub fn new(controller: Arc<TunnelController<B, P>>, store: Arc<VpnStore>) -> Self {
        Self {
            controller,
            store,
            online: None,
        }
    }

    /// Handle one event. Returns whether a reconnect was issued.
    pub async fn handle(&mut self, event: NetworkEvent) -> bool {
        match event {
            NetworkEvent::Lost => {
                if self.online != Some(false) {
                    log::info!("Network connectivity lost");
                }
                self.online = Some(false);
                false
            }
            NetworkEvent::Available => {
                if self.online == Some(true) {
                    log::debug!("Connectivity already available, ignoring duplicate notification");
                    return false;
                }
                self.online = Some(true);
                log::info!("Network connectivity available");
                self.recover().await
            }
        }
    }

    async fn recover(&self) -> bool {
        if !self.store.flags().configured {
            log::debug!("Tunnel not configured, skipping reconnect");
            return false;
        }

        let state = self.controller.status();
        if state.is_transitional() {
            log::info!("Tunnel is {}, skipping reconnect", state);
            return false;
        }

        if self.controller.is_active().await {
            log::debug!("Tunnel already active, skipping reconnect");
            return false;
        }

        // A tunnel torn down outside the controller can still read as
        // CONNECTED until the next poll
        let status = self.controller.reconcile().await;
        if status.active {
            log::debug!("Tunnel came back up, skipping reconnect");
            return false;
        }

        log::info!("Reconnecting tunnel after connectivity recovery");
        match self.controller.start(&self.store.descriptor()).await {
            Ok(StartOutcome::Requested) => true,
            Ok(StartOutcome::AlreadyInProgress(state)) => {
                log::debug!("Reconnect raced with another connect ({})", state);
                false
            }
            Err(e) => {
                log::warn!("Reconnect failed: {}", e);
                true
            }
        }
    }

    /// Consume events on a dedicated task until the channel closes
    pub fn spawn(mut self, mut rx: mpsc::Receiver<NetworkEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                self.handle(event).await;
            }
            log::debug!("Connectivity event stream closed");
        })
    }
}

/// Live connectivity subscription; tasks are aborted on release or drop
pub struct Subscription {
    tasks: Vec<JoinHandle<()>>,
}

impl Subscription {
    pub fn new(tasks: Vec<JoinHandle<()>>) -> Self {
        Self { tasks }
    }

    /// Stop watching and handling connectivity changes
    pub fn release(mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        log::debug!("Connectivity subscription released");
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Wire `source` to `monitor` and return the subscription owning both tasks
pub fn subscribe<B: TunnelBackend, P: TransportProbe>(
    source: NmConnectivitySource,
    monitor: ConnectivityMonitor<B, P>,
) -> Subscription {
    let (tx, rx) = mpsc::channel(16);

    let watcher = tokio::spawn(async move {
        if let Err(e) = source.watch(tx).await {
            log::error!("Connectivity watcher stopped: {:#}", e);
        }
    });
    let handler = monitor.spawn(rx);

    Subscription::new(vec![watcher, handler])
}
