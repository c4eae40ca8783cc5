// Tunnel lifecycle controller

//! Connect/disconnect orchestration
//!
//! [`TunnelController`] ties the config builder, the backend handle and the
//! state machine together for the one named tunnel of this process. Backend
//! calls only request a change; the resulting UP/DOWN events are applied by
//! the event loop, in the order the backend reported them.

use crate::backend::{validate_tunnel_name, BackendHandle, TunnelBackend, TunnelEvent, TunnelUpDown};
use crate::error::{BackendError, TunnelError};
use crate::liveness::TransportProbe;
use crate::state::{ConnectionStateMachine, StateCommand};
use crate::tunnel_config::{build, BuildMode};
use crate::types::{ConnectionState, ServerDescriptor};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Result of a start request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// The backend was asked to bring the tunnel up
    Requested,
    /// A connect is in flight or the tunnel is up; nothing was done
    AlreadyInProgress(ConnectionState),
}

/// Result of a stop request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// The tunnel was not considered running; nothing was done
    NotRunning,
    /// The backend was asked to bring the tunnel down
    Requested,
    /// The backend no longer had the tunnel; state resolved directly
    Stopped,
}

/// Published state plus the live transport check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub state: ConnectionState,
    pub active: bool,
}

/// Controller for the single named tunnel
pub struct TunnelController<B, P> {
    tunnel: String,
    backend: BackendHandle<B>,
    probe: Arc<P>,
    machine: Arc<ConnectionStateMachine>,
}

impl<B: TunnelBackend, P: TransportProbe> TunnelController<B, P> {
    /// Create a controller for `tunnel`
    ///
    /// # Errors
    ///
    /// Returns an error if the tunnel name is not a valid interface name.
    pub fn new(
        tunnel: impl Into<String>,
        backend: BackendHandle<B>,
        probe: Arc<P>,
        machine: Arc<ConnectionStateMachine>,
    ) -> Result<Self, BackendError> {
        let tunnel = tunnel.into();
        validate_tunnel_name(&tunnel)?;
        Ok(Self {
            tunnel,
            backend,
            probe,
            machine,
        })
    }

    pub fn tunnel_name(&self) -> &str {
        &self.tunnel
    }

    pub fn state_machine(&self) -> &Arc<ConnectionStateMachine> {
        &self.machine
    }

    fn transition(&self, command: StateCommand) {
        if let Err(e) = self.machine.apply(command) {
            log::debug!("Ignoring event: {}", e);
        }
    }

    /// Bring the tunnel up with the configuration built from `descriptor`.
    ///
    /// Only one connect can be in flight: a request made while the state is
    /// `PREPARE`, `CONNECTING` or `CONNECTED` returns
    /// [`StartOutcome::AlreadyInProgress`] without touching the backend.
    pub async fn start(&self, descriptor: &ServerDescriptor) -> Result<StartOutcome, TunnelError> {
        if let Err(e) = self.machine.apply(StateCommand::ConnectRequested) {
            log::debug!("Connect not started: {}", e);
            return Ok(StartOutcome::AlreadyInProgress(e.from));
        }

        let config = match build(descriptor, BuildMode::Connect) {
            Ok(config) => config,
            Err(e) => {
                log::warn!("Cannot connect: {}", e);
                self.transition(StateCommand::ConfigRejected);
                return Err(e.into());
            }
        };
        self.transition(StateCommand::ConfigBuilt);

        let result = async {
            let backend = self.backend.get().await?;
            backend
                .set_state(&self.tunnel, TunnelUpDown::Up, Some(&config))
                .await
        }
        .await;

        if let Err(e) = result {
            log::error!("Failed to bring up tunnel {}: {}", self.tunnel, e);
            self.transition(StateCommand::BackendError);
            return Err(e.into());
        }

        Ok(StartOutcome::Requested)
    }

    /// Bring the tunnel down. A no-op unless the tunnel is `CONNECTED`.
    pub async fn stop(&self) -> Result<StopOutcome, TunnelError> {
        if let Err(e) = self.machine.apply(StateCommand::DisconnectRequested) {
            log::debug!("Disconnect not started: {}", e);
            return Ok(StopOutcome::NotRunning);
        }

        let backend = match self.backend.get().await {
            Ok(backend) => backend,
            Err(e) => {
                log::error!("Failed to bring down tunnel {}: {}", self.tunnel, e);
                self.transition(StateCommand::BackendError);
                return Err(e.into());
            }
        };

        match backend.running_tunnel_names().await {
            Ok(names) if !names.iter().any(|n| *n == self.tunnel) => {
                log::info!("Tunnel {} is not running, nothing to bring down", self.tunnel);
                self.transition(StateCommand::BackendDown);
                return Ok(StopOutcome::Stopped);
            }
            Ok(_) => {}
            Err(e) => log::warn!("Failed to list running tunnels: {}", e),
        }

        if let Err(e) = backend
            .set_state(&self.tunnel, TunnelUpDown::Down, None)
            .await
        {
            log::error!("Failed to bring down tunnel {}: {}", self.tunnel, e);
            self.transition(StateCommand::BackendError);
            return Err(e.into());
        }

        Ok(StopOutcome::Requested)
    }

    /// Current state, without side effects
    pub fn status(&self) -> ConnectionState {
        self.machine.current()
    }

    /// Whether the tunnel's transport is live right now
    pub async fn is_active(&self) -> bool {
        self.probe.is_tunnel_active(&self.tunnel).await
    }

    /// Probe liveness and correct the published state if it disagrees
    pub async fn reconcile(&self) -> StatusSnapshot {
        let observed = self.machine.observe();
        let active = self.is_active().await;
        let state = self
            .machine
            .reconcile(observed, active)
            .unwrap_or_else(|| self.machine.current());
        StatusSnapshot { state, active }
    }

    fn handle_event(&self, event: TunnelEvent) {
        if event.tunnel != self.tunnel {
            log::debug!("Ignoring event for unknown tunnel {}", event.tunnel);
            return;
        }

        log::debug!("Tunnel {} reported {:?}", event.tunnel, event.state);
        match event.state {
            TunnelUpDown::Up => self.transition(StateCommand::BackendUp),
            TunnelUpDown::Down => self.transition(StateCommand::BackendDown),
        }
    }

    /// Apply backend events until the channel closes
    pub fn spawn_event_loop(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<TunnelEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                self.handle_event(event);
            }
            log::debug!("Tunnel event stream closed");
        })
    }
}
