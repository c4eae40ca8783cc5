// Connection state machine

//! State machine for the tunnel connection lifecycle
//!
//! [`next_state`] is the pure transition table. [`ConnectionStateMachine`]
//! owns the single authoritative state, applies transitions one at a time,
//! persists every new state and publishes it to subscribers.

use crate::store::VpnStore;
use crate::types::ConnectionState;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::watch;

/// Events that trigger state transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateCommand {
    /// A connect (or reconnect) was requested
    ConnectRequested,
    /// The tunnel configuration was built successfully
    ConfigBuilt,
    /// The descriptor could not be turned into a configuration
    ConfigRejected,
    /// Backend reports the tunnel up
    BackendUp,
    /// Backend reports the tunnel down
    BackendDown,
    /// Backend call failed
    BackendError,
    /// A disconnect was requested
    DisconnectRequested,
    /// A status refresh is in flight
    Refresh,
}

/// A command that is not legal in the current state
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("illegal transition: {command:?} in state {from}")]
pub struct IllegalTransition {
    pub from: ConnectionState,
    pub command: StateCommand,
}

/// Transition table
pub fn next_state(
    state: ConnectionState,
    command: StateCommand,
) -> Result<ConnectionState, IllegalTransition> {
    use ConnectionState::*;
    use StateCommand::*;

    let next = match (state, command) {
        (_, Refresh) => Refreshing,

        (NoConnection | Disconnected | Refreshing, ConnectRequested) => Prepare,

        (Prepare, ConfigBuilt) => Connecting,
        (Prepare, ConfigRejected | BackendError) => NoConnection,

        (Connecting, BackendUp) => Connected,
        (Connecting, BackendError | BackendDown) => NoConnection,

        (Connected, DisconnectRequested) => Disconnecting,

        (Disconnecting, BackendDown) => Disconnected,
        (Disconnecting, BackendError) => NoConnection,

        (Refreshing, BackendUp) => Connected,
        (Refreshing, BackendDown | BackendError) => NoConnection,

        (from, command) => return Err(IllegalTransition { from, command }),
    };

    Ok(next)
}

/// A state as seen at some instant, stamped with the transition count
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Observation {
    pub state: ConnectionState,
    generation: u64,
}

struct Inner {
    state: ConnectionState,
    /// Bumped on every transition
    generation: u64,
}

impl Inner {
    fn set(&mut self, next: ConnectionState) {
        self.state = next;
        self.generation += 1;
    }
}

/// Owner of the process-wide connection state
pub struct ConnectionStateMachine {
    inner: Mutex<Inner>,
    tx: watch::Sender<ConnectionState>,
    store: Option<Arc<VpnStore>>,
    last_known: Option<ConnectionState>,
}

impl ConnectionStateMachine {
    /// Create a machine in `NO_CONNECTION` that persists through `store`
    pub fn new(store: Arc<VpnStore>) -> Self {
        let last_known = store.last_connection_state();
        Self::build(Some(store), last_known)
    }

    /// Create a machine that keeps its state in memory only
    pub fn detached() -> Self {
        Self::build(None, None)
    }

    fn build(store: Option<Arc<VpnStore>>, last_known: Option<ConnectionState>) -> Self {
        let (tx, _rx) = watch::channel(ConnectionState::NoConnection);
        Self {
            inner: Mutex::new(Inner {
                state: ConnectionState::NoConnection,
                generation: 0,
            }),
            tx,
            store,
            last_known,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply `command` and return the new state
    pub fn apply(&self, command: StateCommand) -> Result<ConnectionState, IllegalTransition> {
        let mut inner = self.lock();
        let next = next_state(inner.state, command)?;
        log::debug!("State: {} --{:?}--> {}", inner.state, command, next);
        inner.set(next);
        self.publish(next);
        Ok(next)
    }

    /// Snapshot to pass to [`reconcile`](Self::reconcile) once a liveness
    /// probe started now has finished
    pub fn observe(&self) -> Observation {
        let inner = self.lock();
        Observation {
            state: inner.state,
            generation: inner.generation,
        }
    }

    /// Correct a settled state that disagrees with the live probe, passing
    /// through `REFRESHING`. If any transition happened since `observed`
    /// was taken the probe result is stale and nothing changes. Returns
    /// the corrected state, if any.
    pub fn reconcile(&self, observed: Observation, live: bool) -> Option<ConnectionState> {
        let mut inner = self.lock();
        if inner.generation != observed.generation {
            return None;
        }

        let outcome = match (inner.state, live) {
            (ConnectionState::Connected, false) => StateCommand::BackendDown,
            (ConnectionState::NoConnection | ConnectionState::Disconnected, true) => {
                StateCommand::BackendUp
            }
            _ => return None,
        };

        log::info!(
            "Tunnel is {} but state was {}, refreshing",
            if live { "up" } else { "down" },
            inner.state
        );

        let refreshing = next_state(inner.state, StateCommand::Refresh).ok()?;
        inner.set(refreshing);
        self.publish(refreshing);

        let next = next_state(refreshing, outcome).ok()?;
        inner.set(next);
        self.publish(next);
        Some(next)
    }

    fn publish(&self, state: ConnectionState) {
        if let Some(store) = &self.store {
            if let Err(e) = store.save_connection_state(state) {
                log::warn!("Failed to persist connection state {}: {:#}", state, e);
            }
        }
        self.tx.send_replace(state);
    }

    /// Current state
    pub fn current(&self) -> ConnectionState {
        self.lock().state
    }

    /// State persisted by the previous process, read at construction
    pub fn last_known(&self) -> Option<ConnectionState> {
        self.last_known
    }

    /// Observe every published state
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.tx.subscribe()
    }
}
