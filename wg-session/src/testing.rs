//! Test doubles shared by the unit tests

use crate::api::{ApiError, MonitoringInfo, ProvisioningApi, RegisterResponse};
use crate::backend::{TunnelBackend, TunnelEvent, TunnelUpDown};
use crate::error::BackendError;
use crate::liveness::TransportProbe;
use crate::tunnel_config::TunnelConfig;
use crate::types::{DescriptorField, ServerDescriptor};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

pub const PRIVATE_KEY: &str = "yAnz5TF+lXXJte14tji3zlMNq+hd2rYUIgJBgB3fBmk=";
pub const PEER_PUBLIC_KEY: &str = "xTIBA5rboUvnH4htodjb6e697QjLERt1NAB4mZqp8Dg=";

/// A descriptor that passes connect-time validation
pub fn valid_descriptor() -> ServerDescriptor {
    ServerDescriptor::new()
        .with(DescriptorField::InterfacePrivateKey, PRIVATE_KEY)
        .with(DescriptorField::InterfaceAddress, "10.0.0.2/24")
        .with(DescriptorField::InterfaceDns, "1.1.1.1")
        .with(DescriptorField::PeerPublicKey, PEER_PUBLIC_KEY)
        .with(DescriptorField::PeerAllowedIps, "0.0.0.0/0")
        .with(DescriptorField::PeerEndpoint, "vpn.example.com:51820")
        .with(DescriptorField::PeerPersistentKeepalive, "25")
}

/// In-memory backend that records calls and reports events like the real one
pub struct FakeBackend {
    pub up_calls: AtomicUsize,
    pub down_calls: AtomicUsize,
    pub fail: AtomicBool,
    delay: Duration,
    running: Arc<Mutex<BTreeSet<String>>>,
    events: mpsc::UnboundedSender<TunnelEvent>,
}

impl FakeBackend {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TunnelEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let backend = Self {
            up_calls: AtomicUsize::new(0),
            down_calls: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
            delay: Duration::ZERO,
            running: Arc::new(Mutex::new(BTreeSet::new())),
            events: tx,
        };
        (backend, rx)
    }

    /// Make every backend call take `delay`
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Probe that sees exactly the tunnels this backend has up
    pub fn probe(&self) -> FakeProbe {
        FakeProbe {
            active: self.running.clone(),
        }
    }

    /// Simulate a tunnel brought up or torn down outside the controller
    pub fn set_running(&self, tunnel: &str, running: bool) {
        let mut set = self.running.lock().unwrap();
        if running {
            set.insert(tunnel.to_string());
        } else {
            set.remove(tunnel);
        }
    }
}

impl TunnelBackend for FakeBackend {
    async fn set_state(
        &self,
        tunnel: &str,
        state: TunnelUpDown,
        config: Option<&TunnelConfig>,
    ) -> Result<(), BackendError> {
        let action = match state {
            TunnelUpDown::Up => {
                self.up_calls.fetch_add(1, Ordering::SeqCst);
                "up"
            }
            TunnelUpDown::Down => {
                self.down_calls.fetch_add(1, Ordering::SeqCst);
                "down"
            }
        };

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        if self.fail.load(Ordering::SeqCst) {
            return Err(BackendError::Command {
                action,
                stderr: "simulated failure".to_string(),
            });
        }
        if state == TunnelUpDown::Up && config.is_none() {
            return Err(BackendError::MissingConfig(tunnel.to_string()));
        }

        self.set_running(tunnel, state == TunnelUpDown::Up);
        let _ = self.events.send(TunnelEvent {
            tunnel: tunnel.to_string(),
            state,
        });
        Ok(())
    }

    async fn running_tunnel_names(&self) -> Result<Vec<String>, BackendError> {
        Ok(self.running.lock().unwrap().iter().cloned().collect())
    }
}

pub struct FakeProbe {
    active: Arc<Mutex<BTreeSet<String>>>,
}

impl TransportProbe for FakeProbe {
    async fn active_tunnel_transports(&self) -> anyhow::Result<Vec<String>> {
        Ok(self.active.lock().unwrap().iter().cloned().collect())
    }
}

/// Scripted provisioning API
pub struct FakeApi {
    pub register_calls: AtomicUsize,
    pub fetch_calls: AtomicUsize,
    pub fail_register: AtomicBool,
    pub accept_register: AtomicBool,
    pub fail_fetch: AtomicBool,
    pub registered: Mutex<Vec<(String, String)>>,
    pub monitoring: Mutex<MonitoringInfo>,
}

impl FakeApi {
    pub fn new() -> Self {
        Self {
            register_calls: AtomicUsize::new(0),
            fetch_calls: AtomicUsize::new(0),
            fail_register: AtomicBool::new(false),
            accept_register: AtomicBool::new(true),
            fail_fetch: AtomicBool::new(false),
            registered: Mutex::new(Vec::new()),
            monitoring: Mutex::new(MonitoringInfo::default()),
        }
    }

    fn unavailable() -> ApiError {
        ApiError::Status {
            status: 503,
            body: "unavailable".to_string(),
        }
    }
}

impl ProvisioningApi for FakeApi {
    async fn register_public_key(
        &self,
        device_id: &str,
        public_key: &str,
    ) -> Result<RegisterResponse, ApiError> {
        self.register_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_register.load(Ordering::SeqCst) {
            return Err(Self::unavailable());
        }

        let success = self.accept_register.load(Ordering::SeqCst);
        if success {
            self.registered
                .lock()
                .unwrap()
                .push((device_id.to_string(), public_key.to_string()));
        }
        Ok(RegisterResponse { success })
    }

    async fn fetch_monitoring_info(&self, _device_id: &str) -> Result<MonitoringInfo, ApiError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_fetch.load(Ordering::SeqCst) {
            return Err(Self::unavailable());
        }
        Ok(self.monitoring.lock().unwrap().clone())
    }
}
