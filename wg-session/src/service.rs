//! Host process lifecycle
//!
//! [`ServiceLifecycle`] executes the control commands, runs the status
//! poll and performs the shutdown sequence.

use crate::api::ProvisioningApi;
use crate::backend::TunnelBackend;
use crate::connectivity::Subscription;
use crate::controller::{StartOutcome, StatusSnapshot, StopOutcome, TunnelController};
use crate::error::{ProvisioningError, ServiceError};
use crate::liveness::TransportProbe;
use crate::provisioning::ProvisioningSequencer;
use crate::state_file;
use crate::store::VpnStore;
use crate::types::{ConnectionState, GeneralConfig, ServerDescriptor};
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

/// Commands accepted by the host process
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceCommand {
    /// Connect with the given descriptor, or fetch one from the provisioning
    /// backend when none is given
    Connect(Option<ServerDescriptor>),
    Disconnect,
    /// Reconnect from persisted state if configured and not already active
    Resume,
    /// Clear the configuration and keys, then provision afresh
    Forget,
    Status,
}

/// What a command did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    ConnectRequested,
    AlreadyActive(ConnectionState),
    NotConfigured,
    DisconnectRequested,
    NotRunning,
    Disconnected,
    Forgotten { registered: bool },
    Status(StatusSnapshot),
}

impl fmt::Display for CommandOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandOutcome::ConnectRequested => f.write_str("connecting"),
            CommandOutcome::AlreadyActive(state) => write!(f, "tunnel already {}", state),
            CommandOutcome::NotConfigured => f.write_str("no stored configuration, nothing to resume"),
            CommandOutcome::DisconnectRequested => f.write_str("disconnecting"),
            CommandOutcome::NotRunning => f.write_str("tunnel is not running"),
            CommandOutcome::Disconnected => f.write_str("disconnected"),
            CommandOutcome::Forgotten { registered: true } => {
                f.write_str("configuration cleared, new key registered")
            }
            CommandOutcome::Forgotten { registered: false } => {
                f.write_str("configuration cleared, key registration pending")
            }
            CommandOutcome::Status(status) => {
                write!(f, "{} ({})", status.state, if status.active { "active" } else { "inactive" })
            }
        }
    }
}

/// The long-running session host
pub struct ServiceLifecycle<B, P, A> {
    controller: Arc<TunnelController<B, P>>,
    provisioning: Arc<ProvisioningSequencer<A>>,
    store: Arc<VpnStore>,
    runtime_dir: PathBuf,
    poll_interval: Duration,
    stop_on_exit: bool,
    status: watch::Sender<StatusSnapshot>,
    shutting_down: AtomicBool,
}

impl<B: TunnelBackend, P: TransportProbe, A: ProvisioningApi> ServiceLifecycle<B, P, A> {
    pub fn new(
        controller: Arc<TunnelController<B, P>>,
        provisioning: Arc<ProvisioningSequencer<A>>,
        store: Arc<VpnStore>,
        general: &GeneralConfig,
    ) -> Self {
        let initial = StatusSnapshot {
            state: controller.status(),
            active: false,
        };
        let (status, _rx) = watch::channel(initial);

        Self {
            controller,
            provisioning,
            store,
            runtime_dir: general.runtime_dir.clone(),
            poll_interval: Duration::from_millis(general.poll_interval_ms),
            stop_on_exit: general.stop_on_exit,
            status,
            shutting_down: AtomicBool::new(false),
        }
    }

    /// Execute one command
    pub async fn handle(&self, command: ServiceCommand) -> Result<CommandOutcome, ServiceError> {
        log::debug!("Handling command {:?}", command);
        match command {
            ServiceCommand::Connect(descriptor) => self.connect(descriptor).await,
            ServiceCommand::Disconnect => self.disconnect().await,
            ServiceCommand::Resume => self.resume().await,
            ServiceCommand::Forget => self.forget().await,
            ServiceCommand::Status => Ok(CommandOutcome::Status(self.refresh_status().await)),
        }
    }

    async fn start(&self, descriptor: &ServerDescriptor) -> Result<CommandOutcome, ServiceError> {
        match self.controller.start(descriptor).await? {
            StartOutcome::Requested => Ok(CommandOutcome::ConnectRequested),
            StartOutcome::AlreadyInProgress(state) => Ok(CommandOutcome::AlreadyActive(state)),
        }
    }

    async fn connect(&self, descriptor: Option<ServerDescriptor>) -> Result<CommandOutcome, ServiceError> {
        if self.controller.is_active().await {
            return Ok(CommandOutcome::AlreadyActive(self.controller.status()));
        }

        let descriptor = match descriptor {
            Some(descriptor) => descriptor,
            None => {
                let report = self.provisioning.bootstrap().await;
                if let Some(e) = report.error {
                    return Err(ProvisioningError::Step(e).into());
                }
                self.provisioning.prepare_connect().await.map_err(|e| {
                    log::warn!("Cannot connect: {}", e);
                    e
                })?
            }
        };

        self.start(&descriptor).await
    }

    async fn disconnect(&self) -> Result<CommandOutcome, ServiceError> {
        Ok(match self.controller.stop().await? {
            StopOutcome::NotRunning => CommandOutcome::NotRunning,
            StopOutcome::Requested => CommandOutcome::DisconnectRequested,
            StopOutcome::Stopped => CommandOutcome::Disconnected,
        })
    }

    async fn resume(&self) -> Result<CommandOutcome, ServiceError> {
        if !self.store.flags().configured {
            log::info!("No stored configuration, not resuming");
            return Ok(CommandOutcome::NotConfigured);
        }

        if self.controller.is_active().await {
            let status = self.refresh_status().await;
            log::info!("Tunnel already active, not resuming");
            return Ok(CommandOutcome::AlreadyActive(status.state));
        }

        log::info!("Resuming tunnel from stored configuration");
        self.start(&self.store.descriptor()).await
    }

    /// Resume on a background task so a slow backend cannot hold up the
    /// rest of startup
    pub fn spawn_resume(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            match self.handle(ServiceCommand::Resume).await {
                Ok(outcome) => log::info!("Startup: {}", outcome),
                Err(e) => log::warn!("Failed to resume tunnel: {}", e),
            }
        })
    }

    async fn forget(&self) -> Result<CommandOutcome, ServiceError> {
        if let Err(e) = self.controller.stop().await {
            log::warn!("Failed to stop tunnel before forgetting configuration: {}", e);
        }

        let report = self
            .provisioning
            .forget()
            .await
            .map_err(ProvisioningError::from)?;
        Ok(CommandOutcome::Forgotten {
            registered: report.is_registered(),
        })
    }

    /// Probe liveness, reconcile, and publish the result
    pub async fn refresh_status(&self) -> StatusSnapshot {
        let snapshot = self.controller.reconcile().await;
        self.publish(snapshot);
        snapshot
    }

    fn publish(&self, snapshot: StatusSnapshot) {
        let changed = self.status.send_if_modified(|current| {
            if *current == snapshot {
                false
            } else {
                *current = snapshot;
                true
            }
        });

        // The status file is removed on shutdown and must stay removed
        if changed && !self.shutting_down.load(Ordering::SeqCst) {
            log::debug!("Status: {} (active: {})", snapshot.state, snapshot.active);
            if let Err(e) = state_file::write_status(&self.runtime_dir, snapshot) {
                log::warn!("Failed to write state file: {:#}", e);
            }
        }
    }

    /// Last published status
    pub fn status(&self) -> StatusSnapshot {
        *self.status.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<StatusSnapshot> {
        self.status.subscribe()
    }

    /// Refresh status on a fixed cadence. A probe that is still running
    /// when the next tick fires is left alone and that tick is skipped.
    pub fn spawn_status_poll(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(self.poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut in_flight: Option<JoinHandle<()>> = None;

            loop {
                ticker.tick().await;

                if in_flight.as_ref().is_some_and(|probe| !probe.is_finished()) {
                    log::debug!("Status probe still running, skipping tick");
                    continue;
                }

                let this = self.clone();
                in_flight = Some(tokio::spawn(async move {
                    this.refresh_status().await;
                }));
            }
        })
    }

    /// Stop background work and, if configured to, the tunnel
    pub async fn shutdown(&self, poll: JoinHandle<()>, subscription: Option<Subscription>) {
        log::info!("Shutting down gracefully...");

        self.shutting_down.store(true, Ordering::SeqCst);
        poll.abort();
        if let Some(subscription) = subscription {
            subscription.release();
        }

        if self.stop_on_exit {
            match self.controller.stop().await {
                Ok(StopOutcome::NotRunning) => {}
                Ok(_) => log::info!("Tunnel {} brought down", self.controller.tunnel_name()),
                Err(e) => log::error!("Failed to bring down tunnel: {}", e),
            }
        }

        state_file::cleanup(&self.runtime_dir);
        log::info!("Shutdown complete");
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::api::MonitoringInfo;
    use crate::backend::{BackendHandle, TunnelEvent};
    use crate::error::ConfigurationIncomplete;
    use crate::state::ConnectionStateMachine;
    use crate::store::FileStore;
    use crate::testing::{
        valid_descriptor, FakeApi, FakeBackend, FakeProbe, PEER_PUBLIC_KEY, PRIVATE_KEY,
    };
    use crate::types::DescriptorField;
    use std::sync::atomic::Ordering;
    use tokio::sync::mpsc;

    pub(crate) type TestService = ServiceLifecycle<FakeBackend, FakeProbe, FakeApi>;

    pub(crate) struct Fixture {
        pub dir: tempfile::TempDir,
        pub backend: BackendHandle<FakeBackend>,
        pub api: Arc<FakeApi>,
        pub store: Arc<VpnStore>,
        pub service: Arc<TestService>,
    }

    pub(crate) fn fixture() -> Fixture {
        let (backend, events) = FakeBackend::new();
        fixture_with(backend, events)
    }

    fn fixture_with(backend: FakeBackend, events: mpsc::UnboundedReceiver<TunnelEvent>) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let machine_id = dir.path().join("machine-id");
        std::fs::write(&machine_id, "0123456789abcdef\n").unwrap();

        let general = GeneralConfig {
            state_dir: dir.path().join("state"),
            runtime_dir: dir.path().join("run"),
            machine_id_path: machine_id.clone(),
            poll_interval_ms: 20,
            ..GeneralConfig::default()
        };

        let store = Arc::new(VpnStore::new(FileStore::open(&general.state_dir).unwrap()));
        let probe = Arc::new(backend.probe());
        let handle = BackendHandle::ready(backend);
        let machine = Arc::new(ConnectionStateMachine::new(store.clone()));
        let controller = Arc::new(
            TunnelController::new(&general.tunnel_name, handle.clone(), probe, machine).unwrap(),
        );
        controller.clone().spawn_event_loop(events);

        let api = Arc::new(FakeApi::new());
        let provisioning = Arc::new(ProvisioningSequencer::new(
            api.clone(),
            store.clone(),
            machine_id,
        ));
        let service = Arc::new(ServiceLifecycle::new(
            controller,
            provisioning,
            store.clone(),
            &general,
        ));

        Fixture {
            dir,
            backend: handle,
            api,
            store,
            service,
        }
    }

    fn complete_info() -> MonitoringInfo {
        MonitoringInfo {
            ip: Some("10.8.0.5/32".to_string()),
            dns: Some("10.8.0.1".to_string()),
            peer_public_key: Some(PEER_PUBLIC_KEY.to_string()),
            peer_preshared_key: None,
            peer_allowed_ips: Some("0.0.0.0/0".to_string()),
            peer_endpoint: Some("vpn.example.com:51820".to_string()),
            peer_persistent_keepalive: Some("25".to_string()),
        }
    }

    pub(crate) async fn wait_for(service: &TestService, state: ConnectionState) {
        let mut rx = service.controller.state_machine().subscribe();
        tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|s| *s == state))
            .await
            .expect("timed out waiting for state")
            .unwrap();
    }

    fn up_calls(f: &Fixture) -> usize {
        f.backend.try_get().unwrap().up_calls.load(Ordering::SeqCst)
    }

    #[tokio::test]
    async fn test_resume_without_configuration() {
        let f = fixture();
        let outcome = f.service.handle(ServiceCommand::Resume).await.unwrap();
        assert_eq!(outcome, CommandOutcome::NotConfigured);
        assert_eq!(up_calls(&f), 0);
    }

    #[tokio::test]
    async fn test_connect_fetches_and_persists() {
        let f = fixture();
        *f.api.monitoring.lock().unwrap() = complete_info();

        let outcome = f.service.handle(ServiceCommand::Connect(None)).await.unwrap();
        assert_eq!(outcome, CommandOutcome::ConnectRequested);
        wait_for(&f.service, ConnectionState::Connected).await;

        assert!(f.store.flags().configured);
        assert_eq!(f.api.fetch_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_connect_incomplete_does_not_start() {
        let f = fixture();
        *f.api.monitoring.lock().unwrap() = MonitoringInfo {
            peer_endpoint: None,
            ..complete_info()
        };

        let err = f
            .service
            .handle(ServiceCommand::Connect(None))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ServiceError::Provisioning(ProvisioningError::Incomplete(ConfigurationIncomplete { ref missing }))
                if missing == &vec![DescriptorField::PeerEndpoint]
        ));
        assert_eq!(up_calls(&f), 0);
        assert_eq!(f.service.controller.status(), ConnectionState::NoConnection);
    }

    #[tokio::test]
    async fn test_connect_with_payload_skips_provisioning() {
        let f = fixture();
        let outcome = f
            .service
            .handle(ServiceCommand::Connect(Some(valid_descriptor())))
            .await
            .unwrap();
        assert_eq!(outcome, CommandOutcome::ConnectRequested);
        assert_eq!(f.api.fetch_calls.load(Ordering::SeqCst), 0);
        assert!(!f.store.flags().configured);
    }

    #[tokio::test]
    async fn test_connect_when_active() {
        let f = fixture();
        f.service
            .handle(ServiceCommand::Connect(Some(valid_descriptor())))
            .await
            .unwrap();
        wait_for(&f.service, ConnectionState::Connected).await;

        let outcome = f
            .service
            .handle(ServiceCommand::Connect(Some(valid_descriptor())))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            CommandOutcome::AlreadyActive(ConnectionState::Connected)
        );
        assert_eq!(up_calls(&f), 1);
    }

    #[tokio::test]
    async fn test_resume_after_restart() {
        let f = fixture();
        *f.api.monitoring.lock().unwrap() = complete_info();
        f.service.handle(ServiceCommand::Connect(None)).await.unwrap();
        wait_for(&f.service, ConnectionState::Connected).await;

        // Tunnel gone, as after a reboot
        f.backend.try_get().unwrap().set_running("wg_default", false);
        f.service.refresh_status().await;

        let outcome = f.service.handle(ServiceCommand::Resume).await.unwrap();
        assert_eq!(outcome, CommandOutcome::ConnectRequested);
        wait_for(&f.service, ConnectionState::Connected).await;
        assert_eq!(up_calls(&f), 2);
        assert_eq!(f.api.fetch_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_slow_resume_does_not_block_commands() {
        let (backend, events) = FakeBackend::new();
        let f = fixture_with(backend.with_delay(Duration::from_millis(500)), events);
        f.store.save_keypair(PRIVATE_KEY, PEER_PUBLIC_KEY).unwrap();
        f.store.mark_public_key_sent().unwrap();
        f.store.save_configuration(&valid_descriptor()).unwrap();

        let resume = f.service.clone().spawn_resume();
        wait_for(&f.service, ConnectionState::Connecting).await;

        let status = tokio::time::timeout(
            Duration::from_millis(200),
            f.service.handle(ServiceCommand::Status),
        )
        .await
        .expect("status blocked behind resume")
        .unwrap();
        assert_eq!(
            status,
            CommandOutcome::Status(StatusSnapshot {
                state: ConnectionState::Connecting,
                active: false,
            })
        );

        resume.await.unwrap();
        wait_for(&f.service, ConnectionState::Connected).await;
        assert_eq!(up_calls(&f), 1);
    }

    #[tokio::test]
    async fn test_disconnect() {
        let f = fixture();
        assert_eq!(
            f.service.handle(ServiceCommand::Disconnect).await.unwrap(),
            CommandOutcome::NotRunning
        );

        f.service
            .handle(ServiceCommand::Connect(Some(valid_descriptor())))
            .await
            .unwrap();
        wait_for(&f.service, ConnectionState::Connected).await;

        assert_eq!(
            f.service.handle(ServiceCommand::Disconnect).await.unwrap(),
            CommandOutcome::DisconnectRequested
        );
        wait_for(&f.service, ConnectionState::Disconnected).await;
    }

    #[tokio::test]
    async fn test_forget_stops_and_reprovisions() {
        let f = fixture();
        *f.api.monitoring.lock().unwrap() = complete_info();
        f.service.handle(ServiceCommand::Connect(None)).await.unwrap();
        wait_for(&f.service, ConnectionState::Connected).await;

        let outcome = f.service.handle(ServiceCommand::Forget).await.unwrap();
        assert_eq!(outcome, CommandOutcome::Forgotten { registered: true });
        wait_for(&f.service, ConnectionState::Disconnected).await;

        let flags = f.store.flags();
        assert!(flags.keys_created && flags.public_key_sent);
        assert!(!flags.configured);
        assert_eq!(f.api.register_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_status_poll_publishes_and_writes_file() {
        let f = fixture();
        let mut status = f.service.subscribe_status();
        let poll = f.service.clone().spawn_status_poll();

        f.service
            .handle(ServiceCommand::Connect(Some(valid_descriptor())))
            .await
            .unwrap();

        tokio::time::timeout(
            Duration::from_secs(2),
            status.wait_for(|s| s.active && s.state == ConnectionState::Connected),
        )
        .await
        .unwrap()
        .unwrap();

        let contents =
            std::fs::read_to_string(state_file::state_file_path(&f.dir.path().join("run"))).unwrap();
        assert!(contents.contains("STATE=CONNECTED"));
        assert!(contents.contains("ACTIVE=true"));

        f.service.shutdown(poll, None).await;
        assert!(!state_file::state_file_path(&f.dir.path().join("run")).exists());
        assert_eq!(
            f.backend.try_get().unwrap().down_calls.load(Ordering::SeqCst),
            1
        );
    }
}
