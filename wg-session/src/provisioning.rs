// Device provisioning

//! One-time device bootstrap and connect-time configuration fetch
//!
//! Each bootstrap step runs only while its gating flag is clear and is
//! persisted as soon as it succeeds, so a failed run simply resumes at the
//! failing step on the next invocation.

use crate::api::ProvisioningApi;
use crate::error::{ConfigurationIncomplete, ProvisioningError, ProvisioningStepError};
use crate::store::VpnStore;
use crate::types::{DescriptorField, GatingFlags, ServerDescriptor};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use wireguard_control::Key;

/// Fields the fetched configuration must carry before a connect
const FETCH_REQUIRED: [DescriptorField; 7] = [
    DescriptorField::InterfacePrivateKey,
    DescriptorField::InterfaceAddress,
    DescriptorField::InterfaceDns,
    DescriptorField::PeerPublicKey,
    DescriptorField::PeerAllowedIps,
    DescriptorField::PeerEndpoint,
    DescriptorField::PeerPersistentKeepalive,
];

/// A bootstrap step that ran to completion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapStep {
    DeviceId,
    Keypair,
    Registration,
}

/// Outcome of a bootstrap run
#[derive(Debug, Default)]
pub struct BootstrapReport {
    /// Steps performed by this run
    pub performed: Vec<BootstrapStep>,
    /// Flags after the run
    pub flags: GatingFlags,
    /// The step that failed, if any; it is retried on the next run
    pub error: Option<ProvisioningStepError>,
}

impl BootstrapReport {
    /// Device is registered and ready to fetch its configuration
    pub fn is_registered(&self) -> bool {
        self.error.is_none() && self.flags.public_key_sent
    }
}

/// Runs the provisioning steps against the store and the remote API
pub struct ProvisioningSequencer<A> {
    api: Arc<A>,
    store: Arc<VpnStore>,
    machine_id_path: PathBuf,
    running: Mutex<()>,
}

impl<A: ProvisioningApi> ProvisioningSequencer<A> {
    pub fn new(api: Arc<A>, store: Arc<VpnStore>, machine_id_path: impl Into<PathBuf>) -> Self {
        Self {
            api,
            store,
            machine_id_path: machine_id_path.into(),
            running: Mutex::new(()),
        }
    }

    /// Run the pending steps of device id, keypair and registration.
    /// Failures are logged and reported, never propagated.
    pub async fn bootstrap(&self) -> BootstrapReport {
        let _running = self.running.lock().await;
        self.bootstrap_locked().await
    }

    async fn bootstrap_locked(&self) -> BootstrapReport {
        let mut report = BootstrapReport::default();

        if let Err(e) = self.run_steps(&mut report.performed).await {
            log::warn!("Provisioning step failed, will retry on next bootstrap: {}", e);
            report.error = Some(e);
        }

        report.flags = self.store.flags();
        report
    }

    async fn run_steps(&self, performed: &mut Vec<BootstrapStep>) -> Result<(), ProvisioningStepError> {
        let mut identity = self.store.device_identity();

        if identity.device_id.is_empty() {
            let device_id = read_device_id(&self.machine_id_path).await?;
            self.store
                .save_device_id(&device_id)
                .map_err(ProvisioningStepError::Store)?;
            log::info!("Device id set to {}", device_id);
            identity.device_id = device_id;
            performed.push(BootstrapStep::DeviceId);
        }

        if !self.store.flags().keys_created {
            let private_key = Key::generate_private();
            let public_key = private_key.get_public();
            self.store
                .save_keypair(&private_key.to_base64(), &public_key.to_base64())
                .map_err(ProvisioningStepError::Store)?;
            log::info!("Generated device keypair, public key {}", public_key.to_base64());
            identity = self.store.device_identity();
            performed.push(BootstrapStep::Keypair);
        }

        if !self.store.flags().public_key_sent {
            let response = self
                .api
                .register_public_key(&identity.device_id, &identity.public_key)
                .await?;
            if !response.success {
                return Err(ProvisioningStepError::Rejected);
            }
            self.store
                .mark_public_key_sent()
                .map_err(ProvisioningStepError::Store)?;
            log::info!("Public key registered with the provisioning backend");
            performed.push(BootstrapStep::Registration);
        }

        Ok(())
    }

    /// Fetch the tunnel parameters assigned to this device, check that
    /// they are complete and persist them
    pub async fn prepare_connect(&self) -> Result<ServerDescriptor, ProvisioningError> {
        if !self.store.flags().public_key_sent {
            return Err(ProvisioningError::NotRegistered);
        }

        let identity = self.store.device_identity();
        let info = self
            .api
            .fetch_monitoring_info(&identity.device_id)
            .await
            .map_err(ProvisioningStepError::from)?;

        let descriptor = info.into_descriptor(&identity.private_key);
        let missing = descriptor.missing(&FETCH_REQUIRED);
        if !missing.is_empty() {
            return Err(ConfigurationIncomplete { missing }.into());
        }

        self.store
            .save_configuration(&descriptor)
            .map_err(ProvisioningStepError::Store)?;
        log::info!("Tunnel configuration fetched and stored");
        Ok(descriptor)
    }

    /// Forget the configuration and the keypair, then provision afresh
    pub async fn forget(&self) -> Result<BootstrapReport, ProvisioningStepError> {
        let _running = self.running.lock().await;

        self.store
            .clear_configuration()
            .map_err(ProvisioningStepError::Store)?;
        log::info!("Stored configuration cleared");

        Ok(self.bootstrap_locked().await)
    }
}

/// First non-empty line of the machine id file
async fn read_device_id(path: &Path) -> Result<String, ProvisioningStepError> {
    let error = |reason: String| ProvisioningStepError::DeviceId {
        path: path.display().to_string(),
        reason,
    };

    let contents = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| error(e.to_string()))?;

    contents
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(str::to_string)
        .ok_or_else(|| error("file is empty".to_string()))
}
