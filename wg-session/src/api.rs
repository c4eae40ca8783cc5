//! Remote provisioning API client
//!
//! Two form-encoded POST operations authenticated with HTTP basic auth:
//! registering the device's public key and fetching the tunnel parameters
//! assigned to the device.

use crate::types::{ApiConfig, DescriptorField, ServerDescriptor};
use reqwest::Url;
use serde::Deserialize;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

/// Provisioning API client errors
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("HTTP request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("provisioning API error ({status}): {body}")]
    Status { status: u16, body: String },

    #[error("invalid API URL: {0}")]
    InvalidUrl(String),
}

/// Reply of the register operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct RegisterResponse {
    pub success: bool,
}

/// Tunnel parameters assigned to the device
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct MonitoringInfo {
    #[serde(rename = "ip_vpn", default)]
    pub ip: Option<String>,
    #[serde(rename = "vpn_interfaceDns", default)]
    pub dns: Option<String>,
    #[serde(rename = "vpn_peerPublicKey", default)]
    pub peer_public_key: Option<String>,
    #[serde(rename = "vpn_peerPresharedKey", default)]
    pub peer_preshared_key: Option<String>,
    #[serde(rename = "vpn_peerAllowedIPs", default)]
    pub peer_allowed_ips: Option<String>,
    #[serde(rename = "vpn_peerEndpoint", default)]
    pub peer_endpoint: Option<String>,
    #[serde(rename = "vpn_peerPersistentKeepalive", default)]
    pub peer_persistent_keepalive: Option<String>,
}

impl MonitoringInfo {
    /// Descriptor for this device, using its own private key
    pub fn into_descriptor(self, private_key: &str) -> ServerDescriptor {
        ServerDescriptor::new()
            .with(DescriptorField::InterfacePrivateKey, private_key)
            .with_opt(DescriptorField::InterfaceAddress, self.ip)
            .with_opt(DescriptorField::InterfaceDns, self.dns)
            .with_opt(DescriptorField::PeerPublicKey, self.peer_public_key)
            .with_opt(DescriptorField::PeerPresharedKey, self.peer_preshared_key)
            .with_opt(DescriptorField::PeerAllowedIps, self.peer_allowed_ips)
            .with_opt(DescriptorField::PeerEndpoint, self.peer_endpoint)
            .with_opt(
                DescriptorField::PeerPersistentKeepalive,
                self.peer_persistent_keepalive,
            )
    }
}

/// The two remote operations provisioning depends on
pub trait ProvisioningApi: Send + Sync + 'static {
    fn register_public_key(
        &self,
        device_id: &str,
        public_key: &str,
    ) -> impl Future<Output = Result<RegisterResponse, ApiError>> + Send;

    fn fetch_monitoring_info(
        &self,
        device_id: &str,
    ) -> impl Future<Output = Result<MonitoringInfo, ApiError>> + Send;
}

/// HTTP implementation of [`ProvisioningApi`]
#[derive(Debug)]
pub struct HttpProvisioningClient {
    http: reqwest::Client,
    register_url: Url,
    monitoring_url: Url,
    username: String,
    password: String,
}

impl HttpProvisioningClient {
    pub fn new(config: &ApiConfig) -> Result<Self, ApiError> {
        // Relative paths resolve under the base only if it ends with '/'
        let mut base = config.base_url.clone();
        if !base.ends_with('/') {
            base.push('/');
        }
        let base = Url::parse(&base).map_err(|e| ApiError::InvalidUrl(format!("{}: {}", base, e)))?;
        let join = |path: &str| {
            base.join(path.trim_start_matches('/'))
                .map_err(|e| ApiError::InvalidUrl(format!("{}: {}", path, e)))
        };

        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()?;

        Ok(Self {
            http,
            register_url: join(&config.register_path)?,
            monitoring_url: join(&config.monitoring_path)?,
            username: config.username.clone(),
            password: config.password.clone(),
        })
    }

    async fn post_form<T: serde::de::DeserializeOwned>(
        &self,
        url: &Url,
        form: &[(&str, &str)],
    ) -> Result<T, ApiError> {
        let resp = self
            .http
            .post(url.clone())
            .basic_auth(&self.username, Some(&self.password))
            .form(form)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ApiError::Status {
                status: status.as_u16(),
                body,
            });
        }

        Ok(resp.json().await?)
    }
}

impl ProvisioningApi for HttpProvisioningClient {
    async fn register_public_key(
        &self,
        device_id: &str,
        public_key: &str,
    ) -> Result<RegisterResponse, ApiError> {
        log::debug!("Registering public key for device {}", device_id);
        self.post_form(
            &self.register_url,
            &[("idPantalla", device_id), ("clave", public_key)],
        )
        .await
    }

    async fn fetch_monitoring_info(&self, device_id: &str) -> Result<MonitoringInfo, ApiError> {
        log::debug!("Fetching tunnel parameters for device {}", device_id);
        self.post_form(&self.monitoring_url, &[("idPantalla", device_id)])
            .await
    }
}
