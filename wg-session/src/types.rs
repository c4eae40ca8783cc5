// Shared types between the controller, provisioning and the host process

//! Shared data structures
//!
//! This module defines the data model shared between components: the
//! server descriptor that feeds the config builder, the device identity and
//! gating flags owned by provisioning, the connection state published by
//! the state machine, and the daemon configuration structures.

use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Names each field of a [`ServerDescriptor`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorField {
    InterfaceAddress,
    InterfaceDns,
    InterfacePrivateKey,
    PeerPublicKey,
    PeerPresharedKey,
    PeerAllowedIps,
    PeerEndpoint,
    PeerPersistentKeepalive,
}

impl DescriptorField {
    /// All fields, in wire-format order
    pub const ALL: [DescriptorField; 8] = [
        DescriptorField::InterfacePrivateKey,
        DescriptorField::InterfaceAddress,
        DescriptorField::InterfaceDns,
        DescriptorField::PeerPublicKey,
        DescriptorField::PeerPresharedKey,
        DescriptorField::PeerAllowedIps,
        DescriptorField::PeerEndpoint,
        DescriptorField::PeerPersistentKeepalive,
    ];

    /// Human-readable name, matching the wire-format key
    pub fn as_str(self) -> &'static str {
        match self {
            DescriptorField::InterfaceAddress => "Address",
            DescriptorField::InterfaceDns => "DNS",
            DescriptorField::InterfacePrivateKey => "PrivateKey",
            DescriptorField::PeerPublicKey => "PublicKey",
            DescriptorField::PeerPresharedKey => "PresharedKey",
            DescriptorField::PeerAllowedIps => "AllowedIPs",
            DescriptorField::PeerEndpoint => "Endpoint",
            DescriptorField::PeerPersistentKeepalive => "PersistentKeepalive",
        }
    }
}

impl fmt::Display for DescriptorField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Blank strings are treated as absent, everything else is trimmed.
fn normalize(value: Option<String>) -> Option<String> {
    value.and_then(|v| {
        let trimmed = v.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn deserialize_normalized<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<String>::deserialize(deserializer).map(normalize)
}

/// Declarative description of the remote gateway and the local interface.
///
/// Every field is optional at the boundary. Values are normalised on
/// construction so an accessor returns `Some` only for non-blank content.
/// Instances are immutable; `with` consumes and returns a new descriptor.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerDescriptor {
    #[serde(rename = "address", default, deserialize_with = "deserialize_normalized")]
    interface_address: Option<String>,
    #[serde(rename = "dns", default, deserialize_with = "deserialize_normalized")]
    interface_dns: Option<String>,
    #[serde(rename = "private_key", default, deserialize_with = "deserialize_normalized")]
    interface_private_key: Option<String>,
    #[serde(rename = "public_key", default, deserialize_with = "deserialize_normalized")]
    peer_public_key: Option<String>,
    #[serde(rename = "preshared_key", default, deserialize_with = "deserialize_normalized")]
    peer_preshared_key: Option<String>,
    #[serde(rename = "allowed_ips", default, deserialize_with = "deserialize_normalized")]
    peer_allowed_ips: Option<String>,
    #[serde(rename = "endpoint", default, deserialize_with = "deserialize_normalized")]
    peer_endpoint: Option<String>,
    #[serde(
        rename = "persistent_keep_alive",
        default,
        deserialize_with = "deserialize_normalized"
    )]
    peer_persistent_keepalive: Option<String>,
}

impl ServerDescriptor {
    /// Create an empty descriptor
    pub fn new() -> Self {
        Self::default()
    }

    /// Return a copy with `field` set to `value` (blank clears it)
    pub fn with(mut self, field: DescriptorField, value: impl Into<String>) -> Self {
        *self.slot(field) = normalize(Some(value.into()));
        self
    }

    /// Return a copy with `field` set from an optional value
    pub fn with_opt(mut self, field: DescriptorField, value: Option<String>) -> Self {
        *self.slot(field) = normalize(value);
        self
    }

    fn slot(&mut self, field: DescriptorField) -> &mut Option<String> {
        match field {
            DescriptorField::InterfaceAddress => &mut self.interface_address,
            DescriptorField::InterfaceDns => &mut self.interface_dns,
            DescriptorField::InterfacePrivateKey => &mut self.interface_private_key,
            DescriptorField::PeerPublicKey => &mut self.peer_public_key,
            DescriptorField::PeerPresharedKey => &mut self.peer_preshared_key,
            DescriptorField::PeerAllowedIps => &mut self.peer_allowed_ips,
            DescriptorField::PeerEndpoint => &mut self.peer_endpoint,
            DescriptorField::PeerPersistentKeepalive => &mut self.peer_persistent_keepalive,
        }
    }

    /// Non-blank value of `field`, if any
    pub fn get(&self, field: DescriptorField) -> Option<&str> {
        match field {
            DescriptorField::InterfaceAddress => self.interface_address.as_deref(),
            DescriptorField::InterfaceDns => self.interface_dns.as_deref(),
            DescriptorField::InterfacePrivateKey => self.interface_private_key.as_deref(),
            DescriptorField::PeerPublicKey => self.peer_public_key.as_deref(),
            DescriptorField::PeerPresharedKey => self.peer_preshared_key.as_deref(),
            DescriptorField::PeerAllowedIps => self.peer_allowed_ips.as_deref(),
            DescriptorField::PeerEndpoint => self.peer_endpoint.as_deref(),
            DescriptorField::PeerPersistentKeepalive => self.peer_persistent_keepalive.as_deref(),
        }
    }

    /// The subset of `fields` that are blank in this descriptor
    pub fn missing(&self, fields: &[DescriptorField]) -> Vec<DescriptorField> {
        fields
            .iter()
            .copied()
            .filter(|f| self.get(*f).is_none())
            .collect()
    }
}

fn redacted(secret: &Option<String>) -> Option<&'static str> {
    secret.as_ref().map(|_| "[REDACTED]")
}

impl fmt::Debug for ServerDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerDescriptor")
            .field("interface_address", &self.interface_address)
            .field("interface_dns", &self.interface_dns)
            .field("interface_private_key", &redacted(&self.interface_private_key))
            .field("peer_public_key", &self.peer_public_key)
            .field("peer_preshared_key", &redacted(&self.peer_preshared_key))
            .field("peer_allowed_ips", &self.peer_allowed_ips)
            .field("peer_endpoint", &self.peer_endpoint)
            .field("peer_persistent_keepalive", &self.peer_persistent_keepalive)
            .finish()
    }
}

/// The device's cryptographic identity
#[derive(Clone, Default, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub device_id: String,
    pub private_key: String,
    pub public_key: String,
}

impl fmt::Debug for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceIdentity")
            .field("device_id", &self.device_id)
            .field("public_key", &self.public_key)
            .field("private_key", &"[REDACTED]")
            .finish()
    }
}

/// Monotonic provisioning progress flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GatingFlags {
    pub keys_created: bool,
    pub public_key_sent: bool,
    pub configured: bool,
}

impl GatingFlags {
    /// A later flag is never set while an earlier one is clear
    pub fn is_consistent(&self) -> bool {
        (!self.public_key_sent || self.keys_created) && (!self.configured || self.public_key_sent)
    }
}

/// Connection state published to observers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    Prepare,
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
    NoConnection,
    Refreshing,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Prepare => "PREPARE",
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::Connected => "CONNECTED",
            ConnectionState::Disconnecting => "DISCONNECTING",
            ConnectionState::Disconnected => "DISCONNECTED",
            ConnectionState::NoConnection => "NO_CONNECTION",
            ConnectionState::Refreshing => "REFRESHING",
        }
    }

    /// A connect or disconnect is currently in flight
    pub fn is_transitional(self) -> bool {
        matches!(
            self,
            ConnectionState::Prepare | ConnectionState::Connecting | ConnectionState::Disconnecting
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConnectionState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "PREPARE" => ConnectionState::Prepare,
            "CONNECTING" => ConnectionState::Connecting,
            "CONNECTED" => ConnectionState::Connected,
            "DISCONNECTING" => ConnectionState::Disconnecting,
            "DISCONNECTED" => ConnectionState::Disconnected,
            "NO_CONNECTION" => ConnectionState::NoConnection,
            "REFRESHING" => ConnectionState::Refreshing,
            other => anyhow::bail!("Unknown connection state: {}", other),
        })
    }
}

/// Main configuration structure
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    pub api: ApiConfig,
}

/// General configuration options
#[derive(Debug, Deserialize, Clone)]
pub struct GeneralConfig {
    #[serde(default = "default_tunnel_name")]
    pub tunnel_name: String,
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    #[serde(default = "default_runtime_dir")]
    pub runtime_dir: PathBuf,
    #[serde(default = "default_machine_id_path")]
    pub machine_id_path: PathBuf,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Bring the tunnel down when the daemon exits
    #[serde(default = "default_stop_on_exit")]
    pub stop_on_exit: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            tunnel_name: default_tunnel_name(),
            state_dir: default_state_dir(),
            runtime_dir: default_runtime_dir(),
            machine_id_path: default_machine_id_path(),
            log_level: default_log_level(),
            poll_interval_ms: default_poll_interval_ms(),
            stop_on_exit: default_stop_on_exit(),
        }
    }
}

/// Remote provisioning backend
#[derive(Debug, Deserialize, Clone)]
pub struct ApiConfig {
    pub base_url: String,
    #[serde(default = "default_register_path")]
    pub register_path: String,
    #[serde(default = "default_monitoring_path")]
    pub monitoring_path: String,
    pub username: String,
    pub password: String,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

// Default values for configuration
fn default_tunnel_name() -> String {
    "wg_default".to_string()
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("/var/lib/wg-session")
}

fn default_runtime_dir() -> PathBuf {
    PathBuf::from("/run/wg-session")
}

fn default_machine_id_path() -> PathBuf {
    PathBuf::from("/etc/machine-id")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_stop_on_exit() -> bool {
    true
}

fn default_register_path() -> String {
    "registerPublicKey".to_string()
}

fn default_monitoring_path() -> String {
    "monitoringInfo".to_string()
}

fn default_connect_timeout_secs() -> u64 {
    100
}
