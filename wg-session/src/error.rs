//! Error taxonomy
//!
//! Config and backend failures are reported through [`TunnelError`],
//! provisioning failures through [`ProvisioningError`], and both reach the
//! control surface as [`ServiceError`]. Glue code uses `anyhow`.

use crate::api::ApiError;
use crate::types::DescriptorField;
use thiserror::Error;

/// A descriptor could not be turned into a tunnel configuration
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("required field {0} is blank")]
    MissingField(DescriptorField),

    #[error("{field} is not a valid WireGuard key")]
    InvalidKey { field: DescriptorField },

    #[error("invalid {field} value '{value}': {reason}")]
    InvalidValue {
        field: DescriptorField,
        value: String,
        reason: String,
    },

    #[error("line {line}: {message}")]
    Parse { line: usize, message: String },
}

/// Failure reported by, or while reaching, the native tunnel backend
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("tunnel backend failed to initialize: {0}")]
    InitFailed(String),

    #[error("invalid tunnel name '{name}': {reason}")]
    InvalidTunnelName { name: String, reason: &'static str },

    #[error("no configuration available to bring tunnel '{0}' up")]
    MissingConfig(String),

    #[error("wg-quick {action} failed: {stderr}")]
    Command { action: &'static str, stderr: String },

    #[error("tunnel backend I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure of an explicit connect or disconnect
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("cannot connect: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// A single bootstrap step failed and will be retried on the next run
#[derive(Debug, Error)]
pub enum ProvisioningStepError {
    #[error("cannot read device identifier from {path}: {reason}")]
    DeviceId { path: String, reason: String },

    #[error("remote call failed: {0}")]
    Api(#[from] ApiError),

    #[error("remote backend rejected the public key")]
    Rejected,

    #[error("persisting provisioning state failed: {0:#}")]
    Store(anyhow::Error),
}

/// The fetched configuration lacks required fields; the caller should
/// prompt the user instead of connecting.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("configuration incomplete, missing: {}", format_fields(.missing))]
pub struct ConfigurationIncomplete {
    pub missing: Vec<DescriptorField>,
}

fn format_fields(fields: &[DescriptorField]) -> String {
    fields
        .iter()
        .map(|f| f.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Failure of the connect-time provisioning step
#[derive(Debug, Error)]
pub enum ProvisioningError {
    #[error("device is not registered with the provisioning backend yet")]
    NotRegistered,

    #[error(transparent)]
    Incomplete(#[from] ConfigurationIncomplete),

    #[error(transparent)]
    Step(#[from] ProvisioningStepError),
}

/// Failure of a host-process command
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Tunnel(#[from] TunnelError),

    #[error(transparent)]
    Provisioning(#[from] ProvisioningError),
}
