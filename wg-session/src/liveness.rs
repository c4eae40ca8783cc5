//! Live tunnel transport detection
//!
//! Liveness is derived from what the system reports, not from the state
//! machine, so a tunnel torn down behind the controller's back is noticed.

use crate::backend::list_kernel_devices;
use anyhow::{Context, Result};
use std::collections::HashSet;
use std::future::Future;

/// Source of currently active tunnel transports
pub trait TransportProbe: Send + Sync + 'static {
    /// Names of tunnel interfaces that are up and carrying an address
    fn active_tunnel_transports(&self) -> impl Future<Output = Result<Vec<String>>> + Send;

    /// Whether `tunnel` is among the active transports. Probe failures
    /// count as inactive.
    fn is_tunnel_active(&self, tunnel: &str) -> impl Future<Output = bool> + Send {
        async move {
            match self.active_tunnel_transports().await {
                Ok(names) => names.iter().any(|n| n == tunnel),
                Err(e) => {
                    log::warn!("Transport probe failed: {:#}", e);
                    false
                }
            }
        }
    }
}

/// Kernel WireGuard devices that have at least one interface address
pub struct KernelTransportProbe;

impl TransportProbe for KernelTransportProbe {
    async fn active_tunnel_transports(&self) -> Result<Vec<String>> {
        let devices = list_kernel_devices()
            .await
            .context("Failed to list WireGuard devices")?;
        if devices.is_empty() {
            return Ok(devices);
        }

        let addressed: HashSet<String> = if_addrs::get_if_addrs()
            .context("Failed to get interface addresses")?
            .into_iter()
            .map(|iface| iface.name)
            .collect();

        Ok(devices
            .into_iter()
            .filter(|name| addressed.contains(name))
            .collect())
    }
}
