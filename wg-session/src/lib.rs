// WireGuard session library
// Shared modules for the daemon, the control client and tests

//! WireGuard session management
//!
//! Builds a WireGuard configuration from a provisioned server descriptor,
//! drives the tunnel through `wg-quick`, tracks the connection state and
//! keeps the device registered with the provisioning backend.
//!
//! # Main Components
//!
//! - [`tunnel_config`]: Descriptor validation and wg-quick rendering/parsing
//! - [`controller`]: Start/stop/status of the single managed tunnel
//! - [`state`]: Connection state machine
//! - [`provisioning`]: Device identity, key registration and config fetch
//! - [`connectivity`]: Reconnect when the network comes back
//! - [`service`]: Host process lifecycle and command handling
//! - [`control`]: Unix socket protocol between the CLI and the daemon

pub mod api;
pub mod backend;
pub mod config;
pub mod connectivity;
pub mod control;
pub mod controller;
pub mod error;
pub mod liveness;
pub mod provisioning;
pub mod service;
pub mod state;
pub mod state_file;
pub mod store;
pub mod tunnel_config;
pub mod types;

#[cfg(test)]
mod testing;
