// Configuration file parser

//! Configuration file parsing and validation
//!
//! This module handles loading the daemon's TOML configuration file and
//! validating its contents, and provides the CIDR parsing shared with the
//! tunnel config builder.

use crate::backend::validate_tunnel_name;
use crate::types::Config;
use anyhow::{Context, Result};
use std::fs;
use std::net::IpAddr;
use std::path::Path;

/// Lower bound for the provisioning API connect timeout
pub const MIN_CONNECT_TIMEOUT_SECS: u64 = 100;

/// Load configuration from TOML file
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let contents = fs::read_to_string(path.as_ref()).context("Failed to read config file")?;

    let config: Config = toml::from_str(&contents).context("Failed to parse config file")?;

    validate_config(&config)?;
    Ok(config)
}

/// Validate configuration values
fn validate_config(config: &Config) -> Result<()> {
    validate_tunnel_name(&config.general.tunnel_name).context("Invalid tunnel_name")?;

    if config.general.poll_interval_ms == 0 {
        anyhow::bail!("poll_interval_ms must be > 0");
    }

    if config.general.state_dir.as_os_str().is_empty() {
        anyhow::bail!("state_dir cannot be empty");
    }

    if config.general.runtime_dir.as_os_str().is_empty() {
        anyhow::bail!("runtime_dir cannot be empty");
    }

    reqwest::Url::parse(&config.api.base_url)
        .with_context(|| format!("Invalid api.base_url: {}", config.api.base_url))?;

    if config.api.register_path.is_empty() || config.api.monitoring_path.is_empty() {
        anyhow::bail!("api.register_path and api.monitoring_path cannot be empty");
    }

    if config.api.username.is_empty() {
        anyhow::bail!("api.username cannot be empty");
    }

    if config.api.connect_timeout_secs < MIN_CONNECT_TIMEOUT_SECS {
        anyhow::bail!(
            "api.connect_timeout_secs must be >= {}, got {}",
            MIN_CONNECT_TIMEOUT_SECS,
            config.api.connect_timeout_secs
        );
    }

    Ok(())
}

/// Parse an address with an optional prefix length (`10.0.0.2/24`, `fd00::1`).
/// A missing prefix means a host route (/32 or /128).
pub fn parse_cidr(cidr: &str) -> Result<(IpAddr, u8)> {
    let (addr, prefix) = match cidr.split_once('/') {
        Some((addr, prefix)) => (addr, Some(prefix)),
        None => (cidr, None),
    };

    let ip: IpAddr = addr.trim().parse().context("Invalid IP address")?;
    let max_prefix = if ip.is_ipv4() { 32 } else { 128 };

    let prefix_len = match prefix {
        Some(p) => p.trim().parse::<u8>().context("Invalid prefix length")?,
        None => max_prefix,
    };

    if prefix_len > max_prefix {
        anyhow::bail!("Prefix length must be <= {}", max_prefix);
    }

    Ok((ip, prefix_len))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ApiConfig, GeneralConfig};
    use std::io::Write;
    use std::net::{Ipv4Addr, Ipv6Addr};

    fn base_config() -> Config {
        Config {
            general: GeneralConfig::default(),
            api: ApiConfig {
                base_url: "https://provision.example.com/api/".to_string(),
                register_path: "registerPublicKey".to_string(),
                monitoring_path: "monitoringInfo".to_string(),
                username: "device".to_string(),
                password: "secret".to_string(),
                connect_timeout_secs: 100,
            },
        }
    }

    #[test]
    fn test_parse_cidr() {
        let (ip, prefix) = parse_cidr("192.168.1.0/24").unwrap();
        assert_eq!(ip, IpAddr::V4(Ipv4Addr::new(192, 168, 1, 0)));
        assert_eq!(prefix, 24);

        let (ip, prefix) = parse_cidr("10.0.0.1").unwrap();
        assert_eq!(ip, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(prefix, 32);

        let (ip, prefix) = parse_cidr("fd00::2/64").unwrap();
        assert_eq!(ip, IpAddr::V6("fd00::2".parse::<Ipv6Addr>().unwrap()));
        assert_eq!(prefix, 64);

        let (_, prefix) = parse_cidr("::/0").unwrap();
        assert_eq!(prefix, 0);
    }

    #[test]
    fn test_parse_cidr_invalid() {
        assert!(parse_cidr("invalid").is_err());
        assert!(parse_cidr("192.168.1.0/").is_err());
        assert!(parse_cidr("192.168.1.0/33").is_err());
        assert!(parse_cidr("fd00::/129").is_err());
        assert!(parse_cidr("999.999.999.999/24").is_err());
    }

    #[test]
    fn test_validate_config() {
        let config = base_config();
        assert!(validate_config(&config).is_ok());

        // Bad tunnel name
        let mut bad_config = config.clone();
        bad_config.general.tunnel_name = "wg0; rm -rf /".to_string();
        assert!(validate_config(&bad_config).is_err());

        // Zero poll interval
        let mut bad_config = config.clone();
        bad_config.general.poll_interval_ms = 0;
        assert!(validate_config(&bad_config).is_err());

        // Invalid URL
        let mut bad_config = config.clone();
        bad_config.api.base_url = "not a url".to_string();
        assert!(validate_config(&bad_config).is_err());

        // Short connect timeout
        let mut bad_config = config.clone();
        bad_config.api.connect_timeout_secs = 30;
        assert!(validate_config(&bad_config).is_err());
    }

    #[test]
    fn test_load_config_applies_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[api]
base_url = "https://provision.example.com/api/"
username = "device"
password = "secret"
"#
        )
        .unwrap();

        let config = load_config(file.path()).unwrap();
        assert_eq!(config.general.tunnel_name, "wg_default");
        assert_eq!(config.general.poll_interval_ms, 1000);
        assert!(config.general.stop_on_exit);
        assert_eq!(config.api.connect_timeout_secs, 100);
        assert_eq!(config.api.register_path, "registerPublicKey");
    }

    #[test]
    fn test_load_config_missing_api_section() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[general]\ntunnel_name = \"wg1\"").unwrap();
        assert!(load_config(file.path()).is_err());
    }
}
