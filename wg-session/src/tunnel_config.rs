//! Tunnel configuration builder
//!
//! Turns a [`ServerDescriptor`] into a WireGuard configuration. Lines whose
//! value is blank are omitted rather than emitted empty, the `[Peer]`
//! section only exists when a peer public key is present, and the
//! split-tunnel exclusion list is applied to every build. Output is
//! deterministic: the same descriptor always renders the same bytes.

use crate::config::parse_cidr;
use crate::error::ConfigError;
use crate::types::{DescriptorField, ServerDescriptor};
use std::fmt::Write as _;
use wireguard_control::Key;

/// Applications whose traffic always bypasses the tunnel
pub const EXCLUDED_APPLICATIONS: &[&str] = &["org.wgsession.agent"];

/// Fields that must be present to bring a tunnel up
const CONNECT_REQUIRED: [DescriptorField; 3] = [
    DescriptorField::InterfacePrivateKey,
    DescriptorField::InterfaceAddress,
    DescriptorField::PeerPublicKey,
];

/// Whether the build feeds an actual connect or is only for display
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildMode {
    /// Required fields are enforced and values are validated
    Connect,
    /// No validation; renders whatever is present
    Preview,
}

/// Output format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    /// Includes `ExcludedApplications` in `[Interface]`
    Full,
    /// Plain wg-quick format
    WgQuick,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct InterfaceSection {
    private_key: Option<String>,
    address: Option<String>,
    dns: Option<String>,
    excluded_applications: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct PeerSection {
    public_key: String,
    preshared_key: Option<String>,
    allowed_ips: Option<String>,
    endpoint: Option<String>,
    persistent_keepalive: Option<String>,
}

/// A tunnel configuration, opaque to callers apart from rendering
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelConfig {
    interface: InterfaceSection,
    peer: Option<PeerSection>,
}

/// Build a tunnel configuration from a descriptor
pub fn build(descriptor: &ServerDescriptor, mode: BuildMode) -> Result<TunnelConfig, ConfigError> {
    if mode == BuildMode::Connect {
        validate(descriptor)?;
    }

    let field = |f: DescriptorField| descriptor.get(f).map(str::to_string);

    let interface = InterfaceSection {
        private_key: field(DescriptorField::InterfacePrivateKey),
        address: field(DescriptorField::InterfaceAddress),
        dns: field(DescriptorField::InterfaceDns),
        excluded_applications: EXCLUDED_APPLICATIONS.iter().map(|a| a.to_string()).collect(),
    };

    let peer = field(DescriptorField::PeerPublicKey).map(|public_key| PeerSection {
        public_key,
        preshared_key: field(DescriptorField::PeerPresharedKey),
        allowed_ips: field(DescriptorField::PeerAllowedIps),
        endpoint: field(DescriptorField::PeerEndpoint),
        persistent_keepalive: field(DescriptorField::PeerPersistentKeepalive),
    });

    Ok(TunnelConfig { interface, peer })
}

fn validate(descriptor: &ServerDescriptor) -> Result<(), ConfigError> {
    if let Some(missing) = descriptor.missing(&CONNECT_REQUIRED).first() {
        return Err(ConfigError::MissingField(*missing));
    }

    for key_field in [
        DescriptorField::InterfacePrivateKey,
        DescriptorField::PeerPublicKey,
        DescriptorField::PeerPresharedKey,
    ] {
        if let Some(value) = descriptor.get(key_field) {
            if Key::from_base64(value).is_err() {
                return Err(ConfigError::InvalidKey { field: key_field });
            }
        }
    }

    for list_field in [DescriptorField::InterfaceAddress, DescriptorField::PeerAllowedIps] {
        if let Some(value) = descriptor.get(list_field) {
            validate_cidr_list(list_field, value)?;
        }
    }

    if let Some(endpoint) = descriptor.get(DescriptorField::PeerEndpoint) {
        validate_endpoint(endpoint)?;
    }

    if let Some(keepalive) = descriptor.get(DescriptorField::PeerPersistentKeepalive) {
        keepalive
            .parse::<u16>()
            .map_err(|e| invalid(DescriptorField::PeerPersistentKeepalive, keepalive, e))?;
    }

    Ok(())
}

fn invalid(field: DescriptorField, value: &str, reason: impl ToString) -> ConfigError {
    ConfigError::InvalidValue {
        field,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn validate_cidr_list(field: DescriptorField, value: &str) -> Result<(), ConfigError> {
    for entry in value.split(',').map(str::trim) {
        if entry.is_empty() {
            return Err(invalid(field, value, "empty list entry"));
        }
        parse_cidr(entry).map_err(|e| invalid(field, entry, e))?;
    }
    Ok(())
}

fn validate_endpoint(endpoint: &str) -> Result<(), ConfigError> {
    let field = DescriptorField::PeerEndpoint;
    let (host, port) = endpoint
        .rsplit_once(':')
        .ok_or_else(|| invalid(field, endpoint, "expected host:port"))?;

    if host.is_empty() {
        return Err(invalid(field, endpoint, "missing host"));
    }

    match port.parse::<u16>() {
        Ok(0) => Err(invalid(field, endpoint, "port must be non-zero")),
        Ok(_) => Ok(()),
        Err(e) => Err(invalid(field, endpoint, e)),
    }
}

impl TunnelConfig {
    /// Render the configuration as text
    pub fn render(&self, dialect: Dialect) -> String {
        let mut out = String::from("[Interface]\n");
        push_line(&mut out, "PrivateKey", self.interface.private_key.as_deref());
        push_line(&mut out, "Address", self.interface.address.as_deref());
        push_line(&mut out, "DNS", self.interface.dns.as_deref());
        if dialect == Dialect::Full && !self.interface.excluded_applications.is_empty() {
            let apps = self.interface.excluded_applications.join(", ");
            push_line(&mut out, "ExcludedApplications", Some(&apps));
        }

        if let Some(peer) = &self.peer {
            out.push_str("\n[Peer]\n");
            push_line(&mut out, "PublicKey", Some(&peer.public_key));
            push_line(&mut out, "PresharedKey", peer.preshared_key.as_deref());
            push_line(&mut out, "AllowedIPs", peer.allowed_ips.as_deref());
            push_line(&mut out, "Endpoint", peer.endpoint.as_deref());
            push_line(&mut out, "PersistentKeepalive", peer.persistent_keepalive.as_deref());
        }

        out
    }

    /// Applications excluded from the tunnel's routing
    pub fn excluded_applications(&self) -> &[String] {
        &self.interface.excluded_applications
    }

    /// Whether a `[Peer]` section is present
    pub fn has_peer(&self) -> bool {
        self.peer.is_some()
    }

    /// Parse a configuration in either dialect.
    ///
    /// Keys the descriptor has no slot for (ListenPort, MTU, ...) are skipped.
    pub fn parse(text: &str) -> Result<TunnelConfig, ConfigError> {
        #[derive(PartialEq)]
        enum Section {
            None,
            Interface,
            Peer,
        }

        let mut section = Section::None;
        let mut interface = InterfaceSection::default();
        let mut peer_seen = false;
        let mut peer_public_key: Option<String> = None;
        let mut peer = PeerSection {
            public_key: String::new(),
            preshared_key: None,
            allowed_ips: None,
            endpoint: None,
            persistent_keepalive: None,
        };

        for (idx, raw) in text.lines().enumerate() {
            let line_no = idx + 1;
            let line = raw.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }

            if line.starts_with('[') {
                section = match line.to_ascii_lowercase().as_str() {
                    "[interface]" => Section::Interface,
                    "[peer]" if peer_seen => {
                        return Err(ConfigError::Parse {
                            line: line_no,
                            message: "only one [Peer] section is supported".to_string(),
                        })
                    }
                    "[peer]" => {
                        peer_seen = true;
                        Section::Peer
                    }
                    other => {
                        return Err(ConfigError::Parse {
                            line: line_no,
                            message: format!("unknown section {}", other),
                        })
                    }
                };
                continue;
            }

            let (key, value) = line.split_once('=').ok_or_else(|| ConfigError::Parse {
                line: line_no,
                message: "expected 'Key = Value'".to_string(),
            })?;
            let key = key.trim().to_ascii_lowercase();
            let value = value.trim().to_string();

            match (&section, key.as_str()) {
                (Section::None, _) => {
                    return Err(ConfigError::Parse {
                        line: line_no,
                        message: "key outside of a section".to_string(),
                    })
                }
                (Section::Interface, "privatekey") => interface.private_key = Some(value),
                (Section::Interface, "address") => append_list(&mut interface.address, value),
                (Section::Interface, "dns") => append_list(&mut interface.dns, value),
                (Section::Interface, "excludedapplications") => {
                    interface.excluded_applications.extend(
                        value
                            .split(',')
                            .map(str::trim)
                            .filter(|a| !a.is_empty())
                            .map(str::to_string),
                    );
                }
                (Section::Peer, "publickey") => peer_public_key = Some(value),
                (Section::Peer, "presharedkey") => peer.preshared_key = Some(value),
                (Section::Peer, "allowedips") => append_list(&mut peer.allowed_ips, value),
                (Section::Peer, "endpoint") => peer.endpoint = Some(value),
                (Section::Peer, "persistentkeepalive") => peer.persistent_keepalive = Some(value),
                (_, other) => {
                    log::debug!("Ignoring unsupported key '{}' on line {}", other, line_no);
                }
            }
        }

        let peer = match peer_public_key {
            Some(public_key) => Some(PeerSection { public_key, ..peer }),
            None if peer_seen => {
                return Err(ConfigError::Parse {
                    line: 0,
                    message: "[Peer] section without PublicKey".to_string(),
                })
            }
            None => None,
        };

        Ok(TunnelConfig { interface, peer })
    }

    /// Convert back into a descriptor (exclusions are not part of it)
    pub fn to_descriptor(&self) -> ServerDescriptor {
        let mut descriptor = ServerDescriptor::new()
            .with_opt(
                DescriptorField::InterfacePrivateKey,
                self.interface.private_key.clone(),
            )
            .with_opt(DescriptorField::InterfaceAddress, self.interface.address.clone())
            .with_opt(DescriptorField::InterfaceDns, self.interface.dns.clone());

        if let Some(peer) = &self.peer {
            descriptor = descriptor
                .with(DescriptorField::PeerPublicKey, peer.public_key.clone())
                .with_opt(DescriptorField::PeerPresharedKey, peer.preshared_key.clone())
                .with_opt(DescriptorField::PeerAllowedIps, peer.allowed_ips.clone())
                .with_opt(DescriptorField::PeerEndpoint, peer.endpoint.clone())
                .with_opt(
                    DescriptorField::PeerPersistentKeepalive,
                    peer.persistent_keepalive.clone(),
                );
        }

        descriptor
    }
}

fn push_line(out: &mut String, key: &str, value: Option<&str>) {
    if let Some(value) = value.filter(|v| !v.trim().is_empty()) {
        let _ = writeln!(out, "{} = {}", key, value);
    }
}

fn append_list(slot: &mut Option<String>, value: String) {
    if value.is_empty() {
        return;
    }
    *slot = Some(match slot.take() {
        Some(existing) => format!("{}, {}", existing, value),
        None => value,
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn private_key() -> String {
        Key::generate_private().to_base64()
    }

    fn full_descriptor() -> ServerDescriptor {
        let private = Key::generate_private();
        let peer = Key::generate_private().get_public();
        ServerDescriptor::new()
            .with(DescriptorField::InterfaceAddress, "10.0.0.2/24")
            .with(DescriptorField::InterfaceDns, "1.1.1.1")
            .with(DescriptorField::InterfacePrivateKey, private.to_base64())
            .with(DescriptorField::PeerPublicKey, peer.to_base64())
            .with(DescriptorField::PeerAllowedIps, "0.0.0.0/0")
            .with(DescriptorField::PeerEndpoint, "vpn.example.com:51820")
            .with(DescriptorField::PeerPersistentKeepalive, "25")
    }

    #[test]
    fn test_full_descriptor_emits_every_line() {
        let descriptor = full_descriptor();
        let text = build(&descriptor, BuildMode::Connect)
            .unwrap()
            .render(Dialect::WgQuick);

        assert!(text.contains("[Interface]\n"));
        assert!(text.contains("\n[Peer]\n"));
        for line in [
            format!(
                "PrivateKey = {}",
                descriptor.get(DescriptorField::InterfacePrivateKey).unwrap()
            ),
            "Address = 10.0.0.2/24".to_string(),
            "DNS = 1.1.1.1".to_string(),
            format!(
                "PublicKey = {}",
                descriptor.get(DescriptorField::PeerPublicKey).unwrap()
            ),
            "AllowedIPs = 0.0.0.0/0".to_string(),
            "Endpoint = vpn.example.com:51820".to_string(),
            "PersistentKeepalive = 25".to_string(),
        ] {
            assert!(text.contains(&line), "missing line {:?} in\n{}", line, text);
        }
        assert!(!text.contains("PresharedKey"));
        assert!(!text.contains("ExcludedApplications"));
    }

    #[test]
    fn test_blank_address_fails_on_connect() {
        let descriptor = full_descriptor().with(DescriptorField::InterfaceAddress, "  ");
        assert_eq!(
            build(&descriptor, BuildMode::Connect),
            Err(ConfigError::MissingField(DescriptorField::InterfaceAddress))
        );

        // Previewing the same descriptor is fine
        let preview = build(&descriptor, BuildMode::Preview).unwrap();
        assert!(!preview.render(Dialect::WgQuick).contains("Address"));
    }

    #[test]
    fn test_blank_preshared_key_is_omitted() {
        let descriptor = full_descriptor().with(DescriptorField::PeerPresharedKey, "");
        let text = build(&descriptor, BuildMode::Connect)
            .unwrap()
            .render(Dialect::Full);
        assert!(text.contains("PublicKey = "));
        assert!(!text.contains("PresharedKey"));
    }

    #[test]
    fn test_preshared_key_emitted_when_present() {
        let psk = private_key();
        let descriptor = full_descriptor().with(DescriptorField::PeerPresharedKey, psk.clone());
        let text = build(&descriptor, BuildMode::Connect)
            .unwrap()
            .render(Dialect::WgQuick);
        assert!(text.contains(&format!("PresharedKey = {}", psk)));
    }

    #[test]
    fn test_blank_dns_is_omitted() {
        let descriptor = full_descriptor().with(DescriptorField::InterfaceDns, "");
        let text = build(&descriptor, BuildMode::Connect)
            .unwrap()
            .render(Dialect::WgQuick);
        assert!(!text.contains("DNS"));
    }

    #[test]
    fn test_no_peer_section_without_public_key() {
        let descriptor = ServerDescriptor::new()
            .with(DescriptorField::InterfaceAddress, "10.0.0.2/24")
            .with(DescriptorField::InterfacePrivateKey, private_key())
            .with(DescriptorField::PeerEndpoint, "vpn.example.com:51820");

        let config = build(&descriptor, BuildMode::Preview).unwrap();
        assert!(!config.has_peer());
        let text = config.render(Dialect::WgQuick);
        assert!(!text.contains("[Peer]"));
        assert!(!text.contains("Endpoint"));

        // Connecting without a peer is rejected
        assert_eq!(
            build(&descriptor, BuildMode::Connect),
            Err(ConfigError::MissingField(DescriptorField::PeerPublicKey))
        );
    }

    #[test]
    fn test_exclusions_always_applied() {
        let config = build(&ServerDescriptor::new(), BuildMode::Preview).unwrap();
        assert_eq!(
            config.excluded_applications(),
            EXCLUDED_APPLICATIONS
                .iter()
                .map(|a| a.to_string())
                .collect::<Vec<_>>()
                .as_slice()
        );

        let text = build(&full_descriptor(), BuildMode::Connect)
            .unwrap()
            .render(Dialect::Full);
        assert!(text.contains(&format!(
            "ExcludedApplications = {}",
            EXCLUDED_APPLICATIONS.join(", ")
        )));
    }

    #[test]
    fn test_build_is_deterministic() {
        let descriptor = full_descriptor();
        let a = build(&descriptor, BuildMode::Connect).unwrap();
        let b = build(&descriptor, BuildMode::Connect).unwrap();
        assert_eq!(a.render(Dialect::Full), b.render(Dialect::Full));
        assert_eq!(a.render(Dialect::WgQuick), b.render(Dialect::WgQuick));
    }

    #[test]
    fn test_render_then_parse_recovers_values() {
        let descriptor = full_descriptor();
        let text = build(&descriptor, BuildMode::Connect)
            .unwrap()
            .render(Dialect::Full);

        let parsed = TunnelConfig::parse(&text).unwrap().to_descriptor();
        for field in [
            DescriptorField::InterfaceAddress,
            DescriptorField::InterfaceDns,
            DescriptorField::PeerPublicKey,
            DescriptorField::PeerAllowedIps,
            DescriptorField::PeerEndpoint,
            DescriptorField::PeerPersistentKeepalive,
        ] {
            assert_eq!(parsed.get(field), descriptor.get(field), "field {}", field);
        }
    }

    #[test]
    fn test_invalid_values_rejected_on_connect() {
        let bad_key = full_descriptor().with(DescriptorField::PeerPublicKey, "not-a-key");
        assert_eq!(
            build(&bad_key, BuildMode::Connect),
            Err(ConfigError::InvalidKey {
                field: DescriptorField::PeerPublicKey
            })
        );

        let bad_endpoint = full_descriptor().with(DescriptorField::PeerEndpoint, "vpn.example.com");
        assert!(matches!(
            build(&bad_endpoint, BuildMode::Connect),
            Err(ConfigError::InvalidValue {
                field: DescriptorField::PeerEndpoint,
                ..
            })
        ));

        let bad_keepalive =
            full_descriptor().with(DescriptorField::PeerPersistentKeepalive, "soon");
        assert!(matches!(
            build(&bad_keepalive, BuildMode::Connect),
            Err(ConfigError::InvalidValue {
                field: DescriptorField::PeerPersistentKeepalive,
                ..
            })
        ));

        let bad_allowed = full_descriptor().with(DescriptorField::PeerAllowedIps, "0.0.0.0/0,,");
        assert!(build(&bad_allowed, BuildMode::Connect).is_err());
    }

    #[test]
    fn test_multiple_cidrs_and_ipv6_accepted() {
        let descriptor = full_descriptor()
            .with(DescriptorField::InterfaceAddress, "10.0.0.2/24, fd00::2/64")
            .with(
                DescriptorField::PeerAllowedIps,
                "192.168.136.0/24, 10.0.22.0/22, ::/0",
            )
            .with(DescriptorField::PeerEndpoint, "[2001:db8::1]:51820");
        assert!(build(&descriptor, BuildMode::Connect).is_ok());
    }

    #[test]
    fn test_parse_wg_quick_file() {
        let text = "\
# exported
[Interface]
PrivateKey = yAnz5TF+lXXJte14tji3zlMNq+hd2rYUIgJBgB3fBmk=
ListenPort = 51820
Address = 10.0.0.2/32
Address = fd00::2/128

[Peer]
PublicKey = xTIBA5rboUvnH4htodjb6e697QjLERt1NAB4mZqp8Dg=
AllowedIPs = 0.0.0.0/0
Endpoint = 192.95.5.69:51820
";
        let config = TunnelConfig::parse(text).unwrap();
        let descriptor = config.to_descriptor();
        assert_eq!(
            descriptor.get(DescriptorField::InterfaceAddress),
            Some("10.0.0.2/32, fd00::2/128")
        );
        assert_eq!(descriptor.get(DescriptorField::PeerPresharedKey), None);
        assert!(build(&descriptor, BuildMode::Connect).is_ok());
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            TunnelConfig::parse("PrivateKey = abc"),
            Err(ConfigError::Parse { line: 1, .. })
        ));
        assert!(matches!(
            TunnelConfig::parse("[Interface]\nnonsense"),
            Err(ConfigError::Parse { line: 2, .. })
        ));
        assert!(TunnelConfig::parse("[Peer]\nEndpoint = a:1\n").is_err());
        assert!(TunnelConfig::parse("[Peer]\nPublicKey = a\n[Peer]\nPublicKey = b\n").is_err());
    }
}
