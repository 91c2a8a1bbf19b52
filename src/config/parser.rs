//! WireGuard configuration file parser
//!
//! Parses `.conf` files with one [Interface] section and at most one [Peer]
//! section, the shape of a point-to-point tunnel.

use std::net::SocketAddr;
use std::path::Path;

use ipnet::{IpNet, Ipv4Net};

use crate::crypto::{PrivateKey, PublicKey, SymmetricKey};
use crate::error::ConfigError;

/// Default tunnel MTU when the file does not set one
pub const DEFAULT_MTU: u16 = 1420;

/// Complete tunnel configuration
#[derive(Debug, Clone)]
pub struct WireGuardConfig {
    /// Interface configuration (our side)
    pub interface: InterfaceConfig,
    /// The remote end, if the file names one
    pub peer: Option<PeerConfig>,
}

/// Interface (local) configuration
#[derive(Debug, Clone)]
pub struct InterfaceConfig {
    pub private_key: PrivateKey,
    /// Our tunnel addresses with prefix
    pub address: Vec<Ipv4Net>,
    /// Listen port (optional, for servers)
    pub listen_port: Option<u16>,
    /// MTU (optional, default 1420)
    pub mtu: Option<u16>,
    /// Socket mark for policy routing (Linux only)
    pub fwmark: Option<u32>,
}

/// Peer configuration
#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub public_key: PublicKey,
    /// Peer's endpoint (IP:port)
    pub endpoint: Option<SocketAddr>,
    /// Allowed IP ranges for this peer
    pub allowed_ips: Vec<IpNet>,
    /// Keepalive interval in seconds (optional)
    pub persistent_keepalive: Option<u16>,
}

impl WireGuardConfig {
    /// Parse a configuration from a file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = read_config(path.as_ref())?;
        Self::parse(&content)
    }

    /// Parse a configuration from a string
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let mut interface: Option<InterfaceBuilder> = None;
        let mut peer: Option<PeerBuilder> = None;
        let mut current_section: Option<Section> = None;

        for (line_num, line) in content.lines().enumerate() {
            let line_num = line_num + 1;
            let line = line.split('#').next().unwrap_or_default().trim();

            if line.is_empty() {
                continue;
            }

            if line.eq_ignore_ascii_case("[interface]") {
                if interface.is_some() {
                    return Err(parse_error(line_num, "Duplicate [Interface] section"));
                }
                interface = Some(InterfaceBuilder::default());
                current_section = Some(Section::Interface);
                continue;
            } else if line.eq_ignore_ascii_case("[peer]") {
                if peer.is_some() {
                    return Err(parse_error(
                        line_num,
                        "Only one [Peer] section is supported",
                    ));
                }
                peer = Some(PeerBuilder::default());
                current_section = Some(Section::Peer);
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                return Err(parse_error(
                    line_num,
                    format!("Expected 'key = value', got: {}", line),
                ));
            };

            let key = key.trim().to_lowercase();
            let value = value.trim();

            match current_section {
                Some(Section::Interface) => {
                    let Some(iface) = interface.as_mut() else {
                        return Err(parse_error(line_num, "Value outside of [Interface]"));
                    };

                    match key.as_str() {
                        "privatekey" => {
                            iface.private_key = Some(PrivateKey::parse(value, "PrivateKey")?);
                        }
                        "address" => {
                            for net in parse_list::<IpNet>(value)? {
                                match net {
                                    IpNet::V4(v4) => iface.address.push(v4),
                                    IpNet::V6(v6) => {
                                        tracing::debug!("Ignoring IPv6 interface address {}", v6)
                                    }
                                }
                            }
                        }
                        "listenport" => {
                            iface.listen_port = Some(parse_number(line_num, "ListenPort", value)?);
                        }
                        "mtu" => {
                            iface.mtu = Some(parse_number(line_num, "MTU", value)?);
                        }
                        "fwmark" => {
                            iface.fwmark = parse_fwmark(value).ok_or_else(|| {
                                parse_error(line_num, format!("Invalid FwMark: {}", value))
                            })?;
                        }
                        _ => {
                            // Unknown key, ignore (forward compatibility)
                            tracing::debug!("Unknown interface key: {}", key);
                        }
                    }
                }
                Some(Section::Peer) => {
                    let Some(peer) = peer.as_mut() else {
                        return Err(parse_error(line_num, "Value outside of [Peer]"));
                    };

                    match key.as_str() {
                        "publickey" => {
                            peer.public_key = Some(PublicKey::parse(value, "PublicKey")?);
                        }
                        "endpoint" => {
                            peer.endpoint = Some(parse_endpoint(value)?);
                        }
                        "allowedips" => {
                            peer.allowed_ips.extend(parse_list::<IpNet>(value)?);
                        }
                        "persistentkeepalive" => {
                            peer.persistent_keepalive = if value.eq_ignore_ascii_case("off") {
                                None
                            } else {
                                Some(parse_number(line_num, "PersistentKeepalive", value)?)
                            };
                        }
                        "presharedkey" => {
                            let psk = SymmetricKey::parse(value, "PresharedKey")?;
                            if !psk.is_zero() {
                                return Err(parse_error(
                                    line_num,
                                    "PresharedKey is not supported",
                                ));
                            }
                        }
                        _ => {
                            tracing::debug!("Unknown peer key: {}", key);
                        }
                    }
                }
                None => {
                    return Err(parse_error(
                        line_num,
                        "Configuration value outside of any section",
                    ));
                }
            }
        }

        let interface = interface
            .ok_or(ConfigError::MissingField {
                field: "[Interface] section".to_string(),
            })?
            .build()?;
        let peer = peer.map(PeerBuilder::build).transpose()?;

        Ok(WireGuardConfig { interface, peer })
    }

    /// Our public key derived from the private key
    pub fn public_key(&self) -> PublicKey {
        self.interface.private_key.public_key()
    }

    pub fn mtu(&self) -> u16 {
        self.interface.mtu.unwrap_or(DEFAULT_MTU)
    }

    /// Control-surface lines that apply this configuration to a device
    pub fn to_operations(&self) -> Vec<String> {
        let mut lines = vec![format!(
            "own_private={}",
            self.interface.private_key.to_base64()
        )];

        if let Some(peer) = &self.peer {
            lines.push(format!("their_public={}", peer.public_key.to_base64()));
            if let Some(endpoint) = peer.endpoint {
                lines.push(format!("endpoint={}", endpoint));
            }
            for net in &peer.allowed_ips {
                lines.push(format!("allowed_ip={}", net));
            }
            if let Some(keepalive) = peer.persistent_keepalive {
                lines.push(format!("persistent_keepalive_interval={}", keepalive));
            }
        }
        lines
    }
}

/// Read a config file, mapping a missing file to its own error
pub(super) fn read_config(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            ConfigError::FileNotFound {
                path: path.display().to_string(),
            }
        } else {
            ConfigError::Io(e)
        }
    })
}

/// Section type during parsing
#[derive(Clone, Copy)]
enum Section {
    Interface,
    Peer,
}

#[derive(Default)]
struct InterfaceBuilder {
    private_key: Option<PrivateKey>,
    address: Vec<Ipv4Net>,
    listen_port: Option<u16>,
    mtu: Option<u16>,
    fwmark: Option<u32>,
}

impl InterfaceBuilder {
    fn build(self) -> Result<InterfaceConfig, ConfigError> {
        let private_key = self
            .private_key
            .filter(|key| !key.is_zero())
            .ok_or(ConfigError::MissingField {
                field: "PrivateKey".to_string(),
            })?;

        Ok(InterfaceConfig {
            private_key,
            address: self.address,
            listen_port: self.listen_port,
            mtu: self.mtu,
            fwmark: self.fwmark,
        })
    }
}

#[derive(Default)]
struct PeerBuilder {
    public_key: Option<PublicKey>,
    endpoint: Option<SocketAddr>,
    allowed_ips: Vec<IpNet>,
    persistent_keepalive: Option<u16>,
}

impl PeerBuilder {
    fn build(self) -> Result<PeerConfig, ConfigError> {
        let public_key = self.public_key.ok_or(ConfigError::MissingField {
            field: "PublicKey in [Peer]".to_string(),
        })?;

        Ok(PeerConfig {
            public_key,
            endpoint: self.endpoint,
            allowed_ips: self.allowed_ips,
            persistent_keepalive: self.persistent_keepalive,
        })
    }
}

fn parse_error(line: usize, message: impl Into<String>) -> ConfigError {
    ConfigError::ParseError {
        line,
        message: message.into(),
    }
}

fn parse_number<T: std::str::FromStr>(
    line: usize,
    field: &str,
    value: &str,
) -> Result<T, ConfigError> {
    value
        .parse()
        .map_err(|_| parse_error(line, format!("Invalid {}: {}", field, value)))
}

/// Comma-separated CIDR list
fn parse_list<T: std::str::FromStr>(value: &str) -> Result<Vec<T>, ConfigError> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| {
            item.parse().map_err(|_| ConfigError::InvalidCidr {
                value: item.to_string(),
            })
        })
        .collect()
}

/// `off`, decimal, or `0x`-prefixed hex; `Some(None)` means no mark
fn parse_fwmark(value: &str) -> Option<Option<u32>> {
    if value.eq_ignore_ascii_case("off") {
        return Some(None);
    }
    let mark = match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16).ok()?,
        None => value.parse().ok()?,
    };
    Some((mark != 0).then_some(mark))
}

/// Parse an endpoint (ip:port)
fn parse_endpoint(value: &str) -> Result<SocketAddr, ConfigError> {
    // Hostnames are not resolved
    value.parse().map_err(|_| ConfigError::InvalidAddress {
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_CONFIG: &str = r#"
[Interface]
PrivateKey = UOvtcWdILFwjb1UnsnK+a9lcqYvNTmtPv+fvqIVOz3w=
Address = 10.0.0.2/24
ListenPort = 51820
FwMark = 0x1234

[Peer]
PublicKey = YgkBjKXER5YarD8STsvMFURw/5nhCLIFOJ5uKWrrMW4=
AllowedIPs = 10.0.0.0/24, 0.0.0.0/0
Endpoint = 13.239.46.151:51820  # office
PersistentKeepalive = 25
"#;

    #[test]
    fn test_parse_config() {
        let config = WireGuardConfig::parse(TEST_CONFIG).unwrap();

        assert_eq!(config.interface.address.len(), 1);
        assert_eq!(config.interface.address[0].to_string(), "10.0.0.2/24");
        assert_eq!(config.interface.listen_port, Some(51820));
        assert_eq!(config.interface.fwmark, Some(0x1234));
        assert_eq!(config.mtu(), DEFAULT_MTU);

        let peer = config.peer.as_ref().unwrap();
        assert_eq!(peer.endpoint.unwrap().to_string(), "13.239.46.151:51820");
        assert_eq!(peer.persistent_keepalive, Some(25));
        assert_eq!(peer.allowed_ips.len(), 2);
    }

    #[test]
    fn test_to_operations() {
        let config = WireGuardConfig::parse(TEST_CONFIG).unwrap();
        let lines = config.to_operations();

        assert_eq!(
            lines[0],
            "own_private=UOvtcWdILFwjb1UnsnK+a9lcqYvNTmtPv+fvqIVOz3w="
        );
        assert_eq!(
            &lines[1..],
            &[
                "their_public=YgkBjKXER5YarD8STsvMFURw/5nhCLIFOJ5uKWrrMW4=",
                "endpoint=13.239.46.151:51820",
                "allowed_ip=10.0.0.0/24",
                "allowed_ip=0.0.0.0/0",
                "persistent_keepalive_interval=25",
            ]
        );
    }

    #[test]
    fn test_interface_only() {
        let config = "[Interface]\nPrivateKey = UOvtcWdILFwjb1UnsnK+a9lcqYvNTmtPv+fvqIVOz3w=\nMTU = 1380\n";
        let config = WireGuardConfig::parse(config).unwrap();
        assert!(config.peer.is_none());
        assert_eq!(config.mtu(), 1380);
        assert_eq!(config.to_operations().len(), 1);
    }

    #[test]
    fn test_second_peer_rejected() {
        let config = format!(
            "{}\n[Peer]\nPublicKey = YgkBjKXER5YarD8STsvMFURw/5nhCLIFOJ5uKWrrMW4=\n",
            TEST_CONFIG
        );
        assert!(matches!(
            WireGuardConfig::parse(&config),
            Err(ConfigError::ParseError { .. })
        ));
    }

    #[test]
    fn test_fwmark_forms() {
        assert_eq!(parse_fwmark("off"), Some(None));
        assert_eq!(parse_fwmark("0"), Some(None));
        assert_eq!(parse_fwmark("51820"), Some(Some(51820)));
        assert_eq!(parse_fwmark("0xca6c"), Some(Some(0xca6c)));
        assert_eq!(parse_fwmark("mark"), None);
    }

    #[test]
    fn test_invalid_key() {
        let config = "[Interface]\nPrivateKey = invalid-base64!\n";
        assert!(matches!(
            WireGuardConfig::parse(config),
            Err(ConfigError::InvalidKey { .. })
        ));
    }

    #[test]
    fn test_invalid_cidr() {
        let config = "[Interface]\nPrivateKey = UOvtcWdILFwjb1UnsnK+a9lcqYvNTmtPv+fvqIVOz3w=\nAddress = 10.0.0.300/24\n";
        assert!(matches!(
            WireGuardConfig::parse(config),
            Err(ConfigError::InvalidCidr { .. })
        ));
    }

    #[test]
    fn test_missing_interface() {
        let config = "[Peer]\nPublicKey = YgkBjKXER5YarD8STsvMFURw/5nhCLIFOJ5uKWrrMW4=\n";
        assert!(WireGuardConfig::parse(config).is_err());
    }

    #[test]
    fn test_missing_private_key() {
        let config = "[Interface]\nAddress = 10.0.0.2/24\n";
        assert!(matches!(
            WireGuardConfig::parse(config),
            Err(ConfigError::MissingField { .. })
        ));
    }

    #[test]
    fn test_preshared_key_rejected() {
        let config = format!(
            "{}PresharedKey = YgkBjKXER5YarD8STsvMFURw/5nhCLIFOJ5uKWrrMW4=\n",
            TEST_CONFIG
        );
        assert!(WireGuardConfig::parse(&config).is_err());
    }
}
