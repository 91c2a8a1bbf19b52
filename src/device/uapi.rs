//! Line-oriented `key=value` control surface
//!
//! A batch is applied in order and stops at the first failing line. The
//! result is an empty string on success, otherwise a message naming the key.

use std::net::SocketAddr;
use std::sync::Arc;

use ipnet::IpNet;

use super::peer::Peer;
use super::Device;
use crate::crypto::{PrivateKey, PublicKey};
use crate::error::ConfigError;

impl Device {
    pub async fn set_operation<S: AsRef<str>>(self: &Arc<Self>, lines: &[S]) -> String {
        for line in lines {
            let line = line.as_ref().trim();
            if line.is_empty() {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                return format!("Failed to parse line: {}", line);
            };
            let (key, value) = (key.trim(), value.trim());

            if let Err(e) = self.apply(key, value).await {
                return match e {
                    ConfigError::UnknownKey { .. } => e.to_string(),
                    e => format!("Failed to set {}: {}", key, e),
                };
            }
        }
        String::new()
    }

    async fn apply(self: &Arc<Self>, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "own_private" => {
                self.set_private_key(PrivateKey::parse(value, key)?);
            }
            "own_public" => {
                let public = PublicKey::parse(value, key)?;
                let derived = self.public_key();
                if !derived.is_zero() && derived != public {
                    return Err(ConfigError::InvalidValue {
                        key: key.to_string(),
                        value: "does not match own_private".to_string(),
                    });
                }
            }
            "their_public" => {
                let public = PublicKey::parse(value, key)?;
                if public == self.public_key() {
                    return Err(ConfigError::InvalidValue {
                        key: key.to_string(),
                        value: "peer key equals our own".to_string(),
                    });
                }
                let existing = self.peer().filter(|peer| *peer.public_key() == public);
                if existing.is_none() {
                    self.install_peer(public);
                }
            }
            "endpoint" => {
                let peer = self.require_peer(key)?;
                let endpoint: SocketAddr = value.parse().map_err(|_| ConfigError::InvalidAddress {
                    value: value.to_string(),
                })?;
                peer.set_endpoint(endpoint);
                if self.is_up() {
                    self.rebind(Some(endpoint))
                        .await
                        .map_err(|e| ConfigError::InvalidValue {
                            key: key.to_string(),
                            value: e.to_string(),
                        })?;
                }
            }
            "allowed_ip" => {
                let peer = self.require_peer(key)?;
                let net: IpNet = value.parse().map_err(|_| ConfigError::InvalidCidr {
                    value: value.to_string(),
                })?;
                self.routing.insert(net, peer);
            }
            "persistent_keepalive_interval" => {
                let peer = self.require_peer(key)?;
                let seconds: u16 = value.parse().map_err(|_| ConfigError::InvalidValue {
                    key: key.to_string(),
                    value: value.to_string(),
                })?;
                let old = peer.set_persistent_keepalive(seconds);
                if old == 0 && seconds != 0 && self.is_up() {
                    peer.send_keepalive();
                }
            }
            _ => {
                return Err(ConfigError::UnknownKey {
                    key: key.to_string(),
                })
            }
        }
        Ok(())
    }

    fn require_peer(&self, key: &str) -> Result<Arc<Peer>, ConfigError> {
        self.peer().ok_or_else(|| ConfigError::NoPeer {
            key: key.to_string(),
        })
    }
}
