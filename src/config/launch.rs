//! JSON launch document
//!
//! The embedding host hands the engine a flat JSON object instead of a
//! `.conf` file:
//!
//! ```json
//! {
//!   "own_private": "<base64>",
//!   "own_public": "<base64>",
//!   "their_public": "<base64>",
//!   "endpoint": "192.0.2.1:51820",
//!   "allow_ip": "10.0.0.2",
//!   "log_path": "/var/log/pointguard.log",
//!   "interval_time": 50
//! }
//! ```
//!
//! `allow_ip` is the tunnel address assigned to this client, not a routing
//! rule. Everything is routed through the peer.

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use ipnet::{IpNet, Ipv4Net};
use serde::{Deserialize, Serialize};

use super::parser::read_config;
use crate::crypto::{PrivateKey, PublicKey};
use crate::error::ConfigError;
use crate::protocol::constants::DEFAULT_LIVENESS_INTERVAL;

/// Keepalive interval applied to every launch-document peer
pub const LAUNCH_KEEPALIVE_SECS: u16 = 15;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LaunchConfig {
    pub own_private: String,
    pub own_public: String,
    pub their_public: String,
    pub endpoint: String,
    pub allow_ip: String,
    pub log_path: Option<PathBuf>,
    /// Seconds without traffic before reporting the tunnel unresponsive
    pub interval_time: i64,
}

impl LaunchConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = read_config(path.as_ref())?;
        Self::from_json(&content)
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("own_private", &self.own_private),
            ("their_public", &self.their_public),
        ] {
            if value.is_empty() {
                return Err(ConfigError::MissingField {
                    field: field.to_string(),
                });
            }
        }
        PrivateKey::parse(&self.own_private, "own_private")?;
        PublicKey::parse(&self.their_public, "their_public")?;
        if !self.own_public.is_empty() {
            PublicKey::parse(&self.own_public, "own_public")?;
        }
        self.endpoint()?;
        self.tunnel_addresses()?;
        Ok(())
    }

    pub fn endpoint(&self) -> Result<Option<SocketAddr>, ConfigError> {
        if self.endpoint.is_empty() {
            return Ok(None);
        }
        self.endpoint
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidAddress {
                value: self.endpoint.clone(),
            })
    }

    /// Addresses from `allow_ip`; bare addresses get a /32
    pub fn tunnel_addresses(&self) -> Result<Vec<Ipv4Net>, ConfigError> {
        let mut addresses = Vec::new();
        for item in self.allow_ip.split(',').map(str::trim) {
            if item.is_empty() {
                continue;
            }
            let net = match item.parse::<IpAddr>() {
                Ok(addr) => IpNet::from(addr),
                Err(_) => item.parse().map_err(|_| ConfigError::InvalidCidr {
                    value: item.to_string(),
                })?,
            };
            if let IpNet::V4(net) = net {
                addresses.push(net);
            }
        }
        Ok(addresses)
    }

    /// First tunnel address, for creating the TUN device
    pub fn tunnel_address(&self) -> Option<Ipv4Net> {
        self.tunnel_addresses().ok()?.into_iter().next()
    }

    /// Liveness interval, falling back to the default when unset
    pub fn liveness_interval(&self) -> Duration {
        u64::try_from(self.interval_time)
            .ok()
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_LIVENESS_INTERVAL)
    }

    /// Control-surface lines; all traffic goes through the peer
    pub fn to_operations(&self) -> Vec<String> {
        let mut lines = vec![format!("own_private={}", self.own_private)];
        if !self.own_public.is_empty() {
            lines.push(format!("own_public={}", self.own_public));
        }
        lines.push(format!("their_public={}", self.their_public));
        if !self.endpoint.is_empty() {
            lines.push(format!("endpoint={}", self.endpoint));
        }
        lines.push("allowed_ip=0.0.0.0/0".to_string());
        lines.push(format!(
            "persistent_keepalive_interval={}",
            LAUNCH_KEEPALIVE_SECS
        ));
        lines
    }
}
