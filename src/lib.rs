//! PointGuard - point-to-point WireGuard tunnel engine
//!
//! A single-peer WireGuard implementation: one local identity, one remote
//! peer, one UDP socket and one TUN interface.
//!
//! # Features
//!
//! - Noise IKpsk2 handshake with cookie (MAC2) protection under load
//! - Parallel encryption and decryption with in-order delivery
//! - Rekey, keepalive and key-erasure timers
//! - Endpoint roaming and socket rebinding after network failures
//! - Line-oriented `key=value` control surface
//! - Status events for an embedding host
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use pointguard::tunnel::{SocketBinder, TunDevice};
//! use pointguard::{Device, Session, WireGuardConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = WireGuardConfig::from_file("wg0.conf")?;
//!     let tun = TunDevice::create("10.0.0.2".parse()?, 24, config.mtu())?;
//!     let binder = SocketBinder::new(config.interface.listen_port.unwrap_or(0));
//!
//!     let device = Device::new(Arc::new(tun), Arc::new(binder), Arc::new(Session::default()));
//!     let error = device.set_operation(&config.to_operations()).await;
//!     anyhow::ensure!(error.is_empty(), error);
//!
//!     device.up().await?;
//!     device.wait().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod crypto;
pub mod device;
pub mod error;
pub mod protocol;
pub mod tunnel;

pub use config::{LaunchConfig, WireGuardConfig};
pub use device::{Device, Event, Session, Status};
pub use error::PointGuardError;
