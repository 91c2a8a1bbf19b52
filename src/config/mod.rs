//! Configuration loading
//!
//! Two sources feed the same control surface: standard `.conf` files and the
//! JSON launch document used by embedding hosts. Both turn into a list of
//! `key=value` lines for [`Device::set_operation`](crate::device::Device::set_operation).

mod launch;
mod parser;

pub use launch::{LaunchConfig, LAUNCH_KEEPALIVE_SECS};
pub use parser::{InterfaceConfig, PeerConfig, WireGuardConfig, DEFAULT_MTU};
