//! Collaborators at the edge of the engine
//!
//! The device only sees the traits defined here: a TUN-like packet source and
//! sink, and a UDP binder that can (re)open the datagram socket, optionally
//! connected to the peer. Platform adapters live in `tun` (tun-rs) and `udp`
//! (tokio + socket2); `memory` wires devices together in-process.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;

pub mod memory;
mod tun;
mod udp;

pub use tun::TunDevice;
pub use udp::{SocketBinder, SocketConn};

/// OS handle of a bound socket, handed to hosts that need it
#[cfg(unix)]
pub type RawDescriptor = std::os::fd::RawFd;
#[cfg(windows)]
pub type RawDescriptor = std::os::windows::io::RawSocket;

/// Virtual network interface carrying raw IP packets
#[async_trait]
pub trait TunIo: Send + Sync {
    /// Read one IP packet, platform framing already stripped
    async fn read(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write one IP packet
    async fn write(&self, packet: &[u8]) -> io::Result<usize>;

    fn mtu(&self) -> usize;
}

/// A bound UDP socket
#[async_trait]
pub trait UdpConn: Send + Sync {
    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<()>;

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;

    fn local_addr(&self) -> io::Result<SocketAddr>;

    /// Raw handle, where the platform adapter exposes one
    fn descriptor(&self) -> Option<RawDescriptor> {
        None
    }
}

/// Opens UDP sockets for the device.
///
/// `remote` is the peer endpoint when one is configured; adapters may connect
/// the socket to it. `None` asks for a listening socket.
#[async_trait]
pub trait UdpBinder: Send + Sync {
    async fn bind(&self, remote: Option<SocketAddr>) -> io::Result<Arc<dyn UdpConn>>;
}
