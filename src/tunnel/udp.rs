//! UDP sockets via tokio, built with socket2 for reuse and fwmark

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

use super::{RawDescriptor, UdpBinder, UdpConn};

/// Binds real sockets on `listen_port`.
///
/// With port 0 the first bind picks one and every rebind reuses it, so the
/// peer keeps reaching us across socket swaps.
#[derive(Debug, Default)]
pub struct SocketBinder {
    listen_port: AtomicU16,
    fwmark: Option<u32>,
}

impl SocketBinder {
    pub fn new(listen_port: u16) -> Self {
        Self {
            listen_port: AtomicU16::new(listen_port),
            fwmark: None,
        }
    }

    pub fn listen_port(&self) -> u16 {
        self.listen_port.load(Ordering::Acquire)
    }

    /// Mark outgoing packets for policy routing (Linux only)
    pub fn with_fwmark(mut self, fwmark: Option<u32>) -> Self {
        self.fwmark = fwmark;
        self
    }

    fn open(&self, local: SocketAddr) -> io::Result<Socket> {
        let socket = Socket::new(Domain::for_address(local), Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_nonblocking(true)?;
        // The previous socket may still be draining on the same port
        socket.set_reuse_address(true)?;

        #[cfg(target_os = "linux")]
        if let Some(mark) = self.fwmark {
            socket.set_mark(mark)?;
        }
        #[cfg(not(target_os = "linux"))]
        if self.fwmark.is_some() {
            tracing::debug!("fwmark is not supported on this platform, ignoring");
        }

        socket.bind(&local.into())?;
        Ok(socket)
    }
}

#[async_trait]
impl UdpBinder for SocketBinder {
    async fn bind(&self, remote: Option<SocketAddr>) -> io::Result<Arc<dyn UdpConn>> {
        let port = self.listen_port();
        let local: SocketAddr = match remote {
            Some(SocketAddr::V6(_)) => (Ipv6Addr::UNSPECIFIED, port).into(),
            _ => (Ipv4Addr::UNSPECIFIED, port).into(),
        };

        let socket = self.open(local)?;
        if let Some(remote) = remote {
            socket.connect(&remote.into())?;
        }

        let conn = SocketConn {
            socket: UdpSocket::from_std(socket.into())?,
            connected: remote,
        };
        let bound = conn.socket.local_addr()?;
        if port == 0 {
            self.listen_port.store(bound.port(), Ordering::Release);
        }
        tracing::debug!("Opened UDP socket {} (remote: {:?})", bound, remote);
        Ok(Arc::new(conn))
    }
}

/// A tokio UDP socket, connected when the peer endpoint is known
pub struct SocketConn {
    socket: UdpSocket,
    connected: Option<SocketAddr>,
}

#[async_trait]
impl UdpConn for SocketConn {
    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<()> {
        match self.connected {
            Some(_) => self.socket.send(buf).await?,
            None => self.socket.send_to(buf, target).await?,
        };
        Ok(())
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.socket.recv_from(buf).await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    #[cfg(unix)]
    fn descriptor(&self) -> Option<RawDescriptor> {
        use std::os::fd::AsRawFd;
        Some(self.socket.as_raw_fd())
    }

    #[cfg(windows)]
    fn descriptor(&self) -> Option<RawDescriptor> {
        use std::os::windows::io::AsRawSocket;
        Some(self.socket.as_raw_socket())
    }
}
