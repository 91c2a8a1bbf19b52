//! In-process tunnel adapters
//!
//! `tun_pair` gives a device a TUN interface driven by a test handle, and
//! `MemoryHub` is a tiny datagram switch connecting any number of bound
//! addresses. The hub can also be tapped and injected into, which is how
//! captured packets are replayed.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{TunIo, UdpBinder, UdpConn};

/// TUN side seen by the device
pub struct MemoryTun {
    mtu: usize,
    incoming: tokio::sync::Mutex<mpsc::Receiver<Vec<u8>>>,
    written: mpsc::UnboundedSender<Vec<u8>>,
}

/// Host side of a [`MemoryTun`]
pub struct TunHandle {
    inject: mpsc::Sender<Vec<u8>>,
    written: mpsc::UnboundedReceiver<Vec<u8>>,
}

pub fn tun_pair(mtu: usize) -> (MemoryTun, TunHandle) {
    let (inject, incoming) = mpsc::channel(64);
    let (written_tx, written) = mpsc::unbounded_channel();
    (
        MemoryTun {
            mtu,
            incoming: tokio::sync::Mutex::new(incoming),
            written: written_tx,
        },
        TunHandle { inject, written },
    )
}

impl TunHandle {
    /// Hand an IP packet to the device as if the OS routed it into the tunnel
    pub async fn send(&self, packet: Vec<u8>) -> bool {
        self.inject.send(packet).await.is_ok()
    }

    /// Next packet the device wrote to the interface
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.written.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Vec<u8>> {
        self.written.try_recv().ok()
    }
}

#[async_trait]
impl TunIo for MemoryTun {
    async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let packet = self
            .incoming
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| io::Error::from(io::ErrorKind::BrokenPipe))?;
        let len = packet.len().min(buf.len());
        buf[..len].copy_from_slice(&packet[..len]);
        Ok(len)
    }

    async fn write(&self, packet: &[u8]) -> io::Result<usize> {
        self.written
            .send(packet.to_vec())
            .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))?;
        Ok(packet.len())
    }

    fn mtu(&self) -> usize {
        self.mtu
    }
}

/// A datagram seen crossing the hub
#[derive(Debug, Clone)]
pub struct Datagram {
    pub from: SocketAddr,
    pub to: SocketAddr,
    pub payload: Vec<u8>,
}

type Inbox = mpsc::UnboundedSender<(Vec<u8>, SocketAddr)>;

#[derive(Default)]
struct Hub {
    sockets: Mutex<HashMap<SocketAddr, Inbox>>,
    taps: Mutex<Vec<mpsc::UnboundedSender<Datagram>>>,
}

#[derive(Clone, Default)]
pub struct MemoryHub {
    inner: Arc<Hub>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binder whose sockets all live at `addr`
    pub fn binder(&self, addr: SocketAddr) -> MemoryBinder {
        MemoryBinder {
            hub: self.clone(),
            addr,
        }
    }

    /// Copy of every datagram sent from now on
    pub fn tap(&self) -> mpsc::UnboundedReceiver<Datagram> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.taps.lock().push(tx);
        rx
    }

    /// Deliver a datagram that no bound socket sent; false if nobody is bound at `to`
    pub fn inject(&self, from: SocketAddr, to: SocketAddr, payload: Vec<u8>) -> bool {
        self.deliver(from, to, payload)
    }

    fn deliver(&self, from: SocketAddr, to: SocketAddr, payload: Vec<u8>) -> bool {
        self.inner.taps.lock().retain(|tap| {
            tap.send(Datagram {
                from,
                to,
                payload: payload.clone(),
            })
            .is_ok()
        });

        match self.inner.sockets.lock().get(&to) {
            Some(inbox) => inbox.send((payload, from)).is_ok(),
            None => false,
        }
    }
}

pub struct MemoryBinder {
    hub: MemoryHub,
    addr: SocketAddr,
}

#[async_trait]
impl UdpBinder for MemoryBinder {
    async fn bind(&self, _remote: Option<SocketAddr>) -> io::Result<Arc<dyn UdpConn>> {
        let (tx, rx) = mpsc::unbounded_channel();
        // Replacing the inbox closes the previous socket's receive side
        self.hub.inner.sockets.lock().insert(self.addr, tx);
        Ok(Arc::new(MemoryConn {
            hub: self.hub.clone(),
            addr: self.addr,
            inbox: tokio::sync::Mutex::new(rx),
        }))
    }
}

pub struct MemoryConn {
    hub: MemoryHub,
    addr: SocketAddr,
    inbox: tokio::sync::Mutex<mpsc::UnboundedReceiver<(Vec<u8>, SocketAddr)>>,
}

#[async_trait]
impl UdpConn for MemoryConn {
    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<()> {
        // Unroutable datagrams vanish, like on a real network
        self.hub.deliver(self.addr, target, buf.to_vec());
        Ok(())
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        let (payload, from) = self
            .inbox
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| io::Error::from(io::ErrorKind::ConnectionAborted))?;
        let len = payload.len().min(buf.len());
        buf[..len].copy_from_slice(&payload[..len]);
        Ok((len, from))
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_hub_delivers_and_taps() {
        let hub = MemoryHub::new();
        let a: SocketAddr = "10.0.0.1:1000".parse().unwrap();
        let b: SocketAddr = "10.0.0.2:2000".parse().unwrap();
        let mut tap = hub.tap();

        let conn_a = hub.binder(a).bind(None).await.unwrap();
        let conn_b = hub.binder(b).bind(Some(a)).await.unwrap();

        conn_a.send_to(b"hi", b).await.unwrap();
        let mut buf = [0u8; 8];
        let (n, from) = conn_b.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hi");
        assert_eq!(from, a);

        let seen = tap.recv().await.unwrap();
        assert_eq!((seen.from, seen.to), (a, b));
        assert_eq!(seen.payload, b"hi");
    }

    #[tokio::test]
    async fn test_rebind_closes_old_socket() {
        let hub = MemoryHub::new();
        let addr: SocketAddr = "10.0.0.1:1000".parse().unwrap();
        let binder = hub.binder(addr);

        let old = binder.bind(None).await.unwrap();
        let new = binder.bind(None).await.unwrap();

        let mut buf = [0u8; 8];
        assert!(old.recv_from(&mut buf).await.is_err());

        assert!(hub.inject("10.9.9.9:9".parse().unwrap(), addr, vec![1, 2]));
        let (n, _) = new.recv_from(&mut buf).await.unwrap();
        assert_eq!(n, 2);
    }

    #[tokio::test]
    async fn test_tun_pair() {
        let (tun, mut handle) = tun_pair(1420);
        assert!(handle.send(vec![0x45, 0, 0, 20]).await);

        let mut buf = [0u8; 64];
        let n = tun.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], &[0x45, 0, 0, 20]);

        tun.write(&[1, 2, 3]).await.unwrap();
        assert_eq!(handle.recv().await.unwrap(), vec![1, 2, 3]);
        assert_eq!(tun.mtu(), 1420);
    }
}
