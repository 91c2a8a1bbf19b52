//! The remote peer: handshake, key-pairs, timers and its ordered queues

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;

use super::queue::{DropQueue, Element};
use super::receive::InboundPacket;
use super::send::OutboundPacket;
use super::signal::Signal;
use super::timers::Timers;
use crate::crypto::{PrivateKey, PublicKey};
use crate::protocol::constants::{
    QUEUE_INBOUND_SIZE, QUEUE_OUTBOUND_SIZE, REJECT_AFTER_MESSAGES, REKEY_AFTER_MESSAGES,
    REKEY_AFTER_TIME_CHANGE, REKEY_AFTER_TIME_RECEIVING,
};
use crate::protocol::{CookieGenerator, Handshake, KeyPair, KeyPairs};

#[derive(Default)]
pub(crate) struct PeerSignals {
    pub handshake_begin: Signal,
    pub handshake_completed: Signal,
    pub handshake_reset: Signal,
    pub new_keypair: Signal,
    pub flush_nonce_queue: Signal,
}

pub(crate) struct PeerQueues {
    /// Plaintext waiting for a usable key-pair
    pub nonce: DropQueue<Vec<u8>>,
    pub outbound: DropQueue<Arc<Element<OutboundPacket>>>,
    pub inbound: DropQueue<Arc<Element<InboundPacket>>>,
}

/// Snapshot of a peer for status reporting
#[derive(Debug, Clone)]
pub struct PeerStats {
    pub public_key: PublicKey,
    pub endpoint: Option<SocketAddr>,
    pub last_handshake: Option<SystemTime>,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub persistent_keepalive: u16,
}

/// Lock order: `keypairs` before `handshake`.
pub struct Peer {
    public_key: PublicKey,
    pub(crate) handshake: Mutex<Handshake>,
    pub(crate) keypairs: Mutex<KeyPairs>,
    pub(crate) cookie: Mutex<CookieGenerator>,
    endpoint: RwLock<Option<SocketAddr>>,
    persistent_keepalive: AtomicU32,
    pub(crate) timers: Timers,
    pub(crate) signals: PeerSignals,
    pub(crate) queues: PeerQueues,
    stop: watch::Sender<bool>,
    rx_bytes: AtomicU64,
    tx_bytes: AtomicU64,
    last_handshake: Mutex<Option<SystemTime>>,
}

impl Peer {
    pub fn new(public_key: PublicKey, local_private: &PrivateKey) -> Self {
        Self {
            public_key,
            handshake: Mutex::new(Handshake::new(public_key, local_private)),
            keypairs: Mutex::new(KeyPairs::default()),
            cookie: Mutex::new(CookieGenerator::new(&public_key)),
            endpoint: RwLock::new(None),
            persistent_keepalive: AtomicU32::new(0),
            timers: Timers::new(),
            signals: PeerSignals::default(),
            queues: PeerQueues {
                nonce: DropQueue::new(QUEUE_OUTBOUND_SIZE),
                outbound: DropQueue::new(QUEUE_OUTBOUND_SIZE),
                inbound: DropQueue::new(QUEUE_INBOUND_SIZE),
            },
            stop: watch::channel(false).0,
            rx_bytes: AtomicU64::new(0),
            tx_bytes: AtomicU64::new(0),
            last_handshake: Mutex::new(None),
        }
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    pub fn endpoint(&self) -> Option<SocketAddr> {
        *self.endpoint.read()
    }

    /// Returns true if the endpoint changed
    pub(crate) fn set_endpoint(&self, endpoint: SocketAddr) -> bool {
        let mut current = self.endpoint.write();
        if *current == Some(endpoint) {
            return false;
        }
        *current = Some(endpoint);
        true
    }

    pub fn persistent_keepalive(&self) -> u16 {
        self.persistent_keepalive.load(Ordering::Relaxed) as u16
    }

    /// Returns the previous interval
    pub(crate) fn set_persistent_keepalive(&self, seconds: u16) -> u16 {
        self.persistent_keepalive
            .swap(seconds as u32, Ordering::Relaxed) as u16
    }

    pub(crate) fn stop_rx(&self) -> watch::Receiver<bool> {
        self.stop.subscribe()
    }

    pub(crate) fn is_stopped(&self) -> bool {
        *self.stop.borrow()
    }

    /// Stop every peer routine and drop queued packets
    pub(crate) fn stop(&self) {
        self.stop.send_replace(true);
        self.timers.stop_all();
        self.queues.nonce.close();
        self.queues.outbound.close();
        self.queues.inbound.close();
    }

    /// Queue an empty packet unless something is already waiting to go out
    pub(crate) fn send_keepalive(&self) {
        if self.queues.nonce.is_empty() {
            self.queues.nonce.push(Vec::new());
        }
    }

    /// The key-pair outbound packets may use right now
    pub(crate) fn usable_keypair(&self) -> Option<Arc<KeyPair>> {
        let keypairs = self.keypairs.lock();
        let current = keypairs.current.as_ref()?;
        if current.is_expired() || current.peek_nonce() >= REJECT_AFTER_MESSAGES {
            return None;
        }
        Some(current.clone())
    }

    pub(crate) fn keep_key_fresh_sending(&self) {
        let stale = {
            let keypairs = self.keypairs.lock();
            let Some(current) = keypairs.current.as_ref() else {
                return;
            };
            current.peek_nonce() > REKEY_AFTER_MESSAGES
                || (current.is_initiator && current.age() > REKEY_AFTER_TIME_CHANGE)
        };
        if stale {
            self.signals.handshake_begin.send();
        }
    }

    pub(crate) fn keep_key_fresh_receiving(&self) {
        if self.timers.sent_last_minute_handshake() {
            return;
        }
        let stale = {
            let keypairs = self.keypairs.lock();
            let Some(current) = keypairs.current.as_ref() else {
                return;
            };
            current.is_initiator
                && (current.age() > REKEY_AFTER_TIME_RECEIVING
                    || current.peek_nonce() > REKEY_AFTER_MESSAGES)
        };
        if stale {
            self.timers.set_sent_last_minute_handshake(true);
            self.signals.handshake_begin.send();
        }
    }

    pub(crate) fn add_rx_bytes(&self, bytes: usize) {
        self.rx_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn add_tx_bytes(&self, bytes: usize) {
        self.tx_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_handshake(&self) {
        *self.last_handshake.lock() = Some(SystemTime::now());
    }

    pub fn stats(&self) -> PeerStats {
        PeerStats {
            public_key: self.public_key,
            endpoint: self.endpoint(),
            last_handshake: *self.last_handshake.lock(),
            rx_bytes: self.rx_bytes.load(Ordering::Relaxed),
            tx_bytes: self.tx_bytes.load(Ordering::Relaxed),
            persistent_keepalive: self.persistent_keepalive(),
        }
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("public_key", &self.public_key)
            .field("endpoint", &self.endpoint())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::SessionKeys;

    fn peer() -> Peer {
        let local = PrivateKey::generate();
        Peer::new(PrivateKey::generate().public_key(), &local)
    }

    fn keypair(is_initiator: bool) -> Arc<KeyPair> {
        Arc::new(KeyPair::new(&SessionKeys {
            send: [5u8; 32],
            receive: [6u8; 32],
            is_initiator,
            local_index: 1,
            remote_index: 2,
        }))
    }

    #[test]
    fn test_endpoint_change_detection() {
        let peer = peer();
        let addr: SocketAddr = "192.0.2.1:51820".parse().unwrap();
        assert!(peer.set_endpoint(addr));
        assert!(!peer.set_endpoint(addr));
        assert_eq!(peer.endpoint(), Some(addr));
    }

    #[test]
    fn test_keepalive_only_when_idle() {
        let peer = peer();
        peer.send_keepalive();
        peer.send_keepalive();
        assert_eq!(peer.queues.nonce.len(), 1);
    }

    #[test]
    fn test_usable_keypair() {
        let peer = peer();
        assert!(peer.usable_keypair().is_none());

        peer.keypairs.lock().install(keypair(true));
        assert!(peer.usable_keypair().is_some());

        // A fresh key-pair does not need a rekey
        peer.keep_key_fresh_sending();
        peer.keep_key_fresh_receiving();
        assert!(!peer.signals.handshake_begin.is_pending());
    }

    #[test]
    fn test_stop_closes_queues() {
        let peer = peer();
        peer.queues.nonce.push(vec![1]);
        peer.stop();
        assert!(peer.is_stopped());
        assert!(peer.queues.nonce.is_empty());
    }

    #[test]
    fn test_persistent_keepalive_swap() {
        let peer = peer();
        assert_eq!(peer.set_persistent_keepalive(25), 0);
        assert_eq!(peer.set_persistent_keepalive(0), 25);
        assert_eq!(peer.stats().persistent_keepalive, 0);
    }
}
