//! The tunnel device
//!
//! One `Device` owns the UDP connection, the TUN interface, the global work
//! queues and the single peer slot. `up` spawns the workers:
//!
//! ```text
//! UDP reader ──┬─> handshake queue ──> handshake worker
//!              └─> decryption queue ─> decryption workers ─┐
//!                  peer inbound queue ──> sequential receiver ──> TUN
//!
//! TUN reader ──> peer nonce queue ──> nonce routine
//!                  ├─> encryption queue ─> encryption workers ─┐
//!                  └─> peer outbound queue ──> sequential sender ──> UDP
//! ```
//!
//! Crypto runs in parallel; the sequential stages wait on each element's
//! lock so packets leave in the order they arrived.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;

mod index;
mod peer;
mod queue;
mod ratelimiter;
mod receive;
mod routing;
mod send;
pub mod session;
mod signal;
mod timers;
mod uapi;

pub use peer::{Peer, PeerStats};
pub use session::{ChannelSink, Event, EventSink, Session, Status, TracingSink};

use index::IndexTable;
use queue::{DropQueue, Job};
use ratelimiter::RateLimiter;
use receive::{HandshakeJob, InboundPacket};
use routing::RoutingTable;
use send::OutboundPacket;

use crate::crypto::{PrivateKey, PublicKey};
use crate::error::{NetworkError, ProtocolError, Result};
use crate::protocol::constants::{
    NETWORK_RETRY_DELAY, QUEUE_HANDSHAKE_SIZE, QUEUE_INBOUND_SIZE, QUEUE_OUTBOUND_SIZE,
    UNDER_LOAD_AFTER_TIME, UNDER_LOAD_QUEUE_SIZE,
};
use crate::protocol::{CookieChecker, KeyPair, StaticIdentity};
use crate::tunnel::{TunIo, UdpBinder, UdpConn};

struct DeviceQueues {
    handshake: DropQueue<HandshakeJob>,
    encryption: DropQueue<Job<OutboundPacket>>,
    decryption: DropQueue<Job<InboundPacket>>,
}

struct Net {
    conn: RwLock<Option<Arc<dyn UdpConn>>>,
    /// Where `conn` was asked to connect; only a configured endpoint lands here
    remote: RwLock<Option<SocketAddr>>,
    /// Bumped on every rebind so the reader switches sockets
    generation: watch::Sender<u64>,
    recovering: AtomicBool,
}

pub struct Device {
    identity: RwLock<StaticIdentity>,
    cookie_checker: Mutex<CookieChecker>,
    peer: RwLock<Option<Arc<Peer>>>,
    indices: IndexTable<Peer>,
    routing: RoutingTable<Peer>,
    rate_limiter: RateLimiter,
    under_load_until: Mutex<Option<Instant>>,
    net: Net,
    binder: Arc<dyn UdpBinder>,
    tun: Arc<dyn TunIo>,
    session: Arc<Session>,
    queues: DeviceQueues,
    stop: watch::Sender<bool>,
    up: AtomicBool,
}

impl Device {
    pub fn new(tun: Arc<dyn TunIo>, binder: Arc<dyn UdpBinder>, session: Arc<Session>) -> Arc<Self> {
        let identity = StaticIdentity::default();
        Arc::new(Self {
            cookie_checker: Mutex::new(CookieChecker::new(&identity.public)),
            identity: RwLock::new(identity),
            peer: RwLock::new(None),
            indices: IndexTable::new(),
            routing: RoutingTable::new(),
            rate_limiter: RateLimiter::new(),
            under_load_until: Mutex::new(None),
            net: Net {
                conn: RwLock::new(None),
                remote: RwLock::new(None),
                generation: watch::channel(0).0,
                recovering: AtomicBool::new(false),
            },
            binder,
            tun,
            session,
            queues: DeviceQueues {
                handshake: DropQueue::new(QUEUE_HANDSHAKE_SIZE),
                encryption: DropQueue::new(QUEUE_OUTBOUND_SIZE),
                decryption: DropQueue::new(QUEUE_INBOUND_SIZE),
            },
            stop: watch::channel(false).0,
            up: AtomicBool::new(false),
        })
    }

    /// Bind the socket, start every worker and, if the peer has an
    /// endpoint, begin a handshake.
    pub async fn up(self: &Arc<Self>) -> Result<()> {
        if *self.stop.borrow() {
            return Err(NetworkError::SendFailed {
                reason: "device is closed".to_string(),
            }
            .into());
        }
        if self.up.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let endpoint = self.peer().and_then(|peer| peer.endpoint());
        if let Err(e) = self.rebind(endpoint).await {
            self.up.store(false, Ordering::Release);
            return Err(e);
        }

        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
            .clamp(1, 4);

        self.spawn_worker("udp-reader", receive::routine_receive_incoming(self.clone()));
        self.spawn_worker("tun-reader", send::routine_read_from_tun(self.clone()));
        self.spawn_worker("handshake", receive::routine_handshake(self.clone()));
        for _ in 0..workers {
            self.spawn_worker("decryption", receive::routine_decryption(self.clone()));
            self.spawn_worker("encryption", send::routine_encryption(self.clone()));
        }
        self.spawn_worker("ratelimiter-gc", routine_rate_limiter_gc(self.clone()));
        {
            let session = self.session.clone();
            let stop = self.stop.subscribe();
            self.spawn_worker("liveness", async move { session.monitor_liveness(stop).await });
        }

        if let Some(peer) = self.peer() {
            self.start_peer(&peer);
            if peer.endpoint().is_some() {
                peer.signals.handshake_begin.send();
            }
        }

        tracing::info!(
            "Device up ({} crypto workers per direction)",
            workers
        );
        Ok(())
    }

    /// Stop every worker, tear down the peer and release the socket.
    ///
    /// A closed device cannot be brought up again.
    pub async fn close(&self) {
        if self.stop.send_replace(true) {
            return;
        }
        self.remove_peer();
        self.queues.handshake.close();
        self.queues.encryption.close();
        self.queues.decryption.close();
        self.net.conn.write().take();
        self.net.remote.write().take();
        self.net.generation.send_modify(|generation| *generation += 1);
        self.up.store(false, Ordering::Release);
        tracing::info!("Device closed");
    }

    /// Resolves once the device has been closed
    pub async fn wait(&self) {
        let mut stop = self.stop.subscribe();
        let _ = stop.wait_for(|stopped| *stopped).await;
    }

    pub fn is_up(&self) -> bool {
        self.up.load(Ordering::Acquire)
    }

    pub fn public_key(&self) -> PublicKey {
        self.identity.read().public
    }

    pub fn peer(&self) -> Option<Arc<Peer>> {
        self.peer.read().clone()
    }

    pub fn peer_stats(&self) -> Option<PeerStats> {
        self.peer().map(|peer| peer.stats())
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        let conn = self.net.conn.read().clone()?;
        conn.local_addr().ok()
    }

    pub(crate) fn set_private_key(&self, private: PrivateKey) {
        let identity = StaticIdentity::new(private);
        *self.cookie_checker.lock() = CookieChecker::new(&identity.public);
        if let Some(peer) = self.peer() {
            peer.handshake.lock().set_local_private(&identity.private);
        }
        *self.identity.write() = identity;
    }

    /// Install `peer` in the slot, tearing down any previous one first
    pub(crate) fn install_peer(self: &Arc<Self>, public_key: PublicKey) -> Arc<Peer> {
        self.remove_peer();
        let private = self.identity.read().private.clone();
        let peer = Arc::new(Peer::new(public_key, &private));
        *self.peer.write() = Some(peer.clone());
        if self.is_up() {
            self.start_peer(&peer);
        }
        tracing::info!("Configured peer {}", public_key);
        peer
    }

    /// Synchronously tear down the current peer, if any
    pub(crate) fn remove_peer(&self) {
        let Some(peer) = self.peer.write().take() else {
            return;
        };
        peer.stop();
        self.zero_peer_keys(&peer);
        self.indices.remove_peer(&peer);
        self.routing.remove_peer(&peer);
        tracing::debug!("Removed peer {}", peer.public_key());
    }

    fn start_peer(self: &Arc<Self>, peer: &Arc<Peer>) {
        self.spawn_worker("nonce", send::routine_nonce(self.clone(), peer.clone()));
        self.spawn_worker(
            "sequential-sender",
            send::routine_sequential_sender(self.clone(), peer.clone()),
        );
        self.spawn_worker(
            "sequential-receiver",
            receive::routine_sequential_receiver(self.clone(), peer.clone()),
        );
        self.spawn_worker("timers", timers::routine_timers(self.clone(), peer.clone()));
        self.spawn_worker(
            "handshake-initiator",
            timers::routine_handshake_initiator(self.clone(), peer.clone()),
        );
    }

    /// Run `task` on its own; a panic is logged and ends only that worker
    fn spawn_worker<F>(&self, name: &'static str, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(task);
        tokio::spawn(async move {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    tracing::error!("Worker {} panicked: {}", name, e);
                }
            }
        });
    }

    pub(crate) fn stop_rx(&self) -> watch::Receiver<bool> {
        self.stop.subscribe()
    }

    /// True while the handshake queue is filling up, and for a while after
    pub(crate) fn is_under_load(&self) -> bool {
        let now = Instant::now();
        let mut until = self.under_load_until.lock();
        if self.queues.handshake.len() >= UNDER_LOAD_QUEUE_SIZE {
            *until = Some(now + UNDER_LOAD_AFTER_TIME);
            return true;
        }
        until.is_some_and(|until| until > now)
    }

    /// Turn the peer's finished handshake into a key-pair and install it
    pub(crate) fn new_keypair(&self, peer: &Arc<Peer>) -> Result<Arc<KeyPair>> {
        let mut keypairs = peer.keypairs.lock();
        let keys = peer.handshake.lock().begin_session()?;
        let keypair = Arc::new(KeyPair::new(&keys));

        if !self.indices.swap_for_keypair(keys.local_index, keypair.clone()) {
            return Err(ProtocolError::UnknownIndex {
                index: keys.local_index,
            }
            .into());
        }

        let evicted = keypairs.install(keypair.clone());
        let is_current = keypairs
            .current
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, &keypair));
        drop(keypairs);

        for old in evicted {
            self.indices.delete(old.local_index);
        }
        if is_current {
            peer.signals.new_keypair.send();
        }
        tracing::debug!(
            "New key-pair {} (initiator: {}, current: {})",
            keypair.local_index,
            keypair.is_initiator,
            is_current
        );
        Ok(keypair)
    }

    pub(crate) fn handshake_completed(&self, peer: &Peer) {
        peer.record_handshake();
        peer.timers.set_sent_last_minute_handshake(false);
        peer.signals.handshake_completed.send();
        peer.signals.new_keypair.send();
        self.session.handshake_completed();
        tracing::info!("Handshake completed with {}", peer.public_key());
    }

    /// Build a MAC'd initiation, registering a fresh index for it
    pub(crate) fn create_initiation_packet(&self, peer: &Arc<Peer>) -> Result<Vec<u8>> {
        let identity = self.identity.read().clone();
        let index = self.indices.insert_handshake(peer);

        let (stale, initiation) = {
            let mut handshake = peer.handshake.lock();
            let stale = handshake.local_index();
            (stale, handshake.create_initiation(&identity, index))
        };
        let initiation = match initiation {
            Ok(initiation) => initiation,
            Err(e) => {
                self.indices.delete(index);
                return Err(e);
            }
        };
        if stale != 0 {
            self.indices.delete(stale);
        }

        peer.timer_ephemeral_key_created();
        let mut packet = initiation.to_bytes().to_vec();
        let mut cookie = peer.cookie.lock();
        if cookie.has_cookie() {
            tracing::trace!("Initiation carries a cookie MAC2");
        }
        cookie.add_macs(&mut packet);
        Ok(packet)
    }

    /// Erase all key-pairs and handshake state of `peer`
    pub(crate) fn zero_peer_keys(&self, peer: &Peer) {
        let (released, handshake_index) = {
            let mut keypairs = peer.keypairs.lock();
            let mut handshake = peer.handshake.lock();
            (keypairs.clear(), handshake.clear())
        };
        for keypair in released {
            self.indices.delete(keypair.local_index);
        }
        if let Some(index) = handshake_index {
            self.indices.delete(index);
        }
        peer.queues.nonce.clear();
    }

    pub(crate) async fn send_to_peer(&self, peer: &Peer, packet: &[u8]) -> Result<()> {
        let endpoint = peer.endpoint().ok_or(NetworkError::NoEndpoint)?;
        self.send_to(packet, endpoint).await?;
        peer.add_tx_bytes(packet.len());
        Ok(())
    }

    pub(crate) async fn send_to(&self, packet: &[u8], target: SocketAddr) -> Result<()> {
        let conn = self
            .net
            .conn
            .read()
            .clone()
            .ok_or_else(|| NetworkError::SendFailed {
                reason: "no socket bound".to_string(),
            })?;
        conn.send_to(packet, target)
            .await
            .map_err(|e| NetworkError::SendFailed {
                reason: e.to_string(),
            })?;
        Ok(())
    }

    /// Replace the UDP connection; the old one closes once the reader lets go
    pub(crate) async fn rebind(&self, remote: Option<SocketAddr>) -> Result<()> {
        let conn = self
            .binder
            .bind(remote)
            .await
            .map_err(|e| NetworkError::BindFailed {
                addr: remote.map_or_else(|| "any".to_string(), |addr| addr.to_string()),
                reason: e.to_string(),
            })?;

        if let Some(descriptor) = conn.descriptor() {
            self.session.descriptor(descriptor);
        }
        let local = conn.local_addr().ok();
        self.net.conn.write().replace(conn);
        *self.net.remote.write() = remote;
        self.net.generation.send_modify(|generation| *generation += 1);

        tracing::info!("UDP bound on {:?} (remote: {:?})", local, remote);
        Ok(())
    }

    /// Follow the peer to a new source address.
    ///
    /// Learned addresses never connect the socket. A socket still connected
    /// to an older endpoint is reopened unconnected so the peer can keep
    /// moving.
    pub(crate) async fn update_endpoint(&self, peer: &Peer, endpoint: SocketAddr) {
        if !peer.set_endpoint(endpoint) {
            return;
        }
        tracing::info!("Peer endpoint is now {}", endpoint);

        let connected = *self.net.remote.read();
        if self.is_up() && connected.is_some_and(|remote| remote != endpoint) {
            if let Err(e) = self.rebind(None).await {
                tracing::warn!("Failed to reopen UDP socket for {}: {}", endpoint, e);
            }
        }
    }

    /// After a send failure: wait a moment, then reopen the same kind of socket
    pub(crate) fn recover_network(self: &Arc<Self>) {
        if self.net.recovering.swap(true, Ordering::AcqRel) {
            return;
        }
        let device = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(NETWORK_RETRY_DELAY).await;
            if device.is_up() {
                let remote = *device.net.remote.read();
                tracing::info!("Rebinding UDP after send failure");
                if let Err(e) = device.rebind(remote).await {
                    tracing::warn!("Network recovery failed: {}", e);
                }
            }
            device.net.recovering.store(false, Ordering::Release);
        });
    }
}

async fn routine_rate_limiter_gc(device: Arc<Device>) {
    let mut stop = device.stop_rx();
    let mut tick = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            _ = stop.changed() => return,
            _ = tick.tick() => device.rate_limiter.collect_garbage(),
        }
    }
}
