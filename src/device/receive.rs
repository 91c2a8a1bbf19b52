//! Inbound path: UDP reader, handshake worker, decryption workers and the
//! per-peer sequential receiver

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use tokio::sync::watch;

use super::peer::Peer;
use super::queue::{Element, Job};
use super::Device;
use crate::protocol::constants::MAX_SEGMENT_SIZE;
use crate::protocol::messages::message_type;
use crate::protocol::{
    open_initiation, CookieReply, HandshakeInitiation, HandshakeResponse, KeyPair, MessageType,
    TransportHeader,
};

/// A handshake-family datagram waiting for the handshake worker
pub(crate) struct HandshakeJob {
    pub packet: Vec<u8>,
    pub src: SocketAddr,
}

/// A transport message on its way to the TUN device
pub(crate) struct InboundPacket {
    /// The whole datagram; after decryption the plaintext starts at byte 16
    pub buffer: Vec<u8>,
    pub counter: u64,
    pub keypair: Arc<KeyPair>,
    pub endpoint: SocketAddr,
    pub plaintext_len: usize,
}

impl InboundPacket {
    fn plaintext(&self) -> &[u8] {
        &self.buffer[TransportHeader::SIZE..TransportHeader::SIZE + self.plaintext_len]
    }
}

/// Read datagrams from whatever socket is current, following rebinds
pub(crate) async fn routine_receive_incoming(device: Arc<Device>) {
    let mut stop = device.stop_rx();
    let mut generation = device.net.generation.subscribe();
    let mut buffer = vec![0u8; MAX_SEGMENT_SIZE];

    loop {
        generation.borrow_and_update();
        let conn = device.net.conn.read().clone();
        let Some(conn) = conn else {
            if wait_for_rebind(&mut stop, &mut generation).await {
                return;
            }
            continue;
        };

        loop {
            let received = tokio::select! {
                _ = stop.changed() => return,
                changed = generation.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    break;
                }
                received = conn.recv_from(&mut buffer) => received,
            };

            match received {
                Ok((size, src)) => device.handle_datagram(&buffer[..size], src).await,
                Err(e) => {
                    tracing::debug!("UDP receive failed: {}", e);
                    // Wait for a rebind rather than spinning on a dead socket
                    if wait_for_rebind(&mut stop, &mut generation).await {
                        return;
                    }
                    break;
                }
            }
        }
    }
}

/// True if the device stopped instead
async fn wait_for_rebind(
    stop: &mut watch::Receiver<bool>,
    generation: &mut watch::Receiver<u64>,
) -> bool {
    tokio::select! {
        _ = stop.changed() => true,
        changed = generation.changed() => changed.is_err(),
    }
}

pub(crate) async fn routine_handshake(device: Arc<Device>) {
    while let Some(job) = device.queues.handshake.pop().await {
        device.handle_handshake(job).await;
    }
    tracing::debug!("Handshake worker stopped");
}

pub(crate) async fn routine_decryption(device: Arc<Device>) {
    while let Some(job) = device.queues.decryption.pop().await {
        decrypt(job);
    }
}

/// Open one transport message in place; a failed job is dropped.
fn decrypt(mut job: Job<InboundPacket>) {
    // Evicted from the peer queue while waiting here
    if job.is_dropped() {
        return;
    }
    let Some(packet) = job.data() else {
        return;
    };
    let opened = packet
        .keypair
        .open(packet.counter, &mut packet.buffer[TransportHeader::SIZE..]);
    match opened {
        Ok(len) => {
            packet.plaintext_len = len;
            job.complete();
        }
        // Dropping the job marks the element dropped
        Err(e) => tracing::trace!("Failed to decrypt transport message: {}", e),
    }
}

/// Deliver the peer's decrypted packets to the TUN device in arrival order
pub(crate) async fn routine_sequential_receiver(device: Arc<Device>, peer: Arc<Peer>) {
    let mut stop = peer.stop_rx();

    loop {
        let element = tokio::select! {
            _ = stop.changed() => return,
            element = peer.queues.inbound.pop() => match element {
                Some(element) => element,
                None => return,
            },
        };
        device.receive_in_order(&peer, &element).await;
    }
}

impl Device {
    pub(crate) async fn handle_datagram(self: &Arc<Self>, packet: &[u8], src: SocketAddr) {
        if packet.len() < TransportHeader::MIN_SIZE {
            return;
        }
        self.session.datagram_received();

        let Ok(kind) = message_type(packet) else {
            return;
        };
        let expected = match kind {
            MessageType::TransportData => {
                self.queue_transport(packet, src).await;
                return;
            }
            MessageType::HandshakeInitiation => HandshakeInitiation::SIZE,
            MessageType::HandshakeResponse => HandshakeResponse::SIZE,
            MessageType::CookieReply => CookieReply::SIZE,
        };
        if packet.len() != expected {
            tracing::trace!("Dropping {:?} of {} bytes from {}", kind, packet.len(), src);
            return;
        }

        let job = HandshakeJob {
            packet: packet.to_vec(),
            src,
        };
        if self.queues.handshake.push(job).is_some() {
            tracing::debug!("Handshake queue full, dropped oldest message");
        }
    }

    async fn queue_transport(&self, packet: &[u8], src: SocketAddr) {
        let Ok(header) = TransportHeader::from_bytes(packet) else {
            return;
        };
        let Some(entry) = self.indices.lookup(header.receiver_index) else {
            return;
        };
        let Some(keypair) = entry.keypair else {
            return;
        };
        if keypair.is_expired() {
            return;
        }

        let (element, job) = Element::new_locked(InboundPacket {
            buffer: packet.to_vec(),
            counter: header.counter,
            keypair,
            endpoint: src,
            plaintext_len: 0,
        })
        .await;

        if let Some(evicted) = entry.peer.queues.inbound.push(element) {
            evicted.mark_dropped();
        }
        // Evicted jobs release their element as they drop
        drop(self.queues.decryption.push(job));
    }

    async fn handle_handshake(self: &Arc<Self>, job: HandshakeJob) {
        let HandshakeJob { packet, src } = job;
        let Ok(kind) = message_type(&packet) else {
            return;
        };

        if kind == MessageType::CookieReply {
            self.handle_cookie_reply(&packet);
            return;
        }

        if !self.cookie_checker.lock().check_mac1(&packet) {
            tracing::debug!("Invalid MAC1 on {:?} from {}", kind, src);
            return;
        }

        if self.is_under_load() {
            if !self.cookie_checker.lock().check_mac2(&packet, &src) {
                self.send_cookie_reply(&packet, src).await;
                return;
            }
            if !self.rate_limiter.allow(src.ip()) {
                tracing::trace!("Rate limited handshake from {}", src);
                return;
            }
        }

        match kind {
            MessageType::HandshakeInitiation => self.handle_initiation(&packet, src).await,
            MessageType::HandshakeResponse => self.handle_response(&packet, src).await,
            _ => {}
        }
    }

    fn handle_cookie_reply(&self, packet: &[u8]) {
        let Ok(reply) = CookieReply::from_bytes(packet) else {
            return;
        };
        let Some(entry) = self.indices.lookup(reply.receiver_index) else {
            return;
        };
        if let Err(e) = entry.peer.cookie.lock().consume_reply(&reply) {
            tracing::debug!("Rejected cookie reply: {}", e);
        };
    }

    async fn send_cookie_reply(self: &Arc<Self>, packet: &[u8], src: SocketAddr) {
        let mut sender = [0u8; 4];
        sender.copy_from_slice(&packet[4..8]);
        let sender_index = u32::from_le_bytes(sender);

        let reply = self
            .cookie_checker
            .lock()
            .create_reply(packet, sender_index, &src);
        let reply = match reply {
            Ok(reply) => reply,
            Err(e) => {
                tracing::debug!("Failed to create cookie reply: {}", e);
                return;
            }
        };

        tracing::debug!("Under load, sending cookie reply to {}", src);
        if let Err(e) = self.send_to(&reply.to_bytes(), src).await {
            tracing::debug!("Failed to send cookie reply: {}", e);
            self.recover_network();
        }
    }

    async fn handle_initiation(self: &Arc<Self>, packet: &[u8], src: SocketAddr) {
        let Ok(msg) = HandshakeInitiation::from_bytes(packet) else {
            return;
        };

        let identity = self.identity.read().clone();
        let opened = match open_initiation(&identity, &msg) {
            Ok(opened) => opened,
            Err(e) => {
                tracing::debug!("Invalid handshake initiation from {}: {}", src, e);
                return;
            }
        };

        let Some(peer) = self.peer() else {
            return;
        };
        if opened.remote_static() != peer.public_key() {
            tracing::debug!("Handshake initiation from unknown key {}", opened.remote_static());
            return;
        }

        let consumed = peer.handshake.lock().consume_initiation(opened);
        if let Err(e) = consumed {
            tracing::debug!("Rejected handshake initiation from {}: {}", src, e);
            return;
        }

        peer.timer_any_authenticated_packet_traversal();
        peer.timer_any_authenticated_packet_received();
        self.update_endpoint(&peer, src).await;

        let response = match self.create_response_packet(&peer) {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!("Failed to create handshake response: {}", e);
                return;
            }
        };

        match self.send_to_peer(&peer, &response).await {
            Ok(()) => {
                peer.timer_any_authenticated_packet_traversal();
                peer.timer_any_authenticated_packet_sent();
            }
            Err(e) => {
                tracing::debug!("Failed to send handshake response: {}", e);
                self.recover_network();
            }
        }
    }

    fn create_response_packet(&self, peer: &Arc<Peer>) -> crate::error::Result<Vec<u8>> {
        let index = self.indices.insert_handshake(peer);
        let (stale, response) = {
            let mut handshake = peer.handshake.lock();
            let stale = handshake.local_index();
            (stale, handshake.create_response(index))
        };
        let response = match response {
            Ok(response) => response,
            Err(e) => {
                self.indices.delete(index);
                return Err(e);
            }
        };
        // Our own initiation in flight was superseded
        if stale != 0 {
            self.indices.delete(stale);
        }

        peer.timer_ephemeral_key_created();
        self.new_keypair(peer)?;

        let mut packet = response.to_bytes().to_vec();
        peer.cookie.lock().add_macs(&mut packet);
        Ok(packet)
    }

    async fn handle_response(self: &Arc<Self>, packet: &[u8], src: SocketAddr) {
        let Ok(msg) = HandshakeResponse::from_bytes(packet) else {
            return;
        };
        let Some(entry) = self.indices.lookup(msg.receiver_index) else {
            tracing::debug!("Handshake response for unknown index {}", msg.receiver_index);
            return;
        };
        if entry.keypair.is_some() {
            return;
        }
        let peer = entry.peer;

        let identity = self.identity.read().clone();
        let consumed = peer.handshake.lock().consume_response(&identity, &msg);
        if let Err(e) = consumed {
            tracing::debug!("Rejected handshake response from {}: {}", src, e);
            return;
        }

        peer.timer_any_authenticated_packet_traversal();
        peer.timer_any_authenticated_packet_received();
        self.update_endpoint(&peer, src).await;

        if let Err(e) = self.new_keypair(&peer) {
            tracing::debug!("Failed to derive key-pair: {}", e);
            return;
        }
        self.handshake_completed(&peer);

        // Confirms the key-pair to the responder
        peer.send_keepalive();
    }

    async fn receive_in_order(&self, peer: &Arc<Peer>, element: &Element<InboundPacket>) {
        let packet = element.lock().await;
        if element.is_dropped() {
            return;
        }

        if !packet.keypair.validate_counter(packet.counter) {
            tracing::trace!("Replayed or stale counter {}", packet.counter);
            return;
        }

        peer.timer_any_authenticated_packet_traversal();
        peer.timer_any_authenticated_packet_received();
        peer.keep_key_fresh_receiving();

        let promoted = peer.keypairs.lock().promote(&packet.keypair);
        if let Some(Some(old)) = promoted {
            self.indices.delete(old.local_index);
        }
        if packet.keypair.confirm() {
            self.handshake_completed(peer);
        }

        self.update_endpoint(peer, packet.endpoint).await;
        peer.add_rx_bytes(packet.buffer.len());

        let plaintext = packet.plaintext();
        if plaintext.is_empty() {
            tracing::trace!("Received keepalive from {}", peer.public_key());
            return;
        }
        peer.timer_data_received();

        let Some((len, source)) = inspect_ip(plaintext) else {
            tracing::debug!("Dropping malformed IP packet from {}", peer.public_key());
            return;
        };
        match self.routing.lookup(source) {
            Some(owner) if Arc::ptr_eq(&owner, peer) => {}
            _ => {
                tracing::debug!("Dropping packet with unauthorised source {}", source);
                return;
            }
        }

        if let Err(e) = self.tun.write(&plaintext[..len]).await {
            tracing::warn!("Failed to write to TUN device: {}", e);
        }
    }
}

const IPV4_MIN_HEADER: usize = 20;
const IPV6_HEADER: usize = 40;

/// Declared length and source address of a decrypted IP packet.
///
/// The declared length may be shorter than the buffer (padding) but never
/// longer, nor shorter than the header.
fn inspect_ip(packet: &[u8]) -> Option<(usize, IpAddr)> {
    match packet.first()? >> 4 {
        4 if packet.len() >= IPV4_MIN_HEADER => {
            let len = u16::from_be_bytes([packet[2], packet[3]]) as usize;
            if !(IPV4_MIN_HEADER..=packet.len()).contains(&len) {
                return None;
            }
            let mut src = [0u8; 4];
            src.copy_from_slice(&packet[12..16]);
            Some((len, IpAddr::V4(Ipv4Addr::from(src))))
        }
        6 if packet.len() >= IPV6_HEADER => {
            let len = u16::from_be_bytes([packet[4], packet[5]]) as usize + IPV6_HEADER;
            if len > packet.len() {
                return None;
            }
            let mut src = [0u8; 16];
            src.copy_from_slice(&packet[8..24]);
            Some((len, IpAddr::V6(Ipv6Addr::from(src))))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    use tokio::sync::mpsc::UnboundedReceiver;

    use crate::crypto::PrivateKey;
    use crate::device::{ChannelSink, Event, Session, Status};
    use crate::protocol::constants::HANDSHAKE_INITIATION_RATE;
    use crate::protocol::HandshakeState;
    use crate::tunnel::memory::{tun_pair, Datagram, MemoryHub};

    const CLIENT: &str = "198.51.100.2:40000";
    const SERVER: &str = "198.51.100.1:51820";

    fn addr(addr: &str) -> SocketAddr {
        addr.parse().unwrap()
    }

    fn device(hub: &MemoryHub, at: &str, session: Session) -> Arc<Device> {
        let (tun, _handle) = tun_pair(1420);
        Device::new(Arc::new(tun), Arc::new(hub.binder(addr(at))), Arc::new(session))
    }

    /// Two devices driven by hand: no workers, every step awaited in turn
    struct Link {
        tap: UnboundedReceiver<Datagram>,
        client: Arc<Device>,
        client_peer: Arc<Peer>,
        server: Arc<Device>,
        server_peer: Arc<Peer>,
        server_events: UnboundedReceiver<Event>,
    }

    impl Link {
        async fn new() -> Self {
            let hub = MemoryHub::new();
            let tap = hub.tap();
            let (sink, server_events) = ChannelSink::channel();
            let client = device(&hub, CLIENT, Session::default());
            let server = device(&hub, SERVER, Session::new(Arc::new(sink)));

            let client_key = PrivateKey::generate();
            let server_key = PrivateKey::generate();
            client.set_private_key(client_key.clone());
            server.set_private_key(server_key.clone());

            let client_peer = client.install_peer(server_key.public_key());
            let server_peer = server.install_peer(client_key.public_key());
            client_peer.set_endpoint(addr(SERVER));

            client.rebind(Some(addr(SERVER))).await.unwrap();
            server.rebind(None).await.unwrap();

            Self {
                tap,
                client,
                client_peer,
                server,
                server_peer,
                server_events,
            }
        }

        /// Last message of `kind` sent to `to`
        fn sent(&mut self, to: &str, kind: u8) -> Vec<u8> {
            while let Ok(datagram) = self.tap.try_recv() {
                if datagram.to == addr(to) && datagram.payload[0] == kind {
                    return datagram.payload;
                }
            }
            panic!("no message of type {} sent to {}", kind, to);
        }

        /// Initiation from the client, response back from the server
        async fn handshake(&mut self) {
            let initiation = self.client.create_initiation_packet(&self.client_peer).unwrap();
            self.server
                .handle_handshake(HandshakeJob {
                    packet: initiation,
                    src: addr(CLIENT),
                })
                .await;
            let response = self.sent(CLIENT, 2);
            self.client
                .handle_handshake(HandshakeJob {
                    packet: response,
                    src: addr(SERVER),
                })
                .await;
        }

        /// Queue a client transport message on the server, as the reader would
        async fn deliver(&self, payload: &[u8]) -> (Arc<Element<InboundPacket>>, Job<InboundPacket>) {
            let keypair = self.client_peer.keypairs.lock().current.clone().unwrap();
            self.server
                .queue_transport(&transport(&keypair, payload), addr(CLIENT))
                .await;
            let job = self.server.queues.decryption.try_pop().unwrap();
            let element = self.server_peer.queues.inbound.try_pop().unwrap();
            (element, job)
        }

        /// Client keepalive through the server's whole inbound path
        async fn keepalive(&self) {
            let (element, job) = self.deliver(&[]).await;
            decrypt(job);
            self.server.receive_in_order(&self.server_peer, &element).await;
        }
    }

    fn transport(keypair: &KeyPair, payload: &[u8]) -> Vec<u8> {
        let counter = keypair.next_nonce().unwrap();
        let mut body = payload.to_vec();
        keypair.seal(counter, &mut body).unwrap();

        let mut packet = vec![0u8; TransportHeader::SIZE];
        TransportHeader {
            receiver_index: keypair.remote_index,
            counter,
        }
        .write(&mut packet);
        packet.extend_from_slice(&body);
        packet
    }

    #[tokio::test]
    async fn test_responder_completes_on_first_transport_message() {
        let mut link = Link::new().await;
        link.handshake().await;

        assert!(link.client_peer.stats().last_handshake.is_some());
        // The responder's key-pair is in place but not yet confirmed
        assert!(link.server_peer.keypairs.lock().current.is_some());
        assert!(link.server_peer.stats().last_handshake.is_none());
        assert!(link.server_events.try_recv().is_err());

        link.keepalive().await;
        assert!(link.server_peer.stats().last_handshake.is_some());
        assert_eq!(
            link.server_events.try_recv().unwrap(),
            Event::Status(Status::HandshakeCompleted)
        );
        assert!(!link.server_peer.timers.sent_last_minute_handshake());

        // Only the first message confirms
        link.keepalive().await;
        assert!(link.server_events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_under_load_requires_fresh_mac2() {
        let mut link = Link::new().await;
        *link.server.under_load_until.lock() = Some(Instant::now() + Duration::from_secs(60));
        assert!(link.server.is_under_load());

        let initiation = link.client.create_initiation_packet(&link.client_peer).unwrap();
        link.server
            .handle_handshake(HandshakeJob {
                packet: initiation,
                src: addr(CLIENT),
            })
            .await;

        let reply = link.sent(CLIENT, 3);
        assert_eq!(reply.len(), CookieReply::SIZE);
        // Nothing else was sent and the initiation left no trace
        assert!(link.tap.try_recv().is_err());
        assert_eq!(link.server_peer.handshake.lock().state(), HandshakeState::Zeroed);
        assert!(link.server.indices.is_empty());
        assert_eq!(link.server_peer.endpoint(), None);

        link.client
            .handle_handshake(HandshakeJob {
                packet: reply,
                src: addr(SERVER),
            })
            .await;
        assert!(link.client_peer.cookie.lock().has_cookie());

        let retry = link.client.create_initiation_packet(&link.client_peer).unwrap();
        link.server
            .handle_handshake(HandshakeJob {
                packet: retry,
                src: addr(CLIENT),
            })
            .await;

        assert!(link.server.is_under_load());
        let response = link.sent(CLIENT, 2);
        assert_eq!(response.len(), HandshakeResponse::SIZE);
        assert_eq!(link.server.indices.len(), 1);
        assert_eq!(link.server_peer.endpoint(), Some(addr(CLIENT)));
    }

    #[tokio::test]
    async fn test_dropped_element_is_not_decrypted() {
        let mut link = Link::new().await;
        link.handshake().await;

        let (dropped, job) = link.deliver(&[7u8; 16]).await;
        // Evicted from the peer queue while the job waited for a worker
        dropped.mark_dropped();
        decrypt(job);
        {
            let packet = dropped.lock().await;
            assert_eq!(packet.plaintext_len, 0);
            assert_ne!(&packet.buffer[TransportHeader::SIZE..][..16], &[7u8; 16]);
        }

        let (element, job) = link.deliver(&[7u8; 16]).await;
        decrypt(job);
        assert!(!element.is_dropped());
        assert_eq!(element.lock().await.plaintext(), &[7u8; 16]);
    }

    #[tokio::test]
    async fn test_repeated_handshakes_index_at_most_three_keypairs() {
        let mut link = Link::new().await;

        for round in 0..6 {
            // Initiations closer together than this are refused as a flood
            tokio::time::sleep(HANDSHAKE_INITIATION_RATE + Duration::from_millis(20)).await;

            link.handshake().await;
            assert!(link.client.indices.len() <= 3, "round {}", round);
            assert!(link.server.indices.len() <= 3, "round {}", round);

            link.keepalive().await;
            for (device, peer) in [
                (&link.client, &link.client_peer),
                (&link.server, &link.server_peer),
            ] {
                // No in-flight handshake, so every index belongs to a live key-pair
                let keypairs = peer.keypairs.lock().len();
                assert!(keypairs <= 3, "round {}", round);
                assert_eq!(device.indices.len(), keypairs, "round {}", round);
            }
        }

        assert!(link.server_peer.stats().last_handshake.is_some());
        let mut completions = 0;
        while let Ok(event) = link.server_events.try_recv() {
            if event == Event::Status(Status::HandshakeCompleted) {
                completions += 1;
            }
        }
        assert_eq!(completions, 6);
    }

    fn ipv4(total_len: u16, buffer_len: usize) -> Vec<u8> {
        let mut packet = vec![0u8; buffer_len];
        packet[0] = 0x45;
        packet[2..4].copy_from_slice(&total_len.to_be_bytes());
        packet[12..16].copy_from_slice(&[10, 0, 0, 2]);
        packet
    }

    #[test]
    fn test_ipv4_padding_is_trimmed() {
        let (len, src) = inspect_ip(&ipv4(28, 32)).unwrap();
        assert_eq!(len, 28);
        assert_eq!(src, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)));
    }

    #[test]
    fn test_ipv4_bad_lengths() {
        assert!(inspect_ip(&ipv4(40, 32)).is_none());
        assert!(inspect_ip(&ipv4(12, 32)).is_none());
        assert!(inspect_ip(&ipv4(20, 16)).is_none());
    }

    #[test]
    fn test_ipv6() {
        let mut packet = vec![0u8; 48];
        packet[0] = 0x60;
        packet[4..6].copy_from_slice(&4u16.to_be_bytes());
        packet[8] = 0xfd;
        let (len, src) = inspect_ip(&packet).unwrap();
        assert_eq!(len, 44);
        assert_eq!(src, "fd00::".parse::<IpAddr>().unwrap());

        packet[4..6].copy_from_slice(&9u16.to_be_bytes());
        assert!(inspect_ip(&packet).is_none());
    }

    #[test]
    fn test_unknown_version() {
        assert!(inspect_ip(&[0x00; 40]).is_none());
        assert!(inspect_ip(&[]).is_none());
    }
}
