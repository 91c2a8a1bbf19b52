//! Outbound path: TUN reader, nonce routine, encryption workers and the
//! per-peer sequential sender

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use super::peer::Peer;
use super::queue::Element;
use super::Device;
use crate::error::CryptoError;
use crate::protocol::constants::{MAX_SEGMENT_SIZE, PADDING_MULTIPLE};
use crate::protocol::{KeyPair, TransportHeader};

/// An IP packet between nonce assignment and the wire
pub(crate) struct OutboundPacket {
    /// Plaintext before encryption, the full transport message after
    pub buffer: Vec<u8>,
    pub nonce: u64,
    pub keypair: Arc<KeyPair>,
}

impl OutboundPacket {
    /// Pad, seal and prefix the transport header
    fn encrypt(&mut self, mtu: usize) -> Result<(), CryptoError> {
        let padded = padded_len(self.buffer.len(), mtu);
        self.buffer.resize(padded, 0);
        self.keypair.seal(self.nonce, &mut self.buffer)?;

        let mut message = vec![0u8; TransportHeader::SIZE];
        TransportHeader {
            receiver_index: self.keypair.remote_index,
            counter: self.nonce,
        }
        .write(&mut message);
        message.extend_from_slice(&self.buffer);
        self.buffer = message;
        Ok(())
    }
}

/// Zero-pad to a multiple of 16, never past the MTU
fn padded_len(len: usize, mtu: usize) -> usize {
    let rounded = len.div_ceil(PADDING_MULTIPLE) * PADDING_MULTIPLE;
    rounded.min(mtu.max(len))
}

/// Destination address of an outbound IP packet
fn destination(packet: &[u8]) -> Option<IpAddr> {
    match packet.first()? >> 4 {
        4 if packet.len() >= 20 => {
            let mut dst = [0u8; 4];
            dst.copy_from_slice(&packet[16..20]);
            Some(IpAddr::V4(Ipv4Addr::from(dst)))
        }
        6 if packet.len() >= 40 => {
            let mut dst = [0u8; 16];
            dst.copy_from_slice(&packet[24..40]);
            Some(IpAddr::V6(Ipv6Addr::from(dst)))
        }
        _ => None,
    }
}

/// Route packets from the TUN device to the peer's nonce queue
pub(crate) async fn routine_read_from_tun(device: Arc<Device>) {
    let mut stop = device.stop_rx();
    let mut buffer = vec![0u8; MAX_SEGMENT_SIZE];

    loop {
        let read = tokio::select! {
            _ = stop.changed() => return,
            read = device.tun.read(&mut buffer) => read,
        };
        let size = match read {
            Ok(0) => continue,
            Ok(size) => size,
            Err(e) => {
                tracing::error!("Failed to read from TUN device: {}", e);
                return;
            }
        };

        let packet = &buffer[..size];
        let Some(dst) = destination(packet) else {
            tracing::trace!("Dropping non-IP packet from TUN");
            continue;
        };
        let Some(peer) = device.routing.lookup(dst) else {
            tracing::trace!("No route to {}", dst);
            continue;
        };
        if peer.endpoint().is_none() {
            tracing::trace!("Peer has no endpoint, dropping packet to {}", dst);
            continue;
        }

        if peer.queues.nonce.push(packet.to_vec()).is_some() {
            tracing::debug!("Nonce queue full, dropped oldest packet");
        }
    }
}

/// Assign nonces in queue order, waiting for a handshake when needed
pub(crate) async fn routine_nonce(device: Arc<Device>, peer: Arc<Peer>) {
    let mut stop = peer.stop_rx();

    'packets: loop {
        let packet = tokio::select! {
            _ = stop.changed() => return,
            packet = peer.queues.nonce.pop() => match packet {
                Some(packet) => packet,
                None => return,
            },
        };

        let keypair = loop {
            if peer.signals.flush_nonce_queue.try_take() {
                peer.queues.nonce.clear();
                continue 'packets;
            }
            if let Some(keypair) = peer.usable_keypair() {
                break keypair;
            }

            peer.signals.handshake_begin.send();
            tokio::select! {
                _ = stop.changed() => return,
                _ = peer.signals.new_keypair.wait() => {}
                _ = peer.signals.flush_nonce_queue.wait() => {
                    tracing::debug!("Handshake gave up, flushing queued packets");
                    peer.queues.nonce.clear();
                    continue 'packets;
                }
            }
        };

        let Some(nonce) = keypair.next_nonce() else {
            peer.signals.handshake_begin.send();
            continue;
        };

        let (element, job) = Element::new_locked(OutboundPacket {
            buffer: packet,
            nonce,
            keypair,
        })
        .await;

        if let Some(evicted) = peer.queues.outbound.push(element) {
            evicted.mark_dropped();
        }
        drop(device.queues.encryption.push(job));
    }
}

pub(crate) async fn routine_encryption(device: Arc<Device>) {
    while let Some(mut job) = device.queues.encryption.pop().await {
        let mtu = device.tun.mtu();
        let Some(packet) = job.data() else {
            continue;
        };
        match packet.encrypt(mtu) {
            Ok(()) => job.complete(),
            Err(e) => tracing::debug!("Failed to encrypt packet: {}", e),
        }
    }
}

/// Put the peer's encrypted packets on the wire in nonce order
pub(crate) async fn routine_sequential_sender(device: Arc<Device>, peer: Arc<Peer>) {
    let mut stop = peer.stop_rx();

    loop {
        let element = tokio::select! {
            _ = stop.changed() => return,
            element = peer.queues.outbound.pop() => match element {
                Some(element) => element,
                None => return,
            },
        };

        let message = {
            let mut packet = element.lock().await;
            if element.is_dropped() {
                continue;
            }
            std::mem::take(&mut packet.buffer)
        };

        match device.send_to_peer(&peer, &message).await {
            Ok(()) => {
                peer.timer_any_authenticated_packet_traversal();
                peer.timer_any_authenticated_packet_sent();
                if message.len() != TransportHeader::MIN_SIZE {
                    peer.timer_data_sent();
                }
                peer.keep_key_fresh_sending();
            }
            Err(e) => {
                tracing::debug!("Failed to send transport message: {}", e);
                device.recover_network();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::SessionKeys;

    fn keypair() -> Arc<KeyPair> {
        Arc::new(KeyPair::new(&SessionKeys {
            send: [7u8; 32],
            receive: [7u8; 32],
            is_initiator: true,
            local_index: 11,
            remote_index: 22,
        }))
    }

    #[test]
    fn test_padding() {
        assert_eq!(padded_len(0, 1420), 0);
        assert_eq!(padded_len(1, 1420), 16);
        assert_eq!(padded_len(16, 1420), 16);
        assert_eq!(padded_len(1419, 1420), 1420);
        assert_eq!(padded_len(1420, 1420), 1420);
        // Oversized packets are left alone
        assert_eq!(padded_len(1500, 1420), 1500);
    }

    #[test]
    fn test_destination() {
        let mut v4 = vec![0u8; 20];
        v4[0] = 0x45;
        v4[16..20].copy_from_slice(&[10, 0, 0, 9]);
        assert_eq!(destination(&v4), Some("10.0.0.9".parse().unwrap()));

        let mut v6 = vec![0u8; 40];
        v6[0] = 0x60;
        v6[24] = 0xfd;
        assert_eq!(destination(&v6), Some("fd00::".parse().unwrap()));

        assert!(destination(&v4[..10]).is_none());
    }

    #[test]
    fn test_keepalive_encrypts_to_minimum_size() {
        let keypair = keypair();
        let mut packet = OutboundPacket {
            buffer: Vec::new(),
            nonce: keypair.next_nonce().unwrap(),
            keypair: keypair.clone(),
        };
        packet.encrypt(1420).unwrap();

        assert_eq!(packet.buffer.len(), TransportHeader::MIN_SIZE);
        let header = TransportHeader::from_bytes(&packet.buffer).unwrap();
        assert_eq!(header.receiver_index, 22);
        assert_eq!(header.counter, 0);

        // Same keys both ways, so the sender can open its own message
        let len = keypair
            .open(0, &mut packet.buffer[TransportHeader::SIZE..])
            .unwrap();
        assert_eq!(len, 0);
    }
}
