//! Wire formats
//!
//! Every message starts with a little-endian u32 type tag:
//! - Type 1: Handshake Initiation (148 bytes)
//! - Type 2: Handshake Response (92 bytes)
//! - Type 3: Cookie Reply (64 bytes)
//! - Type 4: Transport Data (16-byte header + ciphertext)
//!
//! Handshake-family messages have exact sizes; anything else is rejected.

use crate::crypto::aead::TAG_LEN;
use crate::error::ProtocolError;

/// Message types
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    HandshakeInitiation = 1,
    HandshakeResponse = 2,
    CookieReply = 3,
    TransportData = 4,
}

impl TryFrom<u32> for MessageType {
    type Error = ProtocolError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::HandshakeInitiation),
            2 => Ok(Self::HandshakeResponse),
            3 => Ok(Self::CookieReply),
            4 => Ok(Self::TransportData),
            _ => Err(ProtocolError::InvalidMessageType { msg_type: value }),
        }
    }
}

fn read_u32(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

fn read_u64(data: &[u8], offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&data[offset..offset + 8]);
    u64::from_le_bytes(bytes)
}

fn read_array<const N: usize>(data: &[u8], offset: usize) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&data[offset..offset + N]);
    out
}

fn check_exact(data: &[u8], expected: usize, msg_type: MessageType) -> Result<(), ProtocolError> {
    if data.len() != expected {
        return Err(ProtocolError::InvalidMessageLength {
            expected,
            got: data.len(),
        });
    }
    let tag = read_u32(data, 0);
    if tag != msg_type as u32 {
        return Err(ProtocolError::InvalidMessageType { msg_type: tag });
    }
    Ok(())
}

/// Handshake Initiation message (148 bytes)
///
/// ```text
/// type(4) | sender_index(4) | ephemeral_public(32) |
/// encrypted_static(48) | encrypted_timestamp(28) | mac1(16) | mac2(16)
/// ```
#[derive(Debug, Clone)]
pub struct HandshakeInitiation {
    pub sender_index: u32,
    pub ephemeral_public: [u8; 32],
    pub encrypted_static: [u8; 48],    // 32 bytes static + 16 bytes tag
    pub encrypted_timestamp: [u8; 28], // 12 bytes TAI64N + 16 bytes tag
    pub mac1: [u8; 16],
    pub mac2: [u8; 16],
}

impl HandshakeInitiation {
    pub const SIZE: usize = 148;
    pub const MAC1_OFFSET: usize = 116;
    pub const MAC2_OFFSET: usize = 132;

    /// Serialize to bytes
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&(MessageType::HandshakeInitiation as u32).to_le_bytes());
        buf[4..8].copy_from_slice(&self.sender_index.to_le_bytes());
        buf[8..40].copy_from_slice(&self.ephemeral_public);
        buf[40..88].copy_from_slice(&self.encrypted_static);
        buf[88..116].copy_from_slice(&self.encrypted_timestamp);
        buf[116..132].copy_from_slice(&self.mac1);
        buf[132..148].copy_from_slice(&self.mac2);
        buf
    }

    /// Parse from bytes (exact size)
    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        check_exact(data, Self::SIZE, MessageType::HandshakeInitiation)?;
        Ok(Self {
            sender_index: read_u32(data, 4),
            ephemeral_public: read_array(data, 8),
            encrypted_static: read_array(data, 40),
            encrypted_timestamp: read_array(data, 88),
            mac1: read_array(data, 116),
            mac2: read_array(data, 132),
        })
    }
}

/// Handshake Response message (92 bytes)
///
/// ```text
/// type(4) | sender_index(4) | receiver_index(4) |
/// ephemeral_public(32) | encrypted_nothing(16) | mac1(16) | mac2(16)
/// ```
#[derive(Debug, Clone)]
pub struct HandshakeResponse {
    pub sender_index: u32,
    pub receiver_index: u32,
    pub ephemeral_public: [u8; 32],
    pub encrypted_nothing: [u8; 16], // Just the auth tag
    pub mac1: [u8; 16],
    pub mac2: [u8; 16],
}

impl HandshakeResponse {
    pub const SIZE: usize = 92;
    pub const MAC1_OFFSET: usize = 60;
    pub const MAC2_OFFSET: usize = 76;

    /// Serialize to bytes
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&(MessageType::HandshakeResponse as u32).to_le_bytes());
        buf[4..8].copy_from_slice(&self.sender_index.to_le_bytes());
        buf[8..12].copy_from_slice(&self.receiver_index.to_le_bytes());
        buf[12..44].copy_from_slice(&self.ephemeral_public);
        buf[44..60].copy_from_slice(&self.encrypted_nothing);
        buf[60..76].copy_from_slice(&self.mac1);
        buf[76..92].copy_from_slice(&self.mac2);
        buf
    }

    /// Parse from bytes (exact size)
    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        check_exact(data, Self::SIZE, MessageType::HandshakeResponse)?;
        Ok(Self {
            sender_index: read_u32(data, 4),
            receiver_index: read_u32(data, 8),
            ephemeral_public: read_array(data, 12),
            encrypted_nothing: read_array(data, 44),
            mac1: read_array(data, 60),
            mac2: read_array(data, 76),
        })
    }
}

/// Cookie Reply message (64 bytes)
///
/// ```text
/// type(4) | receiver_index(4) | nonce(24) | encrypted_cookie(32)
/// ```
#[derive(Debug, Clone)]
pub struct CookieReply {
    pub receiver_index: u32,
    pub nonce: [u8; 24],
    pub encrypted_cookie: [u8; 32], // 16 bytes cookie + 16 bytes tag
}

impl CookieReply {
    pub const SIZE: usize = 64;

    /// Serialize to bytes
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&(MessageType::CookieReply as u32).to_le_bytes());
        buf[4..8].copy_from_slice(&self.receiver_index.to_le_bytes());
        buf[8..32].copy_from_slice(&self.nonce);
        buf[32..64].copy_from_slice(&self.encrypted_cookie);
        buf
    }

    /// Parse from bytes (exact size)
    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        check_exact(data, Self::SIZE, MessageType::CookieReply)?;
        Ok(Self {
            receiver_index: read_u32(data, 4),
            nonce: read_array(data, 8),
            encrypted_cookie: read_array(data, 32),
        })
    }
}

/// Transport Data message header (16 bytes, followed by the ciphertext)
///
/// ```text
/// type(4) | receiver_index(4) | counter(8) | encrypted_packet(n+16)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportHeader {
    pub receiver_index: u32,
    pub counter: u64,
}

impl TransportHeader {
    /// Size of the transport header
    pub const SIZE: usize = 16;

    /// Smallest transport message: a keepalive (header + tag)
    pub const MIN_SIZE: usize = Self::SIZE + TAG_LEN;

    /// Write the header into the first 16 bytes of `buf`
    pub fn write(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&(MessageType::TransportData as u32).to_le_bytes());
        buf[4..8].copy_from_slice(&self.receiver_index.to_le_bytes());
        buf[8..16].copy_from_slice(&self.counter.to_le_bytes());
    }

    /// Parse the header of a transport message
    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() < Self::MIN_SIZE {
            return Err(ProtocolError::InvalidMessageLength {
                expected: Self::MIN_SIZE,
                got: data.len(),
            });
        }
        let tag = read_u32(data, 0);
        if tag != MessageType::TransportData as u32 {
            return Err(ProtocolError::InvalidMessageType { msg_type: tag });
        }
        Ok(Self {
            receiver_index: read_u32(data, 4),
            counter: read_u64(data, 8),
        })
    }
}

/// Read the type tag of a datagram
pub fn message_type(data: &[u8]) -> Result<MessageType, ProtocolError> {
    if data.len() < 4 {
        return Err(ProtocolError::InvalidMessageLength {
            expected: 4,
            got: data.len(),
        });
    }
    MessageType::try_from(read_u32(data, 0))
}

/// Receiver index of a cookie reply or handshake response
pub fn receiver_index(data: &[u8]) -> Option<u32> {
    match message_type(data).ok()? {
        MessageType::CookieReply | MessageType::TransportData if data.len() >= 8 => {
            Some(read_u32(data, 4))
        }
        MessageType::HandshakeResponse if data.len() >= 12 => Some(read_u32(data, 8)),
        _ => None,
    }
}

/// (mac1, mac2) offsets for the handshake messages that carry MACs
pub fn mac_offsets(msg_type: MessageType) -> Option<(usize, usize)> {
    match msg_type {
        MessageType::HandshakeInitiation => Some((
            HandshakeInitiation::MAC1_OFFSET,
            HandshakeInitiation::MAC2_OFFSET,
        )),
        MessageType::HandshakeResponse => Some((
            HandshakeResponse::MAC1_OFFSET,
            HandshakeResponse::MAC2_OFFSET,
        )),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_initiation_layout() {
        let init = HandshakeInitiation {
            sender_index: 0x12345678,
            ephemeral_public: [1u8; 32],
            encrypted_static: [2u8; 48],
            encrypted_timestamp: [3u8; 28],
            mac1: [4u8; 16],
            mac2: [5u8; 16],
        };

        let bytes = init.to_bytes();
        assert_eq!(&bytes[0..4], &[1, 0, 0, 0]);
        assert_eq!(&bytes[4..8], &0x12345678u32.to_le_bytes());
        assert_eq!(&bytes[116..132], &[4u8; 16]);

        let parsed = HandshakeInitiation::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.sender_index, init.sender_index);
        assert_eq!(parsed.encrypted_timestamp, init.encrypted_timestamp);
        assert_eq!(parsed.mac2, init.mac2);
    }

    #[test]
    fn test_handshake_response_parse() {
        let mut data = [0u8; HandshakeResponse::SIZE];
        data[0] = 2;
        data[4..8].copy_from_slice(&0x11223344u32.to_le_bytes());
        data[8..12].copy_from_slice(&0x55667788u32.to_le_bytes());

        let parsed = HandshakeResponse::from_bytes(&data).unwrap();
        assert_eq!(parsed.sender_index, 0x11223344);
        assert_eq!(parsed.receiver_index, 0x55667788);
        assert_eq!(receiver_index(&data), Some(0x55667788));
    }

    #[test]
    fn test_exact_sizes_enforced() {
        let mut long = vec![0u8; HandshakeInitiation::SIZE + 1];
        long[0] = 1;
        assert!(matches!(
            HandshakeInitiation::from_bytes(&long),
            Err(ProtocolError::InvalidMessageLength { expected: 148, got: 149 })
        ));

        let mut short = vec![0u8; CookieReply::SIZE - 1];
        short[0] = 3;
        assert!(CookieReply::from_bytes(&short).is_err());
    }

    #[test]
    fn test_type_tag_is_four_bytes() {
        // A tag of 1 with a non-zero high byte is not an initiation
        let mut data = [0u8; HandshakeInitiation::SIZE];
        data[0] = 1;
        data[3] = 1;
        assert!(message_type(&data).is_err());
        assert!(HandshakeInitiation::from_bytes(&data).is_err());
    }

    #[test]
    fn test_transport_header() {
        let mut msg = vec![0u8; TransportHeader::MIN_SIZE];
        let header = TransportHeader {
            receiver_index: 42,
            counter: 1234,
        };
        header.write(&mut msg);

        assert_eq!(message_type(&msg).unwrap(), MessageType::TransportData);
        assert_eq!(TransportHeader::from_bytes(&msg).unwrap(), header);
        assert!(TransportHeader::from_bytes(&msg[..31]).is_err());
    }
}
