//! Noise IKpsk2 handshake
//!
//! One `Handshake` lives per peer and walks through
//! `Zeroed -> InitiationCreated -> ResponseConsumed` on the initiating side
//! and `Zeroed -> InitiationConsumed -> ResponseCreated` on the responding
//! side. `begin_session` turns either terminal state into transport keys and
//! resets the handshake. The pre-shared key is always zero.

use std::time::Instant;

use tai64::Tai64N;
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::constants::HANDSHAKE_INITIATION_RATE;
use super::messages::{HandshakeInitiation, HandshakeResponse};
use crate::crypto::noise::SymmetricState;
use crate::crypto::{PrivateKey, PublicKey};
use crate::error::{CryptoError, ProtocolError, Result};

const ZERO_PSK: [u8; 32] = [0u8; 32];
const TIMESTAMP_LEN: usize = 12;

/// Our own static key pair
#[derive(Clone, Default)]
pub struct StaticIdentity {
    pub private: PrivateKey,
    pub public: PublicKey,
}

impl StaticIdentity {
    pub fn new(private: PrivateKey) -> Self {
        let public = if private.is_zero() {
            PublicKey::default()
        } else {
            private.public_key()
        };
        Self { private, public }
    }

    pub fn is_set(&self) -> bool {
        !self.private.is_zero()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Zeroed,
    InitiationCreated,
    InitiationConsumed,
    ResponseCreated,
    ResponseConsumed,
}

/// Transport keys handed from a finished handshake to a new key-pair
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SessionKeys {
    pub send: [u8; 32],
    pub receive: [u8; 32],
    pub is_initiator: bool,
    pub local_index: u32,
    pub remote_index: u32,
}

/// An initiation whose static key decrypted under our identity.
///
/// Produced before the sending peer is known; `Handshake::consume_initiation`
/// on that peer finishes the job.
pub struct OpenedInitiation {
    symmetric: SymmetricState,
    remote_static: PublicKey,
    remote_ephemeral: [u8; 32],
    sender_index: u32,
    encrypted_timestamp: [u8; 28],
}

impl OpenedInitiation {
    pub fn remote_static(&self) -> &PublicKey {
        &self.remote_static
    }

    pub fn sender_index(&self) -> u32 {
        self.sender_index
    }
}

/// Decrypt the initiator's static key with our identity (`e, es, s`)
pub fn open_initiation(local: &StaticIdentity, msg: &HandshakeInitiation) -> Result<OpenedInitiation> {
    if !local.is_set() {
        return Err(ProtocolError::NoPrivateKey.into());
    }

    let mut symmetric = SymmetricState::new(local.public.as_bytes());
    symmetric.mix_ephemeral(&msg.ephemeral_public);

    let es = local.private.shared_secret(&PublicKey::from_bytes(msg.ephemeral_public));
    let key = symmetric.mix_key(&es)?;

    let decrypted = symmetric.decrypt_and_hash(&key, &msg.encrypted_static)?;
    let remote_static: [u8; 32] = decrypted
        .try_into()
        .map_err(|_| CryptoError::Decryption)?;

    Ok(OpenedInitiation {
        symmetric,
        remote_static: PublicKey::from_bytes(remote_static),
        remote_ephemeral: msg.ephemeral_public,
        sender_index: msg.sender_index,
        encrypted_timestamp: msg.encrypted_timestamp,
    })
}

/// Per-peer handshake state
pub struct Handshake {
    state: HandshakeState,
    remote_static: PublicKey,
    precomputed_static_static: [u8; 32],
    symmetric: SymmetricState,
    local_ephemeral: PrivateKey,
    remote_ephemeral: [u8; 32],
    local_index: u32,
    remote_index: u32,
    last_timestamp: [u8; TIMESTAMP_LEN],
    last_initiation_consumption: Option<Instant>,
}

impl Handshake {
    pub fn new(remote_static: PublicKey, local_private: &PrivateKey) -> Self {
        let mut handshake = Self {
            state: HandshakeState::Zeroed,
            remote_static,
            precomputed_static_static: [0u8; 32],
            symmetric: SymmetricState::default(),
            local_ephemeral: PrivateKey::default(),
            remote_ephemeral: [0u8; 32],
            local_index: 0,
            remote_index: 0,
            last_timestamp: [0u8; TIMESTAMP_LEN],
            last_initiation_consumption: None,
        };
        handshake.set_local_private(local_private);
        handshake
    }

    /// Recompute DH(local static, remote static) after a key change
    pub fn set_local_private(&mut self, local_private: &PrivateKey) {
        self.precomputed_static_static = if local_private.is_zero() {
            [0u8; 32]
        } else {
            local_private.shared_secret(&self.remote_static)
        };
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn remote_static(&self) -> &PublicKey {
        &self.remote_static
    }

    /// Index registered for the in-flight handshake, 0 if none
    pub fn local_index(&self) -> u32 {
        self.local_index
    }

    pub fn remote_index(&self) -> u32 {
        self.remote_index
    }

    fn has_static_static(&self) -> bool {
        self.precomputed_static_static.iter().any(|&b| b != 0)
    }

    /// Build a Handshake Initiation with MACs left zero
    pub fn create_initiation(
        &mut self,
        local: &StaticIdentity,
        local_index: u32,
    ) -> Result<HandshakeInitiation> {
        if !local.is_set() || !self.has_static_static() {
            return Err(ProtocolError::NoPrivateKey.into());
        }

        let mut symmetric = SymmetricState::new(self.remote_static.as_bytes());
        let ephemeral = PrivateKey::generate();
        let ephemeral_public = *ephemeral.public_key().as_bytes();
        symmetric.mix_ephemeral(&ephemeral_public);

        let es = ephemeral.shared_secret(&self.remote_static);
        let key = symmetric.mix_key(&es)?;
        let encrypted_static: [u8; 48] = symmetric
            .encrypt_and_hash(&key, local.public.as_bytes())?
            .try_into()
            .map_err(|_| CryptoError::Encryption)?;

        let key = symmetric.mix_key(&self.precomputed_static_static)?;
        let timestamp = Tai64N::now().to_bytes();
        let encrypted_timestamp: [u8; 28] = symmetric
            .encrypt_and_hash(&key, &timestamp)?
            .try_into()
            .map_err(|_| CryptoError::Encryption)?;

        self.symmetric = symmetric;
        self.local_ephemeral = ephemeral;
        self.local_index = local_index;
        self.remote_index = 0;
        self.state = HandshakeState::InitiationCreated;

        Ok(HandshakeInitiation {
            sender_index: local_index,
            ephemeral_public,
            encrypted_static,
            encrypted_timestamp,
            mac1: [0u8; 16],
            mac2: [0u8; 16],
        })
    }

    /// Finish an opened initiation (`ss`, timestamp) and adopt it.
    ///
    /// Nothing is committed unless the timestamp is strictly newer than the
    /// last accepted one and the previous initiation is old enough.
    pub fn consume_initiation(&mut self, opened: OpenedInitiation) -> Result<()> {
        if opened.remote_static != self.remote_static {
            return Err(ProtocolError::HandshakeFailed {
                reason: "initiation from unknown peer",
            }
            .into());
        }
        if !self.has_static_static() {
            return Err(ProtocolError::NoPrivateKey.into());
        }

        let OpenedInitiation {
            mut symmetric,
            remote_ephemeral,
            sender_index,
            encrypted_timestamp,
            ..
        } = opened;

        let key = symmetric.mix_key(&self.precomputed_static_static)?;
        let decrypted = symmetric.decrypt_and_hash(&key, &encrypted_timestamp)?;
        let timestamp: [u8; TIMESTAMP_LEN] = decrypted
            .try_into()
            .map_err(|_| CryptoError::Decryption)?;

        if timestamp <= self.last_timestamp {
            return Err(ProtocolError::StaleTimestamp.into());
        }
        let now = Instant::now();
        if let Some(last) = self.last_initiation_consumption {
            if now.saturating_duration_since(last) <= HANDSHAKE_INITIATION_RATE {
                return Err(ProtocolError::InitiationFlood.into());
            }
        }

        self.symmetric = symmetric;
        self.remote_ephemeral = remote_ephemeral;
        self.remote_index = sender_index;
        self.last_timestamp = timestamp;
        self.last_initiation_consumption = Some(now);
        self.state = HandshakeState::InitiationConsumed;
        Ok(())
    }

    /// Answer a consumed initiation (`e, ee, se, psk`)
    pub fn create_response(&mut self, local_index: u32) -> Result<HandshakeResponse> {
        if self.state != HandshakeState::InitiationConsumed {
            return Err(ProtocolError::UnexpectedState.into());
        }

        let mut symmetric = self.symmetric.clone();
        let ephemeral = PrivateKey::generate();
        let ephemeral_public = *ephemeral.public_key().as_bytes();
        symmetric.mix_ephemeral(&ephemeral_public);

        symmetric.mix_chain(&ephemeral.shared_secret(&PublicKey::from_bytes(self.remote_ephemeral)))?;
        symmetric.mix_chain(&ephemeral.shared_secret(&self.remote_static))?;

        let key = symmetric.mix_key_and_hash(&ZERO_PSK);
        let encrypted_nothing: [u8; 16] = symmetric
            .encrypt_and_hash(&key, &[])?
            .try_into()
            .map_err(|_| CryptoError::Encryption)?;

        self.symmetric = symmetric;
        self.local_ephemeral = ephemeral;
        self.local_index = local_index;
        self.state = HandshakeState::ResponseCreated;

        Ok(HandshakeResponse {
            sender_index: local_index,
            receiver_index: self.remote_index,
            ephemeral_public,
            encrypted_nothing,
            mac1: [0u8; 16],
            mac2: [0u8; 16],
        })
    }

    /// Consume the response to our initiation
    pub fn consume_response(&mut self, local: &StaticIdentity, msg: &HandshakeResponse) -> Result<()> {
        if self.state != HandshakeState::InitiationCreated {
            return Err(ProtocolError::UnexpectedState.into());
        }
        if msg.receiver_index != self.local_index {
            return Err(ProtocolError::UnknownIndex {
                index: msg.receiver_index,
            }
            .into());
        }

        let mut symmetric = self.symmetric.clone();
        let remote_ephemeral = PublicKey::from_bytes(msg.ephemeral_public);
        symmetric.mix_ephemeral(&msg.ephemeral_public);

        symmetric.mix_chain(&self.local_ephemeral.shared_secret(&remote_ephemeral))?;
        symmetric.mix_chain(&local.private.shared_secret(&remote_ephemeral))?;

        let key = symmetric.mix_key_and_hash(&ZERO_PSK);
        symmetric.decrypt_and_hash(&key, &msg.encrypted_nothing)?;

        self.symmetric = symmetric;
        self.remote_index = msg.sender_index;
        self.state = HandshakeState::ResponseConsumed;
        Ok(())
    }

    /// Derive transport keys from a finished handshake and zero it.
    ///
    /// The caller moves the handshake's index over to the new key-pair.
    pub fn begin_session(&mut self) -> Result<SessionKeys> {
        let is_initiator = match self.state {
            HandshakeState::ResponseConsumed => true,
            HandshakeState::ResponseCreated => false,
            _ => return Err(ProtocolError::UnexpectedState.into()),
        };

        let (send, receive) = self.symmetric.split(is_initiator);
        let keys = SessionKeys {
            send,
            receive,
            is_initiator,
            local_index: self.local_index,
            remote_index: self.remote_index,
        };

        self.reset();
        Ok(keys)
    }

    /// Drop in-flight state; returns the index that was registered for it
    pub fn clear(&mut self) -> Option<u32> {
        let index = self.local_index;
        self.reset();
        (index != 0).then_some(index)
    }

    fn reset(&mut self) {
        self.symmetric.zeroize();
        self.local_ephemeral = PrivateKey::default();
        self.remote_ephemeral = [0u8; 32];
        self.local_index = 0;
        self.state = HandshakeState::Zeroed;
    }
}

impl std::fmt::Debug for Handshake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handshake")
            .field("state", &self.state)
            .field("remote_static", &self.remote_static)
            .field("local_index", &self.local_index)
            .field("remote_index", &self.remote_index)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PointGuardError;
    use std::time::Duration;

    struct Side {
        identity: StaticIdentity,
        handshake: Handshake,
    }

    fn pair() -> (Side, Side) {
        let a = StaticIdentity::new(PrivateKey::generate());
        let b = StaticIdentity::new(PrivateKey::generate());
        let a_hs = Handshake::new(b.public, &a.private);
        let b_hs = Handshake::new(a.public, &b.private);
        (
            Side { identity: a, handshake: a_hs },
            Side { identity: b, handshake: b_hs },
        )
    }

    fn complete(initiator: &mut Side, responder: &mut Side) -> (SessionKeys, SessionKeys) {
        let init = initiator
            .handshake
            .create_initiation(&initiator.identity, 11)
            .unwrap();
        let init = HandshakeInitiation::from_bytes(&init.to_bytes()).unwrap();

        let opened = open_initiation(&responder.identity, &init).unwrap();
        assert_eq!(opened.remote_static(), &initiator.identity.public);
        assert_eq!(opened.sender_index(), 11);
        responder.handshake.consume_initiation(opened).unwrap();

        let resp = responder.handshake.create_response(22).unwrap();
        let resp = HandshakeResponse::from_bytes(&resp.to_bytes()).unwrap();
        initiator
            .handshake
            .consume_response(&initiator.identity, &resp)
            .unwrap();

        (
            initiator.handshake.begin_session().unwrap(),
            responder.handshake.begin_session().unwrap(),
        )
    }

    #[test]
    fn test_key_agreement() {
        let (mut a, mut b) = pair();
        let (ka, kb) = complete(&mut a, &mut b);

        assert_eq!(ka.send, kb.receive);
        assert_eq!(ka.receive, kb.send);
        assert_ne!(ka.send, ka.receive);
        assert!(ka.is_initiator && !kb.is_initiator);
        assert_eq!((ka.local_index, ka.remote_index), (11, 22));
        assert_eq!((kb.local_index, kb.remote_index), (22, 11));

        assert_eq!(a.handshake.state(), HandshakeState::Zeroed);
        assert_eq!(b.handshake.state(), HandshakeState::Zeroed);
        assert_eq!(a.handshake.local_index(), 0);
    }

    #[test]
    fn test_sessions_differ_between_handshakes() {
        let (mut a, mut b) = pair();
        let (first, _) = complete(&mut a, &mut b);
        std::thread::sleep(Duration::from_millis(60));
        let (second, _) = complete(&mut a, &mut b);
        assert_ne!(first.send, second.send);
    }

    #[test]
    fn test_replayed_initiation_is_stale() {
        let (mut a, mut b) = pair();
        let init = a.handshake.create_initiation(&a.identity, 1).unwrap();

        let opened = open_initiation(&b.identity, &init).unwrap();
        b.handshake.consume_initiation(opened).unwrap();

        std::thread::sleep(Duration::from_millis(60));
        let opened = open_initiation(&b.identity, &init).unwrap();
        let err = b.handshake.consume_initiation(opened).unwrap_err();
        assert!(matches!(
            err,
            PointGuardError::Protocol(ProtocolError::StaleTimestamp)
        ));
    }

    #[test]
    fn test_initiation_flood_rejected() {
        let (mut a, mut b) = pair();

        let first = a.handshake.create_initiation(&a.identity, 1).unwrap();
        let opened = open_initiation(&b.identity, &first).unwrap();
        b.handshake.consume_initiation(opened).unwrap();

        let second = a.handshake.create_initiation(&a.identity, 2).unwrap();
        let opened = open_initiation(&b.identity, &second).unwrap();
        let err = b.handshake.consume_initiation(opened).unwrap_err();
        assert!(matches!(
            err,
            PointGuardError::Protocol(ProtocolError::InitiationFlood)
        ));
        // The rejected initiation left the accepted one in place
        assert_eq!(b.handshake.remote_index(), 1);

        std::thread::sleep(Duration::from_millis(60));
        let third = a.handshake.create_initiation(&a.identity, 3).unwrap();
        let opened = open_initiation(&b.identity, &third).unwrap();
        b.handshake.consume_initiation(opened).unwrap();
        assert_eq!(b.handshake.remote_index(), 3);
    }

    #[test]
    fn test_initiation_for_someone_else() {
        let (mut a, _) = pair();
        let stranger = StaticIdentity::new(PrivateKey::generate());
        let init = a.handshake.create_initiation(&a.identity, 1).unwrap();
        assert!(open_initiation(&stranger, &init).is_err());
    }

    #[test]
    fn test_initiation_from_unknown_peer() {
        let (_, mut b) = pair();
        let mallory = StaticIdentity::new(PrivateKey::generate());
        let mut mallory_hs = Handshake::new(b.identity.public, &mallory.private);

        let init = mallory_hs.create_initiation(&mallory, 1).unwrap();
        let opened = open_initiation(&b.identity, &init).unwrap();
        assert!(b.handshake.consume_initiation(opened).is_err());
        assert_eq!(b.handshake.state(), HandshakeState::Zeroed);
    }

    #[test]
    fn test_no_private_key() {
        let remote = PrivateKey::generate().public_key();
        let unset = StaticIdentity::default();
        let mut handshake = Handshake::new(remote, &unset.private);

        let err = handshake.create_initiation(&unset, 1).unwrap_err();
        assert!(matches!(
            err,
            PointGuardError::Protocol(ProtocolError::NoPrivateKey)
        ));
        assert_eq!(handshake.state(), HandshakeState::Zeroed);
    }

    #[test]
    fn test_out_of_order_operations() {
        let (mut a, mut b) = pair();
        assert!(b.handshake.create_response(5).is_err());
        assert!(a.handshake.begin_session().is_err());

        let resp = HandshakeResponse {
            sender_index: 1,
            receiver_index: 2,
            ephemeral_public: [9u8; 32],
            encrypted_nothing: [0u8; 16],
            mac1: [0u8; 16],
            mac2: [0u8; 16],
        };
        assert!(a.handshake.consume_response(&a.identity, &resp).is_err());
    }

    #[test]
    fn test_response_with_wrong_index() {
        let (mut a, mut b) = pair();
        let init = a.handshake.create_initiation(&a.identity, 7).unwrap();
        let opened = open_initiation(&b.identity, &init).unwrap();
        b.handshake.consume_initiation(opened).unwrap();

        let mut resp = b.handshake.create_response(8).unwrap();
        resp.receiver_index = 99;
        assert!(a.handshake.consume_response(&a.identity, &resp).is_err());
        assert_eq!(a.handshake.state(), HandshakeState::InitiationCreated);
    }

    #[test]
    fn test_clear_returns_index() {
        let (mut a, _) = pair();
        assert_eq!(a.handshake.clear(), None);
        a.handshake.create_initiation(&a.identity, 42).unwrap();
        assert_eq!(a.handshake.clear(), Some(42));
        assert_eq!(a.handshake.state(), HandshakeState::Zeroed);
    }
}
