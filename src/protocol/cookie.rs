//! Cookie mechanism for DoS protection
//!
//! MAC1 is keyed by the receiver's static public key and is checked on every
//! handshake message. Under load a receiver additionally demands MAC2, keyed
//! by a cookie bound to the sender's address; senders without one get an
//! encrypted Cookie Reply instead of a handshake.

use std::net::{IpAddr, SocketAddr};
use std::time::Instant;

use rand::{rngs::OsRng, RngCore};
use subtle::ConstantTimeEq;

use super::constants::COOKIE_REFRESH_TIME;
use super::messages::{mac_offsets, message_type, CookieReply};
use crate::crypto::blake2s::{self, MAC_LEN};
use crate::crypto::{aead, noise, PublicKey};
use crate::error::{CryptoError, PointGuardError, ProtocolError};

fn source_bytes(src: &SocketAddr) -> Vec<u8> {
    let mut out = match src.ip() {
        IpAddr::V4(ip) => ip.octets().to_vec(),
        IpAddr::V6(ip) => ip.octets().to_vec(),
    };
    out.extend_from_slice(&src.port().to_le_bytes());
    out
}

/// Offsets of MAC1/MAC2 for a handshake message, if it carries them
fn offsets(msg: &[u8]) -> Option<(usize, usize)> {
    let (mac1, mac2) = mac_offsets(message_type(msg).ok()?)?;
    (msg.len() == mac2 + MAC_LEN).then_some((mac1, mac2))
}

/// Receiver-side verification keyed by our own static public key
pub struct CookieChecker {
    mac1_key: [u8; 32],
    encryption_key: [u8; 32],
    secret: [u8; 32],
    secret_set: Option<Instant>,
}

impl CookieChecker {
    pub fn new(local_public: &PublicKey) -> Self {
        Self {
            mac1_key: noise::mac1_key(local_public.as_bytes()),
            encryption_key: noise::cookie_key(local_public.as_bytes()),
            secret: [0u8; 32],
            secret_set: None,
        }
    }

    /// MAC1 over the message prefix must match
    pub fn check_mac1(&self, msg: &[u8]) -> bool {
        let Some((mac1, mac2)) = offsets(msg) else {
            return false;
        };
        let expected = blake2s::mac(&self.mac1_key, &msg[..mac1]);
        expected.ct_eq(&msg[mac1..mac2]).into()
    }

    /// MAC2 must be keyed with the current cookie for `src`
    pub fn check_mac2(&self, msg: &[u8], src: &SocketAddr) -> bool {
        let Some((_, mac2)) = offsets(msg) else {
            return false;
        };
        if !self.secret_is_fresh() {
            return false;
        }
        let cookie = self.cookie_for(src);
        let expected = blake2s::mac(&cookie, &msg[..mac2]);
        expected.ct_eq(&msg[mac2..]).into()
    }

    /// Build a Cookie Reply for a handshake message from `src`.
    ///
    /// `receiver_index` is the sender index of the triggering message.
    pub fn create_reply(
        &mut self,
        msg: &[u8],
        receiver_index: u32,
        src: &SocketAddr,
    ) -> Result<CookieReply, PointGuardError> {
        let (mac1, mac2) = offsets(msg).ok_or(ProtocolError::MacVerificationFailed)?;

        if !self.secret_is_fresh() {
            OsRng.fill_bytes(&mut self.secret);
            self.secret_set = Some(Instant::now());
        }

        let cookie = self.cookie_for(src);
        let mut nonce = [0u8; aead::XNONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let sealed = aead::xencrypt(&self.encryption_key, &nonce, &cookie, &msg[mac1..mac2])?;
        let encrypted_cookie: [u8; 32] = sealed.try_into().map_err(|_| CryptoError::Encryption)?;

        Ok(CookieReply {
            receiver_index,
            nonce,
            encrypted_cookie,
        })
    }

    fn secret_is_fresh(&self) -> bool {
        self.secret_set
            .is_some_and(|set| set.elapsed() <= COOKIE_REFRESH_TIME)
    }

    fn cookie_for(&self, src: &SocketAddr) -> [u8; MAC_LEN] {
        blake2s::mac(&self.secret, &source_bytes(src))
    }
}

/// Sender-side MAC generation keyed by the peer's static public key
pub struct CookieGenerator {
    mac1_key: [u8; 32],
    encryption_key: [u8; 32],
    cookie: [u8; MAC_LEN],
    cookie_set: Option<Instant>,
    last_mac1: Option<[u8; MAC_LEN]>,
}

impl CookieGenerator {
    pub fn new(remote_public: &PublicKey) -> Self {
        Self {
            mac1_key: noise::mac1_key(remote_public.as_bytes()),
            encryption_key: noise::cookie_key(remote_public.as_bytes()),
            cookie: [0u8; MAC_LEN],
            cookie_set: None,
            last_mac1: None,
        }
    }

    /// Fill MAC1 (always) and MAC2 (only with a fresh cookie) in place
    pub fn add_macs(&mut self, msg: &mut [u8]) {
        let Some((mac1, mac2)) = offsets(msg) else {
            return;
        };

        let tag = blake2s::mac(&self.mac1_key, &msg[..mac1]);
        msg[mac1..mac2].copy_from_slice(&tag);
        self.last_mac1 = Some(tag);

        let fresh = self
            .cookie_set
            .is_some_and(|set| set.elapsed() <= COOKIE_REFRESH_TIME);
        let tag = if fresh {
            blake2s::mac(&self.cookie, &msg[..mac2])
        } else {
            [0u8; MAC_LEN]
        };
        msg[mac2..].copy_from_slice(&tag);
    }

    /// Accept a Cookie Reply bound to the MAC1 we last sent
    pub fn consume_reply(&mut self, reply: &CookieReply) -> Result<(), PointGuardError> {
        let last_mac1 = self.last_mac1.ok_or(ProtocolError::MacVerificationFailed)?;
        let cookie = aead::xdecrypt(
            &self.encryption_key,
            &reply.nonce,
            &reply.encrypted_cookie,
            &last_mac1,
        )?;

        self.cookie = cookie.try_into().map_err(|_| CryptoError::Decryption)?;
        self.cookie_set = Some(Instant::now());

        tracing::debug!("Stored new cookie (valid for {}s)", COOKIE_REFRESH_TIME.as_secs());
        Ok(())
    }

    pub fn has_cookie(&self) -> bool {
        self.cookie_set
            .is_some_and(|set| set.elapsed() <= COOKIE_REFRESH_TIME)
    }
}
