//! Noise IKpsk2 symmetric state
//!
//! Pattern: Noise_IKpsk2_25519_ChaChaPoly_BLAKE2s. The chaining key and
//! transcript hash are the only state that survives between messages.

use zeroize::Zeroize;

use super::{aead, blake2s};
use crate::error::CryptoError;

/// Noise protocol construction string
pub const CONSTRUCTION: &[u8] = b"Noise_IKpsk2_25519_ChaChaPoly_BLAKE2s";

/// WireGuard identifier string
pub const IDENTIFIER: &[u8] = b"WireGuard v1 zx2c4 Jason@zx2c4.com";

/// Label for MAC1 key derivation
pub const LABEL_MAC1: &[u8] = b"mac1----";

/// Label for cookie key derivation
pub const LABEL_COOKIE: &[u8] = b"cookie--";

/// Hash length (also chaining key length)
pub const HASH_LEN: usize = 32;

/// Chaining key and transcript hash of an in-flight handshake
#[derive(Clone, Default, Zeroize)]
pub struct SymmetricState {
    pub chaining_key: [u8; HASH_LEN],
    pub hash: [u8; HASH_LEN],
}

impl SymmetricState {
    /// Ci := HASH(CONSTRUCTION)
    pub fn initial_chain_key() -> [u8; HASH_LEN] {
        blake2s::hash(CONSTRUCTION)
    }

    /// Hi := HASH(HASH(Ci || IDENTIFIER) || responder_static)
    pub fn initial_hash(responder_static: &[u8; 32]) -> [u8; HASH_LEN] {
        let h = blake2s::hash_two(&Self::initial_chain_key(), IDENTIFIER);
        blake2s::hash_two(&h, responder_static)
    }

    /// Both sides start from the responder's static public key.
    pub fn new(responder_static: &[u8; 32]) -> Self {
        Self {
            chaining_key: Self::initial_chain_key(),
            hash: Self::initial_hash(responder_static),
        }
    }

    /// h = HASH(h || data)
    pub fn mix_hash(&mut self, data: &[u8]) {
        self.hash = blake2s::hash_two(&self.hash, data);
    }

    /// ck = KDF1(ck, ephemeral); h = HASH(h || ephemeral)
    pub fn mix_ephemeral(&mut self, ephemeral_public: &[u8; 32]) {
        self.chaining_key = blake2s::kdf1(&self.chaining_key, ephemeral_public);
        self.mix_hash(ephemeral_public);
    }

    /// (ck, k) = KDF2(ck, input); returns k
    pub fn mix_key(&mut self, input: &[u8]) -> Result<[u8; 32], CryptoError> {
        if input.iter().all(|&b| b == 0) {
            return Err(CryptoError::DiffieHellman);
        }
        let (chaining_key, key) = blake2s::kdf2(&self.chaining_key, input);
        self.chaining_key = chaining_key;
        Ok(key)
    }

    /// ck = KDF1(ck, input), for DH results whose key output is unused
    pub fn mix_chain(&mut self, input: &[u8; 32]) -> Result<(), CryptoError> {
        if input.iter().all(|&b| b == 0) {
            return Err(CryptoError::DiffieHellman);
        }
        self.chaining_key = blake2s::kdf1(&self.chaining_key, input);
        Ok(())
    }

    /// (ck, t, k) = KDF3(ck, psk); h = HASH(h || t); returns k
    pub fn mix_key_and_hash(&mut self, psk: &[u8; 32]) -> [u8; 32] {
        let (chaining_key, tau, key) = blake2s::kdf3(&self.chaining_key, psk);
        self.chaining_key = chaining_key;
        self.mix_hash(&tau);
        key
    }

    /// c = AEAD(k, 0, plaintext, h); h = HASH(h || c)
    pub fn encrypt_and_hash(
        &mut self,
        key: &[u8; 32],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let ciphertext = aead::encrypt(key, 0, plaintext, &self.hash)?;
        self.mix_hash(&ciphertext);
        Ok(ciphertext)
    }

    /// p = AEAD-Open(k, 0, c, h); h = HASH(h || c)
    pub fn decrypt_and_hash(
        &mut self,
        key: &[u8; 32],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let plaintext = aead::decrypt(key, 0, ciphertext, &self.hash)?;
        self.mix_hash(ciphertext);
        Ok(plaintext)
    }

    /// Transport keys from the final chaining key: (send, receive)
    pub fn split(&self, initiator: bool) -> ([u8; 32], [u8; 32]) {
        let (first, second) = blake2s::kdf2(&self.chaining_key, &[]);
        if initiator {
            (first, second)
        } else {
            (second, first)
        }
    }
}

/// HASH(LABEL_MAC1 || static_public)
pub fn mac1_key(static_public: &[u8; 32]) -> [u8; 32] {
    blake2s::hash_two(LABEL_MAC1, static_public)
}

/// HASH(LABEL_COOKIE || static_public)
pub fn cookie_key(static_public: &[u8; 32]) -> [u8; 32] {
    blake2s::hash_two(LABEL_COOKIE, static_public)
}
