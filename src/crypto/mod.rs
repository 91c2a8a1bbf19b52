//! Cryptographic primitives
//!
//! - BLAKE2s hashing, MACs and key derivation (blake2s)
//! - ChaCha20-Poly1305 / XChaCha20-Poly1305 AEAD (aead)
//! - X25519 Diffie-Hellman (x25519)
//! - Noise IKpsk2 symmetric state (noise)
//! - Typed 32-byte key material (keys)

pub mod aead;
pub mod blake2s;
pub mod keys;
pub mod noise;
pub mod x25519;

pub use keys::{PrivateKey, PublicKey, SymmetricKey};
