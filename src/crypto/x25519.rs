//! X25519 Diffie-Hellman
//!
//! Key generation and DH operations using Curve25519.

use rand::{rngs::OsRng, RngCore};
use x25519_dalek::{PublicKey, StaticSecret};

/// Key length for X25519 (both private and public keys are 32 bytes)
pub const KEY_LEN: usize = 32;

/// Clamp a scalar the way Curve25519 private keys are stored on disk
pub fn clamp(mut private: [u8; KEY_LEN]) -> [u8; KEY_LEN] {
    private[0] &= 248;
    private[31] &= 127;
    private[31] |= 64;
    private
}

/// Generate a new X25519 keypair with a clamped private key.
///
/// Returns (private_key, public_key)
pub fn generate_keypair() -> ([u8; KEY_LEN], [u8; KEY_LEN]) {
    let mut private = [0u8; KEY_LEN];
    OsRng.fill_bytes(&mut private);
    let private = clamp(private);
    (private, public_key(&private))
}

/// Derive public key from private key
pub fn public_key(private_key: &[u8; KEY_LEN]) -> [u8; KEY_LEN] {
    let secret = StaticSecret::from(*private_key);
    PublicKey::from(&secret).to_bytes()
}

/// Perform X25519 Diffie-Hellman key exchange
pub fn dh(private_key: &[u8; KEY_LEN], public_key: &[u8; KEY_LEN]) -> [u8; KEY_LEN] {
    let secret = StaticSecret::from(*private_key);
    let public = PublicKey::from(*public_key);
    secret.diffie_hellman(&public).to_bytes()
}
