//! BLAKE2s primitives: HASH, keyed MAC, HMAC and the KDF chain
//!
//! Every derivation in the handshake funnels through `kdf1`/`kdf2`/`kdf3`,
//! which are HMAC-BLAKE2s based HKDF expansions with 32-byte outputs.

use blake2::{
    digest::{consts::U16, FixedOutput, Mac as MacTrait, Update},
    Blake2s256, Blake2sMac, Digest,
};
use hmac::digest::{generic_array::GenericArray, KeyInit};
use hmac::SimpleHmac;

/// HMAC-BLAKE2s (RFC 2104 construction)
type HmacBlake2s = SimpleHmac<Blake2s256>;

/// Length of BLAKE2s-256 hash output
pub const HASH_LEN: usize = 32;

/// Length of BLAKE2s MAC output
pub const MAC_LEN: usize = 16;

/// BLAKE2s-256 hash of a single input
pub fn hash(data: &[u8]) -> [u8; HASH_LEN] {
    let mut hasher = Blake2s256::new();
    Digest::update(&mut hasher, data);
    hasher.finalize().into()
}

/// HASH(a || b)
pub fn hash_two(a: &[u8], b: &[u8]) -> [u8; HASH_LEN] {
    let mut hasher = Blake2s256::new();
    Digest::update(&mut hasher, a);
    Digest::update(&mut hasher, b);
    hasher.finalize().into()
}

/// Keyed BLAKE2s with a 16-byte output.
///
/// MAC1 is keyed with a 32-byte hash, MAC2 and cookies with a 16-byte
/// cookie or secret, so the key is taken as a slice (1..=32 bytes).
pub fn mac(key: &[u8], data: &[u8]) -> [u8; MAC_LEN] {
    let mut mac = <Blake2sMac<U16> as KeyInit>::new_from_slice(key).expect("mac key is 1..=32 bytes");
    MacTrait::update(&mut mac, data);
    mac.finalize_fixed().into()
}

/// HMAC-BLAKE2s
pub fn hmac(key: &[u8; HASH_LEN], data: &[u8]) -> [u8; HASH_LEN] {
    // HMAC zero-pads keys shorter than the block size.
    let mut block = [0u8; 64];
    block[..HASH_LEN].copy_from_slice(key);
    let mut mac = <HmacBlake2s as KeyInit>::new(GenericArray::from_slice(&block));
    Update::update(&mut mac, data);
    mac.finalize_fixed().into()
}

/// KDF1: one 32-byte output
pub fn kdf1(key: &[u8; HASH_LEN], input: &[u8]) -> [u8; HASH_LEN] {
    let prk = hmac(key, input);
    hmac(&prk, &[0x01])
}

/// KDF2: two 32-byte outputs
pub fn kdf2(key: &[u8; HASH_LEN], input: &[u8]) -> ([u8; HASH_LEN], [u8; HASH_LEN]) {
    let prk = hmac(key, input);
    let t1 = hmac(&prk, &[0x01]);
    let t2 = hmac(&prk, &expand_input(&t1, 0x02));
    (t1, t2)
}

/// KDF3: three 32-byte outputs
pub fn kdf3(
    key: &[u8; HASH_LEN],
    input: &[u8],
) -> ([u8; HASH_LEN], [u8; HASH_LEN], [u8; HASH_LEN]) {
    let prk = hmac(key, input);
    let t1 = hmac(&prk, &[0x01]);
    let t2 = hmac(&prk, &expand_input(&t1, 0x02));
    let t3 = hmac(&prk, &expand_input(&t2, 0x03));
    (t1, t2, t3)
}

/// T(n-1) || n
fn expand_input(previous: &[u8; HASH_LEN], counter: u8) -> [u8; HASH_LEN + 1] {
    let mut input = [0u8; HASH_LEN + 1];
    input[..HASH_LEN].copy_from_slice(previous);
    input[HASH_LEN] = counter;
    input
}
