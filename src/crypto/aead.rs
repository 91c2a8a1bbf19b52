//! AEAD encryption
//!
//! ChaCha20-Poly1305 for handshake fields and transport data,
//! XChaCha20-Poly1305 for cookie replies.

use chacha20poly1305::{
    aead::{Aead, AeadInPlace, KeyInit, Payload},
    ChaCha20Poly1305, Key, Nonce, Tag, XChaCha20Poly1305, XNonce,
};

use crate::error::CryptoError;

/// Authentication tag length
pub const TAG_LEN: usize = 16;

/// ChaCha20-Poly1305 key length
pub const KEY_LEN: usize = 32;

/// ChaCha20-Poly1305 nonce length
pub const NONCE_LEN: usize = 12;

/// XChaCha20-Poly1305 nonce length
pub const XNONCE_LEN: usize = 24;

/// 4 zero bytes followed by the 64-bit counter, little-endian
fn counter_nonce(counter: u64) -> Nonce {
    let mut nonce_bytes = [0u8; NONCE_LEN];
    nonce_bytes[4..12].copy_from_slice(&counter.to_le_bytes());
    Nonce::from(nonce_bytes)
}

/// Encrypt plaintext using ChaCha20-Poly1305
pub fn encrypt(
    key: &[u8; KEY_LEN],
    counter: u64,
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .encrypt(
            &counter_nonce(counter),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| CryptoError::Encryption)
}

/// Decrypt ciphertext using ChaCha20-Poly1305
pub fn decrypt(
    key: &[u8; KEY_LEN],
    counter: u64,
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if ciphertext.len() < TAG_LEN {
        return Err(CryptoError::Decryption);
    }

    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .decrypt(
            &counter_nonce(counter),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| CryptoError::Decryption)
}

/// Encrypt using XChaCha20-Poly1305 (cookie replies)
pub fn xencrypt(
    key: &[u8; KEY_LEN],
    nonce: &[u8; XNONCE_LEN],
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .encrypt(
            XNonce::from_slice(nonce),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| CryptoError::Encryption)
}

/// Decrypt using XChaCha20-Poly1305 (cookie replies)
pub fn xdecrypt(
    key: &[u8; KEY_LEN],
    nonce: &[u8; XNONCE_LEN],
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if ciphertext.len() < TAG_LEN {
        return Err(CryptoError::Decryption);
    }

    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .decrypt(
            XNonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| CryptoError::Decryption)
}

/// A prepared transport AEAD context for one direction of a key-pair.
///
/// Works in place on a buffer: `seal` appends the tag, `open` verifies and
/// strips it. Transport messages carry no associated data.
#[derive(Clone)]
pub struct TransportCipher {
    cipher: ChaCha20Poly1305,
}

impl TransportCipher {
    pub fn new(key: &[u8; KEY_LEN]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(key)),
        }
    }

    /// Encrypt `buffer` in place and append the tag
    pub fn seal(&self, counter: u64, buffer: &mut Vec<u8>) -> Result<(), CryptoError> {
        let tag = self
            .cipher
            .encrypt_in_place_detached(&counter_nonce(counter), &[], buffer)
            .map_err(|_| CryptoError::Encryption)?;
        buffer.extend_from_slice(&tag);
        Ok(())
    }

    /// Verify and decrypt `buffer` (ciphertext || tag) in place.
    ///
    /// Returns the plaintext length; the buffer is left unchanged beyond
    /// that length on success and must be discarded on failure.
    pub fn open(&self, counter: u64, buffer: &mut [u8]) -> Result<usize, CryptoError> {
        if buffer.len() < TAG_LEN {
            return Err(CryptoError::Decryption);
        }
        let plain_len = buffer.len() - TAG_LEN;
        let (data, tag) = buffer.split_at_mut(plain_len);
        let tag = Tag::clone_from_slice(tag);
        self.cipher
            .decrypt_in_place_detached(&counter_nonce(counter), &[], data, &tag)
            .map_err(|_| CryptoError::Decryption)?;
        Ok(plain_len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let key = [0u8; 32];
        let plaintext = b"Hello, WireGuard!";
        let aad = b"additional data";

        let ciphertext = encrypt(&key, 42, plaintext, aad).unwrap();
        assert_eq!(ciphertext.len(), plaintext.len() + TAG_LEN);

        let decrypted = decrypt(&key, 42, &ciphertext, aad).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn test_decrypt_wrong_counter_or_aad() {
        let key = [0u8; 32];
        let ciphertext = encrypt(&key, 42, b"payload", b"aad").unwrap();

        assert!(decrypt(&key, 43, &ciphertext, b"aad").is_err());
        assert!(decrypt(&key, 42, &ciphertext, b"other").is_err());
        assert!(decrypt(&[1u8; 32], 42, &ciphertext, b"aad").is_err());
    }

    #[test]
    fn test_xchacha_roundtrip() {
        let key = [3u8; 32];
        let nonce = [9u8; 24];

        let ciphertext = xencrypt(&key, &nonce, b"cookie bytes 16!", b"mac1").unwrap();
        assert_eq!(ciphertext.len(), 32);
        let decrypted = xdecrypt(&key, &nonce, &ciphertext, b"mac1").unwrap();
        assert_eq!(decrypted, b"cookie bytes 16!");
    }

    #[test]
    fn test_transport_cipher_matches_detached_api() {
        let key = [5u8; 32];
        let cipher = TransportCipher::new(&key);

        let mut buffer = b"ip packet".to_vec();
        cipher.seal(7, &mut buffer).unwrap();
        assert_eq!(buffer, encrypt(&key, 7, b"ip packet", &[]).unwrap());

        let len = cipher.open(7, &mut buffer).unwrap();
        assert_eq!(&buffer[..len], b"ip packet");
    }

    #[test]
    fn test_transport_cipher_rejects_tampering() {
        let cipher = TransportCipher::new(&[5u8; 32]);
        let mut buffer = vec![0u8; 32];
        cipher.seal(1, &mut buffer).unwrap();

        buffer[0] ^= 1;
        assert!(cipher.open(1, &mut buffer).is_err());
        assert!(cipher.open(1, &mut [0u8; 8]).is_err());
    }
}
