//! Fixed-size key material
//!
//! All keys are 32 bytes. The all-zero value means "unset", and comparisons
//! go through `subtle` so they do not leak timing.

use std::fmt;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::x25519;
use crate::error::ConfigError;

/// Length of every key type
pub const KEY_LEN: usize = 32;

macro_rules! key_common {
    ($name:ident) => {
        impl $name {
            pub const fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
                Self(bytes)
            }

            pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
                &self.0
            }

            /// Constant-time check for the unset value
            pub fn is_zero(&self) -> bool {
                self.0.ct_eq(&[0u8; KEY_LEN]).into()
            }

            /// Parse a key from base64 (standard alphabet) or 64 hex digits
            pub fn parse(value: &str, field: &str) -> Result<Self, ConfigError> {
                decode_key(value, field).map(Self)
            }

            pub fn to_base64(&self) -> String {
                BASE64.encode(self.0)
            }
        }

        impl PartialEq for $name {
            fn eq(&self, other: &Self) -> bool {
                self.0.ct_eq(&other.0).into()
            }
        }

        impl Eq for $name {}
    };
}

/// Curve25519 private key, erased on drop
#[derive(Clone, Default, Zeroize, ZeroizeOnDrop)]
pub struct PrivateKey([u8; KEY_LEN]);

/// Curve25519 public key
#[derive(Clone, Copy, Default)]
pub struct PublicKey([u8; KEY_LEN]);

/// Symmetric key (pre-shared key slot), erased on drop
#[derive(Clone, Default, Zeroize, ZeroizeOnDrop)]
pub struct SymmetricKey([u8; KEY_LEN]);

key_common!(PrivateKey);
key_common!(PublicKey);
key_common!(SymmetricKey);

impl PrivateKey {
    /// Generate a fresh clamped private key
    pub fn generate() -> Self {
        Self(x25519::generate_keypair().0)
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey(x25519::public_key(&self.0))
    }

    /// DH(self, public). Zero when `public` is a low-order point.
    pub fn shared_secret(&self, public: &PublicKey) -> [u8; KEY_LEN] {
        x25519::dh(&self.0, &public.0)
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PrivateKey(..)")
    }
}

impl fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SymmetricKey(..)")
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.to_base64())
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form, the way peers are usually named in logs
        let encoded = self.to_base64();
        write!(f, "{}…", &encoded[..8])
    }
}

fn decode_key(value: &str, field: &str) -> Result<[u8; KEY_LEN], ConfigError> {
    let value = value.trim();
    let invalid = || ConfigError::InvalidKey {
        field: field.to_string(),
    };

    let bytes = if value.len() == KEY_LEN * 2 {
        hex::decode(value).map_err(|_| invalid())?
    } else {
        BASE64.decode(value).map_err(|_| invalid())?
    };

    bytes.try_into().map_err(|_| invalid())
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY_B64: &str = "UOvtcWdILFwjb1UnsnK+a9lcqYvNTmtPv+fvqIVOz3w=";

    #[test]
    fn test_parse_base64_and_hex_agree() {
        let from_b64 = PublicKey::parse(KEY_B64, "their_public").unwrap();
        let hex_form = hex::encode(from_b64.as_bytes());
        let from_hex = PublicKey::parse(&hex_form, "their_public").unwrap();

        assert_eq!(from_b64, from_hex);
        assert_eq!(from_b64.to_base64(), KEY_B64);
    }

    #[test]
    fn test_parse_rejects_wrong_length() {
        assert!(PublicKey::parse("dG9vIHNob3J0", "their_public").is_err());
        assert!(PrivateKey::parse("not base64 at all!", "own_private").is_err());
    }

    #[test]
    fn test_zero_sentinel() {
        assert!(PublicKey::default().is_zero());
        assert!(!PrivateKey::generate().public_key().is_zero());
    }

    #[test]
    fn test_shared_secret_symmetry() {
        let a = PrivateKey::generate();
        let b = PrivateKey::generate();
        assert_eq!(
            a.shared_secret(&b.public_key()),
            b.shared_secret(&a.public_key())
        );
    }

    #[test]
    fn test_private_key_debug_is_redacted() {
        let key = PrivateKey::generate();
        assert_eq!(format!("{:?}", key), "PrivateKey(..)");
    }
}
