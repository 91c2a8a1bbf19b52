//! WireGuard protocol implementation
//!
//! This module contains the core protocol components:
//! - Message wire formats
//! - Handshake logic (Noise IKpsk2)
//! - Cookie/DoS protection
//! - Transport key-pairs and replay protection

pub mod constants;
pub mod cookie;
pub mod handshake;
pub mod keypair;
pub mod messages;
pub mod replay;

pub use cookie::{CookieChecker, CookieGenerator};
pub use handshake::{open_initiation, Handshake, HandshakeState, SessionKeys, StaticIdentity};
pub use keypair::{KeyPair, KeyPairs};
pub use messages::{
    CookieReply, HandshakeInitiation, HandshakeResponse, MessageType, TransportHeader,
};
pub use replay::ReplayFilter;
