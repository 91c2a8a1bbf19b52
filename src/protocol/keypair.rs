//! Transport key-pairs and the per-peer current/previous/next set

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::constants::{REJECT_AFTER_MESSAGES, REJECT_AFTER_TIME};
use super::handshake::SessionKeys;
use super::replay::ReplayFilter;
use crate::crypto::aead::TransportCipher;
use crate::error::{CryptoError, ProtocolError};

/// Confirmed symmetric session keys produced by one handshake
pub struct KeyPair {
    send: TransportCipher,
    receive: TransportCipher,
    send_nonce: AtomicU64,
    /// Set once the peer has proven it holds the same keys
    confirmed: AtomicBool,
    replay_filter: Mutex<ReplayFilter>,
    pub created: Instant,
    pub is_initiator: bool,
    pub local_index: u32,
    pub remote_index: u32,
}

impl KeyPair {
    pub fn new(keys: &SessionKeys) -> Self {
        Self {
            send: TransportCipher::new(&keys.send),
            receive: TransportCipher::new(&keys.receive),
            send_nonce: AtomicU64::new(0),
            confirmed: AtomicBool::new(keys.is_initiator),
            replay_filter: Mutex::new(ReplayFilter::new()),
            created: Instant::now(),
            is_initiator: keys.is_initiator,
            local_index: keys.local_index,
            remote_index: keys.remote_index,
        }
    }

    pub fn age(&self) -> Duration {
        self.created.elapsed()
    }

    /// Past the hard reject time; must not be used in either direction
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Instant::now())
    }

    pub fn is_expired_at(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.created) >= REJECT_AFTER_TIME
    }

    /// Nonce the next send would use, without claiming it
    pub fn peek_nonce(&self) -> u64 {
        self.send_nonce.load(Ordering::Relaxed)
    }

    /// Claim the next send nonce. `None` once the message limit is reached.
    pub fn next_nonce(&self) -> Option<u64> {
        let nonce = self.send_nonce.fetch_add(1, Ordering::Relaxed);
        if nonce >= REJECT_AFTER_MESSAGES {
            self.send_nonce.store(REJECT_AFTER_MESSAGES, Ordering::Relaxed);
            return None;
        }
        Some(nonce)
    }

    /// Encrypt a padded plaintext in place under `nonce`
    pub fn seal(&self, nonce: u64, buffer: &mut Vec<u8>) -> Result<(), CryptoError> {
        self.send.seal(nonce, buffer)
    }

    /// Decrypt `ciphertext || tag` in place; returns the plaintext length.
    ///
    /// Expired key-pairs never decrypt, whatever the counter.
    pub fn open(&self, counter: u64, buffer: &mut [u8]) -> Result<usize, ProtocolError> {
        self.open_at(Instant::now(), counter, buffer)
    }

    pub(crate) fn open_at(
        &self,
        now: Instant,
        counter: u64,
        buffer: &mut [u8],
    ) -> Result<usize, ProtocolError> {
        if self.is_expired_at(now) {
            return Err(ProtocolError::SessionExpired);
        }
        self.receive
            .open(counter, buffer)
            .map_err(|_| ProtocolError::MacVerificationFailed)
    }

    /// Mark the key-pair confirmed. True only for the call that did it.
    ///
    /// Initiator key-pairs start confirmed; a responder's is confirmed by
    /// the first transport message that decrypts under it.
    pub fn confirm(&self) -> bool {
        !self.confirmed.swap(true, Ordering::AcqRel)
    }

    /// Record `counter` as received; false for replays and stale counters
    pub fn validate_counter(&self, counter: u64) -> bool {
        self.replay_filter.lock().validate(counter)
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("local_index", &self.local_index)
            .field("remote_index", &self.remote_index)
            .field("is_initiator", &self.is_initiator)
            .finish()
    }
}

/// At most three live key-pairs per peer
#[derive(Default)]
pub struct KeyPairs {
    pub current: Option<Arc<KeyPair>>,
    pub previous: Option<Arc<KeyPair>>,
    pub next: Option<Arc<KeyPair>>,
}

impl KeyPairs {
    /// Install a freshly derived key-pair.
    ///
    /// The initiator already has confirmation (it consumed a response), so it
    /// rotates straight into `current`. The responder parks the key-pair in
    /// `next` until the first transport message decrypts under it, unless no
    /// session exists yet. Returns the key-pairs that fell out of the set.
    pub fn install(&mut self, keypair: Arc<KeyPair>) -> Vec<Arc<KeyPair>> {
        let mut evicted = Vec::new();
        if keypair.is_initiator || self.current.is_none() {
            evicted.extend(self.next.take());
            evicted.extend(self.previous.take());
            self.previous = self.current.take();
            self.current = Some(keypair);
        } else {
            evicted.extend(self.next.replace(keypair));
        }
        evicted
    }

    /// Promote `next` to `current` if `received_on` is the pending key-pair.
    ///
    /// Returns `None` when no promotion happened, otherwise the evicted
    /// `previous` (if any).
    pub fn promote(&mut self, received_on: &Arc<KeyPair>) -> Option<Option<Arc<KeyPair>>> {
        if !self.is_next(received_on) {
            return None;
        }
        let evicted = self.previous.take();
        self.previous = self.current.take();
        self.current = self.next.take();
        Some(evicted)
    }

    /// Remove every key-pair, returning them for index release
    pub fn clear(&mut self) -> Vec<Arc<KeyPair>> {
        [self.current.take(), self.previous.take(), self.next.take()]
            .into_iter()
            .flatten()
            .collect()
    }

    pub fn is_next(&self, keypair: &Arc<KeyPair>) -> bool {
        matches!(&self.next, Some(next) if Arc::ptr_eq(next, keypair))
    }

    pub fn len(&self) -> usize {
        [&self.current, &self.previous, &self.next]
            .iter()
            .filter(|slot| slot.is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(local_index: u32, is_initiator: bool) -> SessionKeys {
        SessionKeys {
            send: [1u8; 32],
            receive: [1u8; 32],
            is_initiator,
            local_index,
            remote_index: local_index + 1000,
        }
    }

    #[test]
    fn test_seal_open_roundtrip() {
        let keypair = KeyPair::new(&keys(1, true));
        let nonce = keypair.next_nonce().unwrap();

        let mut buffer = b"sixteen byte pkt".to_vec();
        keypair.seal(nonce, &mut buffer).unwrap();
        let len = keypair.open(nonce, &mut buffer).unwrap();

        assert_eq!(&buffer[..len], b"sixteen byte pkt");
        assert!(keypair.validate_counter(nonce));
        assert!(!keypair.validate_counter(nonce));
    }

    #[test]
    fn test_expired_keypair_never_decrypts() {
        let keypair = KeyPair::new(&keys(1, true));
        let later = keypair.created + REJECT_AFTER_TIME + Duration::from_secs(1);

        for counter in [0u64, 1, 1000, REJECT_AFTER_MESSAGES - 1] {
            let mut buffer = Vec::new();
            keypair.seal(counter, &mut buffer).unwrap();
            assert!(matches!(
                keypair.open_at(later, counter, &mut buffer.clone()),
                Err(ProtocolError::SessionExpired)
            ));
            assert!(keypair.open(counter, &mut buffer).is_ok());
        }
    }

    #[test]
    fn test_nonce_exhaustion() {
        let keypair = KeyPair::new(&keys(1, true));
        keypair
            .send_nonce
            .store(REJECT_AFTER_MESSAGES - 1, Ordering::Relaxed);

        assert_eq!(keypair.next_nonce(), Some(REJECT_AFTER_MESSAGES - 1));
        assert_eq!(keypair.next_nonce(), None);
        assert_eq!(keypair.next_nonce(), None);
    }

    #[test]
    fn test_responder_parks_in_next_until_promoted() {
        let mut set = KeyPairs::default();

        let first = Arc::new(KeyPair::new(&keys(1, false)));
        assert!(set.install(first.clone()).is_empty());
        assert!(set.current.is_some() && set.next.is_none());

        let second = Arc::new(KeyPair::new(&keys(2, false)));
        assert!(set.install(second.clone()).is_empty());
        assert!(set.is_next(&second));

        // Receiving on current does not promote
        assert!(set.promote(&first).is_none());

        let evicted = set.promote(&second).unwrap();
        assert!(evicted.is_none());
        assert!(Arc::ptr_eq(set.current.as_ref().unwrap(), &second));
        assert!(Arc::ptr_eq(set.previous.as_ref().unwrap(), &first));

        // Promotion happens once
        assert!(set.promote(&second).is_none());
    }

    #[test]
    fn test_confirm_once() {
        let initiator = KeyPair::new(&keys(1, true));
        assert!(!initiator.confirm());

        let responder = KeyPair::new(&keys(2, false));
        assert!(responder.confirm());
        assert!(!responder.confirm());
    }

    #[test]
    fn test_never_more_than_three() {
        let mut set = KeyPairs::default();
        for index in 0..10 {
            let initiator = index % 3 == 0;
            let keypair = Arc::new(KeyPair::new(&keys(index, initiator)));
            set.install(keypair.clone());
            if index % 2 == 0 {
                set.promote(&keypair);
            }
            assert!(set.len() <= 3);
        }

        assert!(!set.is_empty());
        let cleared = set.clear();
        assert!(cleared.len() <= 3);
        assert!(set.is_empty());
    }
}
