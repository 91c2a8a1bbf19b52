//! Receiver index table
//!
//! Maps the random 32-bit indices we hand out in handshake messages back to
//! the peer and, once a handshake completes, to the key-pair it produced.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use rand::{rngs::OsRng, RngCore};

use crate::protocol::KeyPair;

pub struct IndexEntry<P> {
    pub peer: Arc<P>,
    pub keypair: Option<Arc<KeyPair>>,
}

impl<P> Clone for IndexEntry<P> {
    fn clone(&self) -> Self {
        Self {
            peer: self.peer.clone(),
            keypair: self.keypair.clone(),
        }
    }
}

pub struct IndexTable<P> {
    entries: RwLock<HashMap<u32, IndexEntry<P>>>,
}

impl<P> Default for IndexTable<P> {
    fn default() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }
}

impl<P> IndexTable<P> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a fresh non-zero index for an in-flight handshake
    pub fn insert_handshake(&self, peer: &Arc<P>) -> u32 {
        let mut entries = self.entries.write();
        loop {
            let index = OsRng.next_u32();
            if index == 0 || entries.contains_key(&index) {
                continue;
            }
            entries.insert(
                index,
                IndexEntry {
                    peer: peer.clone(),
                    keypair: None,
                },
            );
            return index;
        }
    }

    /// Point a handshake index at the key-pair it produced.
    ///
    /// Returns false if the index was released in the meantime.
    pub fn swap_for_keypair(&self, index: u32, keypair: Arc<KeyPair>) -> bool {
        match self.entries.write().get_mut(&index) {
            Some(entry) => {
                entry.keypair = Some(keypair);
                true
            }
            None => false,
        }
    }

    pub fn lookup(&self, index: u32) -> Option<IndexEntry<P>> {
        self.entries.read().get(&index).cloned()
    }

    pub fn delete(&self, index: u32) -> bool {
        self.entries.write().remove(&index).is_some()
    }

    /// Release every index belonging to `peer`
    pub fn remove_peer(&self, peer: &Arc<P>) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, entry| !Arc::ptr_eq(&entry.peer, peer));
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}
