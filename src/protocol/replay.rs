//! Sliding-window replay filter (RFC 6479)
//!
//! A ring of 64-bit blocks; the block holding the newest counter is never
//! part of the window, so advancing only has to clear whole blocks.

use super::constants::REJECT_AFTER_MESSAGES;

const BLOCK_BITS: u64 = 64;
const BLOCK_BITS_LOG: u32 = 6;
const RING_BLOCKS: usize = 32;
const BLOCK_MASK: usize = RING_BLOCKS - 1;

/// Number of counters behind the newest one that are still accepted
pub const WINDOW_SIZE: u64 = (RING_BLOCKS as u64 - 1) * BLOCK_BITS;

/// Per key-pair transport counter validator
#[derive(Debug, Clone, Default)]
pub struct ReplayFilter {
    last: u64,
    ring: [u64; RING_BLOCKS],
}

impl ReplayFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept `counter` if it was never seen and is not below the window
    /// floor, recording it. Counters at or past the reject limit are always
    /// refused.
    pub fn validate(&mut self, counter: u64) -> bool {
        if counter >= REJECT_AFTER_MESSAGES {
            return false;
        }

        let block = (counter >> BLOCK_BITS_LOG) as usize;
        let bit = 1u64 << (counter & (BLOCK_BITS - 1));

        if counter > self.last {
            let current = (self.last >> BLOCK_BITS_LOG) as usize;
            let advance = (block - current).min(RING_BLOCKS);
            for i in 1..=advance {
                self.ring[(current + i) & BLOCK_MASK] = 0;
            }
            self.last = counter;
        } else if self.last - counter > WINDOW_SIZE {
            return false;
        }

        let slot = &mut self.ring[block & BLOCK_MASK];
        if *slot & bit != 0 {
            return false;
        }
        *slot |= bit;
        true
    }
}
