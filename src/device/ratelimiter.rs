//! Per-source token bucket for handshake processing under load

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

const PACKETS_PER_SECOND: u64 = 20;
const PACKETS_BURSTABLE: u64 = 5;
const PACKET_COST: u64 = 1_000_000_000 / PACKETS_PER_SECOND;
const MAX_TOKENS: u64 = PACKET_COST * PACKETS_BURSTABLE;

/// Entries idle for longer than this are forgotten
pub const GARBAGE_COLLECT_TIME: Duration = Duration::from_secs(1);

struct Bucket {
    tokens: u64,
    last: Instant,
}

#[derive(Default)]
pub struct RateLimiter {
    buckets: Mutex<HashMap<IpAddr, Bucket>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allow(&self, ip: IpAddr) -> bool {
        self.allow_at(ip, Instant::now())
    }

    pub fn allow_at(&self, ip: IpAddr, now: Instant) -> bool {
        let mut buckets = self.buckets.lock();
        let Some(bucket) = buckets.get_mut(&ip) else {
            buckets.insert(
                ip,
                Bucket {
                    tokens: MAX_TOKENS - PACKET_COST,
                    last: now,
                },
            );
            return true;
        };

        let elapsed = now.saturating_duration_since(bucket.last).as_nanos();
        bucket.tokens = (bucket.tokens as u128 + elapsed).min(MAX_TOKENS as u128) as u64;
        bucket.last = now;

        if bucket.tokens >= PACKET_COST {
            bucket.tokens -= PACKET_COST;
            true
        } else {
            false
        }
    }

    pub fn collect_garbage(&self) {
        self.collect_garbage_at(Instant::now());
    }

    pub fn collect_garbage_at(&self, now: Instant) {
        self.buckets
            .lock()
            .retain(|_, bucket| now.saturating_duration_since(bucket.last) <= GARBAGE_COLLECT_TIME);
    }

    pub fn len(&self) -> usize {
        self.buckets.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_burst_then_refill() {
        let limiter = RateLimiter::new();
        let ip: IpAddr = "192.0.2.7".parse().unwrap();
        let now = Instant::now();

        for _ in 0..PACKETS_BURSTABLE {
            assert!(limiter.allow_at(ip, now));
        }
        assert!(!limiter.allow_at(ip, now));

        // One packet's worth of time buys exactly one more packet
        let later = now + Duration::from_nanos(PACKET_COST);
        assert!(limiter.allow_at(ip, later));
        assert!(!limiter.allow_at(ip, later));
    }

    #[test]
    fn test_sources_are_independent() {
        let limiter = RateLimiter::new();
        let now = Instant::now();
        let noisy: IpAddr = "198.51.100.1".parse().unwrap();
        for _ in 0..10 {
            limiter.allow_at(noisy, now);
        }
        assert!(!limiter.allow_at(noisy, now));
        assert!(limiter.allow_at("2001:db8::2".parse().unwrap(), now));
    }

    #[test]
    fn test_garbage_collection() {
        let limiter = RateLimiter::new();
        let now = Instant::now();
        limiter.allow_at("192.0.2.1".parse().unwrap(), now);
        limiter.allow_at("192.0.2.2".parse().unwrap(), now + Duration::from_millis(900));

        limiter.collect_garbage_at(now + Duration::from_millis(1500));
        assert_eq!(limiter.len(), 1);
    }
}
