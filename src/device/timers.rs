//! Per-peer timers and the handshake initiator
//!
//! All of a peer's timers live in one deadline table serviced by a single
//! task, so arming and disarming never race with an expiry handler running on
//! another task. Packet paths only touch the table through the `timer_*`
//! event hooks below.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::Notify;
use tokio::time::{sleep_until, Instant};

use super::peer::Peer;
use super::Device;
use crate::protocol::constants::{
    KEEPALIVE_TIMEOUT, MAX_HANDSHAKE_JITTER_MS, NEW_HANDSHAKE_TIME, REKEY_ATTEMPT_TIME,
    REKEY_TIMEOUT, ZERO_KEYS_AFTER,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    PersistentKeepalive,
    PassiveKeepalive,
    NewHandshake,
    ZeroKeyMaterial,
}

const TIMER_KINDS: [TimerKind; 4] = [
    TimerKind::PersistentKeepalive,
    TimerKind::PassiveKeepalive,
    TimerKind::NewHandshake,
    TimerKind::ZeroKeyMaterial,
];

#[derive(Default)]
struct TimerState {
    deadlines: [Option<Instant>; 4],
    need_another_keepalive: bool,
}

#[derive(Default)]
pub(crate) struct Timers {
    state: Mutex<TimerState>,
    wake: Notify,
    sent_last_minute_handshake: AtomicBool,
}

impl Timers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arm(&self, kind: TimerKind, after: Duration) {
        self.state.lock().deadlines[kind as usize] = Some(Instant::now() + after);
        self.wake.notify_one();
    }

    pub fn stop(&self, kind: TimerKind) {
        self.state.lock().deadlines[kind as usize] = None;
    }

    pub fn stop_all(&self) {
        let mut state = self.state.lock();
        state.deadlines = [None; 4];
        state.need_another_keepalive = false;
        drop(state);
        self.wake.notify_one();
    }

    pub fn is_pending(&self, kind: TimerKind) -> bool {
        self.state.lock().deadlines[kind as usize].is_some()
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.state.lock().deadlines.iter().flatten().min().copied()
    }

    fn take_expired(&self, now: Instant) -> Vec<TimerKind> {
        let mut state = self.state.lock();
        TIMER_KINDS
            .into_iter()
            .filter(|kind| {
                let slot = &mut state.deadlines[*kind as usize];
                match slot {
                    Some(deadline) if *deadline <= now => {
                        *slot = None;
                        true
                    }
                    _ => false,
                }
            })
            .collect()
    }

    /// Consume a pending second passive keepalive
    fn take_need_another_keepalive(&self) -> bool {
        std::mem::take(&mut self.state.lock().need_another_keepalive)
    }

    pub fn sent_last_minute_handshake(&self) -> bool {
        self.sent_last_minute_handshake.load(Ordering::Acquire)
    }

    pub fn set_sent_last_minute_handshake(&self, sent: bool) {
        self.sent_last_minute_handshake.store(sent, Ordering::Release);
    }
}

impl Peer {
    /// A data packet went out; expect an answer within the new-handshake time
    pub(crate) fn timer_data_sent(&self) {
        if !self.timers.is_pending(TimerKind::NewHandshake) {
            self.timers.arm(TimerKind::NewHandshake, NEW_HANDSHAKE_TIME);
        }
    }

    /// A data packet arrived; answer it with a keepalive unless we talk first
    pub(crate) fn timer_data_received(&self) {
        let mut state = self.timers.state.lock();
        if state.deadlines[TimerKind::PassiveKeepalive as usize].is_some() {
            state.need_another_keepalive = true;
        } else {
            drop(state);
            self.timers.arm(TimerKind::PassiveKeepalive, KEEPALIVE_TIMEOUT);
        }
    }

    pub(crate) fn timer_any_authenticated_packet_sent(&self) {
        self.timers.stop(TimerKind::PassiveKeepalive);
    }

    pub(crate) fn timer_any_authenticated_packet_received(&self) {
        self.timers.stop(TimerKind::NewHandshake);
    }

    pub(crate) fn timer_any_authenticated_packet_traversal(&self) {
        let interval = self.persistent_keepalive();
        if interval > 0 {
            self.timers.arm(
                TimerKind::PersistentKeepalive,
                Duration::from_secs(interval as u64),
            );
        }
    }

    pub(crate) fn timer_ephemeral_key_created(&self) {
        self.timers.arm(TimerKind::ZeroKeyMaterial, ZERO_KEYS_AFTER);
    }
}

/// Service the peer's timer table until the peer stops
pub(crate) async fn routine_timers(device: Arc<Device>, peer: Arc<Peer>) {
    let mut stop = peer.stop_rx();
    tracing::debug!("Timer routine started for {}", peer.public_key());

    loop {
        let next = peer.timers.next_deadline();
        tokio::select! {
            _ = stop.changed() => break,
            _ = peer.timers.wake.notified() => continue,
            _ = sleep_until(next.unwrap_or_else(far_future)), if next.is_some() => {}
        }

        for kind in peer.timers.take_expired(Instant::now()) {
            match kind {
                TimerKind::PersistentKeepalive => {
                    if peer.persistent_keepalive() > 0 {
                        tracing::trace!("Sending persistent keepalive");
                        peer.send_keepalive();
                    }
                }
                TimerKind::PassiveKeepalive => {
                    peer.send_keepalive();
                    if peer.timers.take_need_another_keepalive() {
                        peer.timers.arm(TimerKind::PassiveKeepalive, KEEPALIVE_TIMEOUT);
                    }
                }
                TimerKind::NewHandshake => {
                    tracing::debug!(
                        "No reply for {}s, retrying handshake",
                        NEW_HANDSHAKE_TIME.as_secs()
                    );
                    peer.signals.handshake_begin.send();
                }
                TimerKind::ZeroKeyMaterial => {
                    tracing::info!("Erasing key material for {}", peer.public_key());
                    device.zero_peer_keys(&peer);
                }
            }
        }
    }

    tracing::debug!("Timer routine stopped for {}", peer.public_key());
}

fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(86400)
}

fn handshake_jitter() -> Duration {
    Duration::from_millis(rand::thread_rng().gen_range(0..MAX_HANDSHAKE_JITTER_MS))
}

enum Outcome {
    Completed,
    Reset,
    Retry,
    GaveUp,
    Stopped,
}

/// Run handshake negotiations whenever `handshake_begin` is signalled.
///
/// Each negotiation retries every `REKEY_TIMEOUT` (plus jitter) until a
/// handshake completes or `REKEY_ATTEMPT_TIME` runs out; a reset signal
/// restarts the negotiation from scratch.
pub(crate) async fn routine_handshake_initiator(device: Arc<Device>, peer: Arc<Peer>) {
    let mut stop = peer.stop_rx();

    loop {
        tokio::select! {
            _ = stop.changed() => return,
            _ = peer.signals.handshake_begin.wait() => {}
        }

        'negotiation: loop {
            peer.signals.handshake_reset.clear();
            let deadline = Instant::now() + REKEY_ATTEMPT_TIME;
            let mut attempts = 0u32;

            loop {
                peer.signals.handshake_completed.clear();
                attempts += 1;

                let packet = match device.create_initiation_packet(&peer) {
                    Ok(packet) => packet,
                    Err(e) => {
                        tracing::warn!("Failed to create handshake initiation: {}", e);
                        break 'negotiation;
                    }
                };

                tracing::debug!("Sending handshake initiation (attempt {})", attempts);
                match device.send_to_peer(&peer, &packet).await {
                    Ok(()) => peer.timer_any_authenticated_packet_traversal(),
                    Err(e) => {
                        tracing::debug!("Failed to send handshake initiation: {}", e);
                        device.recover_network();
                    }
                }

                let attempt_end = Instant::now() + REKEY_TIMEOUT + handshake_jitter();
                let outcome = tokio::select! {
                    _ = stop.changed() => Outcome::Stopped,
                    _ = peer.signals.handshake_completed.wait() => Outcome::Completed,
                    _ = peer.signals.handshake_reset.wait() => Outcome::Reset,
                    _ = sleep_until(deadline) => Outcome::GaveUp,
                    _ = sleep_until(attempt_end) => Outcome::Retry,
                };

                match outcome {
                    Outcome::Stopped => return,
                    Outcome::Retry => continue,
                    Outcome::Completed => {
                        tracing::debug!("Handshake completed after {} attempt(s)", attempts);
                        if wait_until(&mut stop, attempt_end).await {
                            return;
                        }
                        break 'negotiation;
                    }
                    Outcome::Reset => {
                        tracing::debug!("Handshake reset, restarting negotiation");
                        if wait_until(&mut stop, attempt_end).await {
                            return;
                        }
                        continue 'negotiation;
                    }
                    Outcome::GaveUp => {
                        tracing::info!(
                            "Handshake did not complete after {}s, giving up",
                            REKEY_ATTEMPT_TIME.as_secs()
                        );
                        peer.signals.flush_nonce_queue.send();
                        peer.timers.stop(TimerKind::PersistentKeepalive);
                        break 'negotiation;
                    }
                }
            }
        }

        // Requests raised while negotiating were served by this negotiation
        peer.signals.handshake_begin.clear();
    }
}

/// Sleep until `until`; true if the peer stopped first
async fn wait_until(stop: &mut tokio::sync::watch::Receiver<bool>, until: Instant) -> bool {
    tokio::select! {
        _ = stop.changed() => true,
        _ = sleep_until(until) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::PrivateKey;

    fn peer() -> Peer {
        Peer::new(
            PrivateKey::generate().public_key(),
            &PrivateKey::generate(),
        )
    }

    #[test]
    fn test_data_sent_arms_new_handshake_once() {
        let peer = peer();
        peer.timer_data_sent();
        let first = peer.timers.next_deadline().unwrap();
        peer.timer_data_sent();
        assert_eq!(peer.timers.next_deadline(), Some(first));

        peer.timer_any_authenticated_packet_received();
        assert!(!peer.timers.is_pending(TimerKind::NewHandshake));
    }

    #[test]
    fn test_passive_keepalive_coalesces() {
        let peer = peer();
        peer.timer_data_received();
        peer.timer_data_received();
        peer.timer_data_received();

        assert!(peer.timers.is_pending(TimerKind::PassiveKeepalive));
        assert!(peer.timers.take_need_another_keepalive());
        assert!(!peer.timers.take_need_another_keepalive());

        peer.timer_any_authenticated_packet_sent();
        assert!(!peer.timers.is_pending(TimerKind::PassiveKeepalive));
    }

    #[test]
    fn test_persistent_keepalive_needs_interval() {
        let peer = peer();
        peer.timer_any_authenticated_packet_traversal();
        assert!(!peer.timers.is_pending(TimerKind::PersistentKeepalive));

        peer.set_persistent_keepalive(25);
        peer.timer_any_authenticated_packet_traversal();
        assert!(peer.timers.is_pending(TimerKind::PersistentKeepalive));
    }

    #[test]
    fn test_take_expired() {
        let timers = Timers::new();
        timers.arm(TimerKind::ZeroKeyMaterial, Duration::ZERO);
        timers.arm(TimerKind::NewHandshake, Duration::from_secs(60));

        let expired = timers.take_expired(Instant::now() + Duration::from_millis(1));
        assert_eq!(expired, vec![TimerKind::ZeroKeyMaterial]);
        assert!(timers.is_pending(TimerKind::NewHandshake));

        timers.stop_all();
        assert!(timers.next_deadline().is_none());
    }

    #[test]
    fn test_jitter_bounds() {
        for _ in 0..100 {
            assert!(handshake_jitter() < Duration::from_millis(MAX_HANDSHAKE_JITTER_MS));
        }
    }
}
