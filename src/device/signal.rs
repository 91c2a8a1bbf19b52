//! Coalescing wake-up signal
//!
//! At most one wake-up is ever pending: sending twice before the receiver
//! runs is the same as sending once.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;

#[derive(Debug, Default)]
pub struct Signal {
    pending: AtomicBool,
    notify: Notify,
}

impl Signal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn send(&self) {
        if !self.pending.swap(true, Ordering::AcqRel) {
            self.notify.notify_one();
        }
    }

    /// Consume a pending signal without waiting
    pub fn try_take(&self) -> bool {
        self.pending.swap(false, Ordering::AcqRel)
    }

    /// Wait until a signal is pending and consume it
    pub async fn wait(&self) {
        loop {
            if self.try_take() {
                return;
            }
            self.notify.notified().await;
        }
    }

    pub fn clear(&self) {
        self.pending.store(false, Ordering::Release);
    }

    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_signals_coalesce() {
        let signal = Signal::new();
        signal.send();
        signal.send();
        assert!(signal.try_take());
        assert!(!signal.try_take());
    }

    #[tokio::test]
    async fn test_wait_wakes_on_send() {
        let signal = Arc::new(Signal::new());
        let waiter = {
            let signal = signal.clone();
            tokio::spawn(async move { signal.wait().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        signal.send();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(!signal.is_pending());
    }

    #[tokio::test]
    async fn test_cleared_signal_does_not_wake() {
        let signal = Signal::new();
        signal.send();
        signal.clear();
        let waited = tokio::time::timeout(Duration::from_millis(50), signal.wait()).await;
        assert!(waited.is_err());
    }
}
