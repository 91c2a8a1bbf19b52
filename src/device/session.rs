//! Host-facing session context
//!
//! Status changes and socket handoffs are reported through an [`EventSink`]
//! handed to the device at construction.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

use crate::protocol::constants::DEFAULT_LIVENESS_INTERVAL;
use crate::tunnel::RawDescriptor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// First datagram received from the network
    Connected,
    HandshakeCompleted,
    /// Nothing received for the liveness interval
    Unresponsive,
}

impl Status {
    pub fn code(self) -> i32 {
        match self {
            Self::Connected => 1,
            Self::HandshakeCompleted => 2,
            Self::Unresponsive => 101,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Status(Status),
    /// A new UDP socket was bound
    Descriptor(RawDescriptor),
}

pub trait EventSink: Send + Sync {
    fn on_event(&self, event: Event);
}

/// Logs events; the default sink
#[derive(Debug, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn on_event(&self, event: Event) {
        match event {
            Event::Status(status) => {
                tracing::info!("Status {:?} ({})", status, status.code())
            }
            Event::Descriptor(descriptor) => {
                tracing::debug!("UDP socket descriptor {}", descriptor)
            }
        }
    }
}

/// Forwards events to an unbounded channel
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<Event>,
}

impl ChannelSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn on_event(&self, event: Event) {
        let _ = self.tx.send(event);
    }
}

pub struct Session {
    sink: Arc<dyn EventSink>,
    liveness_interval: Duration,
    last_datagram: Mutex<Instant>,
    connected: AtomicBool,
}

impl Default for Session {
    fn default() -> Self {
        Self::new(Arc::new(TracingSink))
    }
}

impl Session {
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self {
            sink,
            liveness_interval: DEFAULT_LIVENESS_INTERVAL,
            last_datagram: Mutex::new(Instant::now()),
            connected: AtomicBool::new(false),
        }
    }

    pub fn with_liveness_interval(mut self, interval: Duration) -> Self {
        self.liveness_interval = interval;
        self
    }

    pub fn liveness_interval(&self) -> Duration {
        self.liveness_interval
    }

    pub fn emit(&self, event: Event) {
        self.sink.on_event(event);
    }

    pub(crate) fn datagram_received(&self) {
        *self.last_datagram.lock() = Instant::now();
        if !self.connected.swap(true, Ordering::AcqRel) {
            self.emit(Event::Status(Status::Connected));
        }
    }

    pub(crate) fn handshake_completed(&self) {
        self.emit(Event::Status(Status::HandshakeCompleted));
    }

    pub(crate) fn descriptor(&self, descriptor: RawDescriptor) {
        self.emit(Event::Descriptor(descriptor));
    }

    /// Report silence once per interval until `stop` flips
    pub(crate) async fn monitor_liveness(&self, mut stop: watch::Receiver<bool>) {
        *self.last_datagram.lock() = Instant::now();
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = stop.changed() => return,
                _ = tick.tick() => {
                    let silent = {
                        let mut last = self.last_datagram.lock();
                        if last.elapsed() > self.liveness_interval {
                            *last = Instant::now();
                            true
                        } else {
                            false
                        }
                    };
                    if silent {
                        tracing::warn!(
                            "No datagram received for {}s",
                            self.liveness_interval.as_secs()
                        );
                        self.emit(Event::Status(Status::Unresponsive));
                    }
                }
            }
        }
    }
}
