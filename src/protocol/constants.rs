//! Protocol timing and sizing constants

use std::time::Duration;

pub const REKEY_AFTER_MESSAGES: u64 = u64::MAX - (1 << 16);
pub const REJECT_AFTER_MESSAGES: u64 = u64::MAX - (1 << 4);

pub const REKEY_AFTER_TIME: Duration = Duration::from_secs(120);
pub const REKEY_AFTER_TIME_CHANGE: Duration = Duration::from_secs(30);
pub const REKEY_ATTEMPT_TIME: Duration = Duration::from_secs(90);
pub const REKEY_TIMEOUT: Duration = Duration::from_secs(5);
pub const REJECT_AFTER_TIME: Duration = Duration::from_secs(180);
pub const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(10);
pub const COOKIE_REFRESH_TIME: Duration = Duration::from_secs(120);
pub const HANDSHAKE_INITIATION_RATE: Duration = Duration::from_millis(50);
pub const PADDING_MULTIPLE: usize = 16;

/// Receiving side rekeys early so both ends do not race to initiate
pub const REKEY_AFTER_TIME_RECEIVING: Duration = Duration::from_secs(
    REKEY_AFTER_TIME.as_secs() - KEEPALIVE_TIMEOUT.as_secs() - REKEY_TIMEOUT.as_secs(),
);

/// Upon failure to acknowledge a transport message
pub const NEW_HANDSHAKE_TIME: Duration =
    Duration::from_secs(KEEPALIVE_TIMEOUT.as_secs() + REKEY_TIMEOUT.as_secs());

/// Key material is wiped when no handshake completed for this long
pub const ZERO_KEYS_AFTER: Duration = Duration::from_secs(REJECT_AFTER_TIME.as_secs() * 3);

pub const QUEUE_OUTBOUND_SIZE: usize = 20;
pub const QUEUE_INBOUND_SIZE: usize = 20;
pub const QUEUE_HANDSHAKE_SIZE: usize = 20;

pub const UNDER_LOAD_QUEUE_SIZE: usize = QUEUE_HANDSHAKE_SIZE / 4;
pub const UNDER_LOAD_AFTER_TIME: Duration = Duration::from_secs(1);

/// Largest UDP datagram handled
pub const MAX_SEGMENT_SIZE: usize = 1700;

/// Upper bound of the random delay added to each handshake retry
pub const MAX_HANDSHAKE_JITTER_MS: u64 = 334;

/// Sleep before rebinding the socket after a failed send
pub const NETWORK_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Default window after which silence on the socket is reported
pub const DEFAULT_LIVENESS_INTERVAL: Duration = Duration::from_secs(50);
