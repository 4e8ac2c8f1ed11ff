use std::time::Duration;

/// Default poll interval per subscriber (the front end polls every 2 seconds).
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(2000);

/// Lower bound on the poll interval.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Upper bound on the poll interval.
pub const MAX_POLL_INTERVAL: Duration = Duration::from_secs(3600);

/// Bound on every RecordStore call.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(5);

/// Consecutive sampler failures before a subscriber is marked degraded.
pub const DEFAULT_DEGRADED_THRESHOLD: u32 = 3;

/// First retry delay after a backend failure.
pub const DEFAULT_BACKOFF_INITIAL: Duration = Duration::from_secs(1);

/// Ceiling for retry delays.
pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(30);

/// Bits in one byte.
pub const BITS_PER_BYTE: f64 = 8.0;

/// Bits in one megabit.
pub const BITS_PER_MEGABIT: f64 = 1_000_000.0;

/// Initial capacity for the JSON payload buffer.
pub const PAYLOAD_CAPACITY: usize = 512;
