//! Constants for the fetch module (timeouts, limits, retry defaults).

/// Default HTTP connect timeout (30 seconds).
pub const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Default per-request timeout (60 seconds).
pub const REQUEST_TIMEOUT_SECS: u64 = 60;

/// Minimum allowed concurrency value.
pub const MIN_CONCURRENCY: usize = 1;

/// Maximum allowed concurrency value.
pub const MAX_CONCURRENCY: usize = 100;

/// Default concurrency if not specified.
pub const DEFAULT_CONCURRENCY: usize = 10;

/// Default retry ceiling (fetch cycles per record).
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default first backoff delay.
pub const DEFAULT_BASE_BACKOFF_SECS: u64 = 5;

/// Default backoff cap (5 minutes).
pub const DEFAULT_MAX_BACKOFF_SECS: u64 = 300;

/// Bodies shorter than this are treated as empty.
pub const DEFAULT_MIN_PAYLOAD_BYTES: usize = 32;

/// Bodies longer than this are abandoned mid-stream (256 MiB).
pub const DEFAULT_MAX_PAYLOAD_BYTES: u64 = 256 * 1024 * 1024;

/// Leading bytes inspected when sniffing for PGN tag pairs.
pub(crate) const SNIFF_WINDOW: usize = 512;
