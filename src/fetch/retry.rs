//! Retry policy: a pure decision over (attempt count, failure kind).
//!
//! The policy never sleeps. The fetch engine turns a
//! [`RetryDecision::RetryAfter`] into a `next_attempt_at` time on the record
//! and a later batch picks it up, so tests can drive retries without real
//! delays.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use match_archiver::fetch::{RetryDecision, RetryPolicy};
//! use match_archiver::store::ErrorKind;
//!
//! let policy = RetryPolicy::new(3, Duration::from_secs(5), Duration::from_secs(300));
//! assert_eq!(
//!     policy.decide(2, ErrorKind::TransportError),
//!     RetryDecision::RetryAfter(Duration::from_secs(10))
//! );
//! assert_eq!(policy.decide(3, ErrorKind::TransportError), RetryDecision::GiveUp);
//! ```

use std::time::Duration;

use tracing::{debug, instrument};

use super::constants::{DEFAULT_BASE_BACKOFF_SECS, DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_BACKOFF_SECS};
use crate::store::ErrorKind;

/// Decision for a record whose fetch cycle ended without success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Leave the record pending; do not claim it again before this delay.
    RetryAfter(Duration),
    /// Stop retrying; the record becomes `Failed`.
    GiveUp,
}

/// Exponential backoff with an attempt ceiling.
///
/// ```text
/// delay(n) = min(base_delay * 2^(n-1), max_delay)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: Duration::from_secs(DEFAULT_BASE_BACKOFF_SECS),
            max_delay: Duration::from_secs(DEFAULT_MAX_BACKOFF_SECS),
        }
    }
}

impl RetryPolicy {
    /// Creates a policy. `max_attempts` is clamped to at least 1.
    #[must_use]
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
        }
    }

    /// Creates a policy with a custom ceiling, using defaults for the delays.
    #[must_use]
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Self::default()
        }
    }

    /// Returns the attempt ceiling.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Decides what happens after `attempt_count` fetch cycles failed with `kind`.
    ///
    /// Local failures ([`ErrorKind::MalformedIdentifier`]) and transformation
    /// failures always give up; the retryable kinds back off until the
    /// ceiling is reached.
    #[must_use]
    #[instrument(level = "debug", skip(self), fields(max_attempts = self.max_attempts))]
    pub fn decide(&self, attempt_count: u32, kind: ErrorKind) -> RetryDecision {
        match kind {
            ErrorKind::MalformedIdentifier | ErrorKind::TransformationFailure => {
                debug!("kind is not retryable");
                RetryDecision::GiveUp
            }
            ErrorKind::TransportError
            | ErrorKind::AllCandidatesExhausted
            | ErrorKind::ErrorPageOrEmpty => {
                if attempt_count >= self.max_attempts {
                    debug!("attempt ceiling reached");
                    RetryDecision::GiveUp
                } else {
                    RetryDecision::RetryAfter(self.backoff_delay(attempt_count))
                }
            }
        }
    }

    /// Backoff before the attempt following `attempt_count` failed cycles.
    #[must_use]
    pub fn backoff_delay(&self, attempt_count: u32) -> Duration {
        let exponent = attempt_count.max(1) - 1;
        let factor = 2_u32.checked_pow(exponent).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}
