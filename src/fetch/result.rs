//! Per-candidate and per-record fetch results.

use std::time::Duration;

use serde::Serialize;

use super::ContentKind;
use crate::store::{AttemptOutcome, ErrorKind};

/// Outcome of one candidate request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    /// The body validated as a payload.
    Success {
        /// Response body.
        bytes: Vec<u8>,
        /// Validator classification.
        kind: ContentKind,
    },
    /// The candidate answered 404 or 410.
    NotFound,
    /// The request failed at the transport level.
    TransportError {
        /// Error description.
        message: String,
    },
    /// The candidate answered but the body is not a payload.
    InvalidContent {
        /// Why the body was rejected.
        reason: String,
    },
}

/// Transient result of one candidate request. Never persisted directly; it
/// becomes an attempt log row and, for the final candidate, a state change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchResult {
    pub record_id: i64,
    pub url: String,
    pub http_status: Option<u16>,
    pub duration: Duration,
    pub outcome: FetchOutcome,
}

impl FetchResult {
    /// Audit log outcome for this request.
    #[must_use]
    pub fn attempt_outcome(&self) -> AttemptOutcome {
        match self.outcome {
            FetchOutcome::Success { .. } => AttemptOutcome::Success,
            FetchOutcome::NotFound => AttemptOutcome::NotFound,
            FetchOutcome::TransportError { .. } => AttemptOutcome::TransportError,
            FetchOutcome::InvalidContent { .. } => AttemptOutcome::InvalidContent,
        }
    }

    /// Human-readable detail for logs and `last_error`.
    #[must_use]
    pub fn detail(&self) -> String {
        match &self.outcome {
            FetchOutcome::Success { bytes, kind } => format!("{kind}, {} bytes", bytes.len()),
            FetchOutcome::NotFound => format!(
                "HTTP {} at {}",
                self.http_status.unwrap_or(404),
                self.url
            ),
            FetchOutcome::TransportError { message } => message.clone(),
            FetchOutcome::InvalidContent { reason } => format!("{reason} at {}", self.url),
        }
    }

    #[must_use]
    pub fn duration_ms(&self) -> u64 {
        u64::try_from(self.duration.as_millis()).unwrap_or(u64::MAX)
    }
}

/// Where a record ended up after one batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "disposition", rename_all = "snake_case")]
pub enum Disposition {
    /// Payload committed.
    Succeeded,
    /// Returned to pending; claimable again at `next_attempt_at` (unix millis).
    RetryScheduled { next_attempt_at: i64 },
    /// Terminal failure.
    Failed,
    /// The record was no longer claimable when its turn came.
    Skipped,
}

/// Per-record result of a fetch batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordOutcome {
    pub record_id: i64,
    #[serde(flatten)]
    pub disposition: Disposition,
    pub attempt_count: u32,
    pub error_kind: Option<ErrorKind>,
    pub detail: Option<String>,
}

impl RecordOutcome {
    pub(crate) fn succeeded(record_id: i64, attempt_count: u32) -> Self {
        Self {
            record_id,
            disposition: Disposition::Succeeded,
            attempt_count,
            error_kind: None,
            detail: None,
        }
    }

    pub(crate) fn failed(
        record_id: i64,
        attempt_count: u32,
        kind: ErrorKind,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            record_id,
            disposition: Disposition::Failed,
            attempt_count,
            error_kind: Some(kind),
            detail: Some(detail.into()),
        }
    }

    pub(crate) fn retry_scheduled(
        record_id: i64,
        attempt_count: u32,
        next_attempt_at: i64,
        kind: ErrorKind,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            record_id,
            disposition: Disposition::RetryScheduled { next_attempt_at },
            attempt_count,
            error_kind: Some(kind),
            detail: Some(detail.into()),
        }
    }

    pub(crate) fn skipped(record_id: i64, attempt_count: u32) -> Self {
        Self {
            record_id,
            disposition: Disposition::Skipped,
            attempt_count,
            error_kind: None,
            detail: None,
        }
    }
}
