//! Record types, lifecycle states and the persisted error taxonomy.

use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::fetch::ContentKind;

/// Lifecycle state of a record.
///
/// ```text
/// Pending -> InProgress -> Succeeded -> Transformed
///                       \-> Failed
///            InProgress -> Pending   (retry later / crash recovery)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    /// Discovered and waiting for a fetch cycle.
    Pending,
    /// Claimed by exactly one worker.
    InProgress,
    /// Payload validated and durably written.
    Succeeded,
    /// Terminal fetch failure.
    Failed,
    /// Payload handed to the transformation step successfully.
    Transformed,
}

impl LifecycleState {
    /// All states, in lifecycle order.
    pub const ALL: [Self; 5] = [
        Self::Pending,
        Self::InProgress,
        Self::Succeeded,
        Self::Failed,
        Self::Transformed,
    ];

    /// Returns the database string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Transformed => "transformed",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for LifecycleState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "transformed" => Ok(Self::Transformed),
            _ => Err(format!("invalid lifecycle state: {s}")),
        }
    }
}

/// Record-level failure taxonomy, persisted next to `last_error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The identifier cannot be turned into candidate URLs. Fatal, never retried.
    MalformedIdentifier,
    /// Timeout, connection reset, DNS failure. Retryable per policy.
    TransportError,
    /// A candidate served an error page or an empty body.
    ErrorPageOrEmpty,
    /// Every candidate was tried without a valid payload. Retryable until the ceiling.
    AllCandidatesExhausted,
    /// The transformation step rejected the payload. Does not affect fetch state.
    TransformationFailure,
}

impl ErrorKind {
    /// Returns the database string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MalformedIdentifier => "malformed_identifier",
            Self::TransportError => "transport_error",
            Self::ErrorPageOrEmpty => "error_page_or_empty",
            Self::AllCandidatesExhausted => "all_candidates_exhausted",
            Self::TransformationFailure => "transformation_failure",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ErrorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "malformed_identifier" => Ok(Self::MalformedIdentifier),
            "transport_error" => Ok(Self::TransportError),
            "error_page_or_empty" => Ok(Self::ErrorPageOrEmpty),
            "all_candidates_exhausted" => Ok(Self::AllCandidatesExhausted),
            "transformation_failure" => Ok(Self::TransformationFailure),
            _ => Err(format!("invalid error kind: {s}")),
        }
    }
}

/// A record as produced by the discovery step, before it is stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredRecord {
    /// Identifier assigned by the remote source.
    pub id: i64,
    /// Timestamp attached to the record.
    pub occurred_at: DateTime<Utc>,
    /// Canonical filename hint.
    pub source_filename: String,
}

impl DiscoveredRecord {
    /// Builds a discovered record using the canonical archive filename for `id`.
    #[must_use]
    pub fn with_default_filename(id: i64, occurred_at: DateTime<Utc>) -> Self {
        Self {
            id,
            occurred_at,
            source_filename: format!("match_{id}.pgn.tar.gz"),
        }
    }
}

/// Payload metadata written together with the `Succeeded` transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadCommit {
    /// Candidate URL that served the payload.
    pub source_url: String,
    /// Where the payload was durably written.
    pub payload_path: String,
    /// Validator classification.
    pub content_kind: ContentKind,
    /// Payload size in bytes.
    pub payload_size: u64,
    /// Hex SHA-256 of the payload.
    pub payload_sha256: String,
}

/// One stored record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Record {
    /// Unique positive identifier.
    pub id: i64,
    /// Timestamp attached at discovery.
    pub occurred_at: DateTime<Utc>,
    /// Canonical filename hint given at discovery.
    pub source_filename: String,
    /// Current lifecycle state.
    pub state: LifecycleState,
    /// Fetch attempts made so far. Never decreases.
    pub attempt_count: u32,
    /// Most recent failure description.
    pub last_error: Option<String>,
    /// Classification of `last_error`.
    pub last_error_kind: Option<ErrorKind>,
    /// Earliest time (unix millis) the record may be claimed again.
    pub next_attempt_at: i64,
    /// URL that served the committed payload.
    pub source_url: Option<String>,
    /// Path of the committed payload.
    pub payload_path: Option<String>,
    /// Validator classification of the committed payload.
    pub content_kind: Option<ContentKind>,
    /// Size of the committed payload in bytes.
    pub payload_size: Option<u64>,
    /// Hex SHA-256 of the committed payload.
    pub payload_sha256: Option<String>,
    /// When the record was first inserted.
    pub discovered_at: String,
    /// When the record was last changed.
    pub updated_at: String,
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Record {{ id: {}, state: {}, attempts: {} }}",
            self.id, self.state, self.attempt_count
        )
    }
}

/// Canonical storage form of a record timestamp (sorts lexicographically).
#[must_use]
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Current wall-clock time in unix milliseconds.
#[must_use]
pub fn unix_millis_now() -> i64 {
    Utc::now().timestamp_millis()
}
