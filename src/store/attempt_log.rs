//! Append-only audit log of candidate requests and transformation outcomes.

use std::fmt;

use serde::Serialize;

/// Outcome of a single logged attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    /// A candidate served a valid payload that was committed.
    Success,
    /// A candidate answered 404/410.
    NotFound,
    /// The request failed at the transport level.
    TransportError,
    /// A candidate answered but the body failed validation.
    InvalidContent,
    /// No candidates could be built for the record.
    MalformedIdentifier,
    /// End of a cycle in which no candidate succeeded.
    AllCandidatesExhausted,
    /// The payload was transformed.
    Transformed,
    /// The transformation step rejected the payload.
    TransformationFailure,
}

impl AttemptOutcome {
    /// Returns the database string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::NotFound => "not_found",
            Self::TransportError => "transport_error",
            Self::InvalidContent => "invalid_content",
            Self::MalformedIdentifier => "malformed_identifier",
            Self::AllCandidatesExhausted => "all_candidates_exhausted",
            Self::Transformed => "transformed",
            Self::TransformationFailure => "transformation_failure",
        }
    }
}

impl fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for AttemptOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(Self::Success),
            "not_found" => Ok(Self::NotFound),
            "transport_error" => Ok(Self::TransportError),
            "invalid_content" => Ok(Self::InvalidContent),
            "malformed_identifier" => Ok(Self::MalformedIdentifier),
            "all_candidates_exhausted" => Ok(Self::AllCandidatesExhausted),
            "transformed" => Ok(Self::Transformed),
            "transformation_failure" => Ok(Self::TransformationFailure),
            _ => Err(format!("invalid attempt outcome: {s}")),
        }
    }
}

/// Input payload for appending an attempt row.
#[derive(Debug, Clone, Copy)]
pub struct NewAttempt<'a> {
    pub record_id: i64,
    pub outcome: AttemptOutcome,
    pub url: Option<&'a str>,
    pub http_status: Option<u16>,
    pub duration_ms: Option<u64>,
    pub detail: &'a str,
}

impl<'a> NewAttempt<'a> {
    /// Starts an attempt row with no URL, status or timing.
    #[must_use]
    pub fn new(record_id: i64, outcome: AttemptOutcome, detail: &'a str) -> Self {
        Self {
            record_id,
            outcome,
            url: None,
            http_status: None,
            duration_ms: None,
            detail,
        }
    }

    #[must_use]
    pub fn with_url(mut self, url: &'a str) -> Self {
        self.url = Some(url);
        self
    }

    #[must_use]
    pub fn with_http_status(mut self, status: Option<u16>) -> Self {
        self.http_status = status;
        self
    }

    #[must_use]
    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }
}

/// A stored attempt row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttemptLogEntry {
    pub id: i64,
    pub record_id: i64,
    pub outcome: AttemptOutcome,
    pub url: Option<String>,
    pub http_status: Option<u16>,
    pub duration_ms: Option<u64>,
    pub detail: String,
    pub created_at: String,
}
