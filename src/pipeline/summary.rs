//! Structured results of the batch operations.

use serde::Serialize;

use crate::fetch::{BatchReport, Disposition, RecordOutcome};
use crate::store::{ErrorKind, StateCounts};
use crate::transform::TransformReport;

/// A listing page that could not be read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PageFailure {
    pub page: u32,
    pub error: String,
}

/// Result of [`super::Pipeline::discover_batch`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DiscoverySummary {
    pub pages_requested: usize,
    /// Pages that failed, sorted by page number.
    pub pages_failed: Vec<PageFailure>,
    /// Records listed on the pages that were read.
    pub records_seen: usize,
    /// Records that were not already in the store.
    pub records_inserted: u64,
    /// Records dropped for a non-positive identifier.
    pub records_rejected: usize,
}

/// A record that ended a batch in `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedRecord {
    pub id: i64,
    pub error_kind: Option<ErrorKind>,
    pub detail: Option<String>,
}

/// Result of [`super::Pipeline::fetch_pending`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FetchSummary {
    /// Eligible pending records when the batch started.
    pub snapshot_size: usize,
    pub succeeded: usize,
    pub retry_scheduled: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Candidate requests issued.
    pub requests: usize,
    pub interrupted: bool,
    /// Stale `InProgress` records reset to `Pending` before the run started.
    /// Only the first batch of a run reports them.
    pub recovered: u64,
    /// Records this batch moved to `Failed`.
    pub newly_failed: Vec<FailedRecord>,
    pub outcomes: Vec<RecordOutcome>,
    /// Store-wide counts after the batch.
    pub state_counts: StateCounts,
}

impl FetchSummary {
    pub(crate) fn from_report(
        snapshot_size: usize,
        report: BatchReport,
        state_counts: StateCounts,
    ) -> Self {
        let newly_failed = report
            .outcomes
            .iter()
            .filter(|o| o.disposition == Disposition::Failed)
            .map(|o| FailedRecord {
                id: o.record_id,
                error_kind: o.error_kind,
                detail: o.detail.clone(),
            })
            .collect();

        Self {
            snapshot_size,
            succeeded: report.succeeded(),
            retry_scheduled: report.retry_scheduled(),
            failed: report.failed(),
            skipped: report.skipped(),
            requests: report.requests,
            interrupted: report.interrupted,
            recovered: 0,
            newly_failed,
            outcomes: report.outcomes,
            state_counts,
        }
    }
}

/// Result of [`super::Pipeline::transform_succeeded`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TransformSummary {
    pub transformed: Vec<TransformReport>,
    /// Records left `Succeeded` after a transformation failure.
    pub failed: Vec<FailedRecord>,
    /// Payload files deleted after transformation.
    pub pruned: usize,
    pub interrupted: bool,
}

impl TransformSummary {
    /// Games written across all transformed records.
    #[must_use]
    pub fn games(&self) -> usize {
        self.transformed.iter().map(|r| r.games).sum()
    }
}
