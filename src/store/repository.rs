//! Repository seam for record state persistence.
//!
//! The fetch engine, the discovery step and the transform step depend on this
//! trait rather than on a concrete backend, so the `SQLite` store and the
//! in-memory store are interchangeable.

use async_trait::async_trait;

use super::{
    AttemptLogEntry, DiscoveredRecord, ErrorKind, LifecycleState, NewAttempt, PayloadCommit,
    Record, Result, StateCounts,
};

/// Data-access contract for record lifecycle state.
///
/// Every method is atomic with respect to concurrent callers: a successful
/// [`claim`](RecordStore::claim) is observed by exactly one caller, and every
/// transition is a single durable write.
///
/// The transitions out of `InProgress` take the `attempt` number the claim
/// returned. A claim is owned by whoever holds that number: once the record
/// has been reset and claimed again, the earlier owner's transitions fail
/// with [`StoreError::StaleClaim`](super::StoreError::StaleClaim).
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Inserts records that are not yet known. Existing records are untouched.
    ///
    /// Returns the number of newly inserted records.
    async fn insert_if_absent(&self, records: &[DiscoveredRecord]) -> Result<u64>;

    /// Moves a `Pending` record whose retry time has passed to `InProgress`
    /// and increments its attempt count.
    ///
    /// Returns `None` when the record is not claimable.
    async fn claim(&self, id: i64, now_ms: i64) -> Result<Option<Record>>;

    /// Moves a `Pending` record straight to `Failed` without counting an attempt.
    ///
    /// Returns `false` when the record was not `Pending`.
    async fn fail_unclaimed(&self, id: i64, kind: ErrorKind, error: &str) -> Result<bool>;

    /// Returns a claimed record to `Pending`, not claimable before `next_attempt_at`.
    async fn release(
        &self,
        id: i64,
        attempt: u32,
        kind: ErrorKind,
        error: &str,
        next_attempt_at: i64,
    ) -> Result<()>;

    /// Commits a claimed record as `Succeeded` with its payload metadata.
    async fn commit_success(&self, id: i64, attempt: u32, commit: &PayloadCommit) -> Result<()>;

    /// Commits a claimed record as `Failed`.
    async fn commit_failure(&self, id: i64, attempt: u32, kind: ErrorKind, error: &str)
    -> Result<()>;

    /// Moves a `Succeeded` record to `Transformed`.
    async fn mark_transformed(&self, id: i64) -> Result<()>;

    /// Records a transformation failure on a `Succeeded` record without changing its state.
    async fn record_transform_failure(&self, id: i64, error: &str) -> Result<()>;

    /// Returns claimable `Pending` records, oldest `occurred_at` first.
    async fn pending_snapshot(&self, now_ms: i64, limit: Option<usize>) -> Result<Vec<Record>>;

    /// Returns every record in `state`, oldest `occurred_at` first.
    async fn list_by_state(&self, state: LifecycleState) -> Result<Vec<Record>>;

    /// Returns one record.
    async fn get(&self, id: i64) -> Result<Option<Record>>;

    /// Returns the number of records in `state`.
    async fn count_by_state(&self, state: LifecycleState) -> Result<i64>;

    /// Returns record counts per state.
    async fn counts(&self) -> Result<StateCounts>;

    /// Returns every `InProgress` record to `Pending`.
    ///
    /// Only safe while no claim holder is alive; callers serialize this with
    /// every fetch against the same store.
    async fn reset_in_progress(&self) -> Result<u64>;

    /// Returns every `Failed` record to `Pending` for another round of attempts.
    async fn requeue_failed(&self) -> Result<u64>;

    /// Appends one attempt log row.
    async fn append_attempt(&self, attempt: &NewAttempt<'_>) -> Result<i64>;

    /// Returns the attempt log of one record, oldest first.
    async fn attempts_for(&self, record_id: i64) -> Result<Vec<AttemptLogEntry>>;
}
