//! State store: durable per-record lifecycle state and attempt history.
//!
//! # Overview
//!
//! - [`RecordStore`] - Persistence seam used by the fetch engine and the pipeline
//! - [`SqliteStore`] - `SQLite`-backed implementation (WAL, atomic claims)
//! - [`MemoryStore`] - In-memory implementation for tests and dry runs
//! - [`Record`] / [`LifecycleState`] / [`ErrorKind`] - The record data model
//! - [`AttemptLogEntry`] - Append-only audit rows
//!
//! # Example
//!
//! ```ignore
//! use match_archiver::store::{RecordStore, SqliteStore};
//! use match_archiver::Database;
//! use std::path::Path;
//!
//! let db = Database::new(Path::new("lc0_matches.db")).await?;
//! let store = SqliteStore::new(db);
//!
//! if let Some(record) = store.claim(42, now_ms).await? {
//!     // ... fetch the record ...
//!     store.commit_success(record.id, record.attempt_count, &commit).await?;
//! }
//! ```

mod attempt_log;
mod error;
mod memory;
mod record;
mod repository;

pub use attempt_log::{AttemptLogEntry, AttemptOutcome, NewAttempt};
pub use error::{StoreDbErrorKind, StoreError};
pub use memory::MemoryStore;
pub use record::{
    DiscoveredRecord, ErrorKind, LifecycleState, PayloadCommit, Record, format_timestamp,
    unix_millis_now,
};
pub use repository::RecordStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::Row;
use tracing::{debug, instrument};

use crate::db::Database;

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Record counts per lifecycle state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StateCounts {
    pub pending: i64,
    pub in_progress: i64,
    pub succeeded: i64,
    pub failed: i64,
    pub transformed: i64,
}

impl StateCounts {
    /// Total number of records.
    #[must_use]
    pub fn total(&self) -> i64 {
        self.pending + self.in_progress + self.succeeded + self.failed + self.transformed
    }

    /// Count for one state.
    #[must_use]
    pub fn get(&self, state: LifecycleState) -> i64 {
        match state {
            LifecycleState::Pending => self.pending,
            LifecycleState::InProgress => self.in_progress,
            LifecycleState::Succeeded => self.succeeded,
            LifecycleState::Failed => self.failed,
            LifecycleState::Transformed => self.transformed,
        }
    }

    pub(crate) fn add(&mut self, state: LifecycleState, count: i64) {
        match state {
            LifecycleState::Pending => self.pending += count,
            LifecycleState::InProgress => self.in_progress += count,
            LifecycleState::Succeeded => self.succeeded += count,
            LifecycleState::Failed => self.failed += count,
            LifecycleState::Transformed => self.transformed += count,
        }
    }
}

/// Raw `records` row as stored in `SQLite`.
#[derive(Debug, sqlx::FromRow)]
struct RecordRow {
    id: i64,
    occurred_at: String,
    source_filename: String,
    state: String,
    attempt_count: i64,
    last_error: Option<String>,
    last_error_kind: Option<String>,
    next_attempt_at: i64,
    source_url: Option<String>,
    payload_path: Option<String>,
    content_kind: Option<String>,
    payload_size: Option<i64>,
    payload_sha256: Option<String>,
    discovered_at: String,
    updated_at: String,
}

impl TryFrom<RecordRow> for Record {
    type Error = StoreError;

    fn try_from(row: RecordRow) -> Result<Self> {
        let id = row.id;
        let occurred_at = DateTime::parse_from_rfc3339(&row.occurred_at)
            .map_err(|e| StoreError::corrupt(id, format!("occurred_at: {e}")))?
            .with_timezone(&Utc);
        let state = row
            .state
            .parse()
            .map_err(|e: String| StoreError::corrupt(id, e))?;
        let attempt_count = u32::try_from(row.attempt_count)
            .map_err(|_| StoreError::corrupt(id, "attempt_count out of range"))?;
        let last_error_kind = row
            .last_error_kind
            .as_deref()
            .map(str::parse)
            .transpose()
            .map_err(|e: String| StoreError::corrupt(id, e))?;
        let content_kind = row
            .content_kind
            .as_deref()
            .map(str::parse)
            .transpose()
            .map_err(|e: String| StoreError::corrupt(id, e))?;
        let payload_size = row
            .payload_size
            .map(u64::try_from)
            .transpose()
            .map_err(|_| StoreError::corrupt(id, "payload_size out of range"))?;

        Ok(Self {
            id,
            occurred_at,
            source_filename: row.source_filename,
            state,
            attempt_count,
            last_error: row.last_error,
            last_error_kind,
            next_attempt_at: row.next_attempt_at,
            source_url: row.source_url,
            payload_path: row.payload_path,
            content_kind,
            payload_size,
            payload_sha256: row.payload_sha256,
            discovered_at: row.discovered_at,
            updated_at: row.updated_at,
        })
    }
}

fn decode_rows(rows: Vec<RecordRow>) -> Result<Vec<Record>> {
    rows.into_iter().map(Record::try_from).collect()
}

#[derive(Debug, sqlx::FromRow)]
struct AttemptRow {
    id: i64,
    record_id: i64,
    outcome: String,
    url: Option<String>,
    http_status: Option<i64>,
    duration_ms: Option<i64>,
    detail: String,
    created_at: String,
}

impl TryFrom<AttemptRow> for AttemptLogEntry {
    type Error = StoreError;

    fn try_from(row: AttemptRow) -> Result<Self> {
        let outcome = row
            .outcome
            .parse()
            .map_err(|e: String| StoreError::corrupt(row.record_id, e))?;
        Ok(Self {
            id: row.id,
            record_id: row.record_id,
            outcome,
            url: row.url,
            http_status: row.http_status.and_then(|s| u16::try_from(s).ok()),
            duration_ms: row.duration_ms.and_then(|d| u64::try_from(d).ok()),
            detail: row.detail,
            created_at: row.created_at,
        })
    }
}

fn saturating_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// `SQLite`-backed record store.
///
/// Every transition is a single conditional `UPDATE`, so two workers can
/// never both observe a successful claim on the same record.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    db: Database,
}

impl SqliteStore {
    /// Creates a store over an open database.
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Returns the underlying database handle.
    #[must_use]
    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Builds the error for a conditional update that matched no row.
    async fn transition_error(&self, id: i64, expected: LifecycleState) -> StoreError {
        match RecordStore::get(self, id).await {
            Ok(Some(record)) => StoreError::InvalidTransition {
                id,
                expected,
                actual: record.state,
            },
            Ok(None) => StoreError::RecordNotFound(id),
            Err(e) => e,
        }
    }

    async fn check_transition(
        &self,
        id: i64,
        expected: LifecycleState,
        rows_affected: u64,
    ) -> Result<()> {
        if rows_affected == 0 {
            Err(self.transition_error(id, expected).await)
        } else {
            Ok(())
        }
    }
    /// Like [`Self::check_transition`] for updates fenced on the claim's attempt.
    async fn check_claimed_transition(
        &self,
        id: i64,
        attempt: u32,
        rows_affected: u64,
    ) -> Result<()> {
        if rows_affected > 0 {
            return Ok(());
        }
        match RecordStore::get(self, id).await? {
            Some(record)
                if record.state == LifecycleState::InProgress
                    && record.attempt_count != attempt =>
            {
                Err(StoreError::StaleClaim {
                    id,
                    attempt,
                    current: record.attempt_count,
                })
            }
            Some(record) => Err(StoreError::InvalidTransition {
                id,
                expected: LifecycleState::InProgress,
                actual: record.state,
            }),
            None => Err(StoreError::RecordNotFound(id)),
        }
    }
}

#[async_trait]
impl RecordStore for SqliteStore {
    #[instrument(skip(self, records), fields(count = records.len()))]
    async fn insert_if_absent(&self, records: &[DiscoveredRecord]) -> Result<u64> {
        if let Some(bad) = records.iter().find(|r| r.id <= 0) {
            return Err(StoreError::InvalidId(bad.id));
        }

        let mut tx = self.db.pool().begin().await?;
        let mut inserted = 0_u64;
        for record in records {
            let result = sqlx::query(
                r"INSERT INTO records (id, occurred_at, source_filename, state)
                  VALUES (?, ?, ?, ?)
                  ON CONFLICT(id) DO NOTHING",
            )
            .bind(record.id)
            .bind(format_timestamp(&record.occurred_at))
            .bind(&record.source_filename)
            .bind(LifecycleState::Pending.as_str())
            .execute(&mut *tx)
            .await?;
            inserted += result.rows_affected();
        }
        tx.commit().await?;

        debug!(inserted, offered = records.len(), "discovered records stored");
        Ok(inserted)
    }

    #[instrument(skip(self))]
    async fn claim(&self, id: i64, now_ms: i64) -> Result<Option<Record>> {
        // Conditional UPDATE...RETURNING is the atomic claim
        let row = sqlx::query_as::<_, RecordRow>(
            r"UPDATE records
              SET state = ?,
                  attempt_count = attempt_count + 1,
                  updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
              WHERE id = ? AND state = ? AND next_attempt_at <= ?
              RETURNING *",
        )
        .bind(LifecycleState::InProgress.as_str())
        .bind(id)
        .bind(LifecycleState::Pending.as_str())
        .bind(now_ms)
        .fetch_optional(self.db.pool())
        .await?;

        row.map(Record::try_from).transpose()
    }

    #[instrument(skip(self, error), fields(kind = %kind))]
    async fn fail_unclaimed(&self, id: i64, kind: ErrorKind, error: &str) -> Result<bool> {
        let result = sqlx::query(
            r"UPDATE records
              SET state = ?, last_error = ?, last_error_kind = ?,
                  updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
              WHERE id = ? AND state = ?",
        )
        .bind(LifecycleState::Failed.as_str())
        .bind(error)
        .bind(kind.as_str())
        .bind(id)
        .bind(LifecycleState::Pending.as_str())
        .execute(self.db.pool())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self, error), fields(kind = %kind))]
    async fn release(
        &self,
        id: i64,
        attempt: u32,
        kind: ErrorKind,
        error: &str,
        next_attempt_at: i64,
    ) -> Result<()> {
        let result = sqlx::query(
            r"UPDATE records
              SET state = ?, last_error = ?, last_error_kind = ?, next_attempt_at = ?,
                  updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
              WHERE id = ? AND state = ? AND attempt_count = ?",
        )
        .bind(LifecycleState::Pending.as_str())
        .bind(error)
        .bind(kind.as_str())
        .bind(next_attempt_at)
        .bind(id)
        .bind(LifecycleState::InProgress.as_str())
        .bind(i64::from(attempt))
        .execute(self.db.pool())
        .await?;

        self.check_claimed_transition(id, attempt, result.rows_affected())
            .await
    }

    #[instrument(skip(self, commit), fields(path = %commit.payload_path))]
    async fn commit_success(&self, id: i64, attempt: u32, commit: &PayloadCommit) -> Result<()> {
        let result = sqlx::query(
            r"UPDATE records
              SET state = ?, last_error = NULL, last_error_kind = NULL,
                  source_url = ?, payload_path = ?, content_kind = ?,
                  payload_size = ?, payload_sha256 = ?,
                  updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
              WHERE id = ? AND state = ? AND attempt_count = ?",
        )
        .bind(LifecycleState::Succeeded.as_str())
        .bind(&commit.source_url)
        .bind(&commit.payload_path)
        .bind(commit.content_kind.as_str())
        .bind(saturating_i64(commit.payload_size))
        .bind(&commit.payload_sha256)
        .bind(id)
        .bind(LifecycleState::InProgress.as_str())
        .bind(i64::from(attempt))
        .execute(self.db.pool())
        .await?;

        self.check_claimed_transition(id, attempt, result.rows_affected())
            .await
    }

    #[instrument(skip(self, error), fields(kind = %kind))]
    async fn commit_failure(
        &self,
        id: i64,
        attempt: u32,
        kind: ErrorKind,
        error: &str,
    ) -> Result<()> {
        let result = sqlx::query(
            r"UPDATE records
              SET state = ?, last_error = ?, last_error_kind = ?,
                  updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
              WHERE id = ? AND state = ? AND attempt_count = ?",
        )
        .bind(LifecycleState::Failed.as_str())
        .bind(error)
        .bind(kind.as_str())
        .bind(id)
        .bind(LifecycleState::InProgress.as_str())
        .bind(i64::from(attempt))
        .execute(self.db.pool())
        .await?;

        self.check_claimed_transition(id, attempt, result.rows_affected())
            .await
    }

    #[instrument(skip(self))]
    async fn mark_transformed(&self, id: i64) -> Result<()> {
        let result = sqlx::query(
            r"UPDATE records
              SET state = ?, last_error = NULL, last_error_kind = NULL,
                  updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
              WHERE id = ? AND state = ?",
        )
        .bind(LifecycleState::Transformed.as_str())
        .bind(id)
        .bind(LifecycleState::Succeeded.as_str())
        .execute(self.db.pool())
        .await?;

        self.check_transition(id, LifecycleState::Succeeded, result.rows_affected())
            .await
    }

    #[instrument(skip(self, error))]
    async fn record_transform_failure(&self, id: i64, error: &str) -> Result<()> {
        let result = sqlx::query(
            r"UPDATE records
              SET last_error = ?, last_error_kind = ?,
                  updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
              WHERE id = ? AND state = ?",
        )
        .bind(error)
        .bind(ErrorKind::TransformationFailure.as_str())
        .bind(id)
        .bind(LifecycleState::Succeeded.as_str())
        .execute(self.db.pool())
        .await?;

        self.check_transition(id, LifecycleState::Succeeded, result.rows_affected())
            .await
    }

    #[instrument(skip(self))]
    async fn pending_snapshot(&self, now_ms: i64, limit: Option<usize>) -> Result<Vec<Record>> {
        // SQLite treats a negative LIMIT as unbounded
        let limit = limit.map_or(-1, |l| i64::try_from(l).unwrap_or(i64::MAX));
        let rows = sqlx::query_as::<_, RecordRow>(
            r"SELECT * FROM records
              WHERE state = ? AND next_attempt_at <= ?
              ORDER BY occurred_at ASC, id ASC
              LIMIT ?",
        )
        .bind(LifecycleState::Pending.as_str())
        .bind(now_ms)
        .bind(limit)
        .fetch_all(self.db.pool())
        .await?;

        decode_rows(rows)
    }

    #[instrument(skip(self), fields(state = %state))]
    async fn list_by_state(&self, state: LifecycleState) -> Result<Vec<Record>> {
        let rows = sqlx::query_as::<_, RecordRow>(
            "SELECT * FROM records WHERE state = ? ORDER BY occurred_at ASC, id ASC",
        )
        .bind(state.as_str())
        .fetch_all(self.db.pool())
        .await?;

        decode_rows(rows)
    }

    async fn get(&self, id: i64) -> Result<Option<Record>> {
        let row = sqlx::query_as::<_, RecordRow>("SELECT * FROM records WHERE id = ?")
            .bind(id)
            .fetch_optional(self.db.pool())
            .await?;

        row.map(Record::try_from).transpose()
    }

    #[instrument(skip(self), fields(state = %state))]
    async fn count_by_state(&self, state: LifecycleState) -> Result<i64> {
        let count: i64 = sqlx::query("SELECT COUNT(*) AS count FROM records WHERE state = ?")
            .bind(state.as_str())
            .fetch_one(self.db.pool())
            .await?
            .get("count");

        Ok(count)
    }

    #[instrument(skip(self))]
    async fn counts(&self) -> Result<StateCounts> {
        let rows = sqlx::query("SELECT state, COUNT(*) AS count FROM records GROUP BY state")
            .fetch_all(self.db.pool())
            .await?;

        let mut counts = StateCounts::default();
        for row in rows {
            let state_str: String = row.get("state");
            let state: LifecycleState = state_str
                .parse()
                .map_err(|e: String| StoreError::corrupt(0, e))?;
            counts.add(state, row.get("count"));
        }
        Ok(counts)
    }

    #[instrument(skip(self))]
    async fn reset_in_progress(&self) -> Result<u64> {
        let result = sqlx::query(
            r"UPDATE records
              SET state = ?, updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
              WHERE state = ?",
        )
        .bind(LifecycleState::Pending.as_str())
        .bind(LifecycleState::InProgress.as_str())
        .execute(self.db.pool())
        .await?;

        Ok(result.rows_affected())
    }

    #[instrument(skip(self))]
    async fn requeue_failed(&self) -> Result<u64> {
        let result = sqlx::query(
            r"UPDATE records
              SET state = ?, next_attempt_at = 0,
                  updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
              WHERE state = ?",
        )
        .bind(LifecycleState::Pending.as_str())
        .bind(LifecycleState::Failed.as_str())
        .execute(self.db.pool())
        .await?;

        Ok(result.rows_affected())
    }

    #[instrument(skip(self, attempt), fields(record_id = attempt.record_id, outcome = %attempt.outcome))]
    async fn append_attempt(&self, attempt: &NewAttempt<'_>) -> Result<i64> {
        let id: i64 = sqlx::query(
            r"INSERT INTO attempt_log (record_id, outcome, url, http_status, duration_ms, detail)
              VALUES (?, ?, ?, ?, ?, ?)
              RETURNING id",
        )
        .bind(attempt.record_id)
        .bind(attempt.outcome.as_str())
        .bind(attempt.url)
        .bind(attempt.http_status.map(i64::from))
        .bind(attempt.duration_ms.map(saturating_i64))
        .bind(attempt.detail)
        .fetch_one(self.db.pool())
        .await?
        .get("id");

        Ok(id)
    }

    async fn attempts_for(&self, record_id: i64) -> Result<Vec<AttemptLogEntry>> {
        let rows = sqlx::query_as::<_, AttemptRow>(
            r"SELECT id, record_id, outcome, url, http_status, duration_ms, detail, created_at
              FROM attempt_log
              WHERE record_id = ?
              ORDER BY id ASC",
        )
        .bind(record_id)
        .fetch_all(self.db.pool())
        .await?;

        rows.into_iter().map(AttemptLogEntry::try_from).collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::fetch::ContentKind;

    async fn setup_store() -> SqliteStore {
        let db = Database::new_in_memory().await.unwrap();
        SqliteStore::new(db)
    }

    fn discovered(id: i64, day: u32) -> DiscoveredRecord {
        DiscoveredRecord::with_default_filename(
            id,
            Utc.with_ymd_and_hms(2024, 1, day, 0, 0, 0).unwrap(),
        )
    }

    fn sample_commit() -> PayloadCommit {
        PayloadCommit {
            source_url: "https://example.test/match_1.pgn.tar.gz".to_string(),
            payload_path: "/tmp/match_1.pgn.tar.gz".to_string(),
            content_kind: ContentKind::ValidArchive,
            payload_size: 64,
            payload_sha256: "ab".repeat(32),
        }
    }

    // ==================== Insert Tests ====================

    #[tokio::test]
    async fn test_insert_if_absent_ignores_duplicates() {
        let store = setup_store().await;
        let batch = vec![discovered(1, 1), discovered(2, 2)];

        assert_eq!(store.insert_if_absent(&batch).await.unwrap(), 2);
        assert_eq!(
            store
                .insert_if_absent(&[discovered(2, 2), discovered(3, 3)])
                .await
                .unwrap(),
            1
        );
        assert_eq!(store.counts().await.unwrap().total(), 3);
    }

    #[tokio::test]
    async fn test_insert_if_absent_does_not_reset_existing_state() {
        let store = setup_store().await;
        store.insert_if_absent(&[discovered(1, 1)]).await.unwrap();
        store.claim(1, unix_millis_now()).await.unwrap().unwrap();
        store.commit_success(1, 1, &sample_commit()).await.unwrap();

        store.insert_if_absent(&[discovered(1, 1)]).await.unwrap();

        let record = store.get(1).await.unwrap().unwrap();
        assert_eq!(record.state, LifecycleState::Succeeded);
    }

    #[tokio::test]
    async fn test_insert_if_absent_rejects_non_positive_id() {
        let store = setup_store().await;
        let result = store.insert_if_absent(&[discovered(0, 1)]).await;
        assert!(matches!(result, Err(StoreError::InvalidId(0))));
    }

    // ==================== Claim Tests ====================

    #[tokio::test]
    async fn test_claim_increments_attempt_count_once() {
        let store = setup_store().await;
        store.insert_if_absent(&[discovered(1, 1)]).await.unwrap();

        let record = store.claim(1, unix_millis_now()).await.unwrap().unwrap();
        assert_eq!(record.state, LifecycleState::InProgress);
        assert_eq!(record.attempt_count, 1);
    }

    #[tokio::test]
    async fn test_claim_is_exclusive() {
        let store = setup_store().await;
        store.insert_if_absent(&[discovered(1, 1)]).await.unwrap();

        let now = unix_millis_now();
        assert!(store.claim(1, now).await.unwrap().is_some());
        assert!(store.claim(1, now).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_claim_respects_next_attempt_at() {
        let store = setup_store().await;
        store.insert_if_absent(&[discovered(1, 1)]).await.unwrap();
        store.claim(1, 0).await.unwrap().unwrap();
        store
            .release(1, 1, ErrorKind::TransportError, "timeout", 10_000)
            .await
            .unwrap();

        assert!(store.claim(1, 9_999).await.unwrap().is_none());
        let record = store.claim(1, 10_000).await.unwrap().unwrap();
        assert_eq!(record.attempt_count, 2);
    }

    #[tokio::test]
    async fn test_claim_unknown_record_returns_none() {
        let store = setup_store().await;
        assert!(store.claim(999, unix_millis_now()).await.unwrap().is_none());
    }

    // ==================== Transition Tests ====================

    #[tokio::test]
    async fn test_fail_unclaimed_keeps_attempt_count() {
        let store = setup_store().await;
        store.insert_if_absent(&[discovered(1, 1)]).await.unwrap();

        assert!(
            store
                .fail_unclaimed(1, ErrorKind::MalformedIdentifier, "bad id")
                .await
                .unwrap()
        );

        let record = store.get(1).await.unwrap().unwrap();
        assert_eq!(record.state, LifecycleState::Failed);
        assert_eq!(record.attempt_count, 0);
        assert_eq!(record.last_error_kind, Some(ErrorKind::MalformedIdentifier));
        assert!(
            !store
                .fail_unclaimed(1, ErrorKind::MalformedIdentifier, "bad id")
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn test_commit_success_clears_last_error_and_stores_metadata() {
        let store = setup_store().await;
        store.insert_if_absent(&[discovered(1, 1)]).await.unwrap();
        store.claim(1, 0).await.unwrap().unwrap();
        store
            .release(1, 1, ErrorKind::AllCandidatesExhausted, "nothing found", 0)
            .await
            .unwrap();
        store.claim(1, 0).await.unwrap().unwrap();

        store.commit_success(1, 2, &sample_commit()).await.unwrap();

        let record = store.get(1).await.unwrap().unwrap();
        assert_eq!(record.state, LifecycleState::Succeeded);
        assert_eq!(record.attempt_count, 2);
        assert!(record.last_error.is_none());
        assert!(record.last_error_kind.is_none());
        assert_eq!(record.content_kind, Some(ContentKind::ValidArchive));
        assert_eq!(record.payload_size, Some(64));
    }

    #[tokio::test]
    async fn test_commit_success_requires_claim() {
        let store = setup_store().await;
        store.insert_if_absent(&[discovered(1, 1)]).await.unwrap();

        let result = store.commit_success(1, 1, &sample_commit()).await;
        assert!(matches!(
            result,
            Err(StoreError::InvalidTransition {
                id: 1,
                expected: LifecycleState::InProgress,
                actual: LifecycleState::Pending,
            })
        ));
    }

    #[tokio::test]
    async fn test_transitions_from_superseded_claim_are_rejected() {
        let store = setup_store().await;
        store.insert_if_absent(&[discovered(1, 1)]).await.unwrap();
        store.claim(1, 0).await.unwrap().unwrap();
        store.reset_in_progress().await.unwrap();
        let current = store.claim(1, 0).await.unwrap().unwrap();
        assert_eq!(current.attempt_count, 2);

        let stale = store.commit_success(1, 1, &sample_commit()).await;
        assert!(matches!(
            stale,
            Err(StoreError::StaleClaim {
                id: 1,
                attempt: 1,
                current: 2,
            })
        ));
        assert!(matches!(
            store
                .release(1, 1, ErrorKind::TransportError, "late", 0)
                .await,
            Err(StoreError::StaleClaim { .. })
        ));
        assert!(matches!(
            store
                .commit_failure(1, 1, ErrorKind::TransportError, "late")
                .await,
            Err(StoreError::StaleClaim { .. })
        ));

        let record = store.get(1).await.unwrap().unwrap();
        assert_eq!(record.state, LifecycleState::InProgress);
        assert!(record.payload_path.is_none());
        store.commit_success(1, 2, &sample_commit()).await.unwrap();
    }

    #[tokio::test]
    async fn test_commit_failure_unknown_record() {
        let store = setup_store().await;
        let result = store
            .commit_failure(42, 1, ErrorKind::TransportError, "boom")
            .await;
        assert!(matches!(result, Err(StoreError::RecordNotFound(42))));
    }

    #[tokio::test]
    async fn test_mark_transformed_only_from_succeeded() {
        let store = setup_store().await;
        store.insert_if_absent(&[discovered(1, 1)]).await.unwrap();

        assert!(store.mark_transformed(1).await.is_err());

        store.claim(1, 0).await.unwrap().unwrap();
        store.commit_success(1, 1, &sample_commit()).await.unwrap();
        store.mark_transformed(1).await.unwrap();

        let record = store.get(1).await.unwrap().unwrap();
        assert_eq!(record.state, LifecycleState::Transformed);
    }

    #[tokio::test]
    async fn test_record_transform_failure_keeps_succeeded() {
        let store = setup_store().await;
        store.insert_if_absent(&[discovered(1, 1)]).await.unwrap();
        store.claim(1, 0).await.unwrap().unwrap();
        store.commit_success(1, 1, &sample_commit()).await.unwrap();

        store
            .record_transform_failure(1, "no games in archive")
            .await
            .unwrap();

        let record = store.get(1).await.unwrap().unwrap();
        assert_eq!(record.state, LifecycleState::Succeeded);
        assert_eq!(
            record.last_error_kind,
            Some(ErrorKind::TransformationFailure)
        );
        assert_eq!(record.attempt_count, 1);
    }

    // ==================== Query Tests ====================

    #[tokio::test]
    async fn test_pending_snapshot_orders_by_occurred_at_then_id() {
        let store = setup_store().await;
        store
            .insert_if_absent(&[discovered(30, 3), discovered(10, 1), discovered(20, 1)])
            .await
            .unwrap();

        let ids: Vec<i64> = store
            .pending_snapshot(unix_millis_now(), None)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec![10, 20, 30]);

        let limited = store
            .pending_snapshot(unix_millis_now(), Some(2))
            .await
            .unwrap();
        assert_eq!(limited.len(), 2);
    }

    #[tokio::test]
    async fn test_counts_and_count_by_state() {
        let store = setup_store().await;
        store
            .insert_if_absent(&[discovered(1, 1), discovered(2, 2), discovered(3, 3)])
            .await
            .unwrap();
        store.claim(1, 0).await.unwrap().unwrap();

        let counts = store.counts().await.unwrap();
        assert_eq!(counts.pending, 2);
        assert_eq!(counts.in_progress, 1);
        assert_eq!(counts.total(), 3);
        assert_eq!(
            store.count_by_state(LifecycleState::Pending).await.unwrap(),
            2
        );
    }

    // ==================== Recovery Tests ====================

    #[tokio::test]
    async fn test_reset_in_progress_returns_records_to_pending() {
        let store = setup_store().await;
        store
            .insert_if_absent(&[discovered(1, 1), discovered(2, 2)])
            .await
            .unwrap();
        store.claim(1, 0).await.unwrap().unwrap();
        store.claim(2, 0).await.unwrap().unwrap();

        assert_eq!(store.reset_in_progress().await.unwrap(), 2);

        let record = store.get(1).await.unwrap().unwrap();
        assert_eq!(record.state, LifecycleState::Pending);
        assert_eq!(record.attempt_count, 1);
    }

    #[tokio::test]
    async fn test_requeue_failed_preserves_attempt_count() {
        let store = setup_store().await;
        store.insert_if_absent(&[discovered(1, 1)]).await.unwrap();
        store.claim(1, 0).await.unwrap().unwrap();
        store
            .commit_failure(1, 1, ErrorKind::AllCandidatesExhausted, "gone")
            .await
            .unwrap();

        assert_eq!(store.requeue_failed().await.unwrap(), 1);

        let record = store.get(1).await.unwrap().unwrap();
        assert_eq!(record.state, LifecycleState::Pending);
        assert_eq!(record.attempt_count, 1);
        assert_eq!(record.next_attempt_at, 0);
    }

    // ==================== Attempt Log Tests ====================

    #[tokio::test]
    async fn test_append_attempt_and_read_back_in_order() {
        let store = setup_store().await;
        store.insert_if_absent(&[discovered(1, 1)]).await.unwrap();

        store
            .append_attempt(
                &NewAttempt::new(1, AttemptOutcome::InvalidContent, "soft 404")
                    .with_url("https://example.test/a")
                    .with_http_status(Some(200))
                    .with_duration_ms(15),
            )
            .await
            .unwrap();
        store
            .append_attempt(&NewAttempt::new(1, AttemptOutcome::Success, "archive"))
            .await
            .unwrap();

        let entries = store.attempts_for(1).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].outcome, AttemptOutcome::InvalidContent);
        assert_eq!(entries[0].http_status, Some(200));
        assert_eq!(entries[0].duration_ms, Some(15));
        assert_eq!(entries[1].outcome, AttemptOutcome::Success);
        assert!(entries[1].url.is_none());
    }
}
