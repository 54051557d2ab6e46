//! In-memory record store for tests and dry runs.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use tokio::sync::Mutex;

use super::{
    AttemptLogEntry, DiscoveredRecord, ErrorKind, LifecycleState, NewAttempt, PayloadCommit,
    Record, RecordStore, Result, StateCounts, StoreError,
};

#[derive(Debug, Default)]
struct MemoryState {
    records: BTreeMap<i64, Record>,
    attempts: Vec<AttemptLogEntry>,
}

impl MemoryState {
    fn require(&mut self, id: i64, expected: LifecycleState) -> Result<&mut Record> {
        let record = self
            .records
            .get_mut(&id)
            .ok_or(StoreError::RecordNotFound(id))?;
        if record.state != expected {
            return Err(StoreError::InvalidTransition {
                id,
                expected,
                actual: record.state,
            });
        }
        Ok(record)
    }

    fn require_claimed(&mut self, id: i64, attempt: u32) -> Result<&mut Record> {
        let record = self.require(id, LifecycleState::InProgress)?;
        if record.attempt_count != attempt {
            return Err(StoreError::StaleClaim {
                id,
                attempt,
                current: record.attempt_count,
            });
        }
        Ok(record)
    }

    fn sorted_by_schedule<'a>(records: impl Iterator<Item = &'a Record>) -> Vec<Record> {
        let mut out: Vec<Record> = records.cloned().collect();
        out.sort_by(|a, b| a.occurred_at.cmp(&b.occurred_at).then(a.id.cmp(&b.id)));
        out
    }
}

fn now_string() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Record store kept entirely in process memory.
///
/// Same transition rules as [`SqliteStore`](super::SqliteStore); all state is
/// lost when the store is dropped.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn insert_if_absent(&self, records: &[DiscoveredRecord]) -> Result<u64> {
        if let Some(bad) = records.iter().find(|r| r.id <= 0) {
            return Err(StoreError::InvalidId(bad.id));
        }

        let mut state = self.state.lock().await;
        let mut inserted = 0;
        for discovered in records {
            if state.records.contains_key(&discovered.id) {
                continue;
            }
            let now = now_string();
            state.records.insert(
                discovered.id,
                Record {
                    id: discovered.id,
                    occurred_at: discovered.occurred_at,
                    source_filename: discovered.source_filename.clone(),
                    state: LifecycleState::Pending,
                    attempt_count: 0,
                    last_error: None,
                    last_error_kind: None,
                    next_attempt_at: 0,
                    source_url: None,
                    payload_path: None,
                    content_kind: None,
                    payload_size: None,
                    payload_sha256: None,
                    discovered_at: now.clone(),
                    updated_at: now,
                },
            );
            inserted += 1;
        }
        Ok(inserted)
    }

    async fn claim(&self, id: i64, now_ms: i64) -> Result<Option<Record>> {
        let mut state = self.state.lock().await;
        let Some(record) = state.records.get_mut(&id) else {
            return Ok(None);
        };
        if record.state != LifecycleState::Pending || record.next_attempt_at > now_ms {
            return Ok(None);
        }
        record.state = LifecycleState::InProgress;
        record.attempt_count = record.attempt_count.saturating_add(1);
        record.updated_at = now_string();
        Ok(Some(record.clone()))
    }

    async fn fail_unclaimed(&self, id: i64, kind: ErrorKind, error: &str) -> Result<bool> {
        let mut state = self.state.lock().await;
        match state.records.get_mut(&id) {
            Some(record) if record.state == LifecycleState::Pending => {
                record.state = LifecycleState::Failed;
                record.last_error = Some(error.to_string());
                record.last_error_kind = Some(kind);
                record.updated_at = now_string();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(
        &self,
        id: i64,
        attempt: u32,
        kind: ErrorKind,
        error: &str,
        next_attempt_at: i64,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        let record = state.require_claimed(id, attempt)?;
        record.state = LifecycleState::Pending;
        record.last_error = Some(error.to_string());
        record.last_error_kind = Some(kind);
        record.next_attempt_at = next_attempt_at;
        record.updated_at = now_string();
        Ok(())
    }

    async fn commit_success(&self, id: i64, attempt: u32, commit: &PayloadCommit) -> Result<()> {
        let mut state = self.state.lock().await;
        let record = state.require_claimed(id, attempt)?;
        record.state = LifecycleState::Succeeded;
        record.last_error = None;
        record.last_error_kind = None;
        record.source_url = Some(commit.source_url.clone());
        record.payload_path = Some(commit.payload_path.clone());
        record.content_kind = Some(commit.content_kind);
        record.payload_size = Some(commit.payload_size);
        record.payload_sha256 = Some(commit.payload_sha256.clone());
        record.updated_at = now_string();
        Ok(())
    }

    async fn commit_failure(
        &self,
        id: i64,
        attempt: u32,
        kind: ErrorKind,
        error: &str,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        let record = state.require_claimed(id, attempt)?;
        record.state = LifecycleState::Failed;
        record.last_error = Some(error.to_string());
        record.last_error_kind = Some(kind);
        record.updated_at = now_string();
        Ok(())
    }

    async fn mark_transformed(&self, id: i64) -> Result<()> {
        let mut state = self.state.lock().await;
        let record = state.require(id, LifecycleState::Succeeded)?;
        record.state = LifecycleState::Transformed;
        record.last_error = None;
        record.last_error_kind = None;
        record.updated_at = now_string();
        Ok(())
    }

    async fn record_transform_failure(&self, id: i64, error: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let record = state.require(id, LifecycleState::Succeeded)?;
        record.last_error = Some(error.to_string());
        record.last_error_kind = Some(ErrorKind::TransformationFailure);
        record.updated_at = now_string();
        Ok(())
    }

    async fn pending_snapshot(&self, now_ms: i64, limit: Option<usize>) -> Result<Vec<Record>> {
        let state = self.state.lock().await;
        let mut out = MemoryState::sorted_by_schedule(state.records.values().filter(|r| {
            r.state == LifecycleState::Pending && r.next_attempt_at <= now_ms
        }));
        if let Some(limit) = limit {
            out.truncate(limit);
        }
        Ok(out)
    }

    async fn list_by_state(&self, wanted: LifecycleState) -> Result<Vec<Record>> {
        let state = self.state.lock().await;
        Ok(MemoryState::sorted_by_schedule(
            state.records.values().filter(|r| r.state == wanted),
        ))
    }

    async fn get(&self, id: i64) -> Result<Option<Record>> {
        Ok(self.state.lock().await.records.get(&id).cloned())
    }

    async fn count_by_state(&self, wanted: LifecycleState) -> Result<i64> {
        let state = self.state.lock().await;
        let count = state.records.values().filter(|r| r.state == wanted).count();
        Ok(i64::try_from(count).unwrap_or(i64::MAX))
    }

    async fn counts(&self) -> Result<StateCounts> {
        let state = self.state.lock().await;
        let mut counts = StateCounts::default();
        for record in state.records.values() {
            counts.add(record.state, 1);
        }
        Ok(counts)
    }

    async fn reset_in_progress(&self) -> Result<u64> {
        let mut state = self.state.lock().await;
        let mut reset = 0;
        for record in state.records.values_mut() {
            if record.state == LifecycleState::InProgress {
                record.state = LifecycleState::Pending;
                record.updated_at = now_string();
                reset += 1;
            }
        }
        Ok(reset)
    }

    async fn requeue_failed(&self) -> Result<u64> {
        let mut state = self.state.lock().await;
        let mut requeued = 0;
        for record in state.records.values_mut() {
            if record.state == LifecycleState::Failed {
                record.state = LifecycleState::Pending;
                record.next_attempt_at = 0;
                record.updated_at = now_string();
                requeued += 1;
            }
        }
        Ok(requeued)
    }

    async fn append_attempt(&self, attempt: &NewAttempt<'_>) -> Result<i64> {
        let mut state = self.state.lock().await;
        if !state.records.contains_key(&attempt.record_id) {
            return Err(StoreError::RecordNotFound(attempt.record_id));
        }
        let id = i64::try_from(state.attempts.len()).unwrap_or(i64::MAX - 1) + 1;
        state.attempts.push(AttemptLogEntry {
            id,
            record_id: attempt.record_id,
            outcome: attempt.outcome,
            url: attempt.url.map(str::to_string),
            http_status: attempt.http_status,
            duration_ms: attempt.duration_ms,
            detail: attempt.detail.to_string(),
            created_at: now_string(),
        });
        Ok(id)
    }

    async fn attempts_for(&self, record_id: i64) -> Result<Vec<AttemptLogEntry>> {
        let state = self.state.lock().await;
        Ok(state
            .attempts
            .iter()
            .filter(|a| a.record_id == record_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;

    use chrono::TimeZone;

    use super::*;
    use crate::store::AttemptOutcome;

    fn discovered(id: i64) -> DiscoveredRecord {
        DiscoveredRecord::with_default_filename(
            id,
            Utc.with_ymd_and_hms(2023, 5, 1, 0, 0, 0).unwrap(),
        )
    }

    #[tokio::test]
    async fn test_memory_store_claim_and_commit_flow() {
        let store = MemoryStore::new();
        assert_eq!(store.insert_if_absent(&[discovered(1)]).await.unwrap(), 1);
        assert_eq!(store.insert_if_absent(&[discovered(1)]).await.unwrap(), 0);

        let claimed = store.claim(1, 0).await.unwrap().unwrap();
        assert_eq!(claimed.attempt_count, 1);
        assert!(store.claim(1, 0).await.unwrap().is_none());

        store
            .commit_failure(1, 1, ErrorKind::AllCandidatesExhausted, "nothing")
            .await
            .unwrap();
        assert_eq!(
            store.count_by_state(LifecycleState::Failed).await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_memory_store_concurrent_claims_are_exclusive() {
        let store = Arc::new(MemoryStore::new());
        store.insert_if_absent(&[discovered(5)]).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store.claim(5, 0).await.unwrap().is_some()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_memory_store_transition_errors_match_sqlite() {
        let store = MemoryStore::new();
        store.insert_if_absent(&[discovered(2)]).await.unwrap();

        assert!(matches!(
            store.mark_transformed(2).await,
            Err(StoreError::InvalidTransition {
                expected: LifecycleState::Succeeded,
                actual: LifecycleState::Pending,
                ..
            })
        ));
        assert!(matches!(
            store.release(9, 1, ErrorKind::TransportError, "x", 0).await,
            Err(StoreError::RecordNotFound(9))
        ));
    }

    #[tokio::test]
    async fn test_memory_store_rejects_superseded_claim() {
        let store = MemoryStore::new();
        store.insert_if_absent(&[discovered(4)]).await.unwrap();
        store.claim(4, 0).await.unwrap().unwrap();
        store.reset_in_progress().await.unwrap();
        store.claim(4, 0).await.unwrap().unwrap();

        assert!(matches!(
            store
                .commit_failure(4, 1, ErrorKind::TransportError, "late")
                .await,
            Err(StoreError::StaleClaim {
                id: 4,
                attempt: 1,
                current: 2,
            })
        ));
        assert_eq!(
            store.get(4).await.unwrap().unwrap().state,
            LifecycleState::InProgress
        );
    }

    #[tokio::test]
    async fn test_memory_store_attempt_log_requires_record() {
        let store = MemoryStore::new();
        let result = store
            .append_attempt(&NewAttempt::new(3, AttemptOutcome::Success, ""))
            .await;
        assert!(matches!(result, Err(StoreError::RecordNotFound(3))));
    }
}
