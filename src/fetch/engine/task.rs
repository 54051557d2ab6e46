//! The per-record fetch cycle executed inside a worker task.

use std::sync::Arc;
use std::time::Instant;

use tokio::task::JoinError;
use tracing::{debug, info, instrument, warn};

use super::{EngineContext, FetchStats};
use crate::fetch::{
    ContentValidator, FetchOutcome, FetchResult, HttpClient, RecordOutcome, RetryDecision,
};
use crate::store::{
    AttemptOutcome, ErrorKind, NewAttempt, PayloadCommit, Record, RecordStore, StoreError,
    unix_millis_now,
};

/// Requests one candidate and classifies the answer.
async fn fetch_candidate(
    client: &HttpClient,
    validator: &ContentValidator,
    record_id: i64,
    url: &str,
) -> FetchResult {
    let started = Instant::now();
    let (http_status, outcome) = match client.get(url).await {
        Ok(response) if matches!(response.status, 404 | 410) => {
            (Some(response.status), FetchOutcome::NotFound)
        }
        Ok(response) => {
            let kind = validator.classify(response.status, &response.body);
            let outcome = if kind.is_valid() {
                FetchOutcome::Success {
                    bytes: response.body,
                    kind,
                }
            } else {
                FetchOutcome::InvalidContent {
                    reason: format!("{kind} (HTTP {})", response.status),
                }
            };
            (Some(response.status), outcome)
        }
        Err(e) if e.is_transport() => (
            None,
            FetchOutcome::TransportError {
                message: e.to_string(),
            },
        ),
        Err(e) => (
            None,
            FetchOutcome::InvalidContent {
                reason: e.to_string(),
            },
        ),
    };

    FetchResult {
        record_id,
        url: url.to_string(),
        http_status,
        duration: started.elapsed(),
        outcome,
    }
}

/// Runs one fetch cycle for a record this worker has already claimed.
///
/// `candidates` were resolved before the claim, in priority order. Each is
/// tried at most once. The first valid payload is written and committed;
/// otherwise the retry policy decides between rescheduling and failing.
/// Only store errors escape, except a superseded claim, which is reported
/// as skipped.
#[instrument(skip(ctx, record, candidates), fields(record_id = record.id, attempt = record.attempt_count))]
pub(super) async fn process_record(
    ctx: Arc<EngineContext>,
    record: Record,
    candidates: Vec<String>,
) -> Result<RecordOutcome, StoreError> {
    let store = ctx.store.as_ref();
    let mut saw_transport_error = false;
    let mut last_detail = String::new();

    for url in candidates {
        let result = fetch_candidate(&ctx.client, &ctx.validator, record.id, &url).await;
        ctx.stats.increment_requests();
        let detail = result.detail();
        debug!(url = %url, outcome = %result.attempt_outcome(), detail = %detail, "candidate answered");
        log_attempt(
            store,
            &NewAttempt::new(record.id, result.attempt_outcome(), &detail)
                .with_url(&url)
                .with_http_status(result.http_status)
                .with_duration_ms(result.duration_ms()),
        )
        .await;

        match result.outcome {
            FetchOutcome::Success { bytes, kind } => {
                match ctx.writer.write(&record, kind, &bytes).await {
                    Ok(written) => {
                        let commit = PayloadCommit {
                            source_url: url.clone(),
                            payload_path: written.path.to_string_lossy().into_owned(),
                            content_kind: kind,
                            payload_size: written.size,
                            payload_sha256: written.sha256,
                        };
                        if let Err(e) = store
                            .commit_success(record.id, record.attempt_count, &commit)
                            .await
                        {
                            return lost_claim(&ctx.stats, &record, e);
                        }
                        ctx.stats.increment_succeeded();
                        info!(url = %url, path = %commit.payload_path, "record fetched");
                        return Ok(RecordOutcome::succeeded(record.id, record.attempt_count));
                    }
                    Err(e) => {
                        warn!(url = %url, error = %e, "failed to persist payload");
                        saw_transport_error = true;
                        last_detail = e.to_string();
                        break;
                    }
                }
            }
            FetchOutcome::TransportError { .. } => {
                saw_transport_error = true;
                last_detail = detail;
            }
            FetchOutcome::NotFound | FetchOutcome::InvalidContent { .. } => {
                last_detail = detail;
            }
        }
    }

    let kind = if saw_transport_error {
        ErrorKind::TransportError
    } else {
        ErrorKind::AllCandidatesExhausted
    };
    let error = format!("{kind}: {last_detail}");
    log_attempt(
        store,
        &NewAttempt::new(record.id, AttemptOutcome::AllCandidatesExhausted, &error),
    )
    .await;

    match ctx.policy.decide(record.attempt_count, kind) {
        RetryDecision::RetryAfter(delay) => {
            let delay_ms = i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);
            let next_attempt_at = unix_millis_now().saturating_add(delay_ms);
            if let Err(e) = store
                .release(record.id, record.attempt_count, kind, &error, next_attempt_at)
                .await
            {
                return lost_claim(&ctx.stats, &record, e);
            }
            ctx.stats.increment_retried();
            debug!(delay_ms, "cycle failed, retry scheduled");
            Ok(RecordOutcome::retry_scheduled(
                record.id,
                record.attempt_count,
                next_attempt_at,
                kind,
                error,
            ))
        }
        RetryDecision::GiveUp => {
            if let Err(e) = store
                .commit_failure(record.id, record.attempt_count, kind, &error)
                .await
            {
                return lost_claim(&ctx.stats, &record, e);
            }
            ctx.stats.increment_failed();
            warn!(error = %error, "record failed after final attempt");
            Ok(RecordOutcome::failed(
                record.id,
                record.attempt_count,
                kind,
                error,
            ))
        }
    }
}

/// A superseded claim becomes a skip; any other store error is returned.
fn lost_claim(
    stats: &FetchStats,
    record: &Record,
    error: StoreError,
) -> Result<RecordOutcome, StoreError> {
    if let StoreError::StaleClaim { current, .. } = error {
        warn!(
            record_id = record.id,
            attempt = record.attempt_count,
            current,
            "claim was superseded; dropping this cycle's result"
        );
        stats.increment_skipped();
        return Ok(RecordOutcome::skipped(record.id, record.attempt_count));
    }
    Err(error)
}

/// Appends an audit row. Audit failures are logged, never fatal.
pub(super) async fn log_attempt(store: &dyn RecordStore, attempt: &NewAttempt<'_>) {
    if let Err(e) = store.append_attempt(attempt).await {
        warn!(
            record_id = attempt.record_id,
            error = %e,
            "failed to append attempt log row"
        );
    }
}

pub(super) async fn handle_task_join_error(
    store: &dyn RecordStore,
    record_id: i64,
    attempt_count: u32,
    join_error: JoinError,
    stats: &FetchStats,
) -> RecordOutcome {
    warn!(record_id, error = %join_error, "fetch task panicked");
    let detail = format!("task panic: {join_error}");
    if let Err(store_error) = store
        .commit_failure(
            record_id,
            attempt_count,
            ErrorKind::AllCandidatesExhausted,
            &detail,
        )
        .await
    {
        warn!(
            record_id,
            error = %store_error,
            "failed to mark panicked record as failed"
        );
    }
    stats.increment_failed();
    RecordOutcome::failed(
        record_id,
        attempt_count,
        ErrorKind::AllCandidatesExhausted,
        detail,
    )
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::fetch::Disposition;
    use crate::store::{DiscoveredRecord, MemoryStore};

    async fn claimed_record() -> Record {
        let store = MemoryStore::new();
        store
            .insert_if_absent(&[DiscoveredRecord::with_default_filename(
                3,
                Utc.with_ymd_and_hms(2024, 2, 2, 0, 0, 0).unwrap(),
            )])
            .await
            .unwrap();
        store.claim(3, unix_millis_now()).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_superseded_claim_is_reported_as_skipped() {
        let stats = FetchStats::default();
        let record = claimed_record().await;
        let stale = StoreError::StaleClaim {
            id: 3,
            attempt: 1,
            current: 2,
        };

        let outcome = lost_claim(&stats, &record, stale).unwrap();

        assert_eq!(outcome.disposition, Disposition::Skipped);
        assert_eq!(stats.skipped(), 1);
    }

    #[tokio::test]
    async fn test_other_store_errors_still_escape() {
        let stats = FetchStats::default();
        let record = claimed_record().await;

        let result = lost_claim(&stats, &record, StoreError::RecordNotFound(3));

        assert!(matches!(result, Err(StoreError::RecordNotFound(3))));
        assert_eq!(stats.skipped(), 0);
    }
}
