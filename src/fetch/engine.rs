//! Fetch engine for bounded-concurrency acquisition of pending records.
//!
//! The engine walks a snapshot of pending records in order, claims each one
//! through the [`RecordStore`] immediately before spawning its worker, and
//! runs one fetch cycle per claimed record. Concurrency is capped by a
//! semaphore; the claim itself is the store's conditional transition, so two
//! engines sharing a store never process the same record at once.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::sync::atomic::AtomicBool;
//! use match_archiver::fetch::{ContentValidator, FetchEngine, HttpClient, PayloadWriter, RetryPolicy};
//! use match_archiver::resolver::LayoutResolver;
//! use match_archiver::store::{MemoryStore, RecordStore, unix_millis_now};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store: Arc<dyn RecordStore> = Arc::new(MemoryStore::new());
//! let engine = FetchEngine::new(
//!     10,
//!     RetryPolicy::default(),
//!     LayoutResolver::with_default_layouts("https://storage.lczero.org/files/match_pgns/", "1")?,
//!     ContentValidator::default(),
//!     HttpClient::with_defaults()?,
//!     PayloadWriter::new("downloads"),
//! )?;
//! let snapshot = store.pending_snapshot(unix_millis_now(), None).await?;
//! let report = engine
//!     .run_batch(store, snapshot, Arc::new(AtomicBool::new(false)))
//!     .await?;
//! println!("succeeded: {}", report.succeeded());
//! # Ok(())
//! # }
//! ```

mod persistence;
mod task;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

pub use persistence::{PayloadWriter, WrittenPayload};

use super::constants::{MAX_CONCURRENCY, MIN_CONCURRENCY};
use super::result::{Disposition, RecordOutcome};
use super::{ContentValidator, HttpClient, RetryPolicy};
use crate::resolver::LayoutResolver;
use crate::store::{
    AttemptOutcome, ErrorKind, NewAttempt, Record, RecordStore, StoreError, unix_millis_now,
};

/// Error type for fetch engine operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Invalid concurrency value provided.
    #[error(
        "invalid concurrency value {value}: must be between {MIN_CONCURRENCY} and {MAX_CONCURRENCY}"
    )]
    InvalidConcurrency {
        /// The invalid value that was provided.
        value: usize,
    },

    /// A state store operation failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Semaphore was closed unexpectedly.
    #[error("semaphore closed unexpectedly")]
    SemaphoreClosed,
}

impl EngineError {
    /// True when a batch stopped because the state database stayed busy or locked.
    #[must_use]
    pub fn is_store_busy(&self) -> bool {
        matches!(self, Self::Store(e) if e.is_busy_or_locked())
    }
}

/// Counters shared by the worker tasks of one batch.
#[derive(Debug, Default)]
pub struct FetchStats {
    succeeded: AtomicUsize,
    retried: AtomicUsize,
    failed: AtomicUsize,
    skipped: AtomicUsize,
    requests: AtomicUsize,
}

impl FetchStats {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn succeeded(&self) -> usize {
        self.succeeded.load(Ordering::SeqCst)
    }

    /// Records returned to pending with a scheduled retry.
    #[must_use]
    pub fn retried(&self) -> usize {
        self.retried.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn failed(&self) -> usize {
        self.failed.load(Ordering::SeqCst)
    }

    /// Snapshot entries another worker had already taken.
    #[must_use]
    pub fn skipped(&self) -> usize {
        self.skipped.load(Ordering::SeqCst)
    }

    /// Candidate requests issued, across all records.
    #[must_use]
    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    fn increment_succeeded(&self) {
        self.succeeded.fetch_add(1, Ordering::SeqCst);
    }

    fn increment_retried(&self) {
        self.retried.fetch_add(1, Ordering::SeqCst);
    }

    fn increment_failed(&self) {
        self.failed.fetch_add(1, Ordering::SeqCst);
    }

    fn increment_skipped(&self) {
        self.skipped.fetch_add(1, Ordering::SeqCst);
    }

    fn increment_requests(&self) {
        self.requests.fetch_add(1, Ordering::SeqCst);
    }
}

/// Result of one [`FetchEngine::run_batch`] call.
#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    /// One entry per snapshot record the engine reached, in completion order.
    pub outcomes: Vec<RecordOutcome>,
    /// True when the cancel flag stopped the batch before the snapshot ran out.
    pub interrupted: bool,
    /// Candidate requests issued.
    pub requests: usize,
}

impl BatchReport {
    fn count(&self, pred: impl Fn(&Disposition) -> bool) -> usize {
        self.outcomes
            .iter()
            .filter(|o| pred(&o.disposition))
            .count()
    }

    #[must_use]
    pub fn succeeded(&self) -> usize {
        self.count(|d| matches!(d, Disposition::Succeeded))
    }

    #[must_use]
    pub fn retry_scheduled(&self) -> usize {
        self.count(|d| matches!(d, Disposition::RetryScheduled { .. }))
    }

    #[must_use]
    pub fn failed(&self) -> usize {
        self.count(|d| matches!(d, Disposition::Failed))
    }

    #[must_use]
    pub fn skipped(&self) -> usize {
        self.count(|d| matches!(d, Disposition::Skipped))
    }
}

/// Everything a worker task needs, shared behind one `Arc`.
pub(crate) struct EngineContext {
    store: Arc<dyn RecordStore>,
    client: HttpClient,
    validator: ContentValidator,
    resolver: LayoutResolver,
    policy: RetryPolicy,
    writer: PayloadWriter,
    stats: FetchStats,
}

type TaskHandle = (i64, u32, JoinHandle<Result<RecordOutcome, StoreError>>);

/// Bounded-concurrency fetch engine.
#[derive(Debug, Clone)]
pub struct FetchEngine {
    semaphore: Arc<Semaphore>,
    concurrency: usize,
    policy: RetryPolicy,
    resolver: LayoutResolver,
    validator: ContentValidator,
    client: HttpClient,
    writer: PayloadWriter,
}

impl FetchEngine {
    /// Creates an engine.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidConcurrency`] if `concurrency` is outside
    /// `MIN_CONCURRENCY..=MAX_CONCURRENCY`.
    pub fn new(
        concurrency: usize,
        policy: RetryPolicy,
        resolver: LayoutResolver,
        validator: ContentValidator,
        client: HttpClient,
        writer: PayloadWriter,
    ) -> Result<Self, EngineError> {
        if !(MIN_CONCURRENCY..=MAX_CONCURRENCY).contains(&concurrency) {
            return Err(EngineError::InvalidConcurrency { value: concurrency });
        }

        debug!(concurrency, "creating fetch engine");

        Ok(Self {
            semaphore: Arc::new(Semaphore::new(concurrency)),
            concurrency,
            policy,
            resolver,
            validator,
            client,
            writer,
        })
    }

    #[must_use]
    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    #[must_use]
    pub fn writer(&self) -> &PayloadWriter {
        &self.writer
    }

    /// Runs one fetch cycle for every claimable record in `snapshot`.
    ///
    /// Records that fail to resolve are failed without a claim. The rest are
    /// claimed just before their worker starts; a record that is no longer
    /// claimable is reported as skipped. When `cancel` is set no further
    /// records are claimed, and in-flight cycles run to completion.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Store`] for the first state store failure. No
    /// new records are claimed after it, but in-flight workers are awaited.
    /// Returns [`EngineError::SemaphoreClosed`] if permit acquisition fails.
    #[allow(clippy::too_many_lines)]
    #[instrument(skip(self, store, snapshot, cancel), fields(snapshot = snapshot.len(), concurrency = self.concurrency))]
    pub async fn run_batch(
        &self,
        store: Arc<dyn RecordStore>,
        snapshot: Vec<Record>,
        cancel: Arc<AtomicBool>,
    ) -> Result<BatchReport, EngineError> {
        let ctx = Arc::new(EngineContext {
            store: Arc::clone(&store),
            client: self.client.clone(),
            validator: self.validator,
            resolver: self.resolver.clone(),
            policy: self.policy,
            writer: self.writer.clone(),
            stats: FetchStats::new(),
        });
        let mut handles: Vec<TaskHandle> = Vec::new();
        let mut report = BatchReport::default();
        let mut first_error: Option<StoreError> = None;

        info!("starting fetch batch");

        for record in snapshot {
            if cancel.load(Ordering::SeqCst) {
                report.interrupted = true;
                break;
            }
            drain_finished_tasks(&mut handles, &ctx, &mut report, &mut first_error).await;
            if first_error.is_some() {
                break;
            }

            let candidates: Vec<String> = match ctx.resolver.candidates(&record) {
                Ok(candidates) => candidates.collect(),
                Err(e) => {
                    match fail_malformed(&ctx, &record, &e.to_string()).await {
                        Ok(Some(outcome)) => report.outcomes.push(outcome),
                        Ok(None) => {}
                        Err(store_error) => {
                            first_error = Some(store_error);
                            break;
                        }
                    }
                    continue;
                }
            };

            let permit = tokio::select! {
                biased;
                () = async {
                    while !cancel.load(Ordering::SeqCst) {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                } => {
                    report.interrupted = true;
                    None
                }
                result = Arc::clone(&self.semaphore).acquire_owned() => {
                    Some(result.map_err(|_| EngineError::SemaphoreClosed)?)
                }
            };
            let Some(permit) = permit else {
                break;
            };
            if cancel.load(Ordering::SeqCst) {
                report.interrupted = true;
                break;
            }

            let claimed = match store.claim(record.id, unix_millis_now()).await {
                Ok(claimed) => claimed,
                Err(e) => {
                    first_error = Some(e);
                    break;
                }
            };
            let Some(claimed) = claimed else {
                debug!(record_id = record.id, "record no longer claimable");
                ctx.stats.increment_skipped();
                report
                    .outcomes
                    .push(RecordOutcome::skipped(record.id, record.attempt_count));
                continue;
            };

            debug!(
                record_id = claimed.id,
                attempt = claimed.attempt_count,
                "claimed record"
            );
            let task_ctx = Arc::clone(&ctx);
            let id = claimed.id;
            let attempt_count = claimed.attempt_count;
            handles.push((
                id,
                attempt_count,
                tokio::spawn(async move {
                    let _permit = permit;
                    task::process_record(task_ctx, claimed, candidates).await
                }),
            ));
        }

        debug!(task_count = handles.len(), "waiting for fetch tasks to complete");

        for (id, attempt_count, handle) in handles {
            collect_task(handle.await, id, attempt_count, &ctx, &mut report, &mut first_error)
                .await;
        }
        if cancel.load(Ordering::SeqCst) {
            report.interrupted = true;
        }

        report.requests = ctx.stats.requests();
        info!(
            succeeded = ctx.stats.succeeded(),
            retried = ctx.stats.retried(),
            failed = ctx.stats.failed(),
            skipped = ctx.stats.skipped(),
            requests = report.requests,
            interrupted = report.interrupted,
            "fetch batch complete"
        );

        match first_error {
            Some(e) => Err(EngineError::Store(e)),
            None => Ok(report),
        }
    }
}

/// Fails a record whose identifier cannot produce candidates. The record is
/// never claimed, so its attempt count is untouched.
async fn fail_malformed(
    ctx: &EngineContext,
    record: &Record,
    detail: &str,
) -> Result<Option<RecordOutcome>, StoreError> {
    let store = ctx.store.as_ref();
    if !store
        .fail_unclaimed(record.id, ErrorKind::MalformedIdentifier, detail)
        .await?
    {
        debug!(record_id = record.id, "malformed record already left pending");
        return Ok(None);
    }
    warn!(record_id = record.id, error = %detail, "malformed identifier");
    task::log_attempt(
        store,
        &NewAttempt::new(record.id, AttemptOutcome::MalformedIdentifier, detail),
    )
    .await;
    ctx.stats.increment_failed();
    Ok(Some(RecordOutcome::failed(
        record.id,
        record.attempt_count,
        ErrorKind::MalformedIdentifier,
        detail,
    )))
}

async fn collect_task(
    joined: Result<Result<RecordOutcome, StoreError>, tokio::task::JoinError>,
    id: i64,
    attempt_count: u32,
    ctx: &EngineContext,
    report: &mut BatchReport,
    first_error: &mut Option<StoreError>,
) {
    match joined {
        Ok(Ok(outcome)) => report.outcomes.push(outcome),
        Ok(Err(e)) => {
            if e.is_busy_or_locked() {
                warn!(record_id = id, error = %e, "state database busy; stopping batch");
            } else {
                error!(record_id = id, error = %e, "store error in fetch task");
            }
            if first_error.is_none() {
                *first_error = Some(e);
            }
        }
        Err(join_error) => {
            let outcome = task::handle_task_join_error(
                ctx.store.as_ref(),
                id,
                attempt_count,
                join_error,
                &ctx.stats,
            )
            .await;
            report.outcomes.push(outcome);
        }
    }
}

async fn drain_finished_tasks(
    handles: &mut Vec<TaskHandle>,
    ctx: &EngineContext,
    report: &mut BatchReport,
    first_error: &mut Option<StoreError>,
) {
    let mut idx = 0;
    while idx < handles.len() {
        if handles[idx].2.is_finished() {
            let (id, attempt_count, handle) = handles.swap_remove(idx);
            collect_task(handle.await, id, attempt_count, ctx, report, first_error).await;
        } else {
            idx += 1;
        }
    }
}
