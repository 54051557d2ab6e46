//! Pipeline orchestration: discover, fetch, transform.
//!
//! Every operation is one bounded batch that is safe to repeat. Callers drive
//! repetition (the CLI's `--until-idle`, a scheduler, a test), which is also
//! where cancellation between batches happens.
//!
//! Opening a [`Pipeline`] never touches record state, so read-only commands
//! can run next to a fetch. A fetch run takes an exclusive lock file beside
//! the database and only then resets records left `InProgress` by an earlier
//! process back to `Pending`, so an interrupted fetch is simply redone.

mod export;
mod lock;
mod summary;

use std::ops::RangeInclusive;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures_util::{StreamExt, stream};
use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, instrument, warn};

pub use export::{CSV_HEADER, write_records_csv};
pub use lock::lock_path_for;
pub use summary::{DiscoverySummary, FailedRecord, FetchSummary, PageFailure, TransformSummary};

use crate::config::{ConfigError, PipelineConfig};
use crate::db::{Database, DatabaseOptions, DbError};
use crate::discovery::{Discovery, ListingScraper};
use crate::fetch::{
    ContentValidator, EngineError, FetchEngine, FetchError, HttpClient, PayloadWriter,
};
use crate::resolver::LayoutResolver;
use crate::store::{
    AttemptOutcome, DiscoveredRecord, ErrorKind, LifecycleState, NewAttempt, Record, RecordStore,
    SqliteStore, StateCounts, StoreError, unix_millis_now,
};
use crate::transform::{PgnTransformer, TransformError, TransformReport, Transformer};

/// Errors that abort a batch operation.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to open state database: {0}")]
    Database(#[from] DbError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("failed to build HTTP client: {0}")]
    Client(#[from] FetchError),

    #[error("failed to create directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("another fetch holds {path}; wait for it to finish")]
    FetchLocked { path: PathBuf },

    #[error("failed to open fetch lock {path}: {source}")]
    Lock {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write CSV export {path}: {source}")]
    Export {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
}

impl PipelineError {
    /// True when the state database refused a write because another
    /// connection held it busy or locked past the busy timeout.
    #[must_use]
    pub fn is_store_busy(&self) -> bool {
        match self {
            Self::Store(e) => e.is_busy_or_locked(),
            Self::Engine(e) => e.is_store_busy(),
            _ => false,
        }
    }
}

/// The acquisition pipeline over one state store.
pub struct Pipeline {
    config: PipelineConfig,
    store: Arc<dyn RecordStore>,
    discovery: Arc<dyn Discovery>,
    transformer: Arc<dyn Transformer>,
    client: HttpClient,
    resolver: LayoutResolver,
    lock_path: Option<PathBuf>,
    fetch_gate: Mutex<()>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("config", &self.config)
            .field("lock_path", &self.lock_path)
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    /// Builds a pipeline over `store`.
    ///
    /// Discovery defaults to the configured HTML listing and transformation
    /// to [`PgnTransformer`] writing under `processed_dir`. No fetch lock file
    /// is used until [`Self::with_fetch_lock`] names one.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Config`] for invalid settings and
    /// [`PipelineError::Client`] if the HTTP client cannot be built.
    #[instrument(skip(config, store))]
    pub async fn open(
        config: PipelineConfig,
        store: Arc<dyn RecordStore>,
    ) -> Result<Self, PipelineError> {
        config.validate()?;
        let resolver = config.layout_resolver()?;
        let client = HttpClient::from_config(&config)?;
        let discovery: Arc<dyn Discovery> =
            Arc::new(ListingScraper::new(client.clone(), config.listing_url.clone()));
        let transformer: Arc<dyn Transformer> =
            Arc::new(PgnTransformer::new(config.processed_dir.clone()));

        Ok(Self {
            config,
            store,
            discovery,
            transformer,
            client,
            resolver,
            lock_path: None,
            fetch_gate: Mutex::new(()),
        })
    }

    /// Opens the `SQLite` store at `config.db_path` and builds a pipeline over it.
    ///
    /// Fetch runs are guarded by the lock file from [`lock_path_for`].
    ///
    /// # Errors
    ///
    /// As [`Self::open`], plus [`PipelineError::Database`] and
    /// [`PipelineError::CreateDir`] for the database location.
    pub async fn open_sqlite(config: PipelineConfig) -> Result<Self, PipelineError> {
        if let Some(parent) = config.db_path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|source| PipelineError::CreateDir {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let db = Database::new_with_options(
            &config.db_path,
            DatabaseOptions {
                max_connections: config.db_max_connections,
                busy_timeout_ms: config.db_busy_timeout_ms,
            },
        )
        .await?;
        let lock_path = lock_path_for(&config.db_path);
        Ok(Self::open(config, Arc::new(SqliteStore::new(db)))
            .await?
            .with_fetch_lock(lock_path))
    }

    /// Guards fetch runs with an exclusive lock on `path`, shared with any
    /// other process fetching from the same store.
    #[must_use]
    pub fn with_fetch_lock(mut self, path: PathBuf) -> Self {
        self.lock_path = Some(path);
        self
    }

    /// Replaces the discovery collaborator.
    #[must_use]
    pub fn with_discovery(mut self, discovery: Arc<dyn Discovery>) -> Self {
        self.discovery = discovery;
        self
    }

    /// Replaces the transformation collaborator.
    #[must_use]
    pub fn with_transformer(mut self, transformer: Arc<dyn Transformer>) -> Self {
        self.transformer = transformer;
        self
    }

    #[must_use]
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    /// Reads listing pages and inserts newly seen records as `Pending`.
    ///
    /// Known identifiers are left untouched. A page that fails is reported
    /// in the summary and does not stop the other pages.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Store`] if an insert fails.
    #[instrument(skip(self), fields(start = *pages.start(), end = *pages.end()))]
    pub async fn discover_batch(
        &self,
        pages: RangeInclusive<u32>,
    ) -> Result<DiscoverySummary, PipelineError> {
        let mut summary = DiscoverySummary::default();
        let discovery = Arc::clone(&self.discovery);

        let mut results = stream::iter(pages)
            .map(|page| {
                let discovery = Arc::clone(&discovery);
                async move { (page, discovery.discover_page(page).await) }
            })
            .buffer_unordered(self.config.discovery_concurrency);

        while let Some((page, result)) = results.next().await {
            summary.pages_requested += 1;
            let records = match result {
                Ok(records) => records,
                Err(e) => {
                    warn!(page, error = %e, "listing page failed");
                    summary.pages_failed.push(PageFailure {
                        page,
                        error: e.to_string(),
                    });
                    continue;
                }
            };

            summary.records_seen += records.len();
            let (valid, rejected): (Vec<DiscoveredRecord>, Vec<DiscoveredRecord>) =
                records.into_iter().partition(|r| r.id > 0);
            for record in &rejected {
                warn!(page, id = record.id, "ignoring record with non-positive id");
            }
            summary.records_rejected += rejected.len();
            if !valid.is_empty() {
                summary.records_inserted += self.store.insert_if_absent(&valid).await?;
            }
        }
        summary.pages_failed.sort_by_key(|f| f.page);

        info!(
            pages = summary.pages_requested,
            failed_pages = summary.pages_failed.len(),
            seen = summary.records_seen,
            inserted = summary.records_inserted,
            "discovery batch complete"
        );
        Ok(summary)
    }

    /// Runs one fetch cycle over up to `limit` eligible pending records.
    ///
    /// The run first takes the fetch lock and resets records left
    /// `InProgress` by a dead fetcher; the count is reported as
    /// [`FetchSummary::recovered`]. Records are then taken oldest first from
    /// a snapshot made when the batch starts; records discovered meanwhile
    /// wait for the next batch. `concurrency` overrides the configured
    /// worker count.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::FetchLocked`] if another process is fetching,
    /// [`PipelineError::Engine`] for an invalid concurrency or a store failure
    /// during the batch, and [`PipelineError::Store`] if recovery or the
    /// snapshot fails.
    #[instrument(skip(self, cancel))]
    pub async fn fetch_pending(
        &self,
        limit: Option<usize>,
        concurrency: Option<usize>,
        cancel: Arc<AtomicBool>,
    ) -> Result<FetchSummary, PipelineError> {
        let engine = self.engine(concurrency)?;
        let run = self.begin_fetch_run().await?;
        let mut summary = self.fetch_batch(&engine, limit, cancel).await?;
        summary.recovered = run.recovered;
        Ok(summary)
    }

    /// Repeats fetch batches until one finds nothing eligible or is
    /// cancelled. Records waiting out a backoff delay are not waited for.
    ///
    /// The fetch lock is held and recovery runs once for the whole loop.
    ///
    /// # Errors
    ///
    /// As [`Self::fetch_pending`].
    pub async fn fetch_until_idle(
        &self,
        limit: Option<usize>,
        concurrency: Option<usize>,
        cancel: Arc<AtomicBool>,
    ) -> Result<Vec<FetchSummary>, PipelineError> {
        let engine = self.engine(concurrency)?;
        let run = self.begin_fetch_run().await?;
        let mut batches: Vec<FetchSummary> = Vec::new();
        loop {
            let mut summary = self
                .fetch_batch(&engine, limit, Arc::clone(&cancel))
                .await?;
            if batches.is_empty() {
                summary.recovered = run.recovered;
            }
            let done = summary.snapshot_size == 0 || summary.interrupted;
            batches.push(summary);
            if done || cancel.load(Ordering::SeqCst) {
                break;
            }
        }
        Ok(batches)
    }

    fn engine(&self, concurrency: Option<usize>) -> Result<FetchEngine, PipelineError> {
        Ok(FetchEngine::new(
            concurrency.unwrap_or(self.config.concurrency),
            self.config.retry_policy(),
            self.resolver.clone(),
            ContentValidator::new(self.config.min_payload_bytes),
            self.client.clone(),
            PayloadWriter::new(self.config.download_dir.clone()),
        )?)
    }

    /// Serializes fetch runs in this process, takes the cross-process lock and
    /// resets stale claims. Nothing else may hold a claim while this runs.
    async fn begin_fetch_run(&self) -> Result<FetchRun<'_>, PipelineError> {
        let gate = self.fetch_gate.lock().await;
        let lock = match &self.lock_path {
            Some(path) => Some(acquire_fetch_lock(path)?),
            None => None,
        };

        let recovered = self.store.reset_in_progress().await?;
        if recovered > 0 {
            warn!(recovered, "reset interrupted records to pending");
        }
        Ok(FetchRun {
            _gate: gate,
            _lock: lock,
            recovered,
        })
    }

    async fn fetch_batch(
        &self,
        engine: &FetchEngine,
        limit: Option<usize>,
        cancel: Arc<AtomicBool>,
    ) -> Result<FetchSummary, PipelineError> {
        let snapshot = self
            .store
            .pending_snapshot(unix_millis_now(), limit)
            .await?;
        let snapshot_size = snapshot.len();
        debug!(snapshot_size, "pending snapshot taken");

        let report = engine
            .run_batch(Arc::clone(&self.store), snapshot, cancel)
            .await?;
        let counts = self.store.counts().await?;
        Ok(FetchSummary::from_report(snapshot_size, report, counts))
    }

    /// Transforms every `Succeeded` record and marks it `Transformed`.
    ///
    /// A failed transformation leaves the record `Succeeded` with a
    /// `TransformationFailure` error, so the next call retries it.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Store`] if the store fails.
    #[instrument(skip(self, cancel))]
    pub async fn transform_succeeded(
        &self,
        cancel: Arc<AtomicBool>,
    ) -> Result<TransformSummary, PipelineError> {
        let records = self.store.list_by_state(LifecycleState::Succeeded).await?;
        let mut summary = TransformSummary::default();
        debug!(count = records.len(), "transforming succeeded records");

        for record in records {
            if cancel.load(Ordering::SeqCst) {
                summary.interrupted = true;
                break;
            }
            let id = record.id;
            let payload_path = record.payload_path.clone().map(PathBuf::from);

            match self.run_transformer(record).await {
                Ok(report) => {
                    self.store.mark_transformed(id).await?;
                    self.log_attempt(&NewAttempt::new(
                        id,
                        AttemptOutcome::Transformed,
                        &format!("{} games to {}", report.games, report.output_path.display()),
                    ))
                    .await;
                    if self.config.prune_payloads
                        && let Some(path) = payload_path
                    {
                        match tokio::fs::remove_file(&path).await {
                            Ok(()) => summary.pruned += 1,
                            Err(e) => {
                                warn!(record_id = id, path = %path.display(), error = %e, "failed to prune payload");
                            }
                        }
                    }
                    summary.transformed.push(report);
                }
                Err(e) => {
                    let detail = e.to_string();
                    warn!(record_id = id, error = %detail, "transformation failed");
                    self.store.record_transform_failure(id, &detail).await?;
                    self.log_attempt(&NewAttempt::new(
                        id,
                        AttemptOutcome::TransformationFailure,
                        &detail,
                    ))
                    .await;
                    summary.failed.push(FailedRecord {
                        id,
                        error_kind: Some(ErrorKind::TransformationFailure),
                        detail: Some(detail),
                    });
                }
            }
        }

        info!(
            transformed = summary.transformed.len(),
            failed = summary.failed.len(),
            games = summary.games(),
            pruned = summary.pruned,
            "transform batch complete"
        );
        Ok(summary)
    }

    /// Counts records by lifecycle state.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Store`] if the store fails.
    pub async fn stats(&self) -> Result<StateCounts, PipelineError> {
        Ok(self.store.counts().await?)
    }

    /// Writes every known record to `path` as CSV, ordered by timestamp then id.
    ///
    /// Returns the number of records written.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Store`] if the store fails and
    /// [`PipelineError::Export`] if the file cannot be written.
    #[instrument(skip(self), fields(path = %path.display()))]
    pub async fn export_csv(&self, path: &Path) -> Result<usize, PipelineError> {
        let mut records = Vec::new();
        for state in LifecycleState::ALL {
            records.extend(self.store.list_by_state(state).await?);
        }
        records.sort_by(|a, b| a.occurred_at.cmp(&b.occurred_at).then(a.id.cmp(&b.id)));

        let export_error = |source: csv::Error| PipelineError::Export {
            path: path.to_path_buf(),
            source,
        };
        let file = File::create(path).map_err(|e| export_error(e.into()))?;
        let written = write_records_csv(BufWriter::new(file), &records).map_err(export_error)?;
        info!(records = written, "CSV export written");
        Ok(written)
    }

    /// Moves every `Failed` record back to `Pending`. Attempt counts are kept.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Store`] if the store fails.
    pub async fn requeue_failed(&self) -> Result<u64, PipelineError> {
        let requeued = self.store.requeue_failed().await?;
        info!(requeued, "failed records requeued");
        Ok(requeued)
    }

    async fn run_transformer(&self, record: Record) -> Result<TransformReport, TransformError> {
        let Some(payload) = record.payload_path.clone().map(PathBuf::from) else {
            return Err(TransformError::MissingPayload { id: record.id });
        };
        let transformer = Arc::clone(&self.transformer);
        let id = record.id;
        tokio::task::spawn_blocking(move || transformer.transform(&record, &payload))
            .await
            .unwrap_or_else(|join_error| {
                Err(TransformError::io(
                    format!("match_{id}"),
                    std::io::Error::other(join_error.to_string()),
                ))
            })
    }

    async fn log_attempt(&self, attempt: &NewAttempt<'_>) {
        if let Err(e) = self.store.append_attempt(attempt).await {
            warn!(record_id = attempt.record_id, error = %e, "failed to append attempt log row");
        }
    }
}

/// Exclusive right to fetch, held until dropped.
struct FetchRun<'a> {
    _gate: MutexGuard<'a, ()>,
    _lock: Option<lock::FetchLock>,
    recovered: u64,
}

fn acquire_fetch_lock(path: &Path) -> Result<lock::FetchLock, PipelineError> {
    lock::FetchLock::try_acquire(path)
        .map_err(|source| PipelineError::Lock {
            path: path.to_path_buf(),
            source,
        })?
        .ok_or_else(|| PipelineError::FetchLocked {
            path: path.to_path_buf(),
        })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::discovery::StaticDiscovery;
    use crate::store::MemoryStore;

    fn config(dir: &std::path::Path) -> PipelineConfig {
        PipelineConfig {
            download_dir: dir.join("downloads"),
            processed_dir: dir.join("processed"),
            db_path: dir.join("state.db"),
            ..PipelineConfig::default()
        }
    }

    fn discovered(id: i64) -> DiscoveredRecord {
        DiscoveredRecord::with_default_filename(
            id,
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        )
    }

    #[tokio::test]
    async fn test_open_rejects_invalid_config() {
        let dir = tempfile::tempdir().unwrap();
        let config = PipelineConfig {
            concurrency: 0,
            ..config(dir.path())
        };
        let result = Pipeline::open(config, Arc::new(MemoryStore::new())).await;
        assert!(matches!(result, Err(PipelineError::Config(_))));
    }

    fn cancelled() -> Arc<AtomicBool> {
        Arc::new(AtomicBool::new(true))
    }

    async fn succeeded_with_payload(store: &MemoryStore, id: i64, payload: &Path, body: &str) {
        std::fs::create_dir_all(payload.parent().unwrap()).unwrap();
        std::fs::write(payload, body).unwrap();
        store.insert_if_absent(&[discovered(id)]).await.unwrap();
        let claimed = store.claim(id, unix_millis_now()).await.unwrap().unwrap();
        store
            .commit_success(
                id,
                claimed.attempt_count,
                &crate::store::PayloadCommit {
                    source_url: format!("https://example.test/match_{id}.pgn"),
                    payload_path: payload.display().to_string(),
                    content_kind: crate::fetch::ContentKind::ValidInlineText,
                    payload_size: body.len() as u64,
                    payload_sha256: "00".repeat(32),
                },
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_open_leaves_in_progress_records_alone() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        store.insert_if_absent(&[discovered(1)]).await.unwrap();
        store.claim(1, unix_millis_now()).await.unwrap().unwrap();

        let pipeline = Pipeline::open(config(dir.path()), store.clone())
            .await
            .unwrap();
        pipeline.stats().await.unwrap();

        assert_eq!(
            store.get(1).await.unwrap().unwrap().state,
            LifecycleState::InProgress
        );
    }

    #[tokio::test]
    async fn test_fetch_recovers_in_progress_records() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        store.insert_if_absent(&[discovered(1)]).await.unwrap();
        store.claim(1, unix_millis_now()).await.unwrap().unwrap();
        let pipeline = Pipeline::open(config(dir.path()), store.clone())
            .await
            .unwrap()
            .with_fetch_lock(dir.path().join("state.db.lock"));

        let summary = pipeline.fetch_pending(None, None, cancelled()).await.unwrap();

        assert_eq!(summary.recovered, 1);
        assert!(summary.interrupted);
        let record = store.get(1).await.unwrap().unwrap();
        assert_eq!(record.state, LifecycleState::Pending);
        assert_eq!(record.attempt_count, 1);
    }

    #[tokio::test]
    async fn test_fetch_refused_while_another_process_holds_lock() {
        let dir = tempfile::tempdir().unwrap();
        let lock_path = dir.path().join("state.db.lock");
        let store = Arc::new(MemoryStore::new());
        store.insert_if_absent(&[discovered(1)]).await.unwrap();
        store.claim(1, unix_millis_now()).await.unwrap().unwrap();
        let pipeline = Pipeline::open(config(dir.path()), store.clone())
            .await
            .unwrap()
            .with_fetch_lock(lock_path.clone());

        let held = lock::FetchLock::try_acquire(&lock_path).unwrap().unwrap();
        let result = pipeline.fetch_until_idle(None, None, cancelled()).await;
        assert!(matches!(result, Err(PipelineError::FetchLocked { .. })));
        assert_eq!(
            store.get(1).await.unwrap().unwrap().state,
            LifecycleState::InProgress
        );

        drop(held);
        let batches = pipeline.fetch_until_idle(None, None, cancelled()).await.unwrap();
        assert_eq!(batches[0].recovered, 1);
    }

    #[tokio::test]
    async fn test_transform_prunes_payload_only_after_transformed() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let good = dir.path().join("downloads").join("10-match_10.pgn");
        let empty = dir.path().join("downloads").join("11-match_11.pgn");
        succeeded_with_payload(
            &store,
            10,
            &good,
            "[Event \"Lc0 match\"]\n[White \"a\"]\n[Black \"b\"]\n\n1. e4 e5 1/2-1/2\n",
        )
        .await;
        succeeded_with_payload(&store, 11, &empty, "   \n").await;
        let config = PipelineConfig {
            prune_payloads: true,
            ..config(dir.path())
        };
        let pipeline = Pipeline::open(config, store.clone()).await.unwrap();

        let summary = pipeline
            .transform_succeeded(Arc::new(AtomicBool::new(false)))
            .await
            .unwrap();

        assert_eq!(summary.transformed.len(), 1);
        assert_eq!(summary.pruned, 1);
        assert!(summary.transformed[0].output_path.exists());
        assert_eq!(
            store.get(10).await.unwrap().unwrap().state,
            LifecycleState::Transformed
        );
        assert!(!good.exists());

        assert_eq!(summary.failed.len(), 1);
        assert_eq!(summary.failed[0].id, 11);
        assert_eq!(
            store.get(11).await.unwrap().unwrap().state,
            LifecycleState::Succeeded
        );
        assert!(empty.exists());
    }

    #[tokio::test]
    async fn test_transform_keeps_payload_without_pruning() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let payload = dir.path().join("downloads").join("12-match_12.pgn");
        succeeded_with_payload(&store, 12, &payload, "[White \"a\"]\n\n1. d4 1-0\n").await;
        let pipeline = Pipeline::open(config(dir.path()), store.clone())
            .await
            .unwrap();

        let summary = pipeline
            .transform_succeeded(Arc::new(AtomicBool::new(false)))
            .await
            .unwrap();

        assert_eq!(summary.transformed.len(), 1);
        assert_eq!(summary.pruned, 0);
        assert!(payload.exists());
    }

    #[tokio::test]
    async fn test_export_csv_lists_every_state_in_time_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let at = |id: i64, month: u32| {
            DiscoveredRecord::with_default_filename(
                id,
                Utc.with_ymd_and_hms(2022, month, 1, 0, 0, 0).unwrap(),
            )
        };
        store
            .insert_if_absent(&[at(3, 9), at(1, 2), at(2, 2)])
            .await
            .unwrap();
        let claimed = store.claim(3, unix_millis_now()).await.unwrap().unwrap();
        store
            .commit_failure(3, claimed.attempt_count, ErrorKind::AllCandidatesExhausted, "gone")
            .await
            .unwrap();
        let pipeline = Pipeline::open(config(dir.path()), store).await.unwrap();
        let out = dir.path().join("matches.csv");

        assert_eq!(pipeline.export_csv(&out).await.unwrap(), 3);

        let text = std::fs::read_to_string(&out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            lines,
            vec![
                "id,occurred_at,source_filename",
                "1,2022-02-01T00:00:00Z,match_1.pgn.tar.gz",
                "2,2022-02-01T00:00:00Z,match_2.pgn.tar.gz",
                "3,2022-09-01T00:00:00Z,match_3.pgn.tar.gz",
            ]
        );
    }

    #[test]
    fn test_busy_store_errors_are_flagged() {
        let busy = StoreError::Database {
            kind: crate::store::StoreDbErrorKind::BusyOrLocked,
            message: "database is locked".to_string(),
        };
        assert!(PipelineError::Store(busy.clone()).is_store_busy());
        assert!(PipelineError::Engine(EngineError::Store(busy)).is_store_busy());
        assert!(
            !PipelineError::FetchLocked {
                path: PathBuf::from("x.lock")
            }
            .is_store_busy()
        );
    }

    #[tokio::test]
    async fn test_discover_batch_counts_and_rejects() {
        let dir = tempfile::tempdir().unwrap();
        let discovery = StaticDiscovery::new()
            .with_page(1, vec![discovered(1), discovered(2), discovered(-4)])
            .with_page(2, vec![discovered(2), discovered(3)])
            .with_failing_page(3);
        let pipeline = Pipeline::open(config(dir.path()), Arc::new(MemoryStore::new()))
            .await
            .unwrap()
            .with_discovery(Arc::new(discovery));

        let summary = pipeline.discover_batch(1..=3).await.unwrap();

        assert_eq!(summary.pages_requested, 3);
        assert_eq!(summary.records_seen, 5);
        assert_eq!(summary.records_inserted, 3);
        assert_eq!(summary.records_rejected, 1);
        assert_eq!(summary.pages_failed.len(), 1);
        assert_eq!(summary.pages_failed[0].page, 3);
        assert_eq!(pipeline.stats().await.unwrap().pending, 3);
    }

    #[tokio::test]
    async fn test_transform_without_payload_keeps_record_succeeded() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        store.insert_if_absent(&[discovered(5)]).await.unwrap();
        store.claim(5, unix_millis_now()).await.unwrap().unwrap();
        store
            .commit_success(
                5,
                1,
                &crate::store::PayloadCommit {
                    source_url: "https://example.test/match_5.pgn".to_string(),
                    payload_path: dir.path().join("gone.pgn").display().to_string(),
                    content_kind: crate::fetch::ContentKind::ValidInlineText,
                    payload_size: 10,
                    payload_sha256: "00".repeat(32),
                },
            )
            .await
            .unwrap();
        let pipeline = Pipeline::open(config(dir.path()), store.clone())
            .await
            .unwrap();

        let summary = pipeline
            .transform_succeeded(Arc::new(AtomicBool::new(false)))
            .await
            .unwrap();

        assert_eq!(summary.failed.len(), 1);
        let record = store.get(5).await.unwrap().unwrap();
        assert_eq!(record.state, LifecycleState::Succeeded);
        assert_eq!(
            record.last_error_kind,
            Some(ErrorKind::TransformationFailure)
        );
    }

    #[tokio::test]
    async fn test_requeue_failed_keeps_attempts() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        store.insert_if_absent(&[discovered(8)]).await.unwrap();
        store.claim(8, unix_millis_now()).await.unwrap().unwrap();
        store
            .commit_failure(8, 1, ErrorKind::AllCandidatesExhausted, "gone")
            .await
            .unwrap();
        let pipeline = Pipeline::open(config(dir.path()), store.clone())
            .await
            .unwrap();

        assert_eq!(pipeline.requeue_failed().await.unwrap(), 1);
        let record = store.get(8).await.unwrap().unwrap();
        assert_eq!(record.state, LifecycleState::Pending);
        assert_eq!(record.attempt_count, 1);
    }
}
