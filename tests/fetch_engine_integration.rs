//! Integration tests for the fetch engine.
//!
//! These tests drive `FetchEngine` against a file-backed store and a mock
//! storage server, covering candidate fallback, retry exhaustion, exclusive
//! processing across engines and recovery after an interrupted run.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use match_archiver::fetch::{
    ContentValidator, Disposition, FetchEngine, HttpClient, PayloadWriter, RetryPolicy,
};
use match_archiver::resolver::LayoutResolver;
use match_archiver::store::{AttemptOutcome, DiscoveredRecord, unix_millis_now};
use match_archiver::{ContentKind, Database, ErrorKind, LifecycleState, RecordStore, SqliteStore};
use rand::Rng;
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

mod support;
use support::socket_guard::start_mock_server_or_skip;

macro_rules! require_mock_server {
    () => {{
        let Some(mock_server) = start_mock_server_or_skip().await else {
            return;
        };
        mock_server
    }};
}

const PGN: &str = "[Event \"Lc0 match\"]\n[White \"lc0\"]\n[Black \"lc0\"]\n[Result \"1-0\"]\n\n1. e4 e5 2. Qh5 Nc6 1-0\n";

const MISSING_PAGE: &str =
    "<!DOCTYPE html><html><head><title>Not Found</title></head><body>No such file</body></html>";

// ==================== Helpers ====================

async fn sqlite_store(dir: &TempDir) -> Arc<dyn RecordStore> {
    let db = Database::new(&dir.path().join("state.db")).await.unwrap();
    Arc::new(SqliteStore::new(db))
}

async fn seed(store: &Arc<dyn RecordStore>, ids: impl IntoIterator<Item = i64>) {
    let ts = Utc.with_ymd_and_hms(2021, 9, 14, 8, 0, 0).unwrap();
    let records: Vec<_> = ids
        .into_iter()
        .map(|id| DiscoveredRecord::with_default_filename(id, ts))
        .collect();
    store.insert_if_absent(&records).await.unwrap();
}

fn gzip_like_payload() -> Vec<u8> {
    let mut body = vec![0x1f, 0x8b, 0x08, 0x00];
    body.resize(256, 0x42);
    body
}

fn two_layout_resolver(server: &MockServer) -> LayoutResolver {
    LayoutResolver::new(
        &server.uri(),
        "1",
        &[
            "{base}{run}/a/match_{id}.pgn.tar.gz",
            "{base}{run}/b/match_{id}.pgn.tar.gz",
        ],
    )
    .unwrap()
}

fn engine_with(
    concurrency: usize,
    policy: RetryPolicy,
    resolver: LayoutResolver,
    client: HttpClient,
    dir: &TempDir,
) -> FetchEngine {
    FetchEngine::new(
        concurrency,
        policy,
        resolver,
        ContentValidator::new(32),
        client,
        PayloadWriter::new(dir.path().join("downloads")),
    )
    .unwrap()
}

fn not_cancelled() -> Arc<AtomicBool> {
    Arc::new(AtomicBool::new(false))
}

// ==================== Candidate Fallback ====================

#[tokio::test]
async fn test_html_200_falls_through_to_next_layout() {
    let server = require_mock_server!();
    Mock::given(method("GET"))
        .and(path("/1/a/match_100.pgn.tar.gz"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "application/gzip")
                .set_body_string(MISSING_PAGE),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/1/b/match_100.pgn.tar.gz"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(gzip_like_payload()))
        .expect(1)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let store = sqlite_store(&dir).await;
    seed(&store, [100]).await;
    let engine = engine_with(
        4,
        RetryPolicy::new(3, Duration::ZERO, Duration::ZERO),
        two_layout_resolver(&server),
        HttpClient::with_defaults().unwrap(),
        &dir,
    );

    let snapshot = store.pending_snapshot(unix_millis_now(), None).await.unwrap();
    let report = engine
        .run_batch(Arc::clone(&store), snapshot, not_cancelled())
        .await
        .unwrap();

    assert_eq!(report.succeeded(), 1);
    assert_eq!(report.requests, 2);
    assert_eq!(server.received_requests().await.unwrap().len(), 2);

    let record = store.get(100).await.unwrap().unwrap();
    assert_eq!(record.state, LifecycleState::Succeeded);
    assert_eq!(record.attempt_count, 1);
    assert_eq!(record.content_kind, Some(ContentKind::ValidArchive));
    assert!(
        record
            .source_url
            .as_deref()
            .is_some_and(|url| url.ends_with("/1/b/match_100.pgn.tar.gz"))
    );
    let payload = std::path::PathBuf::from(record.payload_path.unwrap());
    assert_eq!(std::fs::read(payload).unwrap(), gzip_like_payload());

    let log: Vec<_> = store
        .attempts_for(100)
        .await
        .unwrap()
        .into_iter()
        .map(|entry| entry.outcome)
        .collect();
    assert_eq!(
        log,
        vec![AttemptOutcome::InvalidContent, AttemptOutcome::Success]
    );
}

// ==================== Retry Exhaustion ====================

#[tokio::test]
async fn test_timeouts_exhaust_attempts_then_record_fails() {
    let server = require_mock_server!();
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(PGN)
                .set_delay(Duration::from_secs(2)),
        )
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let store = sqlite_store(&dir).await;
    seed(&store, [101]).await;
    let client = HttpClient::new(
        Duration::from_secs(1),
        Duration::from_millis(200),
        1024 * 1024,
        "match-archiver-tests",
    )
    .unwrap();
    let engine = engine_with(
        2,
        RetryPolicy::new(3, Duration::ZERO, Duration::ZERO),
        two_layout_resolver(&server),
        client,
        &dir,
    );

    for cycle in 1..=3u32 {
        let snapshot = store.pending_snapshot(unix_millis_now(), None).await.unwrap();
        assert_eq!(snapshot.len(), 1, "record eligible in cycle {cycle}");
        let report = engine
            .run_batch(Arc::clone(&store), snapshot, not_cancelled())
            .await
            .unwrap();
        assert_eq!(report.requests, 2);

        let record = store.get(101).await.unwrap().unwrap();
        assert_eq!(record.attempt_count, cycle);
        assert_eq!(record.last_error_kind, Some(ErrorKind::TransportError));
        if cycle < 3 {
            assert_eq!(record.state, LifecycleState::Pending);
            assert_eq!(report.retry_scheduled(), 1);
        } else {
            assert_eq!(record.state, LifecycleState::Failed);
            assert_eq!(report.failed(), 1);
        }
    }

    let requests_before = server.received_requests().await.unwrap().len();
    let snapshot = store.pending_snapshot(unix_millis_now(), None).await.unwrap();
    assert!(snapshot.is_empty());
    let report = engine
        .run_batch(Arc::clone(&store), snapshot, not_cancelled())
        .await
        .unwrap();
    assert_eq!(report.requests, 0);
    assert_eq!(
        server.received_requests().await.unwrap().len(),
        requests_before
    );
    assert_eq!(store.get(101).await.unwrap().unwrap().attempt_count, 3);
}

#[tokio::test]
async fn test_malformed_filename_fails_without_requests() {
    let server = require_mock_server!();
    let dir = TempDir::new().unwrap();
    let store = sqlite_store(&dir).await;
    store
        .insert_if_absent(&[DiscoveredRecord {
            id: 55,
            occurred_at: Utc.with_ymd_and_hms(2020, 1, 2, 3, 4, 5).unwrap(),
            source_filename: "../match_55.pgn".to_string(),
        }])
        .await
        .unwrap();
    let resolver = LayoutResolver::new(&server.uri(), "1", &["{base}{run}/{filename}"]).unwrap();
    let engine = engine_with(
        2,
        RetryPolicy::default(),
        resolver,
        HttpClient::with_defaults().unwrap(),
        &dir,
    );

    let snapshot = store.pending_snapshot(unix_millis_now(), None).await.unwrap();
    let report = engine
        .run_batch(Arc::clone(&store), snapshot, not_cancelled())
        .await
        .unwrap();

    assert_eq!(report.failed(), 1);
    assert_eq!(report.requests, 0);
    assert!(server.received_requests().await.unwrap().is_empty());
    let record = store.get(55).await.unwrap().unwrap();
    assert_eq!(record.state, LifecycleState::Failed);
    assert_eq!(record.attempt_count, 0);
    assert_eq!(record.last_error_kind, Some(ErrorKind::MalformedIdentifier));
}

// ==================== Exclusive Processing ====================

#[tokio::test]
async fn test_parallel_engines_fetch_each_record_once() {
    const RECORDS: i64 = 24;
    let server = require_mock_server!();
    let mut rng = rand::thread_rng();
    for id in 1..=RECORDS {
        let latency = Duration::from_millis(rng.gen_range(0..40));
        Mock::given(method("GET"))
            .and(path(format!("/1/match_{id}.pgn")))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(PGN)
                    .set_delay(latency),
            )
            .expect(1)
            .mount(&server)
            .await;
    }

    let dir = TempDir::new().unwrap();
    let store = sqlite_store(&dir).await;
    seed(&store, 1..=RECORDS).await;
    let snapshot = store.pending_snapshot(unix_millis_now(), None).await.unwrap();
    assert_eq!(snapshot.len(), 24);

    let mut handles = Vec::new();
    for workers in [2, 3, 5] {
        let engine = engine_with(
            workers,
            RetryPolicy::default(),
            LayoutResolver::new(&server.uri(), "1", &["{base}{run}/match_{id}.pgn"]).unwrap(),
            HttpClient::with_defaults().unwrap(),
            &dir,
        );
        let store = Arc::clone(&store);
        let snapshot = snapshot.clone();
        handles.push(tokio::spawn(async move {
            engine.run_batch(store, snapshot, not_cancelled()).await
        }));
    }

    let mut succeeded = 0;
    let mut skipped = 0;
    for handle in handles {
        let report = handle.await.unwrap().unwrap();
        succeeded += report.succeeded();
        skipped += report.skipped();
    }

    assert_eq!(succeeded, 24);
    assert_eq!(skipped, 48);
    assert_eq!(server.received_requests().await.unwrap().len(), 24);
    let counts = store.counts().await.unwrap();
    assert_eq!(counts.succeeded, 24);
    for id in 1..=RECORDS {
        assert_eq!(store.get(id).await.unwrap().unwrap().attempt_count, 1);
    }
}

// ==================== Resumability ====================

#[tokio::test]
async fn test_interrupted_records_resume_after_reset() {
    let server = require_mock_server!();
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string(PGN))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    {
        let store = sqlite_store(&dir).await;
        seed(&store, [31, 32, 33]).await;
        // Claimed by a run that never finished.
        store.claim(31, unix_millis_now()).await.unwrap().unwrap();
        store.claim(32, unix_millis_now()).await.unwrap().unwrap();
    }

    let store = sqlite_store(&dir).await;
    let snapshot = store.pending_snapshot(unix_millis_now(), None).await.unwrap();
    assert_eq!(snapshot.len(), 1, "claimed records stay out of the snapshot");

    assert_eq!(store.reset_in_progress().await.unwrap(), 2);
    let engine = engine_with(
        3,
        RetryPolicy::default(),
        LayoutResolver::new(&server.uri(), "1", &["{base}{run}/match_{id}.pgn"]).unwrap(),
        HttpClient::with_defaults().unwrap(),
        &dir,
    );
    let snapshot = store.pending_snapshot(unix_millis_now(), None).await.unwrap();
    let report = engine
        .run_batch(Arc::clone(&store), snapshot, not_cancelled())
        .await
        .unwrap();

    assert_eq!(report.succeeded(), 3);
    assert!(
        report
            .outcomes
            .iter()
            .all(|o| o.disposition == Disposition::Succeeded)
    );
    assert_eq!(store.get(31).await.unwrap().unwrap().attempt_count, 2);
    assert_eq!(store.get(32).await.unwrap().unwrap().attempt_count, 2);
    assert_eq!(store.get(33).await.unwrap().unwrap().attempt_count, 1);
}

#[tokio::test]
async fn test_cancel_before_start_leaves_records_pending() {
    let server = require_mock_server!();
    let dir = TempDir::new().unwrap();
    let store = sqlite_store(&dir).await;
    seed(&store, [41, 42]).await;
    let engine = engine_with(
        2,
        RetryPolicy::default(),
        LayoutResolver::new(&server.uri(), "1", &["{base}{run}/match_{id}.pgn"]).unwrap(),
        HttpClient::with_defaults().unwrap(),
        &dir,
    );

    let snapshot = store.pending_snapshot(unix_millis_now(), None).await.unwrap();
    let report = engine
        .run_batch(Arc::clone(&store), snapshot, Arc::new(AtomicBool::new(true)))
        .await
        .unwrap();

    assert!(report.interrupted);
    assert!(report.outcomes.is_empty());
    assert_eq!(store.counts().await.unwrap().pending, 2);
    assert!(server.received_requests().await.unwrap().is_empty());
}
