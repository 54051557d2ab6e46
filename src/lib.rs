//! Match Archiver Library
//!
//! Resumable acquisition of match archives from a remote storage service
//! whose directory layout changed over the years and which answers missing
//! files with HTML pages served as HTTP 200.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//! - [`store`] - Durable record lifecycle state and the attempt audit log
//! - [`resolver`] - Record identifier to ordered candidate URLs
//! - [`fetch`] - HTTP client, content validation, retry policy and the
//!   bounded-concurrency fetch engine
//! - [`discovery`] - Paginated listing scrape that feeds new records in
//! - [`transform`] - Payload to normalized, month-filed game text
//! - [`pipeline`] - The three resumable batch operations over all of the above
//! - [`config`] - Settings with file overlay and validation
//! - [`db`] - `SQLite` connection and schema management

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod db;
pub mod discovery;
pub mod fetch;
pub mod pipeline;
pub mod resolver;
pub mod store;
pub mod transform;
mod user_agent;

// Re-export commonly used types
pub use config::{ConfigError, FileConfig, PipelineConfig};
pub use db::Database;
pub use fetch::{
    ContentKind, ContentValidator, EngineError, FetchEngine, HttpClient, RetryDecision,
    RetryPolicy,
};
pub use pipeline::{
    DiscoverySummary, FetchSummary, Pipeline, PipelineError, TransformSummary,
};
pub use resolver::LayoutResolver;
pub use store::{
    ErrorKind, LifecycleState, MemoryStore, Record, RecordStore, SqliteStore, StateCounts,
    StoreError,
};
pub use user_agent::default_user_agent;
