//! Fetching payloads for pending records.
//!
//! - [`HttpClient`]: streaming GET with timeouts and a body size cap
//! - [`ContentValidator`]: byte-signature classification of response bodies
//! - [`RetryPolicy`]: pure retry/give-up decision with capped backoff
//! - [`FetchEngine`]: claims records and runs one fetch cycle per record
//!   under a concurrency limit
//! - [`PayloadWriter`]: durable payload writes ahead of the success commit

mod client;
pub mod constants;
mod engine;
mod error;
mod result;
mod retry;
mod validator;

pub use client::{HttpClient, HttpResponse};
pub use constants::{
    DEFAULT_CONCURRENCY, DEFAULT_MAX_PAYLOAD_BYTES, DEFAULT_MIN_PAYLOAD_BYTES, MAX_CONCURRENCY,
    MIN_CONCURRENCY,
};
pub use engine::{
    BatchReport, EngineError, FetchEngine, FetchStats, PayloadWriter, WrittenPayload,
};
pub use error::FetchError;
pub use result::{Disposition, FetchOutcome, FetchResult, RecordOutcome};
pub use retry::{RetryDecision, RetryPolicy};
pub use validator::{ContentKind, ContentValidator};
