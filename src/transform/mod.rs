//! Transformation of fetched payloads into normalized game files.
//!
//! A [`Transformer`] consumes the payload of one `Succeeded` record. It runs
//! on the blocking pool, so implementations may use synchronous I/O.

mod pgn;
mod version;

use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;

pub use pgn::{PgnTransformer, rewrite_games, split_games};
pub use version::{FALLBACK_VERSION, version_for};

use crate::store::Record;

/// Errors produced while transforming one payload.
#[derive(Debug, Error)]
pub enum TransformError {
    /// Reading the payload or writing the output failed.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The payload is an archive this transformer cannot open.
    #[error("cannot read archive {path}: {reason}")]
    Archive { path: PathBuf, reason: String },

    /// The payload contained no games.
    #[error("no games found in payload for record {id}")]
    NoGames { id: i64 },

    /// The record has no committed payload.
    #[error("record {id} has no payload path")]
    MissingPayload { id: i64 },
}

impl TransformError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// What one successful transformation produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransformReport {
    pub record_id: i64,
    pub output_path: PathBuf,
    pub games: usize,
    pub version: &'static str,
}

/// Consumes one record's payload.
pub trait Transformer: Send + Sync {
    /// Transforms the payload stored at `payload` for `record`.
    ///
    /// Must be safe to repeat: a second run for the same record replaces the
    /// first run's output.
    ///
    /// # Errors
    ///
    /// Returns [`TransformError`] when the payload cannot be read or holds
    /// no games, or the output cannot be written.
    fn transform(&self, record: &Record, payload: &Path) -> Result<TransformReport, TransformError>;
}
