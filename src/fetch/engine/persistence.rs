//! Durable payload writes that precede the `Succeeded` commit.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::fetch::{ContentKind, FetchError};
use crate::store::Record;

/// A payload that is on disk and synced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrittenPayload {
    pub path: PathBuf,
    pub size: u64,
    pub sha256: String,
}

/// Writes validated payloads into the download directory.
///
/// Each payload goes to a hidden temporary file, is synced, then renamed into
/// place, so a crash never leaves a truncated payload under its final name.
#[derive(Debug, Clone)]
pub struct PayloadWriter {
    dir: PathBuf,
}

impl PayloadWriter {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Final file name for a record's payload, always prefixed with `<id>-`.
    ///
    /// Archives keep the discovered filename; inline text is stored as
    /// `<stem>.pgn` with any archive suffix removed. Discovery may hand two
    /// records the same filename hint, so the id keeps their payloads apart.
    #[must_use]
    pub fn payload_filename(record: &Record, kind: ContentKind) -> String {
        format!("{}-{}", record.id, Self::base_filename(record, kind))
    }

    /// Temporary name for one attempt's write of `filename`.
    fn temp_filename(record: &Record, filename: &str) -> String {
        format!(".{filename}.{}.part", record.attempt_count)
    }

    fn base_filename(record: &Record, kind: ContentKind) -> String {
        match kind {
            ContentKind::ValidInlineText => {
                let name = record.source_filename.as_str();
                let stem = name
                    .strip_suffix(".tar.gz")
                    .or_else(|| name.strip_suffix(".gz"))
                    .unwrap_or(name);
                if stem.ends_with(".pgn") {
                    stem.to_string()
                } else {
                    format!("match_{}.pgn", record.id)
                }
            }
            ContentKind::ValidArchive | ContentKind::ErrorPage | ContentKind::Empty => {
                record.source_filename.clone()
            }
        }
    }

    /// Writes `bytes` durably and returns where they landed.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError::Io`] if the directory, temporary file, sync or
    /// rename fails. The temporary file is removed on failure.
    pub async fn write(
        &self,
        record: &Record,
        kind: ContentKind,
        bytes: &[u8],
    ) -> Result<WrittenPayload, FetchError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| FetchError::io(&self.dir, e))?;

        let filename = Self::payload_filename(record, kind);
        let final_path = self.dir.join(&filename);
        let temp_path = self.dir.join(Self::temp_filename(record, &filename));

        if let Err(e) = write_synced(&temp_path, bytes).await {
            remove_quietly(&temp_path).await;
            return Err(e);
        }
        if let Err(e) = tokio::fs::rename(&temp_path, &final_path).await {
            remove_quietly(&temp_path).await;
            return Err(FetchError::io(&final_path, e));
        }

        let sha256 = format!("{:x}", Sha256::digest(bytes));
        debug!(
            record_id = record.id,
            path = %final_path.display(),
            bytes = bytes.len(),
            "payload written"
        );
        Ok(WrittenPayload {
            path: final_path,
            size: bytes.len() as u64,
            sha256,
        })
    }
}

async fn write_synced(path: &Path, bytes: &[u8]) -> Result<(), FetchError> {
    let mut file = tokio::fs::File::create(path)
        .await
        .map_err(|e| FetchError::io(path, e))?;
    file.write_all(bytes)
        .await
        .map_err(|e| FetchError::io(path, e))?;
    file.flush().await.map_err(|e| FetchError::io(path, e))?;
    file.sync_all().await.map_err(|e| FetchError::io(path, e))?;
    Ok(())
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await
        && e.kind() != std::io::ErrorKind::NotFound
    {
        warn!(path = %path.display(), error = %e, "failed to remove temporary payload");
    }
}
