//! Advisory file lock that makes one process the only fetcher of a state database.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tracing::debug;

/// Lock file path for the database at `db_path`: the same name with `.lock` appended.
#[must_use]
pub fn lock_path_for(db_path: &Path) -> PathBuf {
    let mut name = db_path.as_os_str().to_os_string();
    name.push(".lock");
    PathBuf::from(name)
}

/// Held for the whole of a fetch run and released on drop.
#[derive(Debug)]
pub(crate) struct FetchLock {
    file: File,
    path: PathBuf,
}

impl FetchLock {
    /// Takes the lock without waiting. `Ok(None)` means another process holds it.
    pub(crate) fn try_acquire(path: &Path) -> std::io::Result<Option<Self>> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        if file.try_lock_exclusive().is_err() {
            return Ok(None);
        }

        file.set_len(0)?;
        writeln!(file, "pid={}", std::process::id())?;
        debug!(path = %path.display(), "fetch lock acquired");
        Ok(Some(Self {
            file,
            path: path.to_path_buf(),
        }))
    }
}

impl Drop for FetchLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
        debug!(path = %self.path.display(), "fetch lock released");
    }
}
