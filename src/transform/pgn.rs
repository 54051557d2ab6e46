//! PGN payload transformer.

use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use chrono::{Datelike, NaiveDate};
use flate2::read::GzDecoder;
use tracing::{debug, instrument, warn};

use super::{TransformError, TransformReport, Transformer, version_for};
use crate::store::Record;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const TAR_MAGIC_OFFSET: usize = 257;
const OTHER_ARCHIVE_MAGICS: [&[u8]; 5] = [
    b"BZh",
    &[0xfd, b'7', b'z', b'X', b'Z', 0x00],
    &[0x28, 0xb5, 0x2f, 0xfd],
    b"PK\x03\x04",
    &[b'7', b'z', 0xbc, 0xaf, 0x27, 0x1c],
];

/// Normalizes match games and files them by month.
///
/// Output for a record lands in `<processed_dir>/<YYYY>/<MM>/match_<id>.pgn`,
/// one file per record, replaced atomically on every run.
#[derive(Debug, Clone)]
pub struct PgnTransformer {
    processed_dir: PathBuf,
}

impl PgnTransformer {
    #[must_use]
    pub fn new(processed_dir: impl Into<PathBuf>) -> Self {
        Self {
            processed_dir: processed_dir.into(),
        }
    }

    /// Month file path for `record`.
    #[must_use]
    pub fn output_path(&self, record: &Record) -> PathBuf {
        let date = record.occurred_at.date_naive();
        self.processed_dir
            .join(format!("{:04}", date.year()))
            .join(format!("{:02}", date.month()))
            .join(format!("match_{}.pgn", record.id))
    }
}

impl Transformer for PgnTransformer {
    #[instrument(skip(self, record), fields(record_id = record.id, payload = %payload.display()))]
    fn transform(&self, record: &Record, payload: &Path) -> Result<TransformReport, TransformError> {
        let texts = read_pgn_texts(payload)?;
        let games: Vec<&str> = texts.iter().flat_map(|t| split_games(t)).collect();
        if games.is_empty() {
            return Err(TransformError::NoGames { id: record.id });
        }

        let date = record.occurred_at.date_naive();
        let version = version_for(date);
        let output = rewrite_games(&games, date, version);
        let output_path = self.output_path(record);
        write_atomic(&output_path, output.as_bytes())?;

        debug!(games = games.len(), version, path = %output_path.display(), "record transformed");
        Ok(TransformReport {
            record_id: record.id,
            output_path,
            games: games.len(),
            version,
        })
    }
}

/// Splits PGN text into games.
///
/// A game ends where a tag pair follows movetext. Blank games are dropped.
#[must_use]
pub fn split_games(text: &str) -> Vec<&str> {
    let mut games = Vec::new();
    let mut start = 0;
    let mut offset = 0;
    let mut seen_moves = false;

    for line in text.split_inclusive('\n') {
        let trimmed = line.trim();
        if trimmed.starts_with('[') && seen_moves {
            push_game(&mut games, &text[start..offset]);
            start = offset;
            seen_moves = false;
        } else if !trimmed.is_empty() && !trimmed.starts_with('[') {
            seen_moves = true;
        }
        offset += line.len();
    }
    push_game(&mut games, &text[start..]);
    games
}

fn push_game<'a>(games: &mut Vec<&'a str>, game: &'a str) {
    let game = game.trim();
    if !game.is_empty() {
        games.push(game);
    }
}

/// Rewrites player tags to `Lc0 <version>` and adds a `Date` tag when a game
/// has none. Games are separated by one blank line.
#[must_use]
pub fn rewrite_games(games: &[&str], date: NaiveDate, version: &str) -> String {
    let date_tag = format!("[Date \"{}\"]", date.format("%Y.%m.%d"));
    let mut out = String::new();

    for (idx, game) in games.iter().enumerate() {
        if idx > 0 {
            out.push('\n');
        }
        let has_date = game.lines().any(|l| l.trim_start().starts_with("[Date "));
        let has_event = game.lines().any(|l| l.trim_start().starts_with("[Event "));
        let mut date_pending = !has_date;

        if date_pending && !has_event {
            out.push_str(&date_tag);
            out.push('\n');
            date_pending = false;
        }
        for line in game.lines() {
            let tag = line.trim_start();
            if tag.starts_with("[White ") {
                out.push_str(&format!("[White \"Lc0 {version}\"]"));
            } else if tag.starts_with("[Black ") {
                out.push_str(&format!("[Black \"Lc0 {version}\"]"));
            } else {
                out.push_str(line);
            }
            out.push('\n');
            if date_pending && tag.starts_with("[Event ") {
                out.push_str(&date_tag);
                out.push('\n');
                date_pending = false;
            }
        }
    }
    out
}

/// Reads every PGN text held by a payload: the `.pgn` members of a
/// (optionally gzipped) tar archive, a gzipped PGN file, or plain PGN text.
fn read_pgn_texts(payload: &Path) -> Result<Vec<String>, TransformError> {
    let raw = fs::read(payload).map_err(|e| TransformError::io(payload, e))?;

    let data = if raw.starts_with(&GZIP_MAGIC) {
        let mut decoded = Vec::new();
        GzDecoder::new(raw.as_slice())
            .read_to_end(&mut decoded)
            .map_err(|e| TransformError::Archive {
                path: payload.to_path_buf(),
                reason: format!("gzip: {e}"),
            })?;
        decoded
    } else if OTHER_ARCHIVE_MAGICS.iter().any(|m| raw.starts_with(m)) {
        return Err(TransformError::Archive {
            path: payload.to_path_buf(),
            reason: "unsupported archive format".to_string(),
        });
    } else {
        raw
    };

    let is_tar = data
        .get(TAR_MAGIC_OFFSET..TAR_MAGIC_OFFSET + 5)
        .is_some_and(|m| m == b"ustar");
    if !is_tar {
        return Ok(vec![String::from_utf8_lossy(&data).into_owned()]);
    }

    let archive_error = |e: std::io::Error| TransformError::Archive {
        path: payload.to_path_buf(),
        reason: format!("tar: {e}"),
    };
    let mut archive = tar::Archive::new(data.as_slice());
    let mut texts = Vec::new();
    for entry in archive.entries().map_err(archive_error)? {
        let mut entry = entry.map_err(archive_error)?;
        let name = entry.path().map_err(archive_error)?.to_string_lossy().into_owned();
        if !name.ends_with(".pgn") {
            debug!(member = %name, "skipping non-PGN archive member");
            continue;
        }
        let mut bytes = Vec::new();
        entry.read_to_end(&mut bytes).map_err(archive_error)?;
        texts.push(String::from_utf8_lossy(&bytes).into_owned());
    }
    Ok(texts)
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), TransformError> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir).map_err(|e| TransformError::io(dir, e))?;

    let file_name = path
        .file_name()
        .map_or_else(|| "output".into(), |n| n.to_string_lossy());
    let temp_path = dir.join(format!(".{file_name}.part"));

    let written = fs::File::create(&temp_path).and_then(|mut file| {
        file.write_all(bytes)?;
        file.sync_all()
    });
    if let Err(e) = written.and_then(|()| fs::rename(&temp_path, path)) {
        if let Err(cleanup) = fs::remove_file(&temp_path)
            && cleanup.kind() != std::io::ErrorKind::NotFound
        {
            warn!(path = %temp_path.display(), error = %cleanup, "failed to remove temporary output");
        }
        return Err(TransformError::io(path, e));
    }
    Ok(())
}
