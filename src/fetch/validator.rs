//! Content validation by byte-signature sniffing.
//!
//! The remote service answers missing files with HTTP 200 and an HTML page,
//! so a success status alone never makes a payload valid. Rules, in order:
//!
//! 1. Non-2xx status: [`ContentKind::ErrorPage`]
//! 2. Body shorter than the minimum size: [`ContentKind::Empty`]
//! 3. Known compressed-archive or tar signature: [`ContentKind::ValidArchive`]
//! 4. Leading PGN tag pair (`[Event "..."]`): [`ContentKind::ValidInlineText`]
//! 5. Anything else: [`ContentKind::ErrorPage`]

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::constants::{DEFAULT_MIN_PAYLOAD_BYTES, SNIFF_WINDOW};

/// Classification of a downloaded body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    /// Compressed archive (gzip, bzip2, xz, zstd, zip) or plain tar.
    ValidArchive,
    /// Plain line-based game records.
    ValidInlineText,
    /// Error status or a body that is neither archive nor game text.
    ErrorPage,
    /// Empty or implausibly short body.
    Empty,
}

impl ContentKind {
    /// Returns the database string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ValidArchive => "valid_archive",
            Self::ValidInlineText => "valid_inline_text",
            Self::ErrorPage => "error_page",
            Self::Empty => "empty",
        }
    }

    /// True for kinds that may be committed.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::ValidArchive | Self::ValidInlineText)
    }
}

impl fmt::Display for ContentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ContentKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "valid_archive" => Ok(Self::ValidArchive),
            "valid_inline_text" => Ok(Self::ValidInlineText),
            "error_page" => Ok(Self::ErrorPage),
            "empty" => Ok(Self::Empty),
            _ => Err(format!("invalid content kind: {s}")),
        }
    }
}

const ARCHIVE_MAGICS: [&[u8]; 6] = [
    &[0x1f, 0x8b],                         // gzip
    b"BZh",                                // bzip2
    &[0xfd, b'7', b'z', b'X', b'Z', 0x00], // xz
    &[0x28, 0xb5, 0x2f, 0xfd],             // zstd
    b"PK\x03\x04",                         // zip
    &[b'7', b'z', 0xbc, 0xaf, 0x27, 0x1c], // 7z
];

const TAR_MAGIC_OFFSET: usize = 257;

static PGN_TAG_PAIR: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r#"^\[[A-Za-z0-9_]+\s+""#).ok());

/// Classifies response bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentValidator {
    min_size: usize,
}

impl Default for ContentValidator {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_PAYLOAD_BYTES)
    }
}

impl ContentValidator {
    /// Creates a validator that treats bodies shorter than `min_size` as empty.
    #[must_use]
    pub fn new(min_size: usize) -> Self {
        Self {
            min_size: min_size.max(1),
        }
    }

    /// Minimum accepted body length.
    #[must_use]
    pub fn min_size(&self) -> usize {
        self.min_size
    }

    /// Classifies a response from its status and leading bytes.
    ///
    /// Response headers are not consulted.
    #[must_use]
    pub fn classify(&self, status: u16, body: &[u8]) -> ContentKind {
        if !(200..300).contains(&status) {
            return ContentKind::ErrorPage;
        }
        if body.len() < self.min_size {
            return ContentKind::Empty;
        }
        if is_archive(body) {
            return ContentKind::ValidArchive;
        }
        if looks_like_pgn(body) {
            return ContentKind::ValidInlineText;
        }
        ContentKind::ErrorPage
    }
}

fn is_archive(body: &[u8]) -> bool {
    ARCHIVE_MAGICS.iter().any(|magic| body.starts_with(magic))
        || body
            .get(TAR_MAGIC_OFFSET..TAR_MAGIC_OFFSET + 5)
            .is_some_and(|m| m == b"ustar")
}

fn looks_like_pgn(body: &[u8]) -> bool {
    let body = body.strip_prefix(b"\xef\xbb\xbf").unwrap_or(body);
    let start = body
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(body.len());
    let window = &body[start..body.len().min(start + SNIFF_WINDOW)];
    let text = String::from_utf8_lossy(window);
    PGN_TAG_PAIR
        .as_ref()
        .is_some_and(|re| re.is_match(&text))
}
