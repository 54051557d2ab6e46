//! Pipeline configuration.
//!
//! [`PipelineConfig`] is an immutable value built once (defaults, then an
//! optional TOML file, then command-line overrides) and handed to the
//! [`Pipeline`](crate::pipeline::Pipeline) at construction.

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use url::Url;

use crate::fetch::{
    DEFAULT_CONCURRENCY, DEFAULT_MAX_PAYLOAD_BYTES, DEFAULT_MIN_PAYLOAD_BYTES, MAX_CONCURRENCY,
    MIN_CONCURRENCY, RetryPolicy,
};
use crate::fetch::constants::{
    CONNECT_TIMEOUT_SECS, DEFAULT_BASE_BACKOFF_SECS, DEFAULT_MAX_ATTEMPTS,
    DEFAULT_MAX_BACKOFF_SECS, REQUEST_TIMEOUT_SECS,
};
use crate::resolver::{DEFAULT_LAYOUTS, LayoutResolver};
use crate::user_agent::default_user_agent;

/// Default archive storage root.
pub const DEFAULT_STORAGE_BASE_URL: &str = "https://storage.lczero.org/files/match_pgns/";

/// Default paginated match listing.
pub const DEFAULT_LISTING_URL: &str = "https://training.lczero.org/matches/";

/// Default training run directory.
pub const DEFAULT_RUN_ID: &str = "1";

/// Default bound on listing pages fetched at once.
pub const DEFAULT_DISCOVERY_CONCURRENCY: usize = 25;

/// Default state database file.
pub const DEFAULT_DB_FILE: &str = "lc0_matches.db";

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("failed to read config file '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The config file is not valid TOML or has unknown keys.
    #[error("failed to parse config file '{path}': {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    /// A value is out of range or otherwise unusable.
    #[error("invalid config value for `{field}`: {message}")]
    Invalid {
        field: &'static str,
        message: String,
    },
}

impl ConfigError {
    fn invalid(field: &'static str, message: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            message: message.into(),
        }
    }
}

/// Fully resolved pipeline settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Root of the archive storage tree. Always ends in `/`.
    pub storage_base_url: String,
    /// Paginated match listing page.
    pub listing_url: String,
    /// Training run directory inserted for `{run}`.
    pub run_id: String,
    /// Candidate URL templates, most likely first.
    pub url_layouts: Vec<String>,
    /// Maximum concurrent record fetches.
    pub concurrency: usize,
    /// Maximum concurrent listing page requests.
    pub discovery_concurrency: usize,
    /// Retry ceiling (fetch cycles per record).
    pub max_attempts: u32,
    /// First backoff delay.
    pub base_backoff: Duration,
    /// Backoff cap.
    pub max_backoff: Duration,
    /// Per-request timeout.
    pub request_timeout: Duration,
    /// TCP connect timeout.
    pub connect_timeout: Duration,
    /// Bodies shorter than this are classified as empty.
    pub min_payload_bytes: usize,
    /// Bodies longer than this are rejected while streaming.
    pub max_payload_bytes: u64,
    /// Where validated payloads are written.
    pub download_dir: PathBuf,
    /// Where transformed month files are written.
    pub processed_dir: PathBuf,
    /// State database location.
    pub db_path: PathBuf,
    /// Maximum pooled database connections.
    pub db_max_connections: u32,
    /// Database busy timeout.
    pub db_busy_timeout_ms: u32,
    /// Delete payloads once their record is transformed.
    pub prune_payloads: bool,
    /// User-Agent header for every request.
    pub user_agent: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            storage_base_url: DEFAULT_STORAGE_BASE_URL.to_string(),
            listing_url: DEFAULT_LISTING_URL.to_string(),
            run_id: DEFAULT_RUN_ID.to_string(),
            url_layouts: DEFAULT_LAYOUTS.iter().map(|s| (*s).to_string()).collect(),
            concurrency: DEFAULT_CONCURRENCY,
            discovery_concurrency: DEFAULT_DISCOVERY_CONCURRENCY,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_backoff: Duration::from_secs(DEFAULT_BASE_BACKOFF_SECS),
            max_backoff: Duration::from_secs(DEFAULT_MAX_BACKOFF_SECS),
            request_timeout: Duration::from_secs(REQUEST_TIMEOUT_SECS),
            connect_timeout: Duration::from_secs(CONNECT_TIMEOUT_SECS),
            min_payload_bytes: DEFAULT_MIN_PAYLOAD_BYTES,
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
            download_dir: PathBuf::from("downloads"),
            processed_dir: PathBuf::from("processed"),
            db_path: PathBuf::from(DEFAULT_DB_FILE),
            db_max_connections: 5,
            db_busy_timeout_ms: 5000,
            prune_payloads: false,
            user_agent: default_user_agent(),
        }
    }
}

impl PipelineConfig {
    /// Overlays every value present in `file`.
    #[must_use]
    pub fn with_file(mut self, file: &FileConfig) -> Self {
        if let Some(v) = &file.storage_base_url {
            self.storage_base_url.clone_from(v);
        }
        if let Some(v) = &file.listing_url {
            self.listing_url.clone_from(v);
        }
        if let Some(v) = &file.run_id {
            self.run_id.clone_from(v);
        }
        if let Some(v) = &file.url_layouts {
            self.url_layouts.clone_from(v);
        }
        if let Some(v) = file.concurrency {
            self.concurrency = v;
        }
        if let Some(v) = file.discovery_concurrency {
            self.discovery_concurrency = v;
        }
        if let Some(v) = file.max_attempts {
            self.max_attempts = v;
        }
        if let Some(v) = file.base_backoff_secs {
            self.base_backoff = Duration::from_secs(v);
        }
        if let Some(v) = file.max_backoff_secs {
            self.max_backoff = Duration::from_secs(v);
        }
        if let Some(v) = file.request_timeout_secs {
            self.request_timeout = Duration::from_secs(v);
        }
        if let Some(v) = file.connect_timeout_secs {
            self.connect_timeout = Duration::from_secs(v);
        }
        if let Some(v) = file.min_payload_bytes {
            self.min_payload_bytes = v;
        }
        if let Some(v) = file.max_payload_bytes {
            self.max_payload_bytes = v;
        }
        if let Some(v) = &file.download_dir {
            self.download_dir.clone_from(v);
        }
        if let Some(v) = &file.processed_dir {
            self.processed_dir.clone_from(v);
        }
        if let Some(v) = &file.db_path {
            self.db_path.clone_from(v);
        }
        if let Some(v) = file.db_max_connections {
            self.db_max_connections = v;
        }
        if let Some(v) = file.db_busy_timeout_ms {
            self.db_busy_timeout_ms = v;
        }
        if let Some(v) = file.prune_payloads {
            self.prune_payloads = v;
        }
        if let Some(v) = &file.user_agent {
            self.user_agent.clone_from(v);
        }
        self
    }

    /// Checks every value against its allowed range.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_http_url("storage_base_url", &self.storage_base_url)?;
        validate_http_url("listing_url", &self.listing_url)?;

        if self.run_id.is_empty() || self.run_id.contains(['/', '\\']) {
            return Err(ConfigError::invalid(
                "run_id",
                format!("'{}' must be a single non-empty path segment", self.run_id),
            ));
        }
        if !(MIN_CONCURRENCY..=MAX_CONCURRENCY).contains(&self.concurrency) {
            return Err(ConfigError::invalid(
                "concurrency",
                format!(
                    "{}. Expected range: {MIN_CONCURRENCY}..={MAX_CONCURRENCY}",
                    self.concurrency
                ),
            ));
        }
        if !(1..=100).contains(&self.discovery_concurrency) {
            return Err(ConfigError::invalid(
                "discovery_concurrency",
                format!("{}. Expected range: 1..=100", self.discovery_concurrency),
            ));
        }
        if !(1..=20).contains(&self.max_attempts) {
            return Err(ConfigError::invalid(
                "max_attempts",
                format!("{}. Expected range: 1..=20", self.max_attempts),
            ));
        }
        if self.base_backoff > self.max_backoff {
            return Err(ConfigError::invalid(
                "base_backoff_secs",
                format!(
                    "{}s exceeds max_backoff_secs {}s",
                    self.base_backoff.as_secs(),
                    self.max_backoff.as_secs()
                ),
            ));
        }
        validate_timeout("request_timeout_secs", self.request_timeout)?;
        validate_timeout("connect_timeout_secs", self.connect_timeout)?;
        if self.min_payload_bytes == 0 || (self.min_payload_bytes as u64) >= self.max_payload_bytes
        {
            return Err(ConfigError::invalid(
                "min_payload_bytes",
                format!(
                    "{} must be positive and below max_payload_bytes {}",
                    self.min_payload_bytes, self.max_payload_bytes
                ),
            ));
        }
        if !(1..=20).contains(&self.db_max_connections) {
            return Err(ConfigError::invalid(
                "db_max_connections",
                format!("{}. Expected range: 1..=20", self.db_max_connections),
            ));
        }
        if self.db_busy_timeout_ms > 120_000 {
            return Err(ConfigError::invalid(
                "db_busy_timeout_ms",
                format!("{}. Expected range: 0..=120000", self.db_busy_timeout_ms),
            ));
        }
        self.layout_resolver()?;
        Ok(())
    }

    /// Builds the retry policy these settings describe.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts, self.base_backoff, self.max_backoff)
    }

    /// Builds the URL resolver for the configured layouts.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when a layout template is unusable.
    pub fn layout_resolver(&self) -> Result<LayoutResolver, ConfigError> {
        LayoutResolver::new(&self.storage_base_url, &self.run_id, self.url_layouts.as_slice())
            .map_err(|e| ConfigError::invalid("url_layouts", e.to_string()))
    }
}

fn validate_http_url(field: &'static str, value: &str) -> Result<(), ConfigError> {
    let parsed =
        Url::parse(value).map_err(|e| ConfigError::invalid(field, format!("'{value}': {e}")))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(ConfigError::invalid(
            field,
            format!("'{value}' must use http or https"),
        ));
    }
    Ok(())
}

fn validate_timeout(field: &'static str, value: Duration) -> Result<(), ConfigError> {
    if !(1..=3600).contains(&value.as_secs()) {
        return Err(ConfigError::invalid(
            field,
            format!("{}. Expected range: 1..=3600", value.as_secs()),
        ));
    }
    Ok(())
}

/// TOML-backed file configuration. Every key is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub storage_base_url: Option<String>,
    pub listing_url: Option<String>,
    pub run_id: Option<String>,
    pub url_layouts: Option<Vec<String>>,
    pub concurrency: Option<usize>,
    pub discovery_concurrency: Option<usize>,
    pub max_attempts: Option<u32>,
    pub base_backoff_secs: Option<u64>,
    pub max_backoff_secs: Option<u64>,
    pub request_timeout_secs: Option<u64>,
    pub connect_timeout_secs: Option<u64>,
    pub min_payload_bytes: Option<usize>,
    pub max_payload_bytes: Option<u64>,
    pub download_dir: Option<PathBuf>,
    pub processed_dir: Option<PathBuf>,
    pub db_path: Option<PathBuf>,
    pub db_max_connections: Option<u32>,
    pub db_busy_timeout_ms: Option<u32>,
    pub prune_payloads: Option<bool>,
    pub user_agent: Option<String>,
}

impl FileConfig {
    /// Reads and parses a config file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Read`] or [`ConfigError::Parse`].
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Loads the default config file when it exists.
    ///
    /// # Errors
    ///
    /// Returns an error only when the file exists but cannot be read or parsed.
    pub fn load_default() -> Result<Option<(PathBuf, Self)>, ConfigError> {
        let Some(path) = resolve_default_config_path() else {
            return Ok(None);
        };
        if !path.exists() {
            return Ok(None);
        }
        let config = Self::load(&path)?;
        Ok(Some((path, config)))
    }
}

/// Resolves the default config path.
///
/// Priority:
/// 1. `$XDG_CONFIG_HOME/match-archiver/config.toml`
/// 2. `$HOME/.config/match-archiver/config.toml`
#[must_use]
pub fn resolve_default_config_path() -> Option<PathBuf> {
    if let Some(xdg_config_home) = env_var_non_empty_os("XDG_CONFIG_HOME") {
        return Some(
            PathBuf::from(xdg_config_home)
                .join("match-archiver")
                .join("config.toml"),
        );
    }

    let home = env_var_non_empty_os("HOME")?;
    Some(
        PathBuf::from(home)
            .join(".config")
            .join("match-archiver")
            .join("config.toml"),
    )
}

fn env_var_non_empty_os(name: &str) -> Option<std::ffi::OsString> {
    let value = env::var_os(name)?;
    if value.is_empty() { None } else { Some(value) }
}
