//! Discovery: enumerating which records exist.
//!
//! A [`Discovery`] turns one listing page number into the records shown on
//! that page. The pipeline treats the output as opaque input and only
//! inserts it into the store.

mod listing;

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use thiserror::Error;

pub use listing::{ListingScraper, parse_listing};

use crate::fetch::FetchError;
use crate::store::DiscoveredRecord;

/// Errors from a single listing page.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// The listing URL could not be built for a page.
    #[error("invalid listing URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    /// The page request failed before a response arrived.
    #[error("listing request failed: {0}")]
    Http(#[from] FetchError),

    /// The listing answered with a non-success status.
    #[error("listing page {page} returned HTTP {status}")]
    Status { page: u32, status: u16 },
}

/// Source of discovered records, one page at a time.
#[async_trait]
pub trait Discovery: Send + Sync {
    /// Returns the records listed on `page`.
    async fn discover_page(&self, page: u32) -> Result<Vec<DiscoveredRecord>, DiscoveryError>;
}

/// Fixed, in-memory pages.
///
/// Unknown pages are empty. Pages marked with [`Self::with_failing_page`]
/// answer like a listing returning HTTP 503.
#[derive(Debug, Clone, Default)]
pub struct StaticDiscovery {
    pages: BTreeMap<u32, Vec<DiscoveredRecord>>,
    failing: BTreeSet<u32>,
}

impl StaticDiscovery {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_page(mut self, page: u32, records: Vec<DiscoveredRecord>) -> Self {
        self.pages.insert(page, records);
        self
    }

    #[must_use]
    pub fn with_failing_page(mut self, page: u32) -> Self {
        self.failing.insert(page);
        self
    }
}

#[async_trait]
impl Discovery for StaticDiscovery {
    async fn discover_page(&self, page: u32) -> Result<Vec<DiscoveredRecord>, DiscoveryError> {
        if self.failing.contains(&page) {
            return Err(DiscoveryError::Status { page, status: 503 });
        }
        Ok(self.pages.get(&page).cloned().unwrap_or_default())
    }
}
