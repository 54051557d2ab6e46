//! HTML listing scraper for the public match table.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use scraper::{ElementRef, Html, Selector};
use tracing::{debug, instrument};
use url::Url;

use super::{Discovery, DiscoveryError};
use crate::fetch::HttpClient;
use crate::store::DiscoveredRecord;

const ROW_SELECTOR: &str = "table.table tbody tr";

const DATETIME_FORMATS: [&str; 3] = ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M", "%Y/%m/%d %H:%M:%S"];

/// Scrapes `<listing_url>?page=N&show_all=1`.
#[derive(Debug, Clone)]
pub struct ListingScraper {
    client: HttpClient,
    listing_url: String,
}

impl ListingScraper {
    #[must_use]
    pub fn new(client: HttpClient, listing_url: impl Into<String>) -> Self {
        Self {
            client,
            listing_url: listing_url.into(),
        }
    }

    /// URL requested for `page`.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::InvalidUrl`] if the listing URL does not parse.
    pub fn page_url(&self, page: u32) -> Result<Url, DiscoveryError> {
        let mut url = Url::parse(&self.listing_url).map_err(|e| DiscoveryError::InvalidUrl {
            url: self.listing_url.clone(),
            reason: e.to_string(),
        })?;
        url.query_pairs_mut()
            .append_pair("page", &page.to_string())
            .append_pair("show_all", "1");
        Ok(url)
    }
}

#[async_trait]
impl Discovery for ListingScraper {
    #[instrument(skip(self), fields(listing = %self.listing_url))]
    async fn discover_page(&self, page: u32) -> Result<Vec<DiscoveredRecord>, DiscoveryError> {
        let url = self.page_url(page)?;
        let response = self.client.get(url.as_str()).await?;
        if !response.is_success() {
            return Err(DiscoveryError::Status {
                page,
                status: response.status,
            });
        }
        let html = String::from_utf8_lossy(&response.body);
        let records = parse_listing(&html);
        debug!(page, records = records.len(), "parsed listing page");
        Ok(records)
    }
}

/// Extracts records from one listing page.
///
/// The first cell (or the link inside it) holds the match id and the last
/// cell the match timestamp. Rows missing either are skipped.
#[must_use]
pub fn parse_listing(html: &str) -> Vec<DiscoveredRecord> {
    let document = Html::parse_document(html);
    let (Ok(rows), Ok(cells), Ok(link)) = (
        Selector::parse(ROW_SELECTOR),
        Selector::parse("td"),
        Selector::parse("a"),
    ) else {
        return Vec::new();
    };

    let mut records = Vec::new();
    for row in document.select(&rows) {
        let tds: Vec<ElementRef<'_>> = row.select(&cells).collect();
        let (Some(first), Some(last)) = (tds.first(), tds.last()) else {
            continue;
        };

        let id_text = first
            .select(&link)
            .next()
            .map_or_else(|| cell_text(*first), cell_text);
        let date_text = cell_text(*last);

        let Ok(id) = id_text.parse::<i64>() else {
            debug!(cell = %id_text, "skipping row without numeric match id");
            continue;
        };
        let Some(occurred_at) = parse_timestamp(&date_text) else {
            debug!(id, cell = %date_text, "skipping row with unparseable date");
            continue;
        };
        records.push(DiscoveredRecord::with_default_filename(id, occurred_at));
    }
    records
}

fn cell_text(element: ElementRef<'_>) -> String {
    element.text().collect::<String>().trim().to_string()
}

/// Parses the timestamp formats seen in the listing. Naive values are UTC.
#[must_use]
pub(crate) fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    let normalized = raw.replacen('T', " ", 1);
    for format in DATETIME_FORMATS {
        if let Ok(ts) = NaiveDateTime::parse_from_str(&normalized, format) {
            return Some(ts.and_utc());
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|ts| ts.and_utc())
}
