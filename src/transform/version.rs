//! Engine version attributed to a match by its date.

use chrono::NaiveDate;

/// `(first day, version)`, newest first.
const VERSION_BOUNDARIES: [((i32, u32, u32), &str); 9] = [
    ((2025, 1, 1), "v0.32.0"),
    ((2024, 6, 1), "v0.31.0"),
    ((2023, 7, 1), "v0.30.0"),
    ((2023, 1, 1), "v0.29.0"),
    ((2022, 1, 1), "v0.28.0"),
    ((2021, 1, 1), "v0.27.0"),
    ((2020, 1, 1), "v0.26.0"),
    ((2019, 1, 1), "v0.25.0"),
    ((2018, 1, 1), "v0.24.0"),
];

/// Version for anything older than the first boundary.
pub const FALLBACK_VERSION: &str = "v0.23.0";

/// Returns the engine version for a match played on `date`.
///
/// The newest boundary on or before `date` wins. A date that falls between two
/// boundaries takes the older boundary's version.
#[must_use]
pub fn version_for(date: NaiveDate) -> &'static str {
    VERSION_BOUNDARIES
        .iter()
        .find(|((y, m, d), _)| {
            NaiveDate::from_ymd_opt(*y, *m, *d).is_some_and(|boundary| date >= boundary)
        })
        .map_or(FALLBACK_VERSION, |(_, version)| *version)
}
