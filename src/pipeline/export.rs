//! CSV export of discovered records.

use std::io::Write;

use serde::Serialize;

use crate::store::{Record, format_timestamp};

/// Header row written ahead of the records.
pub const CSV_HEADER: [&str; 3] = ["id", "occurred_at", "source_filename"];

#[derive(Debug, Serialize)]
struct CsvRow<'a> {
    id: i64,
    occurred_at: String,
    source_filename: &'a str,
}

/// Writes `records` as `id,occurred_at,source_filename` rows, in the order given.
///
/// Returns the number of data rows written.
///
/// # Errors
///
/// Returns the `csv` writer's error if the underlying writer fails.
pub fn write_records_csv<W: Write>(writer: W, records: &[Record]) -> Result<usize, csv::Error> {
    let mut out = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(writer);
    out.write_record(CSV_HEADER)?;
    for record in records {
        out.serialize(CsvRow {
            id: record.id,
            occurred_at: format_timestamp(&record.occurred_at),
            source_filename: &record.source_filename,
        })?;
    }
    out.flush()?;
    Ok(records.len())
}
