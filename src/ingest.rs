//! Raw reading ingestion: timestamp normalization and CSV batch loading.
//!
//! Readings arrive with no ordering guarantee and possible duplicates;
//! the position of a reading inside its batch is its ingestion sequence
//! and is what duplicate resolution keys on downstream.

use std::path::{Path, PathBuf};

use chrono::{DateTime, LocalResult, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Europe::Madrid;
use csv::StringRecord;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

/// One externally supplied reading. Immutable; possibly out of order or
/// duplicated relative to the rest of its batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawReading {
    pub series_id: String,
    pub ts_ms_utc: i64,
    pub value: f64,
    pub source: String,
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("I/O error reading {path}: {message}")]
    Io { path: PathBuf, message: String },
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("CSV is missing required column '{column}'")]
    MissingColumn { column: &'static str },
    #[error("failed to parse field {field} value '{value}' at record {record}")]
    ParseField {
        field: &'static str,
        value: String,
        record: u64,
    },
    #[error("unparseable timestamp '{0}'")]
    InvalidTimestamp(String),
}

/// Parses an ingestion timestamp into ms UTC.
///
/// RFC 3339 strings carry their own offset. Naive stamps (no offset)
/// are interpreted as Europe/Madrid local time, the timezone of the
/// upstream demand indicator, then converted to UTC. On a DST fold the
/// earlier instant wins; a nonexistent local time is rejected.
pub fn parse_reading_timestamp(raw: &str) -> Result<i64, IngestError> {
    let trimmed = raw.trim();

    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(dt.with_timezone(&Utc).timestamp_millis());
    }

    let naive = NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%d %H:%M:%S")
        .or_else(|_| NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%dT%H:%M:%S"))
        .map_err(|_| IngestError::InvalidTimestamp(trimmed.to_string()))?;

    match Madrid.from_local_datetime(&naive) {
        LocalResult::Single(dt) => Ok(dt.with_timezone(&Utc).timestamp_millis()),
        LocalResult::Ambiguous(earliest, _) => Ok(earliest.with_timezone(&Utc).timestamp_millis()),
        LocalResult::None => Err(IngestError::InvalidTimestamp(trimmed.to_string())),
    }
}

/// Loads a batch of readings from a headed CSV file with columns
/// `series_id,datetime,value` and an optional `source` column.
pub fn load_readings_csv(path: &Path) -> Result<Vec<RawReading>, IngestError> {
    let mut reader = csv::Reader::from_path(path).map_err(|err| IngestError::Io {
        path: path.to_path_buf(),
        message: err.to_string(),
    })?;

    let headers = reader.headers()?.clone();
    let series_idx = column_index(&headers, "series_id")?;
    let datetime_idx = column_index(&headers, "datetime")?;
    let value_idx = column_index(&headers, "value")?;
    let source_idx = headers.iter().position(|name| name == "source");

    let mut readings = Vec::new();
    for (record_idx, record) in reader.records().enumerate() {
        let record = record?;
        readings.push(parse_reading_record(
            &record,
            record_idx as u64,
            series_idx,
            datetime_idx,
            value_idx,
            source_idx,
        )?);
    }

    info!(
        component = "ingest",
        event = "ingest.csv.loaded",
        path = %path.display(),
        reading_count = readings.len()
    );

    Ok(readings)
}

fn column_index(headers: &StringRecord, column: &'static str) -> Result<usize, IngestError> {
    headers
        .iter()
        .position(|name| name == column)
        .ok_or(IngestError::MissingColumn { column })
}

fn parse_reading_record(
    record: &StringRecord,
    record_idx: u64,
    series_idx: usize,
    datetime_idx: usize,
    value_idx: usize,
    source_idx: Option<usize>,
) -> Result<RawReading, IngestError> {
    let series_id = record.get(series_idx).unwrap_or_default().to_string();
    let raw_ts = record.get(datetime_idx).unwrap_or_default();
    let raw_value = record.get(value_idx).unwrap_or_default();

    let ts_ms_utc = parse_reading_timestamp(raw_ts)?;
    let value: f64 = raw_value.trim().parse().map_err(|_| IngestError::ParseField {
        field: "value",
        value: raw_value.to_string(),
        record: record_idx,
    })?;

    let source = source_idx
        .and_then(|idx| record.get(idx))
        .unwrap_or_default()
        .to_string();

    Ok(RawReading {
        series_id,
        ts_ms_utc,
        value,
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn rfc3339_timestamp_keeps_its_offset() {
        let ms = parse_reading_timestamp("2025-01-01T00:00:00Z").expect("parse");
        assert_eq!(ms, 1_735_689_600_000);

        let offset = parse_reading_timestamp("2025-01-01T01:00:00+01:00").expect("parse");
        assert_eq!(offset, 1_735_689_600_000);
    }

    #[test]
    fn naive_timestamp_is_read_as_madrid_local_time() {
        // Winter: Madrid is UTC+1, so 01:00 local is midnight UTC.
        let ms = parse_reading_timestamp("2025-01-01 01:00:00").expect("parse");
        assert_eq!(ms, 1_735_689_600_000);

        // Summer: UTC+2.
        let ms = parse_reading_timestamp("2025-07-01 02:00:00").expect("parse");
        let expected = DateTime::parse_from_rfc3339("2025-07-01T00:00:00Z")
            .expect("rfc3339")
            .timestamp_millis();
        assert_eq!(ms, expected);
    }

    #[test]
    fn garbage_timestamp_is_rejected() {
        let err = parse_reading_timestamp("not-a-time").expect_err("must fail");
        assert!(matches!(err, IngestError::InvalidTimestamp(_)));
    }

    #[test]
    fn csv_batch_loads_with_and_without_source_column() {
        let mut file = tempfile::NamedTempFile::new().expect("temp csv");
        writeln!(file, "series_id,datetime,value,source").expect("write");
        writeln!(file, "S1,2025-01-01T00:00:00Z,101.5,esios").expect("write");
        writeln!(file, "S1,2025-01-01T00:05:00Z,102.0,esios").expect("write");
        file.flush().expect("flush");

        let readings = load_readings_csv(file.path()).expect("load");
        assert_eq!(readings.len(), 2);
        assert_eq!(readings[0].series_id, "S1");
        assert_eq!(readings[0].ts_ms_utc, 1_735_689_600_000);
        assert_eq!(readings[0].value, 101.5);
        assert_eq!(readings[0].source, "esios");

        let mut bare = tempfile::NamedTempFile::new().expect("temp csv");
        writeln!(bare, "series_id,datetime,value").expect("write");
        writeln!(bare, "S2,2025-01-01 01:00:00,55.0").expect("write");
        bare.flush().expect("flush");

        let readings = load_readings_csv(bare.path()).expect("load");
        assert_eq!(readings[0].series_id, "S2");
        assert_eq!(readings[0].ts_ms_utc, 1_735_689_600_000);
        assert_eq!(readings[0].source, "");
    }

    #[test]
    fn csv_missing_required_column_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().expect("temp csv");
        writeln!(file, "series_id,value").expect("write");
        writeln!(file, "S1,1.0").expect("write");
        file.flush().expect("flush");

        let err = load_readings_csv(file.path()).expect_err("must fail");
        assert!(matches!(
            err,
            IngestError::MissingColumn { column: "datetime" }
        ));
    }
}
