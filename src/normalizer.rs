//! Irregular readings to fixed hourly grid, with gap classification.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::ingest::RawReading;

pub const HOUR_MS: i64 = 3_600_000;

const MAX_REPORTED_GAP_RANGES: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AggregationFn {
    Mean,
    Last,
    Sum,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QualityFlag {
    Observed,
    Imputed,
    Missing,
}

impl QualityFlag {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Observed => "OBSERVED",
            Self::Imputed => "IMPUTED",
            Self::Missing => "MISSING",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "OBSERVED" => Some(Self::Observed),
            "IMPUTED" => Some(Self::Imputed),
            "MISSING" => Some(Self::Missing),
            _ => None,
        }
    }
}

/// One hourly grid point. `value` is `None` exactly when the hour is
/// flagged `Missing`; such hours are excluded from every downstream
/// feature window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HourlyObservation {
    pub series_id: String,
    pub hour_start_ms_utc: i64,
    pub value: Option<f64>,
    pub quality: QualityFlag,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizerConfig {
    pub aggregation: AggregationFn,
    pub max_imputation_gap_hours: u32,
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            aggregation: AggregationFn::Mean,
            max_imputation_gap_hours: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizeReport {
    pub raw_count: u64,
    pub duplicate_readings_resolved: u64,
    pub observed_hours: u64,
    pub imputed_hours: u64,
    pub missing_hours: u64,
    /// Grid ranges flagged `Missing`, as (start_ms, end_ms_exclusive).
    pub missing_ranges: Vec<(i64, i64)>,
}

#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("invalid normalizer config: {0}")]
    InvalidConfig(String),
}

/// Resamples an unordered, possibly duplicated batch of readings into
/// hourly observations, one per (series_id, hour_start).
///
/// Duplicate raw timestamps within a bucket resolve last-write-wins by
/// position in the batch. Grid gaps up to `max_imputation_gap_hours`
/// consecutive hours are forward-filled and flagged `Imputed`; longer
/// runs are flagged `Missing`. Output is ordered by (series, hour).
pub fn normalize_batch(
    readings: &[RawReading],
    cfg: &NormalizerConfig,
) -> Result<(Vec<HourlyObservation>, NormalizeReport), NormalizeError> {
    validate_config(cfg)?;

    let mut report = NormalizeReport {
        raw_count: readings.len() as u64,
        duplicate_readings_resolved: 0,
        observed_hours: 0,
        imputed_hours: 0,
        missing_hours: 0,
        missing_ranges: Vec::new(),
    };

    // series -> raw timestamp -> value. The batch is walked in
    // ingestion order, so a later duplicate timestamp overwrites an
    // earlier one: last-write-wins by batch position.
    let mut per_series: BTreeMap<&str, BTreeMap<i64, f64>> = BTreeMap::new();
    for reading in readings {
        let series = per_series.entry(reading.series_id.as_str()).or_default();
        if series.insert(reading.ts_ms_utc, reading.value).is_some() {
            report.duplicate_readings_resolved += 1;
        }
    }

    let mut observations = Vec::new();
    for (series_id, by_ts) in &per_series {
        append_series_grid(series_id, by_ts, cfg, &mut observations, &mut report);
    }

    info!(
        component = "normalizer",
        event = "normalize.finish",
        raw_count = report.raw_count,
        duplicate_readings_resolved = report.duplicate_readings_resolved,
        observed_hours = report.observed_hours,
        imputed_hours = report.imputed_hours,
        missing_hours = report.missing_hours
    );

    Ok((observations, report))
}

fn validate_config(cfg: &NormalizerConfig) -> Result<(), NormalizeError> {
    // Zero is legal and means never impute. Beyond a week the fill is
    // no longer a gap repair but fabricated data.
    if cfg.max_imputation_gap_hours > 168 {
        return Err(NormalizeError::InvalidConfig(
            "max_imputation_gap_hours must be <= 168".to_string(),
        ));
    }
    Ok(())
}

fn append_series_grid(
    series_id: &str,
    by_ts: &BTreeMap<i64, f64>,
    cfg: &NormalizerConfig,
    observations: &mut Vec<HourlyObservation>,
    report: &mut NormalizeReport,
) {
    // hour start -> timestamp-ordered values surviving dedup.
    let mut buckets: BTreeMap<i64, Vec<f64>> = BTreeMap::new();
    for (ts_ms, value) in by_ts {
        let hour_start = ts_ms.div_euclid(HOUR_MS) * HOUR_MS;
        buckets.entry(hour_start).or_default().push(*value);
    }

    let Some((&first_hour, _)) = buckets.iter().next() else {
        return;
    };
    let (&last_hour, _) = buckets.iter().next_back().expect("non-empty buckets");

    let mut last_filled: Option<f64> = None;
    let mut hour = first_hour;
    while hour <= last_hour {
        match buckets.get(&hour) {
            Some(values) => {
                let value = aggregate(values, cfg.aggregation);
                observations.push(HourlyObservation {
                    series_id: series_id.to_string(),
                    hour_start_ms_utc: hour,
                    value: Some(value),
                    quality: QualityFlag::Observed,
                });
                report.observed_hours += 1;
                last_filled = Some(value);
                hour += HOUR_MS;
            }
            None => {
                let gap_start = hour;
                let mut gap_end = hour;
                while gap_end <= last_hour && !buckets.contains_key(&gap_end) {
                    gap_end += HOUR_MS;
                }
                let gap_hours = ((gap_end - gap_start) / HOUR_MS) as u32;

                let fill = last_filled.filter(|_| gap_hours <= cfg.max_imputation_gap_hours);
                match fill {
                    Some(value) => {
                        for fill_hour in (gap_start..gap_end).step_by(HOUR_MS as usize) {
                            observations.push(HourlyObservation {
                                series_id: series_id.to_string(),
                                hour_start_ms_utc: fill_hour,
                                value: Some(value),
                                quality: QualityFlag::Imputed,
                            });
                        }
                        report.imputed_hours += gap_hours as u64;
                    }
                    None => {
                        warn!(
                            component = "normalizer",
                            event = "normalize.gap_exceeds_tolerance",
                            series_id,
                            gap_start_ms_utc = gap_start,
                            gap_end_ms_utc_exclusive = gap_end,
                            gap_hours
                        );
                        for missing_hour in (gap_start..gap_end).step_by(HOUR_MS as usize) {
                            observations.push(HourlyObservation {
                                series_id: series_id.to_string(),
                                hour_start_ms_utc: missing_hour,
                                value: None,
                                quality: QualityFlag::Missing,
                            });
                        }
                        report.missing_hours += gap_hours as u64;
                        if report.missing_ranges.len() < MAX_REPORTED_GAP_RANGES {
                            report.missing_ranges.push((gap_start, gap_end));
                        }
                    }
                }
                hour = gap_end;
            }
        }
    }
}

fn aggregate(values: &[f64], aggregation: AggregationFn) -> f64 {
    match aggregation {
        AggregationFn::Mean => values.iter().sum::<f64>() / values.len() as f64,
        AggregationFn::Last => *values.last().expect("bucket values are non-empty"),
        AggregationFn::Sum => values.iter().sum::<f64>(),
    }
}
