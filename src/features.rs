//! Leakage-free feature construction for hourly demand forecasting.
//!
//! Features for a target hour are built from the hourly observation
//! history at or before the chain's issue time, plus the chain's own
//! accumulator for hours the chain has already forecast. Ground truth
//! later than the issue time is rejected outright rather than filtered.

use std::collections::BTreeMap;
use std::f64::consts::PI;

use chrono::{Datelike, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;

use crate::normalizer::{HourlyObservation, QualityFlag, HOUR_MS};

pub const FEATURE_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureConfig {
    /// Hour offsets for lag features, e.g. 1 means the hour before the
    /// target hour.
    pub lag_hours: Vec<u32>,
    pub rolling_window_hours: Vec<u32>,
    /// Fixed-date holidays as (month, day); matched against the target
    /// hour's UTC calendar date.
    pub holiday_dates: Vec<(u32, u32)>,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            lag_hours: vec![1, 2, 3, 24, 168],
            rolling_window_hours: vec![24, 168],
            holiday_dates: spanish_national_holidays(),
        }
    }
}

/// Spanish national fixed-date holidays; the upstream demand indicator
/// is the peninsular Spanish grid.
fn spanish_national_holidays() -> Vec<(u32, u32)> {
    vec![
        (1, 1),
        (1, 6),
        (5, 1),
        (8, 15),
        (10, 12),
        (11, 1),
        (12, 6),
        (12, 8),
        (12, 25),
    ]
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureSchema {
    pub version: u32,
    pub fingerprint: String,
    pub columns: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    pub series_id: String,
    pub target_hour_ms_utc: i64,
    pub values: BTreeMap<String, f64>,
}

/// Immutable, ordered record of the forecasts already produced within
/// one chain. Extending it yields a new accumulator, so every chain
/// step's inputs are fully determined by (history, accumulator-so-far).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainAccumulator {
    issue_time_ms_utc: i64,
    predicted: Vec<f64>,
}

impl ChainAccumulator {
    pub fn new(issue_time_ms_utc: i64) -> Self {
        Self {
            issue_time_ms_utc,
            predicted: Vec::new(),
        }
    }

    pub fn issue_time_ms_utc(&self) -> i64 {
        self.issue_time_ms_utc
    }

    pub fn len(&self) -> usize {
        self.predicted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.predicted.is_empty()
    }

    #[must_use]
    pub fn with_prediction(&self, predicted_value: f64) -> Self {
        let mut predicted = self.predicted.clone();
        predicted.push(predicted_value);
        Self {
            issue_time_ms_utc: self.issue_time_ms_utc,
            predicted,
        }
    }

    /// Forecast value for an hour strictly after the issue time, if the
    /// chain has already produced it.
    pub fn value_at(&self, hour_start_ms_utc: i64) -> Option<f64> {
        if hour_start_ms_utc <= self.issue_time_ms_utc {
            return None;
        }
        let delta = hour_start_ms_utc - self.issue_time_ms_utc;
        if delta % HOUR_MS != 0 {
            return None;
        }
        let horizon = (delta / HOUR_MS) as usize;
        self.predicted.get(horizon - 1).copied()
    }
}

#[derive(Debug, Error)]
pub enum FeatureError {
    #[error("invalid feature config: {0}")]
    InvalidConfig(String),
    #[error("invalid UTC hour timestamp: {0}")]
    InvalidTimestamp(i64),
    #[error("target hour {target_hour_ms_utc} is not after issue time {issue_time_ms_utc}")]
    TargetNotAfterIssue {
        target_hour_ms_utc: i64,
        issue_time_ms_utc: i64,
    },
    #[error(
        "history contains observation at {hour_start_ms_utc} after issue time {issue_time_ms_utc}"
    )]
    FutureObservation {
        hour_start_ms_utc: i64,
        issue_time_ms_utc: i64,
    },
    #[error("feature vector does not match schema: missing {missing:?}, unexpected {unexpected:?}")]
    SchemaMismatch {
        missing: Vec<String>,
        unexpected: Vec<String>,
    },
}

pub fn build_feature_schema(cfg: &FeatureConfig) -> Result<FeatureSchema, FeatureError> {
    validate_config(cfg)?;

    let mut columns = Vec::new();
    for lag in &cfg.lag_hours {
        columns.push(format!("target_lag_{lag}"));
    }
    for window in &cfg.rolling_window_hours {
        columns.push(format!("target_roll_mean_{window}"));
        columns.push(format!("target_roll_std_{window}"));
        columns.push(format!("target_roll_min_{window}"));
        columns.push(format!("target_roll_max_{window}"));
    }
    columns.push("hour_of_day".to_string());
    columns.push("hour_sin".to_string());
    columns.push("hour_cos".to_string());
    columns.push("day_of_week".to_string());
    columns.push("is_holiday".to_string());

    let fingerprint = schema_fingerprint(cfg, &columns);

    Ok(FeatureSchema {
        version: FEATURE_SCHEMA_VERSION,
        fingerprint,
        columns,
    })
}

/// Builds the feature vector for one target hour.
///
/// Any hour reference in (issue_time, target_hour) is satisfied from
/// the chain accumulator, never from history; `Missing` hours simply
/// contribute nothing. The assembled vector is checked against the
/// forecaster's declared schema and a shortfall is an error, never a
/// padded default.
pub fn build_features(
    series_id: &str,
    target_hour_ms_utc: i64,
    history: &[HourlyObservation],
    chain: &ChainAccumulator,
    cfg: &FeatureConfig,
    schema: &FeatureSchema,
) -> Result<FeatureVector, FeatureError> {
    validate_config(cfg)?;

    if target_hour_ms_utc % HOUR_MS != 0 {
        return Err(FeatureError::InvalidTimestamp(target_hour_ms_utc));
    }
    let issue_time_ms_utc = chain.issue_time_ms_utc();
    if target_hour_ms_utc <= issue_time_ms_utc {
        return Err(FeatureError::TargetNotAfterIssue {
            target_hour_ms_utc,
            issue_time_ms_utc,
        });
    }

    let mut known: BTreeMap<i64, f64> = BTreeMap::new();
    for obs in history {
        if obs.hour_start_ms_utc > issue_time_ms_utc {
            return Err(FeatureError::FutureObservation {
                hour_start_ms_utc: obs.hour_start_ms_utc,
                issue_time_ms_utc,
            });
        }
        if obs.quality != QualityFlag::Missing {
            if let Some(value) = obs.value {
                known.insert(obs.hour_start_ms_utc, value);
            }
        }
    }

    let value_for_hour = |hour: i64| -> Option<f64> {
        if hour > issue_time_ms_utc {
            chain.value_at(hour)
        } else {
            known.get(&hour).copied()
        }
    };

    let mut values = BTreeMap::new();

    for lag in &cfg.lag_hours {
        let hour = target_hour_ms_utc - i64::from(*lag) * HOUR_MS;
        if let Some(value) = value_for_hour(hour) {
            values.insert(format!("target_lag_{lag}"), value);
        }
    }

    for window in &cfg.rolling_window_hours {
        let mut samples = Vec::new();
        for offset in 1..=i64::from(*window) {
            if let Some(value) = value_for_hour(target_hour_ms_utc - offset * HOUR_MS) {
                samples.push(value);
            }
        }
        if samples.is_empty() {
            continue;
        }
        let mean = samples.iter().sum::<f64>() / samples.len() as f64;
        let variance = samples
            .iter()
            .map(|v| {
                let d = *v - mean;
                d * d
            })
            .sum::<f64>()
            / samples.len() as f64;
        let min = samples.iter().copied().fold(f64::MAX, f64::min);
        let max = samples.iter().copied().fold(f64::MIN, f64::max);
        values.insert(format!("target_roll_mean_{window}"), mean);
        values.insert(format!("target_roll_std_{window}"), variance.sqrt());
        values.insert(format!("target_roll_min_{window}"), min);
        values.insert(format!("target_roll_max_{window}"), max);
    }

    let dt = Utc
        .timestamp_millis_opt(target_hour_ms_utc)
        .single()
        .ok_or(FeatureError::InvalidTimestamp(target_hour_ms_utc))?;
    let hour_of_day = dt.hour() as f64;
    let angle = 2.0 * PI * hour_of_day / 24.0;
    let is_holiday = cfg
        .holiday_dates
        .iter()
        .any(|&(month, day)| dt.month() == month && dt.day() == day);

    values.insert("hour_of_day".to_string(), hour_of_day);
    values.insert("hour_sin".to_string(), angle.sin());
    values.insert("hour_cos".to_string(), angle.cos());
    values.insert(
        "day_of_week".to_string(),
        dt.weekday().num_days_from_monday() as f64,
    );
    values.insert(
        "is_holiday".to_string(),
        if is_holiday { 1.0 } else { 0.0 },
    );

    assert_matches_schema(&values, schema)?;

    debug!(
        component = "features",
        event = "features.vector.built",
        series_id,
        target_hour_ms_utc,
        accumulator_len = chain.len(),
        feature_count = values.len()
    );

    Ok(FeatureVector {
        series_id: series_id.to_string(),
        target_hour_ms_utc,
        values,
    })
}

fn assert_matches_schema(
    values: &BTreeMap<String, f64>,
    schema: &FeatureSchema,
) -> Result<(), FeatureError> {
    let missing: Vec<String> = schema
        .columns
        .iter()
        .filter(|column| !values.contains_key(*column))
        .cloned()
        .collect();
    let unexpected: Vec<String> = values
        .keys()
        .filter(|name| !schema.columns.contains(name))
        .cloned()
        .collect();

    if missing.is_empty() && unexpected.is_empty() {
        Ok(())
    } else {
        Err(FeatureError::SchemaMismatch {
            missing,
            unexpected,
        })
    }
}

fn validate_config(cfg: &FeatureConfig) -> Result<(), FeatureError> {
    if cfg.lag_hours.is_empty() {
        return Err(FeatureError::InvalidConfig(
            "lag_hours must not be empty".to_string(),
        ));
    }

    let mut seen_lags = std::collections::HashSet::new();
    for lag in &cfg.lag_hours {
        if *lag == 0 {
            return Err(FeatureError::InvalidConfig(
                "lag_hours entries must be > 0".to_string(),
            ));
        }
        if !seen_lags.insert(*lag) {
            return Err(FeatureError::InvalidConfig(
                "lag_hours entries must be unique".to_string(),
            ));
        }
    }

    let mut seen_windows = std::collections::HashSet::new();
    for window in &cfg.rolling_window_hours {
        if *window == 0 {
            return Err(FeatureError::InvalidConfig(
                "rolling_window_hours entries must be > 0".to_string(),
            ));
        }
        if !seen_windows.insert(*window) {
            return Err(FeatureError::InvalidConfig(
                "rolling_window_hours entries must be unique".to_string(),
            ));
        }
    }

    Ok(())
}

fn schema_fingerprint(cfg: &FeatureConfig, columns: &[String]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("version:{FEATURE_SCHEMA_VERSION};"));
    hasher.update("lags:");
    for lag in &cfg.lag_hours {
        hasher.update(format!("{lag},"));
    }
    hasher.update(";windows:");
    for window in &cfg.rolling_window_hours {
        hasher.update(format!("{window},"));
    }
    hasher.update(";holidays:");
    for (month, day) in &cfg.holiday_dates {
        hasher.update(format!("{month}-{day},"));
    }
    hasher.update(";columns:");
    for column in columns {
        hasher.update(column.as_bytes());
        hasher.update(";");
    }
    hex::encode(hasher.finalize())
}
