//! Recursive multi-horizon forecast chain.
//!
//! Horizons run strictly in order; horizon h+1's features are built
//! against the chain's own forecast for horizon h, not ground truth,
//! so forecast error compounds across horizons by design. A failure at
//! horizon h leaves horizons 1..h-1 persisted and writes nothing for
//! h..horizon_count.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::features::{build_feature_schema, build_features, ChainAccumulator, FeatureConfig};
use crate::forecaster::Forecaster;
use crate::normalizer::HOUR_MS;
use crate::store::{ForecastStore, StoreError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastIssue {
    pub series_id: String,
    pub issue_time_ms_utc: i64,
    pub horizon: u32,
    pub predicted_value: f64,
    pub model_version: String,
    pub computed_at_ms_utc: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainConfig {
    pub horizon_count: u32,
    pub feature: FeatureConfig,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            horizon_count: 6,
            feature: FeatureConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChainStatus {
    Success,
    PartialFailure { failed_at_horizon: u32 },
    Failure,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainOutcome {
    pub series_id: String,
    pub issue_time_ms_utc: i64,
    pub model_version: String,
    pub status: ChainStatus,
    /// Horizons persisted by this chain, in horizon order.
    pub issues: Vec<ForecastIssue>,
    pub error: Option<String>,
}

/// Runs one forecast chain for (series_id, issue_time).
///
/// The chain first takes exclusive write ownership of its key; a
/// concurrent holder means this invocation reports `Failure` without
/// writing anything. Pre-chain failures (claim, schema disagreement,
/// history load) are `Failure`; a failure at horizon h is
/// `PartialFailure`. No horizon is ever filled with a default value.
/// Retry is the orchestrator's decision, driven by the returned status.
pub fn run_forecast_chain(
    store: &mut ForecastStore,
    forecaster: &dyn Forecaster,
    series_id: &str,
    issue_time_ms_utc: i64,
    cfg: &ChainConfig,
    computed_at_ms_utc: i64,
) -> ChainOutcome {
    let model_version = forecaster.model_version().to_string();

    info!(
        component = "driver",
        event = "chain.start",
        series_id,
        issue_time_ms_utc,
        model_version = %model_version,
        horizon_count = cfg.horizon_count
    );

    if let Err(message) = validate_chain_inputs(forecaster, issue_time_ms_utc, cfg) {
        return fail_before_chain(series_id, issue_time_ms_utc, &model_version, message);
    }

    if let Err(err) = store.claim_chain(series_id, issue_time_ms_utc, computed_at_ms_utc) {
        let message = match err {
            StoreError::ClaimHeld { .. } => format!("lost claim race: {err}"),
            other => format!("claim failed: {other}"),
        };
        return fail_before_chain(series_id, issue_time_ms_utc, &model_version, message);
    }

    let history = match store.load_observations(series_id, issue_time_ms_utc) {
        Ok(history) => history,
        Err(err) => {
            release_best_effort(store, series_id, issue_time_ms_utc);
            return fail_before_chain(
                series_id,
                issue_time_ms_utc,
                &model_version,
                format!("history load failed: {err}"),
            );
        }
    };

    let mut chain = ChainAccumulator::new(issue_time_ms_utc);
    let mut issues: Vec<ForecastIssue> = Vec::with_capacity(cfg.horizon_count as usize);

    for horizon in 1..=cfg.horizon_count {
        let target_hour_ms_utc = issue_time_ms_utc + i64::from(horizon) * HOUR_MS;

        let step = build_features(
            series_id,
            target_hour_ms_utc,
            &history,
            &chain,
            &cfg.feature,
            forecaster.schema(),
        )
        .map_err(|err| err.to_string())
        .and_then(|features| {
            forecaster
                .score(&features)
                .map_err(|err| err.to_string())
        })
        .and_then(|predicted_value| {
            let issue = ForecastIssue {
                series_id: series_id.to_string(),
                issue_time_ms_utc,
                horizon,
                predicted_value,
                model_version: model_version.clone(),
                computed_at_ms_utc,
            };
            store
                .append_issue(&issue)
                .map(|_| issue)
                .map_err(|err| err.to_string())
        });

        match step {
            Ok(issue) => {
                chain = chain.with_prediction(issue.predicted_value);
                issues.push(issue);
            }
            Err(message) => {
                warn!(
                    component = "driver",
                    event = "chain.abort",
                    series_id,
                    issue_time_ms_utc,
                    failed_at_horizon = horizon,
                    persisted_horizons = issues.len(),
                    error = %message
                );
                release_best_effort(store, series_id, issue_time_ms_utc);
                return ChainOutcome {
                    series_id: series_id.to_string(),
                    issue_time_ms_utc,
                    model_version,
                    status: ChainStatus::PartialFailure {
                        failed_at_horizon: horizon,
                    },
                    issues,
                    error: Some(message),
                };
            }
        }
    }

    release_best_effort(store, series_id, issue_time_ms_utc);

    info!(
        component = "driver",
        event = "chain.finish",
        series_id,
        issue_time_ms_utc,
        model_version = %model_version,
        persisted_horizons = issues.len()
    );

    ChainOutcome {
        series_id: series_id.to_string(),
        issue_time_ms_utc,
        model_version,
        status: ChainStatus::Success,
        issues,
        error: None,
    }
}

fn validate_chain_inputs(
    forecaster: &dyn Forecaster,
    issue_time_ms_utc: i64,
    cfg: &ChainConfig,
) -> Result<(), String> {
    if cfg.horizon_count == 0 {
        return Err("horizon_count must be >= 1".to_string());
    }
    if issue_time_ms_utc % HOUR_MS != 0 {
        return Err(format!(
            "issue time {issue_time_ms_utc} is not aligned to an hour boundary"
        ));
    }

    let built = build_feature_schema(&cfg.feature).map_err(|err| err.to_string())?;
    let declared = forecaster.schema();
    if built.fingerprint != declared.fingerprint {
        return Err(format!(
            "feature config fingerprint {} disagrees with model schema fingerprint {}",
            built.fingerprint, declared.fingerprint
        ));
    }

    Ok(())
}

fn fail_before_chain(
    series_id: &str,
    issue_time_ms_utc: i64,
    model_version: &str,
    message: String,
) -> ChainOutcome {
    warn!(
        component = "driver",
        event = "chain.failure",
        series_id,
        issue_time_ms_utc,
        error = %message
    );
    ChainOutcome {
        series_id: series_id.to_string(),
        issue_time_ms_utc,
        model_version: model_version.to_string(),
        status: ChainStatus::Failure,
        issues: Vec::new(),
        error: Some(message),
    }
}

fn release_best_effort(store: &mut ForecastStore, series_id: &str, issue_time_ms_utc: i64) {
    if let Err(err) = store.release_chain(series_id, issue_time_ms_utc) {
        warn!(
            component = "driver",
            event = "chain.claim_release_failed",
            series_id,
            issue_time_ms_utc,
            error = %err
        );
    }
}
