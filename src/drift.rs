//! Statistical drift monitoring against immutable baseline snapshots.
//!
//! Runs off the forecasting path on eventually-consistent windows of
//! observations, features, or prediction residuals. Each evaluation
//! compares a recent window against a baseline tied to a specific
//! model version using a two-sample Kolmogorov-Smirnov test. Too few
//! samples is an explicit `Inconclusive`, never a drift verdict.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::driver::ForecastIssue;
use crate::normalizer::{HourlyObservation, QualityFlag, HOUR_MS};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggerPolicy {
    /// Series-level trigger is the OR across monitored features.
    AnyFeature,
    /// Series-level trigger requires every conclusive feature to drift.
    AllFeatures,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriftConfig {
    /// p-value cutoff below which a feature counts as drifted.
    pub significance_threshold: f64,
    pub min_sample_count: usize,
    pub trigger_policy: TriggerPolicy,
}

impl Default for DriftConfig {
    fn default() -> Self {
        Self {
            significance_threshold: 0.01,
            min_sample_count: 30,
            trigger_policy: TriggerPolicy::AnyFeature,
        }
    }
}

/// Reference distribution frozen when a model version is published.
/// Never recomputed from a growing history; re-registration with
/// different samples is rejected by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaselineSnapshot {
    pub model_version: String,
    pub series_id: String,
    pub feature_name: String,
    pub samples: Vec<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DriftOutcome {
    Triggered,
    NoDrift,
    Inconclusive,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriftReport {
    pub series_id: String,
    pub feature_name: String,
    /// Model version whose baseline snapshot was compared against.
    pub baseline_ref: String,
    pub baseline_len: usize,
    pub window_len: usize,
    pub statistic: Option<f64>,
    pub p_value: Option<f64>,
    pub outcome: DriftOutcome,
}

#[derive(Debug, Error)]
pub enum DriftError {
    #[error("invalid drift config: {0}")]
    InvalidConfig(String),
}

/// Two-sample Kolmogorov-Smirnov test. Returns (D, p) where D is the
/// supremum distance between the empirical CDFs and p the asymptotic
/// Kolmogorov p-value with the effective-sample-size correction.
/// Callers must pass non-empty slices.
pub fn ks_two_sample(a: &[f64], b: &[f64]) -> (f64, f64) {
    let mut sorted_a: Vec<f64> = a.to_vec();
    let mut sorted_b: Vec<f64> = b.to_vec();
    sorted_a.sort_by(|x, y| x.partial_cmp(y).unwrap_or(std::cmp::Ordering::Equal));
    sorted_b.sort_by(|x, y| x.partial_cmp(y).unwrap_or(std::cmp::Ordering::Equal));

    let n_a = sorted_a.len();
    let n_b = sorted_b.len();
    let mut i = 0usize;
    let mut j = 0usize;
    let mut d_max = 0.0f64;

    while i < n_a && j < n_b {
        let x = sorted_a[i].min(sorted_b[j]);
        while i < n_a && sorted_a[i] <= x {
            i += 1;
        }
        while j < n_b && sorted_b[j] <= x {
            j += 1;
        }
        let f_a = i as f64 / n_a as f64;
        let f_b = j as f64 / n_b as f64;
        d_max = d_max.max((f_a - f_b).abs());
    }

    let n_eff = (n_a as f64 * n_b as f64) / (n_a as f64 + n_b as f64);
    let lambda = (n_eff.sqrt() + 0.12 + 0.11 / n_eff.sqrt()) * d_max;
    (d_max, kolmogorov_survival(lambda))
}

/// Q(lambda) = 2 * sum_{k>=1} (-1)^{k-1} exp(-2 k^2 lambda^2).
fn kolmogorov_survival(lambda: f64) -> f64 {
    if lambda < 1e-3 {
        return 1.0;
    }

    let mut sum = 0.0f64;
    let mut sign = 1.0f64;
    for k in 1..=100u32 {
        let k = f64::from(k);
        let term = (-2.0 * k * k * lambda * lambda).exp();
        sum += sign * term;
        sign = -sign;
        if term < 1e-12 {
            break;
        }
    }
    (2.0 * sum).clamp(0.0, 1.0)
}

/// Evaluates one monitored feature against its baseline snapshot.
pub fn evaluate_feature(
    baseline: &BaselineSnapshot,
    recent_window: &[f64],
    cfg: &DriftConfig,
) -> Result<DriftReport, DriftError> {
    validate_config(cfg)?;

    let mut report = DriftReport {
        series_id: baseline.series_id.clone(),
        feature_name: baseline.feature_name.clone(),
        baseline_ref: baseline.model_version.clone(),
        baseline_len: baseline.samples.len(),
        window_len: recent_window.len(),
        statistic: None,
        p_value: None,
        outcome: DriftOutcome::Inconclusive,
    };

    if recent_window.len() < cfg.min_sample_count
        || baseline.samples.len() < cfg.min_sample_count
    {
        info!(
            component = "drift",
            event = "drift.inconclusive",
            series_id = %report.series_id,
            feature_name = %report.feature_name,
            window_len = report.window_len,
            min_sample_count = cfg.min_sample_count
        );
        return Ok(report);
    }

    let (statistic, p_value) = ks_two_sample(&baseline.samples, recent_window);
    report.statistic = Some(statistic);
    report.p_value = Some(p_value);
    report.outcome = if p_value < cfg.significance_threshold {
        DriftOutcome::Triggered
    } else {
        DriftOutcome::NoDrift
    };

    info!(
        component = "drift",
        event = "drift.evaluated",
        series_id = %report.series_id,
        feature_name = %report.feature_name,
        baseline_ref = %report.baseline_ref,
        statistic,
        p_value,
        outcome = ?report.outcome
    );

    Ok(report)
}

/// Combines per-feature reports into one series-level decision under
/// the configured policy. Inconclusive reports never count toward
/// either side; a series with only inconclusive reports is
/// inconclusive.
pub fn evaluate_series(reports: &[DriftReport], policy: TriggerPolicy) -> DriftOutcome {
    let conclusive: Vec<&DriftReport> = reports
        .iter()
        .filter(|report| report.outcome != DriftOutcome::Inconclusive)
        .collect();

    if conclusive.is_empty() {
        return DriftOutcome::Inconclusive;
    }

    let triggered = match policy {
        TriggerPolicy::AnyFeature => conclusive
            .iter()
            .any(|report| report.outcome == DriftOutcome::Triggered),
        TriggerPolicy::AllFeatures => conclusive
            .iter()
            .all(|report| report.outcome == DriftOutcome::Triggered),
    };

    if triggered {
        DriftOutcome::Triggered
    } else {
        DriftOutcome::NoDrift
    }
}

/// Residuals (observed - predicted) for issues whose target hour has
/// observed ground truth. Imputed and missing hours contribute nothing.
pub fn prediction_residuals(
    observations: &[HourlyObservation],
    issues: &[ForecastIssue],
) -> Vec<f64> {
    let mut residuals = Vec::new();
    for issue in issues {
        let target_hour = issue.issue_time_ms_utc + i64::from(issue.horizon) * HOUR_MS;
        let observed = observations.iter().find(|obs| {
            obs.hour_start_ms_utc == target_hour && obs.quality == QualityFlag::Observed
        });
        if let Some(obs) = observed {
            if let Some(value) = obs.value {
                residuals.push(value - issue.predicted_value);
            }
        }
    }
    residuals
}

fn validate_config(cfg: &DriftConfig) -> Result<(), DriftError> {
    if !(cfg.significance_threshold > 0.0 && cfg.significance_threshold < 1.0) {
        return Err(DriftError::InvalidConfig(
            "significance_threshold must be in (0, 1)".to_string(),
        ));
    }
    if cfg.min_sample_count < 2 {
        return Err(DriftError::InvalidConfig(
            "min_sample_count must be >= 2".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_samples_have_zero_statistic_and_p_one() {
        let samples: Vec<f64> = (0..50).map(|i| i as f64).collect();
        let (d, p) = ks_two_sample(&samples, &samples);
        assert_eq!(d, 0.0);
        assert_eq!(p, 1.0);
    }

    #[test]
    fn disjoint_samples_have_statistic_one_and_tiny_p() {
        let low: Vec<f64> = (0..50).map(|i| i as f64).collect();
        let high: Vec<f64> = (0..50).map(|i| 1_000.0 + i as f64).collect();
        let (d, p) = ks_two_sample(&low, &high);
        assert_eq!(d, 1.0);
        assert!(p < 1e-6, "p={p}");
    }

    #[test]
    fn moderate_shift_lands_between_extremes() {
        let base: Vec<f64> = (0..100).map(|i| i as f64).collect();
        let shifted: Vec<f64> = (0..100).map(|i| i as f64 + 30.0).collect();
        let (d, p) = ks_two_sample(&base, &shifted);
        assert!(d > 0.0 && d < 1.0);
        assert!(p < 1.0);
    }

    #[test]
    fn insufficient_window_is_inconclusive_not_no_drift() {
        let baseline = BaselineSnapshot {
            model_version: "v1".to_string(),
            series_id: "S1".to_string(),
            feature_name: "target_lag_1".to_string(),
            samples: (0..100).map(|i| i as f64).collect(),
        };
        let cfg = DriftConfig::default();

        let report = evaluate_feature(&baseline, &[1.0, 2.0, 3.0], &cfg).expect("report");
        assert_eq!(report.outcome, DriftOutcome::Inconclusive);
        assert!(report.statistic.is_none());
        assert!(report.p_value.is_none());
    }

    #[test]
    fn invalid_config_is_rejected() {
        let baseline = BaselineSnapshot {
            model_version: "v1".to_string(),
            series_id: "S1".to_string(),
            feature_name: "f".to_string(),
            samples: vec![1.0; 50],
        };
        let cfg = DriftConfig {
            significance_threshold: 1.5,
            ..DriftConfig::default()
        };
        assert!(matches!(
            evaluate_feature(&baseline, &[1.0; 50], &cfg),
            Err(DriftError::InvalidConfig(_))
        ));
    }

    fn report_with(outcome: DriftOutcome) -> DriftReport {
        DriftReport {
            series_id: "S1".to_string(),
            feature_name: "f".to_string(),
            baseline_ref: "v1".to_string(),
            baseline_len: 100,
            window_len: 100,
            statistic: Some(0.5),
            p_value: Some(0.001),
            outcome,
        }
    }

    #[test]
    fn series_policy_or_and_all_behave_differently() {
        let mixed = vec![
            report_with(DriftOutcome::Triggered),
            report_with(DriftOutcome::NoDrift),
        ];
        assert_eq!(
            evaluate_series(&mixed, TriggerPolicy::AnyFeature),
            DriftOutcome::Triggered
        );
        assert_eq!(
            evaluate_series(&mixed, TriggerPolicy::AllFeatures),
            DriftOutcome::NoDrift
        );
    }

    #[test]
    fn inconclusive_reports_never_count_toward_either_side() {
        let with_gap = vec![
            report_with(DriftOutcome::Inconclusive),
            report_with(DriftOutcome::Triggered),
        ];
        assert_eq!(
            evaluate_series(&with_gap, TriggerPolicy::AllFeatures),
            DriftOutcome::Triggered
        );

        let only_gaps = vec![report_with(DriftOutcome::Inconclusive)];
        assert_eq!(
            evaluate_series(&only_gaps, TriggerPolicy::AnyFeature),
            DriftOutcome::Inconclusive
        );
    }

    #[test]
    fn residuals_pair_only_observed_ground_truth() {
        let t0 = 1_735_689_600_000;
        let issue = |h: u32, predicted: f64| ForecastIssue {
            series_id: "S1".to_string(),
            issue_time_ms_utc: t0,
            horizon: h,
            predicted_value: predicted,
            model_version: "v1".to_string(),
            computed_at_ms_utc: t0,
        };
        let obs = |idx: i64, value: Option<f64>, quality: QualityFlag| HourlyObservation {
            series_id: "S1".to_string(),
            hour_start_ms_utc: t0 + idx * HOUR_MS,
            value,
            quality,
        };

        let observations = vec![
            obs(1, Some(105.0), QualityFlag::Observed),
            obs(2, Some(110.0), QualityFlag::Imputed),
        ];
        let issues = vec![issue(1, 100.0), issue(2, 100.0), issue(3, 100.0)];

        let residuals = prediction_residuals(&observations, &issues);
        assert_eq!(residuals, vec![5.0]);
    }
}
