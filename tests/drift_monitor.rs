use demandcast::{
    evaluate_feature, evaluate_series, BaselineSnapshot, DriftConfig, DriftOutcome, ForecastStore,
    TriggerPolicy,
};

/// Deterministic pseudo-normal samples: mean + std * z with z swept
/// over [-2, 2].
fn samples(mean: f64, std: f64, n: usize) -> Vec<f64> {
    (0..n)
        .map(|i| {
            let z = ((i % 81) as f64 - 40.0) / 20.0;
            mean + std * z
        })
        .collect()
}

fn baseline(mean: f64, std: f64, n: usize) -> BaselineSnapshot {
    BaselineSnapshot {
        model_version: "v3".to_string(),
        series_id: "S1".to_string(),
        feature_name: "target_lag_1".to_string(),
        samples: samples(mean, std, n),
    }
}

#[test]
fn large_mean_shift_triggers_at_one_percent_significance() {
    let cfg = DriftConfig {
        significance_threshold: 0.01,
        min_sample_count: 30,
        trigger_policy: TriggerPolicy::AnyFeature,
    };

    let base = baseline(100.0, 10.0, 200);
    let recent = samples(140.0, 10.0, 200);

    let report = evaluate_feature(&base, &recent, &cfg).expect("report");
    assert_eq!(report.outcome, DriftOutcome::Triggered);
    assert_eq!(report.baseline_ref, "v3");
    assert_eq!(report.window_len, 200);

    let statistic = report.statistic.expect("statistic");
    let p_value = report.p_value.expect("p-value");
    assert!(statistic > 0.9, "statistic={statistic}");
    assert!(p_value < 0.01, "p_value={p_value}");
}

#[test]
fn unchanged_distribution_does_not_trigger() {
    let cfg = DriftConfig::default();
    let base = baseline(100.0, 10.0, 200);
    let recent = samples(100.0, 10.0, 200);

    let report = evaluate_feature(&base, &recent, &cfg).expect("report");
    assert_eq!(report.outcome, DriftOutcome::NoDrift);
    assert!(report.p_value.expect("p-value") > 0.5);
}

#[test]
fn short_window_reports_inconclusive_instead_of_guessing() {
    let cfg = DriftConfig::default();
    let base = baseline(100.0, 10.0, 200);
    let recent = samples(140.0, 10.0, 10);

    let report = evaluate_feature(&base, &recent, &cfg).expect("report");
    assert_eq!(report.outcome, DriftOutcome::Inconclusive);
    assert!(report.statistic.is_none());
    assert!(report.p_value.is_none());
}

#[test]
fn baseline_snapshots_round_trip_through_the_store_and_stay_immutable() {
    let tmp = tempfile::NamedTempFile::new().expect("temp store");
    let mut store = ForecastStore::open(tmp.path()).expect("open");

    let snapshot = baseline(100.0, 10.0, 200);
    assert!(store.put_baseline(&snapshot).expect("register"));
    // Re-registering the identical snapshot is an idempotent no-op.
    assert!(!store.put_baseline(&snapshot).expect("re-register"));

    let loaded = store
        .load_baseline("v3", "S1", "target_lag_1")
        .expect("load")
        .expect("present");
    assert_eq!(loaded, snapshot);

    // A retraining cycle must publish under a new model version, not
    // mutate the stored reference distribution.
    let divergent = BaselineSnapshot {
        samples: samples(120.0, 10.0, 200),
        ..snapshot
    };
    let err = store.put_baseline(&divergent).expect_err("must conflict");
    assert!(err.to_string().contains("divergent baseline snapshot"));

    // The drift cycle works off the stored snapshot.
    let cfg = DriftConfig::default();
    let report = evaluate_feature(&loaded, &samples(140.0, 10.0, 200), &cfg).expect("report");
    assert_eq!(report.outcome, DriftOutcome::Triggered);
}

#[test]
fn series_decision_follows_the_configured_policy() {
    let cfg = DriftConfig::default();
    let drifted = evaluate_feature(&baseline(100.0, 10.0, 200), &samples(140.0, 10.0, 200), &cfg)
        .expect("report");
    let steady = evaluate_feature(&baseline(100.0, 10.0, 200), &samples(100.0, 10.0, 200), &cfg)
        .expect("report");
    let thin = evaluate_feature(&baseline(100.0, 10.0, 200), &samples(140.0, 10.0, 5), &cfg)
        .expect("report");

    let reports = vec![drifted.clone(), steady.clone(), thin.clone()];
    assert_eq!(
        evaluate_series(&reports, TriggerPolicy::AnyFeature),
        DriftOutcome::Triggered
    );
    assert_eq!(
        evaluate_series(&reports, TriggerPolicy::AllFeatures),
        DriftOutcome::NoDrift
    );
    assert_eq!(
        evaluate_series(&[thin], TriggerPolicy::AnyFeature),
        DriftOutcome::Inconclusive
    );
}
