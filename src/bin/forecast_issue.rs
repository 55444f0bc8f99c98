use std::path::PathBuf;

use chrono::Utc;
use demandcast::{
    init_logging, load_readings_csv, log_app_start, log_store_opened, logging_config_from_env,
    normalize_batch, run_forecast_chain, ChainConfig, ChainStatus, ForecastStore,
    LinearForecaster, ModelArtifact, NormalizerConfig,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging = logging_config_from_env();
    init_logging(&logging)?;
    log_app_start(&logging);

    let store_path = std::env::var("DEMANDCAST_STORE_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("data/demandcast.sqlite"));
    let model_path = std::env::var("DEMANDCAST_MODEL_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("models/model.json"));
    let series_id = std::env::var("DEMANDCAST_SERIES_ID").unwrap_or_else(|_| "demand".to_string());

    let mut store = ForecastStore::open(&store_path)?;
    log_store_opened(&store_path.display().to_string());

    // Optional ingestion pass before forecasting.
    if let Ok(csv_path) = std::env::var("DEMANDCAST_READINGS_CSV") {
        let readings = load_readings_csv(&PathBuf::from(&csv_path))?;
        let (observations, report) = normalize_batch(&readings, &NormalizerConfig::default())?;
        let applied = store.upsert_observations(&observations)?;
        println!(
            "ingested {} readings -> {} grid hours (imputed={} missing={}) | inserted={} updated={} skipped={}",
            report.raw_count,
            observations.len(),
            report.imputed_hours,
            report.missing_hours,
            applied.inserted,
            applied.updated,
            applied.skipped
        );
    }

    let artifact = ModelArtifact::from_json_file(&model_path)?;
    let forecaster = LinearForecaster::from_artifact(&artifact)?;

    let issue_time_ms = store
        .latest_observation_hour(&series_id)?
        .ok_or_else(|| format!("no observations stored for series '{series_id}'"))?;

    let outcome = run_forecast_chain(
        &mut store,
        &forecaster,
        &series_id,
        issue_time_ms,
        &ChainConfig::default(),
        Utc::now().timestamp_millis(),
    );

    for issue in &outcome.issues {
        println!(
            "h={} target_hour_ms={} predicted={:.3} model={}",
            issue.horizon,
            issue.issue_time_ms_utc + i64::from(issue.horizon) * demandcast::HOUR_MS,
            issue.predicted_value,
            issue.model_version
        );
    }

    match outcome.status {
        ChainStatus::Success => {
            println!("chain complete for issue_time_ms={issue_time_ms}");
            Ok(())
        }
        ChainStatus::PartialFailure { failed_at_horizon } => Err(format!(
            "chain aborted at horizon {failed_at_horizon}: {}",
            outcome.error.unwrap_or_default()
        )
        .into()),
        ChainStatus::Failure => Err(format!(
            "chain failed before any horizon: {}",
            outcome.error.unwrap_or_default()
        )
        .into()),
    }
}
