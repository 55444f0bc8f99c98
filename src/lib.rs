//! Demandcast core crate.
//!
//! Turns irregular high-frequency demand readings into recursive
//! six-hour-ahead hourly forecasts:
//! - ingestion and timestamp normalization of raw readings
//! - resampling to a fixed hourly grid with gap classification
//! - leakage-free lag/rolling/calendar feature construction
//! - the recursive multi-horizon forecast chain
//! - statistical drift monitoring against versioned baselines
//! - an append-only, idempotent forecast ledger

mod drift;
mod driver;
mod features;
mod forecaster;
mod ingest;
mod normalizer;
mod observability;
mod store;

pub use drift::{
    evaluate_feature, evaluate_series, ks_two_sample, prediction_residuals, BaselineSnapshot,
    DriftConfig, DriftError, DriftOutcome, DriftReport, TriggerPolicy,
};
pub use driver::{run_forecast_chain, ChainConfig, ChainOutcome, ChainStatus, ForecastIssue};
pub use features::{
    build_feature_schema, build_features, ChainAccumulator, FeatureConfig, FeatureError,
    FeatureSchema, FeatureVector, FEATURE_SCHEMA_VERSION,
};
pub use forecaster::{ForecastError, Forecaster, LinearForecaster, ModelArtifact};
pub use ingest::{load_readings_csv, parse_reading_timestamp, IngestError, RawReading};
pub use normalizer::{
    normalize_batch, AggregationFn, HourlyObservation, NormalizeError, NormalizeReport,
    NormalizerConfig, QualityFlag, HOUR_MS,
};
pub use observability::{
    init_logging, log_app_start, log_store_opened, logging_config_from_env, LogFormat,
    LoggingConfig, LoggingInitError,
};
pub use store::{ForecastStore, ObservationApplyReport, StoreError};
