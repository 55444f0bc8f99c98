//! Single-step forecaster seam and the model artifact contract.
//!
//! The core never trains: it loads an opaque {model_version,
//! parameter_blob, feature_schema} triple from an external registry and
//! exposes it through a narrow, pure scoring interface. Scoring is
//! deterministic; there is no inference-time randomness.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::features::{FeatureSchema, FeatureVector};
use crate::store::StoreError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelArtifact {
    pub model_version: String,
    pub parameter_blob: serde_json::Value,
    pub feature_schema: FeatureSchema,
}

impl ModelArtifact {
    pub fn from_json_file(path: &Path) -> Result<Self, ForecastError> {
        let raw = fs::read_to_string(path).map_err(|err| {
            ForecastError::ModelUnavailable(format!(
                "cannot read model artifact {}: {err}",
                path.display()
            ))
        })?;
        serde_json::from_str(&raw).map_err(|err| {
            ForecastError::ModelUnavailable(format!(
                "cannot parse model artifact {}: {err}",
                path.display()
            ))
        })
    }
}

#[derive(Debug, Error)]
pub enum ForecastError {
    #[error(
        "feature vector does not match model schema: missing {missing:?}, unexpected {unexpected:?}"
    )]
    SchemaMismatch {
        missing: Vec<String>,
        unexpected: Vec<String>,
    },
    #[error("model unavailable: {0}")]
    ModelUnavailable(String),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Stateless one-hour-ahead scoring function.
pub trait Forecaster {
    fn model_version(&self) -> &str;
    fn schema(&self) -> &FeatureSchema;
    fn score(&self, features: &FeatureVector) -> Result<f64, ForecastError>;
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
struct LinearParameters {
    intercept: f64,
    weights: BTreeMap<String, f64>,
}

/// Linear scorer over the declared feature schema. The parameter blob
/// is `{"intercept": f, "weights": {column: f, ...}}` and must cover
/// the schema columns exactly.
#[derive(Debug, Clone)]
pub struct LinearForecaster {
    model_version: String,
    schema: FeatureSchema,
    parameters: LinearParameters,
}

impl LinearForecaster {
    pub fn from_artifact(artifact: &ModelArtifact) -> Result<Self, ForecastError> {
        let parameters: LinearParameters =
            serde_json::from_value(artifact.parameter_blob.clone()).map_err(|err| {
                ForecastError::ModelUnavailable(format!(
                    "model {} has an unreadable parameter blob: {err}",
                    artifact.model_version
                ))
            })?;

        let uncovered: Vec<&String> = artifact
            .feature_schema
            .columns
            .iter()
            .filter(|column| !parameters.weights.contains_key(*column))
            .collect();
        if !uncovered.is_empty() {
            return Err(ForecastError::ModelUnavailable(format!(
                "model {} weights do not cover schema columns {uncovered:?}",
                artifact.model_version
            )));
        }
        let stray: Vec<&String> = parameters
            .weights
            .keys()
            .filter(|name| !artifact.feature_schema.columns.contains(*name))
            .collect();
        if !stray.is_empty() {
            return Err(ForecastError::ModelUnavailable(format!(
                "model {} has weights for unknown columns {stray:?}",
                artifact.model_version
            )));
        }

        info!(
            component = "forecaster",
            event = "forecaster.model.loaded",
            model_version = %artifact.model_version,
            schema_fingerprint = %artifact.feature_schema.fingerprint,
            weight_count = parameters.weights.len()
        );

        Ok(Self {
            model_version: artifact.model_version.clone(),
            schema: artifact.feature_schema.clone(),
            parameters,
        })
    }
}

impl Forecaster for LinearForecaster {
    fn model_version(&self) -> &str {
        &self.model_version
    }

    fn schema(&self) -> &FeatureSchema {
        &self.schema
    }

    fn score(&self, features: &FeatureVector) -> Result<f64, ForecastError> {
        let missing: Vec<String> = self
            .schema
            .columns
            .iter()
            .filter(|column| !features.values.contains_key(*column))
            .cloned()
            .collect();
        let unexpected: Vec<String> = features
            .values
            .keys()
            .filter(|name| !self.schema.columns.contains(name))
            .cloned()
            .collect();
        if !missing.is_empty() || !unexpected.is_empty() {
            return Err(ForecastError::SchemaMismatch {
                missing,
                unexpected,
            });
        }

        let mut estimate = self.parameters.intercept;
        for (name, value) in &features.values {
            estimate += self.parameters.weights[name] * value;
        }
        Ok(estimate)
    }
}
