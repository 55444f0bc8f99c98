//! Embedded sqlite ledger: hourly observations, append-only forecast
//! issues, immutable drift baselines, and per-chain write claims.

use std::path::Path;

use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::drift::BaselineSnapshot;
use crate::driver::ForecastIssue;
use crate::normalizer::{HourlyObservation, QualityFlag};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("corrupt ledger row: {0}")]
    CorruptRow(String),
    #[error(
        "divergent forecast issue for ({series_id}, {issue_time_ms_utc}, horizon {horizon})"
    )]
    IssueConflict {
        series_id: String,
        issue_time_ms_utc: i64,
        horizon: u32,
    },
    #[error("chain claim already held for ({series_id}, {issue_time_ms_utc})")]
    ClaimHeld {
        series_id: String,
        issue_time_ms_utc: i64,
    },
    #[error(
        "divergent baseline snapshot for ({model_version}, {series_id}, {feature_name})"
    )]
    BaselineConflict {
        model_version: String,
        series_id: String,
        feature_name: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ObservationApplyReport {
    pub inserted: u64,
    pub updated: u64,
    pub skipped: u64,
}

pub struct ForecastStore {
    conn: Connection,
}

impl ForecastStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch(
            "
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            PRAGMA temp_store=MEMORY;
            ",
        )?;
        ensure_schema(&conn)?;

        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        ensure_schema(&conn)?;
        Ok(Self { conn })
    }

    /// Applies normalized grid rows. An `Observed` row's value is never
    /// changed; an `Imputed` row may be confirmed `Observed` (or
    /// re-imputed); a `Missing` row is replaced by anything better.
    pub fn upsert_observations(
        &mut self,
        rows: &[HourlyObservation],
    ) -> Result<ObservationApplyReport, StoreError> {
        let mut report = ObservationApplyReport::default();
        let tx = self.conn.transaction()?;

        for row in rows {
            let existing: Option<(Option<f64>, String)> = tx
                .query_row(
                    "SELECT value, quality FROM observations
                     WHERE series_id = ?1 AND hour_start_ms = ?2",
                    params![row.series_id, row.hour_start_ms_utc],
                    |r| Ok((r.get(0)?, r.get(1)?)),
                )
                .optional()?;

            match existing {
                None => {
                    tx.execute(
                        "INSERT INTO observations (series_id, hour_start_ms, value, quality)
                         VALUES (?1, ?2, ?3, ?4)",
                        params![
                            row.series_id,
                            row.hour_start_ms_utc,
                            row.value,
                            row.quality.as_str()
                        ],
                    )?;
                    report.inserted += 1;
                }
                Some((existing_value, raw_quality)) => {
                    let existing_quality = QualityFlag::parse(&raw_quality).ok_or_else(|| {
                        StoreError::CorruptRow(format!(
                            "unknown quality '{raw_quality}' for ({}, {})",
                            row.series_id, row.hour_start_ms_utc
                        ))
                    })?;

                    let overwrite = match (existing_quality, row.quality) {
                        (QualityFlag::Observed, _) => false,
                        (QualityFlag::Imputed, QualityFlag::Observed) => true,
                        (QualityFlag::Imputed, QualityFlag::Imputed) => true,
                        (QualityFlag::Imputed, QualityFlag::Missing) => false,
                        (QualityFlag::Missing, _) => true,
                    };

                    if overwrite {
                        tx.execute(
                            "UPDATE observations SET value = ?3, quality = ?4
                             WHERE series_id = ?1 AND hour_start_ms = ?2",
                            params![
                                row.series_id,
                                row.hour_start_ms_utc,
                                row.value,
                                row.quality.as_str()
                            ],
                        )?;
                        report.updated += 1;
                    } else {
                        if existing_quality == QualityFlag::Observed
                            && row.quality == QualityFlag::Observed
                            && existing_value.map(f64::to_bits) != row.value.map(f64::to_bits)
                        {
                            warn!(
                                component = "store",
                                event = "store.observation.divergent_ignored",
                                series_id = %row.series_id,
                                hour_start_ms_utc = row.hour_start_ms_utc
                            );
                        }
                        report.skipped += 1;
                    }
                }
            }
        }

        tx.commit()?;
        Ok(report)
    }

    /// Observations for a series up to and including `end_hour_ms_utc`,
    /// ordered by hour.
    pub fn load_observations(
        &self,
        series_id: &str,
        end_hour_ms_utc: i64,
    ) -> Result<Vec<HourlyObservation>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT hour_start_ms, value, quality FROM observations
             WHERE series_id = ?1 AND hour_start_ms <= ?2
             ORDER BY hour_start_ms ASC",
        )?;

        let mut rows = stmt.query(params![series_id, end_hour_ms_utc])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let hour_start_ms_utc: i64 = row.get(0)?;
            let value: Option<f64> = row.get(1)?;
            let raw_quality: String = row.get(2)?;
            let quality = QualityFlag::parse(&raw_quality).ok_or_else(|| {
                StoreError::CorruptRow(format!(
                    "unknown quality '{raw_quality}' for ({series_id}, {hour_start_ms_utc})"
                ))
            })?;
            out.push(HourlyObservation {
                series_id: series_id.to_string(),
                hour_start_ms_utc,
                value,
                quality,
            });
        }

        Ok(out)
    }

    /// Latest observed hour for a series, if any observation exists.
    pub fn latest_observation_hour(&self, series_id: &str) -> Result<Option<i64>, StoreError> {
        let hour: Option<i64> = self
            .conn
            .query_row(
                "SELECT MAX(hour_start_ms) FROM observations WHERE series_id = ?1",
                params![series_id],
                |row| row.get(0),
            )
            .optional()?
            .flatten();
        Ok(hour)
    }

    /// Appends one forecast issue. Returns `true` when a new row was
    /// written, `false` when an identical row already existed (an
    /// idempotent rerun). A row with the same key but a different
    /// prediction or model version is a conflict, never an overwrite.
    pub fn append_issue(&mut self, issue: &ForecastIssue) -> Result<bool, StoreError> {
        let existing: Option<(f64, String)> = self
            .conn
            .query_row(
                "SELECT predicted_value, model_version FROM forecast_issues
                 WHERE series_id = ?1 AND issue_time_ms = ?2 AND horizon = ?3",
                params![issue.series_id, issue.issue_time_ms_utc, issue.horizon],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        if let Some((predicted_value, model_version)) = existing {
            if predicted_value.to_bits() == issue.predicted_value.to_bits()
                && model_version == issue.model_version
            {
                return Ok(false);
            }
            return Err(StoreError::IssueConflict {
                series_id: issue.series_id.clone(),
                issue_time_ms_utc: issue.issue_time_ms_utc,
                horizon: issue.horizon,
            });
        }

        self.conn.execute(
            "INSERT INTO forecast_issues
             (series_id, issue_time_ms, horizon, predicted_value, model_version, computed_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                issue.series_id,
                issue.issue_time_ms_utc,
                issue.horizon,
                issue.predicted_value,
                issue.model_version,
                issue.computed_at_ms_utc
            ],
        )?;
        Ok(true)
    }

    /// All persisted horizons for one (series, issue_time), ordered by
    /// horizon.
    pub fn load_issues(
        &self,
        series_id: &str,
        issue_time_ms_utc: i64,
    ) -> Result<Vec<ForecastIssue>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT horizon, predicted_value, model_version, computed_at_ms
             FROM forecast_issues
             WHERE series_id = ?1 AND issue_time_ms = ?2
             ORDER BY horizon ASC",
        )?;

        let mut rows = stmt.query(params![series_id, issue_time_ms_utc])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(ForecastIssue {
                series_id: series_id.to_string(),
                issue_time_ms_utc,
                horizon: row.get(0)?,
                predicted_value: row.get(1)?,
                model_version: row.get(2)?,
                computed_at_ms_utc: row.get(3)?,
            });
        }
        Ok(out)
    }

    /// Takes exclusive write ownership of (series, issue_time). The
    /// losing writer gets `ClaimHeld` and must not write.
    pub fn claim_chain(
        &mut self,
        series_id: &str,
        issue_time_ms_utc: i64,
        claimed_at_ms_utc: i64,
    ) -> Result<(), StoreError> {
        let result = self.conn.execute(
            "INSERT INTO chain_claims (series_id, issue_time_ms, claimed_at_ms)
             VALUES (?1, ?2, ?3)",
            params![series_id, issue_time_ms_utc, claimed_at_ms_utc],
        );

        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == ErrorCode::ConstraintViolation =>
            {
                Err(StoreError::ClaimHeld {
                    series_id: series_id.to_string(),
                    issue_time_ms_utc,
                })
            }
            Err(other) => Err(other.into()),
        }
    }

    pub fn release_chain(
        &mut self,
        series_id: &str,
        issue_time_ms_utc: i64,
    ) -> Result<(), StoreError> {
        self.conn.execute(
            "DELETE FROM chain_claims WHERE series_id = ?1 AND issue_time_ms = ?2",
            params![series_id, issue_time_ms_utc],
        )?;
        Ok(())
    }

    /// Registers a baseline snapshot, write-once. Re-registering an
    /// identical snapshot is a no-op (`Ok(false)`); a divergent one for
    /// the same key is a conflict.
    pub fn put_baseline(&mut self, snapshot: &BaselineSnapshot) -> Result<bool, StoreError> {
        let samples_json = serde_json::to_string(&snapshot.samples)?;

        let existing: Option<String> = self
            .conn
            .query_row(
                "SELECT samples FROM drift_baselines
                 WHERE model_version = ?1 AND series_id = ?2 AND feature_name = ?3",
                params![
                    snapshot.model_version,
                    snapshot.series_id,
                    snapshot.feature_name
                ],
                |row| row.get(0),
            )
            .optional()?;

        if let Some(existing_json) = existing {
            if existing_json == samples_json {
                return Ok(false);
            }
            return Err(StoreError::BaselineConflict {
                model_version: snapshot.model_version.clone(),
                series_id: snapshot.series_id.clone(),
                feature_name: snapshot.feature_name.clone(),
            });
        }

        self.conn.execute(
            "INSERT INTO drift_baselines (model_version, series_id, feature_name, samples)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                snapshot.model_version,
                snapshot.series_id,
                snapshot.feature_name,
                samples_json
            ],
        )?;

        info!(
            component = "store",
            event = "store.baseline.registered",
            model_version = %snapshot.model_version,
            series_id = %snapshot.series_id,
            feature_name = %snapshot.feature_name,
            sample_count = snapshot.samples.len()
        );
        Ok(true)
    }

    pub fn load_baseline(
        &self,
        model_version: &str,
        series_id: &str,
        feature_name: &str,
    ) -> Result<Option<BaselineSnapshot>, StoreError> {
        let samples_json: Option<String> = self
            .conn
            .query_row(
                "SELECT samples FROM drift_baselines
                 WHERE model_version = ?1 AND series_id = ?2 AND feature_name = ?3",
                params![model_version, series_id, feature_name],
                |row| row.get(0),
            )
            .optional()?;

        match samples_json {
            None => Ok(None),
            Some(raw) => {
                let samples: Vec<f64> = serde_json::from_str(&raw)?;
                Ok(Some(BaselineSnapshot {
                    model_version: model_version.to_string(),
                    series_id: series_id.to_string(),
                    feature_name: feature_name.to_string(),
                    samples,
                }))
            }
        }
    }
}

fn ensure_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS observations (
            series_id TEXT NOT NULL,
            hour_start_ms INTEGER NOT NULL,
            value REAL,
            quality TEXT NOT NULL,
            PRIMARY KEY(series_id, hour_start_ms)
        ) WITHOUT ROWID;

        CREATE TABLE IF NOT EXISTS forecast_issues (
            series_id TEXT NOT NULL,
            issue_time_ms INTEGER NOT NULL,
            horizon INTEGER NOT NULL,
            predicted_value REAL NOT NULL,
            model_version TEXT NOT NULL,
            computed_at_ms INTEGER NOT NULL,
            PRIMARY KEY(series_id, issue_time_ms, horizon)
        ) WITHOUT ROWID;

        CREATE TABLE IF NOT EXISTS drift_baselines (
            model_version TEXT NOT NULL,
            series_id TEXT NOT NULL,
            feature_name TEXT NOT NULL,
            samples TEXT NOT NULL,
            PRIMARY KEY(model_version, series_id, feature_name)
        ) WITHOUT ROWID;

        CREATE TABLE IF NOT EXISTS chain_claims (
            series_id TEXT NOT NULL,
            issue_time_ms INTEGER NOT NULL,
            claimed_at_ms INTEGER NOT NULL,
            PRIMARY KEY(series_id, issue_time_ms)
        ) WITHOUT ROWID;
        ",
    )?;
    Ok(())
}
