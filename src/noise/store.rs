//! Noise baseline persistence and significance classification.

use super::stats::{baseline_from_samples, parse_numeric};
use super::{HistorySample, NoiseBaseline, SignificanceResult, StateType, MAX_HISTORICAL_SAMPLES};
use crate::config::NoiseConfig;
use crate::storage::{self, decode_timestamp, encode_timestamp};
use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

/// Per-entity significance thresholds backed by SQLite.
///
/// # Schema
/// ```sql
/// CREATE TABLE entity_noise_baselines (
///     entity_id           TEXT PRIMARY KEY,
///     state_type          TEXT NOT NULL,     -- "numeric" | "string"
///     numeric_threshold   REAL,
///     typical_fluctuation REAL,
///     sample_count        INTEGER NOT NULL,
///     last_calculated     TEXT NOT NULL,     -- RFC 3339
///     historical_states   TEXT NOT NULL      -- JSON array, <= 20 entries
/// );
/// ```
pub struct NoiseBaselineStore {
    conn: Mutex<Connection>,
    config: NoiseConfig,
}

impl NoiseBaselineStore {
    /// Opens (or creates) the database with default statistics settings.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        Self::with_config(db_path, NoiseConfig::default())
    }

    pub fn with_config<P: AsRef<Path>>(db_path: P, config: NoiseConfig) -> Result<Self> {
        let conn = storage::open(db_path.as_ref())?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS entity_noise_baselines (
                entity_id           TEXT PRIMARY KEY,
                state_type          TEXT NOT NULL,
                numeric_threshold   REAL,
                typical_fluctuation REAL,
                sample_count        INTEGER NOT NULL,
                last_calculated     TEXT NOT NULL,
                historical_states   TEXT NOT NULL
            );",
        )
        .context("Failed to create entity_noise_baselines table")?;

        Ok(Self {
            conn: Mutex::new(conn),
            config,
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow::anyhow!("entity_noise_baselines connection lock poisoned"))
    }

    /// Decides whether moving from `old_value` to `new_value` is a significant change.
    ///
    /// - no baseline: always significant
    /// - string baseline: significant iff the values differ
    /// - numeric baseline: significant iff |new - old| > threshold, falling back
    ///   to string inequality when either value is not a number
    pub fn classify(
        &self,
        entity_id: &str,
        old_value: &str,
        new_value: &str,
    ) -> Result<SignificanceResult> {
        let baseline = match self.get(entity_id)? {
            Some(baseline) => baseline,
            None => {
                return Ok(SignificanceResult {
                    entity_id: entity_id.to_string(),
                    is_significant: true,
                    old_value: old_value.to_string(),
                    new_value: new_value.to_string(),
                    change_amount: None,
                    threshold: None,
                });
            }
        };

        Ok(classify_with(&baseline, old_value, new_value))
    }

    /// Recalculates baselines from a history window and persists them in a
    /// single transaction.
    ///
    /// Entities with fewer than `min_samples` readings are skipped. Returns the
    /// saved baselines ordered by entity id.
    pub fn calculate_from_history(
        &self,
        history: &HashMap<String, Vec<HistorySample>>,
    ) -> Result<Vec<NoiseBaseline>> {
        let min_samples = self.config.min_samples.max(2);
        let calculated_at = Utc::now();

        let mut entity_ids: Vec<&String> = history.keys().collect();
        entity_ids.sort();

        let mut baselines = Vec::new();
        let mut skipped = 0usize;

        for entity_id in entity_ids {
            let samples = &history[entity_id];
            if samples.len() < min_samples {
                debug!(
                    entity_id = %entity_id,
                    samples = samples.len(),
                    "Not enough history for a baseline"
                );
                skipped += 1;
                continue;
            }

            baselines.push(baseline_from_samples(
                entity_id,
                samples,
                self.config.threshold_sigmas,
                calculated_at,
            ));
        }

        // All or nothing: a failed run leaves the previous baselines in place
        let mut conn = self.conn()?;
        let tx = conn.transaction().context("Failed to begin transaction")?;
        for baseline in &baselines {
            upsert(&tx, baseline)?;
        }
        tx.commit().context("Failed to commit recalculated baselines")?;

        info!(
            calculated = baselines.len(),
            skipped = skipped,
            "Noise baselines recalculated"
        );

        Ok(baselines)
    }

    /// Stores a baseline, replacing any existing one for the entity.
    ///
    /// Only the last `MAX_HISTORICAL_SAMPLES` historical states are kept.
    pub fn save(&self, baseline: &NoiseBaseline) -> Result<()> {
        let conn = self.conn()?;
        upsert(&conn, baseline)
    }

    pub fn get(&self, entity_id: &str) -> Result<Option<NoiseBaseline>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT entity_id, state_type, numeric_threshold, typical_fluctuation,
                    sample_count, last_calculated, historical_states
             FROM entity_noise_baselines
             WHERE entity_id = ?1",
            params![entity_id],
            read_row,
        )
        .optional()
        .with_context(|| format!("Failed to read baseline for {}", entity_id))?
        .map(BaselineRow::decode)
        .transpose()
    }

    /// All baselines keyed by entity id
    pub fn all(&self) -> Result<HashMap<String, NoiseBaseline>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT entity_id, state_type, numeric_threshold, typical_fluctuation,
                        sample_count, last_calculated, historical_states
                 FROM entity_noise_baselines",
            )
            .context("Failed to prepare query")?;

        let rows = stmt
            .query_map([], read_row)
            .context("Failed to execute query")?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to read results")?;

        rows.into_iter()
            .map(|raw| {
                let baseline = raw.decode()?;
                Ok((baseline.entity_id.clone(), baseline))
            })
            .collect()
    }

    /// Returns true if a baseline was removed
    pub fn delete(&self, entity_id: &str) -> Result<bool> {
        let rows_affected = self
            .conn()?
            .execute(
                "DELETE FROM entity_noise_baselines WHERE entity_id = ?1",
                params![entity_id],
            )
            .context("Failed to delete baseline")?;

        Ok(rows_affected > 0)
    }

    pub fn clear(&self) -> Result<usize> {
        self.conn()?
            .execute("DELETE FROM entity_noise_baselines", [])
            .context("Failed to clear baselines")
    }
}

fn upsert(conn: &Connection, baseline: &NoiseBaseline) -> Result<()> {
    let skip = baseline
        .historical_states
        .len()
        .saturating_sub(MAX_HISTORICAL_SAMPLES);
    let historical_states = serde_json::to_string(&baseline.historical_states[skip..])
        .context("Failed to serialize historical states")?;

    conn.execute(
        r#"
        INSERT INTO entity_noise_baselines (
            entity_id, state_type, numeric_threshold, typical_fluctuation,
            sample_count, last_calculated, historical_states
        )
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        ON CONFLICT(entity_id) DO UPDATE SET
            state_type = excluded.state_type,
            numeric_threshold = excluded.numeric_threshold,
            typical_fluctuation = excluded.typical_fluctuation,
            sample_count = excluded.sample_count,
            last_calculated = excluded.last_calculated,
            historical_states = excluded.historical_states
        "#,
        params![
            baseline.entity_id,
            baseline.state_type.as_str(),
            baseline.numeric_threshold,
            baseline.typical_fluctuation,
            baseline.sample_count as i64,
            encode_timestamp(&baseline.last_calculated),
            historical_states,
        ],
    )
    .with_context(|| format!("Failed to save baseline for {}", baseline.entity_id))?;

    Ok(())
}

fn classify_with(baseline: &NoiseBaseline, old_value: &str, new_value: &str) -> SignificanceResult {
    let entity_id = baseline.entity_id.as_str();

    if baseline.state_type == StateType::String {
        return SignificanceResult::by_inequality(entity_id, old_value, new_value);
    }

    let (old_num, new_num) = match (parse_numeric(old_value), parse_numeric(new_value)) {
        (Some(old), Some(new)) => (old, new),
        _ => return SignificanceResult::by_inequality(entity_id, old_value, new_value),
    };

    let change_amount = (new_num - old_num).abs();
    let threshold = baseline.numeric_threshold.unwrap_or(0.0);

    SignificanceResult {
        entity_id: entity_id.to_string(),
        is_significant: change_amount > threshold,
        old_value: old_value.to_string(),
        new_value: new_value.to_string(),
        change_amount: Some(change_amount),
        threshold: Some(threshold),
    }
}

struct BaselineRow {
    entity_id: String,
    state_type: String,
    numeric_threshold: Option<f64>,
    typical_fluctuation: Option<f64>,
    sample_count: i64,
    last_calculated: String,
    historical_states: String,
}

impl BaselineRow {
    fn decode(self) -> Result<NoiseBaseline> {
        let state_type = StateType::parse(&self.state_type).with_context(|| {
            format!(
                "Unknown state type {:?} for {}",
                self.state_type, self.entity_id
            )
        })?;
        let historical_states: Vec<String> = serde_json::from_str(&self.historical_states)
            .with_context(|| format!("Corrupt historical states for {}", self.entity_id))?;

        Ok(NoiseBaseline {
            state_type,
            numeric_threshold: self.numeric_threshold,
            typical_fluctuation: self.typical_fluctuation,
            sample_count: usize::try_from(self.sample_count).unwrap_or(0),
            last_calculated: decode_timestamp(&self.last_calculated)
                .context("Failed to parse last_calculated timestamp")?,
            historical_states,
            entity_id: self.entity_id,
        })
    }
}

fn read_row(row: &Row<'_>) -> rusqlite::Result<BaselineRow> {
    Ok(BaselineRow {
        entity_id: row.get(0)?,
        state_type: row.get(1)?,
        numeric_threshold: row.get(2)?,
        typical_fluctuation: row.get(3)?,
        sample_count: row.get(4)?,
        last_calculated: row.get(5)?,
        historical_states: row.get(6)?,
    })
}
