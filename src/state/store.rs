//! Last-known entity state backed by SQLite.
//!
//! Every observation is upserted; a `ChangeRecord` is returned only when the
//! primary state or the meaningful attributes differ from the stored row.

use super::entity::{Attributes, ChangeRecord, EntityState, RawObservation};
use super::filter::AttributeFilter;
use crate::storage::{self, decode_timestamp, encode_timestamp};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

/// Source of write timestamps for `last_updated`
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Persistent last-known state of every tracked entity.
///
/// # Schema
/// ```sql
/// CREATE TABLE device_states (
///     entity_id    TEXT PRIMARY KEY,
///     state        TEXT NOT NULL,
///     attributes   TEXT NOT NULL,   -- JSON object, unfiltered
///     last_changed TEXT NOT NULL,   -- RFC 3339
///     last_updated TEXT NOT NULL    -- RFC 3339
/// );
/// ```
pub struct StateStore {
    conn: Mutex<Connection>,
    filter: AttributeFilter,
    clock: Clock,
}

impl StateStore {
    /// Opens (or creates) the database with the default attribute deny-list.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        Self::with_filter(db_path, AttributeFilter::default())
    }

    /// Opens (or creates) the database with a custom attribute deny-list.
    pub fn with_filter<P: AsRef<Path>>(db_path: P, filter: AttributeFilter) -> Result<Self> {
        let conn = storage::open(db_path.as_ref())?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS device_states (
                entity_id    TEXT PRIMARY KEY,
                state        TEXT NOT NULL,
                attributes   TEXT NOT NULL,
                last_changed TEXT NOT NULL,
                last_updated TEXT NOT NULL
            );",
        )
        .context("Failed to create device_states table")?;

        Ok(Self {
            conn: Mutex::new(conn),
            filter,
            clock: Arc::new(Utc::now),
        })
    }

    /// Replaces the wall clock used to stamp `last_updated`
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow::anyhow!("device_states connection lock poisoned"))
    }

    pub fn filter(&self) -> &AttributeFilter {
        &self.filter
    }

    /// Records an observation and reports whether it was a real change.
    ///
    /// The full attribute map is always persisted; the deny-list only affects
    /// the comparison. `last_changed` moves to `observed_at` on a real change
    /// and is kept otherwise; `last_updated` is the write time.
    pub fn update(
        &self,
        entity_id: &str,
        state: &str,
        attributes: &Attributes,
        observed_at: DateTime<Utc>,
    ) -> Result<Option<ChangeRecord>> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction()
            .context("Failed to begin state update")?;

        let previous = select_state(&tx, entity_id)?;

        let changed = match &previous {
            None => true,
            Some(prev) => {
                prev.state != state
                    || !self.filter.meaningfully_equal(&prev.attributes, attributes)
            }
        };

        let last_changed = match &previous {
            Some(prev) if !changed => prev.last_changed,
            _ => observed_at,
        };
        // Observations stamped ahead of the local clock still keep
        // last_changed <= last_updated
        let last_updated = (self.clock)().max(last_changed);

        let attributes_json =
            serde_json::to_string(attributes).context("Failed to serialize attributes")?;

        tx.execute(
            r#"
            INSERT INTO device_states (entity_id, state, attributes, last_changed, last_updated)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(entity_id) DO UPDATE SET
                state = excluded.state,
                attributes = excluded.attributes,
                last_changed = excluded.last_changed,
                last_updated = excluded.last_updated
            "#,
            params![
                entity_id,
                state,
                attributes_json,
                encode_timestamp(&last_changed),
                encode_timestamp(&last_updated),
            ],
        )
        .with_context(|| format!("Failed to upsert state for {}", entity_id))?;

        tx.commit().context("Failed to commit state update")?;

        if !changed {
            debug!(entity_id = %entity_id, "State unchanged");
            return Ok(None);
        }

        let (previous_state, previous_attributes) = match previous {
            Some(prev) => (Some(prev.state), Some(prev.attributes)),
            None => (None, None),
        };

        Ok(Some(ChangeRecord {
            entity_id: entity_id.to_string(),
            previous_state,
            current_state: state.to_string(),
            previous_attributes,
            current_attributes: attributes.clone(),
            changed_at: observed_at,
        }))
    }

    /// Records a whole polling cycle, returning the real changes in input order.
    ///
    /// Stops at the first storage error.
    pub fn update_many(&self, observations: &[RawObservation]) -> Result<Vec<ChangeRecord>> {
        let mut changes = Vec::new();
        for obs in observations {
            if let Some(change) =
                self.update(&obs.entity_id, &obs.state, &obs.attributes, obs.observed_at)?
            {
                changes.push(change);
            }
        }
        Ok(changes)
    }

    /// Stored state for one entity
    pub fn get(&self, entity_id: &str) -> Result<Option<EntityState>> {
        let conn = self.conn()?;
        select_state(&conn, entity_id)
    }

    /// All stored states keyed by entity id
    pub fn all(&self) -> Result<HashMap<String, EntityState>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT entity_id, state, attributes, last_changed, last_updated
                 FROM device_states",
            )
            .context("Failed to prepare query")?;

        let rows = stmt
            .query_map([], read_row)
            .context("Failed to execute query")?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to read results")?;

        rows.into_iter()
            .map(|raw| {
                let state = raw.decode()?;
                Ok((state.entity_id.clone(), state))
            })
            .collect()
    }

    /// Returns true if a row was removed
    pub fn delete(&self, entity_id: &str) -> Result<bool> {
        let rows_affected = self
            .conn()?
            .execute(
                "DELETE FROM device_states WHERE entity_id = ?1",
                params![entity_id],
            )
            .context("Failed to delete device state")?;

        Ok(rows_affected > 0)
    }

    /// Removes every stored state, returning how many were removed
    pub fn clear(&self) -> Result<usize> {
        self.conn()?
            .execute("DELETE FROM device_states", [])
            .context("Failed to clear device states")
    }
}

/// Undecoded `device_states` row
struct StateRow {
    entity_id: String,
    state: String,
    attributes: String,
    last_changed: String,
    last_updated: String,
}

impl StateRow {
    fn decode(self) -> Result<EntityState> {
        let attributes: Attributes = serde_json::from_str(&self.attributes)
            .with_context(|| format!("Corrupt attributes JSON for {}", self.entity_id))?;

        Ok(EntityState {
            last_changed: decode_timestamp(&self.last_changed)
                .context("Failed to parse last_changed timestamp")?,
            last_updated: decode_timestamp(&self.last_updated)
                .context("Failed to parse last_updated timestamp")?,
            entity_id: self.entity_id,
            state: self.state,
            attributes,
        })
    }
}

fn read_row(row: &Row<'_>) -> rusqlite::Result<StateRow> {
    Ok(StateRow {
        entity_id: row.get(0)?,
        state: row.get(1)?,
        attributes: row.get(2)?,
        last_changed: row.get(3)?,
        last_updated: row.get(4)?,
    })
}

fn select_state(conn: &Connection, entity_id: &str) -> Result<Option<EntityState>> {
    conn.query_row(
        "SELECT entity_id, state, attributes, last_changed, last_updated
         FROM device_states
         WHERE entity_id = ?1",
        params![entity_id],
        read_row,
    )
    .optional()
    .with_context(|| format!("Failed to read state for {}", entity_id))?
    .map(StateRow::decode)
    .transpose()
}
