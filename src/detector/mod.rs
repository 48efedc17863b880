//! Two-stage change detection.
//!
//! Stage 1 (`StateStore`) drops observations whose state and meaningful
//! attributes match the stored record. Stage 2 (`NoiseBaselineStore`) drops
//! changes whose primary state moved by less than the entity's noise
//! threshold. Whatever survives both becomes a `ChangeEvent`.

use crate::noise::NoiseBaselineStore;
use crate::state::{Attributes, ChangeRecord, RawObservation, StateStore};
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};


/// A real and significant change, ready for batching
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub entity_id: String,
    /// `None` on the first observation of an entity
    pub previous_state: Option<String>,
    pub current_state: String,
    pub previous_attributes: Option<Attributes>,
    pub current_attributes: Attributes,
    pub changed_at: DateTime<Utc>,
}

impl From<ChangeRecord> for ChangeEvent {
    fn from(record: ChangeRecord) -> Self {
        Self {
            entity_id: record.entity_id,
            previous_state: record.previous_state,
            current_state: record.current_state,
            previous_attributes: record.previous_attributes,
            current_attributes: record.current_attributes,
            changed_at: record.changed_at,
        }
    }
}

/// Storage failure isolated to a single entity
#[derive(Debug)]
pub struct EntityFailure {
    pub entity_id: String,
    pub error: anyhow::Error,
}

/// Events emitted by one polling cycle plus any per-entity failures
#[derive(Debug, Default)]
pub struct DetectionReport {
    pub events: Vec<ChangeEvent>,
    pub failures: Vec<EntityFailure>,
}

pub struct ChangeDetector {
    states: Arc<StateStore>,
    baselines: Arc<NoiseBaselineStore>,
    report_first_seen: bool,
}

impl ChangeDetector {
    pub fn new(states: Arc<StateStore>, baselines: Arc<NoiseBaselineStore>) -> Self {
        Self {
            states,
            baselines,
            report_first_seen: true,
        }
    }

    /// Whether an entity's first observation is emitted as a change
    pub fn report_first_seen(mut self, enabled: bool) -> Self {
        self.report_first_seen = enabled;
        self
    }

    pub fn states(&self) -> &Arc<StateStore> {
        &self.states
    }

    pub fn baselines(&self) -> &Arc<NoiseBaselineStore> {
        &self.baselines
    }

    /// Runs a polling cycle and returns the emitted events.
    ///
    /// Entities that fail are logged and skipped; see `process_report`.
    pub fn process(&self, observations: &[RawObservation]) -> Vec<ChangeEvent> {
        self.process_report(observations).events
    }

    /// Runs a polling cycle, processing each entity independently.
    pub fn process_report(&self, observations: &[RawObservation]) -> DetectionReport {
        let mut report = DetectionReport::default();

        for obs in observations {
            match self.detect(obs) {
                Ok(Some(event)) => report.events.push(event),
                Ok(None) => {}
                Err(e) => {
                    warn!(entity_id = %obs.entity_id, error = %e, "Failed to process observation");
                    report.failures.push(EntityFailure {
                        entity_id: obs.entity_id.clone(),
                        error: e,
                    });
                }
            }
        }

        debug!(
            observations = observations.len(),
            events = report.events.len(),
            failures = report.failures.len(),
            "Polling cycle processed"
        );

        report
    }

    fn detect(&self, obs: &RawObservation) -> Result<Option<ChangeEvent>> {
        let change = match self.states.update(
            &obs.entity_id,
            &obs.state,
            &obs.attributes,
            obs.observed_at,
        )? {
            Some(change) => change,
            None => return Ok(None),
        };

        if change.is_first_seen() {
            if self.report_first_seen {
                return Ok(Some(change.into()));
            }
            debug!(entity_id = %obs.entity_id, "First observation not reported");
            return Ok(None);
        }

        let previous = change.previous_state.as_deref().unwrap_or_default();
        let significance =
            self.baselines
                .classify(&change.entity_id, previous, &change.current_state)?;

        if !significance.is_significant {
            debug!(
                entity_id = %obs.entity_id,
                old = %significance.old_value,
                new = %significance.new_value,
                change_amount = ?significance.change_amount,
                threshold = ?significance.threshold,
                "Change below noise threshold"
            );
            return Ok(None);
        }

        Ok(Some(change.into()))
    }
}
