//! Observation → detector → batcher glue.

use crate::batcher::ChangeBatcher;
use crate::detector::{ChangeDetector, DetectionReport};
use crate::state::RawObservation;
use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::info;

pub struct ChangePipeline {
    detector: Arc<ChangeDetector>,
    batcher: ChangeBatcher,
}

impl ChangePipeline {
    pub fn new(detector: ChangeDetector, batcher: ChangeBatcher) -> Self {
        Self {
            detector: Arc::new(detector),
            batcher,
        }
    }

    pub fn detector(&self) -> &ChangeDetector {
        &self.detector
    }

    pub fn batcher(&self) -> &ChangeBatcher {
        &self.batcher
    }

    /// Runs one polling cycle and forwards every emitted event to the batcher.
    ///
    /// Detection does synchronous SQLite work, so it runs on the blocking
    /// pool. Returns the detection report with its events already forwarded;
    /// per-entity failures are in the report, not the `Err`.
    pub async fn ingest(&self, observations: &[RawObservation]) -> Result<DetectionReport> {
        let detector = Arc::clone(&self.detector);
        let observations = observations.to_vec();
        let observed = observations.len();

        let report = tokio::task::spawn_blocking(move || detector.process_report(&observations))
            .await
            .context("Detection task failed")?;

        for event in &report.events {
            self.batcher.add(event.clone()).await;
        }

        if !report.events.is_empty() || !report.failures.is_empty() {
            info!(
                observations = observed,
                forwarded = report.events.len(),
                failures = report.failures.len(),
                "Polling cycle ingested"
            );
        }

        Ok(report)
    }
}
