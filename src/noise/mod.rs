//! Per-entity noise baselines.
//!
//! A baseline records how much an entity's state normally fluctuates so that
//! small numeric jitter can be told apart from a real change. Baselines are
//! recalculated offline from a history window and looked up on every
//! classification; an entity without a baseline treats every change as
//! significant.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

mod stats;
mod store;

pub use stats::{mean, parse_numeric, std_dev};
pub use store::NoiseBaselineStore;

/// Most recent raw samples kept on a baseline for auditing
pub const MAX_HISTORICAL_SAMPLES: usize = 20;

/// How an entity's state values are compared
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateType {
    Numeric,
    String,
}

impl StateType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StateType::Numeric => "numeric",
            StateType::String => "string",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "numeric" => Some(StateType::Numeric),
            "string" => Some(StateType::String),
            _ => None,
        }
    }
}

/// Statistical model of an entity's normal fluctuation
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NoiseBaseline {
    pub entity_id: String,
    pub state_type: StateType,

    /// Minimum absolute delta considered significant (numeric only)
    pub numeric_threshold: Option<f64>,

    /// Mean absolute delta between consecutive samples (numeric only)
    pub typical_fluctuation: Option<f64>,

    pub sample_count: usize,
    pub last_calculated: DateTime<Utc>,

    /// Up to `MAX_HISTORICAL_SAMPLES` most recent raw values, oldest first
    pub historical_states: Vec<String>,
}

/// One historical reading used for baseline calculation
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HistorySample {
    pub state: String,
    pub observed_at: DateTime<Utc>,
}

/// Outcome of classifying an old/new value pair
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SignificanceResult {
    pub entity_id: String,
    pub is_significant: bool,
    pub old_value: String,
    pub new_value: String,

    /// Absolute numeric delta, when both values were compared numerically
    #[serde(skip_serializing_if = "Option::is_none")]
    pub change_amount: Option<f64>,

    /// Threshold the delta was compared against
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f64>,
}

impl SignificanceResult {
    fn by_inequality(entity_id: &str, old_value: &str, new_value: &str) -> Self {
        Self {
            entity_id: entity_id.to_string(),
            is_significant: old_value != new_value,
            old_value: old_value.to_string(),
            new_value: new_value.to_string(),
            change_amount: None,
            threshold: None,
        }
    }
}

#[cfg(test)]
mod tests;
