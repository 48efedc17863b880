use super::{HistorySample, NoiseBaseline, StateType, MAX_HISTORICAL_SAMPLES};
use chrono::{DateTime, Utc};

/// Parses a state value as a finite float. `NaN` and infinities are not numbers here.
pub fn parse_numeric(value: &str) -> Option<f64> {
    value
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|n| n.is_finite())
}

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Population standard deviation
pub fn std_dev(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let avg = mean(values);
    let variance = values.iter().map(|v| (v - avg).powi(2)).sum::<f64>() / values.len() as f64;
    variance.sqrt()
}

/// Absolute differences between consecutive values
fn deltas(values: &[f64]) -> Vec<f64> {
    values.windows(2).map(|w| (w[1] - w[0]).abs()).collect()
}

/// Builds a baseline from an ordered, non-empty sample window.
///
/// Numeric when every sample parses: threshold = mean(deltas) + sigmas * stddev(deltas).
pub(super) fn baseline_from_samples(
    entity_id: &str,
    samples: &[HistorySample],
    threshold_sigmas: f64,
    calculated_at: DateTime<Utc>,
) -> NoiseBaseline {
    let raw: Vec<String> = samples.iter().map(|s| s.state.clone()).collect();
    let skip = raw.len().saturating_sub(MAX_HISTORICAL_SAMPLES);
    let historical_states = raw[skip..].to_vec();

    let numeric: Option<Vec<f64>> = raw.iter().map(|s| parse_numeric(s)).collect();

    match numeric {
        Some(values) if values.len() >= 2 => {
            let fluctuations = deltas(&values);
            let typical = mean(&fluctuations);
            let threshold = typical + threshold_sigmas * std_dev(&fluctuations);

            NoiseBaseline {
                entity_id: entity_id.to_string(),
                state_type: StateType::Numeric,
                numeric_threshold: Some(threshold),
                typical_fluctuation: Some(typical),
                sample_count: samples.len(),
                last_calculated: calculated_at,
                historical_states,
            }
        }
        _ => NoiseBaseline {
            entity_id: entity_id.to_string(),
            state_type: StateType::String,
            numeric_threshold: None,
            typical_fluctuation: None,
            sample_count: samples.len(),
            last_calculated: calculated_at,
            historical_states,
        },
    }
}
