use super::*;
use crate::config::NoiseConfig;
use chrono::{Duration, Utc};
use std::collections::HashMap;

fn create_test_store() -> NoiseBaselineStore {
    NoiseBaselineStore::new(":memory:").expect("Failed to create test store")
}

fn numeric_baseline(entity_id: &str, threshold: Option<f64>) -> NoiseBaseline {
    NoiseBaseline {
        entity_id: entity_id.to_string(),
        state_type: StateType::Numeric,
        numeric_threshold: threshold,
        typical_fluctuation: threshold.map(|t| t / 2.0),
        sample_count: 10,
        last_calculated: Utc::now(),
        historical_states: vec!["20.0".to_string(), "20.3".to_string()],
    }
}

fn string_baseline(entity_id: &str) -> NoiseBaseline {
    NoiseBaseline {
        entity_id: entity_id.to_string(),
        state_type: StateType::String,
        numeric_threshold: None,
        typical_fluctuation: None,
        sample_count: 4,
        last_calculated: Utc::now(),
        historical_states: vec!["on".to_string(), "off".to_string()],
    }
}

fn history(entries: &[(&str, &[&str])]) -> HashMap<String, Vec<HistorySample>> {
    let start = Utc::now() - Duration::minutes(15);
    entries
        .iter()
        .map(|(id, states)| {
            let samples = states
                .iter()
                .enumerate()
                .map(|(i, s)| HistorySample {
                    state: s.to_string(),
                    observed_at: start + Duration::minutes(i as i64),
                })
                .collect();
            (id.to_string(), samples)
        })
        .collect()
}

#[test]
fn test_no_baseline_is_always_significant() {
    let store = create_test_store();

    let result = store.classify("sensor.unknown", "20.0", "20.0001").unwrap();
    assert!(result.is_significant);
    assert_eq!(result.change_amount, None);
    assert_eq!(result.threshold, None);

    // Even identical values: absence of a baseline fails open
    assert!(store.classify("sensor.unknown", "on", "on").unwrap().is_significant);
}

#[test]
fn test_numeric_threshold() {
    let store = create_test_store();
    store.save(&numeric_baseline("sensor.temp", Some(0.5))).unwrap();

    let small = store.classify("sensor.temp", "20.0", "20.2").unwrap();
    assert!(!small.is_significant);
    assert!((small.change_amount.unwrap() - 0.2).abs() < 1e-9);
    assert_eq!(small.threshold, Some(0.5));

    let large = store.classify("sensor.temp", "20.0", "21.0").unwrap();
    assert!(large.is_significant);
    assert!((large.change_amount.unwrap() - 1.0).abs() < 1e-9);
}

#[test]
fn test_numeric_threshold_is_strict() {
    let store = create_test_store();
    store.save(&numeric_baseline("sensor.power", Some(1.0))).unwrap();

    assert!(!store.classify("sensor.power", "10", "11").unwrap().is_significant);
    assert!(!store.classify("sensor.power", "11", "10").unwrap().is_significant);
    assert!(store.classify("sensor.power", "10", "11.5").unwrap().is_significant);
}

#[test]
fn test_numeric_falls_back_to_string_comparison() {
    let store = create_test_store();
    store.save(&numeric_baseline("sensor.temp", Some(0.5))).unwrap();

    let result = store.classify("sensor.temp", "20.0", "unavailable").unwrap();
    assert!(result.is_significant);
    assert_eq!(result.change_amount, None);

    let same = store.classify("sensor.temp", "unknown", "unknown").unwrap();
    assert!(!same.is_significant);
}

#[test]
fn test_numeric_without_threshold_uses_zero() {
    let store = create_test_store();
    store.save(&numeric_baseline("sensor.count", None)).unwrap();

    let result = store.classify("sensor.count", "3", "3.0001").unwrap();
    assert!(result.is_significant);
    assert_eq!(result.threshold, Some(0.0));
    assert!(!store.classify("sensor.count", "3", "3.0").unwrap().is_significant);
}

#[test]
fn test_string_baseline_uses_inequality() {
    let store = create_test_store();
    store.save(&string_baseline("light.hall")).unwrap();

    assert!(store.classify("light.hall", "off", "on").unwrap().is_significant);
    assert!(!store.classify("light.hall", "on", "on").unwrap().is_significant);
    // Numeric-looking values are still compared as strings
    assert!(store.classify("light.hall", "1", "1.0").unwrap().is_significant);
}

#[test]
fn test_calculate_numeric_baseline_from_history() {
    let store = create_test_store();
    // deltas: 0.5, 0.2, 0.8, 0.1
    let input = history(&[("sensor.temp", &["20.0", "20.5", "20.3", "21.1", "21.0"])]);

    let baselines = store.calculate_from_history(&input).unwrap();
    assert_eq!(baselines.len(), 1);

    let deltas = [0.5, 0.2, 0.8, 0.1];
    let avg = deltas.iter().sum::<f64>() / 4.0;
    let variance = deltas.iter().map(|d| (d - avg).powi(2)).sum::<f64>() / 4.0;
    let expected = avg + variance.sqrt();

    let baseline = &baselines[0];
    assert_eq!(baseline.state_type, StateType::Numeric);
    assert_eq!(baseline.sample_count, 5);
    assert!((baseline.typical_fluctuation.unwrap() - avg).abs() < 1e-9);
    assert!((baseline.numeric_threshold.unwrap() - expected).abs() < 1e-9);
    assert_eq!(baseline.historical_states.len(), 5);

    // Persisted, and used for classification afterwards
    let stored = store.get("sensor.temp").unwrap().unwrap();
    assert!((stored.numeric_threshold.unwrap() - expected).abs() < 1e-9);
    assert!(!store.classify("sensor.temp", "21.0", "21.1").unwrap().is_significant);
    assert!(store.classify("sensor.temp", "21.0", "23.0").unwrap().is_significant);
}

#[test]
fn test_calculate_string_baseline_from_history() {
    let store = create_test_store();
    let input = history(&[("binary_sensor.door", &["off", "on", "off"])]);

    let baselines = store.calculate_from_history(&input).unwrap();
    let baseline = &baselines[0];
    assert_eq!(baseline.state_type, StateType::String);
    assert_eq!(baseline.numeric_threshold, None);
    assert_eq!(baseline.typical_fluctuation, None);
    assert_eq!(baseline.historical_states, vec!["off", "on", "off"]);
}

#[test]
fn test_calculate_skips_insufficient_history() {
    let store = create_test_store();
    let input = history(&[
        ("sensor.single", &["20.0"]),
        ("sensor.empty", &[]),
        ("sensor.pair", &["1", "2"]),
    ]);

    let baselines = store.calculate_from_history(&input).unwrap();
    let ids: Vec<&str> = baselines.iter().map(|b| b.entity_id.as_str()).collect();
    assert_eq!(ids, vec!["sensor.pair"]);
    assert!(store.get("sensor.single").unwrap().is_none());
    assert!(store.get("sensor.empty").unwrap().is_none());
}

#[test]
fn test_calculate_respects_min_samples() {
    let config = NoiseConfig {
        threshold_sigmas: 1.0,
        min_samples: 4,
    };
    let store = NoiseBaselineStore::with_config(":memory:", config).unwrap();
    let input = history(&[("a", &["1", "2", "3"]), ("b", &["1", "2", "3", "4"])]);

    let baselines = store.calculate_from_history(&input).unwrap();
    assert_eq!(baselines.len(), 1);
    assert_eq!(baselines[0].entity_id, "b");
}

#[test]
fn test_recalculation_replaces_baseline() {
    let store = create_test_store();
    store
        .calculate_from_history(&history(&[("sensor.x", &["1", "2", "3"])]))
        .unwrap();
    store
        .calculate_from_history(&history(&[("sensor.x", &["on", "off"])]))
        .unwrap();

    let all = store.all().unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all["sensor.x"].state_type, StateType::String);
    assert_eq!(all["sensor.x"].numeric_threshold, None);
}

#[test]
fn test_save_get_round_trip() {
    let store = create_test_store();
    let baseline = numeric_baseline("sensor.humidity", Some(1.25));
    store.save(&baseline).unwrap();

    let stored = store.get("sensor.humidity").unwrap().unwrap();
    assert_eq!(stored.state_type, StateType::Numeric);
    assert_eq!(stored.numeric_threshold, Some(1.25));
    assert_eq!(stored.typical_fluctuation, Some(0.625));
    assert_eq!(stored.sample_count, 10);
    assert_eq!(stored.last_calculated, baseline.last_calculated);
    assert_eq!(stored.historical_states, baseline.historical_states);
}

#[test]
fn test_zero_threshold_survives_storage() {
    let store = create_test_store();
    store.save(&numeric_baseline("sensor.flat", Some(0.0))).unwrap();

    let stored = store.get("sensor.flat").unwrap().unwrap();
    assert_eq!(stored.numeric_threshold, Some(0.0));
}

#[test]
fn test_delete_and_clear() {
    let store = create_test_store();
    store.save(&numeric_baseline("a", Some(1.0))).unwrap();
    store.save(&string_baseline("b")).unwrap();

    assert!(store.delete("a").unwrap());
    assert!(!store.delete("a").unwrap());
    assert!(store.classify("a", "1", "1.1").unwrap().is_significant);

    assert_eq!(store.clear().unwrap(), 1);
    assert!(store.all().unwrap().is_empty());
}

#[test]
fn test_save_keeps_most_recent_historical_states() {
    let store = create_test_store();

    let mut baseline = numeric_baseline("sensor.power", Some(3.0));
    baseline.historical_states = (0..50).map(|i| i.to_string()).collect();
    store.save(&baseline).unwrap();

    let stored = store.get("sensor.power").unwrap().unwrap();
    assert_eq!(stored.historical_states.len(), MAX_HISTORICAL_SAMPLES);
    assert_eq!(stored.historical_states.first().unwrap(), "30");
    assert_eq!(stored.historical_states.last().unwrap(), "49");
}

#[test]
fn test_failed_recalculation_writes_nothing() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("baselines.db");
    let store = NoiseBaselineStore::new(&path).unwrap();
    store.save(&string_baseline("sensor.a")).unwrap();

    let raw = rusqlite::Connection::open(&path).unwrap();
    raw.execute_batch(
        "CREATE TRIGGER reject_b BEFORE INSERT ON entity_noise_baselines
         WHEN NEW.entity_id = 'sensor.b'
         BEGIN SELECT RAISE(ABORT, 'rejected'); END;",
    )
    .unwrap();

    let result = store.calculate_from_history(&history(&[
        ("sensor.a", &["1", "2", "3"]),
        ("sensor.b", &["1", "2", "3"]),
    ]));
    assert!(result.is_err());

    // sensor.a keeps its previous baseline; sensor.b was never written
    let a = store.get("sensor.a").unwrap().unwrap();
    assert_eq!(a.state_type, StateType::String);
    assert!(store.get("sensor.b").unwrap().is_none());
}
