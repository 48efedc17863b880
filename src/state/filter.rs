use super::entity::Attributes;
use crate::config::DEFAULT_IGNORED_ATTRIBUTES;
use serde_json::Value;
use std::collections::{HashMap, HashSet};

/// Deny-list of high-churn attribute keys.
///
/// Only used to decide whether two attribute sets are meaningfully equal;
/// never applied to what gets persisted.
#[derive(Clone, Debug)]
pub struct AttributeFilter {
    ignored: HashSet<String>,
}

impl AttributeFilter {
    pub fn new<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            ignored: keys.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_ignored(&self, key: &str) -> bool {
        self.ignored.contains(key)
    }

    /// View of `attributes` without the ignored keys
    pub fn meaningful<'a>(&self, attributes: &'a Attributes) -> HashMap<&'a str, &'a Value> {
        attributes
            .iter()
            .filter(|(key, _)| !self.is_ignored(key))
            .map(|(key, value)| (key.as_str(), value))
            .collect()
    }

    /// Deep equality over the meaningful keys only
    pub fn meaningfully_equal(&self, a: &Attributes, b: &Attributes) -> bool {
        self.meaningful(a) == self.meaningful(b)
    }
}

impl Default for AttributeFilter {
    fn default() -> Self {
        Self::new(DEFAULT_IGNORED_ATTRIBUTES.iter().copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn attrs(value: Value) -> Attributes {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_ignores_gps_churn() {
        let filter = AttributeFilter::default();
        let a = attrs(json!({"friendly_name": "Phone", "latitude": 52.1, "longitude": 4.3}));
        let b = attrs(json!({"friendly_name": "Phone", "latitude": 52.2, "longitude": 4.4}));
        assert!(filter.meaningfully_equal(&a, &b));
    }

    #[test]
    fn test_ignored_key_presence_does_not_matter() {
        let filter = AttributeFilter::default();
        let a = attrs(json!({"unit": "°C"}));
        let b = attrs(json!({"unit": "°C", "battery_level": 80}));
        assert!(filter.meaningfully_equal(&a, &b));
    }

    #[test]
    fn test_detects_meaningful_difference() {
        let filter = AttributeFilter::default();
        let a = attrs(json!({"brightness": 120, "rssi": -60}));
        let b = attrs(json!({"brightness": 200, "rssi": -60}));
        assert!(!filter.meaningfully_equal(&a, &b));
    }

    #[test]
    fn test_nested_values_compared_deeply() {
        let filter = AttributeFilter::default();
        let a = attrs(json!({"rgb_color": [255, 0, 0], "effect": {"name": "fade"}}));
        let b = attrs(json!({"effect": {"name": "fade"}, "rgb_color": [255, 0, 0]}));
        let c = attrs(json!({"effect": {"name": "fade"}, "rgb_color": [0, 255, 0]}));
        assert!(filter.meaningfully_equal(&a, &b));
        assert!(!filter.meaningfully_equal(&a, &c));
    }

    #[test]
    fn test_custom_deny_list() {
        let filter = AttributeFilter::new(["brightness"]);
        assert!(filter.is_ignored("brightness"));
        assert!(!filter.is_ignored("latitude"));
    }
}
