//! Pattern artifact payloads
//!
//! Field names follow the records written by the offline mining job, so the
//! on-disk and in-bucket files can be read without a translation step.

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;

/// Property keys (and categorical values) observed for a user or an event
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertiesInfo {
    #[serde(
        rename = "NumericPropertyKeys",
        default,
        deserialize_with = "null_as_default"
    )]
    pub numeric_property_keys: BTreeMap<String, bool>,
    #[serde(
        rename = "CategoricalPropertyKeyValues",
        default,
        deserialize_with = "null_as_default"
    )]
    pub categorical_property_key_values: BTreeMap<String, BTreeMap<String, bool>>,
}

impl PropertiesInfo {
    /// Names of numeric properties, sorted
    pub fn numerical_keys(&self) -> Vec<String> {
        self.numeric_property_keys.keys().cloned().collect()
    }

    /// Names of categorical properties, sorted
    pub fn categorical_keys(&self) -> Vec<String> {
        self.categorical_property_key_values.keys().cloned().collect()
    }

    /// Values seen for one categorical property
    pub fn categorical_values(&self, property_name: &str) -> Option<Vec<String>> {
        self.categorical_property_key_values
            .get(property_name)
            .map(|values| values.keys().cloned().collect())
    }
}

/// Aggregated user and per-event property statistics for one model
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserAndEventsInfo {
    #[serde(rename = "UserPropertiesInfo", default)]
    pub user_properties_info: Option<PropertiesInfo>,
    #[serde(rename = "EventPropertiesInfoMap", default)]
    pub event_properties_info_map: Option<BTreeMap<String, PropertiesInfo>>,
    #[serde(rename = "ModelVersion", default)]
    pub model_version: i64,
}

impl UserAndEventsInfo {
    pub fn event_properties(&self, event_name: &str) -> Option<&PropertiesInfo> {
        self.event_properties_info_map
            .as_ref()
            .and_then(|events| events.get(event_name))
    }
}

/// A mined pattern together with the event sequence it was mined for
///
/// The pattern body is kept as raw JSON; serving nodes never interpret it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternWithMeta {
    #[serde(rename = "pe", default)]
    pub pattern_events: Vec<String>,
    #[serde(rename = "rp")]
    pub raw_pattern: serde_json::Value,
}

impl PatternWithMeta {
    /// Whether this pattern matches optional start/end event filters.
    /// Empty filters match everything.
    pub fn matches(&self, start_event: &str, end_event: &str) -> bool {
        let start_ok = start_event.is_empty()
            || self.pattern_events.first().map(String::as_str) == Some(start_event);
        let end_ok = end_event.is_empty()
            || self.pattern_events.last().map(String::as_str) == Some(end_event);
        start_ok && end_ok
    }

    pub fn contains_event(&self, event_name: &str) -> bool {
        self.pattern_events.iter().any(|event| event == event_name)
    }

    /// Per-occurrence count carried in the pattern body under `c`, 0 if absent
    pub fn occurrence_count(&self) -> u64 {
        self.raw_pattern
            .get("c")
            .and_then(serde_json::Value::as_u64)
            .unwrap_or_default()
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}
