//! Parameter store: owns the configuration under its mutex and renders
//! the telemetry snapshot consumed by every sink.
//!
//! The scheduler mutates parameter values under the store's config mutex
//! and re-renders the snapshot after each transaction; the dispatcher and
//! external readers only ever copy the rendered string out from under the
//! separate snapshot mutex.

use crate::config::{AllPids, SensorType};
use serde_json::{Map, Number, Value};
use std::sync::{Mutex, MutexGuard};

pub struct ParameterStore {
    pids: Mutex<AllPids>,
    snapshot: Mutex<Option<String>>,
    config_json: Mutex<Option<String>>,
}

impl ParameterStore {
    pub fn new(pids: AllPids) -> Self {
        Self {
            pids: Mutex::new(pids),
            snapshot: Mutex::new(None),
            config_json: Mutex::new(None),
        }
    }

    /// Lock the configuration. The scheduler holds this across a whole
    /// parameter transaction and releases it between parameters.
    pub fn pids(&self) -> MutexGuard<'_, AllPids> {
        self.pids.lock().unwrap()
    }

    /// Re-render the snapshot from the caller's config guard.
    pub fn update_snapshot(&self, pids: &AllPids) {
        let rendered = render_snapshot(pids);
        *self.snapshot.lock().unwrap() = Some(rendered);
    }

    /// Owned copy of the current snapshot JSON, if any exists yet.
    pub fn snapshot_json(&self) -> Option<String> {
        self.snapshot.lock().unwrap().clone()
    }

    /// `{"<name>": <value>}` for a single parameter, if present in the
    /// snapshot.
    pub fn value_by_name(&self, name: &str) -> Option<String> {
        let snapshot = self.snapshot_json()?;
        let root: Value = serde_json::from_str(&snapshot).ok()?;
        let value = root.get(name)?.clone();
        let mut single = Map::new();
        single.insert(name.to_string(), value);
        Some(Value::Object(single).to_string())
    }

    /// True iff every parameter's failed flag is set.
    pub fn all_failed(&self) -> bool {
        let pids = self.pids();
        !pids
            .entries
            .iter()
            .flat_map(|entry| entry.parameters.iter())
            .any(|param| !param.failed)
    }

    /// `{name: {class, unit}}` for every parameter of an enabled class.
    /// Built once and cached.
    pub fn config_json(&self) -> Option<String> {
        let mut cached = self.config_json.lock().unwrap();
        if cached.is_none() {
            let pids = self.pids();
            let mut root = Map::new();
            for entry in &pids.entries {
                if !pids.kind_enabled(entry.kind) {
                    continue;
                }
                for param in &entry.parameters {
                    let mut details = Map::new();
                    if let Some(class) = &param.class {
                        details.insert("class".to_string(), Value::String(class.clone()));
                    }
                    if let Some(unit) = &param.unit {
                        details.insert("unit".to_string(), Value::String(unit.clone()));
                    }
                    root.insert(param.name.clone(), Value::Object(details));
                }
            }
            *cached = Some(Value::Object(root).to_string());
        }
        cached.clone()
    }
}

/// Render the snapshot object: every parameter with a value, binary
/// sensors as `"on"`/`"off"`, numbers precision-normalized.
fn render_snapshot(pids: &AllPids) -> String {
    let mut root = Map::new();
    for entry in &pids.entries {
        for param in &entry.parameters {
            let Some(value) = param.last_value else {
                continue;
            };
            let rendered = match param.sensor_type {
                SensorType::Binary => {
                    Value::String(if value > 0.0 { "on" } else { "off" }.to_string())
                }
                SensorType::Numeric => Value::Number(precision_number(value)),
            };
            root.insert(param.name.clone(), rendered);
        }
    }
    let mut value = Value::Object(root);
    limit_precision(&mut value);
    value.to_string()
}

/// Reformat a number to at most two fractional digits,
/// round-half-away-from-zero, integers without a decimal point.
#[allow(clippy::cast_possible_truncation)] // range-checked before the cast
pub(crate) fn precision_number(num: f64) -> Number {
    let rounded = (num * 100.0).round() / 100.0;
    if rounded.fract() == 0.0 && rounded.abs() < 1e15 {
        Number::from(rounded as i64)
    } else {
        Number::from_f64(rounded).unwrap_or_else(|| Number::from(0))
    }
}

/// Recursively limit decimal precision in a JSON tree.
pub fn limit_precision(value: &mut Value) {
    match value {
        Value::Number(n) => {
            if let Some(f) = n.as_f64() {
                *n = precision_number(f);
            }
        }
        Value::Array(items) => {
            for item in items {
                limit_precision(item);
            }
        }
        Value::Object(map) => {
            for (_, item) in map.iter_mut() {
                limit_precision(item);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AllPids;

    fn store_with_params() -> ParameterStore {
        let json = r#"{
            "standard_pids": "enable",
            "custom_pids": "enable",
            "ecu_protocol": "6",
            "std_pids": [{"name": "0C-EngineRPM", "period": 1000}],
            "pids": [{
                "pid": "220101",
                "parameters": [
                    {"name": "SOC", "expression": "B4/2"},
                    {"name": "CHARGING", "expression": "B5", "sensor_type": "binary"}
                ]
            }]
        }"#;
        ParameterStore::new(AllPids::from_json(json).unwrap())
    }

    fn set_value(store: &ParameterStore, name: &str, value: f64) {
        let mut pids = store.pids();
        for entry in &mut pids.entries {
            for param in &mut entry.parameters {
                if param.name == name {
                    param.last_value = Some(value);
                }
            }
        }
        store.update_snapshot(&pids);
    }

    #[test]
    fn test_snapshot_none_before_first_update() {
        let store = store_with_params();
        assert!(store.snapshot_json().is_none());
    }

    #[test]
    fn test_snapshot_contains_only_set_parameters() {
        let store = store_with_params();
        set_value(&store, "0C-EngineRPM", 1726.0);

        let snapshot = store.snapshot_json().unwrap();
        let root: Value = serde_json::from_str(&snapshot).unwrap();
        let map = root.as_object().unwrap();
        assert_eq!(map.len(), 1);
        assert_eq!(map["0C-EngineRPM"], Value::Number(Number::from(1726)));
    }

    #[test]
    fn test_snapshot_integer_renders_without_decimal_point() {
        let store = store_with_params();
        set_value(&store, "0C-EngineRPM", 1726.0);
        let snapshot = store.snapshot_json().unwrap();
        assert!(snapshot.contains("\"0C-EngineRPM\":1726"));
        assert!(!snapshot.contains("1726.0"));
    }

    #[test]
    fn test_snapshot_binary_sensor_renders_on_off() {
        let store = store_with_params();
        set_value(&store, "CHARGING", 1.0);
        assert!(store.snapshot_json().unwrap().contains("\"CHARGING\":\"on\""));
        set_value(&store, "CHARGING", 0.0);
        assert!(store.snapshot_json().unwrap().contains("\"CHARGING\":\"off\""));
    }

    #[test]
    fn test_value_by_name() {
        let store = store_with_params();
        set_value(&store, "SOC", 62.3);
        assert_eq!(store.value_by_name("SOC").unwrap(), r#"{"SOC":62.3}"#);
        assert!(store.value_by_name("MISSING").is_none());
    }

    #[test]
    fn test_all_failed() {
        let store = store_with_params();
        assert!(!store.all_failed());

        {
            let mut pids = store.pids();
            for entry in &mut pids.entries {
                for param in &mut entry.parameters {
                    param.failed = true;
                }
            }
        }
        assert!(store.all_failed());

        {
            let mut pids = store.pids();
            pids.entries[0].parameters[0].failed = false;
        }
        assert!(!store.all_failed());
    }

    #[test]
    fn test_config_json_lists_enabled_classes() {
        let store = store_with_params();
        let config = store.config_json().unwrap();
        let root: Value = serde_json::from_str(&config).unwrap();
        assert_eq!(root["0C-EngineRPM"]["unit"], "rpm");
        assert_eq!(root["0C-EngineRPM"]["class"], "speed");
        assert!(root.get("SOC").is_some());

        // Cached: same string again
        assert_eq!(store.config_json().unwrap(), config);
    }

    #[test]
    fn test_precision_number() {
        assert_eq!(precision_number(3.14159).to_string(), "3.14");
        assert_eq!(precision_number(62.3).to_string(), "62.3");
        assert_eq!(precision_number(1726.0).to_string(), "1726");
        assert_eq!(precision_number(-4500.0).to_string(), "-4500");
        // Half rounds away from zero
        assert_eq!(precision_number(0.005).to_string(), "0.01");
        assert_eq!(precision_number(-0.005).to_string(), "-0.01");
        // Trailing zeros trimmed
        assert_eq!(precision_number(2.50).to_string(), "2.5");
    }

    #[test]
    fn test_limit_precision_walks_tree() {
        let mut value: Value = serde_json::from_str(
            r#"{"a": 1.23456, "b": [2.718281, {"c": 10.0}], "d": "s"}"#,
        )
        .unwrap();
        limit_precision(&mut value);
        assert_eq!(value["a"], Value::Number(Number::from_f64(1.23).unwrap()));
        assert_eq!(value["b"][0], Value::Number(Number::from_f64(2.72).unwrap()));
        assert_eq!(value["b"][1]["c"], Value::Number(Number::from(10)));
        assert_eq!(value["d"], "s");
    }
}
