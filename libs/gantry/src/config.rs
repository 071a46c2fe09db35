use serde_json::{Map, Value};
use thiserror::Error;

/// Errors for malformed configuration paths. Missing keys are not errors;
/// reads return `None` and writes create the path.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config path must be a non-empty string")]
    EmptyPath,
    #[error("config path `{0}` contains an empty segment")]
    EmptySegment(String),
}

/// Hierarchical configuration addressed by colon-delimited key paths
/// (`"gantry:server:port"`). Mutated only during bootstrap; effectively
/// read-only afterwards.
#[derive(Debug, Clone, Default)]
pub struct ConfigStore {
    root: Map<String, Value>,
}

impl ConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn split(path: &str) -> Result<Vec<&str>, ConfigError> {
        let path = path.trim();
        if path.is_empty() {
            return Err(ConfigError::EmptyPath);
        }
        let parts: Vec<&str> = path.split(':').map(str::trim).collect();
        if parts.iter().any(|p| p.is_empty()) {
            return Err(ConfigError::EmptySegment(path.to_string()));
        }
        Ok(parts)
    }

    /// Value at `path`, or `None` when any segment is absent.
    pub fn get(&self, path: &str) -> Result<Option<&Value>, ConfigError> {
        let parts = Self::split(path)?;
        let mut current = match self.root.get(parts[0]) {
            Some(v) => v,
            None => return Ok(None),
        };
        for part in &parts[1..] {
            match current.get(part) {
                Some(v) => current = v,
                None => return Ok(None),
            }
        }
        Ok(Some(current))
    }

    /// Value at `path`, or `default` when absent or the path is malformed.
    pub fn get_or(&self, path: &str, default: Value) -> Value {
        match self.get(path) {
            Ok(Some(v)) => v.clone(),
            _ => default,
        }
    }

    pub fn get_str(&self, path: &str) -> Option<String> {
        match self.get(path) {
            Ok(Some(Value::String(s))) => Some(s.clone()),
            _ => None,
        }
    }

    pub fn get_u64(&self, path: &str) -> Option<u64> {
        match self.get(path) {
            Ok(Some(v)) => v.as_u64(),
            _ => None,
        }
    }

    pub fn get_bool(&self, path: &str) -> Option<bool> {
        match self.get(path) {
            Ok(Some(v)) => v.as_bool(),
            _ => None,
        }
    }

    /// Set `path` to `value`, creating intermediate objects as needed.
    /// Non-object intermediates on the path are replaced.
    pub fn set(&mut self, path: &str, value: Value) -> Result<(), ConfigError> {
        let parts = Self::split(path)?;
        insert_at(&mut self.root, &parts, value);
        Ok(())
    }

    /// Deep-merge `overlay` into the value at `path`; overlay wins on
    /// conflicts. Used for environment-specific configuration.
    pub fn merge_over(&mut self, path: &str, overlay: Value) -> Result<(), ConfigError> {
        let mut merged = self.get_or(path, Value::Null);
        merge_values(&mut merged, overlay);
        self.set(path, merged)
    }

    /// Deep-merge `defaults` under the value at `path`; existing values
    /// win. Used for extension-supplied default configuration.
    pub fn merge_under(&mut self, path: &str, defaults: Value) -> Result<(), ConfigError> {
        let current = self.get_or(path, Value::Null);
        let mut merged = defaults;
        merge_values(&mut merged, current);
        self.set(path, merged)
    }
}

fn insert_at(map: &mut Map<String, Value>, parts: &[&str], value: Value) {
    match parts {
        [] => {}
        [last] => {
            map.insert((*last).to_string(), value);
        }
        [head, rest @ ..] => {
            let slot = map
                .entry((*head).to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if let Value::Object(m) = slot {
                insert_at(m, rest, value);
            } else {
                let mut m = Map::new();
                insert_at(&mut m, rest, value);
                *slot = Value::Object(m);
            }
        }
    }
}

/// Deep-merge `overlay` into `base`: objects merge per key, everything else
/// is replaced by the overlay. `Null` overlays leave the base untouched.
pub fn merge_values(base: &mut Value, overlay: Value) {
    match overlay {
        Value::Null => {}
        Value::Object(overlay_map) => {
            if let Value::Object(base_map) = base {
                for (key, value) in overlay_map {
                    match base_map.get_mut(&key) {
                        Some(slot) => merge_values(slot, value),
                        None => {
                            base_map.insert(key, value);
                        }
                    }
                }
            } else {
                *base = Value::Object(overlay_map);
            }
        }
        other => *base = other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn set_then_get_round_trip() {
        let mut store = ConfigStore::new();
        store.set("a:b:c", json!(42)).expect("set");
        assert_eq!(store.get("a:b:c").expect("get"), Some(&json!(42)));
        assert_eq!(
            store.get_or("a:b:missing", json!("fallback")),
            json!("fallback")
        );
    }

    #[test]
    fn set_creates_intermediate_objects() {
        let mut store = ConfigStore::new();
        store.set("module:file:key", json!("777")).expect("set");
        store.set("module:file:other", json!("123")).expect("set");
        assert_eq!(
            store.get("module:file").expect("get"),
            Some(&json!({"key": "777", "other": "123"}))
        );
    }

    #[test]
    fn set_replaces_scalar_intermediate() {
        let mut store = ConfigStore::new();
        store.set("a:b", json!(1)).expect("set");
        store.set("a:b:c", json!(2)).expect("set");
        assert_eq!(store.get("a:b:c").expect("get"), Some(&json!(2)));
    }

    #[test]
    fn malformed_paths_are_rejected() {
        let mut store = ConfigStore::new();
        assert!(matches!(store.get(""), Err(ConfigError::EmptyPath)));
        assert!(matches!(
            store.get("a::b"),
            Err(ConfigError::EmptySegment(_))
        ));
        assert!(matches!(
            store.set("a: :b", json!(1)),
            Err(ConfigError::EmptySegment(_))
        ));
    }

    #[test]
    fn merge_over_lets_overlay_win() {
        let mut store = ConfigStore::new();
        store
            .set("m:cfg", json!({"keep": 1, "replace": "old"}))
            .expect("set");
        store
            .merge_over("m:cfg", json!({"replace": "new", "added": true}))
            .expect("merge");
        assert_eq!(
            store.get("m:cfg").expect("get"),
            Some(&json!({"keep": 1, "replace": "new", "added": true}))
        );
    }

    #[test]
    fn merge_under_lets_existing_win() {
        let mut store = ConfigStore::new();
        store.set("ext:ns", json!({"set_by_app": "app"})).expect("set");
        store
            .merge_under("ext:ns", json!({"set_by_app": "default", "fallback": 7}))
            .expect("merge");
        assert_eq!(
            store.get("ext:ns").expect("get"),
            Some(&json!({"set_by_app": "app", "fallback": 7}))
        );
    }

    #[test]
    fn paths_are_trimmed() {
        let mut store = ConfigStore::new();
        store.set(" a : b ", json!(5)).expect("set");
        assert_eq!(store.get("a:b").expect("get"), Some(&json!(5)));
    }
}
