//! Configurations
//!
//! A configuration is a map-valued expression decorated with the
//! operations the analyzer needs: shadowing update, projection to a
//! variable set, and pretty-printing for error frames.

use crate::linked_map::LinkedMap;
use crate::value::Value;
use serde_json::Value as Json;
use std::collections::BTreeMap;

/// Thin wrapper over a map-typed expression.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Configuration {
    expr: Value,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            expr: Value::empty_map(),
        }
    }
}

impl Configuration {
    /// Wrap a map-valued expression; non-maps fall back to the empty
    /// configuration.
    pub fn new(expr: Value) -> Self {
        if expr.is_map() {
            Self { expr }
        } else {
            Self::default()
        }
    }

    pub fn from_json(json: &Json) -> Self {
        Self::new(Value::from_json(json))
    }

    /// The binding for `key`; none when unset.
    pub fn get(&self, key: &str) -> Value {
        self.expr.get_or(key, Value::none())
    }

    /// Whether `key` is bound (possibly to none) in this configuration.
    pub fn variable_fixed(&self, key: &str) -> bool {
        self.expr
            .as_map()
            .map_or(false, |map| map.contains(key))
    }

    /// New configuration whose single binding shadows this one.
    pub fn update(&self, name: impl Into<String>, value: Value) -> Self {
        let mut table = BTreeMap::new();
        table.insert(name.into(), value);
        self.update_map_table(table)
    }

    /// New configuration shadowed by the given map-valued expression.
    /// An empty update returns this configuration unchanged.
    pub fn update_from(&self, overlay: &Value) -> Self {
        match overlay.as_map() {
            Some(map) if !map.is_empty() => {
                let base = self
                    .expr
                    .as_map()
                    .cloned()
                    .unwrap_or_else(LinkedMap::empty);
                Self {
                    expr: Value::map(LinkedMap::link(base, map.clone())),
                }
            }
            _ => self.clone(),
        }
    }

    fn update_map_table(&self, table: BTreeMap<String, Value>) -> Self {
        if table.is_empty() {
            return self.clone();
        }
        let base = self
            .expr
            .as_map()
            .cloned()
            .unwrap_or_else(LinkedMap::empty);
        Self {
            expr: Value::map(LinkedMap::shadow(base, table)),
        }
    }

    /// Project to the given variables; absent variables are filled with
    /// none, so the result always binds exactly `vars`.
    pub fn prune<S: AsRef<str>>(&self, vars: impl IntoIterator<Item = S>) -> Self {
        let mut subset = BTreeMap::new();
        for var in vars {
            let key = var.as_ref();
            subset.insert(key.to_string(), self.get(key));
        }
        Self {
            expr: Value::map_from(subset),
        }
    }

    pub fn expr(&self) -> &Value {
        &self.expr
    }

    pub fn to_json(&self) -> Json {
        self.expr.to_json_all()
    }

    /// Pretty-print the bindings for error frames, one line per
    /// variable, each truncated to fit the width budget.
    pub fn enumerate(&self, prefix: &str, width: usize) -> String {
        let mut out = String::new();
        if width <= prefix.len() {
            return out;
        }
        let actual_width = width - prefix.len();
        if let Some(map) = self.expr.as_map() {
            for (key, value) in map.items() {
                let key_str = format!("{:?}", key);
                if actual_width > key_str.len() + 3 {
                    let remain = actual_width - key_str.len() - 3;
                    let val_str = value.to_abbrev_string(remain);
                    out.push_str(&format!("{}{} : {}\n", prefix, key_str, val_str));
                } else {
                    let truncated: String = key_str.chars().take(actual_width).collect();
                    out.push_str(&format!("{}{}\n", prefix, truncated));
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_get_missing_is_none() {
        let config = Configuration::from_json(&json!({"OS": "linux"}));
        assert_eq!(config.get("OS"), Value::string("linux"));
        assert_eq!(config.get("ARCH"), Value::none());
    }

    #[test]
    fn test_update_shadows() {
        let config = Configuration::from_json(&json!({"OS": "linux"}));
        let updated = config.update("OS", Value::string("darwin"));
        assert_eq!(updated.get("OS"), Value::string("darwin"));
        assert_eq!(config.get("OS"), Value::string("linux"));
    }

    #[test]
    fn test_update_from_empty_is_identity() {
        let config = Configuration::from_json(&json!({"OS": "linux"}));
        let same = config.update_from(&Value::empty_map());
        assert_eq!(config, same);
    }

    #[test]
    fn test_prune_fills_missing_with_none() {
        let config = Configuration::from_json(&json!({"OS": "linux", "ARCH": "arm64"}));
        let pruned = config.prune(["OS", "DEBUG"]);
        assert_eq!(pruned.get("OS"), Value::string("linux"));
        assert_eq!(pruned.get("ARCH"), Value::none());
        assert!(pruned.variable_fixed("DEBUG"));
        assert!(!pruned.variable_fixed("ARCH"));
    }

    #[test]
    fn test_variable_fixed_top_layer() {
        let config = Configuration::from_json(&json!({"A": null}));
        assert!(config.variable_fixed("A"));
        assert!(!config.variable_fixed("B"));
    }

    #[test]
    fn test_hash_equality_across_layering() {
        let flat = Configuration::from_json(&json!({"A": "1", "B": "2"}));
        let layered =
            Configuration::from_json(&json!({"A": "1"})).update("B", Value::string("2"));
        assert_eq!(flat.expr().to_hash(), layered.expr().to_hash());
        assert_eq!(flat, layered);
    }

    #[test]
    fn test_enumerate_fits_width() {
        let config = Configuration::from_json(&json!({"LONGVAR": "a-rather-long-value"}));
        let out = config.enumerate("  - ", 24);
        for line in out.lines() {
            assert!(line.chars().count() <= 24 + 3);
        }
    }
}
