// QuectoFlow — Per-run shared context

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Mutable key/value state for one workflow run.
///
/// Created from the caller's initial inputs and threaded by `&mut` through
/// every step handler. Never shared between runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Context {
    values: Map<String, Value>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a context from a JSON object. Non-object values are rejected.
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(values) => Some(Self { values }),
            _ => None,
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.values.insert(key.into(), value);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.values.keys()
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.values
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.values)
    }

    /// Collect the values stored under `keys`, failing on the first key
    /// that is absent.
    pub fn gather(&self, keys: &[String]) -> Result<Map<String, Value>, String> {
        let mut out = Map::new();
        for key in keys {
            let value = self.values.get(key).ok_or_else(|| key.clone())?;
            out.insert(key.clone(), value.clone());
        }
        Ok(out)
    }

    /// Entries of `self` that are new or changed relative to `base`.
    pub fn changes_since(&self, base: &Context) -> Vec<(String, Value)> {
        self.values
            .iter()
            .filter(|(k, v)| base.values.get(*k) != Some(*v))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Restrict the context to `keys`, skipping any that are unset.
    pub fn select(&self, keys: &[String]) -> Context {
        let values = keys
            .iter()
            .filter_map(|k| self.values.get(k).map(|v| (k.clone(), v.clone())))
            .collect();
        Context { values }
    }
}

impl From<Map<String, Value>> for Context {
    fn from(values: Map<String, Value>) -> Self {
        Self { values }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_value_requires_object() {
        assert!(Context::from_value(json!({"a": 1})).is_some());
        assert!(Context::from_value(json!([1, 2])).is_none());
    }

    #[test]
    fn test_gather_reports_missing_key() {
        let ctx = Context::from_value(json!({"a": 1, "b": "x"})).unwrap();
        let got = ctx.gather(&["a".into(), "b".into()]).unwrap();
        assert_eq!(got.get("b"), Some(&json!("x")));
        assert_eq!(ctx.gather(&["a".into(), "zz".into()]).unwrap_err(), "zz");
    }

    #[test]
    fn test_changes_since() {
        let base = Context::from_value(json!({"a": 1, "b": 2})).unwrap();
        let mut next = base.clone();
        next.set("b", json!(3));
        next.set("c", json!(4));
        let mut changes = next.changes_since(&base);
        changes.sort_by(|x, y| x.0.cmp(&y.0));
        assert_eq!(
            changes,
            vec![("b".to_string(), json!(3)), ("c".to_string(), json!(4))]
        );
    }

    #[test]
    fn test_select_skips_unset() {
        let ctx = Context::from_value(json!({"a": 1, "b": 2})).unwrap();
        let picked = ctx.select(&["b".into(), "nope".into()]);
        assert_eq!(picked.into_value(), json!({"b": 2}));
    }
}
