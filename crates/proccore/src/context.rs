use crate::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Key/value data threaded through the steps of an instance.
///
/// Tasks receive an owned copy and hand back the context they want to keep,
/// so no two lines of execution ever share a mutable context.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Context(BTreeMap<String, Value>);

impl Context {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Look up a dotted path such as `order.customer.tier`.
    pub fn get_path(&self, path: &str) -> Option<&Value> {
        let mut segments = path.split('.');
        let mut current = self.0.get(segments.next()?)?;
        for segment in segments {
            current = current.as_object()?.get(segment)?;
        }
        Some(current)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(key.into(), value.into())
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }

    /// Entries written relative to `base`: new keys, plus the changed part
    /// of existing ones. Removals are not reported.
    pub fn changes_since(&self, base: &Context) -> Context {
        self.0
            .iter()
            .filter_map(|(key, value)| match base.0.get(key) {
                Some(old) => value.changes_since(old).map(|v| (key.clone(), v)),
                None => Some((key.clone(), value.clone())),
            })
            .collect()
    }

    /// Merge `other` into `self`; `other` wins wherever both hold a
    /// non-object value for the same key.
    pub fn deep_merge(&mut self, other: Context) {
        for (key, value) in other.0 {
            match self.0.get_mut(&key) {
                Some(existing) => existing.deep_merge(value),
                None => {
                    self.0.insert(key, value);
                }
            }
        }
    }

    /// Shallow insert of every entry of `other`
    pub fn extend(&mut self, other: impl IntoIterator<Item = (String, Value)>) {
        self.0.extend(other);
    }

    /// Build a context from a JSON object. Anything else yields `None`.
    pub fn from_json(json: serde_json::Value) -> Option<Context> {
        match json {
            serde_json::Value::Object(obj) => {
                Some(obj.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
            _ => None,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::Value::Object(self.0.iter().map(|(k, v)| (k.clone(), v.to_json())).collect())
    }

    pub fn into_inner(self) -> BTreeMap<String, Value> {
        self.0
    }
}

impl From<BTreeMap<String, Value>> for Context {
    fn from(map: BTreeMap<String, Value>) -> Self {
        Self(map)
    }
}

impl FromIterator<(String, Value)> for Context {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for Context {
    type Item = (String, Value);
    type IntoIter = std::collections::btree_map::IntoIter<String, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx(json: serde_json::Value) -> Context {
        Context::from_json(json).unwrap()
    }

    #[test]
    fn changes_since_ignores_untouched_keys() {
        let origin = ctx(json!({"a": 1, "b": {"x": 1}}));
        let branch = ctx(json!({"a": 1, "b": {"x": 1, "y": 2}, "c": 3}));

        assert_eq!(branch.changes_since(&origin), ctx(json!({"b": {"y": 2}, "c": 3})));
    }

    #[test]
    fn deep_merge_prefers_later_writes() {
        let mut merged = ctx(json!({"a": 1}));
        merged.deep_merge(ctx(json!({"a": 2, "b": 1})));
        assert_eq!(merged, ctx(json!({"a": 2, "b": 1})));
    }

    #[test]
    fn get_path_walks_nested_objects() {
        let context = ctx(json!({"order": {"customer": {"tier": "gold"}}}));
        assert_eq!(
            context.get_path("order.customer.tier"),
            Some(&Value::String("gold".into()))
        );
        assert_eq!(context.get_path("order.missing"), None);
        assert_eq!(context.get_path("order.customer.tier.deeper"), None);
    }

    #[test]
    fn from_json_rejects_non_objects() {
        assert!(Context::from_json(json!([1, 2])).is_none());
        assert!(Context::from_json(json!({})).unwrap().is_empty());
    }
}
