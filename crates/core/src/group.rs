//! Canonical group keys.
//!
//! A group key names a set of entries that are refreshed or evicted together,
//! typically a resource (`{"id": ...}`) or one version of it
//! (`{"id": ..., "version": ...}`). Keys are compared as strings, so any
//! JSON-shaped key is re-encoded with recursively sorted object keys; two keys
//! built from the same fields in a different order are equal.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Canonically encoded group identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupKey(String);

impl GroupKey {
    /// Build a key from a JSON value, sorting object keys at every depth.
    pub fn from_value(value: &Value) -> Self {
        Self(canonical_json(value))
    }

    /// Parse a stored or user-supplied key.
    ///
    /// Strings holding a JSON object or array are canonicalized; anything else
    /// is kept verbatim.
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.starts_with('{') || trimmed.starts_with('[') {
            if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
                return Self::from_value(&value);
            }
        }
        Self(raw.to_string())
    }

    /// Key of a whole resource, across versions.
    pub fn resource(id: &str) -> Self {
        Self::from_value(&serde_json::json!({ "id": id }))
    }

    /// Key of one version of a resource.
    pub fn resource_version(id: &str, version: &str) -> Self {
        Self::from_value(&serde_json::json!({ "id": id, "version": version }))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Decode the key back into JSON, if it was JSON-shaped.
    pub fn to_value(&self) -> Option<Value> {
        serde_json::from_str(&self.0).ok()
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for GroupKey {
    fn from(raw: &str) -> Self {
        Self::parse(raw)
    }
}

impl From<String> for GroupKey {
    fn from(raw: String) -> Self {
        Self::parse(&raw)
    }
}

impl From<&Value> for GroupKey {
    fn from(value: &Value) -> Self {
        Self::from_value(value)
    }
}

fn canonical_json(value: &Value) -> String {
    sort_keys(value).to_string()
}

fn sort_keys(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = Map::new();
            for key in keys {
                sorted.insert(key.clone(), sort_keys(&map[key]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(sort_keys).collect()),
        other => other.clone(),
    }
}
