//! Observed objects as opaque JSON.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// An observed object, as delivered by a watch stream.
///
/// Treated as opaque JSON except for the conventional `metadata` shape and
/// the reserved `status.opkit` subtree owned by the framework. All accessors
/// tolerate missing or malformed sections by returning empty defaults.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Default)]
#[serde(transparent)]
pub struct Body(Value);

impl Body {
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }

    /// The `metadata` mapping, if present and well-formed.
    pub fn meta(&self) -> Option<&Map<String, Value>> {
        self.0.get("metadata")?.as_object()
    }

    fn meta_str(&self, key: &str) -> Option<&str> {
        self.0.get("metadata")?.get(key)?.as_str()
    }

    pub fn uid(&self) -> Option<&str> {
        self.meta_str("uid")
    }

    pub fn name(&self) -> Option<&str> {
        self.meta_str("name")
    }

    pub fn namespace(&self) -> Option<&str> {
        self.meta_str("namespace")
    }

    /// The deletion timestamp; an explicit JSON `null` counts as unset.
    pub fn deletion_timestamp(&self) -> Option<&str> {
        self.meta_str("deletionTimestamp")
    }

    /// The `metadata.finalizers` entries, empty when absent.
    pub fn finalizers(&self) -> Vec<&str> {
        self.0
            .get("metadata")
            .and_then(|m| m.get("finalizers"))
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default()
    }

    pub fn annotations(&self) -> Option<&Map<String, Value>> {
        self.0.get("metadata")?.get("annotations")?.as_object()
    }

    pub fn labels(&self) -> Option<&Map<String, Value>> {
        self.0.get("metadata")?.get("labels")?.as_object()
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations()?.get(key)?.as_str()
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels()?.get(key)?.as_str()
    }

    pub fn spec(&self) -> Option<&Value> {
        self.0.get("spec")
    }

    pub fn status(&self) -> Option<&Value> {
        self.0.get("status")
    }

    /// Resolve a nested value by key path.
    pub fn get_path(&self, path: &[String]) -> Option<&Value> {
        crate::diff::resolve(Some(&self.0), path)
    }
}

impl From<Value> for Body {
    fn from(value: Value) -> Self {
        Self(value)
    }
}
