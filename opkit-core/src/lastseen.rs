//! The last-seen essence snapshot stored on the object itself.
//!
//! The essence is the comparable subset of a body: everything except the
//! system-managed sections, plus any extra fields declared by the handlers.
//! It is serialized as canonical JSON into an annotation, and decoded on the
//! next observation to serve as the baseline for diff computation.

use crate::body::Body;
use crate::diff::{diff, Diff};
use crate::patch::Patch;
use serde_json::{Map, Value};

/// Annotation holding the canonical JSON of the last handled essence.
pub const LAST_SEEN_ANNOTATION: &str = "opkit.dev/last-handled-configuration";

/// Compute the comparable subset of a body.
///
/// Strips `status`, `metadata`, and the type-identification keys, then
/// re-imports the declared `extra_fields` paths from the original body.
/// The reserved `status.opkit` subtree never makes it into the essence.
pub fn essence(body: &Body, extra_fields: &[Vec<String>]) -> Value {
    let mut root = match body.as_value() {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };
    root.remove("apiVersion");
    root.remove("kind");
    root.remove("metadata");
    root.remove("status");

    let mut result = root;
    for field in extra_fields {
        if field.first().map(String::as_str) == Some("status")
            && field.get(1).map(String::as_str) == Some("opkit")
        {
            continue;
        }
        if field
            .as_slice()
            .starts_with(&["metadata".to_string(), "annotations".to_string()])
            && field.get(2).map(String::as_str) == Some(LAST_SEEN_ANNOTATION)
        {
            continue;
        }
        if let Some(value) = body.get_path(field) {
            put(&mut result, field, value.clone());
        }
    }
    // A broad `metadata.annotations` extra must not re-import the snapshot
    // itself, or the essence would never converge.
    if let Some(annotations) = result
        .get_mut("metadata")
        .and_then(|m| m.get_mut("annotations"))
        .and_then(Value::as_object_mut)
    {
        annotations.remove(LAST_SEEN_ANNOTATION);
    }
    Value::Object(result)
}

fn put(map: &mut Map<String, Value>, path: &[String], value: Value) {
    let Some((last, parents)) = path.split_last() else {
        return;
    };
    let mut current = map;
    for key in parents {
        let entry = current
            .entry(key.clone())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        current = entry.as_object_mut().expect("just replaced with an object");
    }
    current.insert(last.clone(), value);
}

/// Whether a last-seen snapshot is stored on the body.
pub fn has_essence_stored(body: &Body) -> bool {
    body.annotation(LAST_SEEN_ANNOTATION).is_some()
}

/// Decode the stored snapshot. A corrupt annotation is treated as absent,
/// so the object is re-handled as newly created rather than crashing.
pub fn get_essence(body: &Body) -> Option<Value> {
    let raw = body.annotation(LAST_SEEN_ANNOTATION)?;
    serde_json::from_str(raw).ok()
}

/// Write the canonical JSON of the current essence into the annotation,
/// via the patch. Skipped when the stored value is already canonical.
pub fn refresh_essence(body: &Body, patch: &mut Patch, extra_fields: &[Vec<String>]) {
    let current = essence(body, extra_fields);
    let encoded = serde_json::to_string(&current).unwrap_or_default();
    if body.annotation(LAST_SEEN_ANNOTATION) != Some(encoded.as_str()) {
        patch.set(
            &["metadata", "annotations", LAST_SEEN_ANNOTATION],
            Value::String(encoded),
        );
    }
}

/// Decode the old essence, recompute the new one, and diff them.
pub fn get_essential_diffs(
    body: &Body,
    extra_fields: &[Vec<String>],
) -> (Option<Value>, Value, Diff) {
    let old = get_essence(body);
    let new = essence(body, extra_fields);
    let d = diff(old.as_ref(), Some(&new));
    (old, new, d)
}
