//! Bookkeeping of the framework's own finalizer.
//!
//! Merge patches replace arrays wholesale, so every mutation carries the
//! full new finalizer list, preserving entries owned by other controllers.

use crate::body::Body;
use crate::patch::Patch;
use serde_json::Value;

/// The framework's token in `metadata.finalizers`.
pub const FINALIZER: &str = "opkit.dev/finalizer";

/// Whether the framework's finalizer is present on the body.
pub fn has_finalizer(body: &Body) -> bool {
    body.finalizers().contains(&FINALIZER)
}

/// Whether the object is marked for deletion and only waits for the
/// finalizers to be removed.
pub fn is_deletion_requested(body: &Body) -> bool {
    body.deletion_timestamp().is_some()
}

/// Append the framework's finalizer, keeping foreign entries. Idempotent.
pub fn append_finalizer(body: &Body, patch: &mut Patch) {
    if has_finalizer(body) {
        return;
    }
    let mut finalizers: Vec<Value> = body
        .finalizers()
        .into_iter()
        .map(|f| Value::String(f.to_string()))
        .collect();
    finalizers.push(Value::String(FINALIZER.to_string()));
    patch.set(&["metadata", "finalizers"], Value::Array(finalizers));
}

/// Remove the framework's finalizer, keeping foreign entries.
pub fn remove_finalizer(body: &Body, patch: &mut Patch) {
    if !has_finalizer(body) {
        return;
    }
    let finalizers: Vec<Value> = body
        .finalizers()
        .into_iter()
        .filter(|f| *f != FINALIZER)
        .map(|f| Value::String(f.to_string()))
        .collect();
    patch.set(&["metadata", "finalizers"], Value::Array(finalizers));
}

#[cfg(test)]
mod tests {
    use super::{
        append_finalizer, has_finalizer, is_deletion_requested, remove_finalizer, FINALIZER,
    };
    use crate::body::Body;
    use crate::patch::Patch;
    use serde_json::json;

    #[test]
    fn deletion_is_requested_only_with_a_real_timestamp() {
        let absent = Body::new(json!({"metadata": {}}));
        assert!(!is_deletion_requested(&absent));

        let null = Body::new(json!({"metadata": {"deletionTimestamp": null}}));
        assert!(!is_deletion_requested(&null));

        let set = Body::new(json!({"metadata": {"deletionTimestamp": "2020-01-01T00:00:00Z"}}));
        assert!(is_deletion_requested(&set));
    }

    #[test]
    fn append_keeps_foreign_finalizers() {
        let body = Body::new(json!({"metadata": {"finalizers": ["irrelevant"]}}));
        assert!(!has_finalizer(&body));
        let mut patch = Patch::new();
        append_finalizer(&body, &mut patch);
        assert_eq!(
            patch.get(&["metadata", "finalizers"]),
            Some(&json!(["irrelevant", FINALIZER]))
        );
    }

    #[test]
    fn append_is_idempotent() {
        let body = Body::new(json!({"metadata": {"finalizers": [FINALIZER]}}));
        assert!(has_finalizer(&body));
        let mut patch = Patch::new();
        append_finalizer(&body, &mut patch);
        assert!(patch.is_empty());
    }

    #[test]
    fn remove_keeps_foreign_finalizers() {
        let body = Body::new(json!({
            "metadata": {"finalizers": ["irrelevant", FINALIZER, "another"]},
        }));
        let mut patch = Patch::new();
        remove_finalizer(&body, &mut patch);
        assert_eq!(
            patch.get(&["metadata", "finalizers"]),
            Some(&json!(["irrelevant", "another"]))
        );
    }

    #[test]
    fn remove_without_ours_is_a_noop() {
        let body = Body::new(json!({"metadata": {"finalizers": ["irrelevant"]}}));
        let mut patch = Patch::new();
        remove_finalizer(&body, &mut patch);
        assert!(patch.is_empty());
    }
}
