//! Lifecycle policies: which of the awakened handlers run on this cycle.
//!
//! A policy is a pure function of the awakened handlers and the cause
//! (up to explicit randomness), and must return a subset of its input.

use crate::causation::ResourceChangingCause;
use crate::progress;
use crate::registries::Handler;
use rand::seq::{IndexedRandom, SliceRandom};
use std::sync::Arc;

/// Selects the subset of awakened handlers to run on one cycle.
pub type LifecycleFn =
    Arc<dyn Fn(&[Arc<Handler>], &ResourceChangingCause) -> Vec<Arc<Handler>> + Send + Sync>;

/// Execute all handlers at once, in registration order.
pub fn all_at_once() -> LifecycleFn {
    Arc::new(|handlers, _cause| handlers.to_vec())
}

/// Execute just one handler at a time, in registration order.
pub fn one_by_one() -> LifecycleFn {
    Arc::new(|handlers, _cause| handlers.first().cloned().into_iter().collect())
}

/// Execute one handler at a time, in a random order.
pub fn randomized() -> LifecycleFn {
    Arc::new(|handlers, _cause| {
        handlers
            .choose(&mut rand::rng())
            .cloned()
            .into_iter()
            .collect()
    })
}

/// Execute all handlers at once, but in a random order.
pub fn shuffled() -> LifecycleFn {
    Arc::new(|handlers, _cause| {
        let mut shuffled = handlers.to_vec();
        shuffled.shuffle(&mut rand::rng());
        shuffled
    })
}

/// Execute the least-retried handler first: i.e. finish the fresh handlers
/// as soon as possible, postponing the failing ones.
pub fn asap() -> LifecycleFn {
    Arc::new(|handlers, cause| {
        let patch = cause.patch.lock();
        handlers
            .iter()
            .min_by_key(|h| progress::get_retry_count(&cause.body, &patch, &h.id))
            .cloned()
            .into_iter()
            .collect()
    })
}

/// The default policy when none is configured.
pub fn default_lifecycle() -> LifecycleFn {
    asap()
}

#[cfg(test)]
mod tests {
    use super::{all_at_once, asap, default_lifecycle, one_by_one, randomized, shuffled};
    use crate::causation::Reason;
    use crate::testing::{changing_cause, noop_fn};
    use crate::registries::Handler;
    use opkit_core::{Body, Resource};
    use serde_json::json;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn handlers(ids: &[&str]) -> Vec<Arc<Handler>> {
        ids.iter()
            .map(|id| Arc::new(Handler::new(*id, noop_fn())))
            .collect()
    }

    fn cause(body: Body) -> crate::causation::ResourceChangingCause {
        changing_cause(Resource::new("example.com", "v1", "widgets"), Reason::Create, body)
    }

    #[test]
    fn every_policy_accepts_empty_input() {
        let cause = cause(Body::new(json!({})));
        for policy in [all_at_once(), one_by_one(), randomized(), shuffled(), asap()] {
            assert!(policy(&[], &cause).is_empty());
        }
    }

    #[test]
    fn every_policy_returns_a_subset() {
        let cause = cause(Body::new(json!({})));
        let all = handlers(&["a", "b", "c"]);
        let all_ids: HashSet<&str> = all.iter().map(|h| h.id.as_str()).collect();
        for policy in [all_at_once(), one_by_one(), randomized(), shuffled(), asap()] {
            let selected = policy(&all, &cause);
            assert!(selected.iter().all(|h| all_ids.contains(h.id.as_str())));
            assert!(selected.len() <= all.len());
        }
    }

    #[test]
    fn all_at_once_keeps_registration_order() {
        let cause = cause(Body::new(json!({})));
        let all = handlers(&["a", "b", "c"]);
        let ids: Vec<_> = all_at_once()(&all, &cause).iter().map(|h| h.id.clone()).collect();
        assert_eq!(ids, ["a", "b", "c"]);
    }

    #[test]
    fn one_by_one_takes_the_first_registered() {
        let cause = cause(Body::new(json!({})));
        let all = handlers(&["a", "b"]);
        let selected = one_by_one()(&all, &cause);
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].id, "a");
    }

    #[test]
    fn shuffled_keeps_all_handlers() {
        let cause = cause(Body::new(json!({})));
        let all = handlers(&["a", "b", "c"]);
        let selected = shuffled()(&all, &cause);
        let ids: HashSet<_> = selected.iter().map(|h| h.id.clone()).collect();
        assert_eq!(ids.len(), 3);
    }

    #[test]
    fn asap_prefers_the_least_retried_handler() {
        let body = Body::new(json!({
            "status": {"opkit": {"progress": {
                "a": {"retries": 5},
                "b": {"retries": 1},
                "c": {"retries": 3},
            }}},
        }));
        let cause = cause(body);
        let all = handlers(&["a", "b", "c"]);
        let selected = asap()(&all, &cause);
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].id, "b");
    }

    #[test]
    fn default_policy_is_asap() {
        let body = Body::new(json!({
            "status": {"opkit": {"progress": {"a": {"retries": 2}}}},
        }));
        let cause = cause(body);
        let all = handlers(&["a", "b"]);
        let selected = default_lifecycle()(&all, &cause);
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].id, "b");
    }
}
