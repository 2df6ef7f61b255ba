//! Handler registration and selection.
//!
//! A [`ResourceRegistry`] is a flat, ordered list of handlers for one
//! resource kind; an [`OperatorRegistry`] maps resource kinds to their
//! registries. Handlers are immutable once registered, and the registries
//! are read-only after operator startup.

use crate::causation::{Reason, ResourceChangingCause, ResourceWatchingCause};
use crate::errors::HandlerResult;
use crate::invocation::HandlerContext;
use futures::future::BoxFuture;
use opkit_core::Body;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use opkit_core::Resource;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("handler id {id:?} is already registered")]
    DuplicateId { id: String },
}

/// The registered callable: either async-capable, or blocking.
///
/// Blocking handlers are off-loaded to a worker thread so that they never
/// stall the cooperative scheduler of other objects.
#[derive(Clone)]
pub enum HandlerFn {
    Async(Arc<dyn Fn(HandlerContext) -> BoxFuture<'static, HandlerResult> + Send + Sync>),
    Blocking(Arc<dyn Fn(HandlerContext) -> HandlerResult + Send + Sync>),
}

impl HandlerFn {
    pub fn from_async<F, Fut>(f: F) -> Self
    where
        F: Fn(HandlerContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        Self::Async(Arc::new(move |ctx| Box::pin(f(ctx))))
    }

    pub fn from_blocking<F>(f: F) -> Self
    where
        F: Fn(HandlerContext) -> HandlerResult + Send + Sync + 'static,
    {
        Self::Blocking(Arc::new(f))
    }
}

impl fmt::Debug for HandlerFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandlerFn::Async(_) => f.write_str("HandlerFn::Async(..)"),
            HandlerFn::Blocking(_) => f.write_str("HandlerFn::Blocking(..)"),
        }
    }
}

/// A label or annotation selector: presence, or exact equality.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector {
    Exists,
    Equals(String),
}

impl Selector {
    fn matches(&self, actual: Option<&str>) -> bool {
        match self {
            Selector::Exists => actual.is_some(),
            Selector::Equals(expected) => actual == Some(expected.as_str()),
        }
    }
}

/// One registered handler. Immutable once registered.
#[derive(Debug, Clone)]
pub struct Handler {
    /// Unique within its registry; sub-handler ids are prefixed with the
    /// parent handler's id.
    pub id: String,
    pub func: HandlerFn,
    /// `None` makes the handler reason-agnostic: it runs on every
    /// handler-bearing reason.
    pub reason: Option<Reason>,
    /// Narrows the handler to one field: it only runs when the field
    /// changed, and observes field-local `old`/`new`/`diff`.
    pub field: Option<Vec<String>>,
    /// Total runtime allowed across retries; exceeding it is a permanent
    /// failure.
    pub timeout: Option<Duration>,
    /// Restricts the handler to causes from the initial listing.
    pub initial: bool,
    pub labels: BTreeMap<String, Selector>,
    pub annotations: BTreeMap<String, Selector>,
}

impl Handler {
    pub fn new(id: impl Into<String>, func: HandlerFn) -> Self {
        Self {
            id: id.into(),
            func,
            reason: None,
            field: None,
            timeout: None,
            initial: false,
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_reason(mut self, reason: Reason) -> Self {
        self.reason = Some(reason);
        self
    }

    #[must_use]
    pub fn with_field(mut self, field: &[&str]) -> Self {
        self.field = Some(field.iter().map(|p| (*p).to_string()).collect());
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn with_initial(mut self) -> Self {
        self.initial = true;
        self
    }

    #[must_use]
    pub fn with_label(mut self, key: impl Into<String>, selector: Selector) -> Self {
        self.labels.insert(key.into(), selector);
        self
    }

    #[must_use]
    pub fn with_annotation(mut self, key: impl Into<String>, selector: Selector) -> Self {
        self.annotations.insert(key.into(), selector);
        self
    }
}

fn matches_selectors(
    selectors: &BTreeMap<String, Selector>,
    actual: Option<&Map<String, Value>>,
) -> bool {
    selectors.iter().all(|(key, selector)| {
        selector.matches(actual.and_then(|m| m.get(key)).and_then(Value::as_str))
    })
}

fn matches_body(handler: &Handler, body: &Body) -> bool {
    matches_selectors(&handler.labels, body.labels())
        && matches_selectors(&handler.annotations, body.annotations())
}

/// A flat list of handlers for one resource kind, in registration order.
#[derive(Debug, Clone, Default)]
pub struct ResourceRegistry {
    prefix: Option<String>,
    handlers: Vec<Arc<Handler>>,
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry whose handler ids are prefixed, as used for sub-handlers.
    pub fn with_prefix(prefix: &str) -> Self {
        Self {
            prefix: Some(prefix.to_string()),
            handlers: Vec::new(),
        }
    }

    /// Register a handler, applying the registry's id prefix.
    pub fn register(&mut self, mut handler: Handler) -> Result<(), RegistryError> {
        if let Some(prefix) = &self.prefix {
            handler.id = format!("{prefix}/{}", handler.id);
        }
        self.append(Arc::new(handler))
    }

    /// Append a pre-built handler as-is, without prefixing.
    pub fn append(&mut self, handler: Arc<Handler>) -> Result<(), RegistryError> {
        if self.handlers.iter().any(|h| h.id == handler.id) {
            return Err(RegistryError::DuplicateId {
                id: handler.id.clone(),
            });
        }
        self.handlers.push(handler);
        Ok(())
    }

    pub fn handlers(&self) -> &[Arc<Handler>] {
        &self.handlers
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Handlers applicable to a state-changing cause, in registration order.
    pub fn get_resource_changing_handlers(
        &self,
        cause: &ResourceChangingCause,
    ) -> Vec<Arc<Handler>> {
        self.handlers
            .iter()
            .filter(|handler| {
                if let Some(reason) = handler.reason {
                    if reason != cause.reason {
                        return false;
                    }
                }
                if handler.initial && !cause.initial {
                    return false;
                }
                if !matches_body(handler, &cause.body) {
                    return false;
                }
                if let Some(field) = &handler.field {
                    if cause.diff.reduce(field).is_empty() {
                        return false;
                    }
                }
                true
            })
            .cloned()
            .collect()
    }

    /// Handlers applicable to a raw watch event. Only the label and
    /// annotation selectors apply; there is no reason or field semantics.
    pub fn get_resource_watching_handlers(
        &self,
        cause: &ResourceWatchingCause,
    ) -> Vec<Arc<Handler>> {
        self.handlers
            .iter()
            .filter(|handler| matches_body(handler, &cause.body))
            .cloned()
            .collect()
    }

    /// Whether any delete handler matches the body, thus requiring the
    /// finalizer to block the actual deletion.
    pub fn requires_finalizer(&self, body: &Body) -> bool {
        self.handlers
            .iter()
            .any(|handler| handler.reason == Some(Reason::Delete) && matches_body(handler, body))
    }

    /// Field paths of all field handlers, for essence computation.
    pub fn get_extra_fields(&self) -> Vec<Vec<String>> {
        let mut fields: Vec<Vec<String>> = self
            .handlers
            .iter()
            .filter_map(|handler| handler.field.clone())
            .collect();
        fields.sort();
        fields.dedup();
        fields
    }
}

/// Registries of all resource kinds served by one operator.
#[derive(Debug, Default)]
pub struct OperatorRegistry {
    changing: HashMap<Resource, ResourceRegistry>,
    watching: HashMap<Resource, ResourceRegistry>,
    extra_fields: HashMap<Resource, Vec<Vec<String>>>,
}

impl OperatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_changing(
        &mut self,
        resource: &Resource,
        handler: Handler,
    ) -> Result<(), RegistryError> {
        self.changing
            .entry(resource.clone())
            .or_default()
            .register(handler)
    }

    pub fn register_watching(
        &mut self,
        resource: &Resource,
        handler: Handler,
    ) -> Result<(), RegistryError> {
        self.watching
            .entry(resource.clone())
            .or_default()
            .register(handler)
    }

    /// Declare an extra field to be included into the essence, beyond the
    /// field handlers' own paths.
    pub fn declare_extra_field(&mut self, resource: &Resource, field: &[&str]) {
        self.extra_fields
            .entry(resource.clone())
            .or_default()
            .push(field.iter().map(|p| (*p).to_string()).collect());
    }

    /// All resource kinds with any handlers, each listed once.
    pub fn resources(&self) -> Vec<Resource> {
        let mut resources: Vec<Resource> = self
            .changing
            .keys()
            .chain(self.watching.keys())
            .cloned()
            .collect();
        resources.sort();
        resources.dedup();
        resources
    }

    pub fn has_resource_changing_handlers(&self, resource: &Resource) -> bool {
        self.changing.get(resource).is_some_and(|r| !r.is_empty())
    }

    pub fn has_resource_watching_handlers(&self, resource: &Resource) -> bool {
        self.watching.get(resource).is_some_and(|r| !r.is_empty())
    }

    pub fn get_resource_changing_handlers(
        &self,
        cause: &ResourceChangingCause,
    ) -> Vec<Arc<Handler>> {
        self.changing
            .get(&cause.resource)
            .map(|r| r.get_resource_changing_handlers(cause))
            .unwrap_or_default()
    }

    pub fn get_resource_watching_handlers(
        &self,
        cause: &ResourceWatchingCause,
    ) -> Vec<Arc<Handler>> {
        self.watching
            .get(&cause.resource)
            .map(|r| r.get_resource_watching_handlers(cause))
            .unwrap_or_default()
    }

    pub fn requires_finalizer(&self, resource: &Resource, body: &Body) -> bool {
        self.changing
            .get(resource)
            .is_some_and(|r| r.requires_finalizer(body))
    }

    /// Union of the field handlers' paths and the declared extras.
    pub fn get_extra_fields(&self, resource: &Resource) -> Vec<Vec<String>> {
        let mut fields = self
            .changing
            .get(resource)
            .map(ResourceRegistry::get_extra_fields)
            .unwrap_or_default();
        if let Some(extras) = self.extra_fields.get(resource) {
            fields.extend(extras.iter().cloned());
        }
        fields.sort();
        fields.dedup();
        fields
    }
}

#[cfg(test)]
mod tests {
    use super::{Handler, HandlerFn, OperatorRegistry, RegistryError, ResourceRegistry, Selector};
    use crate::causation::{Reason, ResourceChangingCause};
    use crate::testing::{changing_cause, noop_fn};
    use opkit_core::diff::diff;
    use opkit_core::{Body, Resource};
    use serde_json::json;

    fn resource() -> Resource {
        Resource::new("example.com", "v1", "widgets")
    }

    fn cause_with_reason(reason: Reason) -> ResourceChangingCause {
        changing_cause(resource(), reason, Body::new(json!({"metadata": {"uid": "u"}})))
    }

    #[test]
    fn registration_preserves_order_and_rejects_duplicates() {
        let mut registry = ResourceRegistry::new();
        registry.register(Handler::new("a", noop_fn())).unwrap();
        registry.register(Handler::new("b", noop_fn())).unwrap();
        let err = registry.register(Handler::new("a", noop_fn())).unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateId { .. }));
        let ids: Vec<_> = registry.handlers().iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, ["a", "b"]);
    }

    #[test]
    fn prefixed_registries_namespace_their_ids() {
        let mut registry = ResourceRegistry::with_prefix("parent");
        registry.register(Handler::new("child", noop_fn())).unwrap();
        assert_eq!(registry.handlers()[0].id, "parent/child");
    }

    #[test]
    fn reason_agnostic_handlers_match_every_handler_reason() {
        let mut registry = ResourceRegistry::new();
        registry.register(Handler::new("any", noop_fn())).unwrap();
        for reason in [Reason::Create, Reason::Update, Reason::Delete, Reason::Resume] {
            let selected = registry.get_resource_changing_handlers(&cause_with_reason(reason));
            assert_eq!(selected.len(), 1, "for {reason}");
        }
    }

    #[test]
    fn reason_bound_handlers_match_only_their_reason() {
        let mut registry = ResourceRegistry::new();
        registry
            .register(Handler::new("on_create", noop_fn()).with_reason(Reason::Create))
            .unwrap();
        assert_eq!(
            registry
                .get_resource_changing_handlers(&cause_with_reason(Reason::Create))
                .len(),
            1
        );
        assert!(registry
            .get_resource_changing_handlers(&cause_with_reason(Reason::Update))
            .is_empty());
    }

    #[test]
    fn initial_handlers_are_skipped_for_non_initial_causes() {
        let mut registry = ResourceRegistry::new();
        registry
            .register(Handler::new("on_resume", noop_fn()).with_initial())
            .unwrap();
        let mut cause = cause_with_reason(Reason::Update);
        assert!(registry.get_resource_changing_handlers(&cause).is_empty());
        cause.initial = true;
        assert_eq!(registry.get_resource_changing_handlers(&cause).len(), 1);
    }

    #[test]
    fn label_selectors_filter_on_the_body() {
        let mut registry = ResourceRegistry::new();
        registry
            .register(
                Handler::new("labelled", noop_fn())
                    .with_label("app", Selector::Equals("demo".into()))
                    .with_label("tier", Selector::Exists),
            )
            .unwrap();

        let matching = changing_cause(
            resource(),
            Reason::Create,
            Body::new(json!({"metadata": {"labels": {"app": "demo", "tier": "web"}}})),
        );
        assert_eq!(registry.get_resource_changing_handlers(&matching).len(), 1);

        let wrong_value = changing_cause(
            resource(),
            Reason::Create,
            Body::new(json!({"metadata": {"labels": {"app": "other", "tier": "web"}}})),
        );
        assert!(registry.get_resource_changing_handlers(&wrong_value).is_empty());

        let missing_key = changing_cause(
            resource(),
            Reason::Create,
            Body::new(json!({"metadata": {"labels": {"app": "demo"}}})),
        );
        assert!(registry.get_resource_changing_handlers(&missing_key).is_empty());
    }

    #[test]
    fn field_handlers_need_a_non_empty_reduced_diff() {
        let mut registry = ResourceRegistry::new();
        registry
            .register(Handler::new("on_lst", noop_fn()).with_field(&["spec", "lst"]))
            .unwrap();

        let old = json!({"spec": {"lst": [1]}});
        let new = json!({"spec": {"lst": [1, 2]}});
        let mut cause = cause_with_reason(Reason::Update);
        cause.old = Some(old.clone());
        cause.new = Some(new.clone());
        cause.diff = diff(Some(&old), Some(&new));
        assert_eq!(registry.get_resource_changing_handlers(&cause).len(), 1);

        // An unrelated change does not select the field handler.
        let old = json!({"spec": {"other": 1}});
        let new = json!({"spec": {"other": 2}});
        cause.diff = diff(Some(&old), Some(&new));
        assert!(registry.get_resource_changing_handlers(&cause).is_empty());
    }

    #[test]
    fn requires_finalizer_iff_a_delete_handler_matches() {
        let mut registry = ResourceRegistry::new();
        registry
            .register(Handler::new("on_create", noop_fn()).with_reason(Reason::Create))
            .unwrap();
        let body = Body::new(json!({"metadata": {}}));
        assert!(!registry.requires_finalizer(&body));

        registry
            .register(
                Handler::new("on_delete", noop_fn())
                    .with_reason(Reason::Delete)
                    .with_label("app", Selector::Equals("demo".into())),
            )
            .unwrap();
        assert!(!registry.requires_finalizer(&body));
        let labelled = Body::new(json!({"metadata": {"labels": {"app": "demo"}}}));
        assert!(registry.requires_finalizer(&labelled));
    }

    #[test]
    fn operator_registry_routes_by_resource() {
        let mut registry = OperatorRegistry::new();
        let r1 = resource();
        let r2 = Resource::new("", "v1", "pods");
        registry.register_changing(&r1, Handler::new("c", noop_fn())).unwrap();
        registry.register_watching(&r2, Handler::new("w", noop_fn())).unwrap();

        assert!(registry.has_resource_changing_handlers(&r1));
        assert!(!registry.has_resource_changing_handlers(&r2));
        assert!(registry.has_resource_watching_handlers(&r2));
        assert_eq!(registry.resources(), vec![r2, r1]);
    }

    #[test]
    fn extra_fields_union_handler_paths_and_declared_extras() {
        let mut registry = OperatorRegistry::new();
        let r = resource();
        registry
            .register_changing(&r, Handler::new("f", noop_fn()).with_field(&["spec", "lst"]))
            .unwrap();
        registry.declare_extra_field(&r, &["status", "replicas"]);
        let fields = registry.get_extra_fields(&r);
        assert_eq!(
            fields,
            vec![
                vec!["spec".to_string(), "lst".to_string()],
                vec!["status".to_string(), "replicas".to_string()],
            ]
        );
    }

    #[test]
    fn handler_builder_records_all_attributes() {
        let handler = Handler::new("h", noop_fn())
            .with_reason(Reason::Create)
            .with_field(&["spec", "lst"])
            .with_timeout(std::time::Duration::from_secs(30))
            .with_initial()
            .with_annotation("owner", Selector::Exists);
        assert_eq!(handler.id, "h");
        assert_eq!(handler.reason, Some(Reason::Create));
        assert_eq!(handler.field.as_deref(), Some(&["spec".to_string(), "lst".to_string()][..]));
        assert_eq!(handler.timeout, Some(std::time::Duration::from_secs(30)));
        assert!(handler.initial);
        assert_eq!(handler.annotations.get("owner"), Some(&Selector::Exists));
    }

    #[test]
    fn noop_cause_with_empty_diff_skips_field_handlers() {
        let mut registry = ResourceRegistry::new();
        registry
            .register(Handler::new("on_lst", noop_fn()).with_field(&["spec", "lst"]))
            .unwrap();
        let cause = cause_with_reason(Reason::Noop);
        assert!(registry.get_resource_changing_handlers(&cause).is_empty());
    }
}
