//! Invocation of one handler: the per-call context, sync/async dispatch,
//! and the sub-handler accumulation that [`execute`](crate::handling::execute)
//! drains.

use crate::causation::{Reason, ResourceChangingCause, ResourceWatchingCause, SharedPatch};
use crate::errors::{HandlerError, HandlerResult};
use crate::lifecycles::LifecycleFn;
use crate::registries::{Handler, HandlerFn, ResourceRegistry};
use chrono::{DateTime, Utc};
use opkit_core::diff::resolve;
use opkit_core::{Body, Diff, Resource};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// The sub-handler side of an invocation: the active lifecycle, a child
/// registry prefixed by the running handler's id, and the flag preventing
/// a second implicit drain.
pub(crate) struct SubHandlers {
    pub(crate) lifecycle: LifecycleFn,
    pub(crate) registry: Mutex<ResourceRegistry>,
    pub(crate) executed: AtomicBool,
}

/// Everything a handler sees about the cause it is invoked for.
///
/// Field handlers observe `old`/`new`/`diff` narrowed to their field.
/// Writes go through the shared `patch`; they accumulate across the cycle
/// and are flushed as one API call at its end.
#[derive(Clone)]
pub struct HandlerContext {
    pub resource: Resource,
    /// The classified reason; `None` for raw watching events.
    pub reason: Option<Reason>,
    pub initial: bool,
    pub body: Body,
    pub patch: SharedPatch,
    pub old: Option<Value>,
    pub new: Option<Value>,
    pub diff: Diff,
    /// How many times this handler failed before, for this cause.
    pub retry: u32,
    pub started: Option<DateTime<Utc>>,
    /// Wall-clock time since the handler first started, across retries.
    pub runtime: Duration,
    pub(crate) sub: Option<Arc<SubHandlers>>,
}

impl HandlerContext {
    pub fn spec(&self) -> Option<&Value> {
        self.body.spec()
    }

    pub fn status(&self) -> Option<&Value> {
        self.body.status()
    }

    pub fn meta(&self) -> Option<&Map<String, Value>> {
        self.body.meta()
    }

    pub fn uid(&self) -> Option<&str> {
        self.body.uid()
    }

    pub fn name(&self) -> Option<&str> {
        self.body.name()
    }

    pub fn namespace(&self) -> Option<&str> {
        self.body.namespace()
    }

    /// Accumulate a sub-handler; it runs within the same cycle, either via
    /// an explicit [`execute`](crate::handling::execute) call or implicitly
    /// when this handler returns. Only state-changing causes admit
    /// sub-handlers: raw event handlers have no retries or state tracking.
    pub fn register_subhandler(&self, handler: Handler) -> Result<(), HandlerError> {
        self.subhandlers()?
            .registry
            .lock()
            .register(handler)
            .map_err(|err| HandlerError::permanent(err.to_string()))
    }

    pub(crate) fn subhandlers(&self) -> Result<&Arc<SubHandlers>, HandlerError> {
        self.sub.as_ref().ok_or_else(|| {
            HandlerError::permanent(
                "sub-handlers of event handlers are not supported and have no practical use",
            )
        })
    }
}

/// Run the callable, off-loading blocking handlers to a worker thread so
/// that other objects keep progressing.
async fn dispatch(func: &HandlerFn, ctx: HandlerContext) -> HandlerResult {
    match func {
        HandlerFn::Async(f) => f(ctx).await,
        HandlerFn::Blocking(f) => {
            let f = f.clone();
            tokio::task::spawn_blocking(move || f(ctx))
                .await
                .map_err(|err| HandlerError::permanent(format!("handler aborted: {err}")))?
        }
    }
}

/// Invoke one handler for a state-changing cause.
///
/// Narrows the cause to the handler's field, sets up the sub-handler
/// context, calls the function, and drains any accumulated sub-handlers
/// implicitly if the handler did not do so itself. The result is returned
/// only once all children have finished on this same cycle.
pub(crate) async fn call_handler(
    handler: &Arc<Handler>,
    cause: &ResourceChangingCause,
    lifecycle: &LifecycleFn,
    retry: u32,
    started: Option<DateTime<Utc>>,
    runtime: Duration,
) -> HandlerResult {
    let (old, new, diff) = match &handler.field {
        Some(field) => (
            resolve(cause.old.as_ref(), field).cloned(),
            resolve(cause.new.as_ref(), field).cloned(),
            cause.diff.reduce(field),
        ),
        None => (cause.old.clone(), cause.new.clone(), cause.diff.clone()),
    };

    let sub = Arc::new(SubHandlers {
        lifecycle: lifecycle.clone(),
        registry: Mutex::new(ResourceRegistry::with_prefix(&handler.id)),
        executed: AtomicBool::new(false),
    });
    let ctx = HandlerContext {
        resource: cause.resource.clone(),
        reason: Some(cause.reason),
        initial: cause.initial,
        body: cause.body.clone(),
        patch: cause.patch.clone(),
        old,
        new,
        diff,
        retry,
        started,
        runtime,
        sub: Some(sub.clone()),
    };

    let result = dispatch(&handler.func, ctx.clone()).await?;

    if !sub.executed.load(Ordering::SeqCst) {
        crate::handling::execute(&ctx).await?;
    }

    Ok(result)
}

/// Invoke one handler for a raw watching event: no retries, no progress,
/// no sub-handlers.
pub(crate) async fn call_watching_handler(
    handler: &Arc<Handler>,
    cause: &ResourceWatchingCause,
) -> HandlerResult {
    let ctx = HandlerContext {
        resource: cause.resource.clone(),
        reason: None,
        initial: false,
        body: cause.body.clone(),
        patch: cause.patch.clone(),
        old: None,
        new: None,
        diff: Diff::default(),
        retry: 0,
        started: None,
        runtime: Duration::ZERO,
        sub: None,
    };
    dispatch(&handler.func, ctx).await
}

#[cfg(test)]
mod tests {
    use super::call_handler;
    use crate::causation::Reason;
    use crate::errors::HandlerError;
    use crate::lifecycles::all_at_once;
    use crate::registries::{Handler, HandlerFn};
    use crate::testing::changing_cause;
    use opkit_core::diff::diff;
    use opkit_core::{Body, Resource};
    use parking_lot::Mutex;
    use serde_json::{json, Value};
    use std::sync::Arc;
    use std::time::Duration;

    fn body() -> Body {
        Body::new(json!({
            "metadata": {"uid": "uid", "name": "name", "namespace": "ns"},
            "spec": {"field": "value", "lst": [1, 2]},
            "status": {"info": "payload"},
        }))
    }

    #[tokio::test]
    async fn context_exposes_the_conventional_sections() {
        let seen: Arc<Mutex<Option<(String, String, String, Value)>>> =
            Arc::new(Mutex::new(None));
        let seen2 = seen.clone();
        let func = HandlerFn::from_async(move |ctx: super::HandlerContext| {
            let seen = seen2.clone();
            async move {
                *seen.lock() = Some((
                    ctx.uid().unwrap().to_string(),
                    ctx.name().unwrap().to_string(),
                    ctx.namespace().unwrap().to_string(),
                    ctx.spec().cloned().unwrap(),
                ));
                Ok(None)
            }
        });
        let handler = Arc::new(Handler::new("h", func));
        let cause = changing_cause(
            Resource::new("example.com", "v1", "widgets"),
            Reason::Create,
            body(),
        );
        let lifecycle = all_at_once();
        call_handler(&handler, &cause, &lifecycle, 0, None, Duration::ZERO)
            .await
            .unwrap();
        let (uid, name, ns, spec) = seen.lock().clone().unwrap();
        assert_eq!(uid, "uid");
        assert_eq!(name, "name");
        assert_eq!(ns, "ns");
        assert_eq!(spec, json!({"field": "value", "lst": [1, 2]}));
    }

    #[tokio::test]
    async fn blocking_handlers_return_results_too() {
        let func = HandlerFn::from_blocking(|_ctx| Ok(Some(json!(999))));
        let handler = Arc::new(Handler::new("h", func));
        let cause = changing_cause(
            Resource::new("example.com", "v1", "widgets"),
            Reason::Create,
            body(),
        );
        let lifecycle = all_at_once();
        let result = call_handler(&handler, &cause, &lifecycle, 0, None, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(result, Some(json!(999)));
    }

    #[tokio::test]
    async fn field_handlers_observe_the_narrowed_values() {
        let seen: Arc<Mutex<Option<(Option<Value>, Option<Value>, usize)>>> =
            Arc::new(Mutex::new(None));
        let seen2 = seen.clone();
        let func = HandlerFn::from_async(move |ctx: super::HandlerContext| {
            let seen = seen2.clone();
            async move {
                *seen.lock() = Some((ctx.old.clone(), ctx.new.clone(), ctx.diff.len()));
                Ok(None)
            }
        });
        let handler = Arc::new(Handler::new("h", func).with_field(&["spec", "lst"]));

        let old_state = json!({"spec": {"lst": [1]}});
        let new_state = json!({"spec": {"lst": [1, 2]}});
        let mut cause = changing_cause(
            Resource::new("example.com", "v1", "widgets"),
            Reason::Update,
            body(),
        );
        cause.old = Some(old_state.clone());
        cause.new = Some(new_state.clone());
        cause.diff = diff(Some(&old_state), Some(&new_state));

        let lifecycle = all_at_once();
        call_handler(&handler, &cause, &lifecycle, 0, None, Duration::ZERO)
            .await
            .unwrap();
        let (old, new, diff_len) = seen.lock().clone().unwrap();
        assert_eq!(old, Some(json!([1])));
        assert_eq!(new, Some(json!([1, 2])));
        assert_eq!(diff_len, 1);
    }

    #[tokio::test]
    async fn handler_errors_pass_through() {
        let func = HandlerFn::from_async(|_ctx| async {
            Err(HandlerError::temporary("not yet", Duration::from_secs(30)))
        });
        let handler = Arc::new(Handler::new("h", func));
        let cause = changing_cause(
            Resource::new("example.com", "v1", "widgets"),
            Reason::Create,
            body(),
        );
        let lifecycle = all_at_once();
        let err = call_handler(&handler, &cause, &lifecycle, 0, None, Duration::ZERO)
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::Temporary { .. }));
    }
}
