//! Conversion of low-level events to high-level causes, and handling them.
//!
//! The framework itself makes the necessary changes to the object (the
//! finalizer attachment, last-seen updates, and handler progress tracking),
//! thus provoking new watch events and further handling calls. Those
//! internal changes produce no essence difference and therefore do not
//! trigger the user handlers again.

use crate::causation::{
    detect_resource_changing_cause, detect_resource_watching_cause, Reason, ResourceChangingCause,
    SharedPatch,
};
use crate::client::{ClientError, RawEvent, ResourceClient};
use crate::config::{Settings, DEFAULT_RETRY_DELAY, WAITING_KEEPALIVE_INTERVAL};
use crate::errors::HandlerError;
use crate::invocation::{call_handler, call_watching_handler, HandlerContext};
use crate::lifecycles::LifecycleFn;
use crate::progress;
use crate::registries::{Handler, OperatorRegistry, ResourceRegistry};
use crate::utils::sleep_or_wait;
use chrono::Utc;
use futures::future::BoxFuture;
use futures::FutureExt;
use opkit_core::{finalizers, lastseen, Body, Patch, Resource};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, error, info, Instrument};

/// Internal signal: the current cycle must be re-entered because some
/// handlers are unfinished. A `None` delay means immediately, provoked by
/// the patch-induced watch event.
#[derive(Debug)]
pub(crate) struct ChildrenRetry {
    pub(crate) delay: Option<Duration>,
}

impl From<ChildrenRetry> for HandlerError {
    fn from(retry: ChildrenRetry) -> Self {
        HandlerError::ChildrenRetry { delay: retry.delay }
    }
}

/// Handle a single low-level watch event for one object.
///
/// Invokes the silent watching handlers, detects the state-changing cause
/// and runs its handlers, applies the accumulated patch in one API call,
/// and finally sleeps for the delayed handlers: interruptibly, and with a
/// dummy patch afterwards to provoke the next cycle.
#[allow(clippy::too_many_arguments)]
pub async fn process_resource_event<C>(
    lifecycle: &LifecycleFn,
    registry: &OperatorRegistry,
    settings: &Settings,
    client: &C,
    resource: &Resource,
    event: RawEvent,
    initial: bool,
    replenished: &Notify,
) -> Result<(), ClientError>
where
    C: ResourceClient + ?Sized,
{
    let body = event.object.clone();
    let span = tracing::debug_span!(
        "object",
        resource = %resource,
        uid = body.uid().unwrap_or(""),
        name = body.name().unwrap_or(""),
        namespace = body.namespace().unwrap_or(""),
    );

    async move {
        let patch: SharedPatch = Arc::new(Mutex::new(Patch::new()));
        let mut delay = None;

        // Invoke all silent spies. No causation, no progress storage.
        if registry.has_resource_watching_handlers(resource) {
            let watching_cause = detect_resource_watching_cause(&event, resource, patch.clone());
            handle_resource_watching_cause(registry, &watching_cause).await;
        }

        if registry.has_resource_changing_handlers(resource) {
            let extra_fields = registry.get_extra_fields(resource);
            let (old, new, diff) = lastseen::get_essential_diffs(&body, &extra_fields);
            let changing_cause = detect_resource_changing_cause(
                &event,
                resource,
                patch.clone(),
                registry.requires_finalizer(resource, &body),
                initial,
                old,
                Some(new),
                diff,
            );
            delay =
                handle_resource_changing_cause(lifecycle, registry, &changing_cause, settings)
                    .await;
        }

        // Whatever was done, apply the accumulated changes to the object,
        // but only once, to reduce the API calls and the irrelevant events.
        let accumulated = std::mem::take(&mut *patch.lock());
        if !accumulated.is_empty() {
            debug!(patch = %serde_json::to_string(&accumulated).unwrap_or_default(), "Patching the object.");
            client.patch(resource, &body, &accumulated).await?;
        }

        // Sleep strictly after patching, never before. The patch above, if
        // any, provokes a new watch event instantly, so the sleep is skipped.
        if let Some(delay) = delay {
            if accumulated.is_empty() {
                debug!(?delay, "Sleeping for the delayed handlers.");
                match sleep_or_wait(delay, replenished).await {
                    Some(unslept) => {
                        debug!(?unslept, "Sleeping was interrupted by new changes.");
                    }
                    None => {
                        let mut dummy = Patch::new();
                        dummy.set(
                            &["status", "opkit", "dummy"],
                            Value::String(progress::now_iso()),
                        );
                        debug!("Provoking reaction with a dummy patch.");
                        client.patch(resource, &body, &dummy).await?;
                    }
                }
            }
        }
        Ok(())
    }
    .instrument(span)
    .await
}

/// Handle a raw watch event: log but ignore all errors, never retry.
pub async fn handle_resource_watching_cause(
    registry: &OperatorRegistry,
    cause: &crate::causation::ResourceWatchingCause,
) {
    for handler in registry.get_resource_watching_handlers(cause) {
        debug!(id = %handler.id, "Invoking handler.");
        match call_watching_handler(&handler, cause).await {
            Ok(result) => {
                info!(id = %handler.id, "Handler succeeded.");
                progress::store_result(&mut cause.patch.lock(), &handler.id, result);
            }
            Err(err) => {
                error!(id = %handler.id, error = %err, "Handler failed with an exception. Will ignore.");
            }
        }
    }
}

/// Handle a detected state-changing cause, returning the sleep the caller
/// should take when nothing else provokes the next cycle.
pub async fn handle_resource_changing_cause(
    lifecycle: &LifecycleFn,
    registry: &OperatorRegistry,
    cause: &ResourceChangingCause,
    settings: &Settings,
) -> Option<Duration> {
    let mut delay = None;
    let mut done = false;
    let mut skip = false;

    // Regular causes invoke the handlers.
    if cause.reason.is_handler_reason() {
        debug!(title = cause.reason.title(), "Handling the event.");
        if !cause.diff.is_empty() && cause.old.is_some() && cause.new.is_some() {
            debug!(diff = ?cause.diff, "Detected differences.");
        }
        let handlers = registry.get_resource_changing_handlers(cause);
        if handlers.is_empty() {
            skip = true;
        } else {
            match execute_handlers(lifecycle, handlers, cause, settings.retry_on_errors).await {
                Ok(()) => {
                    info!(title = cause.reason.title(), "All handlers succeeded.");
                    done = true;
                }
                Err(retry) => {
                    delay = retry.delay;
                }
            }
        }
    }

    // Regular causes also do some implicit post-handling when all is done.
    if done || skip {
        let extra_fields = registry.get_extra_fields(&cause.resource);
        let mut patch = cause.patch.lock();
        lastseen::refresh_essence(&cause.body, &mut patch, &extra_fields);
        if done {
            progress::purge_progress(&cause.body, &mut patch);
        }
        if cause.reason == Reason::Delete {
            debug!("Removing the finalizer, thus allowing the actual deletion.");
            finalizers::remove_finalizer(&cause.body, &mut patch);
        }
    }

    match cause.reason {
        Reason::Gone => {
            debug!("Deleted, really deleted, and we are notified.");
        }
        Reason::Free => {
            debug!("Deletion event, but we are done with it, and we do not care.");
        }
        Reason::Noop => {
            debug!("Something has changed, but we are not interested (the essence is the same).");
        }
        Reason::Acquire => {
            debug!("Adding the finalizer, thus preventing the actual deletion.");
            finalizers::append_finalizer(&cause.body, &mut cause.patch.lock());
        }
        Reason::Release => {
            debug!("Removing the finalizer, as there are no handlers requiring it.");
            finalizers::remove_finalizer(&cause.body, &mut cause.patch.lock());
        }
        _ => {}
    }

    delay
}

/// Execute the sub-handlers accumulated by the current handler.
///
/// If a handler returns without calling this, the invoker calls it
/// implicitly, exactly once. Either way, the children run within the same
/// cycle, and an unfinished child surfaces as
/// [`HandlerError::ChildrenRetry`] through the parent.
pub async fn execute(ctx: &HandlerContext) -> Result<(), HandlerError> {
    let sub = ctx.subhandlers()?;
    sub.executed.store(true, std::sync::atomic::Ordering::SeqCst);
    let registry = sub.registry.lock().clone();
    let lifecycle = sub.lifecycle.clone();
    execute_with(ctx, &registry, Some(lifecycle)).await
}

/// Execute an explicit set of handlers within the current handler's cycle.
pub async fn execute_with(
    ctx: &HandlerContext,
    registry: &ResourceRegistry,
    lifecycle: Option<LifecycleFn>,
) -> Result<(), HandlerError> {
    let Some(reason) = ctx.reason else {
        return Err(HandlerError::permanent(
            "sub-handlers of event handlers are not supported and have no practical use",
        ));
    };
    let lifecycle = match lifecycle {
        Some(lifecycle) => lifecycle,
        None => ctx.subhandlers()?.lifecycle.clone(),
    };
    let cause = ResourceChangingCause {
        resource: ctx.resource.clone(),
        reason,
        initial: ctx.initial,
        body: ctx.body.clone(),
        patch: ctx.patch.clone(),
        old: ctx.old.clone(),
        new: ctx.new.clone(),
        diff: ctx.diff.clone(),
    };
    let handlers = registry.get_resource_changing_handlers(&cause);
    execute_handlers(&lifecycle, handlers, &cause, true)
        .await
        .map_err(HandlerError::from)
}

/// Call the next handler(s) from the chain of handlers of one cause.
///
/// Keeps the record of the progression in the object's status, and uses it
/// on the next cycles to determine which handlers are left to call. Exits
/// normally when all handlers for this cause are fully done; returns
/// [`ChildrenRetry`] when the cycle must be re-entered.
pub(crate) fn execute_handlers<'a>(
    lifecycle: &'a LifecycleFn,
    handlers: Vec<Arc<Handler>>,
    cause: &'a ResourceChangingCause,
    retry_on_errors: bool,
) -> BoxFuture<'a, Result<(), ChildrenRetry>> {
    async move {
        let body: &Body = &cause.body;

        // Partition by the persisted progress: finished, sleeping, awakened.
        let mut handlers_wait: Vec<Arc<Handler>> = Vec::new();
        let mut handlers_todo: Vec<Arc<Handler>> = Vec::new();
        for handler in &handlers {
            let patch = cause.patch.lock();
            if progress::is_finished(body, &patch, &handler.id) {
                // Terminal; never re-invoked for the same cause.
            } else if progress::is_sleeping(body, &patch, &handler.id) {
                handlers_wait.push(handler.clone());
            } else {
                handlers_todo.push(handler.clone());
            }
        }

        let handlers_plan = (lifecycle)(&handlers_todo, cause);
        let plan_ids: HashSet<&str> = handlers_plan.iter().map(|h| h.id.as_str()).collect();
        let mut handlers_left: Vec<String> = handlers_todo
            .iter()
            .filter(|h| !plan_ids.contains(h.id.as_str()))
            .map(|h| h.id.clone())
            .collect();

        // Stamp the start times, even for handlers not selected this time.
        for handler in &handlers {
            let mut patch = cause.patch.lock();
            progress::set_start_time(body, &mut patch, &handler.id);
        }

        // Execute all planned handlers in one cycle, sequentially per object.
        for handler in &handlers_plan {
            let (retry, started) = {
                let patch = cause.patch.lock();
                (
                    progress::get_retry_count(body, &patch, &handler.id),
                    progress::get_start_time(body, &patch, &handler.id),
                )
            };
            let now = Utc::now();
            let runtime = started
                .map(|s| (now - s).to_std().unwrap_or_default())
                .unwrap_or_default();

            debug!(id = %handler.id, "Invoking handler.");
            let outcome = if handler.timeout.is_some_and(|t| runtime > t) {
                Err(HandlerError::permanent(format!(
                    "Handler {:?} has timed out after {:?}.",
                    handler.id, runtime
                )))
            } else {
                call_handler(handler, cause, lifecycle, retry, started, runtime).await
            };

            match outcome {
                // Unfinished children cause a regular retry, with less noise.
                Err(HandlerError::ChildrenRetry { delay }) => {
                    debug!(id = %handler.id, "Handler has unfinished sub-handlers. Will retry soon.");
                    let mut patch = cause.patch.lock();
                    progress::set_retry_time(body, &mut patch, &handler.id, delay);
                    handlers_left.push(handler.id.clone());
                }
                Err(HandlerError::Temporary { message, delay }) => {
                    error!(id = %handler.id, %message, "Handler failed temporarily.");
                    let mut patch = cause.patch.lock();
                    progress::set_retry_time(body, &mut patch, &handler.id, Some(delay));
                    handlers_left.push(handler.id.clone());
                }
                Err(HandlerError::Permanent { message }) => {
                    error!(id = %handler.id, %message, "Handler failed permanently.");
                    let mut patch = cause.patch.lock();
                    progress::store_failure(body, &mut patch, &handler.id, &message);
                }
                // Regular errors are temporary or permanent per the strictness.
                Err(HandlerError::Other(err)) => {
                    let mut patch = cause.patch.lock();
                    if retry_on_errors {
                        error!(id = %handler.id, error = %err, "Handler failed with an exception. Will retry.");
                        progress::set_retry_time(
                            body,
                            &mut patch,
                            &handler.id,
                            Some(DEFAULT_RETRY_DELAY),
                        );
                        handlers_left.push(handler.id.clone());
                    } else {
                        error!(id = %handler.id, error = %err, "Handler failed with an exception. Will stop.");
                        progress::store_failure(body, &mut patch, &handler.id, &err.to_string());
                    }
                }
                Ok(result) => {
                    info!(id = %handler.id, "Handler succeeded.");
                    let mut patch = cause.patch.lock();
                    progress::store_success(body, &mut patch, &handler.id, result);
                }
            }
        }

        // Provoke a re-cycle if any handlers were not selected or need a
        // retry: the progress writes in the patch trigger it naturally.
        if !handlers_left.is_empty() {
            return Err(ChildrenRetry { delay: None });
        }

        // If handlers are delayed, block this object's cycle until the
        // soonest awake time, with periodic keep-alive wake-ups.
        if !handlers_wait.is_empty() {
            let now = Utc::now();
            let keepalive = chrono::TimeDelta::from_std(WAITING_KEEPALIVE_INTERVAL)
                .unwrap_or(chrono::TimeDelta::MAX);
            let limit = now
                .checked_add_signed(keepalive)
                .unwrap_or(chrono::DateTime::<Utc>::MAX_UTC);
            let soonest = handlers_wait
                .iter()
                .filter_map(|h| {
                    let patch = cause.patch.lock();
                    progress::get_awake_time(body, &patch, &h.id)
                })
                .min()
                .unwrap_or(limit)
                .min(limit);
            let delay = (soonest - now).to_std().unwrap_or_default();
            return Err(ChildrenRetry { delay: Some(delay) });
        }

        Ok(())
    }
    .boxed()
}
