//! The operator entry point: one reconnecting watch per registered
//! resource, each feeding its own demultiplexer, each event processed by
//! the handling engine.

use crate::client::ResourceClient;
use crate::config::Settings;
use crate::handling::process_resource_event;
use crate::lifecycles::{default_lifecycle, LifecycleFn};
use crate::queueing::{watcher, WatchEventHandler};
use crate::registries::OperatorRegistry;
use futures::FutureExt;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{error, info};

/// Build the queueing-to-handling bridge: a per-event callback that runs
/// one full handling cycle and logs its failures without dying.
pub fn event_handler<C>(
    client: Arc<C>,
    registry: Arc<OperatorRegistry>,
    settings: Settings,
    lifecycle: LifecycleFn,
) -> WatchEventHandler
where
    C: ResourceClient + 'static,
{
    Arc::new(move |resource, event, initial, replenished| {
        let client = client.clone();
        let registry = registry.clone();
        let settings = settings.clone();
        let lifecycle = lifecycle.clone();
        async move {
            let outcome = process_resource_event(
                &lifecycle,
                &registry,
                &settings,
                client.as_ref(),
                &resource,
                event,
                initial,
                &replenished,
            )
            .await;
            if let Err(err) = outcome {
                error!(error = %err, "Failed to process the event.");
            }
        }
        .boxed()
    })
}

/// Run the operator with the default lifecycle until cancelled.
pub async fn run<C>(client: Arc<C>, registry: Arc<OperatorRegistry>, settings: Settings)
where
    C: ResourceClient + 'static,
{
    run_with_lifecycle(client, registry, settings, default_lifecycle()).await;
}

/// Run the operator with an explicit lifecycle policy until cancelled.
///
/// Every registered resource gets its own watch; a disconnected watch is
/// logged and re-established after the configured retry delay. All state
/// lives on the objects themselves, so nothing is lost across reconnects.
pub async fn run_with_lifecycle<C>(
    client: Arc<C>,
    registry: Arc<OperatorRegistry>,
    settings: Settings,
    lifecycle: LifecycleFn,
) where
    C: ResourceClient + 'static,
{
    let mut tasks: JoinSet<()> = JoinSet::new();
    for resource in registry.resources() {
        let handler = event_handler(
            client.clone(),
            registry.clone(),
            settings.clone(),
            lifecycle.clone(),
        );
        let client = client.clone();
        let settings = settings.clone();
        tasks.spawn(async move {
            loop {
                let events = client.watch(&resource, None);
                watcher(resource.clone(), events, handler.clone(), settings.clone()).await;
                info!(resource = %resource, "Watch stream ended; reconnecting.");
                tokio::time::sleep(settings.watcher_retry_delay).await;
            }
        });
    }
    while tasks.join_next().await.is_some() {}
}

#[cfg(test)]
mod tests {
    use super::event_handler;
    use crate::causation::Reason;
    use crate::client::{RawEvent, RawEventType, WatchItem};
    use crate::config::Settings;
    use crate::lifecycles::all_at_once;
    use crate::queueing::watcher;
    use crate::registries::{Handler, OperatorRegistry};
    use crate::testing::{counting_fn, MockClient};
    use opkit_core::{Body, Resource, LAST_SEEN_ANNOTATION};
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    fn resource() -> Resource {
        Resource::new("example.com", "v1", "widgets")
    }

    fn settings() -> Settings {
        Settings::default()
            .with_worker_idle_timeout(Duration::from_millis(500))
            .with_worker_batch_window(Duration::from_millis(100))
    }

    #[tokio::test(start_paused = true)]
    async fn events_flow_from_the_watch_to_the_handlers_and_back_as_patches() {
        crate::testing::init_tracing();
        let mut registry = OperatorRegistry::new();
        let calls = Arc::new(Mutex::new(0));
        registry
            .register_changing(
                &resource(),
                Handler::new("create", counting_fn(calls.clone(), || Ok(None)))
                    .with_reason(Reason::Create),
            )
            .unwrap();

        let client = Arc::new(MockClient::new());
        let handler = event_handler(
            client.clone(),
            Arc::new(registry),
            settings(),
            all_at_once(),
        );

        let events = futures::stream::iter(vec![
            Ok(WatchItem::Bookmark),
            Ok(WatchItem::Event(RawEvent {
                type_: RawEventType::Added,
                object: Body::new(json!({"metadata": {"uid": "u1"}, "spec": {"x": 1}})),
            })),
        ]);
        watcher(resource(), events, handler, settings()).await;

        assert_eq!(*calls.lock(), 1);
        let patches = client.patch_values();
        assert_eq!(patches.len(), 1);
        assert_eq!(
            patches[0]["status"]["opkit"]["progress"],
            serde_json::Value::Null
        );
    }

    #[tokio::test(start_paused = true)]
    async fn pre_existing_objects_resume_on_operator_start() {
        let mut registry = OperatorRegistry::new();
        let resume_calls = Arc::new(Mutex::new(0));
        let update_calls = Arc::new(Mutex::new(0));
        registry
            .register_changing(
                &resource(),
                Handler::new("resume", counting_fn(resume_calls.clone(), || Ok(None)))
                    .with_reason(Reason::Resume),
            )
            .unwrap();
        registry
            .register_changing(
                &resource(),
                Handler::new("update", counting_fn(update_calls.clone(), || Ok(None)))
                    .with_reason(Reason::Update),
            )
            .unwrap();

        let client = Arc::new(MockClient::new());
        let handler = event_handler(
            client.clone(),
            Arc::new(registry),
            settings(),
            all_at_once(),
        );

        // Before the bookmark: a pre-existing, already-handled object.
        let events = futures::stream::iter(vec![Ok(WatchItem::Event(RawEvent {
            type_: RawEventType::Added,
            object: Body::new(json!({
                "metadata": {
                    "uid": "u1",
                    "annotations": {LAST_SEEN_ANNOTATION: r#"{"spec":{"x":1}}"#},
                },
                "spec": {"x": 1},
            })),
        }))]);
        watcher(resource(), events, handler, settings()).await;

        assert_eq!(*resume_calls.lock(), 1);
        assert_eq!(*update_calls.lock(), 0);
    }
}
