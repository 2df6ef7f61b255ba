//! Shared fixtures for the runtime tests.

use crate::causation::{Reason, ResourceChangingCause};
use crate::client::{ClientError, ResourceClient, WatchItem};
use crate::registries::HandlerFn;
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use opkit_core::{Body, Diff, Patch, Resource};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;

/// Route test logs through the captured test writer, once.
pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// A handler function that does nothing and succeeds.
pub(crate) fn noop_fn() -> HandlerFn {
    HandlerFn::from_async(|_ctx| async { Ok(None) })
}

/// A handler function that counts its calls and returns a fixed outcome.
pub(crate) fn counting_fn(
    calls: Arc<Mutex<u32>>,
    outcome: impl Fn() -> crate::errors::HandlerResult + Send + Sync + 'static,
) -> HandlerFn {
    HandlerFn::from_async(move |_ctx| {
        let calls = calls.clone();
        let result = outcome();
        async move {
            *calls.lock() += 1;
            result
        }
    })
}

/// A bare state-changing cause over a fresh patch, for unit tests.
pub(crate) fn changing_cause(
    resource: Resource,
    reason: Reason,
    body: Body,
) -> ResourceChangingCause {
    ResourceChangingCause {
        resource,
        reason,
        initial: false,
        body,
        patch: Arc::new(Mutex::new(Patch::new())),
        old: None,
        new: None,
        diff: Diff::default(),
    }
}

/// An API double: records every patch, serves no watch events.
#[derive(Default)]
pub(crate) struct MockClient {
    pub(crate) patches: Mutex<Vec<Patch>>,
}

impl MockClient {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn patch_values(&self) -> Vec<Value> {
        self.patches
            .lock()
            .iter()
            .cloned()
            .map(Patch::into_value)
            .collect()
    }
}

#[async_trait]
impl ResourceClient for MockClient {
    fn watch(
        &self,
        _resource: &Resource,
        _namespace: Option<&str>,
    ) -> BoxStream<'static, Result<WatchItem, ClientError>> {
        stream::empty().boxed()
    }

    async fn patch(
        &self,
        _resource: &Resource,
        _body: &Body,
        patch: &Patch,
    ) -> Result<(), ClientError> {
        self.patches.lock().push(patch.clone());
        Ok(())
    }
}

/// Apply a merge patch to a body, as the API server would.
pub(crate) fn apply_patch(body: &Body, patch: &Patch) -> Body {
    let mut doc = body.as_value().clone();
    json_patch::merge(&mut doc, &patch.clone().into_value());
    Body::new(doc)
}
