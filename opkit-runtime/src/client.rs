//! The consumed resource API surface: a watch stream and a merge patch.

use async_trait::async_trait;
use futures::stream::BoxStream;
use opkit_core::{Body, Patch, Resource};
use std::fmt;
use thiserror::Error;

/// The raw type of a watch event. Anything unrecognized is carried as
/// [`Other`](RawEventType::Other) and treated as MODIFIED-compatible.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawEventType {
    Added,
    Modified,
    Deleted,
    Other(String),
}

impl RawEventType {
    pub fn is_deleted(&self) -> bool {
        matches!(self, RawEventType::Deleted)
    }
}

impl fmt::Display for RawEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RawEventType::Added => f.write_str("ADDED"),
            RawEventType::Modified => f.write_str("MODIFIED"),
            RawEventType::Deleted => f.write_str("DELETED"),
            RawEventType::Other(s) => f.write_str(s),
        }
    }
}

/// One low-level watch event: a type and the observed object.
#[derive(Debug, Clone)]
pub struct RawEvent {
    pub type_: RawEventType,
    pub object: Body,
}

/// One item of a watch stream.
///
/// A watch starts with an initial-listing prefix of pre-existing objects,
/// terminated by a [`Bookmark`](WatchItem::Bookmark); events before it are
/// marked *initial* and drive the `RESUME` cause.
#[derive(Debug, Clone)]
pub enum WatchItem {
    Event(RawEvent),
    Bookmark,
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("watch request failed: {message}")]
    Watch { message: String },
    #[error("patch request failed: {message}")]
    Patch { message: String },
}

/// The two operations the reactor needs from the resource API.
///
/// Implementations must reconnect transparently where they can; the runtime
/// additionally re-calls [`watch`](ResourceClient::watch) after the stream
/// ends, with a configurable delay. [`patch`](ResourceClient::patch) must be
/// a JSON merge patch (RFC 7386) and must swallow 404: an object that is
/// gone produces a `GONE` cause on the next delivery, not an error here.
#[async_trait]
pub trait ResourceClient: Send + Sync {
    fn watch(
        &self,
        resource: &Resource,
        namespace: Option<&str>,
    ) -> BoxStream<'static, Result<WatchItem, ClientError>>;

    async fn patch(
        &self,
        resource: &Resource,
        body: &Body,
        patch: &Patch,
    ) -> Result<(), ClientError>;
}
