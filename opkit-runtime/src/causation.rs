//! Classification of low-level watch events into high-level causes.
//!
//! The detector is a pure function over the event, the body's finalizer and
//! deletion state, and the last-seen snapshot decoded by the caller. It only
//! classifies; all mutations happen later, in the handling cycle.

use crate::client::{RawEvent, RawEventType};
use opkit_core::finalizers::{has_finalizer, is_deletion_requested};
use opkit_core::{Body, Diff, Patch, Resource};
use parking_lot::Mutex;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// The patch accumulator of one handling cycle, shared between the engine,
/// the progress store, and the handlers.
pub type SharedPatch = Arc<Mutex<Patch>>;

/// The logical reason an object revision was observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Reason {
    Create,
    Update,
    Delete,
    Resume,
    Acquire,
    Release,
    Gone,
    Free,
    Noop,
}

/// The reasons that invoke user handlers.
pub const HANDLER_REASONS: [Reason; 4] =
    [Reason::Create, Reason::Update, Reason::Delete, Reason::Resume];

impl Reason {
    pub fn is_handler_reason(self) -> bool {
        HANDLER_REASONS.contains(&self)
    }

    /// Human-readable event title for log lines.
    pub fn title(self) -> &'static str {
        match self {
            Reason::Create => "creation",
            Reason::Update => "update",
            Reason::Delete => "deletion",
            Reason::Resume => "resuming",
            Reason::Acquire => "acquiring",
            Reason::Release => "releasing",
            Reason::Gone => "disappearance",
            Reason::Free => "release of interest",
            Reason::Noop => "no-op",
        }
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let word = match self {
            Reason::Create => "create",
            Reason::Update => "update",
            Reason::Delete => "delete",
            Reason::Resume => "resume",
            Reason::Acquire => "acquire",
            Reason::Release => "release",
            Reason::Gone => "gone",
            Reason::Free => "free",
            Reason::Noop => "noop",
        };
        f.write_str(word)
    }
}

/// A decoded, classified observation of an object state change.
#[derive(Clone)]
pub struct ResourceChangingCause {
    pub resource: Resource,
    pub reason: Reason,
    pub initial: bool,
    pub body: Body,
    pub patch: SharedPatch,
    pub old: Option<Value>,
    pub new: Option<Value>,
    pub diff: Diff,
}

/// A raw observation passed to the silent watching handlers.
#[derive(Clone)]
pub struct ResourceWatchingCause {
    pub resource: Resource,
    pub type_: RawEventType,
    pub body: Body,
    pub patch: SharedPatch,
}

/// Classify one watch event against the object's own markers.
///
/// The first matching row wins: deletion events are `GONE`; a pending
/// deletion is `DELETE` with our finalizer and `FREE` without; a finalizer
/// mismatch is `ACQUIRE`/`RELEASE`; then the last-seen snapshot decides
/// between `CREATE`, `RESUME` (pre-existing objects at operator start),
/// `NOOP`, and `UPDATE`.
#[allow(clippy::too_many_arguments)]
pub fn detect_resource_changing_cause(
    event: &RawEvent,
    resource: &Resource,
    patch: SharedPatch,
    requires_finalizer: bool,
    initial: bool,
    old: Option<Value>,
    new: Option<Value>,
    diff: Diff,
) -> ResourceChangingCause {
    let body = event.object.clone();
    let finalizer_ours = has_finalizer(&body);
    let deletion_requested = is_deletion_requested(&body);

    let reason = if event.type_.is_deleted() {
        Reason::Gone
    } else if deletion_requested && !finalizer_ours {
        Reason::Free
    } else if deletion_requested {
        Reason::Delete
    } else if !finalizer_ours && requires_finalizer {
        Reason::Acquire
    } else if finalizer_ours && !requires_finalizer {
        Reason::Release
    } else if old.is_none() {
        Reason::Create
    } else if initial {
        Reason::Resume
    } else if diff.is_empty() {
        Reason::Noop
    } else {
        Reason::Update
    };

    ResourceChangingCause {
        resource: resource.clone(),
        reason,
        initial,
        body,
        patch,
        old,
        new,
        diff,
    }
}

/// Wrap one watch event for the silent watching handlers. No classification,
/// no progress, no retries.
pub fn detect_resource_watching_cause(
    event: &RawEvent,
    resource: &Resource,
    patch: SharedPatch,
) -> ResourceWatchingCause {
    ResourceWatchingCause {
        resource: resource.clone(),
        type_: event.type_.clone(),
        body: event.object.clone(),
        patch,
    }
}
