//! The opkit reactor: the per-object pipeline that turns a raw stream of
//! watch events into classified causes, dispatches them to registered
//! handlers, persists handler progress onto the object itself, and schedules
//! retries and delays.
//!
//! Three subsystems compose the runtime:
//!
//! - [`queueing`] fans one watch stream into one queue per object uid,
//!   batches rapid updates, and garbage-collects idle queues.
//! - [`causation`] classifies every observed revision into a discrete
//!   [`Reason`](causation::Reason).
//! - [`handling`] selects handlers via a [`lifecycles`] policy, records
//!   their progress, applies retry semantics, and flushes one patch per
//!   handling cycle.
//!
//! The resource API itself is consumed only through the
//! [`ResourceClient`](client::ResourceClient) trait: a watch stream and a
//! JSON merge patch call.

pub mod causation;
pub mod client;
pub mod config;
pub mod errors;
pub mod handling;
pub mod invocation;
pub mod lifecycles;
pub mod operator;
pub mod progress;
pub mod queueing;
pub mod registries;
mod utils;

#[cfg(test)]
pub(crate) mod testing;

pub use causation::{Reason, ResourceChangingCause, ResourceWatchingCause, SharedPatch};
pub use client::{ClientError, RawEvent, RawEventType, ResourceClient, WatchItem};
pub use config::Settings;
pub use errors::{HandlerError, HandlerResult};
pub use handling::{execute, execute_with, process_resource_event};
pub use invocation::HandlerContext;
pub use lifecycles::LifecycleFn;
pub use operator::run;
pub use registries::{Handler, HandlerFn, OperatorRegistry, ResourceRegistry, Selector};
