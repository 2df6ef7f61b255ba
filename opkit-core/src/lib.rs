//! Core data structures for the opkit operator framework.
//!
//! Everything here is pure data: no I/O, no async. Observed objects are kept
//! as opaque JSON ([`Body`]); the framework reasons about them through a
//! small set of structures: the per-cycle [`Patch`] accumulator, structural
//! [`Diff`]s, the last-seen essence snapshot, and finalizer bookkeeping.

pub mod body;
pub mod diff;
pub mod finalizers;
pub mod lastseen;
pub mod patch;
pub mod resource;

pub use body::Body;
pub use diff::{diff, Diff, DiffItem, DiffOp};
pub use finalizers::FINALIZER;
pub use lastseen::LAST_SEEN_ANNOTATION;
pub use patch::Patch;
pub use resource::Resource;
