//! Small helpers shared across the runtime.

use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Sleep for the delay, but wake up early on the replenished signal.
///
/// Returns `None` when the sleep ran to completion, or the remaining
/// (unslept) time when it was interrupted by new events for this object.
pub(crate) async fn sleep_or_wait(delay: Duration, replenished: &Notify) -> Option<Duration> {
    let deadline = Instant::now() + delay;
    tokio::select! {
        () = replenished.notified() => {
            Some(deadline.saturating_duration_since(Instant::now()))
        }
        () = tokio::time::sleep(delay) => None,
    }
}
