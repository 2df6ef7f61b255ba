//! Tunables of the queueing and handling machinery.

use std::time::Duration;

/// The default delay for a regular exception in retry mode.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(60);

/// How often to wake up from a long sleep, to show liveliness.
pub const WAITING_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(600);

/// Runtime configuration, shared by the demultiplexer and the engine.
#[derive(Debug, Clone)]
pub struct Settings {
    /// How long a worker waits for new events before exiting and
    /// garbage-collecting its stream.
    pub worker_idle_timeout: Duration,
    /// How long a worker keeps draining the queue after the first event,
    /// collapsing bursts to the latest state.
    pub worker_batch_window: Duration,
    /// Shutdown grace period before abandoning workers.
    pub worker_exit_timeout: Duration,
    /// Reconnection delay after a watch stream disconnects.
    pub watcher_retry_delay: Duration,
    /// Per-uid queue capacity; a full queue blocks the demultiplexer.
    pub queue_capacity: usize,
    /// Whether unclassified handler errors are retried (the default) or
    /// treated as permanent failures.
    pub retry_on_errors: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            worker_idle_timeout: Duration::from_secs(300),
            worker_batch_window: Duration::from_millis(100),
            worker_exit_timeout: Duration::from_secs(5),
            watcher_retry_delay: Duration::from_millis(100),
            queue_capacity: 64,
            retry_on_errors: true,
        }
    }
}

impl Settings {
    #[must_use]
    pub fn with_worker_idle_timeout(mut self, timeout: Duration) -> Self {
        self.worker_idle_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_worker_batch_window(mut self, window: Duration) -> Self {
        self.worker_batch_window = window;
        self
    }

    #[must_use]
    pub fn with_worker_exit_timeout(mut self, timeout: Duration) -> Self {
        self.worker_exit_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_watcher_retry_delay(mut self, delay: Duration) -> Self {
        self.watcher_retry_delay = delay;
        self
    }

    #[must_use]
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    #[must_use]
    pub fn strict_errors(mut self) -> Self {
        self.retry_on_errors = false;
        self
    }
}
