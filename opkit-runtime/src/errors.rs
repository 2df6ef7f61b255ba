//! The error taxonomy handlers use to steer the retry machinery.

use crate::config::DEFAULT_RETRY_DELAY;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

/// What a handler may return: an optional result payload (stored under
/// `status.opkit.<handler-id>`) or an error steering the retries.
pub type HandlerResult = Result<Option<Value>, HandlerError>;

/// An error raised by (or on behalf of) a handler.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// A potentially recoverable error; the handler is retried after the delay.
    #[error("{message}")]
    Temporary { message: String, delay: Duration },

    /// A fatal error; retries are useless, the failure is recorded.
    #[error("{message}")]
    Permanent { message: String },

    /// Internal: sub-handlers have not finished on this cycle and the cycle
    /// must be re-entered. A `None` delay means "immediately", provoked by
    /// the progress writes in the patch.
    #[error("sub-handlers have not finished yet")]
    ChildrenRetry { delay: Option<Duration> },

    /// Anything else. Treated as temporary with the default retry delay,
    /// or as permanent under strict error mode.
    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl HandlerError {
    /// A temporary error with an explicit retry delay.
    pub fn temporary(message: impl Into<String>, delay: Duration) -> Self {
        Self::Temporary {
            message: message.into(),
            delay,
        }
    }

    /// A temporary error with the default retry delay.
    pub fn temporary_default(message: impl Into<String>) -> Self {
        Self::temporary(message, DEFAULT_RETRY_DELAY)
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent {
            message: message.into(),
        }
    }
}
