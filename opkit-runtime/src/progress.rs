//! The per-handler progress store, persisted on the object itself.
//!
//! State lives under `status.opkit.progress.<handler-id>` and survives
//! operator restarts. All writes go through the per-cycle patch; reads merge
//! the patch over the body so that same-cycle writes are visible.

use chrono::{DateTime, SecondsFormat, Utc};
use opkit_core::{Body, Patch};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// One handler's persisted progress.
///
/// `success` and `failure` are terminal and mutually exclusive: once either
/// is set, the handler is finished and never re-invoked for the same cause.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stopped: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delayed: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

pub(crate) fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

fn decode(value: Option<&Value>) -> Option<ProgressRecord> {
    value.and_then(|v| serde_json::from_value(v.clone()).ok())
}

fn body_record(body: &Body, id: &str) -> Option<ProgressRecord> {
    decode(
        body.as_value()
            .get("status")?
            .get("opkit")?
            .get("progress")?
            .get(id),
    )
}

fn patch_record(patch: &Patch, id: &str) -> Option<ProgressRecord> {
    decode(patch.get(&["status", "opkit", "progress", id]))
}

/// The merged view of one handler's record: patch fields win over the body.
fn record(body: &Body, patch: &Patch, id: &str) -> ProgressRecord {
    let mut merged = body_record(body, id).unwrap_or_default();
    if let Some(overlay) = patch_record(patch, id) {
        merged.started = overlay.started.or(merged.started);
        merged.stopped = overlay.stopped.or(merged.stopped);
        merged.delayed = overlay.delayed.or(merged.delayed);
        merged.retries = overlay.retries.or(merged.retries);
        merged.success = overlay.success.or(merged.success);
        merged.failure = overlay.failure.or(merged.failure);
        merged.message = overlay.message.or(merged.message);
    }
    merged
}

fn set_field(patch: &mut Patch, id: &str, key: &str, value: Value) {
    patch.set(&["status", "opkit", "progress", id, key], value);
}

pub fn is_started(body: &Body, patch: &Patch, id: &str) -> bool {
    record(body, patch, id).started.is_some()
}

pub fn is_finished(body: &Body, patch: &Patch, id: &str) -> bool {
    let rec = record(body, patch, id);
    rec.success == Some(true) || rec.failure == Some(true)
}

/// The handler is finished with a delay and the delay has not elapsed yet.
pub fn is_sleeping(body: &Body, patch: &Patch, id: &str) -> bool {
    !is_finished(body, patch, id)
        && get_awake_time(body, patch, id).is_some_and(|awake| awake > Utc::now())
}

/// The handler is eligible to run on this cycle.
pub fn is_awakened(body: &Body, patch: &Patch, id: &str) -> bool {
    !is_finished(body, patch, id) && !is_sleeping(body, patch, id)
}

pub fn get_start_time(body: &Body, patch: &Patch, id: &str) -> Option<DateTime<Utc>> {
    record(body, patch, id).started.as_deref().and_then(parse_ts)
}

pub fn get_awake_time(body: &Body, patch: &Patch, id: &str) -> Option<DateTime<Utc>> {
    record(body, patch, id).delayed.as_deref().and_then(parse_ts)
}

pub fn get_retry_count(body: &Body, patch: &Patch, id: &str) -> u32 {
    record(body, patch, id).retries.unwrap_or(0)
}

/// Stamp the start time, once. Later calls within the same cause are no-ops
/// because the merged view already carries the timestamp.
pub fn set_start_time(body: &Body, patch: &mut Patch, id: &str) {
    if !is_started(body, patch, id) {
        set_field(patch, id, "started", Value::String(now_iso()));
    }
}

/// Plan a retry: bump the counter and, with a delay, set the awake time.
/// Without a delay the handler stays awakened and the cycle re-enters
/// immediately, provoked by the patch itself.
pub fn set_retry_time(body: &Body, patch: &mut Patch, id: &str, delay: Option<Duration>) {
    let retries = get_retry_count(body, patch, id) + 1;
    set_field(patch, id, "retries", Value::from(retries));
    if let Some(delay) = delay {
        let delta = chrono::TimeDelta::from_std(delay).unwrap_or(chrono::TimeDelta::MAX);
        let awake = Utc::now()
            .checked_add_signed(delta)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        set_field(
            patch,
            id,
            "delayed",
            Value::String(awake.to_rfc3339_opts(SecondsFormat::Micros, true)),
        );
    }
}

/// Record terminal success and store the optional result payload.
pub fn store_success(body: &Body, patch: &mut Patch, id: &str, result: Option<Value>) {
    let retries = get_retry_count(body, patch, id) + 1;
    set_field(patch, id, "retries", Value::from(retries));
    set_field(patch, id, "stopped", Value::String(now_iso()));
    set_field(patch, id, "success", Value::Bool(true));
    store_result(patch, id, result);
}

/// Store a handler's result payload under `status.opkit.<handler-id>`.
pub fn store_result(patch: &mut Patch, id: &str, result: Option<Value>) {
    if let Some(result) = result {
        patch.set(&["status", "opkit", id], result);
    }
}

/// Record terminal failure with a human-readable message.
pub fn store_failure(body: &Body, patch: &mut Patch, id: &str, message: &str) {
    let retries = get_retry_count(body, patch, id) + 1;
    set_field(patch, id, "retries", Value::from(retries));
    set_field(patch, id, "stopped", Value::String(now_iso()));
    set_field(patch, id, "failure", Value::Bool(true));
    set_field(patch, id, "message", Value::String(message.to_string()));
}

/// Drop the whole progress subtree once every handler of a cause finished.
/// A `null` in the merge patch deletes the field on the server side.
pub fn purge_progress(body: &Body, patch: &mut Patch) {
    let stored_on_body = body
        .as_value()
        .get("status")
        .and_then(|s| s.get("opkit"))
        .and_then(|k| k.get("progress"))
        .is_some();
    let stored_on_patch = patch.get(&["status", "opkit", "progress"]).is_some();
    if stored_on_body || stored_on_patch {
        patch.set(&["status", "opkit", "progress"], Value::Null);
    }
}
