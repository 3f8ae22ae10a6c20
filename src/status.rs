//! Status derivation.
//!
//! Status is a pure function of `(started, stopped, success, deleted,
//! timeout, now)`. It is recomputed on every read and never written back.

use chrono::{DateTime, Duration, Utc};

use crate::model::{WorkItem, WorkStatus};

/// Derive the lifecycle status of `item` at `now`.
pub fn derive_status(item: &WorkItem, now: DateTime<Utc>) -> WorkStatus {
    if item.deleted.is_some() {
        return WorkStatus::Deleted;
    }
    match (item.started, item.stopped) {
        (None, _) => WorkStatus::New,
        (Some(_), Some(_)) => {
            if item.success == Some(true) {
                WorkStatus::Success
            } else {
                WorkStatus::Failed
            }
        }
        (Some(started), None) => {
            if now >= lease_deadline(started, item.timeout_ms) {
                WorkStatus::Failed
            } else {
                WorkStatus::Allocated
            }
        }
    }
}

/// Instant at which a lease taken at `started` is abandoned.
pub fn lease_deadline(started: DateTime<Utc>, timeout_ms: u64) -> DateTime<Utc> {
    let ms = i64::try_from(timeout_ms).unwrap_or(i64::MAX);
    Duration::try_milliseconds(ms)
        .and_then(|d| started.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Leased, never finished, and past its deadline.
pub fn is_lease_expired(item: &WorkItem, now: DateTime<Utc>) -> bool {
    item.deleted.is_none()
        && item.stopped.is_none()
        && item
            .started
            .is_some_and(|started| now >= lease_deadline(started, item.timeout_ms))
}
