//! Retry chains.
//!
//! A failed item is never re-run in place. Instead a successor is enqueued
//! with `original` pointing at the chain root, so "all attempts of X" is a
//! single indexed lookup and the chain stays append-only.

use std::time::Duration;

use opentelemetry::KeyValue;
use tracing::{debug, info};

use super::{Source, WorkQueue};
use crate::error::{Error, Result};
use crate::model::*;
use crate::telemetry::metrics;

/// When a retry successor becomes eligible.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum RetryPolicy {
    /// Eligible immediately.
    #[default]
    Immediate,
    /// `base * 2^(attempt-1)`, capped at `max`.
    Exponential { base: Duration, max: Duration },
}

impl RetryPolicy {
    /// Delay before the successor spawned after `attempt` failed attempts.
    pub fn delay(&self, attempt: u32) -> Duration {
        match self {
            RetryPolicy::Immediate => Duration::ZERO,
            RetryPolicy::Exponential { base, max } => {
                let exp = attempt.saturating_sub(1).min(31);
                base.checked_mul(1u32 << exp)
                    .map_or(*max, |d| d.min(*max))
            }
        }
    }
}

impl WorkQueue {
    /// Spawn the successor of a failed item, spending one unit of its retry
    /// budget. Returns `None` when the budget is exhausted (the chain simply
    /// ends there) or when a later attempt already exists.
    pub async fn schedule_retry(&self, failed: &WorkItem) -> Result<Option<WorkItem>> {
        if failed.retries == 0 {
            debug!(work_id = %failed.id, "retry budget exhausted");
            return Ok(None);
        }
        let successor = self.successor(failed, failed.retries - 1).await?;
        let Some(successor) = self.spawn_successor(failed, successor, Source::Retry).await? else {
            debug!(work_id = %failed.id, "later attempt exists, no retry scheduled");
            return Ok(None);
        };

        metrics::work_retried().add(1, &[KeyValue::new("work_type", failed.work_type.clone())]);
        info!(
            work_id = %successor.id,
            failed_id = %failed.id,
            original = %failed.chain_root(),
            retries = successor.retries,
            "retry scheduled"
        );
        Ok(Some(successor))
    }

    /// Operator-driven re-run of a `FAILED` item (finished unsuccessfully or
    /// abandoned by its worker). The successor keeps the failed item's
    /// remaining budget; the failed item itself is left untouched.
    ///
    /// Only the newest attempt of a chain can be retried, so repeating the
    /// call (or calling it after an automatic retry) is refused with
    /// `WorkNotFoundOrWrongStatus` instead of spawning duplicates.
    pub async fn retry_work(&self, id: WorkId) -> Result<WorkItem> {
        let now = self.now();
        let failed = self
            .store()
            .find_by_id(id)
            .await?
            .filter(|item| item.status(now) == WorkStatus::Failed)
            .ok_or(Error::WorkNotFoundOrWrongStatus(id))?;

        let successor = self.successor(&failed, failed.retries).await?;
        let successor = self
            .spawn_successor(&failed, successor, Source::Operator)
            .await?
            .ok_or(Error::WorkNotFoundOrWrongStatus(id))?;
        info!(
            work_id = %successor.id,
            failed_id = %failed.id,
            original = %failed.chain_root(),
            "manual retry scheduled"
        );
        Ok(successor)
    }

    async fn spawn_successor(
        &self,
        failed: &WorkItem,
        successor: WorkItem,
        source: Source,
    ) -> Result<Option<WorkItem>> {
        let spawned = self.store().enqueue_successor(failed.id, successor).await?;
        if let Some(ref item) = spawned {
            self.record_added(item, source);
        }
        Ok(spawned)
    }

    async fn successor(&self, failed: &WorkItem, retries: u32) -> Result<WorkItem> {
        let now = self.now();
        let root = failed.chain_root();

        let scheduled = match self.config().retry_policy {
            RetryPolicy::Immediate => now,
            ref policy => {
                // Attempts so far: the root plus every successor already spawned.
                let filter = WorkFilter::default()
                    .statuses(WorkStatus::ALL)
                    .original(root);
                let attempts = self.store().count(&filter, now).await? + 1;
                let delay = policy.delay(u32::try_from(attempts).unwrap_or(u32::MAX));
                chrono::Duration::from_std(delay)
                    .ok()
                    .and_then(|d| now.checked_add_signed(d))
                    .unwrap_or(chrono::DateTime::<chrono::Utc>::MAX_UTC)
            }
        };

        Ok(WorkItem {
            id: WorkId::new(),
            work_type: failed.work_type.clone(),
            input: failed.input.clone(),
            priority: failed.priority,
            scheduled,
            created: now,
            updated: None,
            deleted: None,
            started: None,
            worker: None,
            stopped: None,
            result: None,
            error: None,
            success: None,
            retries,
            original: Some(root),
            timeout_ms: failed.timeout_ms,
        })
    }
}
