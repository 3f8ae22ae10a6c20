//! Work queue engine. The public API for submitting, allocating and
//! finishing work.
//!
//! `WorkQueue` holds no mutable state of its own: every state change is a
//! single conditional operation on the [`WorkStore`], so any number of
//! processes can drive the same store concurrently.

pub mod reaper;
pub mod retry;
pub mod worker;

pub use reaper::{Reaper, ReaperConfig};
pub use retry::RetryPolicy;
pub use worker::{Worker, WorkerConfig};

use std::sync::Arc;

use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use tracing::{Instrument, debug, error, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::error::{Error, Result};
use crate::model::*;
use crate::registry::WorkerRegistry;
use crate::store::WorkStore;
use crate::telemetry::{metrics, work::start_inline_span};

/// Queue-wide defaults.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Lease timeout for items that don't specify one.
    pub default_timeout_ms: u64,
    pub retry_policy: RetryPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 30 * 60 * 1000,
            retry_policy: RetryPolicy::Immediate,
        }
    }
}

impl QueueConfig {
    pub fn from_config(config: &crate::config::Config) -> Self {
        Self {
            default_timeout_ms: config.default_timeout_ms,
            ..Self::default()
        }
    }
}

/// The work queue service. Cheap to clone; clones share store and registry.
#[derive(Clone)]
pub struct WorkQueue {
    store: Arc<dyn WorkStore>,
    registry: Arc<WorkerRegistry>,
    clock: Arc<dyn Clock>,
    config: QueueConfig,
}

/// Where an enqueued item came from, for metrics and logs.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Source {
    Caller,
    Retry,
    Operator,
}

impl Source {
    fn as_str(self) -> &'static str {
        match self {
            Source::Caller => "caller",
            Source::Retry => "retry",
            Source::Operator => "operator",
        }
    }
}

impl WorkQueue {
    pub fn new(store: Arc<dyn WorkStore>, registry: Arc<WorkerRegistry>) -> Self {
        Self {
            store,
            registry,
            clock: Arc::new(SystemClock),
            config: QueueConfig::default(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_config(mut self, config: QueueConfig) -> Self {
        self.config = config;
        self
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn registry(&self) -> &WorkerRegistry {
        &self.registry
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub(crate) fn store(&self) -> &dyn WorkStore {
        self.store.as_ref()
    }

    // -----------------------------------------------------------------------
    // Enqueue
    // -----------------------------------------------------------------------

    /// Enqueue new work. Unset fields take the per-type defaults from the
    /// registry, then the queue defaults.
    pub async fn add_work(&self, new: NewWorkItem) -> Result<WorkItem> {
        if new.work_type.trim().is_empty() {
            return Err(Error::InvalidInput("work type must not be empty".to_string()));
        }
        let now = self.now();
        let defaults = self.registry.defaults(&new.work_type);

        let item = WorkItem {
            id: WorkId::new(),
            priority: new
                .priority
                .or(defaults.and_then(|d| d.priority))
                .unwrap_or(0),
            retries: new.retries.or(defaults.and_then(|d| d.retries)).unwrap_or(0),
            timeout_ms: new
                .timeout_ms
                .or(defaults.and_then(|d| d.timeout_ms))
                .unwrap_or(self.config.default_timeout_ms),
            scheduled: new.scheduled.unwrap_or(now),
            original: None,
            work_type: new.work_type,
            input: new.input,
            created: now,
            updated: None,
            deleted: None,
            started: None,
            worker: None,
            stopped: None,
            result: None,
            error: None,
            success: None,
        };
        self.enqueue(item, Source::Caller).await
    }

    pub(crate) async fn enqueue(&self, item: WorkItem, source: Source) -> Result<WorkItem> {
        let item = self.store.enqueue(item).await?;
        self.record_added(&item, source);
        Ok(item)
    }

    fn record_added(&self, item: &WorkItem, source: Source) {
        metrics::work_added().add(
            1,
            &[
                KeyValue::new("work_type", item.work_type.clone()),
                KeyValue::new("source", source.as_str()),
            ],
        );
        info!(
            work_id = %item.id,
            work_type = %item.work_type,
            priority = item.priority,
            retries = item.retries,
            scheduled = %item.scheduled,
            source = source.as_str(),
            "work added"
        );
    }

    // -----------------------------------------------------------------------
    // Allocate / finish
    // -----------------------------------------------------------------------

    /// Claim the next eligible item for `worker_id`. `types` restricts the
    /// work types accepted; empty accepts any. `None` means the queue has
    /// nothing eligible, which is not an error.
    pub async fn allocate_work(
        &self,
        types: &[String],
        worker_id: &str,
    ) -> Result<Option<WorkItem>> {
        if worker_id.trim().is_empty() {
            return Err(Error::InvalidId("worker id is empty".to_string()));
        }
        let now = self.now();
        let Some(item) = self.store.claim_next(worker_id, types, now).await? else {
            debug!(worker = worker_id, "no eligible work");
            return Ok(None);
        };

        metrics::work_allocated().add(1, &[KeyValue::new("work_type", item.work_type.clone())]);
        info!(
            work_id = %item.id,
            work_type = %item.work_type,
            worker = worker_id,
            "work allocated"
        );
        Ok(Some(item))
    }

    /// Record the outcome of an allocated item. One-shot: fails with
    /// `WorkNotFoundOrWrongStatus` unless the item is currently `ALLOCATED`.
    /// A failure with retry budget left spawns a successor before returning.
    ///
    /// The outcome and the successor are written in two steps. If spawning
    /// the successor fails, the outcome stays recorded, the error is logged,
    /// and the item is left `FAILED` with no later attempt; `retry_work` on
    /// it then spawns the missing successor.
    pub async fn finish_work(&self, id: WorkId, result: WorkResult) -> Result<WorkItem> {
        let now = self.now();
        let Some(item) = self.store.finish(id, &result, now).await? else {
            return Err(Error::WorkNotFoundOrWrongStatus(id));
        };

        if let (Some(reported), Some(started)) = (result.started, item.started) {
            if reported != started {
                debug!(work_id = %id, %reported, %started, "worker-reported start differs from allocation");
            }
        }

        let success = result.outcome.success;
        metrics::work_finished().add(
            1,
            &[
                KeyValue::new("work_type", item.work_type.clone()),
                KeyValue::new("success", success),
            ],
        );
        if let (Some(started), Some(stopped)) = (item.started, item.stopped) {
            metrics::work_duration_ms().record(
                (stopped - started).num_milliseconds() as f64,
                &[
                    KeyValue::new("work_type", item.work_type.clone()),
                    KeyValue::new("mode", "queued"),
                ],
            );
        }

        if success {
            info!(work_id = %id, work_type = %item.work_type, "work finished");
        } else {
            warn!(
                work_id = %id,
                work_type = %item.work_type,
                retries = item.retries,
                error = ?item.error,
                "work failed"
            );
            if item.retries > 0 {
                if let Err(e) = self.schedule_retry(&item).await {
                    error!(work_id = %id, "retry not scheduled: {e}");
                }
            }
        }
        Ok(item)
    }

    // -----------------------------------------------------------------------
    // Operator actions
    // -----------------------------------------------------------------------

    /// Soft-delete. Refused while the item is actively leased.
    pub async fn remove_work(&self, id: WorkId) -> Result<WorkItem> {
        let now = self.now();
        let Some(item) = self.store.soft_delete(id, now).await? else {
            return Err(Error::WorkNotFoundOrWrongStatus(id));
        };
        metrics::work_removed().add(1, &[KeyValue::new("work_type", item.work_type.clone())]);
        info!(work_id = %id, work_type = %item.work_type, "work removed");
        Ok(item)
    }

    /// Re-prioritise or reschedule an item that has not been allocated yet.
    pub async fn update_work(&self, id: WorkId, patch: WorkPatch) -> Result<WorkItem> {
        if patch.is_empty() {
            return Err(Error::InvalidInput("empty work patch".to_string()));
        }
        let now = self.now();
        let Some(item) = self.store.update(id, &patch, now).await? else {
            return Err(Error::WorkNotFoundOrWrongStatus(id));
        };
        info!(work_id = %id, priority = item.priority, scheduled = %item.scheduled, "work updated");
        Ok(item)
    }

    // -----------------------------------------------------------------------
    // Inline execution
    // -----------------------------------------------------------------------

    /// Run the handler for `work_type` right now, bypassing the queue.
    /// Nothing is persisted.
    pub async fn do_work(&self, work_type: &str, input: serde_json::Value) -> Result<WorkOutcome> {
        if work_type.trim().is_empty() {
            return Err(Error::WorkTypeInvalid(work_type.to_string()));
        }
        let Some(handler) = self.registry.get(work_type) else {
            return Err(Error::WorkTypeInvalid(work_type.to_string()));
        };

        let span = start_inline_span(work_type);
        let started = std::time::Instant::now();
        let outcome = handler.run(&input).instrument(span).await;
        metrics::work_duration_ms().record(
            started.elapsed().as_millis() as f64,
            &[
                KeyValue::new("work_type", work_type.to_string()),
                KeyValue::new("mode", "inline"),
            ],
        );

        match outcome {
            Ok(outcome) => Ok(outcome),
            Err(e @ (Error::InvalidInput(_) | Error::Handler(_))) => Err(e),
            Err(e) => Err(Error::Handler(e.to_string())),
        }
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// Point lookup. Deleted items are returned with status `DELETED`.
    pub async fn work(&self, id: WorkId) -> Result<Option<WorkItem>> {
        self.store.find_by_id(id).await
    }

    pub async fn work_queue(&self, filter: &WorkFilter, page: Pagination) -> Result<Vec<WorkItem>> {
        self.store.find_many(filter, page, self.now()).await
    }

    pub async fn work_count(&self, filter: &WorkFilter) -> Result<u64> {
        self.store.count(filter, self.now()).await
    }

    /// Work types this process can execute.
    pub fn active_work_types(&self) -> Vec<String> {
        self.registry.types()
    }

    /// Work types present in the store (not deleted).
    pub async fn queued_work_types(&self) -> Result<Vec<String>> {
        self.store.types().await
    }

    /// The whole retry chain `id` belongs to, root first, oldest to newest.
    pub async fn retry_chain(&self, id: WorkId) -> Result<Vec<WorkItem>> {
        let Some(item) = self.store.find_by_id(id).await? else {
            return Err(Error::WorkNotFoundOrWrongStatus(id));
        };
        let root_id = item.chain_root();
        let root = if root_id == item.id {
            item
        } else {
            self.store
                .find_by_id(root_id)
                .await?
                .ok_or(Error::WorkNotFoundOrWrongStatus(root_id))?
        };

        let filter = WorkFilter::default()
            .statuses(WorkStatus::ALL)
            .original(root_id);
        let mut chain = vec![root];
        chain.extend(
            self.store
                .find_many(&filter, Pagination::new(u32::MAX, 0), self.now())
                .await?,
        );
        Ok(chain)
    }
}
