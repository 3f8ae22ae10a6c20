//! Worker loop: allocate, execute the registered handler, report.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde_json::json;
use tokio::sync::Notify;
use tracing::{Instrument, error, info, warn};

use super::WorkQueue;
use crate::error::{Error, Result};
use crate::model::{WorkItem, WorkOutcome, WorkResult, WorkStatus};
use crate::telemetry::work::{record_status_transition, start_work_span};

/// Configuration for a worker process.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Recorded as `worker` on every allocated item.
    pub worker_id: String,
    /// Work types to accept. Empty means every type the registry knows.
    pub types: Vec<String>,
    /// How long to sleep when the queue has nothing eligible.
    pub poll_interval: Duration,
    /// Maximum items executing at once.
    pub max_concurrent: usize,
}

impl WorkerConfig {
    pub fn new(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            types: Vec::new(),
            poll_interval: Duration::from_secs(5),
            max_concurrent: 4,
        }
    }

    pub fn types(mut self, types: Vec<String>) -> Self {
        self.types = types;
        self
    }

    pub fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent.max(1);
        self
    }
}

/// One unit of `max_concurrent` capacity, released on drop so a task that
/// unwinds still gives its slot back.
struct ActiveSlot(Arc<AtomicUsize>);

impl ActiveSlot {
    fn take(active: &Arc<AtomicUsize>) -> Self {
        active.fetch_add(1, Ordering::Relaxed);
        Self(Arc::clone(active))
    }
}

impl Drop for ActiveSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

pub struct Worker {
    queue: WorkQueue,
    config: WorkerConfig,
    shutdown: Arc<Notify>,
    active: Arc<AtomicUsize>,
}

impl Clone for Worker {
    fn clone(&self) -> Self {
        Self {
            queue: self.queue.clone(),
            config: self.config.clone(),
            shutdown: Arc::clone(&self.shutdown),
            active: Arc::clone(&self.active),
        }
    }
}

impl Worker {
    pub fn new(queue: WorkQueue, config: WorkerConfig) -> Self {
        Self {
            queue,
            config,
            shutdown: Arc::new(Notify::new()),
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Signal the worker loop to stop. In-flight items run to completion.
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    /// Items currently executing.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    /// Types this worker allocates: the configured list, or every
    /// registered type when none were configured.
    fn effective_types(&self) -> Result<Vec<String>> {
        let types = if self.config.types.is_empty() {
            self.queue.active_work_types()
        } else {
            self.config.types.clone()
        };
        if types.is_empty() {
            return Err(Error::Config("worker has no work types to accept".to_string()));
        }
        Ok(types)
    }

    /// Allocate and execute at most one item. Returns the finished item, or
    /// `None` when nothing was eligible.
    pub async fn run_once(&self) -> Result<Option<WorkItem>> {
        let types = self.effective_types()?;
        let Some(item) = self
            .queue
            .allocate_work(&types, &self.config.worker_id)
            .await?
        else {
            return Ok(None);
        };
        self.execute(item).await
    }

    /// Run until [`Worker::shutdown`] is called.
    pub async fn run(&self) -> Result<()> {
        let types = self.effective_types()?;
        info!(
            worker = %self.config.worker_id,
            types = ?types,
            max_concurrent = self.config.max_concurrent,
            "worker started"
        );

        loop {
            if let Err(e) = self.fill(&types).await {
                error!("allocation error: {e}");
            }

            tokio::select! {
                _ = self.shutdown.notified() => {
                    info!(active = self.active(), "worker shutting down");
                    return Ok(());
                }
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }
    }

    /// Allocate until the queue is drained or capacity is reached, spawning
    /// one task per item.
    async fn fill(&self, types: &[String]) -> Result<()> {
        while self.active() < self.config.max_concurrent {
            let Some(item) = self
                .queue
                .allocate_work(types, &self.config.worker_id)
                .await?
            else {
                return Ok(());
            };

            let slot = ActiveSlot::take(&self.active);
            let worker = self.clone();
            tokio::spawn(async move {
                let _slot = slot;
                if let Err(e) = worker.execute(item).await {
                    error!("execute error: {e}");
                }
            });
        }
        Ok(())
    }

    /// Run the handler for an allocated item and report its outcome.
    async fn execute(&self, item: WorkItem) -> Result<Option<WorkItem>> {
        let span = start_work_span(&item.work_type, &item.id);
        let started = self.queue.now();

        async {
            let outcome = match self.queue.registry().get(&item.work_type) {
                Some(handler) => {
                    // Own task, so a panicking handler fails the item
                    // instead of unwinding through the worker.
                    let input = item.input.clone();
                    let run = tokio::spawn(
                        async move { handler.run(&input).await }.in_current_span(),
                    );
                    match run.await {
                        Ok(Ok(outcome)) => outcome,
                        Ok(Err(e)) => {
                            warn!(work_id = %item.id, "handler error: {e}");
                            WorkOutcome::failed(json!({ "message": e.to_string() }))
                        }
                        Err(e) => {
                            error!(work_id = %item.id, "handler aborted: {e}");
                            let message = format!("handler aborted: {e}");
                            WorkOutcome::failed(json!({ "message": message }))
                        }
                    }
                }
                None => {
                    warn!(work_type = %item.work_type, "no handler registered for work type");
                    WorkOutcome::failed(json!({
                        "message": format!("no handler for work type {}", item.work_type)
                    }))
                }
            };

            let to = if outcome.success {
                WorkStatus::Success
            } else {
                WorkStatus::Failed
            };
            let result = WorkResult::from(outcome)
                .worker(self.config.worker_id.clone())
                .started(started)
                .finished(self.queue.now());

            match self.queue.finish_work(item.id, result).await {
                Ok(done) => {
                    record_status_transition(&span, WorkStatus::Allocated, to);
                    Ok(Some(done))
                }
                // Lease expired or the item was removed while we ran.
                Err(Error::WorkNotFoundOrWrongStatus(id)) => {
                    warn!(work_id = %id, "result discarded, item no longer allocated");
                    Ok(None)
                }
                Err(e) => Err(e),
            }
        }
        .instrument(span.clone())
        .await
    }
}
