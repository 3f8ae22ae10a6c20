//! Reaper: notices abandoned leases.
//!
//! An expired lease is already `FAILED` by derivation, so the reaper never
//! writes. It surfaces those items (logs, metrics, return value) so operators
//! can retry or remove them.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use opentelemetry::KeyValue;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{error, info, warn};

use super::WorkQueue;
use crate::error::Result;
use crate::model::{WorkId, WorkItem};
use crate::telemetry::metrics;

#[derive(Debug, Clone)]
pub struct ReaperConfig {
    pub interval: Duration,
    /// Maximum expired leases reported per sweep.
    pub batch_size: u32,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            batch_size: 500,
        }
    }
}

/// Periodic sweep for leases that outlived their timeout.
#[derive(Clone)]
pub struct Reaper {
    queue: WorkQueue,
    config: ReaperConfig,
    shutdown: Arc<Notify>,
    /// Expired ids already reported, so each one is logged once.
    reported: Arc<Mutex<HashSet<WorkId>>>,
}

impl Reaper {
    pub fn new(queue: WorkQueue, config: ReaperConfig) -> Self {
        Self {
            queue,
            config,
            shutdown: Arc::new(Notify::new()),
            reported: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Signal the reaper loop to stop.
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    /// One pass: every lease expired as of now, oldest first. Newly expired
    /// items are logged and counted.
    pub async fn sweep(&self) -> Result<Vec<WorkItem>> {
        let now = self.queue.now();
        let expired = self
            .queue
            .store()
            .expired_leases(now, self.config.batch_size)
            .await?;

        let mut reported = self.reported.lock();
        let current: HashSet<WorkId> = expired.iter().map(|item| item.id).collect();
        for item in &expired {
            if reported.insert(item.id) {
                metrics::work_expired()
                    .add(1, &[KeyValue::new("work_type", item.work_type.clone())]);
                warn!(
                    work_id = %item.id,
                    work_type = %item.work_type,
                    worker = item.worker.as_deref().unwrap_or("-"),
                    started = ?item.started,
                    timeout_ms = item.timeout_ms,
                    "lease expired"
                );
            }
        }
        // Forget ids that are no longer expired leases (removed, or batch moved on).
        reported.retain(|id| current.contains(id));

        Ok(expired)
    }

    /// Sweep every `interval` until [`Reaper::shutdown`] is called.
    pub async fn run(&self) -> Result<()> {
        info!(interval_ms = self.config.interval.as_millis() as u64, "reaper started");
        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    info!("reaper shutting down");
                    return Ok(());
                }
                _ = tokio::time::sleep(self.config.interval) => {}
            }

            match self.sweep().await {
                Ok(expired) if !expired.is_empty() => {
                    info!(count = expired.len(), "expired leases outstanding");
                }
                Ok(_) => {}
                Err(e) => error!("reaper sweep error: {e}"),
            }
        }
    }
}
