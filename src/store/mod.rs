//! Work store contract.
//!
//! The store is the only shared mutable resource. Every mutation is a single
//! conditional operation keyed by item id, so concurrent workers (possibly in
//! different processes) never need an application-level lock.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::model::*;

pub use memory::InMemoryWorkStore;

#[async_trait]
pub trait WorkStore: Send + Sync {
    /// Persist a new item as given.
    async fn enqueue(&self, item: WorkItem) -> Result<WorkItem>;

    /// Persist the successor of attempt `failed`, unless `failed` is gone
    /// or deleted, or a later attempt of the same chain (not deleted)
    /// already exists. The check and the insert are one atomic step, so
    /// each attempt spawns at most one live successor. `None` when refused.
    async fn enqueue_successor(
        &self,
        failed: WorkId,
        successor: WorkItem,
    ) -> Result<Option<WorkItem>>;

    /// Point lookup. Deleted items are returned too.
    async fn find_by_id(&self, id: WorkId) -> Result<Option<WorkItem>>;

    /// Filtered listing, ordered by creation (oldest first).
    async fn find_many(
        &self,
        filter: &WorkFilter,
        page: Pagination,
        now: DateTime<Utc>,
    ) -> Result<Vec<WorkItem>>;

    async fn count(&self, filter: &WorkFilter, now: DateTime<Utc>) -> Result<u64>;

    /// Atomically claim the best eligible item: not deleted, never started,
    /// `scheduled <= now`, type accepted (empty `types` accepts all).
    /// Highest priority wins, then oldest. Sets `started = now` and
    /// `worker` in the same operation.
    async fn claim_next(
        &self,
        worker: &str,
        types: &[String],
        now: DateTime<Utc>,
    ) -> Result<Option<WorkItem>>;

    /// Record the outcome, but only if the item is `ALLOCATED` at `now`.
    /// Returns `None` when the guard did not hold.
    async fn finish(
        &self,
        id: WorkId,
        result: &WorkResult,
        now: DateTime<Utc>,
    ) -> Result<Option<WorkItem>>;

    /// Patch an item that is still `NEW`. `None` otherwise.
    async fn update(
        &self,
        id: WorkId,
        patch: &WorkPatch,
        now: DateTime<Utc>,
    ) -> Result<Option<WorkItem>>;

    /// Mark deleted, unless absent, already deleted, or actively leased.
    async fn soft_delete(&self, id: WorkId, now: DateTime<Utc>) -> Result<Option<WorkItem>>;

    /// Leased, never finished, and past their timeout at `now`, oldest
    /// lease first.
    async fn expired_leases(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<WorkItem>>;

    /// Distinct types of non-deleted items.
    async fn types(&self) -> Result<Vec<String>>;
}
