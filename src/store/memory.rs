//! In-memory work store.
//!
//! Every mutating call does its check and its write under one write lock, which
//! gives the same compare-and-set guarantees as the Postgres store within a
//! single process.

use std::cmp::Ordering;
use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use super::WorkStore;
use crate::error::{Error, Result};
use crate::model::*;

struct Entry {
    /// Insertion order; breaks ties between equal `created` timestamps.
    seq: u64,
    item: WorkItem,
}

#[derive(Default)]
struct Inner {
    items: HashMap<WorkId, Entry>,
    next_seq: u64,
}

/// In-memory implementation of [`WorkStore`].
///
/// For tests and single-process deployments. Nothing survives a restart.
#[derive(Default)]
pub struct InMemoryWorkStore {
    inner: RwLock<Inner>,
}

impl InMemoryWorkStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored items, deleted ones included.
    pub fn len(&self) -> usize {
        self.inner.read().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Inner {
    fn insert(&mut self, item: WorkItem) -> Result<WorkItem> {
        if self.items.contains_key(&item.id) {
            return Err(Error::Other(format!("duplicate work id {}", item.id)));
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.items.insert(
            item.id,
            Entry {
                seq,
                item: item.clone(),
            },
        );
        Ok(item)
    }
}

fn by_creation(a: &Entry, b: &Entry) -> Ordering {
    a.item
        .created
        .cmp(&b.item.created)
        .then(a.seq.cmp(&b.seq))
}

/// Claim order: priority descending, then oldest first.
fn by_claim_order(a: &Entry, b: &Entry) -> Ordering {
    b.item
        .priority
        .cmp(&a.item.priority)
        .then_with(|| by_creation(a, b))
}

#[async_trait]
impl WorkStore for InMemoryWorkStore {
    async fn enqueue(&self, item: WorkItem) -> Result<WorkItem> {
        self.inner.write().insert(item)
    }

    async fn enqueue_successor(
        &self,
        failed: WorkId,
        successor: WorkItem,
    ) -> Result<Option<WorkItem>> {
        let mut inner = self.inner.write();
        let Some(seq) = inner
            .items
            .get(&failed)
            .filter(|e| e.item.deleted.is_none())
            .map(|e| e.seq)
        else {
            return Ok(None);
        };
        let root = successor.original.unwrap_or(failed);
        let superseded = inner.items.values().any(|e| {
            e.item.original == Some(root) && e.seq > seq && e.item.deleted.is_none()
        });
        if superseded {
            return Ok(None);
        }
        inner.insert(successor).map(Some)
    }

    async fn find_by_id(&self, id: WorkId) -> Result<Option<WorkItem>> {
        Ok(self.inner.read().items.get(&id).map(|e| e.item.clone()))
    }

    async fn find_many(
        &self,
        filter: &WorkFilter,
        page: Pagination,
        now: DateTime<Utc>,
    ) -> Result<Vec<WorkItem>> {
        let inner = self.inner.read();
        let mut matching: Vec<&Entry> = inner
            .items
            .values()
            .filter(|e| filter.matches(&e.item, now))
            .collect();
        matching.sort_by(|a, b| by_creation(a, b));

        Ok(matching
            .into_iter()
            .skip(page.offset as usize)
            .take(page.limit as usize)
            .map(|e| e.item.clone())
            .collect())
    }

    async fn count(&self, filter: &WorkFilter, now: DateTime<Utc>) -> Result<u64> {
        let inner = self.inner.read();
        Ok(inner
            .items
            .values()
            .filter(|e| filter.matches(&e.item, now))
            .count() as u64)
    }

    async fn claim_next(
        &self,
        worker: &str,
        types: &[String],
        now: DateTime<Utc>,
    ) -> Result<Option<WorkItem>> {
        let mut inner = self.inner.write();

        let winner = inner
            .items
            .values()
            .filter(|e| {
                let it = &e.item;
                it.deleted.is_none()
                    && it.started.is_none()
                    && it.scheduled <= now
                    && (types.is_empty() || types.contains(&it.work_type))
            })
            .min_by(|a, b| by_claim_order(a, b))
            .map(|e| e.item.id);

        let Some(id) = winner else {
            return Ok(None);
        };
        let Some(entry) = inner.items.get_mut(&id) else {
            return Ok(None);
        };
        entry.item.started = Some(now);
        entry.item.worker = Some(worker.to_string());
        entry.item.updated = Some(now);
        Ok(Some(entry.item.clone()))
    }

    async fn finish(
        &self,
        id: WorkId,
        result: &WorkResult,
        now: DateTime<Utc>,
    ) -> Result<Option<WorkItem>> {
        let mut inner = self.inner.write();
        let Some(entry) = inner.items.get_mut(&id) else {
            return Ok(None);
        };
        let item = &mut entry.item;
        if item.status(now) != WorkStatus::Allocated {
            return Ok(None);
        }
        let Some(started) = item.started else {
            return Ok(None);
        };

        let finished = result.finished.unwrap_or(now);
        item.stopped = Some(finished.max(started));
        item.success = Some(result.outcome.success);
        item.result = result.outcome.result.clone();
        item.error = result.outcome.error.clone();
        if let Some(ref worker) = result.worker {
            item.worker = Some(worker.clone());
        }
        item.updated = Some(now);
        Ok(Some(item.clone()))
    }

    async fn update(
        &self,
        id: WorkId,
        patch: &WorkPatch,
        now: DateTime<Utc>,
    ) -> Result<Option<WorkItem>> {
        let mut inner = self.inner.write();
        let Some(entry) = inner.items.get_mut(&id) else {
            return Ok(None);
        };
        if entry.item.status(now) != WorkStatus::New {
            return Ok(None);
        }
        patch.apply(&mut entry.item);
        entry.item.updated = Some(now);
        Ok(Some(entry.item.clone()))
    }

    async fn soft_delete(&self, id: WorkId, now: DateTime<Utc>) -> Result<Option<WorkItem>> {
        let mut inner = self.inner.write();
        let Some(entry) = inner.items.get_mut(&id) else {
            return Ok(None);
        };
        match entry.item.status(now) {
            WorkStatus::Allocated | WorkStatus::Deleted => Ok(None),
            _ => {
                entry.item.deleted = Some(now);
                entry.item.updated = Some(now);
                Ok(Some(entry.item.clone()))
            }
        }
    }

    async fn expired_leases(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<WorkItem>> {
        let inner = self.inner.read();
        let mut expired: Vec<&WorkItem> = inner
            .items
            .values()
            .map(|e| &e.item)
            .filter(|it| crate::status::is_lease_expired(it, now))
            .collect();
        expired.sort_by_key(|it| it.started);
        Ok(expired
            .into_iter()
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn types(&self) -> Result<Vec<String>> {
        let inner = self.inner.read();
        let mut types: Vec<String> = inner
            .items
            .values()
            .filter(|e| e.item.deleted.is_none())
            .map(|e| e.item.work_type.clone())
            .collect();
        types.sort();
        types.dedup();
        Ok(types)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn new_item(work_type: &str, priority: i32, created: DateTime<Utc>) -> WorkItem {
        WorkItem {
            id: WorkId::new(),
            work_type: work_type.into(),
            input: json!({}),
            priority,
            scheduled: created,
            created,
            updated: None,
            deleted: None,
            started: None,
            worker: None,
            stopped: None,
            result: None,
            error: None,
            success: None,
            retries: 0,
            original: None,
            timeout_ms: 1000,
        }
    }

    #[tokio::test]
    async fn claim_skips_future_and_foreign_types() {
        let store = InMemoryWorkStore::new();
        let now = Utc::now();

        let mut later = new_item("EMAIL", 10, now);
        later.scheduled = now + Duration::minutes(5);
        store.enqueue(later).await.unwrap();
        store.enqueue(new_item("SMS", 10, now)).await.unwrap();
        let email = store.enqueue(new_item("EMAIL", 0, now)).await.unwrap();

        let claimed = store
            .claim_next("w1", &["EMAIL".to_string()], now)
            .await
            .unwrap()
            .expect("eligible email");
        assert_eq!(claimed.id, email.id);
        assert_eq!(claimed.started, Some(now));
        assert_eq!(claimed.worker.as_deref(), Some("w1"));

        assert!(
            store
                .claim_next("w1", &["EMAIL".to_string()], now)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn equal_timestamps_fall_back_to_insertion_order() {
        let store = InMemoryWorkStore::new();
        let now = Utc::now();
        let first = store.enqueue(new_item("A", 1, now)).await.unwrap();
        let second = store.enqueue(new_item("A", 1, now)).await.unwrap();

        let a = store.claim_next("w", &[], now).await.unwrap().unwrap();
        let b = store.claim_next("w", &[], now).await.unwrap().unwrap();
        assert_eq!(a.id, first.id);
        assert_eq!(b.id, second.id);
    }

    #[tokio::test]
    async fn finish_clamps_stopped_to_started() {
        let store = InMemoryWorkStore::new();
        let now = Utc::now();
        let item = store.enqueue(new_item("A", 0, now)).await.unwrap();
        store.claim_next("w", &[], now).await.unwrap();

        let result = WorkResult::from(WorkOutcome::ok(json!(1)))
            .finished(now - Duration::seconds(30));
        let done = store.finish(item.id, &result, now).await.unwrap().unwrap();
        assert_eq!(done.stopped, Some(now));
        assert_eq!(done.status(now), WorkStatus::Success);
    }

    #[tokio::test]
    async fn update_only_touches_new_items() {
        let store = InMemoryWorkStore::new();
        let now = Utc::now();
        let item = store.enqueue(new_item("A", 0, now)).await.unwrap();
        let patch = WorkPatch {
            priority: Some(7),
            ..Default::default()
        };

        let updated = store.update(item.id, &patch, now).await.unwrap().unwrap();
        assert_eq!(updated.priority, 7);

        store.claim_next("w", &[], now).await.unwrap();
        assert!(store.update(item.id, &patch, now).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn only_the_newest_attempt_gets_a_successor() {
        let store = InMemoryWorkStore::new();
        let now = Utc::now();
        let root = store.enqueue(new_item("A", 0, now)).await.unwrap();
        let next = |n: &WorkItem| {
            let mut item = new_item("A", 0, now);
            item.original = Some(n.chain_root());
            item
        };

        let second = store
            .enqueue_successor(root.id, next(&root))
            .await
            .unwrap()
            .expect("first successor");
        assert!(store.enqueue_successor(root.id, next(&root)).await.unwrap().is_none());

        let third = store
            .enqueue_successor(second.id, next(&second))
            .await
            .unwrap()
            .expect("successor of the newest attempt");
        assert!(store.enqueue_successor(second.id, next(&second)).await.unwrap().is_none());

        // A removed attempt no longer blocks its predecessor.
        store.soft_delete(third.id, now).await.unwrap();
        assert!(store.enqueue_successor(second.id, next(&second)).await.unwrap().is_some());
        assert!(store.enqueue_successor(WorkId::new(), next(&root)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn types_are_distinct_and_skip_deleted() {
        let store = InMemoryWorkStore::new();
        let now = Utc::now();
        store.enqueue(new_item("B", 0, now)).await.unwrap();
        store.enqueue(new_item("A", 0, now)).await.unwrap();
        store.enqueue(new_item("A", 0, now)).await.unwrap();
        let gone = store.enqueue(new_item("C", 0, now)).await.unwrap();
        store.soft_delete(gone.id, now).await.unwrap();

        assert_eq!(store.types().await.unwrap(), vec!["A", "B"]);
        assert_eq!(store.len(), 4);
    }
}
