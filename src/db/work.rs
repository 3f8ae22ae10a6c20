//! Postgres work store: every mutation is one conditional statement.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Postgres, QueryBuilder};
use tracing::debug;
use uuid::Uuid;

use crate::error::Result;
use crate::model::*;
use crate::store::WorkStore;

const COLUMNS: &str = "id, work_type, input, priority, scheduled, created, updated, deleted, \
     started, worker, stopped, result, error, success, retries, original, timeout_ms";

/// Lease age in milliseconds, compared against `timeout_ms`. Computed via the
/// epoch so very large timeouts can't overflow an interval.
const LEASE_AGE_MS: &str = " - started)) * 1000";

fn to_i64(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

/// Append the SQL predicate for one derived status.
fn push_status(qb: &mut QueryBuilder<'_, Postgres>, status: WorkStatus, now: DateTime<Utc>) {
    match status {
        WorkStatus::New => {
            qb.push("(deleted IS NULL AND started IS NULL)");
        }
        WorkStatus::Allocated => {
            qb.push(
                "(deleted IS NULL AND started IS NOT NULL AND stopped IS NULL \
                 AND EXTRACT(EPOCH FROM (",
            );
            qb.push_bind(now);
            qb.push(LEASE_AGE_MS);
            qb.push(" < timeout_ms)");
        }
        WorkStatus::Failed => {
            qb.push(
                "(deleted IS NULL AND started IS NOT NULL AND (\
                 (stopped IS NOT NULL AND success IS NOT TRUE) \
                 OR (stopped IS NULL AND EXTRACT(EPOCH FROM (",
            );
            qb.push_bind(now);
            qb.push(LEASE_AGE_MS);
            qb.push(" >= timeout_ms)))");
        }
        WorkStatus::Success => {
            qb.push("(deleted IS NULL AND stopped IS NOT NULL AND success IS TRUE)");
        }
        WorkStatus::Deleted => {
            qb.push("(deleted IS NOT NULL)");
        }
    }
}

fn push_filter(qb: &mut QueryBuilder<'_, Postgres>, filter: &WorkFilter, now: DateTime<Utc>) {
    if filter.statuses.is_empty() {
        qb.push(" AND deleted IS NULL");
    } else {
        qb.push(" AND (");
        for (i, status) in filter.statuses.iter().enumerate() {
            if i > 0 {
                qb.push(" OR ");
            }
            push_status(qb, *status, now);
        }
        qb.push(")");
    }
    if !filter.types.is_empty() {
        qb.push(" AND work_type = ANY(");
        qb.push_bind(filter.types.clone());
        qb.push(")");
    }
    if let Some(after) = filter.created_after {
        qb.push(" AND created >= ");
        qb.push_bind(after);
    }
    if let Some(before) = filter.created_before {
        qb.push(" AND created < ");
        qb.push_bind(before);
    }
    if let Some(root) = filter.original {
        qb.push(" AND original = ");
        qb.push_bind(root.0);
    }
}

async fn insert<'e, E>(executor: E, item: &WorkItem) -> Result<WorkItem>
where
    E: sqlx::PgExecutor<'e>,
{
    let row: WorkItemRow = sqlx::query_as(&format!(
        "INSERT INTO work_items (id, work_type, input, priority, scheduled, created, updated, \
         deleted, started, worker, stopped, result, error, success, retries, original, timeout_ms)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
         RETURNING {COLUMNS}"
    ))
    .bind(item.id.0)
    .bind(&item.work_type)
    .bind(&item.input)
    .bind(item.priority)
    .bind(item.scheduled)
    .bind(item.created)
    .bind(item.updated)
    .bind(item.deleted)
    .bind(item.started)
    .bind(&item.worker)
    .bind(item.stopped)
    .bind(&item.result)
    .bind(&item.error)
    .bind(item.success)
    .bind(i32::try_from(item.retries).unwrap_or(i32::MAX))
    .bind(item.original.map(|o| o.0))
    .bind(to_i64(item.timeout_ms))
    .fetch_one(executor)
    .await?;

    debug!(work_id = %item.id, work_type = %item.work_type, "work item inserted");
    Ok(row.into())
}

#[async_trait]
impl WorkStore for super::Db {
    async fn enqueue(&self, item: WorkItem) -> Result<WorkItem> {
        insert(self.pool(), &item).await
    }

    async fn enqueue_successor(
        &self,
        failed: WorkId,
        successor: WorkItem,
    ) -> Result<Option<WorkItem>> {
        let mut tx = self.pool().begin().await?;

        // The row lock on the failed attempt serializes concurrent retries
        // of it; the existence check below then sees any committed sibling.
        let locked: Option<(i64,)> = sqlx::query_as(
            "SELECT seq FROM work_items WHERE id = $1 AND deleted IS NULL FOR UPDATE",
        )
        .bind(failed.0)
        .fetch_optional(&mut *tx)
        .await?;
        let Some((seq,)) = locked else {
            return Ok(None);
        };

        let root = successor.original.unwrap_or(failed);
        let (superseded,): (bool,) = sqlx::query_as(
            "SELECT EXISTS (SELECT 1 FROM work_items
                            WHERE original = $1 AND seq > $2 AND deleted IS NULL)",
        )
        .bind(root.0)
        .bind(seq)
        .fetch_one(&mut *tx)
        .await?;
        if superseded {
            debug!(work_id = %failed, "later attempt exists, successor refused");
            return Ok(None);
        }

        let item = insert(&mut *tx, &successor).await?;
        tx.commit().await?;
        Ok(Some(item))
    }

    async fn find_by_id(&self, id: WorkId) -> Result<Option<WorkItem>> {
        let row: Option<WorkItemRow> =
            sqlx::query_as(&format!("SELECT {COLUMNS} FROM work_items WHERE id = $1"))
                .bind(id.0)
                .fetch_optional(self.pool())
                .await?;
        Ok(row.map(Into::into))
    }

    async fn find_many(
        &self,
        filter: &WorkFilter,
        page: Pagination,
        now: DateTime<Utc>,
    ) -> Result<Vec<WorkItem>> {
        let mut qb = QueryBuilder::<Postgres>::new(format!(
            "SELECT {COLUMNS} FROM work_items WHERE TRUE"
        ));
        push_filter(&mut qb, filter, now);
        qb.push(" ORDER BY created ASC, seq ASC LIMIT ");
        qb.push_bind(i64::from(page.limit));
        qb.push(" OFFSET ");
        qb.push_bind(i64::from(page.offset));

        let rows: Vec<WorkItemRow> = qb.build_query_as().fetch_all(self.pool()).await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn count(&self, filter: &WorkFilter, now: DateTime<Utc>) -> Result<u64> {
        let mut qb = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM work_items WHERE TRUE");
        push_filter(&mut qb, filter, now);
        let (n,): (i64,) = qb.build_query_as().fetch_one(self.pool()).await?;
        Ok(n.max(0) as u64)
    }

    async fn claim_next(
        &self,
        worker: &str,
        types: &[String],
        now: DateTime<Utc>,
    ) -> Result<Option<WorkItem>> {
        // SKIP LOCKED: a concurrent claimer moves on to the next candidate
        // instead of blocking on, or double-claiming, a locked row.
        let row: Option<WorkItemRow> = sqlx::query_as(&format!(
            "UPDATE work_items SET started = $1, worker = $2, updated = $1
             WHERE id = (
                 SELECT id FROM work_items
                 WHERE deleted IS NULL AND started IS NULL AND scheduled <= $1
                   AND (cardinality($3::text[]) = 0 OR work_type = ANY($3))
                 ORDER BY priority DESC, created ASC, seq ASC
                 LIMIT 1
                 FOR UPDATE SKIP LOCKED
             ) AND started IS NULL
             RETURNING {COLUMNS}"
        ))
        .bind(now)
        .bind(worker)
        .bind(types)
        .fetch_optional(self.pool())
        .await?;
        Ok(row.map(Into::into))
    }

    async fn finish(
        &self,
        id: WorkId,
        result: &WorkResult,
        now: DateTime<Utc>,
    ) -> Result<Option<WorkItem>> {
        let finished = result.finished.unwrap_or(now);
        let row: Option<WorkItemRow> = sqlx::query_as(&format!(
            "UPDATE work_items
             SET stopped = GREATEST($2, started), success = $3, result = $4, error = $5,
                 worker = COALESCE($6, worker), updated = $7
             WHERE id = $1 AND deleted IS NULL AND started IS NOT NULL AND stopped IS NULL
               AND EXTRACT(EPOCH FROM ($7{LEASE_AGE_MS} < timeout_ms
             RETURNING {COLUMNS}"
        ))
        .bind(id.0)
        .bind(finished)
        .bind(result.outcome.success)
        .bind(&result.outcome.result)
        .bind(&result.outcome.error)
        .bind(&result.worker)
        .bind(now)
        .fetch_optional(self.pool())
        .await?;
        Ok(row.map(Into::into))
    }

    async fn update(
        &self,
        id: WorkId,
        patch: &WorkPatch,
        now: DateTime<Utc>,
    ) -> Result<Option<WorkItem>> {
        let row: Option<WorkItemRow> = sqlx::query_as(&format!(
            "UPDATE work_items
             SET priority = COALESCE($2, priority), scheduled = COALESCE($3, scheduled),
                 input = COALESCE($4, input), retries = COALESCE($5, retries),
                 timeout_ms = COALESCE($6, timeout_ms), updated = $7
             WHERE id = $1 AND deleted IS NULL AND started IS NULL
             RETURNING {COLUMNS}"
        ))
        .bind(id.0)
        .bind(patch.priority)
        .bind(patch.scheduled)
        .bind(&patch.input)
        .bind(patch.retries.map(|r| i32::try_from(r).unwrap_or(i32::MAX)))
        .bind(patch.timeout_ms.map(to_i64))
        .bind(now)
        .fetch_optional(self.pool())
        .await?;
        Ok(row.map(Into::into))
    }

    async fn soft_delete(&self, id: WorkId, now: DateTime<Utc>) -> Result<Option<WorkItem>> {
        let row: Option<WorkItemRow> = sqlx::query_as(&format!(
            "UPDATE work_items SET deleted = $2, updated = $2
             WHERE id = $1 AND deleted IS NULL
               AND NOT (started IS NOT NULL AND stopped IS NULL
                        AND EXTRACT(EPOCH FROM ($2{LEASE_AGE_MS} < timeout_ms)
             RETURNING {COLUMNS}"
        ))
        .bind(id.0)
        .bind(now)
        .fetch_optional(self.pool())
        .await?;
        Ok(row.map(Into::into))
    }

    async fn expired_leases(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<WorkItem>> {
        let rows: Vec<WorkItemRow> = sqlx::query_as(&format!(
            "SELECT {COLUMNS} FROM work_items
             WHERE deleted IS NULL AND started IS NOT NULL AND stopped IS NULL
               AND EXTRACT(EPOCH FROM ($1{LEASE_AGE_MS} >= timeout_ms
             ORDER BY started ASC
             LIMIT $2"
        ))
        .bind(now)
        .bind(i64::from(limit))
        .fetch_all(self.pool())
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn types(&self) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT DISTINCT work_type FROM work_items WHERE deleted IS NULL ORDER BY work_type",
        )
        .fetch_all(self.pool())
        .await?;
        Ok(rows.into_iter().map(|(t,)| t).collect())
    }
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct WorkItemRow {
    id: Uuid,
    work_type: String,
    input: serde_json::Value,
    priority: i32,
    scheduled: DateTime<Utc>,
    created: DateTime<Utc>,
    updated: Option<DateTime<Utc>>,
    deleted: Option<DateTime<Utc>>,
    started: Option<DateTime<Utc>>,
    worker: Option<String>,
    stopped: Option<DateTime<Utc>>,
    result: Option<serde_json::Value>,
    error: Option<serde_json::Value>,
    success: Option<bool>,
    retries: i32,
    original: Option<Uuid>,
    timeout_ms: i64,
}

impl From<WorkItemRow> for WorkItem {
    fn from(row: WorkItemRow) -> Self {
        Self {
            id: WorkId(row.id),
            work_type: row.work_type,
            input: row.input,
            priority: row.priority,
            scheduled: row.scheduled,
            created: row.created,
            updated: row.updated,
            deleted: row.deleted,
            started: row.started,
            worker: row.worker,
            stopped: row.stopped,
            result: row.result,
            error: row.error,
            success: row.success,
            retries: row.retries.max(0) as u32,
            original: row.original.map(WorkId),
            timeout_ms: row.timeout_ms.max(0) as u64,
        }
    }
}
