//! Core data model.
//!
//! A work item is a unit of schedulable work. Its lifecycle status is never
//! stored; it is derived from the timestamps on every read (see [`crate::status`]).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Error;

// ---------------------------------------------------------------------------
// Work Item
// ---------------------------------------------------------------------------

/// A unit of work tracked by the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    /// Unique identifier.
    pub id: WorkId,

    /// Selects the handler / worker category (e.g. "EMAIL", "HTTP_REQUEST").
    #[serde(rename = "type")]
    pub work_type: String,

    /// Opaque payload for the handler. The queue doesn't interpret it.
    pub input: serde_json::Value,

    /// Higher claims before lower at equal eligibility.
    pub priority: i32,

    /// Not eligible for allocation before this instant.
    pub scheduled: DateTime<Utc>,

    pub created: DateTime<Utc>,
    pub updated: Option<DateTime<Utc>>,
    /// Logical removal. Deleted items are excluded from default queries.
    pub deleted: Option<DateTime<Utc>>,

    /// Set exactly once, by allocation.
    pub started: Option<DateTime<Utc>>,
    /// Process/host that holds or held the lease.
    pub worker: Option<String>,
    /// Set when execution concludes, success or failure.
    pub stopped: Option<DateTime<Utc>>,

    pub result: Option<serde_json::Value>,
    /// May be present even when `success` is true (partial failure).
    pub error: Option<serde_json::Value>,
    /// Only set together with `stopped`.
    pub success: Option<bool>,

    /// Remaining retry budget.
    pub retries: u32,

    /// Root of the retry chain this item belongs to. Never mutated.
    pub original: Option<WorkId>,

    /// Maximum lease duration in milliseconds.
    pub timeout_ms: u64,
}

impl WorkItem {
    /// Derived lifecycle status at `now`.
    pub fn status(&self, now: DateTime<Utc>) -> WorkStatus {
        crate::status::derive_status(self, now)
    }

    /// When the current lease is considered abandoned, if leased.
    pub fn lease_deadline(&self) -> Option<DateTime<Utc>> {
        self.started
            .map(|started| crate::status::lease_deadline(started, self.timeout_ms))
    }

    /// Root of the retry chain: `original` or the item itself.
    pub fn chain_root(&self) -> WorkId {
        self.original.unwrap_or(self.id)
    }
}

/// Newtype for work item IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkId(pub Uuid);

impl WorkId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// First 8 chars of the UUID, for tables.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl std::fmt::Display for WorkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Default for WorkId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::str::FromStr for WorkId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(Error::InvalidId("work id is empty".to_string()));
        }
        Uuid::parse_str(s)
            .map(WorkId)
            .map_err(|e| Error::InvalidId(format!("{s}: {e}")))
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Derived lifecycle status of a work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkStatus {
    /// Not yet claimed.
    New,
    /// Leased by a worker, lease not yet expired.
    Allocated,
    /// Finished unsuccessfully, or lease expired.
    Failed,
    /// Finished successfully.
    Success,
    /// Logically removed. Terminal.
    Deleted,
}

impl WorkStatus {
    pub const ALL: [WorkStatus; 5] = [
        WorkStatus::New,
        WorkStatus::Allocated,
        WorkStatus::Failed,
        WorkStatus::Success,
        WorkStatus::Deleted,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkStatus::Failed | WorkStatus::Success | WorkStatus::Deleted
        )
    }
}

impl std::fmt::Display for WorkStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WorkStatus::New => "NEW",
            WorkStatus::Allocated => "ALLOCATED",
            WorkStatus::Failed => "FAILED",
            WorkStatus::Success => "SUCCESS",
            WorkStatus::Deleted => "DELETED",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for WorkStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "NEW" => Ok(WorkStatus::New),
            "ALLOCATED" => Ok(WorkStatus::Allocated),
            "FAILED" => Ok(WorkStatus::Failed),
            "SUCCESS" => Ok(WorkStatus::Success),
            "DELETED" => Ok(WorkStatus::Deleted),
            _ => Err(Error::InvalidInput(format!("unknown work status: {s}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// What a handler produced. `error` alongside `success = true` records a
/// non-fatal warning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkOutcome {
    pub success: bool,
    pub result: Option<serde_json::Value>,
    pub error: Option<serde_json::Value>,
}

impl WorkOutcome {
    pub fn ok(result: serde_json::Value) -> Self {
        Self {
            success: true,
            result: Some(result),
            error: None,
        }
    }

    /// Success that still carries error detail.
    pub fn partial(result: serde_json::Value, error: serde_json::Value) -> Self {
        Self {
            success: true,
            result: Some(result),
            error: Some(error),
        }
    }

    pub fn failed(error: serde_json::Value) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(error),
        }
    }
}

/// Everything a worker reports when it finishes an allocated item.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkResult {
    pub outcome: WorkOutcome,
    /// Reporting worker; replaces the stored `worker` when set.
    pub worker: Option<String>,
    /// Worker-observed start. The allocation timestamp stays authoritative.
    pub started: Option<DateTime<Utc>>,
    /// Defaults to the queue's clock.
    pub finished: Option<DateTime<Utc>>,
}

impl From<WorkOutcome> for WorkResult {
    fn from(outcome: WorkOutcome) -> Self {
        Self {
            outcome,
            worker: None,
            started: None,
            finished: None,
        }
    }
}

impl WorkResult {
    pub fn worker(mut self, worker: impl Into<String>) -> Self {
        self.worker = Some(worker.into());
        self
    }

    pub fn started(mut self, started: DateTime<Utc>) -> Self {
        self.started = Some(started);
        self
    }

    pub fn finished(mut self, finished: DateTime<Utc>) -> Self {
        self.finished = Some(finished);
        self
    }
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

/// Listing filter. An empty `statuses` means every status except `DELETED`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkFilter {
    pub statuses: Vec<WorkStatus>,
    pub types: Vec<String>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    /// Only items whose retry chain root is this id (the root itself excluded).
    pub original: Option<WorkId>,
}

impl WorkFilter {
    pub fn statuses(mut self, statuses: impl IntoIterator<Item = WorkStatus>) -> Self {
        self.statuses = statuses.into_iter().collect();
        self
    }

    pub fn types<S: Into<String>>(mut self, types: impl IntoIterator<Item = S>) -> Self {
        self.types = types.into_iter().map(Into::into).collect();
        self
    }

    pub fn original(mut self, root: WorkId) -> Self {
        self.original = Some(root);
        self
    }

    /// Does `item` pass this filter at `now`?
    pub fn matches(&self, item: &WorkItem, now: DateTime<Utc>) -> bool {
        let status = item.status(now);
        let status_ok = if self.statuses.is_empty() {
            status != WorkStatus::Deleted
        } else {
            self.statuses.contains(&status)
        };
        status_ok
            && (self.types.is_empty() || self.types.contains(&item.work_type))
            && self.created_after.is_none_or(|t| item.created >= t)
            && self.created_before.is_none_or(|t| item.created < t)
            && self.original.is_none_or(|root| item.original == Some(root))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pagination {
    pub limit: u32,
    pub offset: u32,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            limit: 50,
            offset: 0,
        }
    }
}

impl Pagination {
    pub fn new(limit: u32, offset: u32) -> Self {
        Self { limit, offset }
    }
}

/// Operator changes to an item that has not been allocated yet.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkPatch {
    pub priority: Option<i32>,
    pub scheduled: Option<DateTime<Utc>>,
    pub input: Option<serde_json::Value>,
    pub retries: Option<u32>,
    pub timeout_ms: Option<u64>,
}

impl WorkPatch {
    pub fn is_empty(&self) -> bool {
        self == &WorkPatch::default()
    }

    pub(crate) fn apply(&self, item: &mut WorkItem) {
        if let Some(priority) = self.priority {
            item.priority = priority;
        }
        if let Some(scheduled) = self.scheduled {
            item.scheduled = scheduled;
        }
        if let Some(ref input) = self.input {
            item.input = input.clone();
        }
        if let Some(retries) = self.retries {
            item.retries = retries;
        }
        if let Some(timeout_ms) = self.timeout_ms {
            item.timeout_ms = timeout_ms;
        }
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builder for enqueueing work. Unset fields fall back to per-type defaults,
/// then to the queue defaults.
#[derive(Debug, Clone)]
pub struct NewWorkItem {
    pub(crate) work_type: String,
    pub(crate) input: serde_json::Value,
    pub(crate) priority: Option<i32>,
    pub(crate) retries: Option<u32>,
    pub(crate) scheduled: Option<DateTime<Utc>>,
    pub(crate) timeout_ms: Option<u64>,
}

impl NewWorkItem {
    pub fn new(work_type: impl Into<String>) -> Self {
        Self {
            work_type: work_type.into(),
            input: serde_json::Value::Null,
            priority: None,
            retries: None,
            scheduled: None,
            timeout_ms: None,
        }
    }

    pub fn input(mut self, input: serde_json::Value) -> Self {
        self.input = input;
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    pub fn scheduled(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled = Some(at);
        self
    }

    pub fn timeout_ms(mut self, ms: u64) -> Self {
        self.timeout_ms = Some(ms);
        self
    }

    pub fn work_type(&self) -> &str {
        &self.work_type
    }
}
