//! Work item store contract.
//!
//! A store holds work items and performs every status transition
//! atomically. Correctness across concurrent runners rests entirely on
//! three guarantees implemented here:
//!
//! - `claim_next` selects and marks items in one atomic step, so no two
//!   callers ever receive the same item.
//! - `record_result` only applies while the caller still holds the claim
//!   (matching `claim_token`), so a late result from a reclaimed claim is
//!   rejected with [`Error::ClaimLost`](crate::error::Error::ClaimLost).
//! - `reclaim_stale` returns claims abandoned by crashed runners.
//!
//! Two backends: [`memory::MemoryStore`] and the SQLite-backed
//! [`Db`](crate::db::Db).

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::engine::claim::ClaimStrategy;
use crate::error::Result;
use crate::model::*;

pub use memory::MemoryStore;

/// Result of submitting work.
#[derive(Debug)]
pub enum SubmitResult {
    /// New work item was created as Pending.
    Created(Box<WorkItem>),
    /// An item with the same `(queue, dedup_key)` already exists.
    Duplicate { existing: WorkId },
}

/// What to write back for a claimed item.
#[derive(Debug, Clone)]
pub enum Resolution {
    /// Success. Artifacts replace any the item had before.
    Done {
        output: serde_json::Value,
        artifacts: Vec<Artifact>,
    },
    /// Back to Pending, claimable again from `available_at`.
    Requeue {
        available_at: DateTime<Utc>,
        error: String,
    },
    Failed {
        kind: FailureKind,
        error: String,
    },
    Skipped {
        reason: String,
    },
}

impl Resolution {
    /// Status the item ends up in.
    pub fn status(&self) -> Status {
        match self {
            Resolution::Done { .. } => Status::Done,
            Resolution::Requeue { .. } => Status::Pending,
            Resolution::Failed { kind, .. } => Status::Failed(*kind),
            Resolution::Skipped { .. } => Status::Skipped,
        }
    }
}

/// Payload predicate applied at claim time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClaimFilter {
    /// Top-level payload fields that must be present and non-null.
    pub required_fields: Vec<String>,
}

impl ClaimFilter {
    pub fn require_field(mut self, field: impl Into<String>) -> Self {
        self.required_fields.push(field.into());
        self
    }

    /// Evaluate against a payload (used by in-process stores).
    pub fn matches(&self, payload: &serde_json::Value) -> bool {
        self.required_fields
            .iter()
            .all(|field| payload.get(field).is_some_and(|v| !v.is_null()))
    }
}

/// Selection order within a claim.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimOrder {
    /// Insertion order.
    #[default]
    OldestFirst,
    /// Priority descending, then insertion order.
    Priority,
}

/// Filter for read-side listing.
#[derive(Debug, Clone)]
pub struct ListQuery {
    pub status: Option<StatusName>,
    pub queue: Option<String>,
    pub limit: i64,
}

impl Default for ListQuery {
    fn default() -> Self {
        Self {
            status: None,
            queue: None,
            limit: 20,
        }
    }
}

/// Outcome of a stale-claim sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Reclaimed {
    /// Returned to Pending.
    pub requeued: u64,
    /// Had already used up their attempts; moved to Failed.
    pub exhausted: u64,
}

impl Reclaimed {
    pub fn total(&self) -> u64 {
        self.requeued + self.exhausted
    }
}

#[async_trait]
pub trait WorkStore: Send + Sync {
    /// Ingest a new Pending item, unless its dedup key is already known.
    async fn submit(&self, new: NewWorkItem) -> Result<SubmitResult>;

    async fn get(&self, id: WorkId) -> Result<WorkItem>;

    async fn list(&self, query: &ListQuery) -> Result<Vec<WorkItem>>;

    async fn counts(&self, queue: &str) -> Result<StatusCounts>;

    /// Derived rows of an item, in key order.
    async fn artifacts(&self, id: WorkId) -> Result<Vec<Artifact>>;

    /// Atomically claim up to `strategy.limit` available Pending items.
    ///
    /// Each returned item is Claimed, carries a fresh `claim_token`, and has
    /// had `attempts` incremented. Items come back in claim order.
    async fn claim_next(&self, strategy: &ClaimStrategy, now: DateTime<Utc>)
    -> Result<Vec<WorkItem>>;

    /// Write the resolution of a claimed item. Fails with `ClaimLost` if
    /// the claim is no longer held.
    async fn record_result(&self, item: &WorkItem, resolution: &Resolution) -> Result<WorkItem>;

    /// Give a claim back without consuming the attempt.
    async fn release(&self, item: &WorkItem) -> Result<()>;

    /// Refresh `claimed_at` on a held claim so stale recovery leaves it
    /// alone. Fails with `ClaimLost` once the claim has been taken back.
    async fn touch(&self, item: &WorkItem) -> Result<()>;

    /// Return claims older than `older_than` to Pending. Items that had
    /// already reached their attempt limit (default `default_max_attempts`)
    /// become `Failed(RetriesExhausted)` instead.
    async fn reclaim_stale(
        &self,
        queue: Option<&str>,
        older_than: DateTime<Utc>,
        default_max_attempts: u32,
    ) -> Result<Reclaimed>;

    /// Earliest `available_at` among Pending items matching the strategy's
    /// queue and filter, claimable now or later.
    async fn next_available_at(&self, strategy: &ClaimStrategy)
    -> Result<Option<DateTime<Utc>>>;
}
