//! Core data model.
//!
//! A work item is one unit of batch-processable work (in the case pipelines,
//! one case). It has identity, an opaque payload, and a lifecycle status.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Work Item
// ---------------------------------------------------------------------------

/// A unit of work tracked by the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    /// Unique identifier, stable across retries.
    pub id: WorkId,

    /// Pipeline this item belongs to (e.g. "webp", "seo").
    pub queue: String,

    /// Ingestion key, unique per queue whatever the status: a finished
    /// item still blocks resubmission under its key.
    pub dedup_key: Option<String>,

    /// Input for the processing step. The runner never interprets it.
    pub payload: serde_json::Value,

    /// Higher = more urgent. Only consulted by priority ordering.
    pub priority: i32,

    pub status: Status,

    /// Number of claims so far. Incremented when the item is claimed.
    pub attempts: u32,

    /// Retry bound. None = use the runner default.
    pub max_attempts: Option<u32>,

    /// Token of the active claim, if any.
    pub claim_token: Option<Uuid>,

    pub claimed_at: Option<DateTime<Utc>>,

    /// Earliest time a Pending item may be claimed (retry backoff).
    pub available_at: DateTime<Utc>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,

    pub last_error: Option<String>,

    /// Step output, set when the item is Done.
    pub output: Option<serde_json::Value>,
}

impl WorkItem {
    /// The dedup key if present, otherwise the full UUID. Used to derive
    /// deterministic object keys.
    pub fn stable_key(&self) -> String {
        self.dedup_key
            .clone()
            .unwrap_or_else(|| self.id.0.to_string())
    }

    /// Effective retry bound given the runner default.
    pub fn attempt_limit(&self, default_max: u32) -> u32 {
        self.max_attempts.unwrap_or(default_max)
    }
}

/// Newtype for work item IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkId(pub Uuid);

impl WorkId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for WorkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short display: first 8 chars of UUID
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

impl Default for WorkId {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Lifecycle status of a work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// Waiting to be claimed.
    Pending,
    /// Held by exactly one runner.
    Claimed,
    /// Processed successfully. Terminal.
    Done,
    /// Will not be processed again. Terminal.
    Failed(FailureKind),
    /// Nothing to do for this item. Terminal.
    Skipped,
}

/// Why an item ended up Failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The step reported a non-retryable error.
    Fatal,
    /// The external call succeeded but returned unusable data.
    MalformedResult,
    /// Retryable errors until the attempt bound was reached.
    RetriesExhausted,
}

impl Status {
    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: Status) -> bool {
        use Status::*;
        matches!(
            (self, to),
            (Pending, Claimed)
                | (Claimed, Pending)    // retry requeue, stale reclaim, release
                | (Claimed, Done)
                | (Claimed, Failed(_))
                | (Claimed, Skipped)
        )
    }

    /// Is this a terminal status?
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Done | Status::Failed(_) | Status::Skipped)
    }

    pub fn name(self) -> StatusName {
        match self {
            Status::Pending => StatusName::Pending,
            Status::Claimed => StatusName::Claimed,
            Status::Done => StatusName::Done,
            Status::Failed(_) => StatusName::Failed,
            Status::Skipped => StatusName::Skipped,
        }
    }

    pub fn failure_kind(self) -> Option<FailureKind> {
        match self {
            Status::Failed(kind) => Some(kind),
            _ => None,
        }
    }

    /// Rebuild a status from its stored name and failure kind.
    pub fn from_parts(name: &str, kind: Option<&str>) -> Result<Self> {
        Ok(match name.parse::<StatusName>()? {
            StatusName::Pending => Status::Pending,
            StatusName::Claimed => Status::Claimed,
            StatusName::Done => Status::Done,
            StatusName::Skipped => Status::Skipped,
            StatusName::Failed => {
                let kind = kind
                    .ok_or_else(|| Error::Other("failed status without failure kind".into()))?;
                Status::Failed(kind.parse()?)
            }
        })
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Failed(kind) => write!(f, "failed({kind})"),
            other => write!(f, "{}", other.name()),
        }
    }
}

/// Status without payload, for filtering and counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusName {
    Pending,
    Claimed,
    Done,
    Failed,
    Skipped,
}

impl StatusName {
    pub fn as_str(self) -> &'static str {
        match self {
            StatusName::Pending => "pending",
            StatusName::Claimed => "claimed",
            StatusName::Done => "done",
            StatusName::Failed => "failed",
            StatusName::Skipped => "skipped",
        }
    }
}

impl fmt::Display for StatusName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StatusName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(StatusName::Pending),
            "claimed" => Ok(StatusName::Claimed),
            "done" => Ok(StatusName::Done),
            "failed" => Ok(StatusName::Failed),
            "skipped" => Ok(StatusName::Skipped),
            _ => Err(Error::Other(format!("unknown status: {s}"))),
        }
    }
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::Fatal => "fatal",
            FailureKind::MalformedResult => "malformed_result",
            FailureKind::RetriesExhausted => "retries_exhausted",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FailureKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "fatal" => Ok(FailureKind::Fatal),
            "malformed_result" => Ok(FailureKind::MalformedResult),
            "retries_exhausted" => Ok(FailureKind::RetriesExhausted),
            _ => Err(Error::Other(format!("unknown failure kind: {s}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Derived rows
// ---------------------------------------------------------------------------

/// A derived row produced by processing an item (an uploaded image, a page
/// snapshot, SEO metadata). Replaced wholesale each time the item completes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub kind: String,
    /// Deterministic key, e.g. `cases/<case>/1.webp`.
    pub key: String,
    pub data: serde_json::Value,
}

impl Artifact {
    pub fn new(kind: impl Into<String>, key: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            kind: kind.into(),
            key: key.into(),
            data,
        }
    }
}

/// Per-status item counts for one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub pending: u64,
    pub claimed: u64,
    pub done: u64,
    pub failed: u64,
    pub skipped: u64,
}

impl StatusCounts {
    pub fn add(&mut self, name: StatusName, n: u64) {
        match name {
            StatusName::Pending => self.pending += n,
            StatusName::Claimed => self.claimed += n,
            StatusName::Done => self.done += n,
            StatusName::Failed => self.failed += n,
            StatusName::Skipped => self.skipped += n,
        }
    }

    pub fn total(&self) -> u64 {
        self.pending + self.claimed + self.done + self.failed + self.skipped
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builder for ingesting new work items.
#[derive(Debug, Clone)]
pub struct NewWorkItem {
    pub(crate) queue: String,
    pub(crate) dedup_key: Option<String>,
    pub(crate) payload: serde_json::Value,
    pub(crate) priority: i32,
    pub(crate) max_attempts: Option<u32>,
}

impl NewWorkItem {
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            dedup_key: None,
            payload: serde_json::Value::Null,
            priority: 0,
            max_attempts: None,
        }
    }

    pub fn dedup_key(mut self, key: impl Into<String>) -> Self {
        self.dedup_key = Some(key.into());
        self
    }

    pub fn payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn max_attempts(mut self, n: u32) -> Self {
        self.max_attempts = Some(n);
        self
    }

    /// Materialize as a fresh Pending item.
    pub(crate) fn into_item(self, now: DateTime<Utc>) -> WorkItem {
        WorkItem {
            id: WorkId::new(),
            queue: self.queue,
            dedup_key: self.dedup_key,
            payload: self.payload,
            priority: self.priority,
            status: Status::Pending,
            attempts: 0,
            max_attempts: self.max_attempts,
            claim_token: None,
            claimed_at: None,
            available_at: now,
            created_at: now,
            updated_at: now,
            completed_at: None,
            last_error: None,
            output: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses_cannot_be_left() {
        for terminal in [
            Status::Done,
            Status::Skipped,
            Status::Failed(FailureKind::Fatal),
        ] {
            assert!(terminal.is_terminal());
            for to in [Status::Pending, Status::Claimed, Status::Done] {
                assert!(!terminal.can_transition_to(to), "{terminal} -> {to}");
            }
        }
    }

    #[test]
    fn pending_only_moves_to_claimed() {
        assert!(Status::Pending.can_transition_to(Status::Claimed));
        assert!(!Status::Pending.can_transition_to(Status::Done));
        assert!(!Status::Pending.can_transition_to(Status::Failed(FailureKind::Fatal)));
    }

    #[test]
    fn status_parts_round_trip_through_storage_columns() {
        let failed = Status::Failed(FailureKind::MalformedResult);
        let rebuilt = Status::from_parts(
            failed.name().as_str(),
            failed.failure_kind().map(FailureKind::as_str),
        )
        .unwrap();
        assert_eq!(rebuilt, failed);
        assert!(Status::from_parts("failed", None).is_err());
        assert!(Status::from_parts("running", None).is_err());
    }

    #[test]
    fn work_id_displays_short_prefix() {
        let id = WorkId::new();
        assert_eq!(id.to_string().len(), 8);
        assert!(id.0.to_string().starts_with(&id.to_string()));
    }
}
