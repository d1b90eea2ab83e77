//! In-process store.
//!
//! Every operation runs inside one mutex critical section, which makes each
//! of them atomic with respect to other runners sharing the same store.
//! Used by tests and by embedders that do not need durability.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::*;
use crate::error::Error;

#[derive(Default)]
struct Inner {
    /// Insertion order doubles as claim order for `OldestFirst`.
    items: Vec<WorkItem>,
    artifacts: HashMap<WorkId, Vec<Artifact>>,
}

impl Inner {
    fn find_mut(&mut self, id: WorkId) -> Result<&mut WorkItem> {
        self.items
            .iter_mut()
            .find(|item| item.id == id)
            .ok_or_else(|| Error::NotFound(format!("work item {id}")))
    }

    fn claimable<'a>(
        &'a self,
        strategy: &'a ClaimStrategy,
    ) -> impl Iterator<Item = (usize, &'a WorkItem)> + 'a {
        self.items.iter().enumerate().filter(move |(_, item)| {
            item.status == Status::Pending
                && item.queue == strategy.queue
                && strategy.filter.matches(&item.payload)
        })
    }
}

/// Store backed by process memory.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| Error::Other("memory store lock poisoned".to_string()))
    }
}

/// Find the claimed item and check the caller still holds its claim.
fn held_claim<'a>(inner: &'a mut Inner, item: &WorkItem) -> Result<&'a mut WorkItem> {
    let stored = inner.find_mut(item.id)?;
    if stored.status != Status::Claimed || stored.claim_token != item.claim_token {
        return Err(Error::ClaimLost(item.id));
    }
    Ok(stored)
}

#[async_trait]
impl WorkStore for MemoryStore {
    async fn submit(&self, new: NewWorkItem) -> Result<SubmitResult> {
        let mut inner = self.lock()?;

        if let Some(ref key) = new.dedup_key {
            let existing = inner
                .items
                .iter()
                .find(|item| item.queue == new.queue && item.dedup_key.as_ref() == Some(key));
            if let Some(existing) = existing {
                return Ok(SubmitResult::Duplicate {
                    existing: existing.id,
                });
            }
        }

        let item = new.into_item(Utc::now());
        inner.items.push(item.clone());
        Ok(SubmitResult::Created(Box::new(item)))
    }

    async fn get(&self, id: WorkId) -> Result<WorkItem> {
        let mut inner = self.lock()?;
        inner.find_mut(id).map(|item| item.clone())
    }

    async fn list(&self, query: &ListQuery) -> Result<Vec<WorkItem>> {
        let inner = self.lock()?;
        Ok(inner
            .items
            .iter()
            .filter(|item| query.status.is_none_or(|s| item.status.name() == s))
            .filter(|item| query.queue.as_ref().is_none_or(|q| &item.queue == q))
            .take(query.limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn counts(&self, queue: &str) -> Result<StatusCounts> {
        let inner = self.lock()?;
        let mut counts = StatusCounts::default();
        for item in inner.items.iter().filter(|item| item.queue == queue) {
            counts.add(item.status.name(), 1);
        }
        Ok(counts)
    }

    async fn artifacts(&self, id: WorkId) -> Result<Vec<Artifact>> {
        let inner = self.lock()?;
        let mut artifacts = inner.artifacts.get(&id).cloned().unwrap_or_default();
        artifacts.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(artifacts)
    }

    async fn claim_next(
        &self,
        strategy: &ClaimStrategy,
        now: DateTime<Utc>,
    ) -> Result<Vec<WorkItem>> {
        let mut inner = self.lock()?;

        let mut candidates: Vec<(usize, i32)> = inner
            .claimable(strategy)
            .filter(|(_, item)| item.available_at <= now)
            .map(|(idx, item)| (idx, item.priority))
            .collect();
        if strategy.order == ClaimOrder::Priority {
            // Stable sort keeps insertion order among equal priorities.
            candidates.sort_by(|a, b| b.1.cmp(&a.1));
        }
        candidates.truncate(strategy.limit as usize);

        let mut claimed = Vec::with_capacity(candidates.len());
        for (idx, _) in candidates {
            let item = &mut inner.items[idx];
            item.status = Status::Claimed;
            item.claim_token = Some(Uuid::new_v4());
            item.claimed_at = Some(now);
            item.attempts += 1;
            item.updated_at = now;
            claimed.push(item.clone());
        }
        Ok(claimed)
    }

    async fn record_result(&self, item: &WorkItem, resolution: &Resolution) -> Result<WorkItem> {
        let mut inner = self.lock()?;
        let now = Utc::now();

        let stored = held_claim(&mut inner, item)?;
        let to = resolution.status();
        if !stored.status.can_transition_to(to) {
            return Err(Error::InvalidTransition {
                from: stored.status,
                to,
            });
        }
        stored.status = to;
        stored.claim_token = None;
        stored.claimed_at = None;
        stored.updated_at = now;
        match resolution {
            Resolution::Done { output, .. } => {
                stored.output = Some(output.clone());
                stored.last_error = None;
                stored.completed_at = Some(now);
            }
            Resolution::Requeue {
                available_at,
                error,
            } => {
                stored.available_at = *available_at;
                stored.last_error = Some(error.clone());
            }
            Resolution::Failed { error, .. } => {
                stored.last_error = Some(error.clone());
                stored.completed_at = Some(now);
            }
            Resolution::Skipped { reason } => {
                stored.last_error = Some(reason.clone());
                stored.completed_at = Some(now);
            }
        }
        let updated = stored.clone();

        if let Resolution::Done { artifacts, .. } = resolution {
            // Replace, never append: a previous partial attempt leaves nothing behind.
            inner.artifacts.insert(item.id, artifacts.clone());
        }

        Ok(updated)
    }

    async fn release(&self, item: &WorkItem) -> Result<()> {
        let mut inner = self.lock()?;
        let stored = held_claim(&mut inner, item)?;
        stored.status = Status::Pending;
        stored.claim_token = None;
        stored.claimed_at = None;
        stored.attempts = stored.attempts.saturating_sub(1);
        stored.updated_at = Utc::now();
        Ok(())
    }

    async fn touch(&self, item: &WorkItem) -> Result<()> {
        let mut inner = self.lock()?;
        let stored = held_claim(&mut inner, item)?;
        let now = Utc::now();
        stored.claimed_at = Some(now);
        stored.updated_at = now;
        Ok(())
    }

    async fn reclaim_stale(
        &self,
        queue: Option<&str>,
        older_than: DateTime<Utc>,
        default_max_attempts: u32,
    ) -> Result<Reclaimed> {
        let mut inner = self.lock()?;
        let now = Utc::now();
        let mut reclaimed = Reclaimed::default();

        for item in inner.items.iter_mut() {
            let stale = item.status == Status::Claimed
                && queue.is_none_or(|q| item.queue == q)
                && item.claimed_at.is_some_and(|at| at < older_than);
            if !stale {
                continue;
            }
            item.claim_token = None;
            item.claimed_at = None;
            item.updated_at = now;
            if item.attempts >= item.attempt_limit(default_max_attempts) {
                item.status = Status::Failed(FailureKind::RetriesExhausted);
                item.last_error = Some("claim went stale on the final attempt".to_string());
                item.completed_at = Some(now);
                reclaimed.exhausted += 1;
            } else {
                item.status = Status::Pending;
                item.available_at = now;
                reclaimed.requeued += 1;
            }
        }
        Ok(reclaimed)
    }

    async fn next_available_at(
        &self,
        strategy: &ClaimStrategy,
    ) -> Result<Option<DateTime<Utc>>> {
        let inner = self.lock()?;
        Ok(inner
            .claimable(strategy)
            .map(|(_, item)| item.available_at)
            .min())
    }
}
