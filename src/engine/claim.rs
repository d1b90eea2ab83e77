//! Claim strategy: which queue, how many, in what order, matching what.

use crate::store::{ClaimFilter, ClaimOrder};

/// Default batch size for a claim.
pub const DEFAULT_BATCH_SIZE: u32 = 15;

/// Selection parameters handed to [`WorkStore::claim_next`](crate::store::WorkStore::claim_next).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimStrategy {
    pub queue: String,
    /// Maximum items per claim. Always at least 1.
    pub limit: u32,
    pub order: ClaimOrder,
    pub filter: ClaimFilter,
}

impl ClaimStrategy {
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            limit: DEFAULT_BATCH_SIZE,
            order: ClaimOrder::default(),
            filter: ClaimFilter::default(),
        }
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = limit.max(1);
        self
    }

    pub fn order(mut self, order: ClaimOrder) -> Self {
        self.order = order;
        self
    }

    pub fn require_field(mut self, field: impl Into<String>) -> Self {
        self.filter = self.filter.require_field(field);
        self
    }
}
