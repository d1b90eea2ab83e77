//! Error types for caseflow.
//!
//! Store and configuration failures live here. Failures of a single work
//! item's processing are `step::StepError` and never surface as `Error`.

use thiserror::Error;

use crate::model::{Status, WorkId};

#[derive(Debug, Error)]
pub enum Error {
    #[error("work item not found: {0}")]
    NotFound(String),

    #[error("invalid status transition: {from} -> {to}")]
    InvalidTransition { from: Status, to: Status },

    /// The claim under which a result was produced is no longer held.
    #[error("claim lost for work item {0}")]
    ClaimLost(WorkId),

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
