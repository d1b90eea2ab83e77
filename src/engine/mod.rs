//! Batch engine: claim strategy and the runner loop.

pub mod claim;
pub mod runner;

pub use claim::ClaimStrategy;
pub use runner::{
    AbortReason, BatchRunner, RunOutcome, RunReport, RunState, RunSummary, RunnerConfig,
};
