//! # caseflow
//!
//! Status-driven batch processing: claim work items from a store, run a
//! fallible external step on each, record the outcome, back off, repeat.
//!
//! Stores are SQLite (via sqlx) or in-memory, steps are pluggable
//! ([`step::ProcessingStep`]), and every run is observable through
//! tracing and OpenTelemetry.

pub mod backoff;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod llm;
pub mod model;
pub mod step;
pub mod store;
pub mod telemetry;
