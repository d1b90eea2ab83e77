//! Work item span helpers.
//!
//! Provides span creation and state-transition recording for work items
//! flowing through the runner.

use tracing::Span;

use crate::model::{Status, WorkItem};

/// Start a span for processing one claimed item.
///
/// The `work.state` field is declared empty and updated via
/// [`record_state_transition`].
pub fn start_item_span(step: &str, item: &WorkItem) -> Span {
    tracing::info_span!(
        "work.process",
        "work.step" = step,
        "work.queue" = %item.queue,
        "work.id" = %item.id.0,
        "work.attempt" = item.attempts,
        "work.state" = tracing::field::Empty,
    )
}

/// Record a state transition on the item span.
///
/// Emits a tracing `info` event scoped to the span.
pub fn record_state_transition(span: &Span, from: Status, to: Status) {
    span.record("work.state", tracing::field::display(to));
    span.in_scope(|| {
        tracing::info!(from = %from, to = %to, "state_transition");
    });
}
