//! GenAI semantic convention span helpers for LLM operations.
//!
//! Uses OpenTelemetry GenAI semantic conventions:
//! - `gen_ai.operation.name`
//! - `gen_ai.request.model`
//! - `gen_ai.provider.name`

use tracing::Span;

/// Start a span for a chat/completion operation.
///
/// The response size field is declared empty and filled via
/// [`record_response_length`].
pub fn start_chat_span(model: &str, provider: &str) -> Span {
    tracing::info_span!(
        "gen_ai.chat",
        "gen_ai.operation.name" = "chat",
        "gen_ai.request.model" = model,
        "gen_ai.provider.name" = provider,
        "gen_ai.response.chars" = tracing::field::Empty,
    )
}

/// Record the size of the generated text on a span from [`start_chat_span`].
pub fn record_response_length(span: &Span, chars: usize) {
    span.record("gen_ai.response.chars", chars as u64);
}
