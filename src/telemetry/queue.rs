//! Queue span helpers.
//!
//! Provides span creation and state-transition recording for messages
//! moving through the engine.

use tracing::Span;

use crate::model::MessageId;

/// Start a span for a reserve/take wait.
///
/// The `message.id` field is declared empty and filled once a claim wins.
pub fn start_claim_span(queue: &str, operation: &'static str) -> Span {
    tracing::info_span!(
        "queue.claim",
        "queue.name" = queue,
        "queue.operation" = operation,
        "message.id" = tracing::field::Empty,
        "queue.polls" = tracing::field::Empty,
    )
}

/// Record the winning claim on a claim span.
pub fn record_claim(span: &Span, id: MessageId, polls: u32) {
    span.record("message.id", id.0);
    span.record("queue.polls", polls);
}

/// Record a state transition event on the given span.
///
/// Emits a tracing `debug` event scoped to the span.
pub fn record_state_transition(span: &Span, id: MessageId, from: &str, to: &str) {
    span.in_scope(|| {
        tracing::debug!(id = %id, from = from, to = to, "state_transition");
    });
}
