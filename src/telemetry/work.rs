//! Span helpers for items flowing through the queue driver.

use tracing::Span;
use uuid::Uuid;

use crate::model::ItemState;

/// Span covering one item from gate check to finalization.
///
/// `item.status` is declared empty and filled once the remote platform
/// reports a terminal status.
pub fn start_item_span(run_id: &Uuid, identifier: u64) -> Span {
    tracing::info_span!(
        "queue.item",
        "run.id" = %run_id,
        "item.identifier" = identifier,
        "item.status" = tracing::field::Empty,
    )
}

/// Record the remote terminal status on an item span.
pub fn record_remote_status(span: &Span, status: &str) {
    span.record("item.status", status);
}

/// Emit a state transition event scoped to the given span.
pub fn record_state_transition(span: &Span, from: ItemState, to: ItemState) {
    span.in_scope(|| {
        tracing::debug!(from = %from, to = %to, "state_transition");
    });
}
