//! Work execution span helpers.
//!
//! Provides span creation and status-transition recording for work items
//! flowing through the queue.

use tracing::Span;

use crate::model::{WorkId, WorkStatus};

/// Start a span for work item execution.
///
/// The `work.status` field is declared empty and can be updated via
/// [`record_status_transition`].
pub fn start_work_span(work_type: &str, work_id: &WorkId) -> Span {
    tracing::info_span!(
        "work.execute",
        "work.type" = work_type,
        "work.id" = %work_id,
        "work.status" = tracing::field::Empty,
    )
}

/// Start a span for an inline `do_work` call. No work item exists.
pub fn start_inline_span(work_type: &str) -> Span {
    tracing::info_span!("work.inline", "work.type" = work_type)
}

/// Record a status transition on the given span.
///
/// Emits a tracing `info` event scoped to the span and updates `work.status`.
pub fn record_status_transition(span: &Span, from: WorkStatus, to: WorkStatus) {
    span.record("work.status", tracing::field::display(to));
    span.in_scope(|| {
        tracing::info!(%from, %to, "status_transition");
    });
}
