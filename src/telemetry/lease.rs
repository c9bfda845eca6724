//! Lease operation span helpers.
//!
//! Spans wrap one protocol operation (claim, complete, sweep) against one
//! session, optionally narrowed to a page.

use tracing::Span;

use crate::model::{PageNumber, SessionId};

/// Start a span for a lease operation.
///
/// The `lease.status` field is declared empty and can be updated via
/// [`record_status_transition`].
pub fn start_lease_span(operation: &str, session_id: SessionId, page: Option<PageNumber>) -> Span {
    tracing::info_span!(
        "lease.operation",
        "lease.operation" = operation,
        "lease.session_id" = %session_id,
        "lease.page" = page.map(|p| p.get()),
        "lease.status" = tracing::field::Empty,
    )
}

/// Record a page status transition on the given span.
pub fn record_status_transition(span: &Span, from: &str, to: &str) {
    span.record("lease.status", to);
    span.in_scope(|| {
        tracing::info!(from = from, to = to, "status_transition");
    });
}
