//! Reconcile span helpers.
//!
//! Provides span creation and outcome recording for work items flowing
//! through the dispatcher.

use tracing::Span;

use crate::model::{EventKind, Key};

/// Start a span for one reconcile attempt.
///
/// The `reconcile.outcome` field is declared empty and can be filled via
/// [`record_outcome`].
pub fn start_reconcile_span(key: &Key, kind: EventKind, attempt: u32) -> Span {
    tracing::info_span!(
        "reconcile.item",
        "reconcile.key" = %key,
        "reconcile.kind" = %kind,
        "reconcile.attempt" = attempt,
        "reconcile.outcome" = tracing::field::Empty,
    )
}

/// Record how the attempt ended (`success`, `retry`, `give_up`).
pub fn record_outcome(span: &Span, outcome: &str) {
    span.record("reconcile.outcome", outcome);
    span.in_scope(|| {
        tracing::debug!(outcome = outcome, "reconcile_outcome");
    });
}
