//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Pull and live-push throughput
//! - Push outcomes (acknowledged, conflicts, rejections)
//! - Engine and controller state
//! - Local store retries
//! - Aggregation progress and repairs
//! - Circuit breaker rejections
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `replication_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)
//!
//! # Usage
//!
//! ```rust,no_run
//! use inbox_replication::{metrics, Collection};
//! use std::time::Duration;
//!
//! metrics::record_pull_batch(Collection::Messages, 42, Duration::from_millis(80));
//! metrics::record_documents_applied(Collection::Messages, 40, 2);
//! ```

use crate::document::Collection;
use metrics::{counter, gauge, histogram};
use std::time::Duration;

// =============================================================================
// Pull
// =============================================================================

/// Record a completed pull request.
pub fn record_pull_batch(collection: Collection, fetched: usize, duration: Duration) {
    counter!("replication_pull_batches_total", "collection" => collection.name()).increment(1);
    counter!("replication_pull_documents_total", "collection" => collection.name())
        .increment(fetched as u64);
    histogram!("replication_pull_duration_seconds", "collection" => collection.name())
        .record(duration.as_secs_f64());
}

/// Record the outcome of applying a batch to the local store.
pub fn record_documents_applied(collection: Collection, applied: usize, skipped: usize) {
    counter!("replication_documents_applied_total", "collection" => collection.name())
        .increment(applied as u64);
    if skipped > 0 {
        counter!("replication_documents_skipped_total", "collection" => collection.name())
            .increment(skipped as u64);
    }
}

/// Record a batch delivered by the live-push channel.
pub fn record_live_batch(collection: Collection, documents: usize) {
    counter!("replication_live_batches_total", "collection" => collection.name()).increment(1);
    histogram!("replication_live_batch_size", "collection" => collection.name())
        .record(documents as f64);
}

/// Record a live-push (re)subscription.
pub fn record_live_subscribe(collection: Collection, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!(
        "replication_live_subscriptions_total",
        "collection" => collection.name(),
        "status" => status
    )
    .increment(1);
}

// =============================================================================
// Push
// =============================================================================

/// Record a push request and its outcome.
pub fn record_push_batch(
    collection: Collection,
    rows: usize,
    acknowledged: usize,
    conflicts: usize,
    duration: Duration,
) {
    counter!("replication_push_batches_total", "collection" => collection.name()).increment(1);
    counter!("replication_push_rows_total", "collection" => collection.name()).increment(rows as u64);
    counter!("replication_push_acknowledged_total", "collection" => collection.name())
        .increment(acknowledged as u64);
    if conflicts > 0 {
        counter!("replication_push_conflicts_total", "collection" => collection.name())
            .increment(conflicts as u64);
    }
    histogram!("replication_push_duration_seconds", "collection" => collection.name())
        .record(duration.as_secs_f64());
}

/// Record a permanently rejected change row.
pub fn record_rejection(collection: Collection) {
    counter!("replication_push_rejections_total", "collection" => collection.name()).increment(1);
}

/// Gauge for change rows waiting to be pushed.
pub fn set_pending_push(collection: Collection, pending: usize) {
    gauge!("replication_push_pending", "collection" => collection.name()).set(pending as f64);
}

/// Record a conflict resolution (`take_remote` or `keep_local`).
pub fn record_conflict_resolution(collection: Collection, outcome: &'static str) {
    counter!(
        "replication_conflict_resolutions_total",
        "collection" => collection.name(),
        "outcome" => outcome
    )
    .increment(1);
}

// =============================================================================
// Engine and controller
// =============================================================================

/// Gauge for engine state.
pub fn set_engine_state(state: &str) {
    let value = match state {
        "Created" => 0.0,
        "Starting" => 1.0,
        "Running" => 2.0,
        "ShuttingDown" => 3.0,
        "Stopped" => 4.0,
        _ => -1.0,
    };
    gauge!("replication_engine_state").set(value);
}

/// Gauge for controller state.
pub fn set_controller_state(collection: Collection, state: &str) {
    let value = match state {
        "Idle" => 0.0,
        "PullingInitial" => 1.0,
        "Streaming" => 2.0,
        "Error" => 3.0,
        "Stopped" => 4.0,
        _ => -1.0,
    };
    gauge!("replication_controller_state", "collection" => collection.name()).set(value);
}

/// Record errors by kind.
pub fn record_error(collection: Collection, kind: &'static str) {
    counter!(
        "replication_errors_total",
        "collection" => collection.name(),
        "kind" => kind
    )
    .increment(1);
}

/// Record a retried operation.
pub fn record_retry(operation: &str, kind: &'static str) {
    counter!(
        "replication_retries_total",
        "operation" => operation.to_string(),
        "kind" => kind
    )
    .increment(1);
}

/// Record a local store retry (SQLITE_BUSY/SQLITE_LOCKED).
pub fn store_retries_total(operation: &str) {
    counter!("replication_store_retries_total", "operation" => operation.to_string()).increment(1);
}

// =============================================================================
// Aggregation
// =============================================================================

/// Record a message event handled by the aggregation service.
pub fn record_aggregation_event(outcome: &'static str) {
    counter!("replication_aggregation_events_total", "outcome" => outcome).increment(1);
}

/// Record a repair triggered by lag or a skipped event.
pub fn record_aggregation_repair(reason: &'static str) {
    counter!("replication_aggregation_repairs_total", "reason" => reason).increment(1);
}

/// Record a completed backfill.
pub fn record_backfill(messages: usize, duration: Duration) {
    counter!("replication_backfill_runs_total").increment(1);
    counter!("replication_backfill_messages_total").increment(messages as u64);
    histogram!("replication_backfill_duration_seconds").record(duration.as_secs_f64());
}

// =============================================================================
// Circuit Breaker
// =============================================================================

/// Record circuit breaker rejection (circuit was open).
pub fn record_circuit_rejection(circuit_name: &str) {
    counter!(
        "replication_circuit_rejections_total",
        "circuit" => circuit_name.to_string()
    )
    .increment(1);
}
