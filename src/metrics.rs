// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Broker reads per source system
//! - Replay outcomes (applied, unchanged, duplicate, dropped)
//! - Dependency resolution (waits, deferrals)
//! - Retries and engine state
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `cdc_replay_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)
//!
//! No recorder is installed by the library; without one every call is a no-op.

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Record events read from a source system's streams.
pub fn record_events_read(source: &str, count: usize) {
    counter!("cdc_replay_events_read_total", "source" => source.to_string()).increment(count as u64);
}

/// Record the outcome of replaying one event.
///
/// `outcome` is one of `applied`, `unchanged`, `duplicate`, `not_found`.
pub fn record_event_replayed(source: &str, entity: &str, outcome: &str) {
    counter!(
        "cdc_replay_events_replayed_total",
        "source" => source.to_string(),
        "entity" => entity.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record an event dropped at the ingestion boundary.
pub fn record_event_dropped(source: &str, reason: &str) {
    counter!(
        "cdc_replay_events_dropped_total",
        "source" => source.to_string(),
        "reason" => reason.to_string()
    )
    .increment(1);
}

/// Record events deferred to a later pass.
pub fn record_events_deferred(source: &str, count: usize) {
    counter!("cdc_replay_events_deferred_total", "source" => source.to_string()).increment(count as u64);
}

/// Current size of the deferred queue.
pub fn set_deferred_pending(source: &str, count: usize) {
    gauge!("cdc_replay_deferred_pending", "source" => source.to_string()).set(count as f64);
}

/// Record how long a dependency wait lasted and whether it found the parent.
pub fn record_dependency_wait(source: &str, resolved: bool, duration: Duration) {
    let status = if resolved { "resolved" } else { "timeout" };
    histogram!(
        "cdc_replay_dependency_wait_seconds",
        "source" => source.to_string(),
        "status" => status
    )
    .record(duration.as_secs_f64());
}

/// Record a dependency check answered from the in-memory cache.
pub fn record_dependency_cache_hit(entity: &str) {
    counter!("cdc_replay_dependency_cache_hits_total", "entity" => entity.to_string()).increment(1);
}

/// Record one replay pass (sort + resolve + apply).
pub fn record_pass(source: &str, events: usize, duration: Duration) {
    histogram!("cdc_replay_pass_size", "source" => source.to_string()).record(events as f64);
    histogram!("cdc_replay_pass_duration_seconds", "source" => source.to_string())
        .record(duration.as_secs_f64());
}

/// Record stream read (XREAD) latency.
pub fn record_stream_read_latency(source: &str, duration: Duration) {
    histogram!("cdc_replay_stream_read_duration_seconds", "source" => source.to_string())
        .record(duration.as_secs_f64());
}

/// Record replication lag of a stream's committed cursor (entry timestamp vs. now).
pub fn record_replication_lag_ms(source: &str, stream: &str, lag_ms: u64) {
    gauge!(
        "cdc_replay_lag_ms",
        "source" => source.to_string(),
        "stream" => stream.to_string()
    )
    .set(lag_ms as f64);
}

/// Record a retry attempt by the retry helper.
pub fn record_retry(operation: &str, error_kind: &str) {
    counter!(
        "cdc_replay_retries_total",
        "operation" => operation.to_string(),
        "error" => error_kind.to_string()
    )
    .increment(1);
}

/// Record an error by category.
pub fn record_error(source: &str, error_kind: &str) {
    counter!(
        "cdc_replay_errors_total",
        "source" => source.to_string(),
        "error_type" => error_kind.to_string()
    )
    .increment(1);
}

/// Record cursor flush batch (debounced writes).
pub fn record_cursor_flush(flushed: usize, errors: usize) {
    counter!("cdc_replay_cursor_flushes_total").increment(1);
    counter!("cdc_replay_cursor_flushed_count").increment(flushed as u64);
    if errors > 0 {
        counter!("cdc_replay_cursor_flush_errors_total").increment(errors as u64);
    }
}

/// Record cursor SQLite retry (for SQLITE_BUSY/SQLITE_LOCKED).
pub fn cursor_retries_total(operation: &str) {
    counter!("cdc_replay_cursor_retries_total", "operation" => operation.to_string()).increment(1);
}

/// Gauge for the process-wide flags exposed over health.
pub fn set_flags(is_initialized: bool, snapshot_last_received: bool, is_retrying: bool) {
    gauge!("cdc_replay_initialized").set(if is_initialized { 1.0 } else { 0.0 });
    gauge!("cdc_replay_snapshot_last_received").set(if snapshot_last_received { 1.0 } else { 0.0 });
    gauge!("cdc_replay_retrying").set(if is_retrying { 1.0 } else { 0.0 });
}

/// Gauge for runner state.
pub fn set_engine_state(state: &str) {
    let value = match state {
        "Created" => 0.0,
        "Starting" => 1.0,
        "Running" => 2.0,
        "ShuttingDown" => 3.0,
        "Stopped" => 4.0,
        "Failed" => 5.0,
        _ => -1.0,
    };
    gauge!("cdc_replay_engine_state").set(value);
}

/// Record a startup step completing.
pub fn record_startup_step(step: &str, duration: Duration) {
    histogram!("cdc_replay_startup_step_seconds", "step" => step.to_string())
        .record(duration.as_secs_f64());
}

#[cfg(test)]
mod tests {
    use super::*;

    // Without an installed recorder these must simply not panic.

    #[test]
    fn test_record_events_read() {
        record_events_read("legacy", 0);
        record_events_read("modern", 42);
    }

    #[test]
    fn test_record_event_replayed_outcomes() {
        for outcome in ["applied", "unchanged", "duplicate", "not_found"] {
            record_event_replayed("legacy", "invoice", outcome);
        }
    }

    #[test]
    fn test_record_event_dropped() {
        record_event_dropped("modern", "decode");
        record_event_dropped("", "unknown_command");
    }

    #[test]
    fn test_record_deferral_metrics() {
        record_events_deferred("legacy", 3);
        set_deferred_pending("legacy", 3);
        set_deferred_pending("legacy", 0);
        record_dependency_wait("legacy", true, Duration::from_millis(120));
        record_dependency_wait("legacy", false, Duration::from_secs(10));
        record_dependency_cache_hit("address");
    }

    #[test]
    fn test_record_pass_and_reads() {
        record_pass("modern", 100, Duration::from_millis(50));
        record_pass("modern", 0, Duration::ZERO);
        record_stream_read_latency("modern", Duration::from_millis(3));
        record_replication_lag_ms("modern", "cdc.modern.invoices", 1200);
    }

    #[test]
    fn test_record_retry_and_errors() {
        record_retry("replay", "database");
        record_error("legacy", "missing_mapping");
    }

    #[test]
    fn test_cursor_metrics() {
        record_cursor_flush(5, 0);
        record_cursor_flush(3, 2);
        cursor_retries_total("cursor_flush");
    }

    #[test]
    fn test_set_engine_state_all_states() {
        for state in ["Created", "Starting", "Running", "ShuttingDown", "Stopped", "Failed", "Unknown"] {
            set_engine_state(state);
        }
        set_flags(true, false, true);
        record_startup_step("register_connectors", Duration::from_secs(1));
    }
}
