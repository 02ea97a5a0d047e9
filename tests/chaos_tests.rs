// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Chaos tests: simulate failures and verify graceful degradation.
//!
//! These tests verify the system handles failures gracefully without panics,
//! deadlocks, or data corruption.
//!
//! Run with: cargo test --test chaos_tests -- --nocapture

mod common;

use cdc_replay_engine::config::CursorConfig;
use cdc_replay_engine::cursor::CursorStore;
use cdc_replay_engine::error::SyncError;
use cdc_replay_engine::event::EventMessage;
use cdc_replay_engine::retry::{RetryHelper, RetryPolicy};
use cdc_replay_engine::state::SyncState;
use cdc_replay_engine::stream::{compare_stream_ids, parse_stream_id};
use common::*;
use serde_json::json;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;
use tokio::sync::watch;

// =============================================================================
// Corrupted Envelopes
// =============================================================================

/// Test: Garbage on the stream is dropped, never fatal
#[tokio::test]
async fn corrupted_envelopes_are_dropped() {
    let h = Harness::new().await;
    let payloads = vec![
        String::new(),
        "{}".to_string(),
        "null".to_string(),
        "[]".to_string(),
        "\u{0}\u{1}\u{2}".to_string(),
        r#"{"source": 42}"#.to_string(),
        r#"{"source": {"db": "legacy", "table": "customer", "op": "c"}}"#.to_string(),
        r#"{"source": {"db": "legacy", "table": "customer", "op": "c"}, "payload": "x"}"#.to_string(),
        r#"{"source": {"db": "legacy", "table": "customer", "op": "zz"}, "payload": {"id": 1}}"#.to_string(),
        r#"{"source": {"db": "elsewhere", "table": "customer", "op": "c"}, "payload": {"id": 1}}"#.to_string(),
        format!("{}{}", "[".repeat(512), "]".repeat(512)),
    ];
    let count = payloads.len();

    let mut consume = h.loop_over("legacy", payloads.into_iter().map(EventMessage::new).collect());
    let summary = h.pass(&mut consume).await;

    assert_eq!(summary.dropped, count);
    assert_eq!(summary.finished(), count);
    assert_eq!(h.count(true, "customers").await, 0);
}

/// Test: A good event behind a wall of garbage still lands
#[tokio::test]
async fn good_event_survives_surrounding_garbage() {
    let h = Harness::new().await;
    let mut events: Vec<EventMessage> = (0..50).map(|i| EventMessage::new(format!("junk {}", i))).collect();
    events.push(legacy("customer", "c", legacy_customer(9, None)));
    events.extend((0..50).map(|i| EventMessage::new(format!("{{\"tail\": {}}}", i))));

    let mut consume = h.loop_over("legacy", events);
    let summary = h.pass(&mut consume).await;

    assert_eq!(summary.applied, 1);
    assert_eq!(summary.dropped, 100);
    assert_eq!(h.count(true, "customers").await, 1);
}

/// Test: Oversized rows decode without trouble
#[tokio::test]
async fn large_row_is_replayed() {
    let h = Harness::new().await;
    let mut row = legacy_customer(11, None);
    row["name"] = json!("x".repeat(256 * 1024));

    let mut consume = h.loop_over("legacy", vec![legacy("customer", "c", row)]);
    let summary = h.pass(&mut consume).await;
    assert_eq!(summary.applied, 1);
}

// =============================================================================
// Cursor Crash Recovery
// =============================================================================

fn cursor_config(path: &std::path::Path) -> CursorConfig {
    CursorConfig {
        sqlite_path: path.to_string_lossy().to_string(),
        wal_mode: true,
    }
}

/// Test: Cursor recovery after crash
///
/// Simulates a crash by not flushing cursors, then verifies
/// we can recover from the last persisted position.
#[tokio::test]
async fn cursor_crash_recovery() {
    let dir = tempdir().unwrap();
    let config = cursor_config(&dir.path().join("cursors.db"));
    let stream = "cdc.legacy.customer";

    {
        let store = CursorStore::open(&config).await.unwrap();
        store.set(stream, "1000-0").await;
        store.flush_dirty().await.unwrap();

        store.set(stream, "2000-0").await;
        store.flush_dirty().await.unwrap();

        // Not flushed: lost with the process
        store.set(stream, "3000-0").await;
    }

    let store = CursorStore::open(&config).await.unwrap();
    assert_eq!(store.get(stream).await, Some("2000-0".to_string()));
}

/// Test: Streams keep independent cursors
#[tokio::test]
async fn cursor_stream_isolation() {
    let dir = tempdir().unwrap();
    let store = CursorStore::open(&cursor_config(&dir.path().join("cursors.db")))
        .await
        .unwrap();

    store.set("cdc.legacy.customer", "1000-0").await;
    store.set("cdc.legacy.invoice", "2000-0").await;
    store.set("cdc.modern.customers", "3000-0").await;
    store.flush_dirty().await.unwrap();

    store.set("cdc.legacy.customer", "1500-0").await;
    store.flush_dirty().await.unwrap();

    assert_eq!(store.get("cdc.legacy.customer").await, Some("1500-0".to_string()));
    assert_eq!(store.get("cdc.legacy.invoice").await, Some("2000-0".to_string()));
    assert_eq!(store.get("cdc.modern.customers").await, Some("3000-0".to_string()));
    assert_eq!(store.get("cdc.modern.invoices").await, None);
}

/// Test: Rapid cursor updates collapse into one write
#[tokio::test]
async fn cursor_rapid_updates() {
    let dir = tempdir().unwrap();
    let store = CursorStore::open(&cursor_config(&dir.path().join("cursors.db")))
        .await
        .unwrap();

    for i in 0..1000 {
        store.set("cdc.legacy.address", &format!("{}-0", i)).await;
    }
    assert_eq!(store.dirty_count().await, 1);
    assert_eq!(store.flush_dirty().await.unwrap(), 1);
    assert_eq!(store.get("cdc.legacy.address").await, Some("999-0".to_string()));
}

/// Test: An unusable cursor path fails cleanly
#[tokio::test]
async fn cursor_store_bad_path_is_an_error() {
    let dir = tempdir().unwrap();
    let config = cursor_config(&dir.path().join("missing").join("deeper").join("cursors.db"));
    let result = CursorStore::open(&config).await;
    assert!(matches!(result, Err(SyncError::CursorStore(_))));
}

// =============================================================================
// Retry Stress
// =============================================================================

/// Test: Concurrent retry loops share the retrying flag correctly
#[tokio::test]
async fn concurrent_retries_clear_flag() {
    let state = Arc::new(SyncState::new());
    let helper = RetryHelper::new(RetryPolicy::testing(), state.clone());

    let mut handles = Vec::new();
    for _ in 0..10 {
        let helper = helper.clone();
        handles.push(tokio::spawn(async move {
            let calls = AtomicU32::new(0);
            helper
                .run("stress", || {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if n == 0 {
                            Err(SyncError::broker_msg("XREAD", "flap"))
                        } else {
                            Ok(n)
                        }
                    }
                })
                .await
        }));
    }

    for handle in handles {
        assert_eq!(handle.await.unwrap().unwrap(), 1);
    }
    assert!(!state.is_retrying());
}

/// Test: Shutdown interrupts a long backoff
#[tokio::test]
async fn cancel_interrupts_backoff() {
    let state = Arc::new(SyncState::new());
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let policy = RetryPolicy {
        max_attempts: 5,
        max_delay: Duration::from_secs(3600),
        ..RetryPolicy::default()
    };
    let helper = RetryHelper::new(policy, state.clone()).with_cancel(cancel_rx);

    let task = tokio::spawn(async move {
        helper
            .run("stuck", || async { Err::<(), _>(SyncError::broker_msg("PING", "down")) })
            .await
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(state.is_retrying());
    cancel_tx.send(true).unwrap();

    let result = tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .expect("retry loop did not observe cancel")
        .unwrap();
    assert!(matches!(result, Err(SyncError::Cancelled)));
    assert!(!state.is_retrying());
}

// =============================================================================
// Stream ID Stress Tests
// =============================================================================

/// Test: Stream ID parsing with extreme values
#[test]
fn stream_id_extreme_values() {
    let max = format!("{}-{}", u64::MAX, u64::MAX);
    assert_eq!(parse_stream_id(&max), (u64::MAX, u64::MAX));
    assert_eq!(compare_stream_ids("0-0", &max), std::cmp::Ordering::Less);

    for malformed in ["", "-", "abc", "1-", "-1", "1-2-3", "18446744073709551616-0"] {
        let _ = parse_stream_id(malformed);
        let _ = compare_stream_ids(malformed, "1-0");
    }
}
