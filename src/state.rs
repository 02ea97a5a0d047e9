// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Process-wide status flags read by the health surface.
//!
//! One [`SyncState`] is created by the embedder and shared (`Arc`) with the
//! runner, the retry helper and the health router. Nothing is persisted.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::watch;

/// Status flags shared across the process.
#[derive(Debug, Default)]
pub struct SyncState {
    is_initialized: AtomicBool,
    snapshot_last_received: AtomicBool,
    /// Number of retry loops currently past their first attempt.
    retries_in_flight: AtomicUsize,
}

/// Point-in-time copy of the flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StateSnapshot {
    pub is_initialized: bool,
    pub snapshot_last_received: bool,
    pub is_retrying: bool,
}

impl SyncState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Startup sequence completed and consume loops are running.
    pub fn is_initialized(&self) -> bool {
        self.is_initialized.load(Ordering::Acquire)
    }

    pub fn set_initialized(&self, value: bool) {
        self.is_initialized.store(value, Ordering::Release);
    }

    /// A connector has emitted the final record of its snapshot phase.
    pub fn snapshot_last_received(&self) -> bool {
        self.snapshot_last_received.load(Ordering::Acquire)
    }

    pub fn set_snapshot_last_received(&self, value: bool) {
        self.snapshot_last_received.store(value, Ordering::Release);
    }

    /// True while any retry beyond a first attempt is in flight.
    pub fn is_retrying(&self) -> bool {
        self.retries_in_flight.load(Ordering::Acquire) > 0
    }

    /// Mark a retry loop as retrying until the guard drops.
    pub fn begin_retry(&self) -> RetryingGuard<'_> {
        self.retries_in_flight.fetch_add(1, Ordering::AcqRel);
        RetryingGuard { state: self }
    }

    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            is_initialized: self.is_initialized(),
            snapshot_last_received: self.snapshot_last_received(),
            is_retrying: self.is_retrying(),
        }
    }
}

/// Clears one in-flight retry on drop, whichever way the retry loop exits.
#[must_use]
pub struct RetryingGuard<'a> {
    state: &'a SyncState,
}

impl Drop for RetryingGuard<'_> {
    fn drop(&mut self) {
        self.state.retries_in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Resolve once the cancel signal reads `true`.
///
/// A dropped sender never cancels.
pub async fn cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Non-blocking check of the cancel signal.
pub fn is_cancelled(rx: &watch::Receiver<bool>) -> bool {
    *rx.borrow()
}
