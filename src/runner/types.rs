// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Runner state types.
//!
//! # State Transitions
//!
//! ```text
//!              start()
//! Created ─────────────→ Starting ──(startup failed)──→ Failed
//!    │                      │
//!    │                      │ (startup steps done)
//!    │                      ↓
//!    │                   Running ──(consume loop failed)──→ Failed
//!    │                      │
//!    │           shutdown() │
//!    ↓                      ↓
//! Stopped ←──────────── ShuttingDown
//! ```

use serde::Serialize;

/// Lifecycle state of the [`RunnerService`](super::RunnerService).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunnerState {
    /// Constructed, nothing connected.
    Created,
    /// Running the startup steps (topics, connectors, readiness, backfill, triggers).
    Starting,
    /// Consume loops are replaying events.
    Running,
    /// Loops are draining; cursors are being flushed.
    ShuttingDown,
    /// Clean stop.
    Stopped,
    /// Startup or a consume loop failed for good. See logs.
    Failed,
}

impl std::fmt::Display for RunnerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RunnerState::Created => "Created",
            RunnerState::Starting => "Starting",
            RunnerState::Running => "Running",
            RunnerState::ShuttingDown => "ShuttingDown",
            RunnerState::Stopped => "Stopped",
            RunnerState::Failed => "Failed",
        };
        f.write_str(name)
    }
}

/// Counts for one consume pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassSummary {
    pub read: usize,
    pub applied: usize,
    pub unchanged: usize,
    pub duplicates: usize,
    pub not_found: usize,
    pub dropped: usize,
    pub deferred: usize,
}

impl PassSummary {
    /// Events that reached a final outcome this pass.
    pub fn finished(&self) -> usize {
        self.applied + self.unchanged + self.duplicates + self.not_found + self.dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runner_state_display() {
        assert_eq!(RunnerState::Created.to_string(), "Created");
        assert_eq!(RunnerState::Starting.to_string(), "Starting");
        assert_eq!(RunnerState::Running.to_string(), "Running");
        assert_eq!(RunnerState::ShuttingDown.to_string(), "ShuttingDown");
        assert_eq!(RunnerState::Stopped.to_string(), "Stopped");
        assert_eq!(RunnerState::Failed.to_string(), "Failed");
    }

    #[test]
    fn test_pass_summary_finished() {
        let summary = PassSummary {
            read: 9,
            applied: 3,
            unchanged: 1,
            duplicates: 2,
            not_found: 1,
            dropped: 1,
            deferred: 1,
        };
        assert_eq!(summary.finished(), 8);
        assert_eq!(PassSummary::default().finished(), 0);
    }
}
