// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The steady-state consume loop of one source system.
//!
//! Each pass:
//! 1. Reads up to `pass_size` messages (blocking for the first one), retrying
//!    broker errors with backoff.
//! 2. Puts last pass's deferred events in front of them.
//! 3. Orders the batch and resolves dependencies, possibly reading ahead.
//! 4. Replays every ready event through its command, under the retry helper.
//! 5. Advances the committed stream cursors past everything finished.
//!
//! # Ingestion boundary
//!
//! Events that cannot be dispatched (unknown source, table or operation) or
//! that fail the strict decoder are dropped with a warning and counted. They
//! still count as finished for cursor purposes.
//!
//! # Failure
//!
//! A replay error that survives every retry ends the loop with that error;
//! the cursor is not advanced past the failing event, so it is replayed on
//! restart.

use super::types::PassSummary;
use crate::broker::EventSource;
use crate::command::CommandFactory;
use crate::cursor::CursorStore;
use crate::error::{Result, SyncError};
use crate::event::EventMessage;
use crate::metrics;
use crate::retry::RetryHelper;
use crate::sorting::EventsSortingService;
use crate::state::{self, SyncState};
use crate::stream::{commit_positions, StreamFrontier};
use crate::sync::ReplayOutcome;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Consumes one source's events and replays them into the other database.
pub struct ConsumeLoop {
    source: Box<dyn EventSource>,
    sorter: Arc<EventsSortingService>,
    commands: Arc<CommandFactory>,
    retry: RetryHelper,
    state: Arc<SyncState>,
    cursors: Option<Arc<CursorStore>>,
    frontier: StreamFrontier,
    deferred: Vec<EventMessage>,
    /// Passes each deferred event has sat out, by unique identifier.
    deferred_attempts: HashMap<String, u32>,
    pass_size: usize,
    block_timeout: Duration,
}

impl ConsumeLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source: Box<dyn EventSource>,
        sorter: Arc<EventsSortingService>,
        commands: Arc<CommandFactory>,
        retry: RetryHelper,
        state: Arc<SyncState>,
        cursors: Option<Arc<CursorStore>>,
        pass_size: usize,
        block_timeout: Duration,
    ) -> Self {
        Self {
            source,
            sorter,
            commands,
            retry,
            state,
            cursors,
            frontier: StreamFrontier::new(),
            deferred: Vec::new(),
            deferred_attempts: HashMap::new(),
            pass_size: pass_size.max(1),
            block_timeout,
        }
    }

    pub fn source_name(&self) -> &str {
        self.source.source_name()
    }

    /// Events waiting for a later pass.
    pub fn deferred(&self) -> &[EventMessage] {
        &self.deferred
    }

    /// Run passes until `shutdown` turns true or a replay fails for good.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let span = info_span!("consume", source = %self.source.source_name());

        async move {
            info!("Starting consume loop");
            loop {
                if state::is_cancelled(&shutdown) {
                    break;
                }
                match self.run_pass(&mut shutdown).await {
                    Ok(_) => {}
                    Err(SyncError::Cancelled) => break,
                    Err(e) => {
                        error!(error = %e, "Consume loop failed");
                        metrics::record_error(self.source.source_name(), e.kind());
                        self.commit().await;
                        return Err(e);
                    }
                }
            }
            self.commit().await;
            info!(deferred = self.deferred.len(), "Consume loop stopped");
            Ok(())
        }
        .instrument(span)
        .await
    }

    /// One read → order → replay → commit pass.
    pub async fn run_pass(&mut self, cancel: &mut watch::Receiver<bool>) -> Result<PassSummary> {
        let started = Instant::now();
        let source_name = self.source.source_name().to_string();
        let mut summary = PassSummary::default();

        let fresh = self.read_fresh(cancel).await?;
        summary.read = fresh.len();
        if fresh.is_empty() && self.deferred.is_empty() {
            return Ok(summary);
        }
        if !fresh.is_empty() {
            metrics::record_events_read(&source_name, fresh.len());
        }

        let mut batch = std::mem::take(&mut self.deferred);
        batch.extend(fresh);

        let resolved = self
            .sorter
            .ensure_dependencies(batch, self.source.as_mut(), &mut self.deferred, cancel)
            .await;
        let ready = match resolved {
            Ok(ready) => ready,
            Err(e) => {
                self.track(self.deferred.iter().filter_map(EventMessage::position).cloned().collect());
                return Err(e);
            }
        };

        let positions = ready
            .iter()
            .chain(self.deferred.iter())
            .filter_map(EventMessage::position)
            .cloned()
            .collect();
        self.track(positions);

        for event in ready {
            match self.apply(&event, &source_name).await? {
                Some(outcome) => match outcome {
                    ReplayOutcome::Applied => summary.applied += 1,
                    ReplayOutcome::Unchanged => summary.unchanged += 1,
                    ReplayOutcome::Duplicate => summary.duplicates += 1,
                    ReplayOutcome::NotFound => summary.not_found += 1,
                },
                None => summary.dropped += 1,
            }
            self.deferred_attempts.remove(event.unique_identifier());
            if let Some(position) = event.position() {
                self.frontier.complete(position);
            }
        }

        summary.deferred = self.deferred.len();
        self.note_deferred(&source_name);
        self.commit().await;

        metrics::record_pass(&source_name, summary.read, started.elapsed());
        debug!(
            read = summary.read,
            applied = summary.applied,
            unchanged = summary.unchanged,
            duplicates = summary.duplicates,
            dropped = summary.dropped,
            deferred = summary.deferred,
            "Pass complete"
        );
        Ok(summary)
    }

    /// Block for the first message, then take whatever else is buffered.
    ///
    /// Polls run under the retry helper: a broker error ends the pass only
    /// once the attempts are exhausted.
    async fn read_fresh(&mut self, cancel: &mut watch::Receiver<bool>) -> Result<Vec<EventMessage>> {
        let retry = &self.retry;
        let source = self.source.as_mut();
        let block_timeout = self.block_timeout;

        let read_started = Instant::now();
        let first = tokio::select! {
            polled = retry.run_on("poll", &mut *source, |source| source.poll(block_timeout)) => polled?,
            _ = state::cancelled(cancel) => return Err(SyncError::Cancelled),
        };
        metrics::record_stream_read_latency(source.source_name(), read_started.elapsed());

        let mut fresh = Vec::new();
        if let Some(event) = first {
            fresh.push(event);
            while fresh.len() < self.pass_size {
                let polled = retry
                    .run_on("poll", &mut *source, |source| source.poll(Duration::ZERO))
                    .await?;
                match polled {
                    Some(event) => fresh.push(event),
                    None => break,
                }
            }
        }
        Ok(fresh)
    }

    /// Replay one event. `None` means it was dropped at the ingestion boundary.
    async fn apply(&self, event: &EventMessage, source_name: &str) -> Result<Option<ReplayOutcome>> {
        let (key, command) = match self.commands.for_event(event) {
            Ok(found) => found,
            Err(e) => {
                warn!(
                    error = %e,
                    payload_len = event.raw_payload().len(),
                    "Dropping undispatchable event"
                );
                metrics::record_event_dropped(source_name, e.kind());
                return Ok(None);
            }
        };

        let decoded = match command.decode(event) {
            Ok(decoded) => decoded,
            Err(e) if e.is_decode() => {
                warn!(
                    error = %e,
                    entity = %key.entity,
                    id = %event.aggregate_id(),
                    "Dropping event that failed to decode"
                );
                metrics::record_event_dropped(source_name, e.kind());
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        if event.is_last_snapshot() && !self.state.snapshot_last_received() {
            info!(entity = %key.entity, "Last snapshot event received");
            self.state.set_snapshot_last_received(true);
        }

        let unique_identifier = event.unique_identifier();
        let decoded = &decoded;
        let command = command.as_ref();
        let outcome = self
            .retry
            .run("replay", move || command.execute(unique_identifier, decoded))
            .await?;

        self.sorter.record_replayed(event).await;
        metrics::record_event_replayed(source_name, key.entity.as_str(), outcome.as_str());
        debug!(
            entity = %key.entity,
            operation = %key.operation,
            id = %event.aggregate_id(),
            outcome = %outcome,
            "Event replayed"
        );
        Ok(Some(outcome))
    }

    fn track(&mut self, positions: Vec<crate::event::StreamPosition>) {
        for position in &positions {
            self.frontier.track(position);
        }
    }

    fn note_deferred(&mut self, source_name: &str) {
        if self.deferred.is_empty() {
            metrics::set_deferred_pending(source_name, 0);
            return;
        }
        metrics::record_events_deferred(source_name, self.deferred.len());
        metrics::set_deferred_pending(source_name, self.deferred.len());
        for event in &self.deferred {
            let attempts = self
                .deferred_attempts
                .entry(event.unique_identifier().to_string())
                .or_insert(0);
            *attempts += 1;
            warn!(
                entity = %event.aggregate_type(),
                id = %event.aggregate_id(),
                attempts = *attempts,
                "Event still waiting for its dependency"
            );
        }
    }

    async fn commit(&mut self) {
        let commits = self.frontier.advance();
        if commits.is_empty() {
            return;
        }
        if let Some(cursors) = &self.cursors {
            commit_positions(cursors, self.source.source_name(), &commits).await;
        }
    }
}
