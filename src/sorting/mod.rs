// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replay ordering and dependency resolution.
//!
//! The broker preserves order per stream only, and each table has its own
//! stream, so an invoice line may arrive before its invoice. A pass therefore:
//!
//! 1. Sorts the batch by priority rank (stable: ties keep delivery order).
//! 2. For every event whose parent is neither in the batch nor present in the
//!    target, polls the same source for up to `max_wait`, folding every message
//!    it reads into the batch, until the parent's creating event shows up.
//! 3. Defers what is still unresolved (and, transitively, anything whose
//!    parent was deferred) to the next pass.
//! 4. Holds back every later event of an aggregate that has a deferred event,
//!    so one aggregate's changes replay in delivery order.
//! 5. Re-sorts what is ready.
//!
//! ```text
//!   batch ──sort──► [A1, C4, I9, L3] ──resolve──► ready [A1, C4, I9]
//!                                 │                deferred [L3]  (I2 never came)
//!                                 └── look-ahead poll (bounded)
//! ```
//!
//! Snapshot rows and deletes never wait for a parent, but they do queue
//! behind a deferred event of their own aggregate. Events that cannot be classified
//! (malformed envelope, unknown table or source) pass through untouched; the
//! dispatcher drops them.

pub mod dependency;

pub use crate::event::{
    extract_aggregate_id, extract_aggregate_type, extract_operation, extract_source, is_snapshot_event,
};
pub use dependency::{DependencyCache, DependencyChecker, MappingDependencyChecker};

use crate::broker::EventSource;
use crate::config::{DatabasesConfig, DependencyWaitConfig};
use crate::error::{Result, SyncError};
use crate::event::{EntityType, EventMessage, Operation, SourceSystem};
use crate::metrics;
use crate::priority::{self, DependencyField, PriorityDependency, PriorityGroups};
use crate::state;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// (primary, secondary) priority of an event. Unknown types rank last.
pub fn get_priority(event: &EventMessage, groups: &[Vec<PriorityDependency>]) -> (usize, usize) {
    priority::rank_of(event.entity_type(), groups)
}

/// Stable sort by priority; equal ranks keep their relative order.
pub fn sort_events(batch: &mut [EventMessage], groups: &[Vec<PriorityDependency>]) {
    batch.sort_by_cached_key(|event| get_priority(event, groups));
}

/// A parent aggregate an event needs in the target before it can be replayed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParentRef {
    pub entity: EntityType,
    /// Id as written in the source payload.
    pub id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Pending,
    Ready,
    Deferred,
}

/// (source db, table, aggregate id) of an event; `None` when unclassifiable.
type AggregateKey = (String, String, String);

struct Entry {
    event: EventMessage,
    slot: Slot,
    /// Batch entries this one relies on to create its parents.
    providers: Vec<usize>,
    key: Option<AggregateKey>,
}

impl Entry {
    fn new(event: EventMessage) -> Self {
        let (table, id) = (event.aggregate_type(), event.aggregate_id());
        let key = (!table.is_empty() && !id.is_empty()).then(|| (event.source(), table, id));
        Self {
            event,
            slot: Slot::Pending,
            providers: Vec::new(),
            key,
        }
    }
}

/// Whether an earlier entry of the same aggregate is already deferred.
fn held_back(entries: &[Entry], idx: usize) -> bool {
    let Some(key) = &entries[idx].key else {
        return false;
    };
    entries[..idx]
        .iter()
        .any(|entry| entry.slot == Slot::Deferred && entry.key.as_ref() == Some(key))
}

enum Resolution {
    /// Created by another event of this pass.
    Provider(usize),
    /// Already in the target.
    Present,
    /// Not found within the wait window.
    Missing,
    /// The reference is not a valid id; the decoder will reject the event.
    Malformed,
}

/// Orders batches and holds back events whose parents are missing.
pub struct EventsSortingService {
    groups: PriorityGroups,
    checker: Arc<dyn DependencyChecker>,
    cache: DependencyCache,
    databases: DatabasesConfig,
    poll_timeout: Duration,
    grace_delay: Duration,
    max_wait: Duration,
}

impl EventsSortingService {
    pub fn new(
        groups: PriorityGroups,
        checker: Arc<dyn DependencyChecker>,
        databases: DatabasesConfig,
        wait: &DependencyWaitConfig,
    ) -> Self {
        Self {
            groups,
            checker,
            cache: DependencyCache::default(),
            databases,
            poll_timeout: wait.poll_timeout_duration(),
            grace_delay: wait.grace_delay_duration(),
            max_wait: wait.max_wait_duration(),
        }
    }

    pub fn priority_groups(&self) -> &[Vec<PriorityDependency>] {
        &self.groups
    }

    pub fn cache(&self) -> &DependencyCache {
        &self.cache
    }

    /// Source system of an event, from its `source.db`.
    pub fn source_system(&self, event: &EventMessage) -> Option<SourceSystem> {
        self.databases.source_system(&event.source())
    }

    pub fn get_priority(&self, event: &EventMessage) -> (usize, usize) {
        get_priority(event, &self.groups)
    }

    pub fn sort_events(&self, batch: &mut [EventMessage]) {
        sort_events(batch, &self.groups)
    }

    /// Whether events of this type need a parent first.
    pub fn is_dependent_event(&self, entity: EntityType) -> bool {
        !self.get_dependency(entity).is_empty()
    }

    /// Parent references declared for a type.
    pub fn get_dependency(&self, entity: EntityType) -> &[DependencyField] {
        priority::dependencies_of(entity, &self.groups)
    }

    /// Whether confirmed replays of this type are remembered for dependency checks.
    pub fn should_cache_event(&self, entity: EntityType) -> bool {
        priority::is_parent_type(entity, &self.groups)
    }

    /// Parents referenced by this event. Null or missing references need nothing.
    pub fn required_parents(&self, event: &EventMessage) -> Vec<ParentRef> {
        let Some(entity) = event.entity_type() else {
            return Vec::new();
        };
        self.get_dependency(entity)
            .iter()
            .filter_map(|dep| {
                event.field(&dep.field).map(|id| ParentRef {
                    entity: dep.parent,
                    id,
                })
            })
            .collect()
    }

    /// Whether a parent exists in the target (cache first, then the checker).
    pub async fn check_dependency_exists(&self, entity: EntityType, id: &str, source: SourceSystem) -> Result<bool> {
        if self.cache.contains(source, entity, id).await {
            metrics::record_dependency_cache_hit(entity.as_str());
            return Ok(true);
        }
        let exists = self.checker.exists(entity, id, source).await?;
        if exists && self.should_cache_event(entity) {
            self.cache.insert(source, entity, id).await;
        }
        Ok(exists)
    }

    /// Keep the cache in step with a successful replay.
    pub async fn record_replayed(&self, event: &EventMessage) {
        let (Some(entity), Some(source)) = (event.entity_type(), self.source_system(event)) else {
            return;
        };
        if !self.should_cache_event(entity) {
            return;
        }
        let id = event.aggregate_id();
        if id.is_empty() {
            return;
        }
        match event.operation() {
            Some(Operation::Delete) => self.cache.evict(source, entity, &id).await,
            Some(_) => self.cache.insert(source, entity, &id).await,
            None => {}
        }
    }

    /// Split `batch` into events that can be replayed now (returned, in
    /// replay order) and events appended to `deferred`.
    ///
    /// Messages read from `source` while waiting join the batch. On
    /// cancellation every event of the pass, including those read ahead, is
    /// moved to `deferred` and [`SyncError::Cancelled`] is returned.
    pub async fn ensure_dependencies(
        &self,
        batch: Vec<EventMessage>,
        source: &mut dyn EventSource,
        deferred: &mut Vec<EventMessage>,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<Vec<EventMessage>> {
        let mut batch = batch;
        self.sort_events(&mut batch);
        let mut entries: Vec<Entry> = batch.into_iter().map(Entry::new).collect();

        let mut idx = 0;
        while idx < entries.len() {
            if state::is_cancelled(cancel) {
                return Err(abort(entries, deferred));
            }

            if held_back(&entries, idx) {
                debug!(
                    entity = %entries[idx].event.aggregate_type(),
                    id = %entries[idx].event.aggregate_id(),
                    "Earlier change of this aggregate deferred, deferring"
                );
                entries[idx].slot = Slot::Deferred;
                idx += 1;
                continue;
            }

            match self.resolve_entry(idx, &mut entries, source, cancel).await {
                Ok(slot) => entries[idx].slot = slot,
                Err(e) => return Err(abort_with(entries, deferred, e)),
            }
            idx += 1;
        }

        cascade_deferral(&mut entries);

        let mut ready = Vec::with_capacity(entries.len());
        for entry in entries {
            match entry.slot {
                Slot::Deferred => deferred.push(entry.event),
                Slot::Ready | Slot::Pending => ready.push(entry.event),
            }
        }
        self.sort_events(&mut ready);
        Ok(ready)
    }

    async fn resolve_entry(
        &self,
        idx: usize,
        entries: &mut Vec<Entry>,
        source: &mut dyn EventSource,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<Slot> {
        let event = &entries[idx].event;
        let (Some(_), Some(system), Some(operation)) =
            (event.entity_type(), self.source_system(event), event.operation())
        else {
            return Ok(Slot::Ready);
        };
        if event.is_snapshot() || operation == Operation::Delete {
            return Ok(Slot::Ready);
        }

        let parents = self.required_parents(event);
        for parent in parents {
            match self.resolve_parent(idx, &parent, system, entries, source, cancel).await? {
                Resolution::Provider(j) => entries[idx].providers.push(j),
                Resolution::Present => {}
                Resolution::Malformed => return Ok(Slot::Ready),
                Resolution::Missing => {
                    let event = &entries[idx].event;
                    warn!(
                        source = %system,
                        entity = %event.aggregate_type(),
                        id = %event.aggregate_id(),
                        parent = %parent.entity,
                        parent_id = %parent.id,
                        waited_ms = self.max_wait.as_millis() as u64,
                        "Dependency not found within wait window, deferring event"
                    );
                    return Ok(Slot::Deferred);
                }
            }
        }
        Ok(Slot::Ready)
    }

    async fn resolve_parent(
        &self,
        idx: usize,
        parent: &ParentRef,
        system: SourceSystem,
        entries: &mut Vec<Entry>,
        source: &mut dyn EventSource,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<Resolution> {
        if let Some(j) = entries
            .iter()
            .enumerate()
            .find(|(j, entry)| *j != idx && self.creates(&entry.event, parent, system))
            .map(|(j, _)| j)
        {
            return Ok(Resolution::Provider(j));
        }

        match self.check_dependency_exists(parent.entity, &parent.id, system).await {
            Ok(true) => return Ok(Resolution::Present),
            Ok(false) => {}
            Err(e) if e.is_decode() => {
                debug!(parent = %parent.entity, parent_id = %parent.id, error = %e, "Unusable parent reference");
                return Ok(Resolution::Malformed);
            }
            Err(e) => {
                warn!(parent = %parent.entity, parent_id = %parent.id, error = %e, "Dependency check failed");
            }
        }

        let source_name = source.source_name().to_string();
        let started = Instant::now();
        let deadline = started + self.max_wait;

        loop {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let wait = self.poll_timeout.min(deadline - now);

            let polled = tokio::select! {
                polled = source.poll(wait) => polled,
                _ = state::cancelled(cancel) => return Err(SyncError::Cancelled),
            };

            match polled {
                Ok(Some(message)) => {
                    trace!(source = %source_name, "Look-ahead message folded into batch");
                    entries.push(Entry::new(message));
                    let j = entries.len() - 1;

                    tokio::select! {
                        _ = tokio::time::sleep(self.grace_delay) => {}
                        _ = state::cancelled(cancel) => return Err(SyncError::Cancelled),
                    }

                    if self.creates(&entries[j].event, parent, system) {
                        metrics::record_dependency_wait(&source_name, true, started.elapsed());
                        return Ok(Resolution::Provider(j));
                    }
                }
                Ok(None) => {
                    // The other side's loop or a backfill may have created it meanwhile.
                    if let Ok(true) = self.check_dependency_exists(parent.entity, &parent.id, system).await {
                        metrics::record_dependency_wait(&source_name, true, started.elapsed());
                        return Ok(Resolution::Present);
                    }
                }
                Err(e) => {
                    warn!(source = %source_name, error = %e, "Look-ahead poll failed");
                    break;
                }
            }
        }

        metrics::record_dependency_wait(&source_name, false, started.elapsed());
        Ok(Resolution::Missing)
    }

    /// Whether `event` brings `parent` into existence.
    fn creates(&self, event: &EventMessage, parent: &ParentRef, system: SourceSystem) -> bool {
        event.entity_type() == Some(parent.entity)
            && matches!(event.operation(), Some(op) if op != Operation::Delete)
            && self.source_system(event) == Some(system)
            && event.aggregate_id() == parent.id
    }
}

/// Defer every event whose provider was deferred, and every event that
/// follows a deferred event of the same aggregate, until nothing changes.
///
/// Entry order is delivery order within an aggregate: a stable sort keeps
/// same-type events in place and look-ahead reads are appended.
fn cascade_deferral(entries: &mut [Entry]) {
    loop {
        let deferred: Vec<bool> = entries.iter().map(|e| e.slot == Slot::Deferred).collect();
        let mut held: HashSet<AggregateKey> = HashSet::new();
        let mut changed = false;
        for entry in entries.iter_mut() {
            if entry.slot != Slot::Deferred {
                let parent_deferred = entry.providers.iter().any(|&p| deferred[p]);
                let aggregate_deferred = entry.key.as_ref().is_some_and(|key| held.contains(key));
                if parent_deferred || aggregate_deferred {
                    debug!(
                        entity = %entry.event.aggregate_type(),
                        id = %entry.event.aggregate_id(),
                        parent_deferred,
                        "Deferring behind a deferred event"
                    );
                    entry.slot = Slot::Deferred;
                    changed = true;
                }
            }
            if entry.slot == Slot::Deferred {
                if let Some(key) = &entry.key {
                    held.insert(key.clone());
                }
            }
        }
        if !changed {
            break;
        }
    }
}

fn abort(entries: Vec<Entry>, deferred: &mut Vec<EventMessage>) -> SyncError {
    abort_with(entries, deferred, SyncError::Cancelled)
}

fn abort_with(entries: Vec<Entry>, deferred: &mut Vec<EventMessage>, error: SyncError) -> SyncError {
    deferred.extend(entries.into_iter().map(|entry| entry.event));
    error
}
