// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Envelope builders and an in-memory replay harness.

use cdc_replay_engine::broker::{EventSource, InMemoryEventSource, InMemoryPublisher};
use cdc_replay_engine::command::CommandFactory;
use cdc_replay_engine::config::ReplayConfig;
use cdc_replay_engine::event::{EventMessage, StreamPosition};
use cdc_replay_engine::retry::{RetryHelper, RetryPolicy};
use cdc_replay_engine::runner::{ConsumeLoop, PassSummary};
use cdc_replay_engine::sorting::{DependencyChecker, EventsSortingService, MappingDependencyChecker};
use cdc_replay_engine::state::SyncState;
use cdc_replay_engine::sync::{Databases, SyncServices};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

// =============================================================================
// Envelopes
// =============================================================================

/// Raw envelope as a CDC connector would publish it.
pub fn envelope(db: &str, table: &str, op: &str, row: Value) -> String {
    json!({
        "source": {"db": db, "table": table, "op": op, "snapshot": "false", "ts_ms": 1_700_000_000_000u64},
        "payload": row,
        "ts_ms": 1_700_000_000_123u64
    })
    .to_string()
}

pub fn legacy(table: &str, op: &str, row: Value) -> EventMessage {
    EventMessage::new(envelope("legacy", table, op, row))
}

pub fn modern(table: &str, op: &str, row: Value) -> EventMessage {
    EventMessage::new(envelope("modern", table, op, row))
}

/// Initial-snapshot row; `last` marks the final row of the snapshot.
pub fn legacy_snapshot(table: &str, row: Value, last: bool) -> EventMessage {
    let marker = if last { "last" } else { "true" };
    EventMessage::new(
        json!({
            "source": {"db": "legacy", "table": table, "op": "r", "snapshot": marker},
            "payload": row
        })
        .to_string(),
    )
}

pub fn legacy_address(id: i64) -> Value {
    json!({
        "id": id,
        "street": "1 Main St",
        "city": "Springfield",
        "state": "IL",
        "country": "US",
        "postal_code": "62701"
    })
}

pub fn legacy_customer(id: i64, address_id: Option<i64>) -> Value {
    json!({
        "id": id,
        "name": format!("Customer {}", id),
        "email": format!("customer{}@example.com", id),
        "address_id": address_id
    })
}

pub fn legacy_invoice(id: i64, customer_id: i64, billing_address_id: Option<i64>) -> Value {
    json!({
        "id": id,
        "customer_id": customer_id,
        "billing_address_id": billing_address_id,
        "issued_at": 1_700_000_000_000i64,
        "total_cents": 12_500
    })
}

pub fn legacy_invoice_line(id: i64, invoice_id: i64) -> Value {
    json!({
        "id": id,
        "invoice_id": invoice_id,
        "description": format!("Line {}", id),
        "quantity": 2,
        "unit_price_cents": 625
    })
}

/// Attach a stream position (stream key per table, entry id from `seq`).
pub fn at(event: EventMessage, stream: &str, seq: u64) -> EventMessage {
    event.with_position(StreamPosition::new(stream, format!("1700000000000-{}", seq)))
}

// =============================================================================
// Harness
// =============================================================================

/// Components of a running replay, minus the broker.
pub struct Harness {
    pub config: ReplayConfig,
    pub databases: Arc<Databases>,
    pub services: Arc<SyncServices>,
    pub commands: Arc<CommandFactory>,
    pub sorter: Arc<EventsSortingService>,
    pub state: Arc<SyncState>,
    pub shutdown_tx: watch::Sender<bool>,
    pub shutdown_rx: watch::Receiver<bool>,
}

impl Harness {
    /// Fresh in-memory databases with the schema created.
    pub async fn new() -> Self {
        let config = ReplayConfig::for_testing();
        let databases = Arc::new(Databases::connect(&config.databases).await.expect("connect"));
        let services = Arc::new(SyncServices::new(databases.clone()));
        let commands = Arc::new(CommandFactory::new(services.clone(), config.databases.clone()));
        let checker: Arc<dyn DependencyChecker> = Arc::new(MappingDependencyChecker::new(databases.mappings()));
        let sorter = Arc::new(EventsSortingService::new(
            config.priority_groups.clone(),
            checker,
            config.databases.clone(),
            &config.dependency_wait,
        ));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            config,
            databases,
            services,
            commands,
            sorter,
            state: Arc::new(SyncState::new()),
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// Consume loop over `source`, with a short block timeout and no cursors.
    pub fn consume_loop(&self, source: Box<dyn EventSource>, pass_size: usize) -> ConsumeLoop {
        let retry = RetryHelper::new(RetryPolicy::testing(), self.state.clone());
        ConsumeLoop::new(
            source,
            self.sorter.clone(),
            self.commands.clone(),
            retry,
            self.state.clone(),
            None,
            pass_size,
            Duration::from_millis(10),
        )
    }

    /// Consume loop pre-loaded with `events`.
    pub fn loop_over(&self, name: &str, events: Vec<EventMessage>) -> ConsumeLoop {
        self.consume_loop(Box::new(InMemoryEventSource::from_messages(name, events)), 500)
    }

    /// Consume loop fed by a live publisher.
    pub fn live_loop(&self, name: &str, pass_size: usize) -> (InMemoryPublisher, ConsumeLoop) {
        let (publisher, source) = InMemoryEventSource::channel(name);
        (publisher, self.consume_loop(Box::new(source), pass_size))
    }

    /// One pass, panicking on failure.
    pub async fn pass(&self, consume: &mut ConsumeLoop) -> PassSummary {
        let mut cancel = self.shutdown_rx.clone();
        consume.run_pass(&mut cancel).await.expect("pass failed")
    }

    /// Row count of a table in the legacy or modern database.
    pub async fn count(&self, modern: bool, table: &str) -> i64 {
        let pool = if modern { &self.databases.modern } else { &self.databases.legacy };
        sqlx::query_scalar::<_, i64>(&format!("SELECT COUNT(*) FROM {}", table))
            .fetch_one(pool)
            .await
            .expect("count")
    }
}
