// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! CDC event messages and the string-level field extraction used for ordering.
//!
//! An [`EventMessage`] wraps one raw broker payload. Nothing is parsed up
//! front: the envelope is decoded on first access and cached, and every
//! accessor degrades to an empty string (or `None`) on malformed input so the
//! consume loop never crashes on a bad message.
//!
//! # Envelope
//!
//! ```json
//! {
//!   "source": { "db": "legacy", "table": "invoice", "op": "c", "snapshot": "false", "ts_ms": 1700000000000 },
//!   "payload": { "id": 7, "customer_id": 3, "billing_address_id": 9, "...": "..." },
//!   "ts_ms": 1700000000123
//! }
//! ```
//!
//! Debezium-shaped envelopes that carry the row in `after` (or `before` for
//! deletes) instead of `payload` are accepted as well.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::OnceLock;

/// Aggregate types replicated between the two schemas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Address,
    Customer,
    Invoice,
    InvoiceLine,
}

impl EntityType {
    /// All entity types, parents first.
    pub const ALL: [EntityType; 4] = [
        EntityType::Address,
        EntityType::Customer,
        EntityType::Invoice,
        EntityType::InvoiceLine,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Address => "address",
            EntityType::Customer => "customer",
            EntityType::Invoice => "invoice",
            EntityType::InvoiceLine => "invoice_line",
        }
    }

    /// Table name of this entity in the given schema.
    pub fn table(&self, system: SourceSystem) -> &'static str {
        match (system, self) {
            (SourceSystem::Legacy, EntityType::Address) => "address",
            (SourceSystem::Legacy, EntityType::Customer) => "customer",
            (SourceSystem::Legacy, EntityType::Invoice) => "invoice",
            (SourceSystem::Legacy, EntityType::InvoiceLine) => "invoice_line",
            (SourceSystem::Modern, EntityType::Address) => "addresses",
            (SourceSystem::Modern, EntityType::Customer) => "customers",
            (SourceSystem::Modern, EntityType::Invoice) => "invoices",
            (SourceSystem::Modern, EntityType::InvoiceLine) => "invoice_lines",
        }
    }

    /// Resolve a table name from either schema.
    pub fn from_table(table: &str) -> Option<Self> {
        match table.to_ascii_lowercase().as_str() {
            "address" | "addresses" => Some(EntityType::Address),
            "customer" | "customers" => Some(EntityType::Customer),
            "invoice" | "invoices" => Some(EntityType::Invoice),
            "invoice_line" | "invoice_lines" => Some(EntityType::InvoiceLine),
            _ => None,
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which of the two databases an event came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceSystem {
    /// The old schema (integer ids).
    Legacy,
    /// The new schema (UUID ids).
    Modern,
}

impl SourceSystem {
    /// The database an event from this source is replayed into.
    pub fn target(&self) -> SourceSystem {
        match self {
            SourceSystem::Legacy => SourceSystem::Modern,
            SourceSystem::Modern => SourceSystem::Legacy,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceSystem::Legacy => "legacy",
            SourceSystem::Modern => "modern",
        }
    }
}

impl fmt::Display for SourceSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// CDC operation type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Create,
    Update,
    Delete,
    /// Row emitted by the connector's initial table scan.
    SnapshotRead,
}

impl Operation {
    /// Parse both Debezium op codes and spelled-out names.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "c" | "create" | "insert" => Some(Operation::Create),
            "u" | "update" => Some(Operation::Update),
            "d" | "delete" => Some(Operation::Delete),
            "r" | "read" | "snapshot-read" | "snapshot_read" => Some(Operation::SnapshotRead),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Delete => "delete",
            Operation::SnapshotRead => "snapshot-read",
        }
    }

    /// Create and snapshot rows both bring an aggregate into existence.
    pub fn is_creating(&self) -> bool {
        matches!(self, Operation::Create | Operation::SnapshotRead)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a message was read from, used to advance committed cursors.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamPosition {
    /// Stream key (one per captured table).
    pub stream: String,
    /// Redis stream entry id (e.g. "1700000000000-0").
    pub id: String,
}

impl StreamPosition {
    pub fn new(stream: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            stream: stream.into(),
            id: id.into(),
        }
    }
}

/// One raw CDC message plus its receipt time.
#[derive(Debug, Clone)]
pub struct EventMessage {
    raw_payload: String,
    received_at: DateTime<Utc>,
    position: Option<StreamPosition>,
    envelope: OnceLock<Option<Value>>,
    unique_identifier: OnceLock<String>,
}

impl EventMessage {
    /// Wrap a raw payload received now.
    pub fn new(raw_payload: impl Into<String>) -> Self {
        Self::received(raw_payload, Utc::now())
    }

    /// Wrap a raw payload with an explicit receipt time.
    pub fn received(raw_payload: impl Into<String>, received_at: DateTime<Utc>) -> Self {
        Self {
            raw_payload: raw_payload.into(),
            received_at,
            position: None,
            envelope: OnceLock::new(),
            unique_identifier: OnceLock::new(),
        }
    }

    /// Attach the stream position the message was read from.
    pub fn with_position(mut self, position: StreamPosition) -> Self {
        self.position = Some(position);
        self
    }

    pub fn raw_payload(&self) -> &str {
        &self.raw_payload
    }

    pub fn received_at(&self) -> DateTime<Utc> {
        self.received_at
    }

    pub fn position(&self) -> Option<&StreamPosition> {
        self.position.as_ref()
    }

    fn envelope(&self) -> Option<&Value> {
        self.envelope
            .get_or_init(|| serde_json::from_str(&self.raw_payload).ok())
            .as_ref()
    }

    /// Table name the event was captured from ("" if malformed).
    pub fn aggregate_type(&self) -> String {
        self.envelope().map(table_of).unwrap_or_default()
    }

    /// Entity type resolved from the table name.
    pub fn entity_type(&self) -> Option<EntityType> {
        EntityType::from_table(&self.aggregate_type())
    }

    /// Primary key of the changed row, as a string ("" if malformed).
    pub fn aggregate_id(&self) -> String {
        self.envelope().map(aggregate_id_of).unwrap_or_default()
    }

    /// Raw operation code ("" if malformed).
    pub fn operation_code(&self) -> String {
        self.envelope().map(operation_of).unwrap_or_default()
    }

    pub fn operation(&self) -> Option<Operation> {
        Operation::parse(&self.operation_code())
    }

    /// Source database name ("" if malformed).
    pub fn source(&self) -> String {
        self.envelope().map(source_of).unwrap_or_default()
    }

    /// Whether this row came from the connector's initial snapshot.
    pub fn is_snapshot(&self) -> bool {
        self.envelope().map(is_snapshot_value).unwrap_or(false)
    }

    /// Whether this is the final row of a connector's snapshot phase.
    pub fn is_last_snapshot(&self) -> bool {
        self.envelope()
            .and_then(|v| v.pointer("/source/snapshot"))
            .and_then(Value::as_str)
            .map(|s| s.eq_ignore_ascii_case("last"))
            .unwrap_or(false)
    }

    /// The changed row itself.
    pub fn entity(&self) -> Option<&Value> {
        self.envelope().and_then(entity_of)
    }

    /// A field of the changed row rendered as a string; `None` when missing or null.
    pub fn field(&self, name: &str) -> Option<String> {
        self.entity()
            .and_then(|e| e.get(name))
            .and_then(scalar_to_string)
    }

    /// Idempotency key: hex SHA-256 of the raw payload.
    ///
    /// A broker redelivery carries identical bytes and maps to the same key.
    pub fn unique_identifier(&self) -> &str {
        self.unique_identifier
            .get_or_init(|| content_hash(self.raw_payload.as_bytes()))
    }
}

/// Extract the aggregate id from a raw payload ("" on malformed input).
pub fn extract_aggregate_id(payload: &str) -> String {
    parse(payload).map(|v| aggregate_id_of(&v)).unwrap_or_default()
}

/// Extract the aggregate type (table name) from a raw payload ("" on malformed input).
pub fn extract_aggregate_type(payload: &str) -> String {
    parse(payload).map(|v| table_of(&v)).unwrap_or_default()
}

/// Extract the operation code from a raw payload ("" on malformed input).
pub fn extract_operation(payload: &str) -> String {
    parse(payload).map(|v| operation_of(&v)).unwrap_or_default()
}

/// Extract the source database name from a raw payload ("" on malformed input).
pub fn extract_source(payload: &str) -> String {
    parse(payload).map(|v| source_of(&v)).unwrap_or_default()
}

/// Whether a raw payload is an initial-snapshot record.
pub fn is_snapshot_event(payload: &str) -> bool {
    parse(payload).map(|v| is_snapshot_value(&v)).unwrap_or(false)
}

fn parse(payload: &str) -> Option<Value> {
    serde_json::from_str(payload).ok()
}

fn table_of(envelope: &Value) -> String {
    envelope
        .pointer("/source/table")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn source_of(envelope: &Value) -> String {
    envelope
        .pointer("/source/db")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn operation_of(envelope: &Value) -> String {
    envelope
        .pointer("/source/op")
        .or_else(|| envelope.get("op"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn entity_of(envelope: &Value) -> Option<&Value> {
    ["payload", "after", "before"]
        .iter()
        .filter_map(|key| envelope.get(*key))
        .find(|v| v.is_object())
}

fn aggregate_id_of(envelope: &Value) -> String {
    entity_of(envelope)
        .and_then(|e| e.get("id"))
        .and_then(scalar_to_string)
        .unwrap_or_default()
}

fn is_snapshot_value(envelope: &Value) -> bool {
    let flagged = match envelope.pointer("/source/snapshot") {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => !matches!(s.to_ascii_lowercase().as_str(), "false" | ""),
        _ => false,
    };
    flagged || Operation::parse(&operation_of(envelope)) == Some(Operation::SnapshotRead)
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Compute SHA256 content hash as hex string.
fn content_hash(data: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    hex::encode(Sha256::digest(data))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(db: &str, table: &str, op: &str, payload: &str) -> String {
        format!(
            r#"{{"source":{{"db":"{db}","table":"{table}","op":"{op}","snapshot":"false","ts_ms":1}},"payload":{payload},"ts_ms":2}}"#
        )
    }

    #[test]
    fn test_extract_fields() {
        let raw = envelope("legacy", "invoice", "c", r#"{"id":7,"customer_id":3}"#);
        assert_eq!(extract_aggregate_id(&raw), "7");
        assert_eq!(extract_aggregate_type(&raw), "invoice");
        assert_eq!(extract_operation(&raw), "c");
        assert_eq!(extract_source(&raw), "legacy");
        assert!(!is_snapshot_event(&raw));
    }

    #[test]
    fn test_malformed_payload_yields_empty_strings() {
        for raw in ["", "not json", "[]", r#"{"source":42}"#] {
            assert_eq!(extract_aggregate_id(raw), "");
            assert_eq!(extract_aggregate_type(raw), "");
            assert_eq!(extract_operation(raw), "");
            assert_eq!(extract_source(raw), "");
            assert!(!is_snapshot_event(raw));
        }
    }

    #[test]
    fn test_event_message_accessors() {
        let raw = envelope(
            "modern",
            "invoice_lines",
            "u",
            r#"{"id":"6f1c0a6e-0000-4000-8000-000000000001","invoice_id":null}"#,
        );
        let event = EventMessage::new(raw);
        assert_eq!(event.entity_type(), Some(EntityType::InvoiceLine));
        assert_eq!(event.operation(), Some(Operation::Update));
        assert_eq!(event.aggregate_id(), "6f1c0a6e-0000-4000-8000-000000000001");
        assert_eq!(event.field("invoice_id"), None);
        assert_eq!(event.source(), "modern");
    }

    #[test]
    fn test_debezium_after_and_before() {
        let raw = r#"{"source":{"db":"legacy","table":"customer","op":"d"},"before":{"id":5},"after":null}"#;
        let event = EventMessage::new(raw);
        assert_eq!(event.aggregate_id(), "5");
        assert_eq!(event.operation(), Some(Operation::Delete));

        let raw = r#"{"source":{"db":"legacy","table":"customer","op":"c"},"before":null,"after":{"id":6}}"#;
        assert_eq!(extract_aggregate_id(raw), "6");
    }

    #[test]
    fn test_snapshot_detection() {
        let bool_flag = r#"{"source":{"db":"legacy","table":"address","op":"r","snapshot":true},"payload":{"id":1}}"#;
        assert!(is_snapshot_event(bool_flag));

        let last = r#"{"source":{"db":"legacy","table":"address","op":"c","snapshot":"last"},"payload":{"id":1}}"#;
        assert!(is_snapshot_event(last));
        assert!(EventMessage::new(last).is_last_snapshot());

        let read_op = r#"{"source":{"db":"legacy","table":"address","op":"r"},"payload":{"id":1}}"#;
        assert!(is_snapshot_event(read_op));
        assert!(!EventMessage::new(read_op).is_last_snapshot());
    }

    #[test]
    fn test_operation_parse() {
        assert_eq!(Operation::parse("c"), Some(Operation::Create));
        assert_eq!(Operation::parse("CREATE"), Some(Operation::Create));
        assert_eq!(Operation::parse("u"), Some(Operation::Update));
        assert_eq!(Operation::parse("d"), Some(Operation::Delete));
        assert_eq!(Operation::parse("r"), Some(Operation::SnapshotRead));
        assert_eq!(Operation::parse("snapshot-read"), Some(Operation::SnapshotRead));
        assert_eq!(Operation::parse("t"), None);
        assert_eq!(Operation::parse(""), None);
    }

    #[test]
    fn test_entity_type_tables() {
        for entity in EntityType::ALL {
            for system in [SourceSystem::Legacy, SourceSystem::Modern] {
                assert_eq!(EntityType::from_table(entity.table(system)), Some(entity));
            }
        }
        assert_eq!(EntityType::from_table("payments"), None);
    }

    #[test]
    fn test_unique_identifier_is_stable() {
        let raw = envelope("legacy", "address", "c", r#"{"id":1}"#);
        let a = EventMessage::new(raw.clone());
        let b = EventMessage::new(raw);
        assert_eq!(a.unique_identifier(), b.unique_identifier());
        assert_eq!(a.unique_identifier().len(), 64);

        let other = EventMessage::new(envelope("legacy", "address", "u", r#"{"id":1}"#));
        assert_ne!(a.unique_identifier(), other.unique_identifier());
    }

    #[test]
    fn test_source_system_target() {
        assert_eq!(SourceSystem::Legacy.target(), SourceSystem::Modern);
        assert_eq!(SourceSystem::Modern.target(), SourceSystem::Legacy);
    }
}
