// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Dispatch from (source, table, operation) to a replay handler.
//!
//! The table is built once: two sources × four entity types × four
//! operations. Create, update and snapshot-read all map to an upsert; the
//! target decides between insert and update from the mapping tables.

use crate::config::DatabasesConfig;
use crate::error::{BoxFuture, Result, SyncError};
use crate::event::{EntityType, EventMessage, Operation, SourceSystem};
use crate::model::{
    decode_row, LegacyAddress, LegacyCustomer, LegacyInvoice, LegacyInvoiceLine, LegacyKey, ModernAddress,
    ModernCustomer, ModernInvoice, ModernInvoiceLine, ModernKey,
};
use crate::sync::{ReplayOutcome, SyncServices};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Dispatch key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommandKey {
    pub source: SourceSystem,
    pub entity: EntityType,
    pub operation: Operation,
}

/// A payload decoded by the strict per-table decoder.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    LegacyAddress(LegacyAddress),
    LegacyCustomer(LegacyCustomer),
    LegacyInvoice(LegacyInvoice),
    LegacyInvoiceLine(LegacyInvoiceLine),
    ModernAddress(ModernAddress),
    ModernCustomer(ModernCustomer),
    ModernInvoice(ModernInvoice),
    ModernInvoiceLine(ModernInvoiceLine),
    LegacyKey(EntityType, i64),
    ModernKey(EntityType, Uuid),
}

/// Replays one kind of event into the opposite database.
pub trait Command: Send + Sync {
    /// Decode the event's row. Failures are [`SyncError::Decode`].
    fn decode(&self, event: &EventMessage) -> Result<Decoded>;

    /// Apply a decoded row under the event's unique identifier.
    fn execute<'a>(&'a self, unique_identifier: &'a str, decoded: &'a Decoded) -> BoxFuture<'a, ReplayOutcome>;
}

fn mismatch(entity: EntityType, decoded: &Decoded) -> SyncError {
    SyncError::Internal(format!("{entity} command received {decoded:?}"))
}

/// Create, update and snapshot rows.
pub struct UpsertCommand {
    source: SourceSystem,
    entity: EntityType,
    services: Arc<SyncServices>,
}

impl UpsertCommand {
    pub fn new(source: SourceSystem, entity: EntityType, services: Arc<SyncServices>) -> Self {
        Self {
            source,
            entity,
            services,
        }
    }
}

impl Command for UpsertCommand {
    fn decode(&self, event: &EventMessage) -> Result<Decoded> {
        let table = self.entity.table(self.source);
        Ok(match (self.source, self.entity) {
            (SourceSystem::Legacy, EntityType::Address) => Decoded::LegacyAddress(decode_row(event, table)?),
            (SourceSystem::Legacy, EntityType::Customer) => Decoded::LegacyCustomer(decode_row(event, table)?),
            (SourceSystem::Legacy, EntityType::Invoice) => Decoded::LegacyInvoice(decode_row(event, table)?),
            (SourceSystem::Legacy, EntityType::InvoiceLine) => {
                Decoded::LegacyInvoiceLine(decode_row(event, table)?)
            }
            (SourceSystem::Modern, EntityType::Address) => Decoded::ModernAddress(decode_row(event, table)?),
            (SourceSystem::Modern, EntityType::Customer) => Decoded::ModernCustomer(decode_row(event, table)?),
            (SourceSystem::Modern, EntityType::Invoice) => Decoded::ModernInvoice(decode_row(event, table)?),
            (SourceSystem::Modern, EntityType::InvoiceLine) => {
                Decoded::ModernInvoiceLine(decode_row(event, table)?)
            }
        })
    }

    fn execute<'a>(&'a self, unique_identifier: &'a str, decoded: &'a Decoded) -> BoxFuture<'a, ReplayOutcome> {
        let services = &self.services;
        Box::pin(async move {
            match decoded {
                Decoded::LegacyAddress(row) => services.address.upsert_into_modern(unique_identifier, row).await,
                Decoded::LegacyCustomer(row) => services.customer.upsert_into_modern(unique_identifier, row).await,
                Decoded::LegacyInvoice(row) => services.invoice.upsert_into_modern(unique_identifier, row).await,
                Decoded::LegacyInvoiceLine(row) => {
                    services.invoice_line.upsert_into_modern(unique_identifier, row).await
                }
                Decoded::ModernAddress(row) => services.address.upsert_into_legacy(unique_identifier, row).await,
                Decoded::ModernCustomer(row) => services.customer.upsert_into_legacy(unique_identifier, row).await,
                Decoded::ModernInvoice(row) => services.invoice.upsert_into_legacy(unique_identifier, row).await,
                Decoded::ModernInvoiceLine(row) => {
                    services.invoice_line.upsert_into_legacy(unique_identifier, row).await
                }
                other => Err(mismatch(self.entity, other)),
            }
        })
    }
}

/// Deletes; only the primary key is decoded.
pub struct DeleteCommand {
    source: SourceSystem,
    entity: EntityType,
    services: Arc<SyncServices>,
}

impl DeleteCommand {
    pub fn new(source: SourceSystem, entity: EntityType, services: Arc<SyncServices>) -> Self {
        Self {
            source,
            entity,
            services,
        }
    }
}

impl Command for DeleteCommand {
    fn decode(&self, event: &EventMessage) -> Result<Decoded> {
        let table = self.entity.table(self.source);
        Ok(match self.source {
            SourceSystem::Legacy => {
                let key: LegacyKey = decode_row(event, table)?;
                Decoded::LegacyKey(self.entity, key.id)
            }
            SourceSystem::Modern => {
                let key: ModernKey = decode_row(event, table)?;
                Decoded::ModernKey(self.entity, key.id)
            }
        })
    }

    fn execute<'a>(&'a self, unique_identifier: &'a str, decoded: &'a Decoded) -> BoxFuture<'a, ReplayOutcome> {
        let services = &self.services;
        Box::pin(async move {
            match *decoded {
                Decoded::LegacyKey(EntityType::Address, id) => {
                    services.address.delete_from_modern(unique_identifier, id).await
                }
                Decoded::LegacyKey(EntityType::Customer, id) => {
                    services.customer.delete_from_modern(unique_identifier, id).await
                }
                Decoded::LegacyKey(EntityType::Invoice, id) => {
                    services.invoice.delete_from_modern(unique_identifier, id).await
                }
                Decoded::LegacyKey(EntityType::InvoiceLine, id) => {
                    services.invoice_line.delete_from_modern(unique_identifier, id).await
                }
                Decoded::ModernKey(EntityType::Address, id) => {
                    services.address.delete_from_legacy(unique_identifier, id).await
                }
                Decoded::ModernKey(EntityType::Customer, id) => {
                    services.customer.delete_from_legacy(unique_identifier, id).await
                }
                Decoded::ModernKey(EntityType::Invoice, id) => {
                    services.invoice.delete_from_legacy(unique_identifier, id).await
                }
                Decoded::ModernKey(EntityType::InvoiceLine, id) => {
                    services.invoice_line.delete_from_legacy(unique_identifier, id).await
                }
                ref other => Err(mismatch(self.entity, other)),
            }
        })
    }
}

/// Lookup table of every handler, built once at startup.
pub struct CommandFactory {
    commands: HashMap<CommandKey, Arc<dyn Command>>,
    databases: DatabasesConfig,
}

impl CommandFactory {
    pub fn new(services: Arc<SyncServices>, databases: DatabasesConfig) -> Self {
        let mut commands: HashMap<CommandKey, Arc<dyn Command>> = HashMap::new();
        for source in [SourceSystem::Legacy, SourceSystem::Modern] {
            for entity in EntityType::ALL {
                let upsert: Arc<dyn Command> = Arc::new(UpsertCommand::new(source, entity, services.clone()));
                let delete: Arc<dyn Command> = Arc::new(DeleteCommand::new(source, entity, services.clone()));
                for operation in [Operation::Create, Operation::Update, Operation::SnapshotRead] {
                    commands.insert(
                        CommandKey {
                            source,
                            entity,
                            operation,
                        },
                        upsert.clone(),
                    );
                }
                commands.insert(
                    CommandKey {
                        source,
                        entity,
                        operation: Operation::Delete,
                    },
                    delete,
                );
            }
        }
        Self { commands, databases }
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Resolve the raw envelope fields to a handler.
    pub fn get_command(&self, source_db: &str, table: &str, operation: &str) -> Result<(CommandKey, Arc<dyn Command>)> {
        let unknown = || SyncError::UnknownCommand {
            source_db: source_db.to_string(),
            table: table.to_string(),
            operation: operation.to_string(),
        };

        let source = self.databases.source_system(source_db).ok_or_else(unknown)?;
        let entity = EntityType::from_table(table).ok_or_else(unknown)?;
        // The table must belong to the schema the event claims to come from.
        if entity.table(source) != table.to_ascii_lowercase() {
            return Err(unknown());
        }
        let operation = Operation::parse(operation).ok_or_else(unknown)?;

        let key = CommandKey {
            source,
            entity,
            operation,
        };
        self.commands
            .get(&key)
            .map(|command| (key, command.clone()))
            .ok_or_else(unknown)
    }

    /// Resolve the handler for an event.
    pub fn for_event(&self, event: &EventMessage) -> Result<(CommandKey, Arc<dyn Command>)> {
        self.get_command(&event.source(), &event.aggregate_type(), &event.operation_code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::Databases;
    use serde_json::json;

    async fn factory() -> CommandFactory {
        let dbs = Arc::new(Databases::connect(&DatabasesConfig::in_memory()).await.unwrap());
        CommandFactory::new(Arc::new(SyncServices::new(dbs)), DatabasesConfig::in_memory())
    }

    #[tokio::test]
    async fn test_table_is_complete() {
        let factory = factory().await;
        assert_eq!(factory.len(), 2 * 4 * 4);
        for (source, table) in [("legacy", "invoice_line"), ("modern", "invoice_lines")] {
            for op in ["c", "u", "d", "r", "create", "snapshot-read"] {
                let (key, _) = factory.get_command(source, table, op).unwrap();
                assert_eq!(key.entity, EntityType::InvoiceLine);
            }
        }
    }

    #[tokio::test]
    async fn test_unknown_commands() {
        let factory = factory().await;
        for (source, table, op) in [
            ("", "address", "c"),
            ("billing", "address", "c"),
            ("legacy", "vendors", "c"),
            ("legacy", "address", "t"),
            ("legacy", "addresses", "c"),
            ("modern", "address", "c"),
        ] {
            let err = factory.get_command(source, table, op).err().unwrap();
            assert!(matches!(err, SyncError::UnknownCommand { .. }), "{source}/{table}/{op}");
        }
    }

    #[tokio::test]
    async fn test_decode_through_command() {
        let factory = factory().await;
        let event = EventMessage::new(
            json!({"source": {"db": "legacy", "table": "customer", "op": "u"},
                   "payload": {"id": 3, "name": "Ada", "email": null, "address_id": null}})
            .to_string(),
        );
        let (key, command) = factory.for_event(&event).unwrap();
        assert_eq!(key.operation, Operation::Update);
        assert!(matches!(command.decode(&event).unwrap(), Decoded::LegacyCustomer(ref c) if c.id == 3));

        let delete = EventMessage::new(
            json!({"source": {"db": "modern", "table": "customers", "op": "d"},
                   "before": {"id": "4b8e3f4a-1b8e-4a8e-9e0e-0c2f1f5b6a7d", "full_name": "Ada"}})
            .to_string(),
        );
        let (_, command) = factory.for_event(&delete).unwrap();
        assert!(matches!(
            command.decode(&delete).unwrap(),
            Decoded::ModernKey(EntityType::Customer, _)
        ));
    }

    #[tokio::test]
    async fn test_decode_failure_is_typed() {
        let factory = factory().await;
        let event = EventMessage::new(
            json!({"source": {"db": "legacy", "table": "address", "op": "c"},
                   "payload": {"id": 1, "street": "x"}})
            .to_string(),
        );
        let (_, command) = factory.for_event(&event).unwrap();
        assert!(command.decode(&event).unwrap_err().is_decode());
    }
}
