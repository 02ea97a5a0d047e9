// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Invoice line replay. `invoice_id` is required.

use super::{acquire, begin, commit, ledger_contains, ledger_record, mapping, Databases, ReplayOutcome};
use crate::error::{Result, SyncError};
use crate::event::EntityType;
use crate::model::{uuid_from_text, LegacyInvoiceLine, ModernInvoiceLine};
use sqlx::AnyConnection;
use std::sync::Arc;
use uuid::Uuid;

const ENTITY: EntityType = EntityType::InvoiceLine;

#[derive(Clone)]
pub struct InvoiceLineSync {
    databases: Arc<Databases>,
}

impl InvoiceLineSync {
    pub fn new(databases: Arc<Databases>) -> Self {
        Self { databases }
    }

    pub async fn upsert_into_modern(
        &self,
        unique_identifier: &str,
        row: &LegacyInvoiceLine,
    ) -> Result<ReplayOutcome> {
        let mut tx = begin(&self.databases.modern, "invoice_line.upsert_modern").await?;
        if ledger_contains(&mut tx, unique_identifier).await? {
            return Ok(ReplayOutcome::Duplicate);
        }

        let invoice_id = mapping::require_new_id(&mut tx, EntityType::Invoice, row.invoice_id).await?;
        let new_id = match mapping::new_id_for(&mut tx, ENTITY, row.id).await? {
            Some(id) => id,
            None => {
                let id = Uuid::new_v4();
                mapping::insert(&mut tx, ENTITY, row.id, id).await?;
                id
            }
        };

        let target = ModernInvoiceLine {
            id: new_id,
            invoice_id,
            description: row.description.clone(),
            quantity: row.quantity,
            unit_price_cents: row.unit_price_cents,
        };
        let outcome = if load_modern(&mut tx, new_id).await?.as_ref() == Some(&target) {
            ReplayOutcome::Unchanged
        } else {
            write_modern(&mut tx, &target).await?;
            ReplayOutcome::Applied
        };

        ledger_record(&mut tx, unique_identifier).await?;
        commit(tx, "invoice_line.upsert_modern").await?;
        Ok(outcome)
    }

    pub async fn upsert_into_legacy(
        &self,
        unique_identifier: &str,
        row: &ModernInvoiceLine,
    ) -> Result<ReplayOutcome> {
        let mut modern = acquire(&self.databases.modern, "invoice_line.upsert_legacy").await?;
        let mut tx = begin(&self.databases.legacy, "invoice_line.upsert_legacy").await?;
        if ledger_contains(&mut tx, unique_identifier).await? {
            return Ok(ReplayOutcome::Duplicate);
        }

        let fields = LegacyInvoiceLine {
            id: 0,
            invoice_id: mapping::require_old_id(&mut modern, EntityType::Invoice, row.invoice_id).await?,
            description: row.description.clone(),
            quantity: row.quantity,
            unit_price_cents: row.unit_price_cents,
        };

        let outcome = match mapping::old_id_for(&mut modern, ENTITY, row.id).await? {
            Some(old_id) => {
                let target = LegacyInvoiceLine { id: old_id, ..fields };
                if load_legacy(&mut tx, old_id).await?.as_ref() == Some(&target) {
                    ReplayOutcome::Unchanged
                } else {
                    write_legacy(&mut tx, &target).await?;
                    ReplayOutcome::Applied
                }
            }
            None => {
                let old_id = insert_legacy(&mut tx, &fields).await?;
                mapping::insert(&mut modern, ENTITY, old_id, row.id).await?;
                ReplayOutcome::Applied
            }
        };

        ledger_record(&mut tx, unique_identifier).await?;
        commit(tx, "invoice_line.upsert_legacy").await?;
        Ok(outcome)
    }

    pub async fn delete_from_modern(&self, unique_identifier: &str, old_id: i64) -> Result<ReplayOutcome> {
        let mut tx = begin(&self.databases.modern, "invoice_line.delete_modern").await?;
        if ledger_contains(&mut tx, unique_identifier).await? {
            return Ok(ReplayOutcome::Duplicate);
        }

        let outcome = match mapping::new_id_for(&mut tx, ENTITY, old_id).await? {
            None => ReplayOutcome::NotFound,
            Some(new_id) => {
                let deleted = sqlx::query("DELETE FROM invoice_lines WHERE id = $1")
                    .bind(new_id.to_string())
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| SyncError::database("invoice_line.delete_modern", e))?
                    .rows_affected();
                if deleted > 0 {
                    ReplayOutcome::Applied
                } else {
                    ReplayOutcome::Unchanged
                }
            }
        };

        ledger_record(&mut tx, unique_identifier).await?;
        commit(tx, "invoice_line.delete_modern").await?;
        Ok(outcome)
    }

    pub async fn delete_from_legacy(&self, unique_identifier: &str, new_id: Uuid) -> Result<ReplayOutcome> {
        let mut modern = acquire(&self.databases.modern, "invoice_line.delete_legacy").await?;
        let mut tx = begin(&self.databases.legacy, "invoice_line.delete_legacy").await?;
        if ledger_contains(&mut tx, unique_identifier).await? {
            return Ok(ReplayOutcome::Duplicate);
        }

        let outcome = match mapping::old_id_for(&mut modern, ENTITY, new_id).await? {
            None => ReplayOutcome::NotFound,
            Some(old_id) => {
                let deleted = sqlx::query("DELETE FROM invoice_line WHERE id = $1")
                    .bind(old_id)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| SyncError::database("invoice_line.delete_legacy", e))?
                    .rows_affected();
                if deleted > 0 {
                    ReplayOutcome::Applied
                } else {
                    ReplayOutcome::Unchanged
                }
            }
        };

        ledger_record(&mut tx, unique_identifier).await?;
        commit(tx, "invoice_line.delete_legacy").await?;
        Ok(outcome)
    }

    pub async fn find_modern(&self, new_id: Uuid) -> Result<Option<ModernInvoiceLine>> {
        let mut conn = acquire(&self.databases.modern, "invoice_line.find_modern").await?;
        load_modern(&mut conn, new_id).await
    }

    pub async fn find_legacy(&self, old_id: i64) -> Result<Option<LegacyInvoiceLine>> {
        let mut conn = acquire(&self.databases.legacy, "invoice_line.find_legacy").await?;
        load_legacy(&mut conn, old_id).await
    }
}

async fn load_modern(conn: &mut AnyConnection, id: Uuid) -> Result<Option<ModernInvoiceLine>> {
    let row: Option<(String, String, String, i64, i64)> = sqlx::query_as(
        "SELECT id, invoice_id, description, quantity, unit_price_cents FROM invoice_lines WHERE id = $1",
    )
    .bind(id.to_string())
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| SyncError::database("invoice_line.load_modern", e))?;

    row.map(|(id, invoice_id, description, quantity, unit_price_cents)| {
        Ok(ModernInvoiceLine {
            id: uuid_from_text(&id)?,
            invoice_id: uuid_from_text(&invoice_id)?,
            description,
            quantity,
            unit_price_cents,
        })
    })
    .transpose()
}

async fn write_modern(conn: &mut AnyConnection, row: &ModernInvoiceLine) -> Result<()> {
    sqlx::query(
        "INSERT INTO invoice_lines (id, invoice_id, description, quantity, unit_price_cents) \
         VALUES ($1, $2, $3, $4, $5) \
         ON CONFLICT (id) DO UPDATE SET invoice_id = excluded.invoice_id, \
         description = excluded.description, quantity = excluded.quantity, \
         unit_price_cents = excluded.unit_price_cents",
    )
    .bind(row.id.to_string())
    .bind(row.invoice_id.to_string())
    .bind(&row.description)
    .bind(row.quantity)
    .bind(row.unit_price_cents)
    .execute(&mut *conn)
    .await
    .map_err(|e| SyncError::database("invoice_line.write_modern", e))?;
    Ok(())
}

async fn load_legacy(conn: &mut AnyConnection, id: i64) -> Result<Option<LegacyInvoiceLine>> {
    let row: Option<(i64, i64, String, i64, i64)> = sqlx::query_as(
        "SELECT id, invoice_id, description, quantity, unit_price_cents FROM invoice_line WHERE id = $1",
    )
    .bind(id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| SyncError::database("invoice_line.load_legacy", e))?;

    Ok(row.map(|(id, invoice_id, description, quantity, unit_price_cents)| LegacyInvoiceLine {
        id,
        invoice_id,
        description,
        quantity,
        unit_price_cents,
    }))
}

async fn write_legacy(conn: &mut AnyConnection, row: &LegacyInvoiceLine) -> Result<()> {
    sqlx::query(
        "INSERT INTO invoice_line (id, invoice_id, description, quantity, unit_price_cents) \
         VALUES ($1, $2, $3, $4, $5) \
         ON CONFLICT (id) DO UPDATE SET invoice_id = excluded.invoice_id, \
         description = excluded.description, quantity = excluded.quantity, \
         unit_price_cents = excluded.unit_price_cents",
    )
    .bind(row.id)
    .bind(row.invoice_id)
    .bind(&row.description)
    .bind(row.quantity)
    .bind(row.unit_price_cents)
    .execute(&mut *conn)
    .await
    .map_err(|e| SyncError::database("invoice_line.write_legacy", e))?;
    Ok(())
}

async fn insert_legacy(conn: &mut AnyConnection, row: &LegacyInvoiceLine) -> Result<i64> {
    let (id,): (i64,) = sqlx::query_as(
        "INSERT INTO invoice_line (invoice_id, description, quantity, unit_price_cents) \
         VALUES ($1, $2, $3, $4) RETURNING id",
    )
    .bind(row.invoice_id)
    .bind(&row.description)
    .bind(row.quantity)
    .bind(row.unit_price_cents)
    .fetch_one(&mut *conn)
    .await
    .map_err(|e| SyncError::database("invoice_line.insert_legacy", e))?;
    Ok(id)
}
