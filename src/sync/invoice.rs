// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Invoice replay.
//!
//! `customer_id` is required and `billing_address_id` optional. The legacy
//! schema keeps `issued_at` as epoch millis, the modern one as an RFC 3339
//! timestamp; both sides are compared at millisecond precision.

use super::{acquire, begin, commit, ledger_contains, ledger_record, mapping, Databases, ReplayOutcome};
use crate::error::{Result, SyncError};
use crate::event::EntityType;
use crate::model::{
    datetime_from_text, datetime_to_text, millis_to_datetime, truncate_to_millis, uuid_from_text,
    LegacyInvoice, ModernInvoice,
};
use sqlx::AnyConnection;
use std::sync::Arc;
use uuid::Uuid;

const ENTITY: EntityType = EntityType::Invoice;

#[derive(Clone)]
pub struct InvoiceSync {
    databases: Arc<Databases>,
}

impl InvoiceSync {
    pub fn new(databases: Arc<Databases>) -> Self {
        Self { databases }
    }

    pub async fn upsert_into_modern(&self, unique_identifier: &str, row: &LegacyInvoice) -> Result<ReplayOutcome> {
        let mut tx = begin(&self.databases.modern, "invoice.upsert_modern").await?;
        if ledger_contains(&mut tx, unique_identifier).await? {
            return Ok(ReplayOutcome::Duplicate);
        }

        let customer_id = mapping::require_new_id(&mut tx, EntityType::Customer, row.customer_id).await?;
        let billing_address_id =
            mapping::translate_optional_new(&mut tx, EntityType::Address, row.billing_address_id).await?;
        let issued_at = millis_to_datetime(row.issued_at)?;

        let new_id = match mapping::new_id_for(&mut tx, ENTITY, row.id).await? {
            Some(id) => id,
            None => {
                let id = Uuid::new_v4();
                mapping::insert(&mut tx, ENTITY, row.id, id).await?;
                id
            }
        };

        let target = ModernInvoice {
            id: new_id,
            customer_id,
            billing_address_id,
            issued_at,
            total_cents: row.total_cents,
        };
        let outcome = if load_modern(&mut tx, new_id).await?.as_ref() == Some(&target) {
            ReplayOutcome::Unchanged
        } else {
            write_modern(&mut tx, &target).await?;
            ReplayOutcome::Applied
        };

        ledger_record(&mut tx, unique_identifier).await?;
        commit(tx, "invoice.upsert_modern").await?;
        Ok(outcome)
    }

    pub async fn upsert_into_legacy(&self, unique_identifier: &str, row: &ModernInvoice) -> Result<ReplayOutcome> {
        let mut modern = acquire(&self.databases.modern, "invoice.upsert_legacy").await?;
        let mut tx = begin(&self.databases.legacy, "invoice.upsert_legacy").await?;
        if ledger_contains(&mut tx, unique_identifier).await? {
            return Ok(ReplayOutcome::Duplicate);
        }

        let fields = LegacyInvoice {
            id: 0,
            customer_id: mapping::require_old_id(&mut modern, EntityType::Customer, row.customer_id).await?,
            billing_address_id: mapping::translate_optional_old(
                &mut modern,
                EntityType::Address,
                row.billing_address_id,
            )
            .await?,
            issued_at: row.issued_at.timestamp_millis(),
            total_cents: row.total_cents,
        };

        let outcome = match mapping::old_id_for(&mut modern, ENTITY, row.id).await? {
            Some(old_id) => {
                let target = LegacyInvoice { id: old_id, ..fields };
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
        commit(tx, "invoice.upsert_legacy").await?;
        Ok(outcome)
    }

    pub async fn delete_from_modern(&self, unique_identifier: &str, old_id: i64) -> Result<ReplayOutcome> {
        let mut tx = begin(&self.databases.modern, "invoice.delete_modern").await?;
        if ledger_contains(&mut tx, unique_identifier).await? {
            return Ok(ReplayOutcome::Duplicate);
        }

        let outcome = match mapping::new_id_for(&mut tx, ENTITY, old_id).await? {
            None => ReplayOutcome::NotFound,
            Some(new_id) => {
                let deleted = sqlx::query("DELETE FROM invoices WHERE id = $1")
                    .bind(new_id.to_string())
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| SyncError::database("invoice.delete_modern", e))?
                    .rows_affected();
                if deleted > 0 {
                    ReplayOutcome::Applied
                } else {
                    ReplayOutcome::Unchanged
                }
            }
        };

        ledger_record(&mut tx, unique_identifier).await?;
        commit(tx, "invoice.delete_modern").await?;
        Ok(outcome)
    }

    pub async fn delete_from_legacy(&self, unique_identifier: &str, new_id: Uuid) -> Result<ReplayOutcome> {
        let mut modern = acquire(&self.databases.modern, "invoice.delete_legacy").await?;
        let mut tx = begin(&self.databases.legacy, "invoice.delete_legacy").await?;
        if ledger_contains(&mut tx, unique_identifier).await? {
            return Ok(ReplayOutcome::Duplicate);
        }

        let outcome = match mapping::old_id_for(&mut modern, ENTITY, new_id).await? {
            None => ReplayOutcome::NotFound,
            Some(old_id) => {
                let deleted = sqlx::query("DELETE FROM invoice WHERE id = $1")
                    .bind(old_id)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| SyncError::database("invoice.delete_legacy", e))?
                    .rows_affected();
                if deleted > 0 {
                    ReplayOutcome::Applied
                } else {
                    ReplayOutcome::Unchanged
                }
            }
        };

        ledger_record(&mut tx, unique_identifier).await?;
        commit(tx, "invoice.delete_legacy").await?;
        Ok(outcome)
    }

    pub async fn find_modern(&self, new_id: Uuid) -> Result<Option<ModernInvoice>> {
        let mut conn = acquire(&self.databases.modern, "invoice.find_modern").await?;
        load_modern(&mut conn, new_id).await
    }

    pub async fn find_legacy(&self, old_id: i64) -> Result<Option<LegacyInvoice>> {
        let mut conn = acquire(&self.databases.legacy, "invoice.find_legacy").await?;
        load_legacy(&mut conn, old_id).await
    }
}

async fn load_modern(conn: &mut AnyConnection, id: Uuid) -> Result<Option<ModernInvoice>> {
    let row: Option<(String, String, Option<String>, String, i64)> = sqlx::query_as(
        "SELECT id, customer_id, billing_address_id, issued_at, total_cents FROM invoices WHERE id = $1",
    )
    .bind(id.to_string())
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| SyncError::database("invoice.load_modern", e))?;

    row.map(|(id, customer_id, billing_address_id, issued_at, total_cents)| {
        Ok(ModernInvoice {
            id: uuid_from_text(&id)?,
            customer_id: uuid_from_text(&customer_id)?,
            billing_address_id: billing_address_id.as_deref().map(uuid_from_text).transpose()?,
            issued_at: datetime_from_text(&issued_at)?,
            total_cents,
        })
    })
    .transpose()
}

async fn write_modern(conn: &mut AnyConnection, row: &ModernInvoice) -> Result<()> {
    sqlx::query(
        "INSERT INTO invoices (id, customer_id, billing_address_id, issued_at, total_cents) \
         VALUES ($1, $2, $3, $4, $5) \
         ON CONFLICT (id) DO UPDATE SET customer_id = excluded.customer_id, \
         billing_address_id = excluded.billing_address_id, issued_at = excluded.issued_at, \
         total_cents = excluded.total_cents",
    )
    .bind(row.id.to_string())
    .bind(row.customer_id.to_string())
    .bind(row.billing_address_id.map(|id| id.to_string()))
    .bind(datetime_to_text(&truncate_to_millis(row.issued_at)))
    .bind(row.total_cents)
    .execute(&mut *conn)
    .await
    .map_err(|e| SyncError::database("invoice.write_modern", e))?;
    Ok(())
}

async fn load_legacy(conn: &mut AnyConnection, id: i64) -> Result<Option<LegacyInvoice>> {
    let row: Option<(i64, i64, Option<i64>, i64, i64)> = sqlx::query_as(
        "SELECT id, customer_id, billing_address_id, issued_at, total_cents FROM invoice WHERE id = $1",
    )
    .bind(id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| SyncError::database("invoice.load_legacy", e))?;

    Ok(row.map(|(id, customer_id, billing_address_id, issued_at, total_cents)| LegacyInvoice {
        id,
        customer_id,
        billing_address_id,
        issued_at,
        total_cents,
    }))
}

async fn write_legacy(conn: &mut AnyConnection, row: &LegacyInvoice) -> Result<()> {
    sqlx::query(
        "INSERT INTO invoice (id, customer_id, billing_address_id, issued_at, total_cents) \
         VALUES ($1, $2, $3, $4, $5) \
         ON CONFLICT (id) DO UPDATE SET customer_id = excluded.customer_id, \
         billing_address_id = excluded.billing_address_id, issued_at = excluded.issued_at, \
         total_cents = excluded.total_cents",
    )
    .bind(row.id)
    .bind(row.customer_id)
    .bind(row.billing_address_id)
    .bind(row.issued_at)
    .bind(row.total_cents)
    .execute(&mut *conn)
    .await
    .map_err(|e| SyncError::database("invoice.write_legacy", e))?;
    Ok(())
}

async fn insert_legacy(conn: &mut AnyConnection, row: &LegacyInvoice) -> Result<i64> {
    let (id,): (i64,) = sqlx::query_as(
        "INSERT INTO invoice (customer_id, billing_address_id, issued_at, total_cents) \
         VALUES ($1, $2, $3, $4) RETURNING id",
    )
    .bind(row.customer_id)
    .bind(row.billing_address_id)
    .bind(row.issued_at)
    .bind(row.total_cents)
    .fetch_one(&mut *conn)
    .await
    .map_err(|e| SyncError::database("invoice.insert_legacy", e))?;
    Ok(id)
}
