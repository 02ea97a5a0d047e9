// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Customer replay. `address_id` is translated through the address mapping.

use super::{acquire, begin, commit, ledger_contains, ledger_record, mapping, Databases, ReplayOutcome};
use crate::error::{Result, SyncError};
use crate::event::EntityType;
use crate::model::{uuid_from_text, LegacyCustomer, ModernCustomer};
use sqlx::AnyConnection;
use std::sync::Arc;
use uuid::Uuid;

const ENTITY: EntityType = EntityType::Customer;

#[derive(Clone)]
pub struct CustomerSync {
    databases: Arc<Databases>,
}

impl CustomerSync {
    pub fn new(databases: Arc<Databases>) -> Self {
        Self { databases }
    }

    pub async fn upsert_into_modern(&self, unique_identifier: &str, row: &LegacyCustomer) -> Result<ReplayOutcome> {
        let mut tx = begin(&self.databases.modern, "customer.upsert_modern").await?;
        if ledger_contains(&mut tx, unique_identifier).await? {
            return Ok(ReplayOutcome::Duplicate);
        }

        let address_id = mapping::translate_optional_new(&mut tx, EntityType::Address, row.address_id).await?;
        let new_id = match mapping::new_id_for(&mut tx, ENTITY, row.id).await? {
            Some(id) => id,
            None => {
                let id = Uuid::new_v4();
                mapping::insert(&mut tx, ENTITY, row.id, id).await?;
                id
            }
        };

        let target = ModernCustomer {
            id: new_id,
            full_name: row.name.clone(),
            email: row.email.clone(),
            address_id,
        };
        let outcome = if load_modern(&mut tx, new_id).await?.as_ref() == Some(&target) {
            ReplayOutcome::Unchanged
        } else {
            write_modern(&mut tx, &target).await?;
            ReplayOutcome::Applied
        };

        ledger_record(&mut tx, unique_identifier).await?;
        commit(tx, "customer.upsert_modern").await?;
        Ok(outcome)
    }

    pub async fn upsert_into_legacy(&self, unique_identifier: &str, row: &ModernCustomer) -> Result<ReplayOutcome> {
        let mut modern = acquire(&self.databases.modern, "customer.upsert_legacy").await?;
        let mut tx = begin(&self.databases.legacy, "customer.upsert_legacy").await?;
        if ledger_contains(&mut tx, unique_identifier).await? {
            return Ok(ReplayOutcome::Duplicate);
        }

        let fields = LegacyCustomer {
            id: 0,
            name: row.full_name.clone(),
            email: row.email.clone(),
            address_id: mapping::translate_optional_old(&mut modern, EntityType::Address, row.address_id).await?,
        };

        let outcome = match mapping::old_id_for(&mut modern, ENTITY, row.id).await? {
            Some(old_id) => {
                let target = LegacyCustomer { id: old_id, ..fields };
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
        commit(tx, "customer.upsert_legacy").await?;
        Ok(outcome)
    }

    pub async fn delete_from_modern(&self, unique_identifier: &str, old_id: i64) -> Result<ReplayOutcome> {
        let mut tx = begin(&self.databases.modern, "customer.delete_modern").await?;
        if ledger_contains(&mut tx, unique_identifier).await? {
            return Ok(ReplayOutcome::Duplicate);
        }

        let outcome = match mapping::new_id_for(&mut tx, ENTITY, old_id).await? {
            None => ReplayOutcome::NotFound,
            Some(new_id) => {
                let deleted = sqlx::query("DELETE FROM customers WHERE id = $1")
                    .bind(new_id.to_string())
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| SyncError::database("customer.delete_modern", e))?
                    .rows_affected();
                if deleted > 0 {
                    ReplayOutcome::Applied
                } else {
                    ReplayOutcome::Unchanged
                }
            }
        };

        ledger_record(&mut tx, unique_identifier).await?;
        commit(tx, "customer.delete_modern").await?;
        Ok(outcome)
    }

    pub async fn delete_from_legacy(&self, unique_identifier: &str, new_id: Uuid) -> Result<ReplayOutcome> {
        let mut modern = acquire(&self.databases.modern, "customer.delete_legacy").await?;
        let mut tx = begin(&self.databases.legacy, "customer.delete_legacy").await?;
        if ledger_contains(&mut tx, unique_identifier).await? {
            return Ok(ReplayOutcome::Duplicate);
        }

        let outcome = match mapping::old_id_for(&mut modern, ENTITY, new_id).await? {
            None => ReplayOutcome::NotFound,
            Some(old_id) => {
                let deleted = sqlx::query("DELETE FROM customer WHERE id = $1")
                    .bind(old_id)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| SyncError::database("customer.delete_legacy", e))?
                    .rows_affected();
                if deleted > 0 {
                    ReplayOutcome::Applied
                } else {
                    ReplayOutcome::Unchanged
                }
            }
        };

        ledger_record(&mut tx, unique_identifier).await?;
        commit(tx, "customer.delete_legacy").await?;
        Ok(outcome)
    }

    pub async fn find_modern(&self, new_id: Uuid) -> Result<Option<ModernCustomer>> {
        let mut conn = acquire(&self.databases.modern, "customer.find_modern").await?;
        load_modern(&mut conn, new_id).await
    }

    pub async fn find_legacy(&self, old_id: i64) -> Result<Option<LegacyCustomer>> {
        let mut conn = acquire(&self.databases.legacy, "customer.find_legacy").await?;
        load_legacy(&mut conn, old_id).await
    }
}

async fn load_modern(conn: &mut AnyConnection, id: Uuid) -> Result<Option<ModernCustomer>> {
    let row: Option<(String, String, Option<String>, Option<String>)> =
        sqlx::query_as("SELECT id, full_name, email, address_id FROM customers WHERE id = $1")
            .bind(id.to_string())
            .fetch_optional(&mut *conn)
            .await
            .map_err(|e| SyncError::database("customer.load_modern", e))?;

    row.map(|(id, full_name, email, address_id)| {
        Ok(ModernCustomer {
            id: uuid_from_text(&id)?,
            full_name,
            email,
            address_id: address_id.as_deref().map(uuid_from_text).transpose()?,
        })
    })
    .transpose()
}

async fn write_modern(conn: &mut AnyConnection, row: &ModernCustomer) -> Result<()> {
    sqlx::query(
        "INSERT INTO customers (id, full_name, email, address_id) VALUES ($1, $2, $3, $4) \
         ON CONFLICT (id) DO UPDATE SET full_name = excluded.full_name, email = excluded.email, \
         address_id = excluded.address_id",
    )
    .bind(row.id.to_string())
    .bind(&row.full_name)
    .bind(row.email.clone())
    .bind(row.address_id.map(|id| id.to_string()))
    .execute(&mut *conn)
    .await
    .map_err(|e| SyncError::database("customer.write_modern", e))?;
    Ok(())
}

async fn load_legacy(conn: &mut AnyConnection, id: i64) -> Result<Option<LegacyCustomer>> {
    let row: Option<(i64, String, Option<String>, Option<i64>)> =
        sqlx::query_as("SELECT id, name, email, address_id FROM customer WHERE id = $1")
            .bind(id)
            .fetch_optional(&mut *conn)
            .await
            .map_err(|e| SyncError::database("customer.load_legacy", e))?;

    Ok(row.map(|(id, name, email, address_id)| LegacyCustomer {
        id,
        name,
        email,
        address_id,
    }))
}

async fn write_legacy(conn: &mut AnyConnection, row: &LegacyCustomer) -> Result<()> {
    sqlx::query(
        "INSERT INTO customer (id, name, email, address_id) VALUES ($1, $2, $3, $4) \
         ON CONFLICT (id) DO UPDATE SET name = excluded.name, email = excluded.email, \
         address_id = excluded.address_id",
    )
    .bind(row.id)
    .bind(&row.name)
    .bind(row.email.clone())
    .bind(row.address_id)
    .execute(&mut *conn)
    .await
    .map_err(|e| SyncError::database("customer.write_legacy", e))?;
    Ok(())
}

async fn insert_legacy(conn: &mut AnyConnection, row: &LegacyCustomer) -> Result<i64> {
    let (id,): (i64,) =
        sqlx::query_as("INSERT INTO customer (name, email, address_id) VALUES ($1, $2, $3) RETURNING id")
            .bind(&row.name)
            .bind(row.email.clone())
            .bind(row.address_id)
            .fetch_one(&mut *conn)
            .await
            .map_err(|e| SyncError::database("customer.insert_legacy", e))?;
    Ok(id)
}
