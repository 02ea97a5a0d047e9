// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Address replay.
//!
//! Addresses are deduplicated on their natural key (street, city, state,
//! country, postal code; case-insensitive). A legacy address with no mapping
//! yet reuses the modern address holding the same key, so several legacy ids
//! can map onto one modern id. Deleting one of those legacy rows keeps the
//! shared modern row.

use super::{acquire, begin, commit, ledger_contains, ledger_record, mapping, Databases, ReplayOutcome};
use crate::error::{Result, SyncError};
use crate::event::EntityType;
use crate::model::{uuid_from_text, LegacyAddress, ModernAddress};
use sqlx::AnyConnection;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

const ENTITY: EntityType = EntityType::Address;

#[derive(Clone)]
pub struct AddressSync {
    databases: Arc<Databases>,
}

impl AddressSync {
    pub fn new(databases: Arc<Databases>) -> Self {
        Self { databases }
    }

    /// Replay a legacy address into the modern database.
    pub async fn upsert_into_modern(&self, unique_identifier: &str, row: &LegacyAddress) -> Result<ReplayOutcome> {
        let mut tx = begin(&self.databases.modern, "address.upsert_modern").await?;
        if ledger_contains(&mut tx, unique_identifier).await? {
            return Ok(ReplayOutcome::Duplicate);
        }

        let natural_key = row.natural_key();
        let new_id = match mapping::new_id_for(&mut tx, ENTITY, row.id).await? {
            Some(id) => id,
            None => {
                let id = match mapping::find_address_by_natural_key(&mut tx, &natural_key).await? {
                    Some(existing) => {
                        debug!(old_id = row.id, new_id = %existing, "Address deduplicated on natural key");
                        existing
                    }
                    None => Uuid::new_v4(),
                };
                mapping::insert(&mut tx, ENTITY, row.id, id).await?;
                id
            }
        };

        let target = ModernAddress {
            id: new_id,
            line1: row.street.clone(),
            city: row.city.clone(),
            region: row.state.clone(),
            country_code: row.country.clone(),
            zip: row.postal_code.clone(),
        };

        let outcome = if load_modern(&mut tx, new_id).await?.as_ref() == Some(&target) {
            ReplayOutcome::Unchanged
        } else {
            write_modern(&mut tx, &target).await?;
            ReplayOutcome::Applied
        };
        mapping::register_natural_key(&mut tx, new_id, &natural_key).await?;
        ledger_record(&mut tx, unique_identifier).await?;
        commit(tx, "address.upsert_modern").await?;
        Ok(outcome)
    }

    /// Replay a modern address into the legacy database.
    pub async fn upsert_into_legacy(&self, unique_identifier: &str, row: &ModernAddress) -> Result<ReplayOutcome> {
        let mut modern = acquire(&self.databases.modern, "address.upsert_legacy").await?;
        let mut tx = begin(&self.databases.legacy, "address.upsert_legacy").await?;
        if ledger_contains(&mut tx, unique_identifier).await? {
            return Ok(ReplayOutcome::Duplicate);
        }

        let fields = LegacyAddress {
            id: 0,
            street: row.line1.clone(),
            city: row.city.clone(),
            state: row.region.clone(),
            country: row.country_code.clone(),
            postal_code: row.zip.clone(),
        };

        let outcome = match mapping::old_id_for(&mut modern, ENTITY, row.id).await? {
            Some(old_id) => {
                let target = LegacyAddress { id: old_id, ..fields };
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

        mapping::register_natural_key(&mut modern, row.id, &row.natural_key()).await?;
        ledger_record(&mut tx, unique_identifier).await?;
        commit(tx, "address.upsert_legacy").await?;
        Ok(outcome)
    }

    /// Replay a legacy delete into the modern database.
    pub async fn delete_from_modern(&self, unique_identifier: &str, old_id: i64) -> Result<ReplayOutcome> {
        let mut tx = begin(&self.databases.modern, "address.delete_modern").await?;
        if ledger_contains(&mut tx, unique_identifier).await? {
            return Ok(ReplayOutcome::Duplicate);
        }

        let outcome = match mapping::new_id_for(&mut tx, ENTITY, old_id).await? {
            None => ReplayOutcome::NotFound,
            Some(new_id) => {
                let sharing = mapping::old_ids_for(&mut tx, ENTITY, new_id).await?;
                if sharing.len() > 1 {
                    debug!(old_id, new_id = %new_id, shared_by = sharing.len(), "Shared address kept");
                    ReplayOutcome::Unchanged
                } else {
                    let deleted = sqlx::query("DELETE FROM addresses WHERE id = $1")
                        .bind(new_id.to_string())
                        .execute(&mut *tx)
                        .await
                        .map_err(|e| SyncError::database("address.delete_modern", e))?
                        .rows_affected();
                    mapping::remove_natural_key(&mut tx, new_id).await?;
                    if deleted > 0 {
                        ReplayOutcome::Applied
                    } else {
                        ReplayOutcome::Unchanged
                    }
                }
            }
        };

        ledger_record(&mut tx, unique_identifier).await?;
        commit(tx, "address.delete_modern").await?;
        Ok(outcome)
    }

    /// Replay a modern delete into the legacy database.
    ///
    /// Every legacy row mapped onto the deleted address goes with it.
    pub async fn delete_from_legacy(&self, unique_identifier: &str, new_id: Uuid) -> Result<ReplayOutcome> {
        let mut modern = acquire(&self.databases.modern, "address.delete_legacy").await?;
        let mut tx = begin(&self.databases.legacy, "address.delete_legacy").await?;
        if ledger_contains(&mut tx, unique_identifier).await? {
            return Ok(ReplayOutcome::Duplicate);
        }

        let old_ids = mapping::old_ids_for(&mut modern, ENTITY, new_id).await?;
        let outcome = if old_ids.is_empty() {
            ReplayOutcome::NotFound
        } else {
            let mut deleted = 0;
            for old_id in &old_ids {
                deleted += sqlx::query("DELETE FROM address WHERE id = $1")
                    .bind(*old_id)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| SyncError::database("address.delete_legacy", e))?
                    .rows_affected();
            }
            mapping::remove_natural_key(&mut modern, new_id).await?;
            if deleted > 0 {
                ReplayOutcome::Applied
            } else {
                ReplayOutcome::Unchanged
            }
        };

        ledger_record(&mut tx, unique_identifier).await?;
        commit(tx, "address.delete_legacy").await?;
        Ok(outcome)
    }

    pub async fn find_modern(&self, new_id: Uuid) -> Result<Option<ModernAddress>> {
        let mut conn = acquire(&self.databases.modern, "address.find_modern").await?;
        load_modern(&mut conn, new_id).await
    }

    pub async fn find_legacy(&self, old_id: i64) -> Result<Option<LegacyAddress>> {
        let mut conn = acquire(&self.databases.legacy, "address.find_legacy").await?;
        load_legacy(&mut conn, old_id).await
    }
}

async fn load_modern(conn: &mut AnyConnection, id: Uuid) -> Result<Option<ModernAddress>> {
    let row: Option<(String, String, String, Option<String>, String, String)> = sqlx::query_as(
        "SELECT id, line1, city, region, country_code, zip FROM addresses WHERE id = $1",
    )
    .bind(id.to_string())
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| SyncError::database("address.load_modern", e))?;

    row.map(|(id, line1, city, region, country_code, zip)| {
        Ok(ModernAddress {
            id: uuid_from_text(&id)?,
            line1,
            city,
            region,
            country_code,
            zip,
        })
    })
    .transpose()
}

async fn write_modern(conn: &mut AnyConnection, row: &ModernAddress) -> Result<()> {
    sqlx::query(
        "INSERT INTO addresses (id, line1, city, region, country_code, zip) VALUES ($1, $2, $3, $4, $5, $6) \
         ON CONFLICT (id) DO UPDATE SET line1 = excluded.line1, city = excluded.city, \
         region = excluded.region, country_code = excluded.country_code, zip = excluded.zip",
    )
    .bind(row.id.to_string())
    .bind(&row.line1)
    .bind(&row.city)
    .bind(row.region.clone())
    .bind(&row.country_code)
    .bind(&row.zip)
    .execute(&mut *conn)
    .await
    .map_err(|e| SyncError::database("address.write_modern", e))?;
    Ok(())
}

async fn load_legacy(conn: &mut AnyConnection, id: i64) -> Result<Option<LegacyAddress>> {
    let row: Option<(i64, String, String, Option<String>, String, String)> = sqlx::query_as(
        "SELECT id, street, city, state, country, postal_code FROM address WHERE id = $1",
    )
    .bind(id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| SyncError::database("address.load_legacy", e))?;

    Ok(row.map(|(id, street, city, state, country, postal_code)| LegacyAddress {
        id,
        street,
        city,
        state,
        country,
        postal_code,
    }))
}

async fn write_legacy(conn: &mut AnyConnection, row: &LegacyAddress) -> Result<()> {
    sqlx::query(
        "INSERT INTO address (id, street, city, state, country, postal_code) VALUES ($1, $2, $3, $4, $5, $6) \
         ON CONFLICT (id) DO UPDATE SET street = excluded.street, city = excluded.city, \
         state = excluded.state, country = excluded.country, postal_code = excluded.postal_code",
    )
    .bind(row.id)
    .bind(&row.street)
    .bind(&row.city)
    .bind(row.state.clone())
    .bind(&row.country)
    .bind(&row.postal_code)
    .execute(&mut *conn)
    .await
    .map_err(|e| SyncError::database("address.write_legacy", e))?;
    Ok(())
}

/// Insert without an id and return the one the database assigned.
async fn insert_legacy(conn: &mut AnyConnection, row: &LegacyAddress) -> Result<i64> {
    let (id,): (i64,) = sqlx::query_as(
        "INSERT INTO address (street, city, state, country, postal_code) VALUES ($1, $2, $3, $4, $5) RETURNING id",
    )
    .bind(&row.street)
    .bind(&row.city)
    .bind(row.state.clone())
    .bind(&row.country)
    .bind(&row.postal_code)
    .fetch_one(&mut *conn)
    .await
    .map_err(|e| SyncError::database("address.insert_legacy", e))?;
    Ok(id)
}
