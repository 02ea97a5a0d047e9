// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Old-id ↔ new-id mapping tables (modern database).
//!
//! Mappings are append-only. A legacy id maps to exactly one UUID; a UUID maps
//! back to one legacy id except for addresses, where deduplication lets many
//! legacy addresses share one modern address. Reverse lookups return the
//! smallest legacy id in that case.
//!
//! The free functions work on a borrowed connection so they can run inside a
//! caller's transaction; [`MappingRepository`] wraps them for pool-level use.

use super::schema::mapping_table;
use crate::error::{Result, SyncError};
use crate::event::{EntityType, SourceSystem};
use crate::model::uuid_from_text;
use sqlx::{AnyConnection, AnyPool};
use uuid::Uuid;

fn db_err(operation: &str) -> impl FnOnce(sqlx::Error) -> SyncError + '_ {
    move |e| SyncError::database(operation, e)
}

pub async fn new_id_for(conn: &mut AnyConnection, entity: EntityType, old_id: i64) -> Result<Option<Uuid>> {
    let sql = format!("SELECT new_id FROM {} WHERE old_id = $1", mapping_table(entity));
    let row: Option<(String,)> = sqlx::query_as(&sql)
        .bind(old_id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(db_err("mapping.new_id_for"))?;
    row.map(|(id,)| uuid_from_text(&id)).transpose()
}

pub async fn old_id_for(conn: &mut AnyConnection, entity: EntityType, new_id: Uuid) -> Result<Option<i64>> {
    Ok(old_ids_for(conn, entity, new_id).await?.into_iter().next())
}

/// Every legacy id mapped onto `new_id`, ascending.
pub async fn old_ids_for(conn: &mut AnyConnection, entity: EntityType, new_id: Uuid) -> Result<Vec<i64>> {
    let sql = format!(
        "SELECT old_id FROM {} WHERE new_id = $1 ORDER BY old_id",
        mapping_table(entity)
    );
    let rows: Vec<(i64,)> = sqlx::query_as(&sql)
        .bind(new_id.to_string())
        .fetch_all(&mut *conn)
        .await
        .map_err(db_err("mapping.old_ids_for"))?;
    Ok(rows.into_iter().map(|(id,)| id).collect())
}

/// Record a mapping. An existing row for `old_id` is left untouched.
pub async fn insert(conn: &mut AnyConnection, entity: EntityType, old_id: i64, new_id: Uuid) -> Result<()> {
    let sql = format!(
        "INSERT INTO {} (old_id, new_id, mapped_at) VALUES ($1, $2, $3) ON CONFLICT (old_id) DO NOTHING",
        mapping_table(entity)
    );
    sqlx::query(&sql)
        .bind(old_id)
        .bind(new_id.to_string())
        .bind(chrono::Utc::now().timestamp_millis())
        .execute(&mut *conn)
        .await
        .map_err(db_err("mapping.insert"))?;
    Ok(())
}

/// Translate a legacy foreign key; a missing mapping is fatal for the event.
pub async fn require_new_id(conn: &mut AnyConnection, entity: EntityType, old_id: i64) -> Result<Uuid> {
    new_id_for(conn, entity, old_id)
        .await?
        .ok_or_else(|| SyncError::missing_mapping(entity, SourceSystem::Legacy, old_id))
}

/// Translate a modern foreign key; a missing mapping is fatal for the event.
pub async fn require_old_id(conn: &mut AnyConnection, entity: EntityType, new_id: Uuid) -> Result<i64> {
    old_id_for(conn, entity, new_id)
        .await?
        .ok_or_else(|| SyncError::missing_mapping(entity, SourceSystem::Modern, new_id))
}

pub async fn translate_optional_new(
    conn: &mut AnyConnection,
    entity: EntityType,
    old_id: Option<i64>,
) -> Result<Option<Uuid>> {
    match old_id {
        Some(id) => require_new_id(conn, entity, id).await.map(Some),
        None => Ok(None),
    }
}

pub async fn translate_optional_old(
    conn: &mut AnyConnection,
    entity: EntityType,
    new_id: Option<Uuid>,
) -> Result<Option<i64>> {
    match new_id {
        Some(id) => require_old_id(conn, entity, id).await.map(Some),
        None => Ok(None),
    }
}

// ---------------------------------------------------------------------------
// Address natural keys
// ---------------------------------------------------------------------------

pub async fn find_address_by_natural_key(conn: &mut AnyConnection, natural_key: &str) -> Result<Option<Uuid>> {
    let row: Option<(String,)> = sqlx::query_as("SELECT new_id FROM address_natural_key WHERE natural_key = $1")
        .bind(natural_key)
        .fetch_optional(&mut *conn)
        .await
        .map_err(db_err("natural_key.find"))?;
    row.map(|(id,)| uuid_from_text(&id)).transpose()
}

/// Point `new_id` at `natural_key`. If another address already owns the key,
/// that address keeps it.
pub async fn register_natural_key(conn: &mut AnyConnection, new_id: Uuid, natural_key: &str) -> Result<()> {
    remove_natural_key(conn, new_id).await?;
    sqlx::query(
        "INSERT INTO address_natural_key (new_id, natural_key) VALUES ($1, $2) ON CONFLICT (natural_key) DO NOTHING",
    )
    .bind(new_id.to_string())
    .bind(natural_key)
    .execute(&mut *conn)
    .await
    .map_err(db_err("natural_key.register"))?;
    Ok(())
}

pub async fn remove_natural_key(conn: &mut AnyConnection, new_id: Uuid) -> Result<()> {
    sqlx::query("DELETE FROM address_natural_key WHERE new_id = $1")
        .bind(new_id.to_string())
        .execute(&mut *conn)
        .await
        .map_err(db_err("natural_key.remove"))?;
    Ok(())
}

/// Pool-level access to the mapping tables.
#[derive(Clone)]
pub struct MappingRepository {
    pool: AnyPool,
}

impl MappingRepository {
    pub fn new(pool: AnyPool) -> Self {
        Self { pool }
    }

    async fn conn(&self) -> Result<sqlx::pool::PoolConnection<sqlx::Any>> {
        self.pool.acquire().await.map_err(db_err("mapping.acquire"))
    }

    pub async fn new_id_for(&self, entity: EntityType, old_id: i64) -> Result<Option<Uuid>> {
        let mut conn = self.conn().await?;
        new_id_for(&mut *conn, entity, old_id).await
    }

    pub async fn old_id_for(&self, entity: EntityType, new_id: Uuid) -> Result<Option<i64>> {
        let mut conn = self.conn().await?;
        old_id_for(&mut *conn, entity, new_id).await
    }

    pub async fn old_ids_for(&self, entity: EntityType, new_id: Uuid) -> Result<Vec<i64>> {
        let mut conn = self.conn().await?;
        old_ids_for(&mut *conn, entity, new_id).await
    }

    pub async fn insert(&self, entity: EntityType, old_id: i64, new_id: Uuid) -> Result<()> {
        let mut conn = self.conn().await?;
        insert(&mut *conn, entity, old_id, new_id).await
    }

    pub async fn find_address_by_natural_key(&self, natural_key: &str) -> Result<Option<Uuid>> {
        let mut conn = self.conn().await?;
        find_address_by_natural_key(&mut *conn, natural_key).await
    }
}
