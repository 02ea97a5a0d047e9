// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-entity replay into the opposite database.
//!
//! Every mutating call follows the same contract:
//!
//! 1. The target ledger is checked first; a known unique identifier is a no-op
//!    ([`ReplayOutcome::Duplicate`]).
//! 2. Foreign keys are translated through the mapping tables. A missing
//!    mapping is [`SyncError::MissingMapping`] and propagates.
//! 3. Entity write, mapping row and ledger entry happen in one transaction on
//!    the target database.
//!
//! # Echo suppression
//!
//! A change replayed into one database is captured again by that database's
//! connector and comes back. When the translated row equals the stored row the
//! entity write is skipped ([`ReplayOutcome::Unchanged`]) and only the ledger
//! entry is recorded, which ends the round trip.
//!
//! # Legacy-side transactions
//!
//! Mapping tables live in the modern database. When replaying into the legacy
//! database, a freshly assigned legacy id is mapped on the modern side before
//! the legacy transaction commits; if the process dies in between, the next
//! delivery misses the legacy ledger, finds the mapping and updates the row
//! in place.

pub mod address;
pub mod customer;
pub mod invoice;
pub mod invoice_line;
pub mod mapping;
pub mod schema;

pub use address::AddressSync;
pub use customer::CustomerSync;
pub use invoice::InvoiceSync;
pub use invoice_line::InvoiceLineSync;
pub use mapping::MappingRepository;

use crate::config::DatabasesConfig;
use crate::error::{Result, SyncError};
use crate::event::SourceSystem;
use sqlx::any::{install_default_drivers, AnyPoolOptions};
use sqlx::{Any, AnyConnection, AnyPool, Transaction};
use std::sync::Arc;
use tracing::info;

/// Result of one replay call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayOutcome {
    /// The target database was changed.
    Applied,
    /// The target already held this exact row; only the ledger was written.
    Unchanged,
    /// The event was applied before (ledger hit).
    Duplicate,
    /// Delete for an aggregate the target never saw.
    NotFound,
}

impl ReplayOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReplayOutcome::Applied => "applied",
            ReplayOutcome::Unchanged => "unchanged",
            ReplayOutcome::Duplicate => "duplicate",
            ReplayOutcome::NotFound => "not_found",
        }
    }
}

impl std::fmt::Display for ReplayOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connection pools of both databases.
#[derive(Clone)]
pub struct Databases {
    pub legacy: AnyPool,
    pub modern: AnyPool,
}

impl Databases {
    /// Connect both pools, creating the schema when `manage_schema` is set.
    pub async fn connect(config: &DatabasesConfig) -> Result<Self> {
        install_default_drivers();

        let legacy = connect_pool(&config.legacy_url, config.max_connections, "connect_legacy").await?;
        let modern = connect_pool(&config.modern_url, config.max_connections, "connect_modern").await?;

        if config.manage_schema {
            schema::ensure_legacy_schema(&legacy).await?;
            schema::ensure_modern_schema(&modern).await?;
        }

        info!(
            legacy = %redact(&config.legacy_url),
            modern = %redact(&config.modern_url),
            manage_schema = config.manage_schema,
            "Databases connected"
        );
        Ok(Self { legacy, modern })
    }

    pub fn pool(&self, system: SourceSystem) -> &AnyPool {
        match system {
            SourceSystem::Legacy => &self.legacy,
            SourceSystem::Modern => &self.modern,
        }
    }

    pub fn mappings(&self) -> MappingRepository {
        MappingRepository::new(self.modern.clone())
    }

    pub async fn close(&self) {
        self.legacy.close().await;
        self.modern.close().await;
    }
}

async fn connect_pool(url: &str, max_connections: u32, operation: &str) -> Result<AnyPool> {
    let in_memory = url.contains(":memory:");
    let mut options = AnyPoolOptions::new().max_connections(max_connections.max(1));
    if in_memory {
        // A memory database vanishes with its last connection.
        options = options
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None);
    }
    options
        .connect(url)
        .await
        .map_err(|e| SyncError::database(operation, e))
}

/// Strip credentials from a connection URL for logging.
fn redact(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}://***{}", &url[..scheme_end], &url[at..])
        }
        _ => url.to_string(),
    }
}

pub(crate) async fn begin(pool: &AnyPool, operation: &str) -> Result<Transaction<'static, Any>> {
    pool.begin().await.map_err(|e| SyncError::database(operation, e))
}

pub(crate) async fn commit(tx: Transaction<'static, Any>, operation: &str) -> Result<()> {
    tx.commit().await.map_err(|e| SyncError::database(operation, e))
}

pub(crate) async fn acquire(pool: &AnyPool, operation: &str) -> Result<sqlx::pool::PoolConnection<Any>> {
    pool.acquire().await.map_err(|e| SyncError::database(operation, e))
}

/// Whether the ledger already holds `unique_identifier`.
pub async fn ledger_contains(conn: &mut AnyConnection, unique_identifier: &str) -> Result<bool> {
    let row: Option<(String,)> =
        sqlx::query_as("SELECT unique_identifier FROM sync_ledger WHERE unique_identifier = $1")
            .bind(unique_identifier)
            .fetch_optional(&mut *conn)
            .await
            .map_err(|e| SyncError::database("ledger.contains", e))?;
    Ok(row.is_some())
}

pub async fn ledger_record(conn: &mut AnyConnection, unique_identifier: &str) -> Result<()> {
    sqlx::query(
        "INSERT INTO sync_ledger (unique_identifier, applied_at) VALUES ($1, $2) \
         ON CONFLICT (unique_identifier) DO NOTHING",
    )
    .bind(unique_identifier)
    .bind(chrono::Utc::now().timestamp_millis())
    .execute(&mut *conn)
    .await
    .map_err(|e| SyncError::database("ledger.record", e))?;
    Ok(())
}

/// Number of ledger entries (diagnostics and tests).
pub async fn ledger_len(pool: &AnyPool) -> Result<i64> {
    let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM sync_ledger")
        .fetch_one(pool)
        .await
        .map_err(|e| SyncError::database("ledger.len", e))?;
    Ok(count)
}

/// The four entity services sharing one pair of pools.
#[derive(Clone)]
pub struct SyncServices {
    pub address: AddressSync,
    pub customer: CustomerSync,
    pub invoice: InvoiceSync,
    pub invoice_line: InvoiceLineSync,
}

impl SyncServices {
    pub fn new(databases: Arc<Databases>) -> Self {
        Self {
            address: AddressSync::new(databases.clone()),
            customer: CustomerSync::new(databases.clone()),
            invoice: InvoiceSync::new(databases.clone()),
            invoice_line: InvoiceLineSync::new(databases),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_labels() {
        assert_eq!(ReplayOutcome::Applied.as_str(), "applied");
        assert_eq!(ReplayOutcome::Unchanged.to_string(), "unchanged");
        assert_eq!(ReplayOutcome::Duplicate.as_str(), "duplicate");
        assert_eq!(ReplayOutcome::NotFound.as_str(), "not_found");
    }

    #[test]
    fn test_redact() {
        assert_eq!(
            redact("postgres://user:secret@db:5432/legacy"),
            "postgres://***@db:5432/legacy"
        );
        assert_eq!(redact("sqlite::memory:"), "sqlite::memory:");
    }

    #[tokio::test]
    async fn test_connect_in_memory_and_ledger() {
        let dbs = Databases::connect(&DatabasesConfig::in_memory()).await.unwrap();

        let mut tx = begin(&dbs.modern, "test").await.unwrap();
        assert!(!ledger_contains(&mut *tx, "abc").await.unwrap());
        ledger_record(&mut *tx, "abc").await.unwrap();
        ledger_record(&mut *tx, "abc").await.unwrap();
        assert!(ledger_contains(&mut *tx, "abc").await.unwrap());
        commit(tx, "test").await.unwrap();

        assert_eq!(ledger_len(&dbs.modern).await.unwrap(), 1);
        assert_eq!(ledger_len(&dbs.legacy).await.unwrap(), 0);
    }
}
