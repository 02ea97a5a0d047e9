// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Table layout of both databases.
//!
//! Only used when `databases.manage_schema` is enabled (tests and local
//! runs). The DDL sticks to the subset SQLite and Postgres share.

use crate::error::{Result, SyncError};
use crate::event::EntityType;
use sqlx::AnyPool;
use tracing::debug;

const LEDGER_DDL: &str = "CREATE TABLE IF NOT EXISTS sync_ledger (
    unique_identifier TEXT PRIMARY KEY,
    applied_at BIGINT NOT NULL
)";

const LEGACY_DDL: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS address (
        id INTEGER PRIMARY KEY,
        street TEXT NOT NULL,
        city TEXT NOT NULL,
        state TEXT NULL,
        country TEXT NOT NULL,
        postal_code TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS customer (
        id INTEGER PRIMARY KEY,
        name TEXT NOT NULL,
        email TEXT NULL,
        address_id BIGINT NULL
    )",
    "CREATE TABLE IF NOT EXISTS invoice (
        id INTEGER PRIMARY KEY,
        customer_id BIGINT NOT NULL,
        billing_address_id BIGINT NULL,
        issued_at BIGINT NOT NULL,
        total_cents BIGINT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS invoice_line (
        id INTEGER PRIMARY KEY,
        invoice_id BIGINT NOT NULL,
        description TEXT NOT NULL,
        quantity BIGINT NOT NULL,
        unit_price_cents BIGINT NOT NULL
    )",
    LEDGER_DDL,
];

const MODERN_DDL: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS addresses (
        id TEXT PRIMARY KEY,
        line1 TEXT NOT NULL,
        city TEXT NOT NULL,
        region TEXT NULL,
        country_code TEXT NOT NULL,
        zip TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS customers (
        id TEXT PRIMARY KEY,
        full_name TEXT NOT NULL,
        email TEXT NULL,
        address_id TEXT NULL
    )",
    "CREATE TABLE IF NOT EXISTS invoices (
        id TEXT PRIMARY KEY,
        customer_id TEXT NOT NULL,
        billing_address_id TEXT NULL,
        issued_at TEXT NOT NULL,
        total_cents BIGINT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS invoice_lines (
        id TEXT PRIMARY KEY,
        invoice_id TEXT NOT NULL,
        description TEXT NOT NULL,
        quantity BIGINT NOT NULL,
        unit_price_cents BIGINT NOT NULL
    )",
    LEDGER_DDL,
    // Several legacy addresses may collapse onto one modern address, so
    // new_id is only indexed there; every other mapping is 1:1.
    "CREATE TABLE IF NOT EXISTS address_mapping (
        old_id BIGINT PRIMARY KEY,
        new_id TEXT NOT NULL,
        mapped_at BIGINT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS address_mapping_new_id ON address_mapping (new_id)",
    "CREATE TABLE IF NOT EXISTS customer_mapping (
        old_id BIGINT PRIMARY KEY,
        new_id TEXT NOT NULL UNIQUE,
        mapped_at BIGINT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS invoice_mapping (
        old_id BIGINT PRIMARY KEY,
        new_id TEXT NOT NULL UNIQUE,
        mapped_at BIGINT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS invoice_line_mapping (
        old_id BIGINT PRIMARY KEY,
        new_id TEXT NOT NULL UNIQUE,
        mapped_at BIGINT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS address_natural_key (
        new_id TEXT PRIMARY KEY,
        natural_key TEXT NOT NULL UNIQUE
    )",
];

/// Mapping table of an entity type (modern database).
pub fn mapping_table(entity: EntityType) -> &'static str {
    match entity {
        EntityType::Address => "address_mapping",
        EntityType::Customer => "customer_mapping",
        EntityType::Invoice => "invoice_mapping",
        EntityType::InvoiceLine => "invoice_line_mapping",
    }
}

async fn apply(pool: &AnyPool, statements: &[&str], operation: &str) -> Result<()> {
    for statement in statements {
        sqlx::query(statement)
            .execute(pool)
            .await
            .map_err(|e| SyncError::database(operation, e))?;
    }
    debug!(operation, statements = statements.len(), "Schema ensured");
    Ok(())
}

pub async fn ensure_legacy_schema(pool: &AnyPool) -> Result<()> {
    apply(pool, LEGACY_DDL, "ensure_legacy_schema").await
}

pub async fn ensure_modern_schema(pool: &AnyPool) -> Result<()> {
    apply(pool, MODERN_DDL, "ensure_modern_schema").await
}
