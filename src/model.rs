// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Typed rows of both schemas.
//!
//! Upsert payloads are decoded strictly: an unknown column, a missing column
//! or a wrong type is a [`SyncError::Decode`] and the event is dropped at the
//! ingestion boundary. Delete payloads only need the primary key, so their
//! key structs ignore every other column.
//!
//! | Entity | Legacy table | Modern table |
//! |--------|--------------|--------------|
//! | Address | `address` | `addresses` |
//! | Customer | `customer` | `customers` |
//! | Invoice | `invoice` | `invoices` |
//! | InvoiceLine | `invoice_line` | `invoice_lines` |

use crate::error::{Result, SyncError};
use crate::event::EventMessage;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Legacy schema (integer ids)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LegacyAddress {
    pub id: i64,
    pub street: String,
    pub city: String,
    #[serde(default)]
    pub state: Option<String>,
    pub country: String,
    pub postal_code: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LegacyCustomer {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub address_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LegacyInvoice {
    pub id: i64,
    pub customer_id: i64,
    #[serde(default)]
    pub billing_address_id: Option<i64>,
    /// Epoch milliseconds.
    pub issued_at: i64,
    pub total_cents: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LegacyInvoiceLine {
    pub id: i64,
    pub invoice_id: i64,
    pub description: String,
    pub quantity: i64,
    pub unit_price_cents: i64,
}

/// Primary key of a legacy row (delete payloads).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct LegacyKey {
    pub id: i64,
}

// ---------------------------------------------------------------------------
// Modern schema (UUID ids)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModernAddress {
    pub id: Uuid,
    pub line1: String,
    pub city: String,
    #[serde(default)]
    pub region: Option<String>,
    pub country_code: String,
    pub zip: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModernCustomer {
    pub id: Uuid,
    pub full_name: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub address_id: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModernInvoice {
    pub id: Uuid,
    pub customer_id: Uuid,
    #[serde(default)]
    pub billing_address_id: Option<Uuid>,
    pub issued_at: DateTime<Utc>,
    pub total_cents: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModernInvoiceLine {
    pub id: Uuid,
    pub invoice_id: Uuid,
    pub description: String,
    pub quantity: i64,
    pub unit_price_cents: i64,
}

/// Primary key of a modern row (delete payloads).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct ModernKey {
    pub id: Uuid,
}

// ---------------------------------------------------------------------------
// Decoding and field conversions
// ---------------------------------------------------------------------------

/// Decode the changed row of `event` as `T`.
pub fn decode_row<T: DeserializeOwned>(event: &EventMessage, table: &str) -> Result<T> {
    let row = event
        .entity()
        .ok_or_else(|| SyncError::decode(table, "envelope carries no row"))?;
    serde_json::from_value(row.clone()).map_err(|e| SyncError::decode(table, e.to_string()))
}

/// Case-insensitive composite key used to deduplicate addresses.
///
/// Parts are trimmed, lowercased and joined with the ASCII unit separator so
/// that no concatenation of different parts collides.
pub fn address_natural_key(
    street: &str,
    city: &str,
    state: Option<&str>,
    country: &str,
    postal_code: &str,
) -> String {
    [street, city, state.unwrap_or(""), country, postal_code]
        .iter()
        .map(|part| part.trim().to_lowercase())
        .collect::<Vec<_>>()
        .join("\u{1f}")
}

impl LegacyAddress {
    pub fn natural_key(&self) -> String {
        address_natural_key(
            &self.street,
            &self.city,
            self.state.as_deref(),
            &self.country,
            &self.postal_code,
        )
    }
}

impl ModernAddress {
    pub fn natural_key(&self) -> String {
        address_natural_key(
            &self.line1,
            &self.city,
            self.region.as_deref(),
            &self.country_code,
            &self.zip,
        )
    }
}

/// Legacy epoch millis to a UTC timestamp.
pub fn millis_to_datetime(millis: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| SyncError::decode("invoice", format!("issued_at out of range: {millis}")))
}

/// Storage form of a modern timestamp (RFC 3339, millisecond precision).
pub fn datetime_to_text(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn datetime_from_text(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| SyncError::Internal(format!("stored timestamp '{value}' unreadable: {e}")))
}

/// Truncate to millisecond precision, the resolution both schemas share.
pub fn truncate_to_millis(value: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(value.timestamp_millis()).unwrap_or(value)
}

pub fn uuid_from_text(value: &str) -> Result<Uuid> {
    Uuid::parse_str(value)
        .map_err(|e| SyncError::Internal(format!("stored id '{value}' is not a UUID: {e}")))
}
