// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the replay engine.
//!
//! Errors are categorized by their source (Redis, the target databases,
//! payload decoding, ...) and carry enough context to find the event that
//! caused them.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `Broker` | Yes | Redis network errors, timeouts, connection failures |
//! | `Database` | Yes | Target database unreachable or busy |
//! | `Http` | Yes | Connector REST endpoint unreachable |
//! | `Startup` | Yes | A startup step reported "not ready yet" |
//! | `CursorStore` | No | Local SQLite errors (needs operator attention) |
//! | `Config` | No | Configuration invalid |
//! | `Decode` | No | Payload does not match the table's schema |
//! | `MissingMapping` | No | Foreign key has no mapping at replay time |
//! | `UnknownCommand` | No | No handler for (source, table, operation) |
//! | `Cancelled` | No | A wait was aborted by the cancel signal |
//! | `InvalidState` | No | Runner state machine violation |
//! | `Internal` | No | Unexpected internal error |
//!
//! # Retry Behavior
//!
//! [`SyncError::is_retryable()`] reports whether an error *looks* transient.
//! The [`RetryHelper`](crate::retry::RetryHelper) deliberately retries every
//! error regardless of this classification and only uses it for logging.

use crate::event::{EntityType, SourceSystem};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Result type alias for replay operations.
pub type Result<T> = std::result::Result<T, SyncError>;

/// Type alias for boxed async futures (keeps trait signatures object-safe).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Errors that can occur while consuming and replaying CDC events.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Redis connection or command error.
    #[error("Broker error ({operation}): {message}")]
    Broker {
        operation: String,
        message: String,
        #[source]
        source: Option<redis::RedisError>,
    },

    /// Error talking to one of the two target databases.
    #[error("Database error ({operation}): {source}")]
    Database {
        operation: String,
        #[source]
        source: sqlx::Error,
    },

    /// SQLite error during cursor persistence.
    #[error("Cursor store error: {0}")]
    CursorStore(#[source] sqlx::Error),

    /// Outbound HTTP failure (connector registration, readiness polling).
    #[error("HTTP error ({operation}): {message}")]
    Http { operation: String, message: String },

    /// A startup step has not completed yet (e.g. connector not RUNNING).
    #[error("Startup step '{step}' not complete: {message}")]
    Startup { step: String, message: String },

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Payload failed the strict per-table decoder.
    #[error("Decode error ({table}): {message}")]
    Decode { table: String, message: String },

    /// A foreign key could not be translated at replay time.
    ///
    /// Dependency resolution upstream is supposed to guarantee the parent
    /// exists, so this signals an ordering defect and is never masked.
    #[error("No {entity} mapping for {source_system} id '{id}'")]
    MissingMapping {
        entity: EntityType,
        source_system: SourceSystem,
        id: String,
    },

    /// No handler registered for a (source, table, operation) tuple.
    #[error("No command for source '{source_db}', table '{table}', operation '{operation}'")]
    UnknownCommand {
        source_db: String,
        table: String,
        operation: String,
    },

    /// A wait was aborted by the cancel signal.
    #[error("Operation cancelled")]
    Cancelled,

    /// Runner state machine violation.
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SyncError {
    /// Create a broker error from a redis::RedisError
    pub fn broker(operation: impl Into<String>, source: redis::RedisError) -> Self {
        Self::Broker {
            operation: operation.into(),
            message: source.to_string(),
            source: Some(source),
        }
    }

    /// Create a broker error without source
    pub fn broker_msg(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Broker {
            operation: operation.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Create a database error tagged with the operation that failed.
    pub fn database(operation: impl Into<String>, source: sqlx::Error) -> Self {
        Self::Database {
            operation: operation.into(),
            source,
        }
    }

    /// Create a decode error for a table.
    pub fn decode(table: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Decode {
            table: table.into(),
            message: message.into(),
        }
    }

    /// Create a missing-mapping error.
    pub fn missing_mapping(
        entity: EntityType,
        source_system: SourceSystem,
        id: impl ToString,
    ) -> Self {
        Self::MissingMapping {
            entity,
            source_system,
            id: id.to_string(),
        }
    }

    /// Check if this error looks transient.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Broker { .. } => true,
            Self::Database { .. } => true,
            Self::Http { .. } => true,
            Self::Startup { .. } => true,
            Self::CursorStore(_) => false,
            Self::Config(_) => false,
            Self::Decode { .. } => false,
            Self::MissingMapping { .. } => false,
            Self::UnknownCommand { .. } => false,
            Self::Cancelled => false,
            Self::InvalidState { .. } => false,
            Self::Internal(_) => false,
        }
    }

    /// Check if this is a payload decode failure (dropped at the ingestion boundary).
    pub fn is_decode(&self) -> bool {
        matches!(self, Self::Decode { .. })
    }

    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Broker { .. } => "broker",
            Self::Database { .. } => "database",
            Self::CursorStore(_) => "cursor_store",
            Self::Http { .. } => "http",
            Self::Startup { .. } => "startup",
            Self::Config(_) => "config",
            Self::Decode { .. } => "decode",
            Self::MissingMapping { .. } => "missing_mapping",
            Self::UnknownCommand { .. } => "unknown_command",
            Self::Cancelled => "cancelled",
            Self::InvalidState { .. } => "invalid_state",
            Self::Internal(_) => "internal",
        }
    }
}

impl From<redis::RedisError> for SyncError {
    fn from(e: redis::RedisError) -> Self {
        Self::broker("unknown", e)
    }
}

impl From<sqlx::Error> for SyncError {
    fn from(e: sqlx::Error) -> Self {
        Self::database("unknown", e)
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        Self::decode("envelope", e.to_string())
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(e: reqwest::Error) -> Self {
        Self::Http {
            operation: e
                .url()
                .map(|u| u.path().to_string())
                .unwrap_or_else(|| "request".to_string()),
            message: e.to_string(),
        }
    }
}
