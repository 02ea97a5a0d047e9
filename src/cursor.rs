// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Cursor persistence for stream positions.
//!
//! Stores the last committed entry id of each broker stream in SQLite, so a
//! restart resumes where the previous run stopped without relying on Redis
//! persistence.
//!
//! # Debounced Writes
//!
//! - `set()` updates the in-memory cache immediately and marks the stream dirty
//! - `flush_dirty()` persists all dirty cursors in one pass
//! - The runner calls `flush_dirty()` on an interval and `close()` on shutdown
//!
//! A crash between `set()` and `flush_dirty()` re-reads up to one flush
//! interval of entries; the idempotency ledger turns those into no-ops.
//!
//! # Cursor Semantics
//!
//! The cursor is the **last committed** entry id. Reads resume strictly after
//! it. "Committed" means every entry up to and including it was replayed or
//! dropped; deferred entries hold the cursor back (see
//! [`StreamFrontier`](crate::stream::StreamFrontier)).

use crate::config::CursorConfig;
use crate::error::{Result, SyncError};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use crate::stream::compare_stream_ids;
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Attempts, first delay and delay ceiling for a locked cursor file.
const BUSY_ATTEMPTS: u32 = 5;
const BUSY_FIRST_DELAY: Duration = Duration::from_millis(10);
const BUSY_MAX_DELAY: Duration = Duration::from_millis(500);

/// Another process (or a checkpoint) holds the file: SQLITE_BUSY / SQLITE_LOCKED.
fn is_locked(e: &sqlx::Error) -> bool {
    let sqlx::Error::Database(db_err) = e else {
        return false;
    };
    match db_err.code() {
        Some(code) => code == "5" || code == "6",
        None => {
            let msg = db_err.message().to_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
    }
}

/// Run a cursor statement, waiting out short lock contention.
async fn while_locked<F, Fut, T>(operation: &str, mut f: F) -> std::result::Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut delay = BUSY_FIRST_DELAY;
    let mut attempt = 0;
    loop {
        attempt += 1;
        match f().await {
            Err(e) if is_locked(&e) && attempt < BUSY_ATTEMPTS => {
                warn!(operation, attempt, delay_ms = delay.as_millis() as u64, "Cursor file locked, retrying");
                crate::metrics::cursor_retries_total(operation);
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(BUSY_MAX_DELAY);
            }
            other => return other,
        }
    }
}

/// Persistent per-stream cursor storage backed by SQLite.
pub struct CursorStore {
    pool: SqlitePool,
    /// stream key -> last committed entry id
    cache: Arc<RwLock<HashMap<String, String>>>,
    /// Stream keys whose cursor has not been written yet
    dirty: Arc<RwLock<HashSet<String>>>,
    path: String,
}

impl CursorStore {
    /// Open (or create) the store described by `config`.
    ///
    /// `":memory:"` yields a private in-memory store on a single connection.
    pub async fn open(config: &CursorConfig) -> Result<Self> {
        let path = config.sqlite_path.clone();
        info!(path = %path, "Initializing cursor store");

        let in_memory = path == ":memory:";
        let url = if in_memory {
            "sqlite::memory:".to_string()
        } else {
            format!("sqlite://{}?mode=rwc", path)
        };

        let journal = if config.wal_mode && !in_memory {
            SqliteJournalMode::Wal
        } else {
            SqliteJournalMode::Delete
        };

        let options = SqliteConnectOptions::from_str(&url)
            .map_err(|e| SyncError::Config(format!("Invalid SQLite path: {}", e)))?
            .journal_mode(journal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .create_if_missing(true);

        // A memory database lives and dies with its connection.
        let pool = SqlitePoolOptions::new()
            .max_connections(if in_memory { 1 } else { 2 })
            .min_connections(if in_memory { 1 } else { 0 })
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(SyncError::CursorStore)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS stream_cursors (
                stream_key TEXT PRIMARY KEY,
                stream_id TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await
        .map_err(SyncError::CursorStore)?;

        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT stream_key, stream_id FROM stream_cursors")
                .fetch_all(&pool)
                .await
                .map_err(SyncError::CursorStore)?;

        let cache: HashMap<String, String> = rows.into_iter().collect();
        if !cache.is_empty() {
            info!(count = cache.len(), "Restored cursors from previous run");
        }

        Ok(Self {
            pool,
            cache: Arc::new(RwLock::new(cache)),
            dirty: Arc::new(RwLock::new(HashSet::new())),
            path,
        })
    }

    /// Committed cursor of a stream, if any.
    pub async fn get(&self, stream_key: &str) -> Option<String> {
        self.cache.read().await.get(stream_key).cloned()
    }

    /// Committed cursor, or "0" (XREAD: from the beginning).
    pub async fn get_or_start(&self, stream_key: &str) -> String {
        self.get(stream_key).await.unwrap_or_else(|| "0".to_string())
    }

    /// Move a cursor forward in memory; persisted by the next `flush_dirty()`.
    ///
    /// Cursors never move backwards: an id at or before the current one is
    /// ignored and `false` is returned.
    pub async fn set(&self, stream_key: &str, stream_id: &str) -> bool {
        let mut cache = self.cache.write().await;
        if let Some(current) = cache.get(stream_key) {
            if compare_stream_ids(stream_id, current) != Ordering::Greater {
                debug!(stream = %stream_key, current = %current, stream_id, "Ignoring cursor regression");
                return false;
            }
        }
        cache.insert(stream_key.to_string(), stream_id.to_string());
        drop(cache);
        self.dirty.write().await.insert(stream_key.to_string());
        true
    }

    /// Persist all dirty cursors. Returns the number written.
    pub async fn flush_dirty(&self) -> Result<usize> {
        let dirty_keys: Vec<String> = self.dirty.write().await.drain().collect();
        if dirty_keys.is_empty() {
            return Ok(0);
        }

        let now = chrono::Utc::now().timestamp_millis();
        let snapshot: Vec<(String, String)> = {
            let cache = self.cache.read().await;
            dirty_keys
                .iter()
                .filter_map(|k| cache.get(k).map(|v| (k.clone(), v.clone())))
                .collect()
        };

        let mut flushed = 0;
        let mut errors = 0;
        for (stream_key, stream_id) in snapshot {
            let pool = &self.pool;
            let result = while_locked("cursor_flush", || async {
                sqlx::query(
                    r#"
                    INSERT INTO stream_cursors (stream_key, stream_id, updated_at)
                    VALUES (?, ?, ?)
                    ON CONFLICT(stream_key) DO UPDATE SET
                        stream_id = excluded.stream_id,
                        updated_at = excluded.updated_at
                    "#,
                )
                .bind(&stream_key)
                .bind(&stream_id)
                .bind(now)
                .execute(pool)
                .await
            })
            .await;

            match result {
                Ok(_) => flushed += 1,
                Err(e) => {
                    errors += 1;
                    warn!(stream = %stream_key, error = %e, "Failed to flush cursor");
                    self.dirty.write().await.insert(stream_key);
                }
            }
        }

        if flushed > 0 || errors > 0 {
            debug!(flushed, errors, "Flushed dirty cursors");
            crate::metrics::record_cursor_flush(flushed, errors);
        }

        if errors > 0 {
            return Err(SyncError::Internal(format!("Failed to flush {} cursors", errors)));
        }
        Ok(flushed)
    }

    pub async fn has_dirty(&self) -> bool {
        !self.dirty.read().await.is_empty()
    }

    pub async fn dirty_count(&self) -> usize {
        self.dirty.read().await.len()
    }

    /// All committed cursors (for the health summary).
    pub async fn get_all(&self) -> HashMap<String, String> {
        self.cache.read().await.clone()
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Force the WAL into the main database file.
    pub async fn checkpoint(&self) -> Result<()> {
        let pool = &self.pool;
        while_locked("cursor_checkpoint", || async {
            sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)").execute(pool).await
        })
        .await
        .map_err(SyncError::CursorStore)?;
        Ok(())
    }

    /// Flush, checkpoint and close.
    pub async fn close(&self) {
        if self.has_dirty().await {
            if let Err(e) = self.flush_dirty().await {
                warn!(error = %e, "Failed to flush dirty cursors on close");
            }
        }
        if let Err(e) = self.checkpoint().await {
            warn!(error = %e, "Failed to checkpoint WAL on close");
        }
        self.pool.close().await;
        info!("Cursor store closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn file_config(dir: &tempfile::TempDir, name: &str) -> CursorConfig {
        CursorConfig {
            sqlite_path: dir.path().join(name).to_string_lossy().to_string(),
            wal_mode: true,
        }
    }

    #[tokio::test]
    async fn test_cursor_store_basic() {
        let dir = tempdir().unwrap();
        let store = CursorStore::open(&file_config(&dir, "basic.db")).await.unwrap();

        assert!(store.get("cdc.legacy.address").await.is_none());
        assert_eq!(store.get_or_start("cdc.legacy.address").await, "0");

        store.set("cdc.legacy.address", "1700000000000-0").await;
        store.set("cdc.legacy.address", "1700000000001-0").await;
        assert_eq!(store.get("cdc.legacy.address").await.as_deref(), Some("1700000000001-0"));
        assert_eq!(store.dirty_count().await, 1);

        assert_eq!(store.flush_dirty().await.unwrap(), 1);
        assert!(!store.has_dirty().await);
        store.close().await;
    }

    #[tokio::test]
    async fn test_cursor_store_persistence() {
        let dir = tempdir().unwrap();
        let config = file_config(&dir, "persist.db");
        {
            let store = CursorStore::open(&config).await.unwrap();
            store.set("cdc.modern.invoices", "9999-0").await;
            // close() flushes
            store.close().await;
        }
        {
            let store = CursorStore::open(&config).await.unwrap();
            assert_eq!(store.get("cdc.modern.invoices").await.as_deref(), Some("9999-0"));
            store.close().await;
        }
    }

    #[tokio::test]
    async fn test_cursor_store_in_memory() {
        let store = CursorStore::open(&CursorConfig::in_memory()).await.unwrap();
        for i in 0..4 {
            store.set(&format!("stream{i}"), &format!("{}-0", i * 100)).await;
        }
        assert_eq!(store.dirty_count().await, 4);
        assert_eq!(store.flush_dirty().await.unwrap(), 4);
        assert_eq!(store.get_all().await.len(), 4);
        assert_eq!(store.path(), ":memory:");
        store.close().await;
    }

    #[tokio::test]
    async fn test_flush_with_nothing_dirty() {
        let store = CursorStore::open(&CursorConfig::in_memory()).await.unwrap();
        assert_eq!(store.flush_dirty().await.unwrap(), 0);
        store.close().await;
    }

    #[tokio::test]
    async fn test_cursor_never_moves_backwards() {
        let store = CursorStore::open(&CursorConfig::in_memory()).await.unwrap();
        assert!(store.set("cdc.legacy.customer", "1700000000000-5").await);
        assert!(!store.set("cdc.legacy.customer", "1700000000000-5").await);
        assert!(!store.set("cdc.legacy.customer", "1699999999999-9").await);
        // Numeric, not lexicographic
        assert!(store.set("cdc.legacy.customer", "1700000000000-10").await);
        assert_eq!(
            store.get("cdc.legacy.customer").await.as_deref(),
            Some("1700000000000-10")
        );
        store.close().await;
    }

    #[tokio::test]
    async fn test_while_locked_gives_up_on_other_errors() {
        let mut calls = 0;
        let result: std::result::Result<i32, sqlx::Error> = while_locked("test_op", || {
            calls += 1;
            async { Err(sqlx::Error::RowNotFound) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_is_locked_ignores_other_errors() {
        assert!(!is_locked(&sqlx::Error::RowNotFound));
        assert!(!is_locked(&sqlx::Error::PoolTimedOut));
    }
}
