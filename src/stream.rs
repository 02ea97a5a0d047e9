// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Redis Streams transport.
//!
//! A CDC connector publishes one stream per captured table
//! (`{topic_prefix}.{table}`), with the JSON envelope in a single entry
//! field. [`RedisEventSource`] tails every stream of one source system with a
//! blocking `XREAD` and buffers the entries locally.
//!
//! # Fetched vs. committed positions
//!
//! The source remembers how far it has *read* each stream. How far it may
//! *commit* is decided by [`StreamFrontier`]: an entry counts as finished only
//! once it has been replayed or dropped, and the committed cursor never moves
//! past an entry that is still deferred. A crash therefore re-reads deferred
//! entries instead of losing them; re-reads of finished entries are absorbed by
//! the idempotency ledger.
//!
//! # Stream Trimming
//!
//! If a persisted cursor is older than the oldest entry still in a stream,
//! the stream was trimmed (`MAXLEN`/`MINID`) past us and events were lost.
//! This is logged and counted; reading resumes from the oldest entry.

use crate::broker::EventSource;
use crate::config::BrokerConfig;
use crate::cursor::CursorStore;
use crate::error::{BoxFuture, Result, SyncError};
use crate::event::{EventMessage, StreamPosition};
use crate::metrics;
use redis::aio::ConnectionManager;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// Buffered reader over all streams of one source system.
pub struct RedisEventSource {
    /// Source name (for logging)
    name: String,
    conn: ConnectionManager,
    /// Stream keys tailed by this source
    streams: Vec<String>,
    /// Last entry id read per stream
    fetched: HashMap<String, String>,
    buffer: VecDeque<EventMessage>,
    value_field: String,
    batch_size: usize,
}

impl RedisEventSource {
    /// Connect and position every stream at its committed cursor.
    pub async fn connect(
        name: impl Into<String>,
        streams: Vec<String>,
        config: &BrokerConfig,
        cursors: Option<&CursorStore>,
    ) -> Result<Self> {
        let name = name.into();
        let client = redis::Client::open(config.redis_url.as_str())
            .map_err(|e| SyncError::broker("open", e))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| SyncError::broker("connect", e))?;

        let mut fetched = HashMap::new();
        for stream in &streams {
            let cursor = match cursors {
                Some(store) => store.get_or_start(stream).await,
                None => "0".to_string(),
            };
            fetched.insert(stream.clone(), cursor);
        }

        let mut source = Self {
            name,
            conn,
            streams,
            fetched,
            buffer: VecDeque::new(),
            value_field: config.value_field.clone(),
            batch_size: config.batch_size.max(1),
        };
        source.check_cursors().await?;

        info!(
            source = %source.name,
            streams = source.streams.len(),
            "Redis event source connected"
        );
        Ok(source)
    }

    /// Get the oldest entry ID in a stream, if any.
    async fn oldest_id(&mut self, stream: &str) -> Result<Option<String>> {
        // XRANGE key - + COUNT 1 returns the oldest entry
        let result: Vec<(String, HashMap<String, redis::Value>)> = redis::cmd("XRANGE")
            .arg(stream)
            .arg("-")
            .arg("+")
            .arg("COUNT")
            .arg(1)
            .query_async(&mut self.conn)
            .await
            .map_err(|e| SyncError::broker("XRANGE", e))?;

        Ok(result.first().map(|(id, _)| id.clone()))
    }

    /// Warn about streams trimmed past their cursor.
    async fn check_cursors(&mut self) -> Result<()> {
        let positions: Vec<(String, String)> = self
            .fetched
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        for (stream, cursor) in positions {
            if cursor == "0" {
                continue;
            }
            if let Some(oldest) = self.oldest_id(&stream).await? {
                if compare_stream_ids(&cursor, &oldest) == std::cmp::Ordering::Less {
                    warn!(
                        source = %self.name,
                        stream = %stream,
                        cursor = %cursor,
                        oldest_id = %oldest,
                        "Stream was trimmed past our cursor - potential data gap!"
                    );
                    metrics::record_error(&self.name, "stream_trimmed");
                }
            }
        }
        Ok(())
    }

    /// Read the next batch into the local buffer. Returns entries read.
    async fn fill(&mut self, timeout: Duration) -> Result<usize> {
        let ids: Vec<String> = self
            .streams
            .iter()
            .map(|s| self.fetched.get(s).cloned().unwrap_or_else(|| "0".to_string()))
            .collect();

        let mut opts = StreamReadOptions::default().count(self.batch_size);
        // BLOCK 0 waits forever, so a zero timeout means "no BLOCK at all".
        if !timeout.is_zero() {
            opts = opts.block(timeout.as_millis().max(1) as usize);
        }

        let started = Instant::now();
        // XREAD [BLOCK ms] COUNT n STREAMS k1 k2 ... id1 id2 ...
        let reply: StreamReadReply = self
            .conn
            .xread_options(&self.streams, &ids, &opts)
            .await
            .map_err(|e| SyncError::broker("XREAD", e))?;
        metrics::record_stream_read_latency(&self.name, started.elapsed());

        let mut read = Vec::new();
        for stream in reply.keys {
            for entry in stream.ids {
                self.fetched.insert(stream.key.clone(), entry.id.clone());
                let position = StreamPosition::new(&stream.key, &entry.id);
                let raw = match get_string_field(&entry.map, &self.value_field) {
                    Ok(raw) => raw,
                    Err(e) => {
                        // Still handed out, so the frontier can move past it.
                        warn!(
                            source = %self.name,
                            stream = %stream.key,
                            stream_id = %entry.id,
                            error = %e,
                            "Unreadable stream entry"
                        );
                        String::new()
                    }
                };
                read.push(EventMessage::new(raw).with_position(position));
            }
        }

        // Interleave streams by entry id (millisecond timestamps).
        read.sort_by(|a, b| match (a.position(), b.position()) {
            (Some(a), Some(b)) => compare_stream_ids(&a.id, &b.id),
            _ => std::cmp::Ordering::Equal,
        });

        let count = read.len();
        if count > 0 {
            trace!(
                source = %self.name,
                count,
                "Read CDC entries"
            );
            metrics::record_events_read(&self.name, count);
        }
        self.buffer.extend(read);
        Ok(count)
    }

    async fn next(&mut self, timeout: Duration) -> Result<Option<EventMessage>> {
        if self.buffer.is_empty() {
            self.fill(timeout).await?;
        }
        Ok(self.buffer.pop_front())
    }

    /// Stream keys tailed by this source.
    pub fn streams(&self) -> &[String] {
        &self.streams
    }
}

impl EventSource for RedisEventSource {
    fn source_name(&self) -> &str {
        &self.name
    }

    fn poll(&mut self, timeout: Duration) -> BoxFuture<'_, Option<EventMessage>> {
        Box::pin(self.next(timeout))
    }
}

/// Extract a string field from a stream entry.
fn get_string_field(fields: &HashMap<String, redis::Value>, name: &str) -> Result<String> {
    let value = fields
        .get(name)
        .ok_or_else(|| SyncError::broker_msg("parse", format!("Missing field: {}", name)))?;

    match value {
        redis::Value::BulkString(bytes) => String::from_utf8(bytes.clone()).map_err(|e| {
            SyncError::broker_msg("parse", format!("Invalid UTF-8 in {}: {}", name, e))
        }),
        redis::Value::SimpleString(s) => Ok(s.clone()),
        _ => Err(SyncError::broker_msg(
            "parse",
            format!("Unexpected type for field {}: {:?}", name, value),
        )),
    }
}

/// Parse `{ms}-{seq}`. Special ids like "0" parse as `(n, 0)`; garbage as `(0, 0)`.
pub fn parse_stream_id(id: &str) -> (u64, u64) {
    match id.split_once('-') {
        Some((ts, seq)) => (ts.parse().unwrap_or(0), seq.parse().unwrap_or(0)),
        None => (id.parse().unwrap_or(0), 0),
    }
}

/// Compare two Redis stream IDs numerically, not lexicographically.
pub fn compare_stream_ids(a: &str, b: &str) -> std::cmp::Ordering {
    parse_stream_id(a).cmp(&parse_stream_id(b))
}

/// Parse the timestamp (milliseconds since epoch) from a stream ID.
///
/// Returns `None` for malformed IDs or special cases like "0".
pub fn parse_stream_id_timestamp(stream_id: &str) -> Option<u64> {
    let (ts, seq) = stream_id.split_once('-')?;
    seq.parse::<u64>().ok()?;
    ts.parse().ok()
}

/// Milliseconds between a stream ID's timestamp and `now_ms`.
pub fn calculate_lag_ms(stream_id: &str, now_ms: u64) -> Option<u64> {
    parse_stream_id_timestamp(stream_id).map(|ts| now_ms.saturating_sub(ts))
}

#[derive(Debug)]
struct Slot {
    id: String,
    done: bool,
}

/// Tracks which read entries are finished and how far each stream may commit.
#[derive(Debug, Default)]
pub struct StreamFrontier {
    streams: HashMap<String, BTreeMap<(u64, u64), Slot>>,
}

impl StreamFrontier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a read entry. Registering twice is harmless.
    pub fn track(&mut self, position: &StreamPosition) {
        self.streams
            .entry(position.stream.clone())
            .or_default()
            .entry(parse_stream_id(&position.id))
            .or_insert_with(|| Slot {
                id: position.id.clone(),
                done: false,
            });
    }

    /// Mark an entry replayed or dropped.
    pub fn complete(&mut self, position: &StreamPosition) {
        if let Some(slots) = self.streams.get_mut(&position.stream) {
            if let Some(slot) = slots.get_mut(&parse_stream_id(&position.id)) {
                slot.done = true;
            }
        }
    }

    /// Pop the finished prefix of every stream; returns the new commit point per stream.
    pub fn advance(&mut self) -> Vec<StreamPosition> {
        let mut commits = Vec::new();
        for (stream, slots) in self.streams.iter_mut() {
            let mut last = None;
            while let Some(entry) = slots.first_entry() {
                if !entry.get().done {
                    break;
                }
                last = Some(entry.remove().id);
            }
            if let Some(id) = last {
                commits.push(StreamPosition::new(stream.clone(), id));
            }
        }
        commits.sort_by(|a, b| a.stream.cmp(&b.stream));
        commits
    }

    /// Entries read but not yet committable.
    pub fn outstanding(&self) -> usize {
        self.streams.values().map(BTreeMap::len).sum()
    }
}

/// Persist the commit points produced by [`StreamFrontier::advance`].
pub async fn commit_positions(cursors: &CursorStore, source: &str, commits: &[StreamPosition]) {
    let now_ms = chrono::Utc::now().timestamp_millis().max(0) as u64;
    for commit in commits {
        cursors.set(&commit.stream, &commit.id).await;
        if let Some(lag) = calculate_lag_ms(&commit.id, now_ms) {
            metrics::record_replication_lag_ms(source, &commit.stream, lag);
        }
        debug!(source, stream = %commit.stream, stream_id = %commit.id, "Cursor advanced");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cmp::Ordering;

    #[test]
    fn test_compare_stream_ids() {
        assert_eq!(compare_stream_ids("1234567890123-0", "1234567890123-1"), Ordering::Less);
        assert_eq!(compare_stream_ids("1234567890123-1", "1234567890123-0"), Ordering::Greater);
        assert_eq!(compare_stream_ids("1234567890123-0", "1234567890123-0"), Ordering::Equal);
        assert_eq!(compare_stream_ids("1234567890000-0", "1234567890123-0"), Ordering::Less);
        assert_eq!(compare_stream_ids("0", "1234567890123-0"), Ordering::Less);
        assert_eq!(compare_stream_ids("0", "0"), Ordering::Equal);
        // numeric, not lexicographic
        assert_eq!(compare_stream_ids("9-0", "10-0"), Ordering::Less);
        assert_eq!(compare_stream_ids("1000-999999", "1000-1000000"), Ordering::Less);
    }

    #[test]
    fn test_parse_stream_id_timestamp() {
        assert_eq!(parse_stream_id_timestamp("1700000000000-3"), Some(1_700_000_000_000));
        assert_eq!(parse_stream_id_timestamp("0"), None);
        assert_eq!(parse_stream_id_timestamp("abc-def"), None);
        assert_eq!(calculate_lag_ms("1000-0", 1500), Some(500));
        assert_eq!(calculate_lag_ms("2000-0", 1500), Some(0));
        assert_eq!(calculate_lag_ms("garbage", 1500), None);
    }

    #[test]
    fn test_get_string_field() {
        let mut fields = HashMap::new();
        fields.insert("value".to_string(), redis::Value::BulkString(b"{}".to_vec()));
        fields.insert("key".to_string(), redis::Value::SimpleString("k".to_string()));
        fields.insert("n".to_string(), redis::Value::Int(42));
        fields.insert("bad".to_string(), redis::Value::BulkString(vec![0xFF, 0xFE]));

        assert_eq!(get_string_field(&fields, "value").unwrap(), "{}");
        assert_eq!(get_string_field(&fields, "key").unwrap(), "k");
        assert!(get_string_field(&fields, "missing").is_err());
        assert!(get_string_field(&fields, "n").is_err());
        assert!(get_string_field(&fields, "bad").is_err());
    }

    #[test]
    fn test_frontier_commits_contiguous_prefix() {
        let mut frontier = StreamFrontier::new();
        let a = StreamPosition::new("cdc.legacy.invoice", "100-0");
        let b = StreamPosition::new("cdc.legacy.invoice", "101-0");
        let c = StreamPosition::new("cdc.legacy.invoice", "102-0");
        for p in [&a, &b, &c] {
            frontier.track(p);
        }

        // b is deferred: only a may commit even though c is done.
        frontier.complete(&a);
        frontier.complete(&c);
        assert_eq!(frontier.advance(), vec![a.clone()]);
        assert_eq!(frontier.outstanding(), 2);

        frontier.complete(&b);
        assert_eq!(frontier.advance(), vec![c.clone()]);
        assert_eq!(frontier.outstanding(), 0);
        assert!(frontier.advance().is_empty());
    }

    #[test]
    fn test_frontier_streams_are_independent() {
        let mut frontier = StreamFrontier::new();
        let addr = StreamPosition::new("cdc.legacy.address", "5-0");
        let line = StreamPosition::new("cdc.legacy.invoice_line", "3-0");
        frontier.track(&addr);
        frontier.track(&line);
        frontier.complete(&addr);

        assert_eq!(frontier.advance(), vec![addr]);
        assert_eq!(frontier.outstanding(), 1);
    }

    #[test]
    fn test_frontier_track_twice_keeps_state() {
        let mut frontier = StreamFrontier::new();
        let p = StreamPosition::new("s", "1-0");
        frontier.track(&p);
        frontier.complete(&p);
        frontier.track(&p);
        assert_eq!(frontier.advance(), vec![p]);
    }

    #[test]
    fn test_frontier_orders_numerically() {
        let mut frontier = StreamFrontier::new();
        let late = StreamPosition::new("s", "10-0");
        let early = StreamPosition::new("s", "9-0");
        frontier.track(&late);
        frontier.track(&early);
        frontier.complete(&late);
        // 9-0 precedes 10-0 and is still open
        assert!(frontier.advance().is_empty());
        frontier.complete(&early);
        assert_eq!(frontier.advance(), vec![late]);
    }
}
