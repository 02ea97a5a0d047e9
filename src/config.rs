// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Configuration for the replay engine.
//!
//! All types deserialize from YAML/JSON with defaults for every optional
//! field, and can be built programmatically.
//!
//! # Quick Start
//!
//! ```rust
//! use cdc_replay_engine::config::ReplayConfig;
//!
//! let config = ReplayConfig {
//!     ..ReplayConfig::for_testing()
//! };
//! assert_eq!(config.databases.legacy_db_name, "legacy");
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! ReplayConfig
//! ├── databases: DatabasesConfig          # Target pools and source-name mapping
//! ├── broker: BrokerConfig                # Redis Streams transport
//! ├── dependency_wait: DependencyWaitConfig
//! ├── retry: RetrySettings                # Backoff for replays and startup steps
//! ├── priority_groups: PriorityGroups     # Ordering rules
//! ├── connectors: ConnectorsConfig        # Startup connector registration
//! ├── runner: RunnerSettings              # Pass sizing, flush, drain
//! ├── health: HealthConfig                # HTTP health surface
//! └── cursor: CursorConfig                # SQLite cursor persistence
//! ```
//!
//! # YAML Example
//!
//! ```yaml
//! databases:
//!   legacy_url: "postgres://app@legacy-db/billing"
//!   modern_url: "postgres://app@modern-db/billing"
//!
//! broker:
//!   redis_url: "redis://broker:6379"
//!   legacy_topic_prefix: "cdc.legacy"
//!   modern_topic_prefix: "cdc.modern"
//!
//! dependency_wait:
//!   poll_timeout: "200ms"
//!   grace_delay: "50ms"
//!   max_wait: "10s"
//!
//! cursor:
//!   sqlite_path: "/var/lib/cdc-replay/cursors.db"
//! ```

use crate::error::{Result, SyncError};
use crate::event::{EntityType, SourceSystem};
use crate::priority::{self, PriorityGroups};
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

fn parse_or(value: &str, fallback: Duration) -> Duration {
    humantime::parse_duration(value).unwrap_or(fallback)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level config object passed to `RunnerService::new()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayConfig {
    #[serde(default)]
    pub databases: DatabasesConfig,

    #[serde(default)]
    pub broker: BrokerConfig,

    #[serde(default)]
    pub dependency_wait: DependencyWaitConfig,

    #[serde(default)]
    pub retry: RetrySettings,

    /// Ordering rules; see [`crate::priority`].
    #[serde(default = "priority::default_priority_groups")]
    pub priority_groups: PriorityGroups,

    #[serde(default)]
    pub connectors: ConnectorsConfig,

    #[serde(default)]
    pub runner: RunnerSettings,

    #[serde(default)]
    pub health: HealthConfig,

    #[serde(default)]
    pub cursor: CursorConfig,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            databases: DatabasesConfig::default(),
            broker: BrokerConfig::default(),
            dependency_wait: DependencyWaitConfig::default(),
            retry: RetrySettings::default(),
            priority_groups: priority::default_priority_groups(),
            connectors: ConnectorsConfig::default(),
            runner: RunnerSettings::default(),
            health: HealthConfig::default(),
            cursor: CursorConfig::default(),
        }
    }
}

impl ReplayConfig {
    /// Config for tests: in-memory databases and cursors, short waits.
    pub fn for_testing() -> Self {
        Self {
            databases: DatabasesConfig::in_memory(),
            broker: BrokerConfig::default(),
            dependency_wait: DependencyWaitConfig::for_testing(),
            retry: RetrySettings::for_testing(),
            priority_groups: priority::default_priority_groups(),
            connectors: ConnectorsConfig::default(),
            runner: RunnerSettings::default(),
            health: HealthConfig {
                enabled: false,
                ..Default::default()
            },
            cursor: CursorConfig::in_memory(),
        }
    }

    /// Check invariants that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        priority::validate(&self.priority_groups)?;
        if self.databases.legacy_db_name == self.databases.modern_db_name {
            return Err(SyncError::Config(
                "legacy_db_name and modern_db_name must differ".to_string(),
            ));
        }
        if self.broker.legacy_topic_prefix == self.broker.modern_topic_prefix {
            return Err(SyncError::Config(
                "legacy and modern topic prefixes must differ".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(SyncError::Config("retry.max_attempts must be at least 1".to_string()));
        }
        Ok(())
    }

    /// Load from an optional file, overlaid with `CDC_REPLAY__*` variables
    /// (`CDC_REPLAY__BROKER__REDIS_URL` sets `broker.redis_url`), then validate.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(::config::File::from(std::path::Path::new(path)));
        }
        let settings = builder
            .add_source(
                ::config::Environment::with_prefix("CDC_REPLAY")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| SyncError::Config(e.to_string()))?;

        let config: ReplayConfig = settings
            .try_deserialize()
            .map_err(|e| SyncError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// DatabasesConfig: the two replay targets
// ═══════════════════════════════════════════════════════════════════════════════

/// Connection settings for both databases.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabasesConfig {
    /// sqlx URL of the old schema (integer ids).
    #[serde(default = "default_legacy_url")]
    pub legacy_url: String,

    /// sqlx URL of the new schema (UUID ids, mapping tables).
    #[serde(default = "default_modern_url")]
    pub modern_url: String,

    /// Value of `source.db` in envelopes captured from the legacy database.
    #[serde(default = "default_legacy_db_name")]
    pub legacy_db_name: String,

    /// Value of `source.db` in envelopes captured from the modern database.
    #[serde(default = "default_modern_db_name")]
    pub modern_db_name: String,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Create tables on startup (SQLite-flavoured DDL; local runs and tests).
    #[serde(default)]
    pub manage_schema: bool,
}

fn default_legacy_url() -> String {
    "sqlite://legacy.db?mode=rwc".to_string()
}

fn default_modern_url() -> String {
    "sqlite://modern.db?mode=rwc".to_string()
}

fn default_legacy_db_name() -> String {
    "legacy".to_string()
}

fn default_modern_db_name() -> String {
    "modern".to_string()
}

fn default_max_connections() -> u32 {
    5
}

impl Default for DatabasesConfig {
    fn default() -> Self {
        Self {
            legacy_url: default_legacy_url(),
            modern_url: default_modern_url(),
            legacy_db_name: default_legacy_db_name(),
            modern_db_name: default_modern_db_name(),
            max_connections: default_max_connections(),
            manage_schema: false,
        }
    }
}

impl DatabasesConfig {
    /// In-memory SQLite for both sides. One connection each so every
    /// query sees the same memory database.
    pub fn in_memory() -> Self {
        Self {
            legacy_url: "sqlite::memory:".to_string(),
            modern_url: "sqlite::memory:".to_string(),
            max_connections: 1,
            manage_schema: true,
            ..Default::default()
        }
    }

    /// Map an envelope's `source.db` to a source system.
    pub fn source_system(&self, db: &str) -> Option<SourceSystem> {
        if db.is_empty() {
            None
        } else if db.eq_ignore_ascii_case(&self.legacy_db_name) {
            Some(SourceSystem::Legacy)
        } else if db.eq_ignore_ascii_case(&self.modern_db_name) {
            Some(SourceSystem::Modern)
        } else {
            None
        }
    }

    /// The `source.db` name used for a source system.
    pub fn db_name(&self, system: SourceSystem) -> &str {
        match system {
            SourceSystem::Legacy => &self.legacy_db_name,
            SourceSystem::Modern => &self.modern_db_name,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// BrokerConfig: Redis Streams transport
// ═══════════════════════════════════════════════════════════════════════════════

/// Redis Streams settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Stream key prefix for legacy tables (`{prefix}.{table}`).
    #[serde(default = "default_legacy_topic_prefix")]
    pub legacy_topic_prefix: String,

    /// Stream key prefix for modern tables (`{prefix}.{table}`).
    #[serde(default = "default_modern_topic_prefix")]
    pub modern_topic_prefix: String,

    /// Stream entry field holding the JSON envelope.
    #[serde(default = "default_value_field")]
    pub value_field: String,

    /// Maximum entries per XREAD call.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// XREAD block timeout as a duration string (e.g., "1s").
    #[serde(default = "default_block_timeout")]
    pub block_timeout: String,
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_legacy_topic_prefix() -> String {
    "cdc.legacy".to_string()
}

fn default_modern_topic_prefix() -> String {
    "cdc.modern".to_string()
}

fn default_value_field() -> String {
    "value".to_string()
}

fn default_batch_size() -> usize {
    100
}

fn default_block_timeout() -> String {
    "1s".to_string()
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            redis_url: default_redis_url(),
            legacy_topic_prefix: default_legacy_topic_prefix(),
            modern_topic_prefix: default_modern_topic_prefix(),
            value_field: default_value_field(),
            batch_size: default_batch_size(),
            block_timeout: default_block_timeout(),
        }
    }
}

impl BrokerConfig {
    pub fn block_timeout_duration(&self) -> Duration {
        parse_or(&self.block_timeout, Duration::from_secs(1))
    }

    pub fn topic_prefix(&self, system: SourceSystem) -> &str {
        match system {
            SourceSystem::Legacy => &self.legacy_topic_prefix,
            SourceSystem::Modern => &self.modern_topic_prefix,
        }
    }

    /// Stream key of one captured table.
    pub fn stream_key(&self, system: SourceSystem, entity: EntityType) -> String {
        format!("{}.{}", self.topic_prefix(system), entity.table(system))
    }

    /// All stream keys a source system publishes to.
    pub fn stream_keys(&self, system: SourceSystem) -> Vec<String> {
        EntityType::ALL
            .iter()
            .map(|entity| self.stream_key(system, *entity))
            .collect()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// DependencyWaitConfig: bounded look-ahead
// ═══════════════════════════════════════════════════════════════════════════════

/// Timing of the dependency look-ahead poll.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependencyWaitConfig {
    /// Timeout of each individual broker poll.
    #[serde(default = "default_poll_timeout")]
    pub poll_timeout: String,

    /// Pause after each consumed message so the parent's replay can land.
    #[serde(default = "default_grace_delay")]
    pub grace_delay: String,

    /// Upper bound on the wait for one unresolved dependency.
    #[serde(default = "default_max_wait")]
    pub max_wait: String,
}

fn default_poll_timeout() -> String {
    "200ms".to_string()
}

fn default_grace_delay() -> String {
    "50ms".to_string()
}

fn default_max_wait() -> String {
    "10s".to_string()
}

impl Default for DependencyWaitConfig {
    fn default() -> Self {
        Self {
            poll_timeout: default_poll_timeout(),
            grace_delay: default_grace_delay(),
            max_wait: default_max_wait(),
        }
    }
}

impl DependencyWaitConfig {
    pub fn for_testing() -> Self {
        Self {
            poll_timeout: "10ms".to_string(),
            grace_delay: "1ms".to_string(),
            max_wait: "100ms".to_string(),
        }
    }

    pub fn poll_timeout_duration(&self) -> Duration {
        parse_or(&self.poll_timeout, Duration::from_millis(200))
    }

    pub fn grace_delay_duration(&self) -> Duration {
        parse_or(&self.grace_delay, Duration::from_millis(50))
    }

    pub fn max_wait_duration(&self) -> Duration {
        parse_or(&self.max_wait, Duration::from_secs(10))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// RetrySettings
// ═══════════════════════════════════════════════════════════════════════════════

/// Backoff for replays and startup steps.
///
/// Delay before retry `n` (1-indexed) is `unit * base^n`, capped at `max_delay`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_backoff_base")]
    pub base: f64,

    #[serde(default = "default_backoff_unit")]
    pub unit: String,

    #[serde(default = "default_max_delay")]
    pub max_delay: String,
}

fn default_max_attempts() -> u32 {
    10
}

fn default_backoff_base() -> f64 {
    2.0
}

fn default_backoff_unit() -> String {
    "1s".to_string()
}

fn default_max_delay() -> String {
    "10m".to_string()
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base: default_backoff_base(),
            unit: default_backoff_unit(),
            max_delay: default_max_delay(),
        }
    }
}

impl RetrySettings {
    pub fn for_testing() -> Self {
        Self {
            max_attempts: 3,
            base: 2.0,
            unit: "1ms".to_string(),
            max_delay: "50ms".to_string(),
        }
    }

    pub fn to_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            base: self.base,
            unit: parse_or(&self.unit, Duration::from_secs(1)),
            max_delay: parse_or(&self.max_delay, Duration::from_secs(600)),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ConnectorsConfig: startup registration against a Connect REST endpoint
// ═══════════════════════════════════════════════════════════════════════════════

/// One connector configuration file to register at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorFile {
    /// Connector name (`/connectors/{name}`).
    pub name: String,
    /// JSON file holding the connector's config map.
    pub path: String,
}

/// Connector registration settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorsConfig {
    /// When false, startup skips registration and readiness polling.
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_connect_url")]
    pub connect_url: String,

    #[serde(default)]
    pub files: Vec<ConnectorFile>,

    /// Timeout for each HTTP request.
    #[serde(default = "default_request_timeout")]
    pub request_timeout: String,
}

fn default_connect_url() -> String {
    "http://127.0.0.1:8083".to_string()
}

fn default_request_timeout() -> String {
    "10s".to_string()
}

impl Default for ConnectorsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            connect_url: default_connect_url(),
            files: Vec::new(),
            request_timeout: default_request_timeout(),
        }
    }
}

impl ConnectorsConfig {
    pub fn request_timeout_duration(&self) -> Duration {
        parse_or(&self.request_timeout, Duration::from_secs(10))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// RunnerSettings
// ═══════════════════════════════════════════════════════════════════════════════

/// Consume loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerSettings {
    /// Maximum fresh messages pulled into one pass.
    #[serde(default = "default_pass_size")]
    pub pass_size: usize,

    /// How often dirty cursors are written to SQLite.
    #[serde(default = "default_flush_interval")]
    pub cursor_flush_interval: String,

    /// How long shutdown waits for consume loops to finish.
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout: String,
}

fn default_pass_size() -> usize {
    200
}

fn default_flush_interval() -> String {
    "5s".to_string()
}

fn default_drain_timeout() -> String {
    "10s".to_string()
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            pass_size: default_pass_size(),
            cursor_flush_interval: default_flush_interval(),
            drain_timeout: default_drain_timeout(),
        }
    }
}

impl RunnerSettings {
    pub fn cursor_flush_interval_duration(&self) -> Duration {
        parse_or(&self.cursor_flush_interval, Duration::from_secs(5))
    }

    pub fn drain_timeout_duration(&self) -> Duration {
        parse_or(&self.drain_timeout, Duration::from_secs(10))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// HealthConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// HTTP health surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

fn default_true() -> bool {
    true
}

fn default_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_addr: default_bind_addr(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// CursorConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Cursor persistence configuration.
///
/// Cursors track the last committed entry of each stream. They live in SQLite
/// so a restart resumes where the previous run stopped even if Redis does not
/// persist consumer state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CursorConfig {
    /// Path to SQLite database for cursor storage.
    pub sqlite_path: String,

    /// Whether to use WAL mode for SQLite (recommended).
    #[serde(default = "default_true")]
    pub wal_mode: bool,
}

impl Default for CursorConfig {
    fn default() -> Self {
        Self {
            sqlite_path: "replay_cursors.db".to_string(),
            wal_mode: true,
        }
    }
}

impl CursorConfig {
    /// Create an in-memory config for testing.
    pub fn in_memory() -> Self {
        Self {
            sqlite_path: ":memory:".to_string(),
            wal_mode: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = ReplayConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.priority_groups.len(), 3);
    }

    #[test]
    fn test_empty_json_uses_defaults() {
        let config: ReplayConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.databases.legacy_db_name, "legacy");
        assert_eq!(config.broker.value_field, "value");
        assert_eq!(config.retry.max_attempts, 10);
        assert_eq!(config.priority_groups, priority::default_priority_groups());
        assert!(config.health.enabled);
    }

    #[test]
    fn test_source_system_lookup() {
        let db = DatabasesConfig::default();
        assert_eq!(db.source_system("legacy"), Some(SourceSystem::Legacy));
        assert_eq!(db.source_system("MODERN"), Some(SourceSystem::Modern));
        assert_eq!(db.source_system("reporting"), None);
        assert_eq!(db.source_system(""), None);
        assert_eq!(db.db_name(SourceSystem::Modern), "modern");
    }

    #[test]
    fn test_stream_keys() {
        let broker = BrokerConfig::default();
        assert_eq!(
            broker.stream_key(SourceSystem::Legacy, EntityType::InvoiceLine),
            "cdc.legacy.invoice_line"
        );
        assert_eq!(
            broker.stream_key(SourceSystem::Modern, EntityType::Address),
            "cdc.modern.addresses"
        );
        assert_eq!(broker.stream_keys(SourceSystem::Modern).len(), 4);
    }

    #[test]
    fn test_duration_parsing_and_fallback() {
        let wait = DependencyWaitConfig {
            poll_timeout: "1s".to_string(),
            grace_delay: "nonsense".to_string(),
            max_wait: "2m".to_string(),
        };
        assert_eq!(wait.poll_timeout_duration(), Duration::from_secs(1));
        assert_eq!(wait.grace_delay_duration(), Duration::from_millis(50));
        assert_eq!(wait.max_wait_duration(), Duration::from_secs(120));
    }

    #[test]
    fn test_retry_settings_to_policy() {
        let policy = RetrySettings::default().to_policy();
        assert_eq!(policy.max_attempts, 10);
        assert_eq!(policy.unit, Duration::from_secs(1));
        assert_eq!(policy.max_delay, Duration::from_secs(600));
    }

    #[test]
    fn test_validate_rejects_same_db_names() {
        let mut config = ReplayConfig::for_testing();
        config.databases.modern_db_name = "legacy".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_attempts() {
        let mut config = ReplayConfig::for_testing();
        config.retry.max_attempts = 0;
        assert!(matches!(config.validate(), Err(SyncError::Config(_))));
    }

    #[test]
    fn test_for_testing_config() {
        let config = ReplayConfig::for_testing();
        assert_eq!(config.cursor.sqlite_path, ":memory:");
        assert_eq!(config.databases.max_connections, 1);
        assert!(config.databases.manage_schema);
        assert!(!config.health.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_json_roundtrip() {
        let mut config = ReplayConfig::for_testing();
        config.connectors.files.push(ConnectorFile {
            name: "legacy-source".to_string(),
            path: "connectors/legacy.json".to_string(),
        });
        let json = serde_json::to_string(&config).unwrap();
        let parsed: ReplayConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.connectors.files.len(), 1);
        assert_eq!(parsed.connectors.files[0].name, "legacy-source");
        assert_eq!(parsed.dependency_wait.max_wait, "100ms");
    }
    #[test]
    fn test_load_from_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("replay.toml");
        std::fs::write(
            &path,
            "[databases]\nlegacy_db_name = \"billing_legacy\"\n\n[dependency_wait]\nmax_wait = \"30s\"\n",
        )
        .unwrap();

        let config = ReplayConfig::load(Some(path.to_str().unwrap())).unwrap();
        assert_eq!(config.databases.legacy_db_name, "billing_legacy");
        assert_eq!(config.databases.modern_db_name, "modern");
        assert_eq!(config.dependency_wait.max_wait_duration(), Duration::from_secs(30));
    }

    #[test]
    fn test_load_rejects_invalid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("replay.toml");
        std::fs::write(&path, "[databases]\nmodern_db_name = \"legacy\"\n").unwrap();
        assert!(matches!(
            ReplayConfig::load(Some(path.to_str().unwrap())),
            Err(SyncError::Config(_))
        ));
    }
}
