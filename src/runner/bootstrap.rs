// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Startup steps run once before the consume loops start.
//!
//! Order: topics → connectors → readiness → backfill → triggers. The runner
//! wraps each step in the retry helper, so a step only has to report "not
//! yet" as an error to be polled again.
//!
//! [`ConnectRestHooks`] talks to a Kafka-Connect-compatible REST endpoint
//! (Debezium Server, Kafka Connect) to register connector configurations and
//! wait until they run. Backfill and trigger creation belong to the migration
//! tooling; these hooks only log them.

use crate::config::{BrokerConfig, ConnectorFile, ConnectorsConfig};
use crate::error::{BoxFuture, Result, SyncError};
use reqwest::Client;
use serde_json::Value;
use tracing::{debug, info};

/// One hook per startup step.
pub trait StartupHooks: Send + Sync {
    fn create_topics(&self) -> BoxFuture<'_, ()>;
    fn register_connectors(&self) -> BoxFuture<'_, ()>;
    fn wait_until_ready(&self) -> BoxFuture<'_, ()>;
    fn run_backfill(&self) -> BoxFuture<'_, ()>;
    fn create_triggers(&self) -> BoxFuture<'_, ()>;
}

/// Hooks that do nothing (embedding, tests).
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpStartupHooks;

impl StartupHooks for NoOpStartupHooks {
    fn create_topics(&self) -> BoxFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }

    fn register_connectors(&self) -> BoxFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }

    fn wait_until_ready(&self) -> BoxFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }

    fn run_backfill(&self) -> BoxFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }

    fn create_triggers(&self) -> BoxFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }
}

/// Registers connectors over REST and checks the broker is reachable.
pub struct ConnectRestHooks {
    client: Client,
    connectors: ConnectorsConfig,
    redis_url: String,
}

impl ConnectRestHooks {
    pub fn new(connectors: ConnectorsConfig, broker: &BrokerConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(connectors.request_timeout_duration())
            .build()?;
        Ok(Self {
            client,
            connectors,
            redis_url: broker.redis_url.clone(),
        })
    }

    fn connector_url(&self, name: &str, suffix: &str) -> String {
        format!(
            "{}/connectors/{}/{}",
            self.connectors.connect_url.trim_end_matches('/'),
            name,
            suffix
        )
    }

    async fn ping_broker(&self) -> Result<()> {
        let client = redis::Client::open(self.redis_url.as_str()).map_err(|e| SyncError::broker("open", e))?;
        let mut conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| SyncError::broker("connect", e))?;
        let pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| SyncError::broker("PING", e))?;
        debug!(reply = %pong, "Broker reachable");
        Ok(())
    }

    async fn register(&self, file: &ConnectorFile) -> Result<()> {
        let raw = tokio::fs::read_to_string(&file.path)
            .await
            .map_err(|e| SyncError::Config(format!("connector file {}: {}", file.path, e)))?;
        let body: Value = serde_json::from_str(&raw)
            .map_err(|e| SyncError::Config(format!("connector file {} is not JSON: {}", file.path, e)))?;

        let response = self
            .client
            .put(self.connector_url(&file.name, "config"))
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(SyncError::Http {
                operation: format!("register {}", file.name),
                message: format!("{}: {}", status, text),
            });
        }
        info!(connector = %file.name, status = %status, "Connector registered");
        Ok(())
    }

    async fn check_running(&self, name: &str) -> Result<()> {
        let response = self.client.get(self.connector_url(name, "status")).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(SyncError::Startup {
                step: "wait_until_ready".to_string(),
                message: format!("connector {} status returned {}", name, status),
            });
        }
        let body: Value = response.json().await?;
        if connector_running(&body) {
            debug!(connector = %name, "Connector running");
            Ok(())
        } else {
            Err(SyncError::Startup {
                step: "wait_until_ready".to_string(),
                message: format!("connector {} not running yet", name),
            })
        }
    }
}

/// Whether a Connect status document reports the connector and all its tasks RUNNING.
pub fn connector_running(status: &Value) -> bool {
    let running = |v: Option<&Value>| v.and_then(Value::as_str) == Some("RUNNING");
    let connector_ok = running(status.pointer("/connector/state"));
    let tasks_ok = status
        .get("tasks")
        .and_then(Value::as_array)
        .map(|tasks| tasks.iter().all(|t| running(t.get("state"))))
        .unwrap_or(true);
    connector_ok && tasks_ok
}

impl StartupHooks for ConnectRestHooks {
    fn create_topics(&self) -> BoxFuture<'_, ()> {
        // Streams come into being with their first XADD; only reachability matters.
        Box::pin(self.ping_broker())
    }

    fn register_connectors(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if !self.connectors.enabled {
                debug!("Connector registration disabled");
                return Ok(());
            }
            for file in &self.connectors.files {
                self.register(file).await?;
            }
            Ok(())
        })
    }

    fn wait_until_ready(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if !self.connectors.enabled {
                return Ok(());
            }
            for file in &self.connectors.files {
                self.check_running(&file.name).await?;
            }
            Ok(())
        })
    }

    fn run_backfill(&self) -> BoxFuture<'_, ()> {
        Box::pin(async {
            info!("Initial backfill is run by the migration tooling, skipping");
            Ok(())
        })
    }

    fn create_triggers(&self) -> BoxFuture<'_, ()> {
        Box::pin(async {
            info!("Trigger creation is run by the migration tooling, skipping");
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_connector_running() {
        let running = json!({
            "name": "legacy",
            "connector": {"state": "RUNNING", "worker_id": "w1"},
            "tasks": [{"id": 0, "state": "RUNNING"}]
        });
        assert!(connector_running(&running));

        let task_failed = json!({
            "connector": {"state": "RUNNING"},
            "tasks": [{"id": 0, "state": "RUNNING"}, {"id": 1, "state": "FAILED"}]
        });
        assert!(!connector_running(&task_failed));

        let paused = json!({"connector": {"state": "PAUSED"}, "tasks": []});
        assert!(!connector_running(&paused));
        assert!(!connector_running(&json!({})));
    }

    #[tokio::test]
    async fn test_noop_hooks() {
        let hooks = NoOpStartupHooks;
        hooks.create_topics().await.unwrap();
        hooks.register_connectors().await.unwrap();
        hooks.wait_until_ready().await.unwrap();
        hooks.run_backfill().await.unwrap();
        hooks.create_triggers().await.unwrap();
    }

    #[tokio::test]
    async fn test_disabled_connectors_skip_http() {
        let hooks = ConnectRestHooks::new(ConnectorsConfig::default(), &BrokerConfig::default()).unwrap();
        hooks.register_connectors().await.unwrap();
        hooks.wait_until_ready().await.unwrap();
        assert_eq!(
            hooks.connector_url("legacy-source", "status"),
            "http://127.0.0.1:8083/connectors/legacy-source/status"
        );
    }

    #[tokio::test]
    async fn test_missing_connector_file_is_config_error() {
        let connectors = ConnectorsConfig {
            enabled: true,
            files: vec![ConnectorFile {
                name: "legacy".to_string(),
                path: "/nonexistent/legacy.json".to_string(),
            }],
            ..Default::default()
        };
        let hooks = ConnectRestHooks::new(connectors, &BrokerConfig::default()).unwrap();
        let err = hooks.register_connectors().await.unwrap_err();
        assert!(matches!(err, SyncError::Config(_)));
    }
}
