// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! `cdc-replayd`: runs the replay engine until Ctrl-C or a fatal loop error.
//!
//! Usage: `cdc-replayd [config-file]` (or `CDC_REPLAY_CONFIG=path`).
//! Every setting can be overridden with `CDC_REPLAY__SECTION__KEY` variables.
//! `LOG_FORMAT=json` switches to JSON logs; `RUST_LOG` sets the filter.

use anyhow::Context;
use cdc_replay_engine::health;
use cdc_replay_engine::{ConnectRestHooks, ReplayConfig, RunnerService, RunnerState, SyncState};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("LOG_FORMAT").map(|v| v.eq_ignore_ascii_case("json")).unwrap_or(false);

    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry.with(fmt::layer().json().with_target(true)).init();
    } else {
        registry.with(fmt::layer().with_target(true).with_level(true)).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let path = std::env::args().nth(1).or_else(|| std::env::var("CDC_REPLAY_CONFIG").ok());
    let config = ReplayConfig::load(path.as_deref()).context("loading configuration")?;
    info!(config_file = path.as_deref().unwrap_or("<none>"), "Configuration loaded");

    let sync_state = Arc::new(SyncState::new());
    let hooks = Arc::new(ConnectRestHooks::new(config.connectors.clone(), &config.broker)?);
    let mut runner = RunnerService::new(config.clone(), sync_state, hooks);

    let (health_shutdown_tx, health_shutdown_rx) = watch::channel(false);
    let health_task = if config.health.enabled {
        let router = health::build_router(runner.health_state());
        let bind_addr = config.health.bind_addr.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = health::serve(&bind_addr, router, health_shutdown_rx).await {
                error!(error = %e, "Health endpoint stopped");
            }
        }))
    } else {
        None
    };

    let mut state_rx = runner.state_receiver();
    let outcome = tokio::select! {
        started = runner.start() => started,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted during startup");
            Ok(())
        }
    };

    if let Err(e) = &outcome {
        error!(error = %e, "Startup failed");
    } else if runner.is_running() {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Received Ctrl-C"),
            _ = state_rx.wait_for(|state| *state == RunnerState::Failed) => {
                warn!("A consume loop failed, stopping");
            }
        }
    }

    runner.shutdown().await;
    let _ = health_shutdown_tx.send(true);
    if let Some(task) = health_task {
        let _ = task.await;
    }

    match runner.state() {
        RunnerState::Failed => anyhow::bail!("replay runner failed"),
        _ => outcome.map_err(Into::into),
    }
}
