// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Runner service: startup sequence, consume loops and graceful shutdown.
//!
//! The [`RunnerService`] is the top-level orchestrator that:
//! 1. Runs the startup steps (topics, connectors, readiness, backfill,
//!    triggers), each under the retry helper
//! 2. Connects both databases and opens the cursor store
//! 3. Spawns one [`ConsumeLoop`] per source system plus a cursor flush task
//! 4. Drains the loops and flushes cursors on shutdown
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                       RunnerService                          │
//! │                                                              │
//! │  ┌───────────────────┐        ┌───────────────────┐          │
//! │  │ ConsumeLoop       │        │ ConsumeLoop       │          │
//! │  │ legacy streams    │        │ modern streams    │          │
//! │  │  → modern DB      │        │  → legacy DB      │          │
//! │  └─────────┬─────────┘        └─────────┬─────────┘          │
//! │            │  EventsSortingService (shared cache)            │
//! │            └──────────────┬─────────────┘                    │
//! │                    CommandFactory → SyncServices             │
//! │                           │                                  │
//! │                    CursorStore (SQLite, flushed periodically)│
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Both loops share one dependency cache, one command table and one
//! [`SyncState`]. A loop that fails for good moves the runner to
//! [`RunnerState::Failed`]; the embedder decides whether to exit.

pub mod bootstrap;
pub mod consume;
pub mod types;

pub use bootstrap::{ConnectRestHooks, NoOpStartupHooks, StartupHooks};
pub use consume::ConsumeLoop;
pub use types::{PassSummary, RunnerState};

use crate::broker::EventSource;
use crate::command::CommandFactory;
use crate::config::ReplayConfig;
use crate::cursor::CursorStore;
use crate::error::{BoxFuture, Result, SyncError};
use crate::event::SourceSystem;
use crate::health::HealthState;
use crate::metrics;
use crate::retry::RetryHelper;
use crate::sorting::{DependencyChecker, EventsSortingService, MappingDependencyChecker};
use crate::state::SyncState;
use crate::stream::RedisEventSource;
use crate::sync::{Databases, SyncServices};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Startup steps in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartupStep {
    CreateTopics,
    RegisterConnectors,
    WaitUntilReady,
    RunBackfill,
    CreateTriggers,
}

impl StartupStep {
    pub const ALL: [StartupStep; 5] = [
        StartupStep::CreateTopics,
        StartupStep::RegisterConnectors,
        StartupStep::WaitUntilReady,
        StartupStep::RunBackfill,
        StartupStep::CreateTriggers,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StartupStep::CreateTopics => "create_topics",
            StartupStep::RegisterConnectors => "register_connectors",
            StartupStep::WaitUntilReady => "wait_until_ready",
            StartupStep::RunBackfill => "run_backfill",
            StartupStep::CreateTriggers => "create_triggers",
        }
    }

    fn call<'a>(&self, hooks: &'a dyn StartupHooks) -> BoxFuture<'a, ()> {
        match self {
            StartupStep::CreateTopics => hooks.create_topics(),
            StartupStep::RegisterConnectors => hooks.register_connectors(),
            StartupStep::WaitUntilReady => hooks.wait_until_ready(),
            StartupStep::RunBackfill => hooks.run_backfill(),
            StartupStep::CreateTriggers => hooks.create_triggers(),
        }
    }
}

/// Owns the consume loops and their shared components.
pub struct RunnerService {
    config: ReplayConfig,

    /// Flags shared with the health surface and the retry helper
    sync_state: Arc<SyncState>,

    hooks: Arc<dyn StartupHooks>,

    /// Runner state (broadcast to watchers); shared with the loop tasks
    state_tx: Arc<watch::Sender<RunnerState>>,
    state_rx: watch::Receiver<RunnerState>,

    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,

    databases: Option<Arc<Databases>>,
    cursors: Option<Arc<CursorStore>>,

    /// Consume loops first, flush task last
    handles: Vec<JoinHandle<()>>,
}

impl RunnerService {
    /// Create a runner in `Created` state. Call [`start()`](Self::start) to run.
    pub fn new(config: ReplayConfig, sync_state: Arc<SyncState>, hooks: Arc<dyn StartupHooks>) -> Self {
        let (state_tx, state_rx) = watch::channel(RunnerState::Created);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            config,
            sync_state,
            hooks,
            state_tx: Arc::new(state_tx),
            state_rx,
            shutdown_tx,
            shutdown_rx,
            databases: None,
            cursors: None,
            handles: Vec::new(),
        }
    }

    pub fn state(&self) -> RunnerState {
        *self.state_rx.borrow()
    }

    pub fn state_receiver(&self) -> watch::Receiver<RunnerState> {
        self.state_rx.clone()
    }

    pub fn is_running(&self) -> bool {
        self.state() == RunnerState::Running
    }

    pub fn sync_state(&self) -> &Arc<SyncState> {
        &self.sync_state
    }

    /// State handed to the health router.
    pub fn health_state(&self) -> HealthState {
        HealthState::new(self.sync_state.clone(), self.state_rx.clone())
    }

    /// Database pools, once started.
    pub fn databases(&self) -> Option<&Arc<Databases>> {
        self.databases.as_ref()
    }

    /// Cursor store, once started.
    pub fn cursors(&self) -> Option<&Arc<CursorStore>> {
        self.cursors.as_ref()
    }

    /// Run the startup sequence and tail the Redis streams of both systems.
    pub async fn start(&mut self) -> Result<()> {
        self.start_with(None).await
    }

    /// Like [`start()`](Self::start), consuming the given sources instead of Redis.
    pub async fn start_with_sources(&mut self, sources: Vec<Box<dyn EventSource>>) -> Result<()> {
        self.start_with(Some(sources)).await
    }

    async fn start_with(&mut self, sources: Option<Vec<Box<dyn EventSource>>>) -> Result<()> {
        if self.state() != RunnerState::Created {
            return Err(SyncError::InvalidState {
                expected: "Created".to_string(),
                actual: self.state().to_string(),
            });
        }

        info!(
            legacy_db = %self.config.databases.legacy_db_name,
            modern_db = %self.config.databases.modern_db_name,
            "Starting replay runner"
        );
        self.set_state(RunnerState::Starting);

        match self.bring_up(sources).await {
            Ok(()) => {
                self.sync_state.set_initialized(true);
                let promoted = self.state_tx.send_if_modified(|state| {
                    if *state == RunnerState::Starting {
                        *state = RunnerState::Running;
                        true
                    } else {
                        false
                    }
                });
                if promoted {
                    metrics::set_engine_state("Running");
                    info!(loops = self.handles.len().saturating_sub(1), "Replay runner running");
                }
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "Replay runner failed to start");
                self.set_state(RunnerState::Failed);
                Err(e)
            }
        }
    }

    async fn bring_up(&mut self, sources: Option<Vec<Box<dyn EventSource>>>) -> Result<()> {
        let retry = RetryHelper::new(self.config.retry.to_policy(), self.sync_state.clone())
            .with_cancel(self.shutdown_rx.clone());

        let hooks = self.hooks.as_ref();
        for step in StartupStep::ALL {
            let started = Instant::now();
            retry.run(step.as_str(), || step.call(hooks)).await?;
            metrics::record_startup_step(step.as_str(), started.elapsed());
            debug!(step = step.as_str(), "Startup step complete");
        }

        let databases_config = &self.config.databases;
        let databases = Arc::new(
            retry
                .run("connect_databases", || Databases::connect(databases_config))
                .await?,
        );
        self.databases = Some(databases.clone());

        let cursors = Arc::new(CursorStore::open(&self.config.cursor).await?);
        info!(path = %cursors.path(), "Cursor store initialized");
        self.cursors = Some(cursors.clone());

        let sources = match sources {
            Some(sources) => sources,
            None => self.connect_broker(&retry, &cursors).await?,
        };

        let services = Arc::new(SyncServices::new(databases.clone()));
        let commands = Arc::new(CommandFactory::new(services, self.config.databases.clone()));
        let checker: Arc<dyn DependencyChecker> = Arc::new(MappingDependencyChecker::new(databases.mappings()));
        let sorter = Arc::new(EventsSortingService::new(
            self.config.priority_groups.clone(),
            checker,
            self.config.databases.clone(),
            &self.config.dependency_wait,
        ));

        for source in sources {
            let consume = ConsumeLoop::new(
                source,
                sorter.clone(),
                commands.clone(),
                retry.clone(),
                self.sync_state.clone(),
                Some(cursors.clone()),
                self.config.runner.pass_size,
                self.config.broker.block_timeout_duration(),
            );
            self.spawn_consume_loop(consume);
        }

        self.spawn_cursor_flush_task(cursors);
        Ok(())
    }

    async fn connect_broker(&self, retry: &RetryHelper, cursors: &CursorStore) -> Result<Vec<Box<dyn EventSource>>> {
        let broker = &self.config.broker;
        let mut sources: Vec<Box<dyn EventSource>> = Vec::new();
        for system in [SourceSystem::Legacy, SourceSystem::Modern] {
            let streams = broker.stream_keys(system);
            let source = retry
                .run("connect_broker", || {
                    RedisEventSource::connect(system.as_str(), streams.clone(), broker, Some(cursors))
                })
                .await?;
            info!(source = %system, streams = streams.len(), "Tailing streams");
            sources.push(Box::new(source));
        }
        Ok(sources)
    }

    fn spawn_consume_loop(&mut self, consume: ConsumeLoop) {
        let name = consume.source_name().to_string();
        let shutdown_rx = self.shutdown_rx.clone();
        let state_tx = Arc::clone(&self.state_tx);

        let handle = tokio::spawn(async move {
            if let Err(e) = consume.run(shutdown_rx).await {
                error!(source = %name, error = %e, "Consume loop stopped on error");
                let _ = state_tx.send(RunnerState::Failed);
                metrics::set_engine_state("Failed");
            }
        });

        debug!("Spawned consume loop");
        self.handles.push(handle);
    }

    /// Periodically flushes dirty cursors and refreshes the flag gauges.
    fn spawn_cursor_flush_task(&mut self, cursors: Arc<CursorStore>) {
        let mut shutdown_rx = self.shutdown_rx.clone();
        let sync_state = self.sync_state.clone();
        let flush_interval = self.config.runner.cursor_flush_interval_duration();

        let handle = tokio::spawn(async move {
            let mut timer = tokio::time::interval(flush_interval);

            loop {
                tokio::select! {
                    _ = timer.tick() => {
                        if let Err(e) = cursors.flush_dirty().await {
                            warn!(error = %e, "Failed to flush cursors");
                        }
                        let flags = sync_state.snapshot();
                        metrics::set_flags(flags.is_initialized, flags.snapshot_last_received, flags.is_retrying);
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            debug!("Cursor flush task stopping");
                            break;
                        }
                    }
                }
            }
        });

        debug!("Spawned cursor flush task");
        self.handles.push(handle);
    }

    /// Shutdown gracefully.
    ///
    /// 1. Signal every task to stop
    /// 2. Wait for the loops to commit their cursors (bounded by `drain_timeout`)
    /// 3. Flush and close the cursor store, then close the pools
    ///
    /// A runner that failed stays `Failed`; otherwise it ends `Stopped`.
    pub async fn shutdown(&mut self) {
        let failed = self.state() == RunnerState::Failed;
        info!("Shutting down replay runner");
        self.set_state(RunnerState::ShuttingDown);

        let _ = self.shutdown_tx.send(true);

        let handles = std::mem::take(&mut self.handles);
        let task_count = handles.len();
        if task_count > 0 {
            info!(task_count, "Waiting for tasks to drain and complete");
        }

        let drain_timeout = self.config.runner.drain_timeout_duration();
        for (i, mut handle) in handles.into_iter().enumerate() {
            match tokio::time::timeout(drain_timeout, &mut handle).await {
                Ok(Ok(())) => {
                    debug!(task = i + 1, "Task completed gracefully");
                }
                Ok(Err(e)) => {
                    warn!(task = i + 1, error = %e, "Task panicked during shutdown");
                }
                Err(_) => {
                    warn!(task = i + 1, "Task timed out during shutdown, aborting");
                    handle.abort();
                }
            }
        }

        if let Some(cursors) = self.cursors.take() {
            cursors.close().await;
        }
        if let Some(databases) = self.databases.take() {
            databases.close().await;
        }
        self.sync_state.set_initialized(false);

        let final_state = if failed { RunnerState::Failed } else { RunnerState::Stopped };
        self.set_state(final_state);
        info!(state = %final_state, "Replay runner stopped");
    }

    fn set_state(&self, state: RunnerState) {
        let _ = self.state_tx.send(state);
        metrics::set_engine_state(&state.to_string());
    }
}
