//! # CDC Replay Engine
//!
//! Keeps a legacy schema (integer ids) and a modern schema (UUID ids) in step
//! during an online migration by replaying change-data-capture events from
//! each database into the other.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────────┐
//! │                            cdc-replay-engine                              │
//! │                                                                           │
//! │  ┌──────────────┐   ┌──────────────────┐   ┌───────────────────────────┐  │
//! │  │ EventSource  │──►│ Sorting +        │──►│ CommandFactory            │  │
//! │  │ (XREAD, per  │   │ dependency wait  │   │ (source, table, op)       │  │
//! │  │  system)     │   │ (look-ahead)     │   │        │                  │  │
//! │  └──────────────┘   └──────────────────┘   │        ▼                  │  │
//! │         │                                  │ SyncServices: translate   │  │
//! │         ▼                                  │ ids, write row + mapping  │  │
//! │  ┌─────────────┐                           │ + ledger in one tx        │  │
//! │  │ CursorStore │                           └───────────────────────────┘  │
//! │  │ (SQLite)    │                                                          │
//! │  └─────────────┘          health (axum): /ping /isinitialized ...         │
//! └───────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Guarantees
//!
//! 1. **Idempotence**: every event has a content-derived unique identifier;
//!    the target's ledger turns a redelivery into a no-op.
//! 2. **Parents first**: events are ordered by entity priority, and a child
//!    whose parent is neither stored nor in the batch waits (bounded) for it.
//! 3. **No echo loops**: a replayed change that comes back unchanged only
//!    touches the ledger.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use cdc_replay_engine::{NoOpStartupHooks, ReplayConfig, RunnerService, SyncState};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = ReplayConfig::default();
//!     let mut runner = RunnerService::new(config, Arc::new(SyncState::new()), Arc::new(NoOpStartupHooks));
//!     runner.start().await.expect("Failed to start");
//!
//!     // Runner replays until shutdown
//!     runner.shutdown().await;
//! }
//! ```

pub mod broker;
pub mod command;
pub mod config;
pub mod cursor;
pub mod error;
pub mod event;
pub mod health;
pub mod metrics;
pub mod model;
pub mod priority;
pub mod retry;
pub mod runner;
pub mod sorting;
pub mod state;
pub mod stream;
pub mod sync;

// Re-exports for convenience
pub use broker::{EventSource, InMemoryEventSource, InMemoryPublisher};
pub use command::{Command, CommandFactory, CommandKey};
pub use config::{BrokerConfig, DatabasesConfig, DependencyWaitConfig, ReplayConfig};
pub use cursor::CursorStore;
pub use error::{Result, SyncError};
pub use event::{EntityType, EventMessage, Operation, SourceSystem, StreamPosition};
pub use health::{build_router, HealthState};
pub use retry::{RetryHelper, RetryPolicy};
pub use runner::{ConnectRestHooks, NoOpStartupHooks, RunnerService, RunnerState, StartupHooks};
pub use sorting::EventsSortingService;
pub use state::SyncState;
pub use stream::RedisEventSource;
pub use sync::{Databases, ReplayOutcome, SyncServices};
