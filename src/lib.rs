//! # `agentqueue`: a durable, priority-aware, concurrency-bounded run scheduler
//!
//! `agentqueue` is the queue-and-scheduling core of an agent-execution
//! platform: it admits run requests, enforces global and per-agent
//! concurrency caps, dispatches them in priority + FIFO order, streams
//! output chunks back to subscribers, persists state across restarts (with
//! crash recovery for interrupted runs), and supports cancellation, retry,
//! and event notification.
//!
//! ## Core Concepts
//!
//! - **Run**: identity plus mutable lifecycle state for a single scheduled job ([`run`]).
//! - **Priority Queue**: the priority + FIFO waiting set a dispatch pass consults ([`queue`]).
//! - **Concurrency Gate**: admission control — a global cap, a per-agent cap, a cancel set ([`gate`]).
//! - **Store**: durable record of runs/sessions and the crash-recovery source of truth ([`store`]).
//! - **Executor**: the narrow contract used to actually run a job ([`executor`]).
//! - **Stream Bus**: per-run ordered chunk delivery plus scheduler-wide lifecycle events ([`stream_bus`]).
//! - **Scheduler**: the state machine wiring all of the above together ([`scheduler`]).
//! - **Queue Manager**: the public facade embedders use ([`manager`]).
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use agentqueue::config::QueueConfig;
//! use agentqueue::dedup::SessionDedupCache;
//! use agentqueue::executor::{EchoBehavior, EchoExecutor};
//! use agentqueue::manager::QueueManager;
//! use agentqueue::run::Priority;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let executor = Arc::new(EchoExecutor::new(EchoBehavior::Echo));
//! let dedup = Arc::new(SessionDedupCache::default());
//! let manager = QueueManager::new(QueueConfig::default(), executor, dedup).await?;
//! manager.start(true).await?;
//!
//! let run_id = manager
//!     .submit("hello world", "demo-agent", Priority::Normal, None, None, 3)
//!     .await?;
//! println!("submitted {run_id}");
//! manager.stop();
//! # Ok(())
//! # }
//! ```
//!
//! ## Module Guide
//!
//! - [`run`] - `Run`, `Priority`, `RunState`: the core domain types.
//! - [`config`] - `QueueConfig`: the process-level configuration surface.
//! - [`queue`] - `PriorityQueue`: the priority + FIFO waiting set.
//! - [`gate`] - `ConcurrencyGate`: global/per-agent admission control.
//! - [`store`] - `Store` trait plus `memory`/`sqlite` backends; crash-recovery source of truth.
//! - [`executor`] - `Executor` trait plus the `EchoExecutor` test double.
//! - [`stream_bus`] - Per-run chunk streaming and scheduler-wide lifecycle events.
//! - [`dedup`] - `SessionDedupCache`: a bounded, strict-LRU content-hash set.
//! - [`scheduler`] - `Scheduler`: the queued→running→terminal state machine.
//! - [`manager`] - `QueueManager`: the public facade.

pub mod config;
pub mod dedup;
pub mod executor;
pub mod gate;
pub mod manager;
pub mod queue;
pub mod run;
pub mod scheduler;
pub mod store;
pub mod stream_bus;
