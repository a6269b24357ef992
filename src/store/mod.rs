//! Durable, queryable record of [`crate::run::Run`]s and sessions; the source of
//! truth for boot-time crash recovery.
//!
//! Two backends implement [`Store`]: [`memory::InMemoryStore`] (tests,
//! `enable_persistence=false`) and, behind the `sqlite` cargo feature,
//! [`sqlite::SqliteStore`].

pub mod memory;
#[cfg(feature = "sqlite")]
pub mod sqlite;

use async_trait::async_trait;
use miette::Diagnostic;
use thiserror::Error;

use crate::run::{Run, RunState};

/// Errors a [`Store`] backend may return. Every variant maps conceptually onto
/// the single `StoreUnavailable` condition the spec names; the backend keeps
/// a finer-grained enum internally for diagnostics.
#[derive(Debug, Error, Diagnostic)]
pub enum StoreError {
    #[error("store unavailable: {message}")]
    #[diagnostic(
        code(agentqueue::store::unavailable),
        help("Check the backing store's connectivity (disk, connection pool) and retry.")
    )]
    Unavailable { message: String },

    #[error("serialization error: {message}")]
    #[diagnostic(code(agentqueue::store::serde))]
    Serde { message: String },
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Composable AND filters for [`Store::list_runs`].
#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    pub state: Option<RunState>,
    pub session_id: Option<String>,
    pub limit: u32,
    pub offset: u32,
}

impl RunFilter {
    #[must_use]
    pub fn new(limit: u32, offset: u32) -> Self {
        Self {
            state: None,
            session_id: None,
            limit,
            offset,
        }
    }

    #[must_use]
    pub fn with_state(mut self, state: RunState) -> Self {
        self.state = Some(state);
        self
    }

    #[must_use]
    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    fn matches(&self, run: &Run) -> bool {
        if let Some(state) = self.state {
            if run.state != state {
                return false;
            }
        }
        if let Some(session_id) = &self.session_id {
            if run.session_id.as_deref() != Some(session_id.as_str()) {
                return false;
            }
        }
        true
    }
}

/// Snapshot counters over the run ledger.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStatistics {
    pub queued_count: u64,
    pub running_count: u64,
    pub paused_count: u64,
    pub succeeded_count: u64,
    pub failed_count: u64,
    pub cancelled_count: u64,
    pub total_runs: u64,
}

impl QueueStatistics {
    #[must_use]
    pub fn active_count(&self) -> u64 {
        self.queued_count + self.running_count + self.paused_count
    }

    fn record(&mut self, state: RunState) {
        match state {
            RunState::Queued => self.queued_count += 1,
            RunState::Running => self.running_count += 1,
            RunState::Paused => self.paused_count += 1,
            RunState::Succeeded => self.succeeded_count += 1,
            RunState::Failed => self.failed_count += 1,
            RunState::Cancelled => self.cancelled_count += 1,
        }
        self.total_runs += 1;
    }

    #[must_use]
    pub fn from_runs<'a>(runs: impl Iterator<Item = &'a Run>) -> Self {
        let mut stats = Self::default();
        for run in runs {
            stats.record(run.state);
        }
        stats
    }
}

/// Opaque session record: lifecycle independent of any particular run.
#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub session_id: String,
    pub user_id: Option<String>,
    pub state_json: Option<String>,
    pub config_json: Option<String>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

/// Durable record of runs and sessions; the crash-recovery source of truth.
///
/// Implementations must serialize concurrent writes to the same `run_id`; they
/// are otherwise free to use whatever internal locking or connection pooling
/// fits the backend.
#[async_trait]
pub trait Store: Send + Sync {
    /// Idempotent; creates any missing schema elements. Safe to call on every start.
    async fn initialize(&self) -> Result<()>;

    /// Upsert by `run_id`; overwrites all mutable fields.
    async fn save_run(&self, run: &Run) -> Result<()>;

    async fn load_run(&self, run_id: &str) -> Result<Option<Run>>;

    /// Ordered by `created_at` descending; filters compose with AND.
    async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<Run>>;

    /// Returns `true` iff a row existed.
    async fn delete_run(&self, run_id: &str) -> Result<bool>;

    /// In-place state change; sets `ended_at` iff `new_state` is terminal.
    /// Returns `true` iff a row existed.
    async fn update_run_state(
        &self,
        run_id: &str,
        new_state: RunState,
        error: Option<String>,
    ) -> Result<bool>;

    /// All runs in an active state (`Queued`, `Running`, `Paused`); used for recovery.
    async fn load_pending_runs(&self) -> Result<Vec<Run>>;

    /// Atomically moves every `Running` row to `Failed` with
    /// `error = "Interrupted"` and `ended_at = now`. Returns the number affected.
    /// Called exactly once, at startup.
    async fn mark_interrupted_as_failed(&self) -> Result<u64>;

    async fn get_stats(&self) -> Result<QueueStatistics>;

    async fn save_session(
        &self,
        session_id: &str,
        user_id: Option<String>,
        state_json: Option<String>,
        config_json: Option<String>,
    ) -> Result<()>;

    async fn load_session(&self, session_id: &str) -> Result<Option<SessionRecord>>;

    async fn list_sessions(&self) -> Result<Vec<SessionRecord>>;

    /// Deletes runs in a terminal state with `created_at < now - days`. Returns the count deleted.
    async fn cleanup_old_runs(&self, days: u32) -> Result<u64>;
}
