//! Core domain types for a single scheduled job: [`Run`], [`Priority`], [`RunState`].
//!
//! These are the fundamental concepts the rest of the crate operates on — the
//! [`crate::queue`] orders them, the [`crate::gate`] admits them, the
//! [`crate::scheduler`] mutates them, the [`crate::store`] persists them.
//!
//! # Examples
//!
//! ```rust
//! use agentqueue::run::{Priority, Run, RunState};
//!
//! let run = Run::new("demo-agent", "hello world", Priority::High, None, 3);
//! assert_eq!(run.state, RunState::Queued);
//! assert!(run.state.is_active());
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Relative importance of a [`Run`] for dispatch ordering.
///
/// Ordering is `Urgent > High > Normal > Low`; ties within a priority are
/// broken by `created_at` (FIFO), then by `run_id` (see [`crate::queue`]).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Priority {
    Low = 0,
    #[default]
    Normal = 1,
    High = 2,
    Urgent = 3,
}

impl Priority {
    /// Encode as the small integer persisted in the `priority` column.
    #[must_use]
    pub fn encode(self) -> i64 {
        self as i64
    }

    /// Decode from a persisted integer, falling back to `Normal` for anything
    /// out of range rather than failing a load.
    #[must_use]
    pub fn decode(value: i64) -> Self {
        match value {
            0 => Priority::Low,
            2 => Priority::High,
            3 => Priority::Urgent,
            _ => Priority::Normal,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Urgent => "urgent",
        };
        write!(f, "{s}")
    }
}

/// Lifecycle state of a [`Run`].
///
/// `Paused` exists for future use; in this crate the recovery path treats it
/// as equivalent to `Queued` (re-dispatchable) and no caller-facing entry
/// point ever sets it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunState {
    Queued,
    Running,
    Paused,
    Succeeded,
    Failed,
    Cancelled,
}

impl RunState {
    /// `true` for `Succeeded`, `Failed`, `Cancelled` — states a `Run` cannot leave.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Succeeded | RunState::Failed | RunState::Cancelled)
    }

    /// `true` for `Queued`, `Running`, `Paused`.
    #[must_use]
    pub fn is_active(self) -> bool {
        !self.is_terminal()
    }

    /// Encode to the lowercase string persisted in the `state` column.
    #[must_use]
    pub fn encode(self) -> &'static str {
        match self {
            RunState::Queued => "queued",
            RunState::Running => "running",
            RunState::Paused => "paused",
            RunState::Succeeded => "succeeded",
            RunState::Failed => "failed",
            RunState::Cancelled => "cancelled",
        }
    }

    /// Decode a persisted state string. Unknown values are rejected by the
    /// caller (the store surfaces a backend error) rather than silently
    /// substituted, unlike [`Priority::decode`] — an unrecognized run state
    /// is a data-integrity problem, not a forward-compatibility one.
    #[must_use]
    pub fn decode(s: &str) -> Option<Self> {
        Some(match s {
            "queued" => RunState::Queued,
            "running" => RunState::Running,
            "paused" => RunState::Paused,
            "succeeded" => RunState::Succeeded,
            "failed" => RunState::Failed,
            "cancelled" => RunState::Cancelled,
            _ => return None,
        })
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.encode())
    }
}

/// A single scheduled job: identity, inputs, lifecycle state, and timestamps.
///
/// Only the [`crate::scheduler::Scheduler`] mutates `state`, `started_at`,
/// `ended_at`, `output_content`, and `error`; every other component holds a
/// read-only view or goes through a `Scheduler` entry point.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Run {
    pub run_id: String,
    pub agent_name: String,
    pub session_id: Option<String>,
    pub parent_run_id: Option<String>,
    pub input_content: String,
    pub output_content: Option<String>,
    pub state: RunState,
    pub priority: Priority,
    pub retry_count: u32,
    pub max_retries: u32,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl Run {
    /// Build a fresh, `Queued` run with a generated [`uuid::Uuid`] id.
    ///
    /// Use [`Run::with_id`] when the caller supplies its own `run_id`.
    #[must_use]
    pub fn new(
        agent_name: impl Into<String>,
        input_content: impl Into<String>,
        priority: Priority,
        session_id: Option<String>,
        max_retries: u32,
    ) -> Self {
        Self::with_id(
            uuid::Uuid::new_v4().to_string(),
            agent_name,
            input_content,
            priority,
            session_id,
            max_retries,
        )
    }

    /// Build a fresh, `Queued` run with a caller-supplied `run_id`.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn with_id(
        run_id: impl Into<String>,
        agent_name: impl Into<String>,
        input_content: impl Into<String>,
        priority: Priority,
        session_id: Option<String>,
        max_retries: u32,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            agent_name: agent_name.into(),
            session_id,
            parent_run_id: None,
            input_content: input_content.into(),
            output_content: None,
            state: RunState::Queued,
            priority,
            retry_count: 0,
            max_retries,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
        }
    }

    /// Build a retry child of `self`: a new `Queued` run carrying the same
    /// inputs, `agent_name`, `priority`, `max_retries`, and — per the Open
    /// Question decision recorded in `SPEC_FULL.md` §9 — the same
    /// `session_id`, so session-level dedup invariants survive a retry.
    ///
    /// Does not mutate `self`; the caller is the one who transitions `self`
    /// if that has not already happened.
    #[must_use]
    pub fn retry_child(&self) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            agent_name: self.agent_name.clone(),
            session_id: self.session_id.clone(),
            parent_run_id: Some(self.run_id.clone()),
            input_content: self.input_content.clone(),
            output_content: None,
            state: RunState::Queued,
            priority: self.priority,
            retry_count: self.retry_count + 1,
            max_retries: self.max_retries,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
        }
    }

    /// `state == Failed && retry_count < max_retries`.
    #[must_use]
    pub fn can_retry(&self) -> bool {
        self.state == RunState::Failed && self.retry_count < self.max_retries
    }

    /// Seconds between `started_at` and `ended_at`/now, or `None` if not yet started.
    #[must_use]
    pub fn duration_seconds(&self) -> Option<i64> {
        let started = self.started_at?;
        let end = self.ended_at.unwrap_or_else(Utc::now);
        Some((end - started).num_seconds())
    }

    /// Seconds between `created_at` and `started_at`/now.
    #[must_use]
    pub fn wait_seconds(&self) -> Option<i64> {
        let end = self.started_at.unwrap_or_else(Utc::now);
        Some((end - self.created_at).num_seconds())
    }
}
