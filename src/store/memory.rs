//! In-process, lock-guarded [`Store`] backend: tests and `enable_persistence=false`
//! deployments.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::run::{Run, RunState};

use super::{QueueStatistics, RunFilter, SessionRecord, Store};

#[derive(Debug, Default)]
pub struct InMemoryStore {
    runs: RwLock<FxHashMap<String, Run>>,
    sessions: RwLock<FxHashMap<String, SessionRecord>>,
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn initialize(&self) -> super::Result<()> {
        Ok(())
    }

    async fn save_run(&self, run: &Run) -> super::Result<()> {
        self.runs.write().insert(run.run_id.clone(), run.clone());
        Ok(())
    }

    async fn load_run(&self, run_id: &str) -> super::Result<Option<Run>> {
        Ok(self.runs.read().get(run_id).cloned())
    }

    async fn list_runs(&self, filter: &RunFilter) -> super::Result<Vec<Run>> {
        let runs = self.runs.read();
        let mut matched: Vec<Run> = runs
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let offset = filter.offset as usize;
        let limit = if filter.limit == 0 {
            matched.len()
        } else {
            filter.limit as usize
        };
        Ok(matched.into_iter().skip(offset).take(limit).collect())
    }

    async fn delete_run(&self, run_id: &str) -> super::Result<bool> {
        Ok(self.runs.write().remove(run_id).is_some())
    }

    async fn update_run_state(
        &self,
        run_id: &str,
        new_state: RunState,
        error: Option<String>,
    ) -> super::Result<bool> {
        let mut runs = self.runs.write();
        let Some(run) = runs.get_mut(run_id) else {
            return Ok(false);
        };
        run.state = new_state;
        if error.is_some() {
            run.error = error;
        }
        if new_state.is_terminal() {
            run.ended_at = Some(Utc::now());
        }
        Ok(true)
    }

    async fn load_pending_runs(&self) -> super::Result<Vec<Run>> {
        Ok(self
            .runs
            .read()
            .values()
            .filter(|r| r.state.is_active())
            .cloned()
            .collect())
    }

    async fn mark_interrupted_as_failed(&self) -> super::Result<u64> {
        let mut runs = self.runs.write();
        let mut count = 0u64;
        for run in runs.values_mut() {
            if run.state == RunState::Running {
                run.state = RunState::Failed;
                run.error = Some("Interrupted".to_string());
                run.ended_at = Some(Utc::now());
                count += 1;
            }
        }
        Ok(count)
    }

    async fn get_stats(&self) -> super::Result<QueueStatistics> {
        Ok(QueueStatistics::from_runs(self.runs.read().values()))
    }

    async fn save_session(
        &self,
        session_id: &str,
        user_id: Option<String>,
        state_json: Option<String>,
        config_json: Option<String>,
    ) -> super::Result<()> {
        self.sessions.write().insert(
            session_id.to_string(),
            SessionRecord {
                session_id: session_id.to_string(),
                user_id,
                state_json,
                config_json,
                updated_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn load_session(&self, session_id: &str) -> super::Result<Option<SessionRecord>> {
        Ok(self.sessions.read().get(session_id).cloned())
    }

    async fn list_sessions(&self) -> super::Result<Vec<SessionRecord>> {
        Ok(self.sessions.read().values().cloned().collect())
    }

    async fn cleanup_old_runs(&self, days: u32) -> super::Result<u64> {
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(days));
        let mut runs = self.runs.write();
        let doomed: Vec<String> = runs
            .values()
            .filter(|r| r.state.is_terminal() && r.created_at < cutoff)
            .map(|r| r.run_id.clone())
            .collect();
        for id in &doomed {
            runs.remove(id);
        }
        Ok(doomed.len() as u64)
    }
}
