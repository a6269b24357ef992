//! `sqlx`-backed SQLite [`Store`], for durable deployments (`enable_persistence=true`).
//!
//! Schema is managed by an embedded `sqlx::migrate!("./migrations")` migration
//! against the `runs`/`sessions` tables; upserts use `INSERT ... ON CONFLICT`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteConnectOptions, Row, SqlitePool};
use std::str::FromStr;
use tracing::instrument;

use crate::run::{Priority, Run, RunState};

use super::{QueueStatistics, RunFilter, SessionRecord, Store, StoreError};

/// SQLite-backed [`Store`] using a shared connection pool.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore").finish()
    }
}

impl SqliteStore {
    /// Connect to (creating if necessary) the SQLite database at `db_path` and
    /// run embedded migrations. `db_path` is a filesystem path, not a URL.
    #[instrument(skip(db_path))]
    pub async fn connect(db_path: &str) -> super::Result<Self> {
        if let Some(parent) = std::path::Path::new(db_path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| StoreError::Unavailable {
                    message: format!("create db directory: {e}"),
                })?;
            }
        }
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{db_path}"))
            .map_err(|e| StoreError::Unavailable {
                message: format!("invalid db path: {e}"),
            })?
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options)
            .await
            .map_err(|e| StoreError::Unavailable {
                message: format!("connect error: {e}"),
            })?;

        #[cfg(feature = "sqlite-migrations")]
        {
            sqlx::migrate!("./migrations")
                .run(&pool)
                .await
                .map_err(|e| StoreError::Unavailable {
                    message: format!("migration failure: {e}"),
                })?;
        }

        Ok(Self { pool })
    }

    fn row_to_run(row: &sqlx::sqlite::SqliteRow) -> super::Result<Run> {
        let state_str: String = row.try_get("state").map_err(sqlx_err)?;
        let state = RunState::decode(&state_str).ok_or_else(|| StoreError::Serde {
            message: format!("unrecognized run state: {state_str}"),
        })?;
        let priority: i64 = row.try_get("priority").map_err(sqlx_err)?;
        let created_at: String = row.try_get("created_at").map_err(sqlx_err)?;
        let started_at: Option<String> = row.try_get("started_at").map_err(sqlx_err)?;
        let ended_at: Option<String> = row.try_get("ended_at").map_err(sqlx_err)?;

        Ok(Run {
            run_id: row.try_get("run_id").map_err(sqlx_err)?,
            agent_name: row.try_get("agent_name").map_err(sqlx_err)?,
            session_id: row.try_get("session_id").map_err(sqlx_err)?,
            parent_run_id: row.try_get("parent_run_id").map_err(sqlx_err)?,
            input_content: row.try_get("input_content").map_err(sqlx_err)?,
            output_content: row.try_get("output_content").map_err(sqlx_err)?,
            state,
            priority: Priority::decode(priority),
            retry_count: {
                let v: i64 = row.try_get("retry_count").map_err(sqlx_err)?;
                v as u32
            },
            max_retries: {
                let v: i64 = row.try_get("max_retries").map_err(sqlx_err)?;
                v as u32
            },
            error: row.try_get("error").map_err(sqlx_err)?,
            created_at: parse_ts(&created_at)?,
            started_at: started_at.map(|s| parse_ts(&s)).transpose()?,
            ended_at: ended_at.map(|s| parse_ts(&s)).transpose()?,
        })
    }
}

fn sqlx_err(e: sqlx::Error) -> StoreError {
    StoreError::Unavailable {
        message: e.to_string(),
    }
}

fn parse_ts(s: &str) -> super::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Serde {
            message: format!("bad timestamp {s}: {e}"),
        })
}

#[async_trait]
impl Store for SqliteStore {
    async fn initialize(&self) -> super::Result<()> {
        Ok(())
    }

    #[instrument(skip(self, run), err)]
    async fn save_run(&self, run: &Run) -> super::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO runs (
                run_id, agent_name, session_id, parent_run_id, input_content,
                output_content, state, priority, retry_count, max_retries,
                error, created_at, started_at, ended_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
            ON CONFLICT(run_id) DO UPDATE SET
                agent_name = excluded.agent_name,
                session_id = excluded.session_id,
                parent_run_id = excluded.parent_run_id,
                input_content = excluded.input_content,
                output_content = excluded.output_content,
                state = excluded.state,
                priority = excluded.priority,
                retry_count = excluded.retry_count,
                max_retries = excluded.max_retries,
                error = excluded.error,
                created_at = excluded.created_at,
                started_at = excluded.started_at,
                ended_at = excluded.ended_at
            "#,
        )
        .bind(&run.run_id)
        .bind(&run.agent_name)
        .bind(&run.session_id)
        .bind(&run.parent_run_id)
        .bind(&run.input_content)
        .bind(&run.output_content)
        .bind(run.state.encode())
        .bind(run.priority.encode())
        .bind(i64::from(run.retry_count))
        .bind(i64::from(run.max_retries))
        .bind(&run.error)
        .bind(run.created_at.to_rfc3339())
        .bind(run.started_at.map(|t| t.to_rfc3339()))
        .bind(run.ended_at.map(|t| t.to_rfc3339()))
        .execute(&self.pool)
        .await
        .map_err(sqlx_err)?;
        Ok(())
    }

    async fn load_run(&self, run_id: &str) -> super::Result<Option<Run>> {
        let row = sqlx::query("SELECT * FROM runs WHERE run_id = ?1")
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(sqlx_err)?;
        row.as_ref().map(Self::row_to_run).transpose()
    }

    async fn list_runs(&self, filter: &RunFilter) -> super::Result<Vec<Run>> {
        let mut sql = String::from("SELECT * FROM runs WHERE 1=1");
        if filter.state.is_some() {
            sql.push_str(" AND state = ?");
        }
        if filter.session_id.is_some() {
            sql.push_str(" AND session_id = ?");
        }
        sql.push_str(" ORDER BY created_at DESC LIMIT ? OFFSET ?");

        let mut query = sqlx::query(&sql);
        if let Some(state) = filter.state {
            query = query.bind(state.encode());
        }
        if let Some(session_id) = &filter.session_id {
            query = query.bind(session_id);
        }
        let limit = if filter.limit == 0 { i64::MAX } else { i64::from(filter.limit) };
        query = query.bind(limit).bind(i64::from(filter.offset));

        let rows = query.fetch_all(&self.pool).await.map_err(sqlx_err)?;
        rows.iter().map(Self::row_to_run).collect()
    }

    async fn delete_run(&self, run_id: &str) -> super::Result<bool> {
        let result = sqlx::query("DELETE FROM runs WHERE run_id = ?1")
            .bind(run_id)
            .execute(&self.pool)
            .await
            .map_err(sqlx_err)?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self), err)]
    async fn update_run_state(
        &self,
        run_id: &str,
        new_state: RunState,
        error: Option<String>,
    ) -> super::Result<bool> {
        let ended_at = new_state.is_terminal().then(|| Utc::now().to_rfc3339());
        let result = sqlx::query(
            r#"
            UPDATE runs SET
                state = ?1,
                error = COALESCE(?2, error),
                ended_at = COALESCE(?3, ended_at)
            WHERE run_id = ?4
            "#,
        )
        .bind(new_state.encode())
        .bind(error)
        .bind(ended_at)
        .bind(run_id)
        .execute(&self.pool)
        .await
        .map_err(sqlx_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn load_pending_runs(&self) -> super::Result<Vec<Run>> {
        let rows = sqlx::query(
            "SELECT * FROM runs WHERE state IN ('queued', 'running', 'paused') ORDER BY created_at ASC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(sqlx_err)?;
        rows.iter().map(Self::row_to_run).collect()
    }

    #[instrument(skip(self), err)]
    async fn mark_interrupted_as_failed(&self) -> super::Result<u64> {
        let now = Utc::now().to_rfc3339();
        let result = sqlx::query(
            "UPDATE runs SET state = 'failed', error = 'Interrupted', ended_at = ?1 WHERE state = 'running'",
        )
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(sqlx_err)?;
        Ok(result.rows_affected())
    }

    async fn get_stats(&self) -> super::Result<QueueStatistics> {
        let rows = sqlx::query("SELECT state, COUNT(*) as count FROM runs GROUP BY state")
            .fetch_all(&self.pool)
            .await
            .map_err(sqlx_err)?;
        let mut stats = QueueStatistics::default();
        for row in rows {
            let state: String = row.try_get("state").map_err(sqlx_err)?;
            let count: i64 = row.try_get("count").map_err(sqlx_err)?;
            let count = count as u64;
            match state.as_str() {
                "queued" => stats.queued_count = count,
                "running" => stats.running_count = count,
                "paused" => stats.paused_count = count,
                "succeeded" => stats.succeeded_count = count,
                "failed" => stats.failed_count = count,
                "cancelled" => stats.cancelled_count = count,
                _ => {}
            }
            stats.total_runs += count;
        }
        Ok(stats)
    }

    async fn save_session(
        &self,
        session_id: &str,
        user_id: Option<String>,
        state_json: Option<String>,
        config_json: Option<String>,
    ) -> super::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sessions (session_id, user_id, state_json, config_json, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(session_id) DO UPDATE SET
                user_id = excluded.user_id,
                state_json = excluded.state_json,
                config_json = excluded.config_json,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(session_id)
        .bind(user_id)
        .bind(state_json)
        .bind(config_json)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(sqlx_err)?;
        Ok(())
    }

    async fn load_session(&self, session_id: &str) -> super::Result<Option<SessionRecord>> {
        let row = sqlx::query("SELECT * FROM sessions WHERE session_id = ?1")
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(sqlx_err)?;
        row.map(|row| {
            let updated_at: String = row.try_get("updated_at").map_err(sqlx_err)?;
            Ok(SessionRecord {
                session_id: row.try_get("session_id").map_err(sqlx_err)?,
                user_id: row.try_get("user_id").map_err(sqlx_err)?,
                state_json: row.try_get("state_json").map_err(sqlx_err)?,
                config_json: row.try_get("config_json").map_err(sqlx_err)?,
                updated_at: parse_ts(&updated_at)?,
            })
        })
        .transpose()
    }

    async fn list_sessions(&self) -> super::Result<Vec<SessionRecord>> {
        let rows = sqlx::query("SELECT * FROM sessions")
            .fetch_all(&self.pool)
            .await
            .map_err(sqlx_err)?;
        rows.into_iter()
            .map(|row| {
                let updated_at: String = row.try_get("updated_at").map_err(sqlx_err)?;
                Ok(SessionRecord {
                    session_id: row.try_get("session_id").map_err(sqlx_err)?,
                    user_id: row.try_get("user_id").map_err(sqlx_err)?,
                    state_json: row.try_get("state_json").map_err(sqlx_err)?,
                    config_json: row.try_get("config_json").map_err(sqlx_err)?,
                    updated_at: parse_ts(&updated_at)?,
                })
            })
            .collect()
    }

    async fn cleanup_old_runs(&self, days: u32) -> super::Result<u64> {
        let cutoff = (Utc::now() - chrono::Duration::days(i64::from(days))).to_rfc3339();
        let result = sqlx::query(
            "DELETE FROM runs WHERE state IN ('succeeded', 'failed', 'cancelled') AND created_at < ?1",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(sqlx_err)?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::Priority;

    async fn temp_store() -> (SqliteStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.db");
        let store = SqliteStore::connect(path.to_str().unwrap()).await.unwrap();
        (store, dir)
    }

    #[tokio::test]
    async fn save_then_load_round_trips_every_field() {
        let (store, _dir) = temp_store().await;
        let mut run = Run::new("agentA", "payload", Priority::High, Some("sess1".into()), 5);
        run.output_content = Some("done".into());
        run.retry_count = 2;
        store.save_run(&run).await.unwrap();

        let loaded = store.load_run(&run.run_id).await.unwrap().unwrap();
        assert_eq!(loaded.run_id, run.run_id);
        assert_eq!(loaded.agent_name, run.agent_name);
        assert_eq!(loaded.session_id, run.session_id);
        assert_eq!(loaded.priority, run.priority);
        assert_eq!(loaded.retry_count, run.retry_count);
        assert_eq!(loaded.output_content, run.output_content);
    }

    #[tokio::test]
    async fn mark_interrupted_as_failed_sweeps_running_rows() {
        let (store, _dir) = temp_store().await;
        let mut run = Run::new("agentA", "payload", Priority::Normal, None, 3);
        run.state = RunState::Running;
        run.started_at = Some(Utc::now());
        store.save_run(&run).await.unwrap();

        let affected = store.mark_interrupted_as_failed().await.unwrap();
        assert_eq!(affected, 1);

        let loaded = store.load_run(&run.run_id).await.unwrap().unwrap();
        assert_eq!(loaded.state, RunState::Failed);
        assert_eq!(loaded.error.as_deref(), Some("Interrupted"));
        assert!(loaded.ended_at.is_some());
    }

    #[tokio::test]
    async fn get_stats_counts_by_state() {
        let (store, _dir) = temp_store().await;
        let mut r1 = Run::new("a", "x", Priority::Normal, None, 3);
        r1.state = RunState::Succeeded;
        let r2 = Run::new("a", "x", Priority::Normal, None, 3);
        store.save_run(&r1).await.unwrap();
        store.save_run(&r2).await.unwrap();

        let stats = store.get_stats().await.unwrap();
        assert_eq!(stats.total_runs, 2);
        assert_eq!(stats.succeeded_count, 1);
        assert_eq!(stats.queued_count, 1);
    }
}
