//! The public facade: [`QueueManager`] wraps a [`crate::scheduler::Scheduler`]
//! with lifecycle management (`start`/`stop`), store construction, and
//! callback registration, so callers never touch the scheduler directly.

use std::sync::Arc;
use std::time::Duration;

use miette::Diagnostic;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::instrument;

use crate::config::QueueConfig;
use crate::dedup::SessionDedupCache;
use crate::executor::Executor;
use crate::run::{Priority, Run, RunState};
use crate::scheduler::{Scheduler, SchedulerError};
use crate::store::{QueueStatistics, RunFilter, Store, StoreError};
use crate::stream_bus::{QueueEvent, QueueEventType, StreamBus, StreamItem};

const DEFAULT_HEARTBEAT: Duration = Duration::from_millis(250);

/// Errors surfaced by [`QueueManager`] entry points; a thin union of the
/// scheduler's and store's error taxonomies.
#[derive(Debug, Error, Diagnostic)]
pub enum ManagerError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, ManagerError>;

#[derive(Default)]
struct Callbacks {
    on_output: Vec<Arc<dyn Fn(String, String) + Send + Sync>>,
    on_complete: Vec<Arc<dyn Fn(String, Run) + Send + Sync>>,
    on_error: Vec<Arc<dyn Fn(String, String) + Send + Sync>>,
}

fn call_guarded<F: FnOnce()>(f: F) {
    if std::panic::catch_unwind(std::panic::AssertUnwindSafe(f)).is_err() {
        tracing::error!("callback panicked; queue manager continues");
    }
}

/// Public entry point for embedding this crate: construct with [`QueueManager::new`],
/// call [`QueueManager::start`], then [`QueueManager::submit`] runs.
#[derive(Clone)]
pub struct QueueManager {
    scheduler: Scheduler,
    dedup: Arc<SessionDedupCache>,
    callbacks: Arc<Mutex<Callbacks>>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
    heartbeat: Duration,
}

impl QueueManager {
    /// Build a manager with its own store, chosen by `config.enable_persistence`
    /// (and the `sqlite` cargo feature): `SqliteStore` when both are on, an
    /// in-memory store otherwise.
    pub async fn new(
        config: QueueConfig,
        executor: Arc<dyn Executor>,
        dedup: Arc<SessionDedupCache>,
    ) -> Result<Self> {
        let store = build_store(&config).await?;
        Self::with_store(config, store, executor, dedup)
    }

    /// Build a manager against an already-constructed [`Store`], e.g. an
    /// [`crate::store::memory::InMemoryStore`] shared across a test.
    pub fn with_store(
        config: QueueConfig,
        store: Arc<dyn Store>,
        executor: Arc<dyn Executor>,
        dedup: Arc<SessionDedupCache>,
    ) -> Result<Self> {
        let scheduler = Scheduler::new(config, store, executor, StreamBus::new());
        Ok(Self {
            scheduler,
            dedup,
            callbacks: Arc::new(Mutex::new(Callbacks::default())),
            tasks: Arc::new(Mutex::new(Vec::new())),
            heartbeat: DEFAULT_HEARTBEAT,
        })
    }

    #[must_use]
    pub fn dedup_cache(&self) -> &Arc<SessionDedupCache> {
        &self.dedup
    }

    /// Initialize the store, optionally run boot-time crash recovery, and
    /// spawn the dispatch loop plus the callback-forwarding loop.
    #[instrument(skip(self), err)]
    pub async fn start(&self, recover: bool) -> Result<()> {
        self.scheduler.store().initialize().await?;
        if recover {
            self.scheduler.recover().await?;
        }

        let dispatch_scheduler = self.scheduler.clone();
        let heartbeat = self.heartbeat;
        let dispatch_task = tokio::spawn(async move {
            loop {
                dispatch_scheduler.wait_for_wake(heartbeat).await;
                dispatch_scheduler.dispatch_pass().await;
            }
        });

        let forward_scheduler = self.scheduler.clone();
        let callbacks = Arc::clone(&self.callbacks);
        let forward_task = tokio::spawn(async move {
            run_callback_forwarder(forward_scheduler, callbacks).await;
        });

        self.tasks.lock().extend([dispatch_task, forward_task]);
        Ok(())
    }

    /// Abort the dispatch loop and callback-forwarding loop. Idempotent.
    pub fn stop(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    /// Submit a new run. `priority` defaults to [`Priority::Normal`] and
    /// `max_retries` to 3 at the call site if the caller has no preference.
    #[instrument(skip(self, input_content), fields(agent = %agent_name.as_ref()), err)]
    pub async fn submit(
        &self,
        input_content: impl Into<String>,
        agent_name: impl AsRef<str> + Into<String>,
        priority: Priority,
        session_id: Option<String>,
        parent_run_id: Option<String>,
        max_retries: u32,
    ) -> Result<String> {
        let mut run = Run::new(agent_name, input_content, priority, session_id, max_retries);
        run.parent_run_id = parent_run_id;
        Ok(self.scheduler.submit(run).await?)
    }

    pub async fn cancel(&self, run_id: &str) -> bool {
        self.scheduler.cancel(run_id).await
    }

    pub async fn retry(&self, run_id: &str) -> Result<Option<String>> {
        Ok(self.scheduler.retry(run_id).await?)
    }

    pub async fn clear_queue(&self) -> usize {
        self.scheduler.clear_queue().await
    }

    /// Delete runs in a terminal state with `created_at` older than `days`.
    /// Not scheduled automatically; callers that want the retention window
    /// enforced periodically drive this themselves (e.g. from their own
    /// `tokio::time::interval` loop) using `config.retention_days`.
    pub async fn cleanup_old_runs(&self, days: u32) -> Result<u64> {
        Ok(self.scheduler.store().cleanup_old_runs(days).await?)
    }

    #[must_use]
    pub fn get_run(&self, run_id: &str) -> Option<Run> {
        self.scheduler.get_run(run_id)
    }

    #[must_use]
    pub fn list_runs(&self, filter: &RunFilter) -> Vec<Run> {
        self.scheduler.list_runs(filter)
    }

    #[must_use]
    pub fn get_stats(&self) -> QueueStatistics {
        self.scheduler.stats()
    }

    #[must_use]
    pub fn queued_count(&self) -> usize {
        self.scheduler.queued_count()
    }

    #[must_use]
    pub fn running_count(&self) -> usize {
        self.scheduler.running_count()
    }

    /// Called once per chunk produced by any run, in order.
    pub fn on_output<F>(&self, callback: F)
    where
        F: Fn(String, String) + Send + Sync + 'static,
    {
        self.callbacks.lock().on_output.push(Arc::new(callback));
    }

    /// Called exactly once per run iff it terminates `Succeeded`.
    pub fn on_complete<F>(&self, callback: F)
    where
        F: Fn(String, Run) + Send + Sync + 'static,
    {
        self.callbacks.lock().on_complete.push(Arc::new(callback));
    }

    /// Called exactly once per run iff it terminates `Failed`. No dedicated
    /// callback exists for `Cancelled`; observe it via [`QueueManager::add_event_callback`]
    /// or a run's final stream chunk.
    pub fn on_error<F>(&self, callback: F)
    where
        F: Fn(String, String) + Send + Sync + 'static,
    {
        self.callbacks.lock().on_error.push(Arc::new(callback));
    }

    /// A lower-level alternative to `on_output`/`on_complete`/`on_error`: a
    /// plain closure invoked for every lifecycle event. A thin convenience
    /// wrapper over [`crate::stream_bus::StreamBus::subscribe_events`], not a
    /// second notification path — spawns its own forwarding task.
    pub fn add_event_callback<F>(&self, callback: F)
    where
        F: Fn(QueueEvent) + Send + Sync + 'static,
    {
        let mut events = self.scheduler.stream_bus().subscribe_events();
        let task = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                call_guarded(|| callback(event));
            }
        });
        self.tasks.lock().push(task);
    }
}

#[cfg(feature = "sqlite")]
async fn build_store(config: &QueueConfig) -> Result<Arc<dyn Store>> {
    if config.enable_persistence {
        let store = crate::store::sqlite::SqliteStore::connect(&config.db_path).await?;
        Ok(Arc::new(store))
    } else {
        Ok(Arc::new(crate::store::memory::InMemoryStore::new()))
    }
}

#[cfg(not(feature = "sqlite"))]
async fn build_store(_config: &QueueConfig) -> Result<Arc<dyn Store>> {
    Ok(Arc::new(crate::store::memory::InMemoryStore::new()))
}

/// Listens to the shared event stream; on `run_started` it spawns a
/// per-run chunk forwarder into `on_output`, and on terminal events it
/// invokes `on_complete`/`on_error` with the final snapshot.
async fn run_callback_forwarder(scheduler: Scheduler, callbacks: Arc<Mutex<Callbacks>>) {
    let mut events = scheduler.stream_bus().subscribe_events();
    while let Some(event) = events.next().await {
        match event.event_type {
            QueueEventType::RunStarted => {
                let mut chunks = scheduler.stream_bus().subscribe_run(&event.run_id);
                let callbacks = Arc::clone(&callbacks);
                let run_id = event.run_id.clone();
                tokio::spawn(async move {
                    while let Some(item) = chunks.next().await {
                        match item {
                            StreamItem::Chunk(chunk) => {
                                if chunk.is_final {
                                    break;
                                }
                                let cbs = callbacks.lock().on_output.clone();
                                for cb in cbs {
                                    let run_id = run_id.clone();
                                    let content = chunk.content.clone();
                                    call_guarded(|| cb(run_id, content));
                                }
                            }
                            StreamItem::Dropped { missed } => {
                                tracing::warn!(run_id, missed, "on_output forwarder dropped chunks");
                            }
                        }
                    }
                });
            }
            QueueEventType::RunCompleted => {
                if let Some(run) = scheduler.get_run(&event.run_id) {
                    let cbs = callbacks.lock().on_complete.clone();
                    for cb in cbs {
                        let run_id = event.run_id.clone();
                        let run = run.clone();
                        call_guarded(|| cb(run_id, run));
                    }
                }
            }
            QueueEventType::RunFailed => {
                if let Some(run) = scheduler.get_run(&event.run_id) {
                    if run.state == RunState::Failed {
                        let message = run.error.clone().unwrap_or_default();
                        let cbs = callbacks.lock().on_error.clone();
                        for cb in cbs {
                            let run_id = event.run_id.clone();
                            let message = message.clone();
                            call_guarded(|| cb(run_id, message));
                        }
                    }
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{EchoBehavior, EchoExecutor};
    use crate::store::memory::InMemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration as StdDuration;

    fn manager(config: QueueConfig, behavior: EchoBehavior) -> QueueManager {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let executor: Arc<dyn Executor> = Arc::new(EchoExecutor::new(behavior));
        QueueManager::with_store(config, store, executor, Arc::new(SessionDedupCache::default())).unwrap()
    }

    #[tokio::test]
    async fn submit_then_complete_invokes_on_complete() {
        let mgr = manager(QueueConfig::default().with_max_concurrent_global(1), EchoBehavior::Echo);
        mgr.start(false).await.unwrap();

        let completed = Arc::new(AtomicUsize::new(0));
        let completed2 = Arc::clone(&completed);
        mgr.on_complete(move |_run_id, run| {
            assert_eq!(run.state, RunState::Succeeded);
            completed2.fetch_add(1, Ordering::SeqCst);
        });

        let run_id = mgr
            .submit("hello world", "agentA", Priority::Normal, None, None, 3)
            .await
            .unwrap();

        for _ in 0..40 {
            tokio::time::sleep(StdDuration::from_millis(10)).await;
            if mgr.get_run(&run_id).map(|r| r.state) == Some(RunState::Succeeded) {
                break;
            }
        }
        assert_eq!(mgr.get_run(&run_id).unwrap().state, RunState::Succeeded);

        tokio::time::sleep(StdDuration::from_millis(20)).await;
        assert_eq!(completed.load(Ordering::SeqCst), 1);
        mgr.stop();
    }

    #[tokio::test]
    async fn submit_failure_invokes_on_error_not_on_complete() {
        let mgr = manager(
            QueueConfig::default().with_max_concurrent_global(1),
            EchoBehavior::FailPermanent,
        );
        mgr.start(false).await.unwrap();

        let errors = Arc::new(AtomicUsize::new(0));
        let completes = Arc::new(AtomicUsize::new(0));
        let e2 = Arc::clone(&errors);
        let c2 = Arc::clone(&completes);
        mgr.on_error(move |_id, _msg| {
            e2.fetch_add(1, Ordering::SeqCst);
        });
        mgr.on_complete(move |_id, _run| {
            c2.fetch_add(1, Ordering::SeqCst);
        });

        let run_id = mgr.submit("x", "agentA", Priority::Normal, None, None, 3).await.unwrap();
        for _ in 0..40 {
            tokio::time::sleep(StdDuration::from_millis(10)).await;
            if mgr.get_run(&run_id).map(|r| r.state) == Some(RunState::Failed) {
                break;
            }
        }
        tokio::time::sleep(StdDuration::from_millis(20)).await;
        assert_eq!(errors.load(Ordering::SeqCst), 1);
        assert_eq!(completes.load(Ordering::SeqCst), 0);
        mgr.stop();
    }

    #[tokio::test]
    async fn queue_full_surfaces_as_manager_error() {
        let mgr = manager(
            QueueConfig::default().with_max_queue_size(1).with_max_concurrent_global(1),
            EchoBehavior::WaitForCancel,
        );
        mgr.start(false).await.unwrap();
        mgr.submit("a", "agentA", Priority::Normal, None, None, 3).await.unwrap();
        let err = mgr.submit("b", "agentA", Priority::Normal, None, None, 3).await.unwrap_err();
        assert!(matches!(err, ManagerError::Scheduler(SchedulerError::QueueFull { .. })));
        mgr.stop();
    }

    #[tokio::test]
    async fn recovery_on_start_requeues_pending_runs() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let pending = Run::with_id("r1", "agentA", "p", Priority::Normal, None, 3);
        store.save_run(&pending).await.unwrap();

        let executor: Arc<dyn Executor> = Arc::new(EchoExecutor::default());
        let mgr = QueueManager::with_store(
            QueueConfig::default(),
            store,
            executor,
            Arc::new(SessionDedupCache::default()),
        )
        .unwrap();
        mgr.start(true).await.unwrap();

        for _ in 0..40 {
            tokio::time::sleep(StdDuration::from_millis(10)).await;
            if mgr.get_run("r1").map(|r| r.state) == Some(RunState::Succeeded) {
                break;
            }
        }
        assert_eq!(mgr.get_run("r1").unwrap().state, RunState::Succeeded);
        mgr.stop();
    }

    #[tokio::test]
    async fn cleanup_old_runs_delegates_to_store() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let mut old = Run::with_id("old", "agentA", "p", Priority::Normal, None, 3);
        old.state = RunState::Succeeded;
        old.created_at = chrono::Utc::now() - chrono::Duration::days(40);
        store.save_run(&old).await.unwrap();

        let executor: Arc<dyn Executor> = Arc::new(EchoExecutor::default());
        let mgr = QueueManager::with_store(
            QueueConfig::default(),
            store,
            executor,
            Arc::new(SessionDedupCache::default()),
        )
        .unwrap();
        mgr.start(false).await.unwrap();

        let deleted = mgr.cleanup_old_runs(30).await.unwrap();
        assert_eq!(deleted, 1);
        mgr.stop();
    }
}
