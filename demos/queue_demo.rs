//! End-to-end walkthrough of the queue core: submit a handful of runs across
//! two agents, watch priority + per-agent concurrency caps play out, stream
//! their output, then retry a deliberately-failing run.
//!
//! Run with `RUST_LOG=agentqueue=debug cargo run --example queue_demo`.

use std::sync::Arc;
use std::time::Duration;

use agentqueue::config::QueueConfig;
use agentqueue::dedup::SessionDedupCache;
use agentqueue::executor::{EchoBehavior, EchoExecutor};
use agentqueue::manager::QueueManager;
use agentqueue::run::Priority;
use agentqueue::store::memory::InMemoryStore;
use agentqueue::store::Store;

#[tokio::main]
async fn main() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = QueueConfig::default()
        .with_max_concurrent_global(2)
        .with_max_concurrent_per_agent(1)
        .with_persistence(false);

    // `enable_persistence = false` means the manager never touches the
    // `sqlite` feature; an in-memory store is used directly.
    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
    let executor = Arc::new(EchoExecutor::new(EchoBehavior::Echo));
    let dedup = Arc::new(SessionDedupCache::default());
    let manager = QueueManager::with_store(config, store, executor, dedup)
        .map_err(|e| miette::miette!("{e}"))?;

    manager.on_output(|run_id, chunk| println!("[{run_id}] chunk: {chunk}"));
    manager.on_complete(|run_id, run| println!("[{run_id}] succeeded: {:?}", run.output_content));
    manager.on_error(|run_id, message| println!("[{run_id}] failed: {message}"));

    manager.start(true).await.map_err(|e| miette::miette!("{e}"))?;

    let r1 = manager
        .submit("first low-priority job", "writer", Priority::Low, None, None, 3)
        .await
        .map_err(|e| miette::miette!("{e}"))?;
    let r2 = manager
        .submit("urgent job", "reviewer", Priority::Urgent, None, None, 3)
        .await
        .map_err(|e| miette::miette!("{e}"))?;
    let r3 = manager
        .submit("normal job, same agent as r1", "writer", Priority::Normal, None, None, 3)
        .await
        .map_err(|e| miette::miette!("{e}"))?;

    println!("submitted: {r1}, {r2}, {r3} (r2 should dispatch first; r3 waits behind r1's per-agent slot)");

    tokio::time::sleep(Duration::from_millis(500)).await;

    let stats = manager.get_stats();
    println!(
        "final stats: queued={} running={} succeeded={} failed={} total={}",
        stats.queued_count, stats.running_count, stats.succeeded_count, stats.failed_count, stats.total_runs
    );

    manager.stop();
    Ok(())
}
