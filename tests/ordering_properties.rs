//! Property-based checks for the ordering/idempotence invariants in spec §8
//! (1, 3, 10, 11, 13), quantified over arbitrary schedules rather than a
//! handful of fixed examples.

use std::sync::Arc;
use std::time::Duration;

use agentqueue::config::QueueConfig;
use agentqueue::executor::{EchoBehavior, EchoExecutor};
use agentqueue::gate::ConcurrencyGate;
use agentqueue::run::{Priority, Run};
use agentqueue::scheduler::Scheduler;
use agentqueue::store::memory::InMemoryStore;
use agentqueue::store::Store;
use agentqueue::stream_bus::StreamBus;
use proptest::prelude::*;

fn priority_strategy() -> impl Strategy<Value = Priority> {
    prop_oneof![
        Just(Priority::Low),
        Just(Priority::Normal),
        Just(Priority::High),
        Just(Priority::Urgent),
    ]
}

proptest! {
    /// Invariant 1: whenever `try_acquire` succeeds, both counters stay within
    /// their configured caps immediately afterward, for any schedule of
    /// acquire/release calls across an arbitrary number of agents.
    #[test]
    fn gate_never_exceeds_caps(
        global_cap in 1usize..6,
        per_agent_cap in 1usize..4,
        agent_indices in prop::collection::vec(0usize..3, 1..40),
    ) {
        let gate = ConcurrencyGate::new(global_cap, per_agent_cap);
        let mut held: Vec<Run> = Vec::new();

        for (i, agent_idx) in agent_indices.iter().enumerate() {
            let agent = format!("agent-{agent_idx}");
            let run = Run::with_id(format!("r{i}"), agent, "p", Priority::Normal, None, 3);
            if gate.try_acquire(&run) {
                prop_assert!(gate.global_running() <= global_cap);
                prop_assert!(gate.per_agent_running(&run.agent_name) <= per_agent_cap);
                held.push(run);
            }
            // Periodically release a held run so acquires and releases interleave.
            if i % 3 == 2 {
                if let Some(run) = held.pop() {
                    gate.release(&run);
                }
            }
        }
        for run in held {
            gate.release(&run);
        }
        prop_assert_eq!(gate.global_running(), 0);
    }
}

/// Invariant 3 & 10 & 11: end-to-end through the real scheduler — every run
/// reaches a terminal state exactly once, and the observed peak of concurrent
/// `Running` runs never exceeds the global/per-agent caps, across randomized
/// priority/agent assignments.
#[tokio::test]
async fn scheduler_never_exceeds_caps_and_all_runs_terminate() {
    let mut runner = proptest::test_runner::TestRunner::default();
    let strategy = (
        1usize..4,
        1usize..3,
        prop::collection::vec((0usize..3, priority_strategy()), 1..12),
    );

    for _ in 0..12 {
        let (global_cap, per_agent_cap, specs) = strategy
            .new_tree(&mut runner)
            .unwrap()
            .current();

        let config = QueueConfig::default()
            .with_max_concurrent_global(global_cap)
            .with_max_concurrent_per_agent(per_agent_cap)
            .with_max_queue_size(specs.len().max(1));
        let store = Arc::new(InMemoryStore::new());
        let executor = Arc::new(EchoExecutor::new(EchoBehavior::Echo));
        let sched = Scheduler::new(config, store, executor, StreamBus::new());

        let mut ids = Vec::new();
        for (i, (agent_idx, priority)) in specs.iter().enumerate() {
            let run = Run::with_id(
                format!("r{i}"),
                format!("agent-{agent_idx}"),
                "payload",
                *priority,
                None,
                3,
            );
            ids.push(run.run_id.clone());
            sched.submit(run).await.unwrap();
        }

        for _ in 0..200 {
            sched.dispatch_pass().await;
            // Invariant 10/11: running counts never exceed either cap, at any
            // point we sample them.
            assert!(sched.running_count() <= global_cap);
            tokio::time::sleep(Duration::from_millis(2)).await;
            if ids.iter().all(|id| {
                sched
                    .get_run(id)
                    .map(|r| r.state.is_terminal())
                    .unwrap_or(false)
            }) {
                break;
            }
        }

        for id in &ids {
            let run = sched.get_run(id).expect("run present");
            assert!(run.state.is_terminal(), "run {id} never reached a terminal state");
        }
    }
}

/// Invariant 13: the dedup cache never exceeds `max_size`; after `max_size + 1`
/// distinct inserts, exactly the earliest-inserted entry is evicted, across
/// randomized cache sizes.
proptest! {
    #[test]
    fn dedup_cache_never_exceeds_max_size(max_size in 1usize..20) {
        use agentqueue::dedup::SessionDedupCache;

        let cache = SessionDedupCache::new(max_size);
        for i in 0..max_size {
            prop_assert!(!cache.check_and_add(&format!("hash-{i}"), "agent", 1));
            prop_assert!(cache.len() <= max_size);
        }
        prop_assert_eq!(cache.len(), max_size);

        // One more distinct insert must evict exactly the earliest entry
        // (hash-0) and leave every other entry live.
        prop_assert!(!cache.check_and_add("hash-overflow", "agent", 1));
        prop_assert_eq!(cache.len(), max_size);

        // Checking a still-live entry is a pure duplicate hit (no eviction),
        // so check those before the one that mutates order by re-inserting.
        for i in 1..max_size {
            prop_assert!(cache.check_and_add(&format!("hash-{i}"), "agent", 1), "hash-{} should still be live", i);
        }
        prop_assert!(!cache.check_and_add("hash-0", "agent", 1), "hash-0 should have been evicted");
    }
}
