//! Admission control: a global cap, a per-agent cap, and an explicit cancel set.
//!
//! Counters live in a `parking_lot::Mutex`-protected struct mutated under
//! short-held locks, never across an `.await`.

use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::run::Run;

#[derive(Debug, Default)]
struct GateState {
    global_running: usize,
    per_agent_running: FxHashMap<String, usize>,
    cancelled: FxHashSet<String>,
}

/// Tracks RUNNING counts against `max_concurrent_global` / `max_concurrent_per_agent`
/// and a cooperative-cancel set, all under a single short-lived lock.
#[derive(Debug)]
pub struct ConcurrencyGate {
    max_concurrent_global: usize,
    max_concurrent_per_agent: usize,
    state: Mutex<GateState>,
}

impl ConcurrencyGate {
    #[must_use]
    pub fn new(max_concurrent_global: usize, max_concurrent_per_agent: usize) -> Self {
        Self {
            max_concurrent_global: max_concurrent_global.max(1),
            max_concurrent_per_agent: max_concurrent_per_agent.max(1),
            state: Mutex::new(GateState::default()),
        }
    }

    fn admissible(state: &GateState, run: &Run, global_cap: usize, per_agent_cap: usize) -> bool {
        if state.cancelled.contains(&run.run_id) {
            return false;
        }
        if state.global_running >= global_cap {
            return false;
        }
        let agent_count = state.per_agent_running.get(&run.agent_name).copied().unwrap_or(0);
        agent_count < per_agent_cap
    }

    /// Check admissibility without mutating counters. Used by the dispatch
    /// loop's `pop_if` predicate, which must not have side effects on skipped
    /// candidates.
    #[must_use]
    pub fn try_acquire_dry_run(&self, run: &Run) -> bool {
        let state = self.state.lock();
        Self::admissible(&state, run, self.max_concurrent_global, self.max_concurrent_per_agent)
    }

    /// Atomically check admissibility and, if admissible, increment both counters.
    #[must_use]
    pub fn try_acquire(&self, run: &Run) -> bool {
        let mut state = self.state.lock();
        if !Self::admissible(&state, run, self.max_concurrent_global, self.max_concurrent_per_agent) {
            return false;
        }
        state.global_running += 1;
        *state.per_agent_running.entry(run.agent_name.clone()).or_insert(0) += 1;
        true
    }

    /// Release the slots held by a previously-acquired `Run`. Never goes below zero.
    pub fn release(&self, run: &Run) {
        let mut state = self.state.lock();
        state.global_running = state.global_running.saturating_sub(1);
        if let Some(count) = state.per_agent_running.get_mut(&run.agent_name) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                state.per_agent_running.remove(&run.agent_name);
            }
        }
    }

    /// Mark `run_id` as cancelled. Idempotent.
    pub fn cancel(&self, run_id: &str) {
        self.state.lock().cancelled.insert(run_id.to_string());
    }

    #[must_use]
    pub fn is_cancelled(&self, run_id: &str) -> bool {
        self.state.lock().cancelled.contains(run_id)
    }

    /// Forget a cancelled-set entry once the run has reached a terminal state,
    /// so the set does not grow without bound across a long-lived process.
    pub fn forget_cancelled(&self, run_id: &str) {
        self.state.lock().cancelled.remove(run_id);
    }

    #[must_use]
    pub fn global_running(&self) -> usize {
        self.state.lock().global_running
    }

    #[must_use]
    pub fn per_agent_running(&self, agent_name: &str) -> usize {
        self.state.lock().per_agent_running.get(agent_name).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::Priority;

    fn run(agent: &str) -> Run {
        Run::new(agent, "x", Priority::Normal, None, 3)
    }

    #[test]
    fn respects_global_cap() {
        let gate = ConcurrencyGate::new(1, 10);
        let a = run("a");
        let b = run("b");
        assert!(gate.try_acquire(&a));
        assert!(!gate.try_acquire(&b));
        gate.release(&a);
        assert!(gate.try_acquire(&b));
    }

    #[test]
    fn respects_per_agent_cap() {
        let gate = ConcurrencyGate::new(10, 1);
        let a1 = run("a");
        let a2 = run("a");
        let b1 = run("b");
        assert!(gate.try_acquire(&a1));
        assert!(!gate.try_acquire(&a2));
        assert!(gate.try_acquire(&b1));
    }

    #[test]
    fn cancelled_run_never_admitted() {
        let gate = ConcurrencyGate::new(10, 10);
        let r = run("a");
        gate.cancel(&r.run_id);
        assert!(!gate.try_acquire(&r));
        assert!(!gate.try_acquire_dry_run(&r));
    }

    #[test]
    fn release_never_underflows() {
        let gate = ConcurrencyGate::new(1, 1);
        let r = run("a");
        gate.release(&r);
        gate.release(&r);
        assert_eq!(gate.global_running(), 0);
    }
}
