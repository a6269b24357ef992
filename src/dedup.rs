//! Process-wide, bounded, strict-LRU set of content hashes, used to suppress
//! sending duplicate context to an LLM across agents sharing a session.
//!
//! A `parking_lot`-guarded `FxHashMap` plus an intrusive insertion-order
//! `VecDeque` gives O(1) strict-LRU eviction (no access-time promotion — the
//! operation stays O(1) and predictable).

use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::VecDeque;

const DEFAULT_MAX_SIZE: usize = 1000;

#[derive(Debug, Default)]
struct CacheState {
    entries: FxHashSet<String>,
    /// Insertion order, oldest first, for strict-LRU eviction.
    order: VecDeque<String>,
    duplicates_prevented: u64,
    tokens_saved: u64,
}

/// Snapshot of dedup effectiveness.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DedupStats {
    pub duplicates_prevented: u64,
    pub tokens_saved: u64,
}

/// A bounded, thread-safe, strict-LRU-evicting set of content hashes.
///
/// Explicitly injected into [`crate::manager::QueueManager`] rather than a
/// hidden process-wide singleton (per the Design Notes), so tests stay
/// hermetic; [`SessionDedupCache::shared`] offers a convenience default
/// instance for callers who do want one process-wide cache.
#[derive(Debug)]
pub struct SessionDedupCache {
    max_size: usize,
    state: Mutex<CacheState>,
}

impl SessionDedupCache {
    #[must_use]
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size: max_size.max(1),
            state: Mutex::new(CacheState::default()),
        }
    }

    /// A process-wide default instance, for callers that don't need hermetic
    /// isolation. Never constructed implicitly by [`crate::manager::QueueManager`].
    #[must_use]
    pub fn shared() -> std::sync::Arc<Self> {
        static SHARED: std::sync::OnceLock<std::sync::Arc<SessionDedupCache>> =
            std::sync::OnceLock::new();
        SHARED
            .get_or_init(|| std::sync::Arc::new(Self::new(DEFAULT_MAX_SIZE)))
            .clone()
    }

    /// If `content_hash` is already present, record `tokens` as saved and
    /// return `true` (duplicate). Otherwise insert it (evicting the oldest
    /// entry if at capacity) and return `false`.
    ///
    /// `agent_name` is accepted for parity with the spec's signature and for
    /// future per-agent accounting; the current cache is agent-agnostic by
    /// design (dedup is meant to catch cross-agent duplication).
    pub fn check_and_add(&self, content_hash: &str, _agent_name: &str, tokens: u64) -> bool {
        let mut state = self.state.lock();
        if state.entries.contains(content_hash) {
            state.duplicates_prevented += 1;
            state.tokens_saved += tokens;
            return true;
        }
        if state.order.len() >= self.max_size {
            if let Some(oldest) = state.order.pop_front() {
                state.entries.remove(&oldest);
            }
        }
        state.entries.insert(content_hash.to_string());
        state.order.push_back(content_hash.to_string());
        false
    }

    #[must_use]
    pub fn stats(&self) -> DedupStats {
        let state = self.state.lock();
        DedupStats {
            duplicates_prevented: state.duplicates_prevented,
            tokens_saved: state.tokens_saved,
        }
    }

    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.entries.clear();
        state.order.clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().order.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SessionDedupCache {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SIZE)
    }
}
