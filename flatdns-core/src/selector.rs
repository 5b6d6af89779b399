use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use rand::Rng;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SelectionStrategy {
    Weighted,
    LowestLatency,
    Failover,
    RoundRobin,
    Random,
    LeastQueries,
}

impl Default for SelectionStrategy {
    fn default() -> Self {
        SelectionStrategy::Weighted
    }
}

/// The read-only facts the selector needs about one currently-healthy
/// upstream, gathered by the caller from `UpstreamEntry` + `MetricsWindow`.
/// `index` is the upstream's position in the stable configuration order,
/// used to break ties deterministically.
#[derive(Debug, Clone, Copy)]
pub struct Candidate {
    pub index: usize,
    pub weight: u32,
    pub priority: u32,
    /// Mean latency in milliseconds, or `0` when fewer than `K` samples
    /// exist — spec.md §4.3 "treat as latency = 0 to encourage exploration".
    pub mean_latency_ms: u64,
    pub in_flight: u32,
}

/// Private, per-selector mutable state (spec.md §4.3: "selector-state is
/// small and private to the selector"). One instance guards one
/// configured selection policy for the whole process.
pub struct SelectorState {
    round_robin_cursor: AtomicUsize,
    weighted_cursor: AtomicU64,
}

impl SelectorState {
    pub fn new() -> Self {
        Self {
            round_robin_cursor: AtomicUsize::new(0),
            weighted_cursor: AtomicU64::new(0),
        }
    }
}

impl Default for SelectorState {
    fn default() -> Self {
        Self::new()
    }
}

/// Pure-ish selection: a function of the healthy subset, the configured
/// strategy, and `state`'s small rotating counters (spec.md §4.3). Panics
/// only if `candidates` is empty — callers must apply the degraded-fallback
/// rule (spec.md §4.2) before calling this.
pub fn select(
    candidates: &[Candidate],
    strategy: SelectionStrategy,
    state: &SelectorState,
) -> usize {
    assert!(!candidates.is_empty(), "select called with no candidates");

    match strategy {
        SelectionStrategy::Weighted => weighted(candidates, state),
        SelectionStrategy::LowestLatency => lowest_latency(candidates),
        SelectionStrategy::Failover => failover(candidates),
        SelectionStrategy::RoundRobin => round_robin(candidates, state),
        SelectionStrategy::Random => random(candidates),
        SelectionStrategy::LeastQueries => least_queries(candidates),
    }
}

fn weighted(candidates: &[Candidate], state: &SelectorState) -> usize {
    let total_weight: u64 = candidates.iter().map(|c| c.weight as u64).sum();
    if total_weight == 0 {
        return round_robin(candidates, state);
    }
    let cursor = state.weighted_cursor.fetch_add(1, Ordering::Relaxed);
    let mut point = cursor % total_weight;
    for c in candidates {
        let w = c.weight as u64;
        if point < w {
            return c.index;
        }
        point -= w;
    }
    candidates.last().expect("non-empty").index
}

fn lowest_latency(candidates: &[Candidate]) -> usize {
    candidates
        .iter()
        .min_by(|a, b| {
            a.mean_latency_ms
                .cmp(&b.mean_latency_ms)
                .then(a.index.cmp(&b.index))
        })
        .expect("non-empty")
        .index
}

fn failover(candidates: &[Candidate]) -> usize {
    candidates
        .iter()
        .min_by(|a, b| a.priority.cmp(&b.priority).then(a.index.cmp(&b.index)))
        .expect("non-empty")
        .index
}

fn round_robin(candidates: &[Candidate], state: &SelectorState) -> usize {
    let mut sorted: Vec<_> = candidates.to_vec();
    sorted.sort_by_key(|c| c.index);
    let cursor = state.round_robin_cursor.fetch_add(1, Ordering::Relaxed);
    sorted[cursor % sorted.len()].index
}

fn random(candidates: &[Candidate]) -> usize {
    let mut rng = rand::thread_rng();
    let i = rng.gen_range(0..candidates.len());
    candidates[i].index
}

fn least_queries(candidates: &[Candidate]) -> usize {
    candidates
        .iter()
        .min_by(|a, b| {
            a.in_flight
                .cmp(&b.in_flight)
                .then(a.weight.cmp(&b.weight).reverse())
                .then(a.index.cmp(&b.index))
        })
        .expect("non-empty")
        .index
}
