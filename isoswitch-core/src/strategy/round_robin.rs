//! Priority-aware weighted round robin.
//!
//! Only the highest priority tier present in a snapshot is eligible; lower
//! tiers act as failover. Within the tier each candidate gets
//! `max(1, weight)` slots in a cycle that interleaves candidates instead of
//! emitting bursts:
//!
//! 1. every candidate not yet placed, in snapshot order
//! 2. else the candidate with the most remaining slots that differs from the
//!    previous pick
//! 3. else any candidate with remaining slots
//!
//! The cycle is cached per snapshot version. The hot path is a lock-free
//! load and version compare; a rebuild takes a short mutex and re-checks.

use arc_swap::ArcSwapOption;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::trace;

use crate::candidates::{Candidate, VersionedCandidates};
use crate::error::{GatewayError, Result};

#[derive(Debug)]
struct WeightedCycle {
    version: u64,
    candidates: usize,
    /// Indices into the snapshot's item list
    order: Vec<usize>,
}

impl WeightedCycle {
    fn matches<T>(&self, snapshot: &VersionedCandidates<T>) -> bool {
        self.version == snapshot.version() && self.candidates == snapshot.len()
    }

    fn build<T: Candidate>(snapshot: &VersionedCandidates<T>) -> Self {
        let items = snapshot.items();
        let top = items.iter().map(Candidate::priority).max().unwrap_or(0);
        let tier: Vec<usize> = items
            .iter()
            .enumerate()
            .filter(|(_, c)| c.priority() == top)
            .map(|(i, _)| i)
            .collect();

        let mut remaining: Vec<u32> = tier.iter().map(|&i| items[i].weight().max(1)).collect();
        let total: usize = remaining.iter().map(|&w| w as usize).sum();
        let mut placed = vec![false; tier.len()];
        let mut order = Vec::with_capacity(total);
        let mut prev: Option<usize> = None;

        while order.len() < total {
            let pick = placed
                .iter()
                .position(|done| !done)
                .or_else(|| {
                    let mut best: Option<usize> = None;
                    for (pos, &left) in remaining.iter().enumerate() {
                        if left == 0 || Some(pos) == prev {
                            continue;
                        }
                        if best.map_or(true, |b| left > remaining[b]) {
                            best = Some(pos);
                        }
                    }
                    best
                })
                .or_else(|| remaining.iter().position(|&left| left > 0));

            let Some(pos) = pick else { break };
            placed[pos] = true;
            remaining[pos] -= 1;
            prev = Some(pos);
            order.push(tier[pos]);
        }

        Self {
            version: snapshot.version(),
            candidates: snapshot.len(),
            order,
        }
    }
}

/// Weighted round robin with failover tiers.
#[derive(Debug, Default)]
pub struct RoundRobin {
    cycle: ArcSwapOption<WeightedCycle>,
    rebuild: Mutex<()>,
    cursor: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next<T>(&self, snapshot: &VersionedCandidates<T>) -> Result<T>
    where
        T: Candidate + Clone,
    {
        if snapshot.is_empty() {
            return Err(GatewayError::NoCandidates);
        }

        let cycle = self.cycle_for(snapshot);
        if cycle.order.is_empty() {
            return Err(GatewayError::NoCandidates);
        }

        let n = self.cursor.fetch_add(1, Ordering::Relaxed);
        let index = cycle.order[n % cycle.order.len()];
        Ok(snapshot.items()[index].clone())
    }

    fn cycle_for<T: Candidate>(&self, snapshot: &VersionedCandidates<T>) -> Arc<WeightedCycle> {
        if let Some(cycle) = self.cycle.load_full() {
            if cycle.matches(snapshot) {
                return cycle;
            }
        }

        let _guard = self.rebuild.lock();
        if let Some(cycle) = self.cycle.load_full() {
            if cycle.matches(snapshot) {
                return cycle;
            }
        }

        let cycle = Arc::new(WeightedCycle::build(snapshot));
        trace!(
            version = cycle.version,
            slots = cycle.order.len(),
            "[RoundRobin] Rebuilt weighted cycle"
        );
        self.cursor.store(0, Ordering::Relaxed);
        self.cycle.store(Some(Arc::clone(&cycle)));
        cycle
    }
}
