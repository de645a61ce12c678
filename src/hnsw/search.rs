//! HNSW search: single-layer search and multi-layer KNN.
//!
//! `knn` over-fetches `min(2k, node_count)` candidates so callers can
//! filter tombstones and still return k live hits when available.
//! Supports an optional predicate `Fn(u32) -> bool` applied during
//! traversal; filtered nodes still navigate but never surface in results.
//!
//! Traversal state lives in a reusable [`TraversalScratch`]: visited
//! stamps are compared against an epoch that advances on every layer
//! pass, so resetting between passes is O(1) instead of a memset over
//! the whole graph.

use crate::hnsw::graph::HnswIndex;
use ordered_float::OrderedFloat;
use std::collections::BinaryHeap;

/// Reusable traversal scratch: one stamp slot per graph node plus the
/// current epoch. A node is "visited" when its slot equals the epoch, so
/// starting a new pass only bumps the counter. The stamp array is grown
/// lazily as labels are appended to the graph.
#[derive(Debug, Default)]
pub(crate) struct TraversalScratch {
    stamps: Vec<u32>,
    epoch: u32,
}

impl TraversalScratch {
    /// Start a pass over a graph of `nodes` points: grow the stamp array
    /// if the graph grew since the last pass and advance the epoch. The
    /// full memset happens only on epoch wrap.
    fn begin(&mut self, nodes: usize) {
        if nodes > self.stamps.len() {
            self.stamps.resize(nodes, 0);
        }
        if self.epoch == u32::MAX {
            self.stamps.fill(0);
            self.epoch = 1;
        } else {
            self.epoch += 1;
        }
    }

    /// Stamp `id` for the current pass. Returns `true` on the first
    /// visit within this pass.
    #[inline]
    fn first_visit(&mut self, id: u32) -> bool {
        let slot = &mut self.stamps[id as usize];
        if *slot == self.epoch {
            false
        } else {
            *slot = self.epoch;
            true
        }
    }
}

/// A traversal candidate: (negative distance, internal_id).
/// BinaryHeap is a max-heap; negative distance yields min-heap behavior.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Candidate {
    neg_distance: OrderedFloat<f32>,
    id: u32,
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.neg_distance.cmp(&other.neg_distance)
    }
}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// A result entry: (distance, internal_id). Max-heap by distance so the
/// worst survivor is cheap to evict.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ResultEntry {
    distance: OrderedFloat<f32>,
    id: u32,
}

impl Ord for ResultEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.distance.cmp(&other.distance)
    }
}

impl PartialOrd for ResultEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Search a single layer of the HNSW graph.
///
/// Returns the `ef` closest non-deleted nodes to the query at the given
/// layer, ascending by distance. `scratch` is reset (epoch bump) at the
/// start of each call.
pub(crate) fn search_layer<F: Fn(u32) -> bool>(
    index: &HnswIndex,
    query: &[f32],
    entry_points: &[u32],
    ef: usize,
    layer: usize,
    scratch: &mut TraversalScratch,
    filter_fn: &F,
) -> Vec<(f32, u32)> {
    scratch.begin(index.node_count as usize);
    let space = index.config.space;
    let mut candidates: BinaryHeap<Candidate> = BinaryHeap::with_capacity(ef * 2);
    let mut results: BinaryHeap<ResultEntry> = BinaryHeap::with_capacity(ef + 1);
    // Cached worst distance avoids repeated heap peeks in the hot loop.
    let mut worst_dist = f32::MAX;

    for &ep in entry_points {
        if scratch.first_visit(ep) {
            let dist = space.distance(query, index.vector(ep));
            candidates.push(Candidate {
                neg_distance: OrderedFloat(-dist),
                id: ep,
            });
            if !index.is_deleted(ep) && filter_fn(ep) {
                results.push(ResultEntry {
                    distance: OrderedFloat(dist),
                    id: ep,
                });
                if results.len() >= ef {
                    worst_dist = results.peek().map_or(f32::MAX, |r| r.distance.0);
                }
            }
        }
    }

    while let Some(candidate) = candidates.pop() {
        let c_dist = -candidate.neg_distance.0;

        // Closest remaining candidate is farther than the worst kept result.
        if results.len() >= ef && c_dist > worst_dist {
            break;
        }

        let node_id = candidate.id as usize;
        if layer >= index.neighbors[node_id].len() {
            continue;
        }

        for &neighbor_id in &index.neighbors[node_id][layer] {
            if !scratch.first_visit(neighbor_id) {
                continue;
            }

            let dist = space.distance(query, index.vector(neighbor_id));
            if results.len() < ef || dist < worst_dist {
                candidates.push(Candidate {
                    neg_distance: OrderedFloat(-dist),
                    id: neighbor_id,
                });
                if !index.is_deleted(neighbor_id) && filter_fn(neighbor_id) {
                    results.push(ResultEntry {
                        distance: OrderedFloat(dist),
                        id: neighbor_id,
                    });
                    if results.len() > ef {
                        results.pop();
                    }
                    worst_dist = results.peek().map_or(f32::MAX, |r| r.distance.0);
                }
            }
        }
    }

    results
        .into_sorted_vec()
        .into_iter()
        .map(|r| (r.distance.0, r.id))
        .collect()
}

impl HnswIndex {
    /// Multi-layer KNN search.
    ///
    /// Internally widens the request to `k_effective = min(2k, node_count)`
    /// so the caller can filter tombstones and still return ≥k live
    /// labels when available. Results are `(label, distance)` ascending
    /// by distance.
    pub fn knn(&self, query: &[f32], k: usize) -> Vec<(u64, f32)> {
        self.knn_filtered(query, k, &|_: u32| true)
    }

    /// KNN with a predicate applied during traversal. Non-matching nodes
    /// are still used for navigation but excluded from results.
    pub fn knn_filtered<F: Fn(u32) -> bool>(
        &self,
        query: &[f32],
        k: usize,
        filter_fn: &F,
    ) -> Vec<(u64, f32)> {
        let entry_point = match self.entry_point {
            Some(ep) => ep,
            None => return Vec::new(),
        };
        let k_effective = (k.saturating_mul(2)).min(self.node_count as usize);
        if k_effective == 0 {
            return Vec::new();
        }

        let mut scratch = TraversalScratch::default();
        let mut current_ep = entry_point;
        let no_filter = |_: u32| true;

        // Greedy descent with ef=1 from the top layer down to layer 1;
        // filtering only matters at layer 0.
        for layer in (1..=self.max_layer).rev() {
            let results = search_layer(
                self,
                query,
                std::slice::from_ref(&current_ep),
                1,
                layer,
                &mut scratch,
                &no_filter,
            );
            if let Some(&(_, nearest)) = results.first() {
                current_ep = nearest;
            }
        }

        let ef = self.config.ef_search.max(k_effective);
        let mut results = search_layer(
            self,
            query,
            std::slice::from_ref(&current_ep),
            ef,
            0,
            &mut scratch,
            filter_fn,
        );

        results.truncate(k_effective);
        results
            .into_iter()
            .map(|(dist, id)| (id as u64, dist))
            .collect()
    }
}
