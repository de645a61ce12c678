//! HNSW insertion algorithm.
//!
//! Inserts a vector into the HNSW graph with bidirectional connections and
//! heuristic neighbor pruning (Algorithm 4 from the HNSW paper). Labels
//! are dense, so `add` requires `label == node_count` before the call.

use crate::error::Result;
use crate::hnsw::graph::HnswIndex;
use crate::hnsw::search::{search_layer, TraversalScratch};
use std::cell::RefCell;

thread_local! {
    /// Thread-local traversal scratch for insert operations.
    /// Eliminates per-insert allocation on large graphs.
    static INSERT_SCRATCH: RefCell<TraversalScratch> =
        RefCell::new(TraversalScratch::default());
}

impl HnswIndex {
    /// Add a point to the graph under the given dense label.
    ///
    /// Validates dimension and zero-norm constraints, doubles capacity at
    /// 80% occupancy, then wires the node into every layer up to its
    /// assigned level.
    pub fn add(&mut self, vector: &[f32], label: u64) -> Result<()> {
        self.check_vector(vector)?;
        self.ensure_capacity()?;
        debug_assert_eq!(
            label, self.node_count as u64,
            "labels are dense: expected next label {}",
            self.node_count
        );

        let internal_id = self.node_count;
        let level = self.level_for_label(label);

        // First node: push SoA fields and become the entry point.
        if self.entry_point.is_none() {
            self.vectors.extend_from_slice(vector);
            self.neighbors.push(vec![Vec::new(); level + 1]);
            self.layers.push(level as u8);
            self.deleted.push(false);
            self.node_count += 1;
            self.entry_point = Some(internal_id);
            self.max_layer = level;
            return Ok(());
        }

        let entry_point = self.entry_point.expect("entry_point checked above");
        let top = level.min(self.max_layer);

        // Phases 1 & 2 borrow &self through search_layer, so the scratch
        // lives outside the index.
        let node_neighbors = INSERT_SCRATCH.with(|cell| {
            let mut scratch = cell.borrow_mut();

            let mut current_ep = entry_point;
            let no_filter = |_: u32| true;

            // Phase 1: greedy descent from the top layer to level + 1.
            for layer in (level + 1..=self.max_layer).rev() {
                let results = search_layer(
                    self,
                    vector,
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

            // Phase 2: collect candidate neighbors on each layer the new
            // node participates in.
            let mut node_neighbors: Vec<Vec<u32>> = vec![Vec::new(); level + 1];
            let mut layer_eps: Vec<u32> = vec![current_ep];
            for layer in (0..=top).rev() {
                let candidates = search_layer(
                    self,
                    vector,
                    &layer_eps,
                    self.config.ef_construction,
                    layer,
                    &mut scratch,
                    &no_filter,
                );

                let m_max = if layer == 0 {
                    self.config.m_max0
                } else {
                    self.config.m
                };
                let selected = select_neighbors_heuristic(self, &candidates, m_max);
                node_neighbors[layer] = selected.iter().map(|&(_, id)| id).collect();

                layer_eps.clear();
                layer_eps.extend(candidates.iter().map(|&(_, id)| id));
                if layer_eps.is_empty() {
                    layer_eps.push(entry_point);
                }
            }

            node_neighbors
        });

        // Push the new node's SoA fields.
        self.vectors.extend_from_slice(vector);
        self.neighbors.push(node_neighbors);
        self.layers.push(level as u8);
        self.deleted.push(false);
        self.node_count += 1;

        // Phase 3: bidirectional connections with over-capacity pruning.
        let space = self.config.space;
        for layer in 0..=top {
            let m_max = if layer == 0 {
                self.config.m_max0
            } else {
                self.config.m
            };

            let my_neighbors: Vec<u32> = self.neighbors[internal_id as usize][layer].clone();
            for &neighbor_id in &my_neighbors {
                let nid = neighbor_id as usize;

                while self.neighbors[nid].len() <= layer {
                    self.neighbors[nid].push(Vec::new());
                }
                self.neighbors[nid][layer].push(internal_id);

                if self.neighbors[nid][layer].len() > m_max {
                    let neighbor_ids: Vec<u32> = self.neighbors[nid][layer].clone();
                    let candidates: Vec<(f32, u32)> = neighbor_ids
                        .iter()
                        .map(|&cid| {
                            let dist =
                                space.distance(self.vector(neighbor_id), self.vector(cid));
                            (dist, cid)
                        })
                        .collect();
                    let pruned = select_neighbors_heuristic(self, &candidates, m_max);
                    self.neighbors[nid][layer] = pruned.iter().map(|&(_, id)| id).collect();
                }
            }
        }

        if level > self.max_layer {
            self.max_layer = level;
            self.entry_point = Some(internal_id);
        }
        Ok(())
    }
}

/// Heuristic neighbor selection (Algorithm 4 from the HNSW paper).
///
/// Prefers diverse neighbors: a candidate is selected only if it is closer
/// to the base node than to any already-selected neighbor. This avoids
/// redundant clusters of near-identical neighbors and keeps the graph
/// connected, especially in cosine space.
fn select_neighbors_heuristic(
    index: &HnswIndex,
    candidates: &[(f32, u32)],
    m: usize,
) -> Vec<(f32, u32)> {
    let mut sorted = candidates.to_vec();
    sorted.sort_unstable_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));

    let space = index.config.space;
    let mut selected: Vec<(f32, u32)> = Vec::with_capacity(m);

    for &(dist_to_base, cid) in &sorted {
        if selected.len() >= m {
            break;
        }
        let cid_vec = index.vector(cid);
        let is_diverse = selected.iter().all(|&(_, sid)| {
            let dist_to_selected = space.distance(cid_vec, index.vector(sid));
            dist_to_base <= dist_to_selected
        });
        if is_diverse {
            selected.push((dist_to_base, cid));
        }
    }

    // If the heuristic left slots empty, fill with closest unused candidates.
    if selected.len() < m {
        let selected_ids: std::collections::HashSet<u32> =
            selected.iter().map(|&(_, id)| id).collect();
        for &(dist, cid) in &sorted {
            if selected.len() >= m {
                break;
            }
            if !selected_ids.contains(&cid) {
                selected.push((dist, cid));
            }
        }
    }

    selected
}
