//! HNSW graph structure and configuration.
//!
//! [`HnswConfig`] defines tuning parameters (M, ef_construction, ef_search,
//! distance space, capacity, seed). [`HnswIndex`] stores the graph using a
//! Struct-of-Arrays layout: all vector floats live in one contiguous arena,
//! with parallel arrays for neighbor lists, layer assignments, and
//! tombstone flags.

use crate::config;
use crate::error::{Error, Result};
use crate::hnsw::distance::DistanceSpace;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// Configuration parameters for an HNSW index.
///
/// Controls the trade-off between build speed, search speed, recall, and
/// memory usage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HnswConfig {
    /// Vector dimensionality.
    pub dim: usize,
    /// Distance space for similarity computation.
    pub space: DistanceSpace,
    /// Number of bidirectional links per node (except layer 0, which uses `m_max0`).
    pub m: usize,
    /// Maximum links per node at layer 0 (typically `2 * m`).
    pub m_max0: usize,
    /// Candidate list size during index construction.
    pub ef_construction: usize,
    /// Candidate list size during search (higher = better recall, slower).
    pub ef_search: usize,
    /// Maximum number of layers in the graph.
    pub max_layers: usize,
    /// Soft capacity; doubled automatically at 80% occupancy.
    pub max_elements: usize,
    /// Seed for deterministic layer assignment.
    pub seed: u64,
}

impl HnswConfig {
    /// Default configuration for the given dimension and space.
    pub fn new(dim: usize, space: DistanceSpace) -> Self {
        Self {
            dim,
            space,
            m: config::HNSW_DEFAULT_M,
            m_max0: config::HNSW_DEFAULT_M * 2,
            ef_construction: config::HNSW_DEFAULT_EF_CONSTRUCTION,
            ef_search: config::HNSW_DEFAULT_EF_SEARCH,
            max_layers: config::HNSW_DEFAULT_MAX_LAYERS,
            max_elements: config::HNSW_DEFAULT_MAX_ELEMENTS,
            seed: 0,
        }
    }
}

/// HNSW index using a Struct-of-Arrays (SoA) layout.
///
/// Labels are dense: the label of a node equals its index in every
/// parallel array, and `add` requires `label == node_count`.
#[derive(Debug, Serialize, Deserialize)]
pub struct HnswIndex {
    pub config: HnswConfig,
    /// Vector arena: `dim` floats per node, contiguous.
    pub vectors: Vec<f32>,
    /// Graph structure: `[node][layer][neighbor_ids]`.
    pub neighbors: Vec<Vec<Vec<u32>>>,
    /// Layer assignment per node.
    pub layers: Vec<u8>,
    /// Tombstone flags per node.
    pub deleted: Vec<bool>,
    pub entry_point: Option<u32>,
    pub max_layer: usize,
    pub node_count: u32,
}

impl HnswIndex {
    /// Creates a new empty HNSW index with the given configuration.
    pub fn new(config: HnswConfig) -> Self {
        Self {
            config,
            vectors: Vec::new(),
            neighbors: Vec::new(),
            layers: Vec::new(),
            deleted: Vec::new(),
            entry_point: None,
            max_layer: 0,
            node_count: 0,
        }
    }

    /// Returns the number of non-deleted nodes in the index.
    pub fn active_count(&self) -> usize {
        self.deleted.iter().filter(|&&d| !d).count()
    }

    /// Returns the total number of nodes, tombstones included.
    pub fn len(&self) -> usize {
        self.node_count as usize
    }

    /// Returns `true` if the index contains no nodes at all.
    pub fn is_empty(&self) -> bool {
        self.node_count == 0
    }

    /// Deterministic layer for a new label using the exponential
    /// distribution of the HNSW paper, seeded by `(config.seed, label)`.
    pub fn level_for_label(&self, label: u64) -> usize {
        let mut rng = StdRng::seed_from_u64(self.config.seed ^ label.wrapping_mul(0x9E37_79B9_7F4A_7C15));
        let ml = 1.0 / (self.config.m as f64).ln();
        let r: f64 = rng.gen_range(f64::EPSILON..1.0);
        let level = (-r.ln() * ml).floor() as usize;
        level.min(self.config.max_layers - 1)
    }

    /// Get the vector slice for a node. O(1) slice into the arena.
    #[inline]
    pub fn vector(&self, id: u32) -> &[f32] {
        let start = id as usize * self.config.dim;
        &self.vectors[start..start + self.config.dim]
    }

    /// Returns `true` if the node has been tombstoned.
    #[inline]
    pub fn is_deleted(&self, id: u32) -> bool {
        self.deleted[id as usize]
    }

    /// Mark a label as deleted. Returns `true` if the label was in bounds.
    pub fn mark_deleted(&mut self, label: u64) -> bool {
        let idx = label as usize;
        if idx < self.deleted.len() {
            self.deleted[idx] = true;
            true
        } else {
            false
        }
    }

    /// Adjust the search-time candidate list size.
    pub fn set_ef(&mut self, ef: usize) {
        self.config.ef_search = ef.max(1);
    }

    /// Validate vector length and zero-norm constraints for this space.
    pub fn check_vector(&self, vector: &[f32]) -> Result<()> {
        if vector.len() != self.config.dim {
            return Err(Error::DimensionMismatch {
                expected: self.config.dim,
                actual: vector.len(),
            });
        }
        if self.config.space.requires_normalization()
            && vector.iter().all(|&x| x.abs() <= f32::EPSILON)
        {
            return Err(Error::ZeroVector {
                space: self.config.space.as_str(),
            });
        }
        Ok(())
    }

    /// Grow capacity ahead of an insert: doubles `max_elements` once the
    /// graph is 80% full. Fails with `CapacityExceeded` when doubling
    /// cannot make room.
    pub(crate) fn ensure_capacity(&mut self) -> Result<()> {
        let count = self.node_count as usize;
        let threshold =
            (self.config.max_elements as f64 * config::HNSW_GROWTH_THRESHOLD) as usize;
        if count >= threshold {
            match self.config.max_elements.checked_mul(2) {
                Some(doubled) => {
                    tracing::debug!(
                        from = self.config.max_elements,
                        to = doubled,
                        "growing hnsw capacity"
                    );
                    self.config.max_elements = doubled;
                    self.vectors
                        .reserve(doubled.saturating_sub(count).saturating_mul(self.config.dim));
                }
                None => {
                    return Err(Error::CapacityExceeded {
                        count,
                        max_elements: self.config.max_elements,
                    })
                }
            }
        }
        if count >= self.config.max_elements || count >= u32::MAX as usize {
            return Err(Error::CapacityExceeded {
                count,
                max_elements: self.config.max_elements,
            });
        }
        Ok(())
    }

    /// Validate internal invariants after deserialization.
    ///
    /// Checks that all parallel arrays have consistent lengths, that the
    /// entry point and every neighbor id are in bounds, and that the
    /// vector arena matches `node_count * dim`.
    pub fn validate(&self) -> Result<()> {
        let nc = self.node_count as usize;
        let dim = self.config.dim;

        if self.vectors.len() != nc * dim {
            return Err(Error::InconsistentMetadata(format!(
                "vector arena length {} != node_count({nc}) * dim({dim})",
                self.vectors.len()
            )));
        }
        if self.neighbors.len() != nc {
            return Err(Error::InconsistentMetadata(format!(
                "neighbors length {} != node_count {nc}",
                self.neighbors.len()
            )));
        }
        if self.layers.len() != nc {
            return Err(Error::InconsistentMetadata(format!(
                "layers length {} != node_count {nc}",
                self.layers.len()
            )));
        }
        if self.deleted.len() != nc {
            return Err(Error::InconsistentMetadata(format!(
                "deleted length {} != node_count {nc}",
                self.deleted.len()
            )));
        }
        if let Some(ep) = self.entry_point {
            if ep as usize >= nc {
                return Err(Error::InconsistentMetadata(format!(
                    "entry_point {ep} >= node_count {nc}"
                )));
            }
        }
        for (node_id, node_neighbors) in self.neighbors.iter().enumerate() {
            for (layer, layer_neighbors) in node_neighbors.iter().enumerate() {
                for &neighbor in layer_neighbors {
                    if neighbor as usize >= nc {
                        return Err(Error::InconsistentMetadata(format!(
                            "neighbor {neighbor} out of bounds (node_count={nc}) \
                             at node {node_id} layer {layer}"
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}
