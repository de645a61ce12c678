//! Hierarchical Navigable Small World (HNSW) approximate nearest neighbor
//! index over dense integer labels.
//!
//! The graph uses a Struct-of-Arrays (SoA) layout for cache-friendly
//! access: all vector floats are stored contiguously in an arena, with
//! separate arrays for neighbor lists, layer assignments, and tombstone
//! flags. Labels are assigned densely by the vector layer and double as
//! node indices; deleted labels remain in the graph as tombstones until
//! the next rebuild.

/// Distance spaces and the distance-to-score mapping.
pub mod distance;
/// HNSW graph structure, configuration, and data storage.
pub mod graph;
/// HNSW insertion algorithm with bidirectional connections and heuristic pruning.
pub mod insert;
/// HNSW search: single-layer search and multi-layer KNN with tombstone over-fetch.
pub mod search;
/// Snapshot serialization with CRC32 integrity footer.
pub mod snapshot;

pub use distance::DistanceSpace;
pub use graph::{HnswConfig, HnswIndex};
