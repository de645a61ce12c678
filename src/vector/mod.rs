//! Vector layer: durable sidecar store, crash-safe generation publishing,
//! and the composed vector index.
//!
//! The sidecar database is the canonical truth of which documents exist;
//! the HNSW graph is a rebuildable acceleration structure published
//! atomically through generation files.

/// Atomic, crash-safe publishing of index generations.
pub mod generation;
/// Composed vector index: sidecar + HNSW + generations.
pub mod layer;
/// Durable doc_id ↔ label ↔ vector map.
pub mod sidecar;

pub use generation::GenerationManager;
pub use layer::{SearchOptions, UpsertOutcome, VectorConfig, VectorHit, VectorLayer, VectorStats};
pub use sidecar::{SidecarStats, SidecarStore};
