//! # tridex
//!
//! Embeddable hybrid retrieval engine: an HNSW approximate-nearest-
//! neighbor index backed by a durable sidecar store, a ranked full-text
//! index, and a structural field index, unified behind one query planner
//! with crash-safe generation publishing.
//!
//! This is a core library crate with zero async dependencies — parallel
//! work runs on scoped threads, and all blocking storage sits behind the
//! [`IndexCoordinator`] write path.

/// Global configuration constants: limits, defaults, and tuning parameters.
pub mod config;
/// Public engine surface: put/delete/query across all index layers.
pub mod coordinator;
/// Core document types: `Document` and composite-key helpers.
pub mod document;
/// Crate-wide error taxonomy and result alias.
pub mod error;
/// External collaborator interfaces: embedder and document store.
pub mod external;
/// Ranked full-text index with phrase, CJK, and snippet support.
pub mod fulltext;
/// HNSW approximate nearest neighbor index: graph, search, insertion, distances.
pub mod hnsw;
/// Hybrid query planner: three strategies and weighted late fusion.
pub mod planner;
/// Structural index: inverted (field, value) → doc_id mapping.
pub mod structural;
/// Vector layer: sidecar store, generation manager, composed index.
pub mod vector;

pub use coordinator::{BulkSummary, CoordinatorConfig, IndexCoordinator, PutOptions, WriteOp};
pub use document::Document;
pub use error::{Error, Result};
pub use external::{DocumentStore, Embedder, StoreOp};
pub use hnsw::DistanceSpace;
pub use planner::{
    HybridStrategy, SearchRequest, SearchResponse, SearchResult, SemanticQuery,
};
pub use planner::fusion::FusionWeights;
pub use vector::{VectorConfig, VectorLayer};
