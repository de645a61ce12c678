//! Global configuration constants for tridex.
//!
//! All tuning parameters and retry/retention defaults are defined here.
//! Runtime configuration is handled by the `*Config` structs on the
//! individual layers.

/// Default number of bidirectional links per HNSW node.
///
/// Higher values improve recall but increase memory and build time.
/// Typical range: 8–64. Default: 16.
pub const HNSW_DEFAULT_M: usize = 16;

/// Default ef parameter during HNSW index construction.
///
/// Controls the size of the dynamic candidate list during insertion.
/// Higher values produce a better graph but slow down build time.
pub const HNSW_DEFAULT_EF_CONSTRUCTION: usize = 200;

/// Default ef parameter during HNSW search.
///
/// Controls the size of the dynamic candidate list during query.
/// Higher values improve recall at the cost of latency.
pub const HNSW_DEFAULT_EF_SEARCH: usize = 50;

/// Maximum number of layers in the HNSW graph.
pub const HNSW_DEFAULT_MAX_LAYERS: usize = 16;

/// Default initial capacity of the HNSW graph.
pub const HNSW_DEFAULT_MAX_ELEMENTS: usize = 10_000;

/// Occupancy fraction at which the HNSW capacity is doubled before insert.
pub const HNSW_GROWTH_THRESHOLD: f64 = 0.8;

/// Vectors whose L2 norm deviates from 1.0 by more than this are
/// re-normalized before insert/query in inner-product and cosine spaces.
pub const NORMALIZATION_TOLERANCE: f32 = 1e-2;

/// Tombstone ratio above which `maintenance()` triggers an index rebuild.
pub const TOMBSTONE_REBUILD_RATIO: f64 = 0.3;

/// Number of recent index generations retained after a publish.
pub const GENERATION_RETAIN_COUNT: usize = 3;

/// Backoff schedule (milliseconds) for transient I/O failures during
/// index publication. Exhausting the schedule escalates the error.
pub const PUBLISH_BACKOFF_MS: [u64; 5] = [10, 20, 50, 100, 200];

/// Default per-source weights for parallel (late) fusion:
/// structural, full-text, semantic.
pub const FUSION_DEFAULT_WEIGHTS: (f32, f32, f32) = (0.3, 0.3, 0.4);

/// Candidate pool floor for the semantic-first strategy.
pub const SEMANTIC_FIRST_MIN_K: usize = 100;

/// Maximum entries in the query-embedding cache (insertion-order eviction).
pub const EMBED_CACHE_CAP: usize = 100;

/// Approximate snippet window size in tokens.
pub const SNIPPET_TOKENS: u32 = 30;

/// Default opening/closing tags wrapped around snippet highlights.
pub const SNIPPET_OPEN_TAG: &str = "<b>";
/// Closing tag counterpart of [`SNIPPET_OPEN_TAG`].
pub const SNIPPET_CLOSE_TAG: &str = "</b>";
/// Ellipsis marker used at truncated snippet boundaries.
pub const SNIPPET_ELLIPSIS: &str = "…";

/// Maximum nesting depth walked during structural field extraction.
pub const STRUCTURAL_MAX_DEPTH: usize = 3;

/// Default interval (in seconds) between automatic index saves. 0 = disabled.
pub const DEFAULT_AUTOSAVE_INTERVAL_SECS: u64 = 300;

/// Default number of operations drained per `bulk_write` batch.
pub const BULK_WRITE_BATCH_SIZE: usize = 100;
