//! Crate-wide error taxonomy.
//!
//! Fatal errors always leave the last durable state intact: `CURRENT` is
//! never advanced unless the new generation is complete, and partial index
//! failures are reported rather than silently dropped.

use thiserror::Error;

/// Result alias for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Bit assigned to the structural layer in [`Error::PartialIndex`] masks.
pub const LAYER_STRUCTURAL: u8 = 1 << 0;
/// Bit assigned to the full-text layer in [`Error::PartialIndex`] masks.
pub const LAYER_FULLTEXT: u8 = 1 << 1;
/// Bit assigned to the vector layer in [`Error::PartialIndex`] masks.
pub const LAYER_VECTOR: u8 = 1 << 2;

/// Errors surfaced by the engine.
#[derive(Debug, Error)]
pub enum Error {
    /// Vector length differs from the configured dimension.
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// A zero-norm vector was submitted for an inner-product or cosine space.
    #[error("zero vector rejected for {space} space")]
    ZeroVector { space: &'static str },

    /// The HNSW graph could not grow to accommodate another point.
    #[error("index capacity exceeded: {count} points at max_elements {max_elements}")]
    CapacityExceeded { count: usize, max_elements: usize },

    /// Operation invoked before `initialize()`.
    #[error("coordinator not initialized")]
    NotInitialized,

    /// Persisted index metadata disagrees with the runtime configuration.
    #[error("inconsistent index metadata: {0}")]
    InconsistentMetadata(String),

    /// All generation-publish strategies were exhausted.
    #[error("index persistence failed: {0}")]
    PersistenceFailed(String),

    /// Another process holds the advisory write lock.
    #[error("write lock held: {0}")]
    LockHeld(String),

    /// One or more index layers failed during a write.
    /// `failed` is a bitmask of [`LAYER_STRUCTURAL`] / [`LAYER_FULLTEXT`] /
    /// [`LAYER_VECTOR`].
    #[error("partial index failure (layer mask {failed:#04b}): {detail}")]
    PartialIndex { failed: u8, detail: String },

    /// The external embedder surfaced an error.
    #[error("embedding failed: {0}")]
    EmbeddingFailed(String),

    /// A query or write exceeded its deadline.
    #[error("operation timed out")]
    TimedOut,

    /// A stored value could not be decoded.
    #[error("invalid stored value: {0}")]
    InvalidStoredValue(String),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("document store error: {0}")]
    DocumentStore(String),
}

impl Error {
    /// Returns `true` when the error is worth retrying with backoff
    /// (transient I/O during index publication).
    pub fn is_transient_io(&self) -> bool {
        matches!(
            self,
            Error::Io(e) if matches!(
                e.kind(),
                std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::TimedOut
            )
        )
    }
}
