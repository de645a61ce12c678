//! External collaborator interfaces.
//!
//! The engine depends on two capability traits wired at construction:
//! an [`Embedder`] for the semantic path and an optional [`DocumentStore`]
//! for hydrating search results into full documents. Concrete
//! implementations live outside this crate.

use crate::error::{Error, Result};
use serde_json::Value;

/// Text-to-vector embedding model.
///
/// Implementations must be idempotent over identical input text and
/// return vectors of exactly `dim()` elements.
pub trait Embedder: Send + Sync {
    /// Embedding dimensionality.
    fn dim(&self) -> usize;

    /// Embed a single text. Fails with [`Error::EmbeddingFailed`] on
    /// model errors.
    fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Embed a batch of texts, invoking `on_progress(done, total)` after
    /// each completed item when supplied.
    fn embed_batch(
        &self,
        texts: &[&str],
        on_progress: Option<&dyn Fn(usize, usize)>,
    ) -> Result<Vec<Vec<f32>>> {
        let total = texts.len();
        let mut out = Vec::with_capacity(total);
        for (i, text) in texts.iter().enumerate() {
            out.push(self.embed(text)?);
            if let Some(cb) = on_progress {
                cb(i + 1, total);
            }
        }
        Ok(out)
    }
}

/// A write operation accepted by [`DocumentStore::bulk_write`].
#[derive(Debug, Clone)]
pub enum StoreOp {
    Put { key: String, value: Value },
    Delete { key: String },
}

/// Outer document store for arbitrary JSON values.
pub trait DocumentStore: Send + Sync {
    fn put(&self, key: &str, value: &Value) -> Result<()>;
    fn get(&self, key: &str) -> Result<Option<Value>>;
    fn delete(&self, key: &str) -> Result<()>;

    fn bulk_write(&self, ops: &[StoreOp]) -> Result<()> {
        for op in ops {
            match op {
                StoreOp::Put { key, value } => self.put(key, value)?,
                StoreOp::Delete { key } => self.delete(key)?,
            }
        }
        Ok(())
    }

    /// Point-in-time snapshot of the store contents.
    fn snapshot(&self) -> Result<Value>;

    fn keys(&self) -> Result<Vec<String>>;
}

/// Validates that an embedder-produced vector matches the expected
/// dimension, converting disagreement into [`Error::DimensionMismatch`].
pub fn check_embedding_dim(vector: &[f32], expected: usize) -> Result<()> {
    if vector.len() != expected {
        return Err(Error::DimensionMismatch {
            expected,
            actual: vector.len(),
        });
    }
    Ok(())
}
