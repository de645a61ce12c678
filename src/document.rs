//! Core document types for tridex.
//!
//! A `Document` is the caller-visible unit of indexing: an opaque id, a
//! collection partition, text content, a nested attribute tree, and an
//! optional precomputed embedding. Attributes feed the structural index;
//! content feeds the full-text index and, after embedding, the vector
//! layer.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A caller-supplied document to be indexed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    /// Opaque identifier, unique within its collection.
    pub id: String,
    /// Collection partition (e.g. "articles").
    pub collection: String,
    /// Text content, indexed by the full-text layer and embedded for
    /// the vector layer.
    pub content: String,
    /// Nested attribute tree walked by the structural index.
    #[serde(default)]
    pub attributes: Map<String, Value>,
    /// Optional precomputed embedding; when absent the coordinator asks
    /// the external embedder for one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vector: Option<Vec<f32>>,
}

impl Document {
    /// Creates a document with empty attributes and no precomputed vector.
    pub fn new(
        id: impl Into<String>,
        collection: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            collection: collection.into(),
            content: content.into(),
            attributes: Map::new(),
            vector: None,
        }
    }

    /// Builder-style attribute insertion.
    pub fn with_attribute(mut self, path: impl Into<String>, value: Value) -> Self {
        self.attributes.insert(path.into(), value);
        self
    }

    /// Builder-style precomputed embedding.
    pub fn with_vector(mut self, vector: Vec<f32>) -> Self {
        self.vector = Some(vector);
        self
    }

    /// The composite key used by the vector and structural layers.
    pub fn composite_key(&self) -> String {
        composite_key(&self.collection, &self.id)
    }
}

/// Builds the composite `"collection:id"` key.
pub fn composite_key(collection: &str, id: &str) -> String {
    format!("{collection}:{id}")
}

/// Splits a composite `"collection:id"` key back into its parts.
/// Keys without a separator are treated as an id in the default collection.
pub fn split_composite_key(key: &str) -> (&str, &str) {
    match key.split_once(':') {
        Some((collection, id)) => (collection, id),
        None => ("", key),
    }
}
