//! Public engine surface: put/delete/query across all three index layers.
//!
//! The coordinator serializes writes on one logical write path and fans
//! each document out to the structural, full-text, and vector layers in
//! parallel. Structural and full-text failures are fatal to a put;
//! vector failures are logged and tolerated, because the vector path
//! depends on an external embedder that may be transiently unavailable.
//! Such documents score 0 on semantic queries until re-put.
//!
//! The embedder is always invoked outside any index lock; it is expected
//! to be the slowest collaborator.

use crate::config;
use crate::document::{composite_key, Document};
use crate::error::{Error, Result, LAYER_FULLTEXT, LAYER_STRUCTURAL, LAYER_VECTOR};
use crate::external::{DocumentStore, Embedder};
use crate::fulltext::{FullTextConfig, FullTextIndex};
use crate::planner::{QueryPlanner, SearchRequest, SearchResponse};
use crate::structural::StructuralIndex;
use crate::vector::{VectorConfig, VectorLayer, VectorStats};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Directory for all index files.
    pub data_dir: PathBuf,
    /// Vector layer configuration; `None` runs without a vector layer
    /// (semantic queries downgrade to lexical).
    pub vector: Option<VectorConfig>,
    pub fulltext: FullTextConfig,
    /// Auto-save interval; `None` disables the timer.
    pub autosave_interval: Option<Duration>,
}

impl CoordinatorConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            vector: None,
            fulltext: FullTextConfig::default(),
            autosave_interval: Some(Duration::from_secs(
                config::DEFAULT_AUTOSAVE_INTERVAL_SECS,
            )),
        }
    }

    /// Enable the vector layer under `<data_dir>/vectors`.
    pub fn with_vector(mut self, dim: usize, space: crate::hnsw::DistanceSpace) -> Self {
        self.vector = Some(VectorConfig::new(dim, space, self.data_dir.join("vectors")));
        self
    }
}

/// Per-call write options.
#[derive(Debug, Clone, Default)]
pub struct PutOptions {
    /// Reject the write with [`Error::TimedOut`] when already elapsed.
    pub deadline: Option<Instant>,
}

/// One operation in a [`IndexCoordinator::bulk_write`] batch.
#[derive(Debug, Clone)]
pub enum WriteOp {
    Put(Document),
    Delete { collection: String, id: String },
}

/// Summary of a drained bulk batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkSummary {
    pub puts: usize,
    pub deletes: usize,
}

struct Autosave {
    stop: Arc<AtomicBool>,
    handle: std::thread::JoinHandle<()>,
}

/// The engine's public surface.
pub struct IndexCoordinator {
    structural: Arc<StructuralIndex>,
    fulltext: Arc<FullTextIndex>,
    vector: Option<Arc<VectorLayer>>,
    embedder: Option<Arc<dyn Embedder>>,
    store: Option<Arc<dyn DocumentStore>>,
    planner: QueryPlanner,
    /// Serializes all writes on one logical path.
    write_mutex: Mutex<()>,
    initialized: AtomicBool,
    autosave_interval: Option<Duration>,
    autosave: Mutex<Option<Autosave>>,
}

impl IndexCoordinator {
    /// Open all storage and indices. Mappings are rehydrated from the
    /// sidecar as part of opening the vector layer. The coordinator
    /// rejects operations until [`initialize`](Self::initialize) runs.
    pub fn open(
        config: CoordinatorConfig,
        embedder: Option<Arc<dyn Embedder>>,
        store: Option<Arc<dyn DocumentStore>>,
    ) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;
        let structural = Arc::new(StructuralIndex::open(
            &config.data_dir.join("structural.db"),
        )?);
        let fulltext = Arc::new(FullTextIndex::open(
            &config.data_dir.join("fulltext.db"),
            config.fulltext.clone(),
        )?);
        let vector = match &config.vector {
            Some(vector_config) => Some(Arc::new(VectorLayer::open(vector_config.clone())?)),
            None => None,
        };

        let planner = QueryPlanner::new(
            Arc::clone(&structural),
            Arc::clone(&fulltext),
            vector.clone(),
            embedder.clone(),
            store.clone(),
        );

        Ok(Self {
            structural,
            fulltext,
            vector,
            embedder,
            store,
            planner,
            write_mutex: Mutex::new(()),
            initialized: AtomicBool::new(false),
            autosave_interval: config.autosave_interval,
            autosave: Mutex::new(None),
        })
    }

    /// Mark the coordinator ready and install the auto-save timer.
    pub fn initialize(&self) -> Result<()> {
        if self.initialized.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let (Some(interval), Some(vector)) = (self.autosave_interval, self.vector.as_ref()) {
            let stop = Arc::new(AtomicBool::new(false));
            let thread_stop = Arc::clone(&stop);
            let layer = Arc::clone(vector);
            let handle = std::thread::spawn(move || {
                let tick = Duration::from_millis(50).min(interval);
                let mut waited = Duration::ZERO;
                loop {
                    std::thread::sleep(tick);
                    if thread_stop.load(Ordering::SeqCst) {
                        return;
                    }
                    waited += tick;
                    if waited < interval {
                        continue;
                    }
                    waited = Duration::ZERO;
                    if layer.is_dirty() {
                        if let Err(e) = layer.save() {
                            tracing::warn!(error = %e, "auto-save failed");
                        }
                    }
                }
            });
            *self.autosave.lock() = Some(Autosave { stop, handle });
        }
        Ok(())
    }

    fn check_initialized(&self) -> Result<()> {
        if self.initialized.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::NotInitialized)
        }
    }

    /// Index a document across all layers. Waits for every layer before
    /// returning.
    pub fn put(&self, document: &Document) -> Result<()> {
        self.put_with_options(document, &PutOptions::default())
    }

    /// [`put`](Self::put) with per-call options.
    pub fn put_with_options(&self, document: &Document, options: &PutOptions) -> Result<()> {
        self.check_initialized()?;
        if options.deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(Error::TimedOut);
        }
        let key = document.composite_key();

        // Embedding happens before any index lock.
        let embedding = self.resolve_embedding(document);

        if let Some(store) = self.store.as_ref() {
            store.put(&key, &document_json(document))?;
        }

        let _write = self.write_mutex.lock();
        let structural_doc = structural_json(document);
        let metadata = Value::Object(document.attributes.clone());

        let mut failed: u8 = 0;
        let mut details: Vec<String> = Vec::new();
        std::thread::scope(|scope| {
            let structural_task = scope.spawn(|| self.structural.add(&key, &structural_doc));
            let fulltext_task = scope.spawn(|| {
                self.fulltext
                    .add(&document.id, &document.collection, &document.content, &metadata)
            });
            let vector_task = scope.spawn(|| match (&self.vector, &embedding) {
                (Some(vector), Ok(embedding)) => {
                    vector.upsert(&key, embedding, &metadata).map(|_| ())
                }
                (Some(_), Err(e)) => Err(Error::EmbeddingFailed(e.to_string())),
                (None, _) => Ok(()),
            });

            if let Err(e) = join_layer(structural_task) {
                failed |= LAYER_STRUCTURAL;
                details.push(format!("structural: {e}"));
            }
            if let Err(e) = join_layer(fulltext_task) {
                failed |= LAYER_FULLTEXT;
                details.push(format!("fulltext: {e}"));
            }
            if let Err(e) = join_layer(vector_task) {
                failed |= LAYER_VECTOR;
                details.push(format!("vector: {e}"));
            }
        });

        if failed & (LAYER_STRUCTURAL | LAYER_FULLTEXT) != 0 {
            return Err(Error::PartialIndex {
                failed,
                detail: details.join("; "),
            });
        }
        if failed & LAYER_VECTOR != 0 {
            // Tolerated: the document scores 0 on semantic queries until
            // the embedding is supplied by a later put.
            tracing::warn!(key = %key, detail = %details.join("; "), "vector layer skipped for put");
        }
        Ok(())
    }

    /// Remove a document from every layer.
    pub fn delete(&self, collection: &str, id: &str) -> Result<()> {
        self.check_initialized()?;
        let key = composite_key(collection, id);

        if let Some(store) = self.store.as_ref() {
            store.delete(&key)?;
        }

        let _write = self.write_mutex.lock();
        let mut failed: u8 = 0;
        let mut details: Vec<String> = Vec::new();
        std::thread::scope(|scope| {
            let structural_task = scope.spawn(|| self.structural.remove(&key));
            let fulltext_task = scope.spawn(|| self.fulltext.remove(id, collection));
            let vector_task = scope.spawn(|| match &self.vector {
                Some(vector) => vector.delete(&key).map(|_| ()),
                None => Ok(()),
            });

            if let Err(e) = join_layer(structural_task) {
                failed |= LAYER_STRUCTURAL;
                details.push(format!("structural: {e}"));
            }
            if let Err(e) = join_layer(fulltext_task) {
                failed |= LAYER_FULLTEXT;
                details.push(format!("fulltext: {e}"));
            }
            if let Err(e) = join_layer(vector_task) {
                failed |= LAYER_VECTOR;
                details.push(format!("vector: {e}"));
            }
        });

        if failed & (LAYER_STRUCTURAL | LAYER_FULLTEXT) != 0 {
            return Err(Error::PartialIndex {
                failed,
                detail: details.join("; "),
            });
        }
        if failed & LAYER_VECTOR != 0 {
            tracing::warn!(key = %key, "vector layer delete failed; tombstone deferred to rebuild");
        }
        Ok(())
    }

    /// Split operations into put/delete partitions and drain them in
    /// batches. Each put batch is embedded as one `embed_batch` call
    /// before indexing. Stops at the first fatal error.
    pub fn bulk_write(&self, ops: Vec<WriteOp>) -> Result<BulkSummary> {
        self.check_initialized()?;
        let mut puts = Vec::new();
        let mut deletes = Vec::new();
        for op in ops {
            match op {
                WriteOp::Put(doc) => puts.push(doc),
                WriteOp::Delete { collection, id } => deletes.push((collection, id)),
            }
        }

        let mut summary = BulkSummary::default();
        for chunk in puts.chunks(config::BULK_WRITE_BATCH_SIZE) {
            let prepared = self.embed_batch_ahead(chunk);
            for doc in &prepared {
                self.put(doc)?;
                summary.puts += 1;
            }
        }
        for chunk in deletes.chunks(config::BULK_WRITE_BATCH_SIZE) {
            for (collection, id) in chunk {
                self.delete(collection, id)?;
                summary.deletes += 1;
            }
        }
        Ok(summary)
    }

    /// Fill missing embeddings for a batch in one embedder round-trip.
    /// A failed batch falls back to per-document embedding inside `put`.
    fn embed_batch_ahead(&self, chunk: &[Document]) -> Vec<Document> {
        let Some(embedder) = self.embedder.as_ref() else {
            return chunk.to_vec();
        };
        let mut docs = chunk.to_vec();
        let pending: Vec<usize> = docs
            .iter()
            .enumerate()
            .filter(|(_, doc)| doc.vector.is_none())
            .map(|(i, _)| i)
            .collect();
        if pending.is_empty() {
            return docs;
        }
        let texts: Vec<&str> = pending.iter().map(|&i| docs[i].content.as_str()).collect();
        let embedded = embedder.embed_batch(&texts, None);
        drop(texts);
        match embedded {
            Ok(vectors) => {
                for (&i, vector) in pending.iter().zip(vectors) {
                    docs[i].vector = Some(vector);
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "batch embedding failed; deferring to per-document embedding");
            }
        }
        docs
    }

    /// Execute a hybrid search.
    pub fn search(&self, request: &SearchRequest) -> Result<SearchResponse> {
        self.check_initialized()?;
        self.planner.search(request)
    }

    /// Snapshot the external document store.
    pub fn snapshot(&self) -> Result<Value> {
        self.check_initialized()?;
        match self.store.as_ref() {
            Some(store) => store.snapshot(),
            None => Err(Error::DocumentStore("no document store configured".into())),
        }
    }

    /// Rebuild the vector index when the tombstone ratio is over
    /// threshold. Returns `true` when a rebuild ran.
    pub fn maintenance(&self) -> Result<bool> {
        self.check_initialized()?;
        match self.vector.as_ref() {
            Some(vector) => vector.maintenance(),
            None => Ok(false),
        }
    }

    /// Vector layer counters, when the layer is enabled.
    pub fn vector_stats(&self) -> Option<VectorStats> {
        self.vector.as_ref().map(|v| v.stats())
    }

    /// Persist the vector layer now.
    pub fn save(&self) -> Result<()> {
        self.check_initialized()?;
        if let Some(vector) = self.vector.as_ref() {
            vector.save()?;
        }
        Ok(())
    }

    /// Stop the auto-save timer, save when dirty, and flush the layers.
    pub fn close(&self) -> Result<()> {
        self.stop_autosave();
        if let Some(vector) = self.vector.as_ref() {
            if vector.is_dirty() {
                vector.save()?;
            }
        }
        self.fulltext.dispose();
        self.initialized.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn stop_autosave(&self) {
        if let Some(autosave) = self.autosave.lock().take() {
            autosave.stop.store(true, Ordering::SeqCst);
            let _ = autosave.handle.join();
        }
    }

    fn resolve_embedding(&self, document: &Document) -> Result<Vec<f32>> {
        if let Some(vector) = document.vector.as_ref() {
            return Ok(vector.clone());
        }
        match self.embedder.as_ref() {
            Some(embedder) => embedder.embed(&document.content),
            None => Err(Error::EmbeddingFailed("no embedder configured".into())),
        }
    }
}

impl Drop for IndexCoordinator {
    fn drop(&mut self) {
        // The timer thread must never outlive the coordinator.
        self.stop_autosave();
    }
}

fn join_layer(task: std::thread::ScopedJoinHandle<'_, Result<()>>) -> Result<()> {
    match task.join() {
        Ok(result) => result,
        Err(_) => Err(Error::InvalidStoredValue("index task panicked".into())),
    }
}

/// The JSON value written to the external document store.
fn document_json(document: &Document) -> Value {
    let mut map = Map::new();
    map.insert("id".into(), Value::String(document.id.clone()));
    map.insert(
        "collection".into(),
        Value::String(document.collection.clone()),
    );
    map.insert("content".into(), Value::String(document.content.clone()));
    for (path, value) in &document.attributes {
        map.insert(path.clone(), value.clone());
    }
    Value::Object(map)
}

/// The tree walked by the structural index: id and collection at the top
/// level, attributes alongside them.
fn structural_json(document: &Document) -> Value {
    let mut map = Map::new();
    map.insert("id".into(), Value::String(document.id.clone()));
    map.insert(
        "collection".into(),
        Value::String(document.collection.clone()),
    );
    for (path, value) in &document.attributes {
        map.insert(path.clone(), value.clone());
    }
    Value::Object(map)
}
