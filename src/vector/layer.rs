//! Composed vector index: sidecar store + HNSW graph + generations.
//!
//! The sidecar is the canonical truth of which documents exist; the graph
//! is the searchable acceleration structure. In-memory `doc_id ↔ label`
//! bijections are updated only after both the HNSW insert and the sidecar
//! commit succeed, so a reader that resolves a label never sees one that
//! is not yet durable. Updates tombstone the old label and allocate a
//! fresh one; rebuild renumbers labels densely and reclaims tombstones.

use crate::config;
use crate::error::{Error, Result};
use crate::hnsw::distance::{self, DistanceSpace};
use crate::hnsw::graph::{HnswConfig, HnswIndex};
use crate::vector::generation::GenerationManager;
use crate::vector::sidecar::{encode_f32_blob, now_epoch_seconds, SidecarStore};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

/// Configuration for a [`VectorLayer`] instance.
#[derive(Debug, Clone)]
pub struct VectorConfig {
    /// Vector dimensionality.
    pub dim: usize,
    /// Distance space.
    pub space: DistanceSpace,
    /// HNSW bidirectional link count.
    pub m: usize,
    /// HNSW construction-time candidate list size.
    pub ef_construction: usize,
    /// HNSW search-time candidate list size.
    pub ef_search: usize,
    /// Initial graph capacity (doubled automatically at 80% occupancy).
    pub max_elements: usize,
    /// Seed for deterministic layer assignment.
    pub seed: u64,
    /// Directory holding generations, lock, metadata, and the sidecar DB.
    pub base_dir: PathBuf,
    /// Filename stem for generation files and siblings.
    pub stem: String,
}

impl VectorConfig {
    /// Defaults for the given dimension, space, and base directory.
    pub fn new(dim: usize, space: DistanceSpace, base_dir: impl Into<PathBuf>) -> Self {
        Self {
            dim,
            space,
            m: config::HNSW_DEFAULT_M,
            ef_construction: config::HNSW_DEFAULT_EF_CONSTRUCTION,
            ef_search: config::HNSW_DEFAULT_EF_SEARCH,
            max_elements: config::HNSW_DEFAULT_MAX_ELEMENTS,
            seed: 0,
            base_dir: base_dir.into(),
            stem: "vectors".to_string(),
        }
    }

    fn hnsw_config(&self) -> HnswConfig {
        let mut cfg = HnswConfig::new(self.dim, self.space);
        cfg.m = self.m;
        cfg.m_max0 = self.m * 2;
        cfg.ef_construction = self.ef_construction;
        cfg.ef_search = self.ef_search;
        cfg.max_elements = self.max_elements;
        cfg.seed = self.seed;
        cfg
    }
}

/// Options applied while filtering raw KNN output.
#[derive(Default)]
pub struct SearchOptions<'a> {
    /// Per-document predicate; non-matching documents are skipped.
    pub filter: Option<&'a (dyn Fn(&str) -> bool + Sync)>,
    /// Minimum score; hits below are dropped.
    pub min_score: Option<f32>,
    /// Hydrate `metadata` from the sidecar.
    pub with_metadata: bool,
    /// Hydrate `vector` from the sidecar.
    pub with_vector: bool,
}

/// A single vector search hit.
#[derive(Debug, Clone)]
pub struct VectorHit {
    pub doc_id: String,
    pub label: u64,
    /// Score in [0, 1], non-increasing in distance.
    pub score: f32,
    pub metadata: Option<Value>,
    pub vector: Option<Vec<f32>>,
}

/// Outcome of an upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// A new document was added.
    Inserted,
    /// An existing document was re-embedded under a fresh label.
    Updated,
    /// The content hash matched the stored record; nothing changed.
    Unchanged,
}

/// Counters describing the layer state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VectorStats {
    pub dimensions: usize,
    pub space: String,
    pub total_vectors: u64,
    pub active_vectors: u64,
    pub deleted_vectors: u64,
    pub tombstone_ratio: f64,
}

/// Sidecar metadata written next to each published generation.
#[derive(Debug, Serialize, Deserialize)]
struct IndexMeta {
    dimensions: usize,
    space: String,
    normalized: bool,
    total_vectors: u64,
    active_vectors: u64,
    deleted_vectors: u64,
    saved_at: i64,
    generation_path: String,
}

#[derive(Debug, Default)]
struct Mappings {
    doc_to_label: HashMap<String, u64>,
    label_to_doc: HashMap<u64, String>,
    next_label: u64,
}

/// The vector layer. Lock order when both are needed: mappings, then hnsw.
#[derive(Debug)]
pub struct VectorLayer {
    config: VectorConfig,
    sidecar: SidecarStore,
    generations: GenerationManager,
    hnsw: RwLock<HnswIndex>,
    mappings: RwLock<Mappings>,
    /// Serializes overlapping saves.
    save_lock: Mutex<()>,
    dirty: AtomicBool,
}

impl VectorLayer {
    /// Open the layer: sidecar first, then the published graph (or a
    /// fresh one), then the bijections rehydrated from the sidecar.
    ///
    /// The startup self-check fails fast on dimension/space disagreement
    /// and on a structurally invalid graph. A graph that lags the sidecar
    /// (crash between upsert and save) is rebuilt in memory from the
    /// durable records and marked dirty.
    pub fn open(config: VectorConfig) -> Result<Self> {
        let sidecar_path = config.base_dir.join(format!("{}.sidecar.db", config.stem));
        let sidecar = SidecarStore::open(&sidecar_path, config.dim, config.space)?;
        let generations = GenerationManager::new(&config.base_dir, &config.stem)?;

        let hnsw = match generations.resolve_current() {
            Some(path) => {
                let mut graph = HnswIndex::deserialize(&path)?;
                if graph.config.dim != config.dim {
                    return Err(Error::InconsistentMetadata(format!(
                        "generation dim {} != configured {}",
                        graph.config.dim, config.dim
                    )));
                }
                if graph.config.space != config.space {
                    return Err(Error::InconsistentMetadata(format!(
                        "generation space {} != configured {}",
                        graph.config.space.as_str(),
                        config.space.as_str()
                    )));
                }
                graph.set_ef(config.ef_search);
                graph
            }
            None => HnswIndex::new(config.hnsw_config()),
        };

        let pairs = sidecar.all_mappings()?;
        let mut mappings = Mappings::default();
        for (doc_id, label) in &pairs {
            mappings.doc_to_label.insert(doc_id.clone(), *label);
            mappings.label_to_doc.insert(*label, doc_id.clone());
            mappings.next_label = mappings.next_label.max(label + 1);
        }

        let layer = Self {
            config,
            sidecar,
            generations,
            hnsw: RwLock::new(hnsw),
            mappings: RwLock::new(mappings),
            save_lock: Mutex::new(()),
            dirty: AtomicBool::new(false),
        };

        let drifted = {
            let hnsw = layer.hnsw.read();
            let mappings = layer.mappings.read();
            let stale = mappings
                .doc_to_label
                .values()
                .any(|&label| label >= hnsw.node_count as u64);
            stale || hnsw.active_count() != mappings.doc_to_label.len()
        };
        if drifted {
            tracing::warn!("graph lags durable sidecar state; rebuilding in memory");
            layer.rebuild_in_memory(None)?;
            layer.dirty.store(true, Ordering::SeqCst);
        }

        Ok(layer)
    }

    /// The configured dimensionality.
    pub fn dim(&self) -> usize {
        self.config.dim
    }

    /// True when unsaved changes exist.
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    /// Insert or replace a document vector.
    ///
    /// Validates dimension and zero-norm constraints, normalizes for
    /// inner-product/cosine spaces when the norm strays past tolerance,
    /// and skips entirely when the content hash matches the stored
    /// record for this doc_id.
    pub fn upsert(&self, doc_id: &str, vector: &[f32], metadata: &Value) -> Result<UpsertOutcome> {
        if vector.len() != self.config.dim {
            return Err(Error::DimensionMismatch {
                expected: self.config.dim,
                actual: vector.len(),
            });
        }
        let vector = self.prepare_vector(vector)?;
        let content_hash = hash_vector(&vector);

        if self.sidecar.get_content_hash(doc_id)?.as_deref() == Some(content_hash.as_str()) {
            return Ok(UpsertOutcome::Unchanged);
        }

        // The mappings lock doubles as the label allocator, so it is held
        // across the whole insert.
        let mut mappings = self.mappings.write();
        let new_label = mappings.next_label;
        let old_label = mappings.doc_to_label.get(doc_id).copied();

        {
            let mut hnsw = self.hnsw.write();
            hnsw.add(&vector, new_label)?;
        }
        if let Err(e) = self.sidecar.save_vector(
            doc_id,
            new_label,
            &vector,
            metadata,
            &content_hash,
            self.config.space.requires_normalization(),
        ) {
            // Labels stay dense: the orphaned graph node becomes an
            // unmapped tombstone and the label is burned.
            self.hnsw.write().mark_deleted(new_label);
            mappings.next_label = new_label + 1;
            return Err(e);
        }

        // Both writes are durable; now expose the new label and retire
        // the old one.
        if let Some(old) = old_label {
            mappings.label_to_doc.remove(&old);
            self.hnsw.write().mark_deleted(old);
        }
        mappings.doc_to_label.insert(doc_id.to_string(), new_label);
        mappings.label_to_doc.insert(new_label, doc_id.to_string());
        mappings.next_label = new_label + 1;
        drop(mappings);

        self.dirty.store(true, Ordering::SeqCst);
        Ok(if old_label.is_some() {
            UpsertOutcome::Updated
        } else {
            UpsertOutcome::Inserted
        })
    }

    /// Approximate nearest neighbor search.
    ///
    /// Over-fetches internally so tombstones can be dropped while still
    /// returning k live hits when available.
    pub fn search(&self, query: &[f32], k: usize, opts: &SearchOptions<'_>) -> Result<Vec<VectorHit>> {
        if query.len() != self.config.dim {
            return Err(Error::DimensionMismatch {
                expected: self.config.dim,
                actual: query.len(),
            });
        }
        let query = self.prepare_vector(query)?;

        // Lock order: mappings before hnsw. With a filter, non-matching
        // nodes are excluded during traversal (still used for navigation)
        // so k live candidates survive even under selective predicates.
        let mut hits = Vec::with_capacity(k);
        {
            let mappings = self.mappings.read();
            let hnsw = self.hnsw.read();
            let raw = match opts.filter {
                Some(filter) => hnsw.knn_filtered(&query, k, &|id: u32| {
                    mappings
                        .label_to_doc
                        .get(&(id as u64))
                        .is_some_and(|doc_id| filter(doc_id))
                }),
                None => hnsw.knn(&query, k),
            };
            for (label, dist) in raw {
                // Unmapped labels are tombstones awaiting rebuild.
                let Some(doc_id) = mappings.label_to_doc.get(&label) else {
                    continue;
                };
                let score = self.config.space.score(dist);
                if let Some(min) = opts.min_score {
                    if score < min {
                        continue;
                    }
                }
                hits.push(VectorHit {
                    doc_id: doc_id.clone(),
                    label,
                    score,
                    metadata: None,
                    vector: None,
                });
                if hits.len() >= k {
                    break;
                }
            }
        }

        if opts.with_metadata || opts.with_vector {
            let ids: Vec<&str> = hits.iter().map(|h| h.doc_id.as_str()).collect();
            let mut records = self.sidecar.batch_get(&ids)?;
            for hit in &mut hits {
                if let Some((vector, metadata)) = records.remove(&hit.doc_id) {
                    if opts.with_metadata {
                        hit.metadata = Some(metadata);
                    }
                    if opts.with_vector {
                        hit.vector = Some(vector);
                    }
                }
            }
        }
        Ok(hits)
    }

    /// Fetch the stored vector and metadata for a document.
    pub fn get_vector(&self, doc_id: &str) -> Result<Option<(Vec<f32>, Value)>> {
        self.sidecar.get_vector(doc_id)
    }

    /// Fetch the current label for a document.
    pub fn get_label(&self, doc_id: &str) -> Result<Option<u64>> {
        Ok(self.mappings.read().doc_to_label.get(doc_id).copied())
    }

    /// Remove a document. The graph keeps a tombstone until the next
    /// rebuild. Returns `true` when the document existed.
    pub fn delete(&self, doc_id: &str) -> Result<bool> {
        let mut mappings = self.mappings.write();
        let Some(label) = mappings.doc_to_label.remove(doc_id) else {
            return Ok(false);
        };
        mappings.label_to_doc.remove(&label);
        self.hnsw.write().mark_deleted(label);
        drop(mappings);

        self.sidecar.remove_vector(doc_id)?;
        self.dirty.store(true, Ordering::SeqCst);
        Ok(true)
    }

    /// Current counters, including the tombstone ratio that drives
    /// automatic rebuilds.
    pub fn stats(&self) -> VectorStats {
        let mappings = self.mappings.read();
        let total = mappings.next_label;
        let active = mappings.doc_to_label.len() as u64;
        let deleted = total.saturating_sub(active);
        VectorStats {
            dimensions: self.config.dim,
            space: self.config.space.as_str().to_string(),
            total_vectors: total,
            active_vectors: active,
            deleted_vectors: deleted,
            tombstone_ratio: if total == 0 {
                0.0
            } else {
                deleted as f64 / total as f64
            },
        }
    }

    /// Access to the sidecar (used by the coordinator for stats).
    pub fn sidecar(&self) -> &SidecarStore {
        &self.sidecar
    }

    /// Persist the layer: sidecar stats + checksum, a new generation of
    /// the graph, a best-effort WAL checkpoint, and the metadata sidecar
    /// file. Overlapping saves serialize on an internal mutex; transient
    /// publish failures retry on a short backoff schedule.
    pub fn save(&self) -> Result<PathBuf> {
        let _serial = self.save_lock.lock();
        let _write_lock = self.generations.acquire_lock()?;

        let (doc_ids, stats) = {
            let mappings = self.mappings.read();
            let mut ids: Vec<String> = mappings.doc_to_label.keys().cloned().collect();
            ids.sort_unstable();
            let total = mappings.next_label;
            let active = mappings.doc_to_label.len() as u64;
            let deleted = total.saturating_sub(active);
            let stats = VectorStats {
                dimensions: self.config.dim,
                space: self.config.space.as_str().to_string(),
                total_vectors: total,
                active_vectors: active,
                deleted_vectors: deleted,
                tombstone_ratio: if total == 0 {
                    0.0
                } else {
                    deleted as f64 / total as f64
                },
            };
            (ids, stats)
        };
        let checksum = hash_doc_set(&doc_ids);
        self.sidecar.save_stats(stats.active_vectors, &checksum)?;

        let mut attempt = 0usize;
        let generation_path = loop {
            let result = self
                .generations
                .publish(&mut |path| self.hnsw.read().serialize(path));
            match result {
                Ok(path) => break path,
                Err(e) if attempt < config::PUBLISH_BACKOFF_MS.len() => {
                    let delay = config::PUBLISH_BACKOFF_MS[attempt];
                    tracing::warn!(error = %e, attempt, delay_ms = delay, "publish failed, retrying");
                    std::thread::sleep(std::time::Duration::from_millis(delay));
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        };

        self.sidecar.checkpoint();
        self.write_meta(&stats, &generation_path)?;
        self.dirty.store(false, Ordering::SeqCst);
        Ok(generation_path)
    }

    fn write_meta(&self, stats: &VectorStats, generation_path: &std::path::Path) -> Result<()> {
        let meta = IndexMeta {
            dimensions: stats.dimensions,
            space: stats.space.clone(),
            normalized: self.config.space.requires_normalization(),
            total_vectors: stats.total_vectors,
            active_vectors: stats.active_vectors,
            deleted_vectors: stats.deleted_vectors,
            saved_at: now_epoch_seconds()?,
            generation_path: generation_path.display().to_string(),
        };
        let path = self
            .config
            .base_dir
            .join(format!("{}.meta.json", self.config.stem));
        let tmp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(&meta)
            .map_err(|e| Error::InvalidStoredValue(format!("meta encode: {e}")))?;
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Rebuild the graph from the sidecar with densely renumbered labels,
    /// reclaiming tombstone space, then save.
    ///
    /// `on_progress(done, total)` is invoked after each reinserted
    /// document. Returns the number of live documents.
    pub fn rebuild(&self, on_progress: Option<&dyn Fn(usize, usize)>) -> Result<usize> {
        let count = self.rebuild_in_memory(on_progress)?;
        self.dirty.store(true, Ordering::SeqCst);
        self.save()?;
        Ok(count)
    }

    /// Rebuild when the tombstone ratio exceeds the threshold. Returns
    /// `true` when a rebuild ran.
    pub fn maintenance(&self) -> Result<bool> {
        let ratio = self.stats().tombstone_ratio;
        if ratio > config::TOMBSTONE_REBUILD_RATIO {
            tracing::info!(tombstone_ratio = ratio, "tombstone ratio over threshold, rebuilding");
            self.rebuild(None)?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Build a fresh graph and bijections from durable sidecar state and
    /// swap them into place. Does not publish.
    ///
    /// Holds the mappings write lock for the duration, so upserts and
    /// deletes cannot interleave with the renumbering.
    fn rebuild_in_memory(&self, on_progress: Option<&dyn Fn(usize, usize)>) -> Result<usize> {
        let mut mappings = self.mappings.write();

        // Snapshot in label order so renumbering is stable.
        let pairs = self.sidecar.all_mappings()?;
        let total = pairs.len();

        let mut graph = HnswIndex::new(self.config.hnsw_config());
        let mut assignments: Vec<(String, u64)> = Vec::with_capacity(total);
        for (done, (doc_id, _old_label)) in pairs.iter().enumerate() {
            let (vector, _) = self.sidecar.get_vector(doc_id)?.ok_or_else(|| {
                Error::InconsistentMetadata(format!("mapping without vector row: {doc_id}"))
            })?;
            let new_label = assignments.len() as u64;
            graph.add(&vector, new_label)?;
            assignments.push((doc_id.clone(), new_label));
            if let Some(cb) = on_progress {
                cb(done + 1, total);
            }
        }

        self.sidecar.rebuild_labels(&assignments)?;

        let mut hnsw = self.hnsw.write();
        mappings.doc_to_label.clear();
        mappings.label_to_doc.clear();
        for (doc_id, label) in &assignments {
            mappings.doc_to_label.insert(doc_id.clone(), *label);
            mappings.label_to_doc.insert(*label, doc_id.clone());
        }
        mappings.next_label = assignments.len() as u64;
        *hnsw = graph;
        Ok(total)
    }

    /// Normalize a copy of the vector when the space requires it and the
    /// norm strays beyond tolerance; reject zero vectors for those spaces.
    fn prepare_vector(&self, vector: &[f32]) -> Result<Vec<f32>> {
        let mut out = vector.to_vec();
        if self.config.space.requires_normalization() {
            let norm = distance::norm(&out);
            if norm <= f32::EPSILON {
                return Err(Error::ZeroVector {
                    space: self.config.space.as_str(),
                });
            }
            if (norm - 1.0).abs() > config::NORMALIZATION_TOLERANCE {
                distance::normalize_in_place(&mut out);
            }
        }
        Ok(out)
    }
}

fn hash_vector(vector: &[f32]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(encode_f32_blob(vector));
    hex_string(&hasher.finalize())
}

fn hash_doc_set(sorted_ids: &[String]) -> String {
    let mut hasher = Sha256::new();
    for id in sorted_ids {
        hasher.update(id.as_bytes());
        hasher.update([0u8]);
    }
    hex_string(&hasher.finalize())
}

fn hex_string(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}
