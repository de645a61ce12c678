//! Hybrid query planner.
//!
//! Executes a [`SearchRequest`] against the structural, full-text, and
//! vector layers using one of three interchangeable strategies:
//! filter-first (structural candidates, then lexical or semantic
//! rerank), semantic-first (vector recall, then structural filtering),
//! and parallel (concurrent dispatch with weighted late fusion).
//!
//! When semantic search is requested but the vector layer or embedder is
//! missing, the planner logs the downgrade, flips `use_embedding`, and
//! retries once through filter-first with full-text search.

/// Weighted late fusion of ranked lists.
pub mod fusion;

use crate::config;
use crate::document::{composite_key, split_composite_key};
use crate::error::{Error, Result};
use crate::external::{DocumentStore, Embedder};
use crate::fulltext::{FullTextIndex, FullTextSearchOptions};
use crate::hnsw::distance::cosine_similarity;
use crate::structural::StructuralIndex;
use crate::vector::sidecar::now_epoch_seconds;
use crate::vector::{SearchOptions, VectorLayer};
use fusion::{fuse_ranked, FusionWeights, SourceList};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Hybrid execution strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HybridStrategy {
    #[default]
    FilterFirst,
    SemanticFirst,
    Parallel,
}

impl HybridStrategy {
    fn as_str(&self) -> &'static str {
        match self {
            HybridStrategy::FilterFirst => "filter-first",
            HybridStrategy::SemanticFirst => "semantic-first",
            HybridStrategy::Parallel => "parallel",
        }
    }
}

/// The semantic half of a request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SemanticQuery {
    /// Query text, embedded when `use_embedding` is on.
    pub query: String,
    /// Rerank by embedding similarity instead of lexical ranking.
    #[serde(default)]
    pub use_embedding: bool,
    /// Minimum score for a hit to survive.
    #[serde(default)]
    pub threshold: Option<f32>,
}

/// A hybrid search request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchRequest {
    /// Equality predicates over extracted fields, AND-ed together.
    #[serde(default)]
    pub structural: Vec<(String, String)>,
    #[serde(default)]
    pub semantic: Option<SemanticQuery>,
    #[serde(default)]
    pub hybrid_strategy: HybridStrategy,
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default)]
    pub fusion_weights: Option<FusionWeights>,
    /// Soft deadline; once elapsed, partial results return with
    /// `metrics.timed_out` set.
    #[serde(skip)]
    pub deadline: Option<Duration>,
}

fn default_limit() -> usize {
    10
}

impl Default for SearchRequest {
    fn default() -> Self {
        Self {
            structural: Vec::new(),
            semantic: None,
            hybrid_strategy: HybridStrategy::default(),
            limit: default_limit(),
            fusion_weights: None,
            deadline: None,
        }
    }
}

/// Provenance attached to every result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Citation {
    /// Index layer the result primarily came from.
    pub source: String,
    pub document_id: String,
    /// Epoch seconds at response time.
    pub timestamp: i64,
    pub collection: String,
    /// SHA-256 of the hydrated document, when one was returned.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

/// A single search result. Always carries the index-fragment fields;
/// `document` is present only when the external store produced one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    pub collection: String,
    pub document_id: String,
    pub score: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snippet: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document: Option<Value>,
    /// Index layers that contributed this result.
    pub sources: Vec<String>,
    pub citation: Citation,
}

/// Execution metrics for a search.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchMetrics {
    pub elapsed_ms: u64,
    pub timed_out: bool,
    pub strategy: String,
    /// Set when a semantic request was downgraded to lexical.
    pub degraded: bool,
}

/// The response envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResponse {
    pub results: Vec<SearchResult>,
    /// Matching documents before truncation to `limit`.
    pub total: usize,
    pub metrics: SearchMetrics,
}

/// Internal pre-enrichment result.
struct Fragment {
    key: String,
    score: f32,
    snippet: Option<String>,
    sources: Vec<&'static str>,
}

/// Insertion-order query-embedding cache.
struct EmbedCache {
    map: HashMap<String, Vec<f32>>,
    order: VecDeque<String>,
}

impl EmbedCache {
    fn new() -> Self {
        Self {
            map: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn get(&self, text: &str) -> Option<Vec<f32>> {
        self.map.get(text).cloned()
    }

    fn put(&mut self, text: String, vector: Vec<f32>) {
        if self.map.contains_key(&text) {
            return;
        }
        while self.order.len() >= config::EMBED_CACHE_CAP {
            if let Some(evicted) = self.order.pop_front() {
                self.map.remove(&evicted);
            }
        }
        self.order.push_back(text.clone());
        self.map.insert(text, vector);
    }
}

/// Plans and executes hybrid searches over the three index layers.
pub struct QueryPlanner {
    structural: Arc<StructuralIndex>,
    fulltext: Arc<FullTextIndex>,
    vector: Option<Arc<VectorLayer>>,
    embedder: Option<Arc<dyn Embedder>>,
    store: Option<Arc<dyn DocumentStore>>,
    embed_cache: Mutex<EmbedCache>,
}

impl QueryPlanner {
    pub fn new(
        structural: Arc<StructuralIndex>,
        fulltext: Arc<FullTextIndex>,
        vector: Option<Arc<VectorLayer>>,
        embedder: Option<Arc<dyn Embedder>>,
        store: Option<Arc<dyn DocumentStore>>,
    ) -> Self {
        Self {
            structural,
            fulltext,
            vector,
            embedder,
            store,
            embed_cache: Mutex::new(EmbedCache::new()),
        }
    }

    /// Execute a request and return enriched, provenance-carrying results.
    pub fn search(&self, request: &SearchRequest) -> Result<SearchResponse> {
        let started = Instant::now();
        let deadline = request.deadline.map(|d| started + d);

        let mut effective = request.clone();
        let mut degraded = false;
        if let Some(semantic) = effective.semantic.as_mut() {
            if semantic.use_embedding && (self.vector.is_none() || self.embedder.is_none()) {
                tracing::warn!(
                    "semantic search requested without vector layer or embedder; \
                     downgrading to lexical filter-first"
                );
                semantic.use_embedding = false;
                effective.hybrid_strategy = HybridStrategy::FilterFirst;
                degraded = true;
            }
        }

        let (fragments, total, timed_out) = match effective.hybrid_strategy {
            HybridStrategy::FilterFirst => self.filter_first(&effective, deadline)?,
            HybridStrategy::SemanticFirst => self.semantic_first(&effective, deadline)?,
            HybridStrategy::Parallel => self.parallel(&effective, deadline)?,
        };

        let results = self.enrich(fragments);
        Ok(SearchResponse {
            results,
            total,
            metrics: SearchMetrics {
                elapsed_ms: started.elapsed().as_millis() as u64,
                timed_out,
                strategy: effective.hybrid_strategy.as_str().to_string(),
                degraded,
            },
        })
    }

    fn filter_first(
        &self,
        request: &SearchRequest,
        deadline: Option<Instant>,
    ) -> Result<(Vec<Fragment>, usize, bool)> {
        let limit = request.limit;
        let semantic = request.semantic.as_ref();

        // Pure lexical fall-through when there is nothing to filter on.
        if request.structural.is_empty() {
            if let Some(sem) = semantic {
                if !sem.use_embedding && !sem.query.trim().is_empty() {
                    let hits = self.lexical_hits(&sem.query, limit, None)?;
                    let fragments = apply_threshold(hits, sem.threshold);
                    let total = fragments.len();
                    return Ok((truncate(fragments, limit), total, false));
                }
            }
            return Ok((Vec::new(), 0, false));
        }

        let candidates = self.structural.query(&request.structural)?;
        if candidates.is_empty() {
            return Ok((Vec::new(), 0, false));
        }
        if expired(deadline) {
            let fragments: Vec<Fragment> = candidates
                .into_iter()
                .take(limit)
                .map(structural_fragment)
                .collect();
            let total = fragments.len();
            return Ok((fragments, total, true));
        }

        let fragments = match semantic {
            Some(sem) if sem.use_embedding && !sem.query.trim().is_empty() => {
                let embedding = self.embed_query(&sem.query)?;
                let vector = self.vector.as_ref().expect("checked before dispatch");
                let mut scored: Vec<Fragment> = Vec::with_capacity(candidates.len());
                for (i, key) in candidates.iter().enumerate() {
                    if i % 32 == 0 && expired(deadline) {
                        scored.sort_unstable_by(compare_fragments);
                        let total = scored.len();
                        return Ok((truncate(scored, limit), total, true));
                    }
                    // Documents without a persisted vector score 0.
                    let score = match vector.get_vector(key)? {
                        Some((stored, _)) => cosine_similarity(&embedding, &stored),
                        None => 0.0,
                    };
                    scored.push(Fragment {
                        key: key.clone(),
                        score,
                        snippet: None,
                        sources: vec!["semantic"],
                    });
                }
                scored.sort_unstable_by(compare_fragments);
                apply_threshold(scored, sem.threshold)
            }
            Some(sem) if !sem.query.trim().is_empty() => {
                let allowed: HashSet<&str> = candidates.iter().map(|s| s.as_str()).collect();
                let pool = limit.max(config::SEMANTIC_FIRST_MIN_K);
                let hits = self.lexical_hits(&sem.query, pool, None)?;
                let filtered: Vec<Fragment> = hits
                    .into_iter()
                    .filter(|f| allowed.contains(f.key.as_str()))
                    .collect();
                apply_threshold(filtered, sem.threshold)
            }
            _ => candidates.into_iter().map(structural_fragment).collect(),
        };

        let total = fragments.len();
        Ok((truncate(fragments, limit), total, false))
    }

    fn semantic_first(
        &self,
        request: &SearchRequest,
        deadline: Option<Instant>,
    ) -> Result<(Vec<Fragment>, usize, bool)> {
        let (Some(vector), Some(_)) = (self.vector.as_ref(), self.embedder.as_ref()) else {
            return self.filter_first(request, deadline);
        };
        let Some(sem) = request.semantic.as_ref().filter(|s| !s.query.trim().is_empty()) else {
            return self.filter_first(request, deadline);
        };

        let embedding = self.embed_query(&sem.query)?;
        let k = request.limit.max(config::SEMANTIC_FIRST_MIN_K);
        let opts = SearchOptions {
            min_score: sem.threshold,
            ..Default::default()
        };
        let hits = vector.search(&embedding, k, &opts)?;
        let timed_out = expired(deadline);

        let mut fragments: Vec<Fragment> = hits
            .into_iter()
            .map(|hit| Fragment {
                key: hit.doc_id,
                score: hit.score,
                snippet: None,
                sources: vec!["semantic"],
            })
            .collect();

        if !request.structural.is_empty() {
            let allowed: HashSet<String> =
                self.structural.query(&request.structural)?.into_iter().collect();
            fragments.retain(|f| allowed.contains(&f.key));
        }

        let total = fragments.len();
        Ok((truncate(fragments, request.limit), total, timed_out))
    }

    fn parallel(
        &self,
        request: &SearchRequest,
        deadline: Option<Instant>,
    ) -> Result<(Vec<Fragment>, usize, bool)> {
        let weights = request.fusion_weights.unwrap_or_default();
        let limit = request.limit;
        let pool = limit.max(config::SEMANTIC_FIRST_MIN_K);
        let semantic = request.semantic.as_ref();

        // The embedder is the slowest collaborator; resolve (and cache)
        // the query vector before any index work.
        let embedding = match semantic {
            Some(sem) if sem.use_embedding && !sem.query.trim().is_empty() => {
                Some(self.embed_query(&sem.query)?)
            }
            _ => None,
        };

        let (tx, rx) = mpsc::channel::<(&'static str, Result<Vec<(String, Option<String>)>>)>();
        let mut dispatched = 0usize;

        if !request.structural.is_empty() {
            let structural = Arc::clone(&self.structural);
            let criteria = request.structural.clone();
            let tx = tx.clone();
            dispatched += 1;
            std::thread::spawn(move || {
                let result = structural
                    .query(&criteria)
                    .map(|ids| ids.into_iter().map(|id| (id, None)).collect());
                let _ = tx.send(("structural", result));
            });
        }

        if let Some(sem) = semantic.filter(|s| !s.query.trim().is_empty()) {
            let fulltext = Arc::clone(&self.fulltext);
            let query = sem.query.clone();
            let tx = tx.clone();
            dispatched += 1;
            std::thread::spawn(move || {
                let result = fulltext
                    .search(
                        &query,
                        &FullTextSearchOptions {
                            limit: pool,
                            collection: None,
                        },
                    )
                    .map(|hits| {
                        hits.into_iter()
                            .map(|hit| {
                                (
                                    composite_key(&hit.collection, &hit.doc_id),
                                    Some(hit.snippet),
                                )
                            })
                            .collect()
                    });
                let _ = tx.send(("fulltext", result));
            });
        }

        if let (Some(vector), Some(embedding)) = (self.vector.as_ref(), embedding) {
            let vector = Arc::clone(vector);
            let threshold = semantic.and_then(|s| s.threshold);
            let tx = tx.clone();
            dispatched += 1;
            std::thread::spawn(move || {
                let opts = SearchOptions {
                    min_score: threshold,
                    ..Default::default()
                };
                let result = vector
                    .search(&embedding, pool, &opts)
                    .map(|hits| hits.into_iter().map(|hit| (hit.doc_id, None)).collect());
                let _ = tx.send(("semantic", result));
            });
        }
        drop(tx);

        // Collect until every dispatched source reports or the deadline
        // lapses; a missing contribution simply fuses as zero.
        let mut lists: Vec<SourceList> = Vec::with_capacity(dispatched);
        let mut snippets: HashMap<String, String> = HashMap::new();
        let mut timed_out = false;
        for _ in 0..dispatched {
            let received = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        timed_out = true;
                        break;
                    }
                    match rx.recv_timeout(deadline - now) {
                        Ok(msg) => msg,
                        Err(_) => {
                            timed_out = true;
                            break;
                        }
                    }
                }
                None => match rx.recv() {
                    Ok(msg) => msg,
                    Err(_) => break,
                },
            };
            let (source, result) = received;
            match result {
                Ok(entries) => {
                    let doc_ids = entries
                        .into_iter()
                        .map(|(key, snippet)| {
                            if let Some(snippet) = snippet {
                                snippets.insert(key.clone(), snippet);
                            }
                            key
                        })
                        .collect();
                    lists.push(SourceList {
                        source,
                        weight: match source {
                            "structural" => weights.structural,
                            "fulltext" => weights.fulltext,
                            _ => weights.semantic,
                        },
                        doc_ids,
                    });
                }
                Err(e) => {
                    tracing::warn!(source, error = %e, "parallel source failed; fusing without it");
                }
            }
        }

        let total = lists
            .iter()
            .flat_map(|list| list.doc_ids.iter())
            .collect::<HashSet<_>>()
            .len();
        let fused = fuse_ranked(&lists, limit);
        let fragments = fused
            .into_iter()
            .map(|doc| Fragment {
                snippet: snippets.remove(&doc.doc_id),
                key: doc.doc_id,
                score: doc.score,
                sources: doc.sources,
            })
            .collect();
        Ok((fragments, total, timed_out))
    }

    fn lexical_hits(
        &self,
        query: &str,
        limit: usize,
        collection: Option<String>,
    ) -> Result<Vec<Fragment>> {
        let hits = self.fulltext.search(
            query,
            &FullTextSearchOptions { limit, collection },
        )?;
        Ok(hits
            .into_iter()
            .map(|hit| Fragment {
                key: composite_key(&hit.collection, &hit.doc_id),
                score: hit.score,
                snippet: Some(hit.snippet),
                sources: vec!["fulltext"],
            })
            .collect())
    }

    /// Embed through the bounded insertion-order cache.
    fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        if let Some(cached) = self.embed_cache.lock().get(text) {
            return Ok(cached);
        }
        let embedder = self
            .embedder
            .as_ref()
            .ok_or_else(|| Error::EmbeddingFailed("no embedder configured".into()))?;
        let vector = embedder.embed(text)?;
        self.embed_cache
            .lock()
            .put(text.to_string(), vector.clone());
        Ok(vector)
    }

    /// Hydrate fragments into results. A failing document store is
    /// logged and the fragment fields stand alone, so callers always see
    /// a result.
    fn enrich(&self, fragments: Vec<Fragment>) -> Vec<SearchResult> {
        let timestamp = now_epoch_seconds().unwrap_or(0);
        fragments
            .into_iter()
            .map(|fragment| {
                let (collection, document_id) = split_composite_key(&fragment.key);
                let document = match self.store.as_ref() {
                    Some(store) => match store.get(&fragment.key) {
                        Ok(doc) => doc,
                        Err(e) => {
                            tracing::warn!(key = %fragment.key, error = %e, "document store lookup failed");
                            None
                        }
                    },
                    None => None,
                };
                let checksum = document
                    .as_ref()
                    .and_then(|doc| serde_json::to_vec(doc).ok())
                    .map(|bytes| sha256_hex(&bytes));
                let source = fragment
                    .sources
                    .first()
                    .copied()
                    .unwrap_or("index")
                    .to_string();
                SearchResult {
                    collection: collection.to_string(),
                    document_id: document_id.to_string(),
                    score: fragment.score,
                    snippet: fragment.snippet,
                    document,
                    sources: fragment.sources.iter().map(|s| s.to_string()).collect(),
                    citation: Citation {
                        source,
                        document_id: document_id.to_string(),
                        timestamp,
                        collection: collection.to_string(),
                        checksum,
                    },
                }
            })
            .collect()
    }
}

fn structural_fragment(key: String) -> Fragment {
    Fragment {
        key,
        score: 1.0,
        snippet: None,
        sources: vec!["structural"],
    }
}

fn apply_threshold(mut fragments: Vec<Fragment>, threshold: Option<f32>) -> Vec<Fragment> {
    if let Some(min) = threshold {
        fragments.retain(|f| f.score >= min);
    }
    fragments
}

fn truncate(mut fragments: Vec<Fragment>, limit: usize) -> Vec<Fragment> {
    fragments.truncate(limit);
    fragments
}

fn compare_fragments(a: &Fragment, b: &Fragment) -> std::cmp::Ordering {
    b.score
        .partial_cmp(&a.score)
        .unwrap_or(std::cmp::Ordering::Equal)
        .then_with(|| a.key.cmp(&b.key))
}

fn expired(deadline: Option<Instant>) -> bool {
    deadline.is_some_and(|d| Instant::now() >= d)
}

fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(digest.len() * 2);
    for b in digest {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fulltext::FullTextConfig;
    use crate::hnsw::DistanceSpace;
    use crate::vector::VectorConfig;
    use serde_json::json;

    /// Deterministic embedder: known words map to fixed unit axes.
    struct AxisEmbedder;

    impl Embedder for AxisEmbedder {
        fn dim(&self) -> usize {
            4
        }

        fn embed(&self, text: &str) -> Result<Vec<f32>> {
            let mut v = [0.0f32; 4];
            for word in text.split_whitespace() {
                match word {
                    "vector" => v[0] += 1.0,
                    "graph" => v[1] += 1.0,
                    "knowledge" => v[2] += 1.0,
                    _ => v[3] += 1.0,
                }
            }
            if v.iter().all(|&x| x == 0.0) {
                v[3] = 1.0;
            }
            Ok(v.to_vec())
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        structural: Arc<StructuralIndex>,
        fulltext: Arc<FullTextIndex>,
        vector: Arc<VectorLayer>,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let structural = Arc::new(StructuralIndex::open(&dir.path().join("structural.db")).unwrap());
        let fulltext = Arc::new(
            FullTextIndex::open(&dir.path().join("fulltext.db"), FullTextConfig::default())
                .unwrap(),
        );
        let vector = Arc::new(
            VectorLayer::open(VectorConfig::new(
                4,
                DistanceSpace::Cosine,
                dir.path().join("vectors"),
            ))
            .unwrap(),
        );
        Fixture {
            _dir: dir,
            structural,
            fulltext,
            vector,
        }
    }

    fn index_doc(fx: &Fixture, id: &str, collection: &str, content: &str) {
        let key = composite_key(collection, id);
        fx.structural
            .add(&key, &json!({"id": id, "collection": collection}))
            .unwrap();
        fx.fulltext.add(id, collection, content, &json!({})).unwrap();
        let embedding = AxisEmbedder.embed(content).unwrap();
        fx.vector.upsert(&key, &embedding, &json!({})).unwrap();
    }

    fn planner(fx: &Fixture) -> QueryPlanner {
        QueryPlanner::new(
            Arc::clone(&fx.structural),
            Arc::clone(&fx.fulltext),
            Some(Arc::clone(&fx.vector)),
            Some(Arc::new(AxisEmbedder)),
            None,
        )
    }

    fn seed_corpus(fx: &Fixture) {
        index_doc(fx, "d1", "tech", "vector search");
        index_doc(fx, "d2", "tech", "knowledge base");
        index_doc(fx, "d3", "other", "vector graph");
    }

    #[test]
    fn test_filter_first_with_fts_intersection() {
        let fx = fixture();
        seed_corpus(&fx);
        let planner = planner(&fx);

        let response = planner
            .search(&SearchRequest {
                structural: vec![("collection".into(), "tech".into())],
                semantic: Some(SemanticQuery {
                    query: "vector".into(),
                    use_embedding: false,
                    threshold: None,
                }),
                ..Default::default()
            })
            .unwrap();

        assert_eq!(response.results.len(), 1);
        assert_eq!(response.results[0].document_id, "d1");
        assert_eq!(response.results[0].collection, "tech");
        assert!(response.results[0].snippet.is_some());
        assert_eq!(response.metrics.strategy, "filter-first");
        assert!(!response.metrics.degraded);
    }

    #[test]
    fn test_filter_first_empty_structural_pure_lexical() {
        let fx = fixture();
        seed_corpus(&fx);
        let planner = planner(&fx);

        let response = planner
            .search(&SearchRequest {
                semantic: Some(SemanticQuery {
                    query: "vector".into(),
                    use_embedding: false,
                    threshold: None,
                }),
                ..Default::default()
            })
            .unwrap();
        let ids: Vec<&str> = response.results.iter().map(|r| r.document_id.as_str()).collect();
        assert!(ids.contains(&"d1"));
        assert!(ids.contains(&"d3"));
    }

    #[test]
    fn test_filter_first_no_candidates_is_empty() {
        let fx = fixture();
        seed_corpus(&fx);
        let planner = planner(&fx);

        let response = planner
            .search(&SearchRequest {
                structural: vec![("collection".into(), "missing".into())],
                semantic: Some(SemanticQuery {
                    query: "vector".into(),
                    use_embedding: false,
                    threshold: None,
                }),
                ..Default::default()
            })
            .unwrap();
        assert!(response.results.is_empty());
        assert_eq!(response.total, 0);
    }

    #[test]
    fn test_filter_first_embedding_rerank() {
        let fx = fixture();
        seed_corpus(&fx);
        let planner = planner(&fx);

        let response = planner
            .search(&SearchRequest {
                structural: vec![("collection".into(), "tech".into())],
                semantic: Some(SemanticQuery {
                    query: "vector".into(),
                    use_embedding: true,
                    threshold: None,
                }),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(response.results.len(), 2);
        assert_eq!(response.results[0].document_id, "d1");
        assert!(response.results[0].score > response.results[1].score);
        assert_eq!(response.results[0].sources, vec!["semantic"]);
    }

    #[test]
    fn test_semantic_first_with_structural_postfilter() {
        let fx = fixture();
        seed_corpus(&fx);
        let planner = planner(&fx);

        let response = planner
            .search(&SearchRequest {
                structural: vec![("collection".into(), "tech".into())],
                semantic: Some(SemanticQuery {
                    query: "vector".into(),
                    use_embedding: true,
                    threshold: None,
                }),
                hybrid_strategy: HybridStrategy::SemanticFirst,
                ..Default::default()
            })
            .unwrap();
        assert!(!response.results.is_empty());
        assert_eq!(response.results[0].document_id, "d1");
        assert!(response
            .results
            .iter()
            .all(|r| r.collection == "tech"), "structural filter must hold");
    }

    #[test]
    fn test_parallel_fusion_weights_and_tiebreak() {
        let fx = fixture();
        let planner = planner(&fx);

        // d1 matches structural only, d2 lexical only, d3 semantic only.
        fx.structural
            .add("tech:d1", &json!({"id": "d1", "collection": "tech"}))
            .unwrap();
        fx.fulltext
            .add("d2", "tech", "graph searchable words", &json!({}))
            .unwrap();
        fx.vector
            .upsert("tech:d3", &[0.0, 1.0, 0.0, 0.0], &json!({}))
            .unwrap();

        let response = planner
            .search(&SearchRequest {
                structural: vec![("collection".into(), "tech".into())],
                semantic: Some(SemanticQuery {
                    query: "graph searchable".into(),
                    use_embedding: true,
                    threshold: None,
                }),
                hybrid_strategy: HybridStrategy::Parallel,
                ..Default::default()
            })
            .unwrap();

        // "graph searchable" → lexical hits d2, semantic axis hits d3;
        // structural candidates hold d1.
        let ids: Vec<&str> = response.results.iter().map(|r| r.document_id.as_str()).collect();
        assert_eq!(ids, vec!["d3", "d1", "d2"]);
        assert!((response.results[0].score - 0.4).abs() < 0.05);
        assert!((response.results[1].score - 0.3).abs() < 0.05);
        let weights = FusionWeights::default();
        for result in &response.results {
            assert!(result.score <= weights.total() + 1e-6);
        }
    }

    #[test]
    fn test_downgrade_without_embedder() {
        let fx = fixture();
        seed_corpus(&fx);
        let planner = QueryPlanner::new(
            Arc::clone(&fx.structural),
            Arc::clone(&fx.fulltext),
            None,
            None,
            None,
        );

        let response = planner
            .search(&SearchRequest {
                structural: vec![("collection".into(), "tech".into())],
                semantic: Some(SemanticQuery {
                    query: "vector".into(),
                    use_embedding: true,
                    threshold: None,
                }),
                hybrid_strategy: HybridStrategy::SemanticFirst,
                ..Default::default()
            })
            .unwrap();
        assert!(response.metrics.degraded);
        assert_eq!(response.metrics.strategy, "filter-first");
        assert_eq!(response.results.len(), 1);
        assert_eq!(response.results[0].document_id, "d1");
    }

    #[test]
    fn test_threshold_filters_low_scores() {
        let fx = fixture();
        seed_corpus(&fx);
        let planner = planner(&fx);

        let response = planner
            .search(&SearchRequest {
                structural: vec![("collection".into(), "tech".into())],
                semantic: Some(SemanticQuery {
                    query: "vector".into(),
                    use_embedding: true,
                    threshold: Some(0.5),
                }),
                ..Default::default()
            })
            .unwrap();
        // d2 ("knowledge base") scores ~0 against the "vector" axis.
        assert_eq!(response.results.len(), 1);
        assert_eq!(response.results[0].document_id, "d1");
    }

    #[test]
    fn test_enrichment_with_document_store() {
        use crate::external::StoreOp;

        struct MapStore(Mutex<HashMap<String, Value>>);
        impl DocumentStore for MapStore {
            fn put(&self, key: &str, value: &Value) -> Result<()> {
                self.0.lock().insert(key.to_string(), value.clone());
                Ok(())
            }
            fn get(&self, key: &str) -> Result<Option<Value>> {
                Ok(self.0.lock().get(key).cloned())
            }
            fn delete(&self, key: &str) -> Result<()> {
                self.0.lock().remove(key);
                Ok(())
            }
            fn bulk_write(&self, ops: &[StoreOp]) -> Result<()> {
                for op in ops {
                    match op {
                        StoreOp::Put { key, value } => self.put(key, value)?,
                        StoreOp::Delete { key } => self.delete(key)?,
                    }
                }
                Ok(())
            }
            fn snapshot(&self) -> Result<Value> {
                Ok(Value::Null)
            }
            fn keys(&self) -> Result<Vec<String>> {
                Ok(self.0.lock().keys().cloned().collect())
            }
        }

        let fx = fixture();
        seed_corpus(&fx);
        let store = Arc::new(MapStore(Mutex::new(HashMap::new())));
        store
            .put("tech:d1", &json!({"content": "vector search"}))
            .unwrap();
        let planner = QueryPlanner::new(
            Arc::clone(&fx.structural),
            Arc::clone(&fx.fulltext),
            Some(Arc::clone(&fx.vector)),
            Some(Arc::new(AxisEmbedder)),
            Some(store),
        );

        let response = planner
            .search(&SearchRequest {
                structural: vec![("collection".into(), "tech".into())],
                semantic: Some(SemanticQuery {
                    query: "vector".into(),
                    use_embedding: false,
                    threshold: None,
                }),
                ..Default::default()
            })
            .unwrap();
        let result = &response.results[0];
        assert_eq!(result.document, Some(json!({"content": "vector search"})));
        assert!(result.citation.checksum.is_some());
        assert_eq!(result.citation.collection, "tech");
        assert_eq!(result.citation.document_id, "d1");
    }

    #[test]
    fn test_embed_cache_eviction_order() {
        let mut cache = EmbedCache::new();
        for i in 0..(config::EMBED_CACHE_CAP + 10) {
            cache.put(format!("q{i}"), vec![i as f32]);
        }
        assert!(cache.get("q0").is_none(), "oldest entries evicted first");
        assert!(cache.get(&format!("q{}", config::EMBED_CACHE_CAP + 9)).is_some());
        assert_eq!(cache.order.len(), config::EMBED_CACHE_CAP);
    }

    #[test]
    fn test_deadline_reports_timeout() {
        let fx = fixture();
        seed_corpus(&fx);
        let planner = planner(&fx);

        let response = planner
            .search(&SearchRequest {
                structural: vec![("collection".into(), "tech".into())],
                semantic: Some(SemanticQuery {
                    query: "vector".into(),
                    use_embedding: true,
                    threshold: None,
                }),
                deadline: Some(Duration::ZERO),
                ..Default::default()
            })
            .unwrap();
        assert!(response.metrics.timed_out);
    }
}
