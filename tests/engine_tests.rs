//! End-to-end engine scenarios: upsert/recall, tombstones, crash-safe
//! publishing, hybrid strategies, CJK text, fusion, and rebuild
//! equivalence.

use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use tridex::coordinator::{CoordinatorConfig, IndexCoordinator};
use tridex::error::Result;
use tridex::fulltext::FullTextConfig;
use tridex::hnsw::{DistanceSpace, HnswIndex};
use tridex::planner::{HybridStrategy, SearchRequest, SemanticQuery};
use tridex::vector::{GenerationManager, SearchOptions, VectorConfig, VectorLayer};
use tridex::{Document, Embedder};

/// Deterministic embedder mapping known words onto fixed axes.
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

fn open_coordinator(dir: &Path, cjk: bool) -> IndexCoordinator {
    let config = CoordinatorConfig {
        autosave_interval: None,
        fulltext: FullTextConfig { cjk },
        ..CoordinatorConfig::new(dir)
    }
    .with_vector(4, DistanceSpace::Cosine);
    let coordinator = IndexCoordinator::open(config, Some(Arc::new(AxisEmbedder)), None).unwrap();
    coordinator.initialize().unwrap();
    coordinator
}

/// Distinct unit-ish vectors spread over the first three axes.
fn spread_vector(i: usize) -> Vec<f32> {
    let angle = i as f32 * 0.61;
    vec![angle.sin(), angle.cos(), (angle * 0.5).sin() + 1.5, 1.0]
}

#[test]
fn scenario_upsert_and_recall() {
    let dir = tempfile::tempdir().unwrap();
    let layer =
        VectorLayer::open(VectorConfig::new(4, DistanceSpace::InnerProduct, dir.path())).unwrap();

    layer.upsert("a", &[1.0, 0.0, 0.0, 0.0], &json!({})).unwrap();
    let hits = layer
        .search(&[1.0, 0.0, 0.0, 0.0], 1, &SearchOptions::default())
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].doc_id, "a");
    assert!((hits[0].score - 1.0).abs() < 1e-4);
    assert_eq!(layer.sidecar().stats().unwrap().count, 1);
}

#[test]
fn scenario_tombstone_after_update() {
    let dir = tempfile::tempdir().unwrap();
    let layer =
        VectorLayer::open(VectorConfig::new(4, DistanceSpace::InnerProduct, dir.path())).unwrap();

    layer.upsert("a", &[1.0, 0.0, 0.0, 0.0], &json!({})).unwrap();
    layer.upsert("a", &[0.0, 1.0, 0.0, 0.0], &json!({})).unwrap();

    let opts = SearchOptions {
        with_vector: true,
        ..Default::default()
    };
    let hits = layer.search(&[1.0, 0.0, 0.0, 0.0], 5, &opts).unwrap();
    let a_hits: Vec<_> = hits.iter().filter(|h| h.doc_id == "a").collect();
    assert_eq!(a_hits.len(), 1);
    assert_eq!(a_hits[0].vector.as_deref(), Some(&[0.0, 1.0, 0.0, 0.0][..]));

    let stats = layer.stats();
    assert_eq!(stats.total_vectors, 2, "next_label after one update");
    assert_eq!(stats.active_vectors, 1);
    assert!((stats.tombstone_ratio - 0.5).abs() < 1e-9);

    layer.rebuild(None).unwrap();
    let stats = layer.stats();
    assert_eq!(stats.total_vectors, 1);
    assert_eq!(stats.tombstone_ratio, 0.0);

    let hits = layer.search(&[0.0, 1.0, 0.0, 0.0], 5, &opts).unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].doc_id, "a");
    assert!(hits[0].score >= 1.0 - 1e-3);
}

#[test]
fn scenario_crash_safe_save_third_strategy() {
    let dir = tempfile::tempdir().unwrap();
    let config = VectorConfig::new(4, DistanceSpace::InnerProduct, dir.path());

    {
        let layer = VectorLayer::open(config.clone()).unwrap();
        for i in 0..100 {
            layer
                .upsert(&format!("doc-{i:03}"), &spread_vector(i), &json!({"i": i}))
                .unwrap();
        }
        layer.save().unwrap();
    }

    // Republish through a manager whose first two strategies fail: the
    // direct write sees the absolute target path, the chdir write runs
    // with the base directory as CWD. Only the local-write-and-move
    // strategy goes through.
    let gm = GenerationManager::new(dir.path(), "vectors").unwrap();
    let previous = gm.resolve_current().unwrap();
    let graph = HnswIndex::deserialize(&previous).unwrap();
    let base = gm.base().to_path_buf();
    let mut write_fn = |path: &Path| -> Result<()> {
        let in_base = path.is_absolute()
            || std::env::current_dir().map(|cwd| cwd == base).unwrap_or(false);
        if in_base {
            return Err(tridex::Error::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "injected publish failure",
            )));
        }
        graph.serialize(path)
    };
    let published = gm.publish(&mut write_fn).unwrap();
    assert_ne!(published, previous);
    assert_eq!(gm.resolve_current().unwrap(), published);

    // Restart: the new generation is active and every doc is queryable.
    let layer = VectorLayer::open(config).unwrap();
    for i in (0..100).step_by(9) {
        let doc_id = format!("doc-{i:03}");
        let (vector, _) = layer.get_vector(&doc_id).unwrap().unwrap();
        let hits = layer.search(&vector, 1, &SearchOptions::default()).unwrap();
        assert_eq!(hits[0].doc_id, doc_id, "doc {doc_id} must rank first for itself");
    }
    assert_eq!(layer.stats().active_vectors, 100);
}

#[test]
fn scenario_hybrid_filter_first_with_fts() {
    let dir = tempfile::tempdir().unwrap();
    let coordinator = open_coordinator(dir.path(), false);

    coordinator
        .put(&Document::new("d1", "tech", "vector search"))
        .unwrap();
    coordinator
        .put(&Document::new("d2", "tech", "knowledge base"))
        .unwrap();
    coordinator
        .put(&Document::new("d3", "other", "vector graph"))
        .unwrap();

    let response = coordinator
        .search(&SearchRequest {
            structural: vec![("collection".into(), "tech".into())],
            semantic: Some(SemanticQuery {
                query: "vector".into(),
                use_embedding: false,
                threshold: None,
            }),
            hybrid_strategy: HybridStrategy::FilterFirst,
            limit: 10,
            ..Default::default()
        })
        .unwrap();

    assert_eq!(response.results.len(), 1);
    assert_eq!(response.results[0].document_id, "d1");
    assert_eq!(response.results[0].collection, "tech");
    assert_eq!(response.results[0].citation.document_id, "d1");
}

#[test]
fn scenario_cjk_fulltext() {
    let dir = tempfile::tempdir().unwrap();
    let coordinator = open_coordinator(dir.path(), true);

    coordinator
        .put(&Document::new("x", "notes", "知識管理システム"))
        .unwrap();

    let response = coordinator
        .search(&SearchRequest {
            semantic: Some(SemanticQuery {
                query: "知識管理".into(),
                use_embedding: false,
                threshold: None,
            }),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(response.results.len(), 1);
    assert_eq!(response.results[0].document_id, "x");
    assert!(!response.results[0].snippet.as_deref().unwrap_or("").is_empty());
}

#[test]
fn scenario_parallel_fusion_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let coordinator = open_coordinator(dir.path(), false);

    // d1 matches structural only, d2 lexical only, d3 semantic only.
    // The query "graph" embeds onto the graph axis (d3's vector), its
    // text matches d2 lexically, and the structural predicate selects d1.
    coordinator
        .put(
            &Document::new("d1", "misc", "completely unrelated words")
                .with_attribute("zone", json!("alpha")),
        )
        .unwrap();
    coordinator
        .put(
            &Document::new("d2", "misc", "graph searchable entry")
                .with_vector(vec![1.0, 0.0, 0.0, 0.0]),
        )
        .unwrap();
    coordinator
        .put(&Document::new("d3", "misc", "silent").with_vector(vec![0.0, 1.0, 0.0, 0.0]))
        .unwrap();

    let response = coordinator
        .search(&SearchRequest {
            structural: vec![("zone".into(), "alpha".into())],
            semantic: Some(SemanticQuery {
                query: "graph".into(),
                use_embedding: true,
                threshold: Some(0.8),
            }),
            hybrid_strategy: HybridStrategy::Parallel,
            limit: 10,
            ..Default::default()
        })
        .unwrap();

    // Expected fused scores with defaults (0.3, 0.3, 0.4): d3 = 0.4
    // (semantic rank 0), d1 = 0.3 (structural), d2 = 0.3 (lexical);
    // the 0.3 tie breaks by doc id, d1 before d2.
    let ids: Vec<&str> = response
        .results
        .iter()
        .map(|r| r.document_id.as_str())
        .collect();
    assert_eq!(ids, vec!["d3", "d1", "d2"]);
    assert!((response.results[0].score - 0.4).abs() < 1e-4);
    assert!((response.results[1].score - 0.3).abs() < 1e-4);
    assert!((response.results[2].score - 0.3).abs() < 1e-4);
    let total: f32 = 0.3 + 0.3 + 0.4;
    for result in &response.results {
        assert!(result.score <= total + 1e-6);
        assert!(!result.sources.is_empty());
    }
}

#[test]
fn property_bijection_matches_sidecar() {
    let dir = tempfile::tempdir().unwrap();
    let layer = VectorLayer::open(VectorConfig::new(4, DistanceSpace::Cosine, dir.path())).unwrap();

    for i in 0..30 {
        layer
            .upsert(&format!("doc-{i}"), &spread_vector(i), &json!({}))
            .unwrap();
    }
    for i in (0..30).step_by(3) {
        layer.delete(&format!("doc-{i}")).unwrap();
    }
    for i in (1..30).step_by(5) {
        layer
            .upsert(&format!("doc-{i}"), &spread_vector(i + 100), &json!({}))
            .unwrap();
    }

    for i in 0..30 {
        let doc_id = format!("doc-{i}");
        let in_memory = layer.get_label(&doc_id).unwrap();
        let durable = layer.sidecar().get_label(&doc_id).unwrap();
        assert_eq!(in_memory, durable, "bijection must agree with sidecar for {doc_id}");
    }
}

#[test]
fn property_rebuild_equivalence() {
    let dir = tempfile::tempdir().unwrap();
    let layer =
        VectorLayer::open(VectorConfig::new(4, DistanceSpace::InnerProduct, dir.path())).unwrap();

    for i in 0..40 {
        layer
            .upsert(&format!("doc-{i:02}"), &spread_vector(i), &json!({}))
            .unwrap();
    }
    for i in (0..40).step_by(4) {
        layer.delete(&format!("doc-{i:02}")).unwrap();
    }

    let live: Vec<String> = (0..40)
        .filter(|i| i % 4 != 0)
        .map(|i| format!("doc-{i:02}"))
        .collect();

    let rank_one = |layer: &VectorLayer, doc_id: &str| {
        let (vector, _) = layer.get_vector(doc_id).unwrap().unwrap();
        let hits = layer.search(&vector, 1, &SearchOptions::default()).unwrap();
        (hits[0].doc_id.clone(), hits[0].score)
    };

    for doc_id in &live {
        let (top, score) = rank_one(&layer, doc_id);
        assert_eq!(&top, doc_id);
        assert!(score >= 1.0 - 1e-3);
    }

    let on_progress = |done: usize, total: usize| {
        assert!(done <= total);
    };
    layer.rebuild(Some(&on_progress)).unwrap();

    assert_eq!(layer.stats().tombstone_ratio, 0.0);
    for doc_id in &live {
        let (top, score) = rank_one(&layer, doc_id);
        assert_eq!(&top, doc_id, "rebuild must preserve self-recall");
        assert!(score >= 1.0 - 1e-3);
    }
}

#[test]
fn property_idempotent_put_via_coordinator() {
    let dir = tempfile::tempdir().unwrap();
    let coordinator = open_coordinator(dir.path(), false);

    coordinator
        .put(&Document::new("d1", "tech", "vector search"))
        .unwrap();
    coordinator
        .put(&Document::new("d1", "tech", "vector search"))
        .unwrap();

    let stats = coordinator.vector_stats().unwrap();
    assert_eq!(stats.active_vectors, 1);
    assert_eq!(stats.total_vectors, 1, "no label churn on identical content");

    let response = coordinator
        .search(&SearchRequest {
            semantic: Some(SemanticQuery {
                query: "vector".into(),
                use_embedding: false,
                threshold: None,
            }),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(response.results.len(), 1, "one logical document, one hit");
}

#[test]
fn property_state_survives_full_restart() {
    let dir = tempfile::tempdir().unwrap();
    {
        let coordinator = open_coordinator(dir.path(), false);
        coordinator
            .put(
                &Document::new("d1", "tech", "vector search")
                    .with_attribute("metadata", json!({"category": "ann"})),
            )
            .unwrap();
        coordinator
            .put(&Document::new("d2", "tech", "knowledge base"))
            .unwrap();
        coordinator.close().unwrap();
    }

    let coordinator = open_coordinator(dir.path(), false);
    let response = coordinator
        .search(&SearchRequest {
            structural: vec![("metadata.category".into(), "ann".into())],
            semantic: Some(SemanticQuery {
                query: "vector".into(),
                use_embedding: true,
                threshold: None,
            }),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(response.results.len(), 1);
    assert_eq!(response.results[0].document_id, "d1");
    // stored embed("vector search") vs query axis "vector" → cos ≈ 0.707
    assert!(response.results[0].score > 0.6);
    assert_eq!(coordinator.vector_stats().unwrap().active_vectors, 2);
}
