//! Late fusion of ranked lists from multiple index layers.
//!
//! Each source list carries a weight; a document at rank `i` in a list of
//! length `n` contributes `w · (1 − i/n)` to its fused score. Documents
//! keep the list of sources that produced them for provenance.

use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

/// Per-source weights for the parallel strategy.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionWeights {
    pub structural: f32,
    pub fulltext: f32,
    pub semantic: f32,
}

impl Default for FusionWeights {
    fn default() -> Self {
        let (structural, fulltext, semantic) = crate::config::FUSION_DEFAULT_WEIGHTS;
        Self {
            structural,
            fulltext,
            semantic,
        }
    }
}

impl FusionWeights {
    /// Upper bound of any fused score.
    pub fn total(&self) -> f32 {
        self.structural + self.fulltext + self.semantic
    }
}

/// One ranked list entering fusion, best first.
#[derive(Debug, Clone)]
pub struct SourceList {
    pub source: &'static str,
    pub weight: f32,
    pub doc_ids: Vec<String>,
}

/// A fused document with provenance.
#[derive(Debug, Clone, PartialEq)]
pub struct FusedDoc {
    pub doc_id: String,
    pub score: f32,
    pub sources: Vec<&'static str>,
}

/// Heap entry ordering fused documents: higher score is greater, equal
/// scores break toward the smaller doc_id.
#[derive(Debug)]
struct RankedEntry {
    score: OrderedFloat<f32>,
    doc: FusedDoc,
}

impl PartialEq for RankedEntry {
    fn eq(&self, other: &Self) -> bool {
        self.score == other.score && self.doc.doc_id == other.doc.doc_id
    }
}

impl Eq for RankedEntry {}

impl Ord for RankedEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.score
            .cmp(&other.score)
            .then_with(|| other.doc.doc_id.cmp(&self.doc.doc_id))
    }
}

impl PartialOrd for RankedEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Fuse ranked lists into a single ordering: fused score descending,
/// ties broken by doc_id ascending, truncated to `limit`.
pub fn fuse_ranked(lists: &[SourceList], limit: usize) -> Vec<FusedDoc> {
    let mut fused: HashMap<&str, FusedDoc> = HashMap::new();

    for list in lists {
        let n = list.doc_ids.len();
        if n == 0 {
            continue;
        }
        for (rank, doc_id) in list.doc_ids.iter().enumerate() {
            let contribution = list.weight * (1.0 - rank as f32 / n as f32);
            let entry = fused.entry(doc_id.as_str()).or_insert_with(|| FusedDoc {
                doc_id: doc_id.clone(),
                score: 0.0,
                sources: Vec::new(),
            });
            entry.score += contribution;
            if !entry.sources.contains(&list.source) {
                entry.sources.push(list.source);
            }
        }
    }

    // Partial sort: O(n log k) via min-heap of size limit
    let mut heap: BinaryHeap<Reverse<RankedEntry>> =
        BinaryHeap::with_capacity(limit.saturating_add(1).min(1024));
    for doc in fused.into_values() {
        heap.push(Reverse(RankedEntry {
            score: OrderedFloat(doc.score),
            doc,
        }));
        if heap.len() > limit {
            heap.pop();
        }
    }
    heap.into_sorted_vec()
        .into_iter()
        .map(|Reverse(entry)| entry.doc)
        .collect()
}
