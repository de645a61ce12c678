//! Structural index: inverted mapping `(field_path, field_value)` → doc_ids.
//!
//! Field extraction walks a document tree to a bounded depth, producing
//! one row per `(doc_id, field_path)`: top-level scalars (`id`,
//! `collection`, `type`, timestamps), scalar leaves under nested objects
//! as dotted paths, and simple arrays joined by commas. All rows for a
//! doc_id are replaced atomically on update.

use crate::config;
use crate::error::Result;
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use serde_json::Value;
use std::collections::HashSet;
use std::path::Path;

/// One extracted row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructuralEntry {
    pub field_path: String,
    pub field_value: String,
    pub field_type: &'static str,
}

/// Persistent inverted index over extracted document fields.
pub struct StructuralIndex {
    conn: Mutex<Connection>,
}

impl StructuralIndex {
    /// Open or create the index at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS structural_entries (
                doc_id TEXT NOT NULL,
                field_path TEXT NOT NULL,
                field_value TEXT NOT NULL,
                field_type TEXT NOT NULL,
                PRIMARY KEY (doc_id, field_path)
            );
            CREATE INDEX IF NOT EXISTS idx_structural_field
                ON structural_entries(field_path, field_value);",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Replace all rows for `doc_id` with fields extracted from `document`.
    pub fn add(&self, doc_id: &str, document: &Value) -> Result<()> {
        let entries = extract_fields(document);
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM structural_entries WHERE doc_id = ?1",
            params![doc_id],
        )?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR REPLACE INTO structural_entries
                 (doc_id, field_path, field_value, field_type)
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            for entry in &entries {
                stmt.execute(params![
                    doc_id,
                    entry.field_path,
                    entry.field_value,
                    entry.field_type
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Delete all rows for `doc_id`. No-op when absent.
    pub fn remove(&self, doc_id: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM structural_entries WHERE doc_id = ?1",
            params![doc_id],
        )?;
        Ok(())
    }

    /// Doc ids with `field_path = field` and `field_value = value`,
    /// ordered by doc_id.
    pub fn find_by_index(&self, field: &str, value: &str) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT doc_id FROM structural_entries
             WHERE field_path = ?1 AND field_value = ?2
             ORDER BY doc_id ASC",
        )?;
        let rows = stmt.query_map(params![field, value], |row| row.get::<_, String>(0))?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /// AND of equality predicates. Empty criteria yield no candidates.
    pub fn query(&self, criteria: &[(String, String)]) -> Result<Vec<String>> {
        let mut iter = criteria.iter();
        let Some((field, value)) = iter.next() else {
            return Ok(Vec::new());
        };
        let mut survivors: HashSet<String> =
            self.find_by_index(field, value)?.into_iter().collect();
        for (field, value) in iter {
            if survivors.is_empty() {
                break;
            }
            let matches: HashSet<String> =
                self.find_by_index(field, value)?.into_iter().collect();
            survivors.retain(|doc_id| matches.contains(doc_id));
        }
        let mut out: Vec<String> = survivors.into_iter().collect();
        out.sort_unstable();
        Ok(out)
    }

    /// Number of rows and distinct documents.
    pub fn stats(&self) -> Result<(u64, u64)> {
        let conn = self.conn.lock();
        let (rows, docs): (i64, i64) = conn.query_row(
            "SELECT COUNT(*), COUNT(DISTINCT doc_id) FROM structural_entries",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok((rows as u64, docs as u64))
    }

    /// Remove every row.
    pub fn clear(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM structural_entries", [])?;
        Ok(())
    }
}

/// Walk a document tree and extract indexable rows.
pub fn extract_fields(document: &Value) -> Vec<StructuralEntry> {
    let mut out = Vec::new();
    if let Value::Object(map) = document {
        for (key, value) in map {
            walk(key, value, 1, &mut out);
        }
    }
    out
}

fn walk(path: &str, value: &Value, depth: usize, out: &mut Vec<StructuralEntry>) {
    match value {
        Value::String(s) => out.push(StructuralEntry {
            field_path: path.to_string(),
            field_value: s.clone(),
            field_type: "string",
        }),
        Value::Number(n) => out.push(StructuralEntry {
            field_path: path.to_string(),
            field_value: n.to_string(),
            field_type: "number",
        }),
        Value::Bool(b) => out.push(StructuralEntry {
            field_path: path.to_string(),
            field_value: b.to_string(),
            field_type: "boolean",
        }),
        Value::Array(items) => {
            // Simple arrays only; arrays holding objects are skipped.
            if items.iter().all(|item| is_scalar(item)) && !items.is_empty() {
                let joined = items
                    .iter()
                    .map(scalar_to_string)
                    .collect::<Vec<_>>()
                    .join(",");
                out.push(StructuralEntry {
                    field_path: path.to_string(),
                    field_value: joined,
                    field_type: "array",
                });
            }
        }
        Value::Object(map) => {
            if depth < config::STRUCTURAL_MAX_DEPTH {
                for (key, child) in map {
                    walk(&format!("{path}.{key}"), child, depth + 1, out);
                }
            }
        }
        Value::Null => {}
    }
}

fn is_scalar(value: &Value) -> bool {
    matches!(value, Value::String(_) | Value::Number(_) | Value::Bool(_))
}

fn scalar_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn index() -> (tempfile::TempDir, StructuralIndex) {
        let dir = tempfile::tempdir().unwrap();
        let idx = StructuralIndex::open(&dir.path().join("structural.db")).unwrap();
        (dir, idx)
    }

    fn article(id: &str, collection: &str, category: &str) -> Value {
        json!({
            "id": id,
            "collection": collection,
            "type": "article",
            "created_at": 1_700_000_000,
            "data": { "title": format!("{id} title") },
            "metadata": { "category": category }
        })
    }

    #[test]
    fn test_extract_scalars_and_nested_paths() {
        let entries = extract_fields(&article("d1", "tech", "ml"));
        let paths: Vec<&str> = entries.iter().map(|e| e.field_path.as_str()).collect();
        assert!(paths.contains(&"id"));
        assert!(paths.contains(&"collection"));
        assert!(paths.contains(&"type"));
        assert!(paths.contains(&"created_at"));
        assert!(paths.contains(&"data.title"));
        assert!(paths.contains(&"metadata.category"));
    }

    #[test]
    fn test_extract_array_joined_by_commas() {
        let entries = extract_fields(&json!({"tags": ["a", "b", "c"]}));
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].field_value, "a,b,c");
        assert_eq!(entries[0].field_type, "array");
    }

    #[test]
    fn test_extract_skips_object_arrays_and_nulls() {
        let entries = extract_fields(&json!({
            "items": [{"x": 1}],
            "none": null
        }));
        assert!(entries.is_empty());
    }

    #[test]
    fn test_extract_depth_limit() {
        let entries = extract_fields(&json!({
            "a": { "b": { "c": "reachable", "d": { "e": "too deep" } } }
        }));
        let paths: Vec<&str> = entries.iter().map(|e| e.field_path.as_str()).collect();
        assert!(paths.contains(&"a.b.c"));
        assert!(!paths.iter().any(|p| p.contains('e')));
    }

    #[test]
    fn test_find_by_index() {
        let (_dir, idx) = index();
        idx.add("d1", &article("d1", "tech", "ml")).unwrap();
        idx.add("d2", &article("d2", "tech", "db")).unwrap();
        idx.add("d3", &article("d3", "other", "ml")).unwrap();

        assert_eq!(idx.find_by_index("collection", "tech").unwrap(), vec!["d1", "d2"]);
        assert_eq!(idx.find_by_index("metadata.category", "ml").unwrap(), vec!["d1", "d3"]);
        assert!(idx.find_by_index("collection", "none").unwrap().is_empty());
    }

    #[test]
    fn test_query_ands_predicates() {
        let (_dir, idx) = index();
        idx.add("d1", &article("d1", "tech", "ml")).unwrap();
        idx.add("d2", &article("d2", "tech", "db")).unwrap();
        idx.add("d3", &article("d3", "other", "ml")).unwrap();

        let hits = idx
            .query(&[
                ("collection".into(), "tech".into()),
                ("metadata.category".into(), "ml".into()),
            ])
            .unwrap();
        assert_eq!(hits, vec!["d1"]);
        assert!(idx.query(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_update_replaces_all_rows() {
        let (_dir, idx) = index();
        idx.add("d1", &article("d1", "tech", "ml")).unwrap();
        idx.add("d1", &article("d1", "archive", "history")).unwrap();

        assert!(idx.find_by_index("collection", "tech").unwrap().is_empty());
        assert_eq!(idx.find_by_index("collection", "archive").unwrap(), vec!["d1"]);
        let (_, docs) = idx.stats().unwrap();
        assert_eq!(docs, 1);
    }

    #[test]
    fn test_remove() {
        let (_dir, idx) = index();
        idx.add("d1", &article("d1", "tech", "ml")).unwrap();
        idx.remove("d1").unwrap();
        assert!(idx.find_by_index("collection", "tech").unwrap().is_empty());
        idx.remove("ghost").unwrap();
    }

    #[test]
    fn test_number_equality_uses_canonical_text() {
        let (_dir, idx) = index();
        idx.add("d1", &json!({"rank": 7})).unwrap();
        assert_eq!(idx.find_by_index("rank", "7").unwrap(), vec!["d1"]);
    }

    #[test]
    fn test_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("structural.db");
        {
            let idx = StructuralIndex::open(&path).unwrap();
            idx.add("d1", &json!({"kind": "persisted"})).unwrap();
        }
        let idx = StructuralIndex::open(&path).unwrap();
        assert_eq!(idx.find_by_index("kind", "persisted").unwrap(), vec!["d1"]);
    }
}
