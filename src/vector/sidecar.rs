//! Durable sidecar store: doc_id ↔ label ↔ raw vector + metadata.
//!
//! Backed by SQLite in WAL mode so that on crash recovery the set of
//! visible records equals the set of durably committed transactions.
//! Vectors are stored as little-endian f32 blobs; a CHECK constraint
//! pins the blob length to the configured dimension.

use crate::error::{Error, Result};
use crate::hnsw::distance::DistanceSpace;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;

/// Aggregate counters reported by [`SidecarStore::stats`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SidecarStats {
    /// Number of active records.
    pub count: u64,
    /// Total bytes of stored vector and metadata blobs.
    pub total_bytes: u64,
    /// Epoch seconds of the most recent write, if any.
    pub last_update: Option<i64>,
}

/// Durable map of active vector records.
///
/// All operations run on an internal connection guarded by a mutex; the
/// write path is transactional over both the `vectors` and `mappings`
/// tables.
#[derive(Debug)]
pub struct SidecarStore {
    conn: Mutex<Connection>,
    dim: usize,
}

impl SidecarStore {
    /// Open or create the sidecar database at `path`.
    ///
    /// Persists `dimensions` and `space` into `index_metadata` on first
    /// open and fails with [`Error::InconsistentMetadata`] when an
    /// existing database disagrees with the configuration.
    pub fn open(path: &Path, dim: usize, space: DistanceSpace) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.execute_batch(&schema_sql(dim))?;

        let store = Self {
            conn: Mutex::new(conn),
            dim,
        };

        match store.get_meta("dimensions")? {
            Some(persisted) => {
                if persisted != dim.to_string() {
                    return Err(Error::InconsistentMetadata(format!(
                        "sidecar dimensions {persisted} != configured {dim}"
                    )));
                }
            }
            None => store.put_meta("dimensions", &dim.to_string())?,
        }
        match store.get_meta("space")? {
            Some(persisted) => {
                if persisted != space.as_str() {
                    return Err(Error::InconsistentMetadata(format!(
                        "sidecar space {persisted} != configured {}",
                        space.as_str()
                    )));
                }
            }
            None => store.put_meta("space", space.as_str())?,
        }
        Ok(store)
    }

    /// Write a record into `vectors` and `mappings` in one transaction.
    ///
    /// Fails with [`Error::DimensionMismatch`] when the vector length is
    /// wrong. Idempotent on identical payload. Returns `true` when an
    /// existing record was replaced.
    pub fn save_vector(
        &self,
        doc_id: &str,
        label: u64,
        vector: &[f32],
        metadata: &Value,
        content_hash: &str,
        normalized: bool,
    ) -> Result<bool> {
        if vector.len() != self.dim {
            return Err(Error::DimensionMismatch {
                expected: self.dim,
                actual: vector.len(),
            });
        }
        let blob = encode_f32_blob(vector);
        let metadata_blob = serde_json::to_vec(metadata)
            .map_err(|e| Error::InvalidStoredValue(format!("metadata encode: {e}")))?;
        let label_i64 = u64_to_i64(label, "label")?;
        let now = now_epoch_seconds()?;

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let existed = tx
            .query_row(
                "SELECT 1 FROM vectors WHERE doc_id = ?1",
                params![doc_id],
                |_| Ok(()),
            )
            .optional()?
            .is_some();

        // An update moves the doc to a fresh label, so the old rows for
        // this doc_id must go before the UNIQUE(label) inserts.
        tx.execute("DELETE FROM vectors WHERE doc_id = ?1", params![doc_id])?;
        tx.execute("DELETE FROM mappings WHERE doc_id = ?1", params![doc_id])?;
        tx.execute(
            "INSERT INTO vectors (
                doc_id, label, vector, metadata, content_hash,
                created_at, updated_at, model_version, normalized
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6, '', ?7)",
            params![doc_id, label_i64, blob, metadata_blob, content_hash, now, normalized],
        )?;
        tx.execute(
            "INSERT INTO mappings (doc_id, label) VALUES (?1, ?2)",
            params![doc_id, label_i64],
        )?;
        tx.commit()?;
        Ok(existed)
    }

    /// Fetch the vector and metadata for a document.
    pub fn get_vector(&self, doc_id: &str) -> Result<Option<(Vec<f32>, Value)>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT vector, metadata FROM vectors WHERE doc_id = ?1",
                params![doc_id],
                |row| {
                    let blob: Vec<u8> = row.get(0)?;
                    let meta: Vec<u8> = row.get(1)?;
                    Ok((blob, meta))
                },
            )
            .optional()?;
        match row {
            Some((blob, meta)) => {
                let vector = decode_f32_blob(&blob, self.dim)?;
                let metadata: Value = serde_json::from_slice(&meta)
                    .map_err(|e| Error::InvalidStoredValue(format!("metadata decode: {e}")))?;
                Ok(Some((vector, metadata)))
            }
            None => Ok(None),
        }
    }

    /// Fetch the label for a document.
    pub fn get_label(&self, doc_id: &str) -> Result<Option<u64>> {
        let conn = self.conn.lock();
        let label: Option<i64> = conn
            .query_row(
                "SELECT label FROM mappings WHERE doc_id = ?1",
                params![doc_id],
                |row| row.get(0),
            )
            .optional()?;
        label.map(|l| i64_to_u64(l, "label")).transpose()
    }

    /// Fetch the stored content hash for a document.
    pub fn get_content_hash(&self, doc_id: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();
        Ok(conn
            .query_row(
                "SELECT content_hash FROM vectors WHERE doc_id = ?1",
                params![doc_id],
                |row| row.get(0),
            )
            .optional()?)
    }

    /// Transactionally delete a document from both tables. No-op when absent.
    pub fn remove_vector(&self, doc_id: &str) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM vectors WHERE doc_id = ?1", params![doc_id])?;
        tx.execute("DELETE FROM mappings WHERE doc_id = ?1", params![doc_id])?;
        tx.commit()?;
        Ok(())
    }

    /// Batch fetch vectors and metadata for a set of documents.
    pub fn batch_get(&self, doc_ids: &[&str]) -> Result<HashMap<String, (Vec<f32>, Value)>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare_cached("SELECT vector, metadata FROM vectors WHERE doc_id = ?1")?;
        let mut out = HashMap::with_capacity(doc_ids.len());
        for &doc_id in doc_ids {
            let row = stmt
                .query_row(params![doc_id], |row| {
                    let blob: Vec<u8> = row.get(0)?;
                    let meta: Vec<u8> = row.get(1)?;
                    Ok((blob, meta))
                })
                .optional()?;
            if let Some((blob, meta)) = row {
                let vector = decode_f32_blob(&blob, self.dim)?;
                let metadata: Value = serde_json::from_slice(&meta)
                    .map_err(|e| Error::InvalidStoredValue(format!("metadata decode: {e}")))?;
                out.insert(doc_id.to_string(), (vector, metadata));
            }
        }
        Ok(out)
    }

    /// All `(doc_id, label)` pairs ordered by label. Used on startup to
    /// rehydrate the in-memory bijections.
    pub fn all_mappings(&self) -> Result<Vec<(String, u64)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT doc_id, label FROM mappings ORDER BY label ASC")?;
        let rows = stmt.query_map([], |row| {
            let doc_id: String = row.get(0)?;
            let label: i64 = row.get(1)?;
            Ok((doc_id, label))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (doc_id, label) = row?;
            out.push((doc_id, i64_to_u64(label, "label")?));
        }
        Ok(out)
    }

    /// Rewrite all labels according to `assignments` in one transaction.
    ///
    /// Assignments must be sorted ascending by new label; rebuild produces
    /// them that way, which keeps the UNIQUE(label) constraint satisfied
    /// at every intermediate statement.
    pub fn rebuild_labels(&self, assignments: &[(String, u64)]) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM mappings", [])?;
        for (doc_id, new_label) in assignments {
            let label_i64 = u64_to_i64(*new_label, "label")?;
            tx.execute(
                "UPDATE vectors SET label = ?2 WHERE doc_id = ?1",
                params![doc_id, label_i64],
            )?;
            tx.execute(
                "INSERT INTO mappings (doc_id, label) VALUES (?1, ?2)",
                params![doc_id, label_i64],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Aggregate record count, stored bytes, and last write time.
    pub fn stats(&self) -> Result<SidecarStats> {
        let conn = self.conn.lock();
        let (count, total_bytes, last_update): (i64, Option<i64>, Option<i64>) = conn.query_row(
            "SELECT COUNT(*), SUM(length(vector) + length(metadata)), MAX(updated_at)
             FROM vectors",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;
        Ok(SidecarStats {
            count: i64_to_u64(count, "count")?,
            total_bytes: i64_to_u64(total_bytes.unwrap_or(0), "total_bytes")?,
            last_update,
        })
    }

    /// Write a key into `index_metadata`.
    pub fn put_meta(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO index_metadata (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    /// Read a key from `index_metadata`.
    pub fn get_meta(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();
        Ok(conn
            .query_row(
                "SELECT value FROM index_metadata WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?)
    }

    /// Persist save-time totals and the doc-set checksum in one transaction.
    pub fn save_stats(&self, count: u64, checksum: &str) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO index_metadata (key, value) VALUES ('saved_count', ?1)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![count.to_string()],
        )?;
        tx.execute(
            "INSERT INTO index_metadata (key, value) VALUES ('saved_checksum', ?1)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![checksum],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Best-effort WAL checkpoint. Failures are logged, never propagated.
    pub fn checkpoint(&self) {
        let conn = self.conn.lock();
        if let Err(e) = conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);") {
            tracing::warn!(error = %e, "sidecar WAL checkpoint failed (ignored)");
        }
    }
}

fn schema_sql(dim: usize) -> String {
    let blob_len = dim * std::mem::size_of::<f32>();
    format!(
        "CREATE TABLE IF NOT EXISTS vectors (
            doc_id TEXT PRIMARY KEY,
            label INTEGER NOT NULL UNIQUE,
            vector BLOB NOT NULL CHECK(length(vector) = {blob_len}),
            metadata BLOB NOT NULL,
            content_hash TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            model_version TEXT NOT NULL DEFAULT '',
            normalized INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS mappings (
            doc_id TEXT PRIMARY KEY,
            label INTEGER NOT NULL UNIQUE
        );

        CREATE TABLE IF NOT EXISTS index_metadata (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_vectors_label ON vectors(label);"
    )
}

/// Encode an f32 slice as a little-endian byte blob.
pub fn encode_f32_blob(vector: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(std::mem::size_of_val(vector));
    for &value in vector {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

/// Decode a little-endian byte blob into `dimension` f32 values.
pub fn decode_f32_blob(blob: &[u8], dimension: usize) -> Result<Vec<f32>> {
    let expected_len = dimension * std::mem::size_of::<f32>();
    if blob.len() != expected_len {
        return Err(Error::InvalidStoredValue(format!(
            "invalid vector byte length: expected {expected_len}, got {}",
            blob.len()
        )));
    }
    let mut out = Vec::with_capacity(dimension);
    for chunk in blob.chunks_exact(4) {
        let value = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        if !value.is_finite() {
            return Err(Error::InvalidStoredValue(
                "vector contains non-finite values".to_string(),
            ));
        }
        out.push(value);
    }
    Ok(out)
}

pub(crate) fn now_epoch_seconds() -> Result<i64> {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_err(|e| Error::InvalidStoredValue(e.to_string()))?;
    u64_to_i64(now.as_secs(), "now_epoch_seconds")
}

fn u64_to_i64(value: u64, field: &'static str) -> Result<i64> {
    i64::try_from(value)
        .map_err(|_| Error::InvalidStoredValue(format!("integer overflow for {field}")))
}

fn i64_to_u64(value: i64, field: &'static str) -> Result<u64> {
    u64::try_from(value)
        .map_err(|_| Error::InvalidStoredValue(format!("negative value for {field}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tmp_store(dim: usize) -> (tempfile::TempDir, SidecarStore) {
        let dir = tempfile::tempdir().unwrap();
        let store =
            SidecarStore::open(&dir.path().join("sidecar.db"), dim, DistanceSpace::Cosine)
                .unwrap();
        (dir, store)
    }

    #[test]
    fn test_save_and_get_roundtrip() {
        let (_dir, store) = tmp_store(4);
        let v = vec![0.1, 0.2, 0.3, 0.4];
        store
            .save_vector("a", 0, &v, &json!({"k": "v"}), "h1", true)
            .unwrap();

        let (vector, metadata) = store.get_vector("a").unwrap().unwrap();
        assert_eq!(vector, v);
        assert_eq!(metadata, json!({"k": "v"}));
        assert_eq!(store.get_label("a").unwrap(), Some(0));
        assert_eq!(store.get_content_hash("a").unwrap().as_deref(), Some("h1"));
    }

    #[test]
    fn test_dimension_mismatch_rejected() {
        let (_dir, store) = tmp_store(4);
        let err = store
            .save_vector("a", 0, &[1.0, 2.0], &json!({}), "h", false)
            .unwrap_err();
        assert!(matches!(err, Error::DimensionMismatch { expected: 4, actual: 2 }));
    }

    #[test]
    fn test_update_reports_replacement() {
        let (_dir, store) = tmp_store(2);
        let was_update = store
            .save_vector("a", 0, &[1.0, 0.0], &json!({}), "h1", true)
            .unwrap();
        assert!(!was_update);
        let was_update = store
            .save_vector("a", 1, &[0.0, 1.0], &json!({}), "h2", true)
            .unwrap();
        assert!(was_update);
        assert_eq!(store.get_label("a").unwrap(), Some(1));
        assert_eq!(store.stats().unwrap().count, 1);
    }

    #[test]
    fn test_remove_vector_is_noop_when_absent() {
        let (_dir, store) = tmp_store(2);
        store.remove_vector("ghost").unwrap();
        store
            .save_vector("a", 0, &[1.0, 0.0], &json!({}), "h", false)
            .unwrap();
        store.remove_vector("a").unwrap();
        assert!(store.get_vector("a").unwrap().is_none());
        assert!(store.get_label("a").unwrap().is_none());
    }

    #[test]
    fn test_all_mappings_ordered_by_label() {
        let (_dir, store) = tmp_store(2);
        store
            .save_vector("c", 2, &[1.0, 0.0], &json!({}), "h", false)
            .unwrap();
        store
            .save_vector("a", 0, &[1.0, 0.0], &json!({}), "h", false)
            .unwrap();
        store
            .save_vector("b", 1, &[1.0, 0.0], &json!({}), "h", false)
            .unwrap();
        let mappings = store.all_mappings().unwrap();
        assert_eq!(
            mappings,
            vec![
                ("a".to_string(), 0),
                ("b".to_string(), 1),
                ("c".to_string(), 2)
            ]
        );
    }

    #[test]
    fn test_batch_get_skips_missing() {
        let (_dir, store) = tmp_store(2);
        store
            .save_vector("a", 0, &[1.0, 0.0], &json!({}), "h", false)
            .unwrap();
        let got = store.batch_get(&["a", "missing"]).unwrap();
        assert_eq!(got.len(), 1);
        assert!(got.contains_key("a"));
    }

    #[test]
    fn test_rebuild_labels_renumbers_densely() {
        let (_dir, store) = tmp_store(2);
        store
            .save_vector("a", 3, &[1.0, 0.0], &json!({}), "h", false)
            .unwrap();
        store
            .save_vector("b", 7, &[0.0, 1.0], &json!({}), "h", false)
            .unwrap();
        store
            .rebuild_labels(&[("a".into(), 0), ("b".into(), 1)])
            .unwrap();
        assert_eq!(store.get_label("a").unwrap(), Some(0));
        assert_eq!(store.get_label("b").unwrap(), Some(1));
        assert_eq!(
            store.all_mappings().unwrap(),
            vec![("a".to_string(), 0), ("b".to_string(), 1)]
        );
    }

    #[test]
    fn test_stats_counts_bytes() {
        let (_dir, store) = tmp_store(2);
        assert_eq!(store.stats().unwrap().count, 0);
        store
            .save_vector("a", 0, &[1.0, 0.0], &json!({}), "h", false)
            .unwrap();
        let stats = store.stats().unwrap();
        assert_eq!(stats.count, 1);
        assert!(stats.total_bytes >= 8);
        assert!(stats.last_update.is_some());
    }

    #[test]
    fn test_reopen_detects_dimension_change() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sidecar.db");
        {
            let store = SidecarStore::open(&path, 4, DistanceSpace::Cosine).unwrap();
            store
                .save_vector("a", 0, &[1.0, 0.0, 0.0, 0.0], &json!({}), "h", true)
                .unwrap();
        }
        let err = SidecarStore::open(&path, 8, DistanceSpace::Cosine).unwrap_err();
        assert!(matches!(err, Error::InconsistentMetadata(_)));
    }

    #[test]
    fn test_reopen_detects_space_change() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sidecar.db");
        drop(SidecarStore::open(&path, 4, DistanceSpace::Cosine).unwrap());
        let err = SidecarStore::open(&path, 4, DistanceSpace::L2).unwrap_err();
        assert!(matches!(err, Error::InconsistentMetadata(_)));
    }

    #[test]
    fn test_records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sidecar.db");
        {
            let store = SidecarStore::open(&path, 2, DistanceSpace::Cosine).unwrap();
            store
                .save_vector("a", 0, &[0.6, 0.8], &json!({"x": 1}), "h", true)
                .unwrap();
        }
        let store = SidecarStore::open(&path, 2, DistanceSpace::Cosine).unwrap();
        let (vector, metadata) = store.get_vector("a").unwrap().unwrap();
        assert_eq!(vector, vec![0.6, 0.8]);
        assert_eq!(metadata, json!({"x": 1}));
    }

    #[test]
    fn test_blob_roundtrip() {
        let v = vec![1.5, -2.25, 0.0, 3.75];
        let blob = encode_f32_blob(&v);
        assert_eq!(decode_f32_blob(&blob, 4).unwrap(), v);
        assert!(decode_f32_blob(&blob, 3).is_err());
    }
}
