//! HNSW snapshot serialization.
//!
//! Snapshots are bincode with a 4-byte magic and a CRC32 footer:
//! `[bincode payload][magic "TDX1"][CRC32 BE]`. Surrounding layers treat
//! the bytes as opaque; placement and atomicity belong to the generation
//! manager.

use crate::error::{Error, Result};
use crate::hnsw::graph::HnswIndex;
use std::fs;
use std::path::Path;

/// Magic bytes appended before the CRC32 footer.
const SNAPSHOT_CRC_MAGIC: &[u8; 4] = b"TDX1";

impl HnswIndex {
    /// Serialize the graph to `path` with an integrity footer.
    pub fn serialize(&self, path: &Path) -> Result<()> {
        let bytes = bincode::serialize(self)
            .map_err(|e| Error::PersistenceFailed(format!("snapshot encode: {e}")))?;
        let crc = crc32fast::hash(&bytes);

        let mut out = Vec::with_capacity(bytes.len() + 8);
        out.extend_from_slice(&bytes);
        out.extend_from_slice(SNAPSHOT_CRC_MAGIC);
        out.extend_from_slice(&crc.to_be_bytes());
        fs::write(path, &out)?;
        tracing::info!(
            path = %path.display(),
            bytes = bytes.len(),
            crc = format_args!("{crc:#010x}"),
            "serialized hnsw snapshot"
        );
        Ok(())
    }

    /// Load a graph from `path`, verifying the CRC32 footer and the
    /// structural invariants of the deserialized graph.
    ///
    /// Footer-less files are accepted as legacy snapshots with a warning.
    pub fn deserialize(path: &Path) -> Result<Self> {
        let raw = fs::read(path)?;

        let payload: &[u8] = if raw.len() >= 8 && &raw[raw.len() - 8..raw.len() - 4] == SNAPSHOT_CRC_MAGIC
        {
            let payload = &raw[..raw.len() - 8];
            let stored_crc = u32::from_be_bytes([
                raw[raw.len() - 4],
                raw[raw.len() - 3],
                raw[raw.len() - 2],
                raw[raw.len() - 1],
            ]);
            let computed_crc = crc32fast::hash(payload);
            if computed_crc != stored_crc {
                return Err(Error::InvalidStoredValue(format!(
                    "snapshot CRC32 mismatch: expected {stored_crc:#010x}, got {computed_crc:#010x} ({})",
                    path.display()
                )));
            }
            tracing::debug!(crc = format_args!("{stored_crc:#010x}"), "snapshot CRC32 verified");
            payload
        } else {
            tracing::warn!(path = %path.display(), "snapshot has no CRC32 footer (legacy format)");
            &raw
        };

        let index: HnswIndex = bincode::deserialize(payload)
            .map_err(|e| Error::InvalidStoredValue(format!("snapshot decode: {e}")))?;
        index.validate()?;
        tracing::info!(
            path = %path.display(),
            nodes = index.node_count,
            active = index.active_count(),
            "loaded hnsw snapshot"
        );
        Ok(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hnsw::distance::DistanceSpace;
    use crate::hnsw::graph::HnswConfig;

    fn scratch_file(name: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("tridex_snap_{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir.join(name)
    }

    fn sample_index() -> HnswIndex {
        let mut idx = HnswIndex::new(HnswConfig::new(3, DistanceSpace::Cosine));
        idx.add(&[1.0, 0.0, 0.0], 0).unwrap();
        idx.add(&[0.0, 1.0, 0.0], 1).unwrap();
        idx.add(&[0.0, 0.0, 1.0], 2).unwrap();
        idx.mark_deleted(1);
        idx
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let path = scratch_file("graph.idx");
        let idx = sample_index();
        idx.serialize(&path).unwrap();

        let loaded = HnswIndex::deserialize(&path).unwrap();
        assert_eq!(loaded.node_count, 3);
        assert_eq!(loaded.active_count(), 2);
        assert!(loaded.is_deleted(1));
        assert_eq!(loaded.vector(0), &[1.0, 0.0, 0.0]);
        std::fs::remove_dir_all(path.parent().unwrap()).unwrap();
    }

    #[test]
    fn test_corrupted_snapshot_detected() {
        let path = scratch_file("graph.idx");
        sample_index().serialize(&path).unwrap();

        let mut data = std::fs::read(&path).unwrap();
        let mid = data.len() / 2;
        data[mid] ^= 0xFF;
        std::fs::write(&path, &data).unwrap();

        assert!(HnswIndex::deserialize(&path).is_err());
        std::fs::remove_dir_all(path.parent().unwrap()).unwrap();
    }

    #[test]
    fn test_legacy_snapshot_without_footer_loads() {
        let path = scratch_file("graph.idx");
        let idx = sample_index();
        let bytes = bincode::serialize(&idx).unwrap();
        std::fs::write(&path, &bytes).unwrap();

        let loaded = HnswIndex::deserialize(&path).unwrap();
        assert_eq!(loaded.node_count, 3);
        std::fs::remove_dir_all(path.parent().unwrap()).unwrap();
    }

    #[test]
    fn test_search_after_reload() {
        let path = scratch_file("graph.idx");
        sample_index().serialize(&path).unwrap();
        let loaded = HnswIndex::deserialize(&path).unwrap();
        let hits = loaded.knn(&[0.0, 0.0, 1.0], 1);
        assert_eq!(hits[0].0, 2);
        std::fs::remove_dir_all(path.parent().unwrap()).unwrap();
    }
}
