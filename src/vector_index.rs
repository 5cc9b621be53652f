//! Append-only vector index adapter.
//!
//! The adapter owns id bookkeeping and flush-interval durability; the
//! distance computation behind [`VectorIndex::search`] is a replaceable
//! kernel (currently an exact cosine scan — callers only rely on the
//! contract: k nearest by ascending distance). There is no deletion path;
//! the supported correction route is a full rebuild.
//!
//! Persisted artifacts, written atomically (temp + rename):
//! - `vectors.bin` — little-endian f32, row-major, aligned by insertion order
//! - `ids.bin` — little-endian i64, one per vector, same order
//! - `meta.json` — dimension, count, and embedding model identifier
//!
//! Concurrency: single-writer, multiple-reader. `add`/`flush` take
//! `&mut self`; the ingestion pipeline owns the index exclusively, and
//! queries load their own read-only instance.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;

use crate::error::VectorIndexError;

#[derive(Debug, Serialize, Deserialize)]
struct IndexMeta {
    dim: usize,
    count: usize,
    model: String,
}

#[derive(Debug)]
pub struct VectorIndex {
    dim: usize,
    model: String,
    ids: Vec<i64>,
    id_set: HashSet<i64>,
    // Row-major, ids.len() * dim entries.
    vectors: Vec<f32>,
}

impl VectorIndex {
    pub fn new(dim: usize, model: &str) -> Self {
        Self {
            dim,
            model: model.to_string(),
            ids: Vec::new(),
            id_set: HashSet::new(),
            vectors: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Highest id present, or 0 for an empty index. Ids are appended in
    /// insertion order, so this is the durable vectorization watermark
    /// once flushed.
    pub fn max_id(&self) -> i64 {
        self.ids.iter().copied().max().unwrap_or(0)
    }

    /// Append a batch. Rejects duplicate ids (the index is append-only)
    /// and dimension mismatches; on rejection nothing is appended.
    pub fn add(&mut self, ids: &[i64], vectors: &[Vec<f32>]) -> Result<(), VectorIndexError> {
        if ids.len() != vectors.len() {
            return Err(VectorIndexError::LengthMismatch {
                ids: ids.len(),
                vectors: vectors.len(),
            });
        }
        for id in ids {
            if self.id_set.contains(id) {
                return Err(VectorIndexError::DuplicateId(*id));
            }
        }
        for vector in vectors {
            if vector.len() != self.dim {
                return Err(VectorIndexError::DimensionMismatch {
                    stored: self.dim,
                    configured: vector.len(),
                });
            }
        }

        for (id, vector) in ids.iter().zip(vectors.iter()) {
            self.ids.push(*id);
            self.id_set.insert(*id);
            self.vectors.extend_from_slice(vector);
        }
        Ok(())
    }

    /// K nearest neighbors as `(id, distance)` with `distance = 1 − cosine`,
    /// ascending. Ties break by ascending id for determinism.
    pub fn search(&self, query: &[f32], k: usize) -> Vec<(i64, f32)> {
        if self.is_empty() || query.len() != self.dim || k == 0 {
            return Vec::new();
        }

        let mut scored: Vec<(i64, f32)> = self
            .ids
            .iter()
            .enumerate()
            .map(|(i, id)| {
                let row = &self.vectors[i * self.dim..(i + 1) * self.dim];
                let distance = 1.0 - crate::embedding::cosine_similarity(query, row);
                (*id, distance)
            })
            .collect();

        scored.sort_by(|a, b| {
            a.1.partial_cmp(&b.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.0.cmp(&b.0))
        });
        scored.truncate(k);
        scored
    }

    /// Persist to `dir`. Each artifact is written to a temp file and
    /// renamed so a crash mid-flush leaves the previous state intact.
    pub fn flush(&self, dir: &Path) -> Result<(), VectorIndexError> {
        fs::create_dir_all(dir)?;

        let meta = IndexMeta {
            dim: self.dim,
            count: self.ids.len(),
            model: self.model.clone(),
        };

        write_atomic(
            &dir.join("vectors.bin"),
            &crate::embedding::vec_to_blob(&self.vectors),
        )?;

        let mut id_bytes = Vec::with_capacity(self.ids.len() * 8);
        for id in &self.ids {
            id_bytes.extend_from_slice(&id.to_le_bytes());
        }
        write_atomic(&dir.join("ids.bin"), &id_bytes)?;

        write_atomic(&dir.join("meta.json"), &serde_json::to_vec_pretty(&meta)?)?;
        Ok(())
    }

    /// Restore from `dir`, validating the stored model identifier and
    /// dimension against the current configuration — mismatches fail fast
    /// because vectors from different models are not comparable. A missing
    /// directory yields an empty index (search degrades to lexical-only).
    pub fn load(
        dir: &Path,
        expected_model: &str,
        expected_dims: usize,
    ) -> Result<Self, VectorIndexError> {
        let meta_path = dir.join("meta.json");
        if !meta_path.exists() {
            return Ok(Self::new(expected_dims, expected_model));
        }

        let meta: IndexMeta = serde_json::from_slice(&fs::read(&meta_path)?)?;
        if meta.model != expected_model {
            return Err(VectorIndexError::ModelMismatch {
                stored: meta.model,
                configured: expected_model.to_string(),
            });
        }
        if meta.dim != expected_dims {
            return Err(VectorIndexError::DimensionMismatch {
                stored: meta.dim,
                configured: expected_dims,
            });
        }

        let vectors = crate::embedding::blob_to_vec(&fs::read(dir.join("vectors.bin"))?);
        let ids: Vec<i64> = fs::read(dir.join("ids.bin"))?
            .chunks_exact(8)
            .map(|c| i64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
            .collect();

        if ids.len() != meta.count || vectors.len() != meta.count * meta.dim {
            return Err(VectorIndexError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!(
                    "index artifacts disagree: meta says {} vectors of dim {}, found {} ids and {} floats",
                    meta.count,
                    meta.dim,
                    ids.len(),
                    vectors.len()
                ),
            )));
        }

        let id_set = ids.iter().copied().collect();
        Ok(Self {
            dim: meta.dim,
            model: meta.model,
            ids,
            id_set,
            vectors,
        })
    }

    /// Delete persisted artifacts, if any. Used by the rebuild path.
    pub fn clear_dir(dir: &Path) -> Result<(), VectorIndexError> {
        for name in ["vectors.bin", "ids.bin", "meta.json"] {
            let path = dir.join(name);
            if path.exists() {
                fs::remove_file(path)?;
            }
        }
        Ok(())
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), std::io::Error> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_index() -> VectorIndex {
        let mut index = VectorIndex::new(3, "test-model");
        index
            .add(
                &[1, 2, 3],
                &[
                    vec![1.0, 0.0, 0.0],
                    vec![0.0, 1.0, 0.0],
                    vec![0.9, 0.1, 0.0],
                ],
            )
            .unwrap();
        index
    }

    #[test]
    fn search_returns_nearest_first() {
        let index = sample_index();
        let results = index.search(&[1.0, 0.0, 0.0], 2);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].0, 1);
        assert!(results[0].1 < 1e-6);
        assert_eq!(results[1].0, 3);
        assert!(results[0].1 <= results[1].1);
    }

    #[test]
    fn duplicate_id_rejected() {
        let mut index = sample_index();
        let err = index.add(&[2], &[vec![0.0, 0.0, 1.0]]).unwrap_err();
        assert!(matches!(err, VectorIndexError::DuplicateId(2)));
        assert_eq!(index.len(), 3);
    }

    #[test]
    fn dimension_mismatch_rejected() {
        let mut index = sample_index();
        let err = index.add(&[9], &[vec![1.0, 0.0]]).unwrap_err();
        assert!(matches!(err, VectorIndexError::DimensionMismatch { .. }));
    }

    #[test]
    fn empty_index_returns_no_results() {
        let index = VectorIndex::new(3, "test-model");
        assert!(index.search(&[1.0, 0.0, 0.0], 5).is_empty());
    }

    #[test]
    fn flush_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let index = sample_index();
        index.flush(dir.path()).unwrap();

        let restored = VectorIndex::load(dir.path(), "test-model", 3).unwrap();
        assert_eq!(restored.len(), 3);
        assert_eq!(restored.max_id(), 3);
        let results = restored.search(&[0.0, 1.0, 0.0], 1);
        assert_eq!(results[0].0, 2);
    }

    #[test]
    fn load_rejects_model_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        sample_index().flush(dir.path()).unwrap();

        let err = VectorIndex::load(dir.path(), "other-model", 3).unwrap_err();
        assert!(matches!(err, VectorIndexError::ModelMismatch { .. }));
    }

    #[test]
    fn load_rejects_dimension_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        sample_index().flush(dir.path()).unwrap();

        let err = VectorIndex::load(dir.path(), "test-model", 8).unwrap_err();
        assert!(matches!(err, VectorIndexError::DimensionMismatch { .. }));
    }

    #[test]
    fn load_missing_dir_is_empty_index() {
        let dir = tempfile::tempdir().unwrap();
        let index = VectorIndex::load(&dir.path().join("absent"), "test-model", 3).unwrap();
        assert!(index.is_empty());
    }
}
