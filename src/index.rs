//! Brute-force cosine vector index with directory persistence.
//!
//! The index keeps chunk vectors in insertion order alongside a document
//! store (chunk id → [`Chunk`]) and a position → chunk id mapping. Search
//! scores every vector against the query and returns the top `k` nearest
//! first; equal scores keep insertion order.
//!
//! # On-disk layout
//!
//! ```text
//! <dir>/
//!   index.bin        vectors: "QAVI" magic, version, dims, count, then LE f32s
//!   docstore.json    chunk id → chunk (text, source, role, hash)
//!   index_to_id.json position → chunk id
//!   manifest.json    model, dims, count, target page, build time, fingerprint
//! ```
//!
//! [`VectorIndex::persist`] writes all four files into a sibling staging
//! directory and then swaps it into place with renames, so an interrupted
//! build never leaves a half-written live index behind. A rebuild always
//! replaces every artifact; there is no append mode.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use crate::error::{QaError, QaResult};
use crate::models::{Chunk, ChunkRole};

const INDEX_FILE: &str = "index.bin";
const DOCSTORE_FILE: &str = "docstore.json";
const INDEX_TO_ID_FILE: &str = "index_to_id.json";
const MANIFEST_FILE: &str = "manifest.json";

const MAGIC: &[u8; 4] = b"QAVI";
const FORMAT_VERSION: u32 = 1;

/// Metadata persisted next to the vectors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexManifest {
    pub format_version: u32,
    /// Embedding model that produced the vectors.
    pub model: String,
    pub dims: usize,
    pub chunk_count: usize,
    /// File name of the target HTML page.
    pub target_html: Option<String>,
    pub built_at: chrono::DateTime<chrono::Utc>,
    /// SHA-256 over the chunk hashes in index order.
    pub fingerprint: String,
}

/// A chunk and its similarity to the query.
#[derive(Debug, Clone, Copy)]
pub struct SearchHit<'a> {
    pub chunk: &'a Chunk,
    pub score: f32,
}

#[derive(Debug, Clone)]
pub struct VectorIndex {
    manifest: IndexManifest,
    vectors: Vec<Vec<f32>>,
    index_to_id: Vec<String>,
    docstore: BTreeMap<String, Chunk>,
}

impl VectorIndex {
    /// Build an index from parallel chunk/vector sequences.
    ///
    /// At least one item is required, both sequences must be the same
    /// length, and every vector must have the same dimensionality.
    pub fn build(
        chunks: Vec<Chunk>,
        vectors: Vec<Vec<f32>>,
        model: &str,
        target_html: Option<&str>,
    ) -> QaResult<Self> {
        if chunks.is_empty() {
            return Err(QaError::EmptyCorpus);
        }
        if chunks.len() != vectors.len() {
            return Err(QaError::Embedding(format!(
                "embedder returned {} vectors for {} chunks",
                vectors.len(),
                chunks.len()
            )));
        }
        let dims = vectors[0].len();
        if dims == 0 || vectors.iter().any(|v| v.len() != dims) {
            return Err(QaError::Embedding(
                "embedding vectors have inconsistent dimensionality".to_string(),
            ));
        }

        let fingerprint = fingerprint(&chunks);
        let index_to_id: Vec<String> = chunks.iter().map(|c| c.id.clone()).collect();
        let docstore: BTreeMap<String, Chunk> =
            chunks.into_iter().map(|c| (c.id.clone(), c)).collect();

        Ok(Self {
            manifest: IndexManifest {
                format_version: FORMAT_VERSION,
                model: model.to_string(),
                dims,
                chunk_count: index_to_id.len(),
                target_html: target_html.map(str::to_string),
                built_at: chrono::Utc::now(),
                fingerprint,
            },
            vectors,
            index_to_id,
            docstore,
        })
    }

    pub fn manifest(&self) -> &IndexManifest {
        &self.manifest
    }

    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }

    /// The `k` chunks nearest to `query` by cosine similarity, nearest first.
    pub fn search(&self, query: &[f32], k: usize) -> QaResult<Vec<SearchHit<'_>>> {
        if query.len() != self.manifest.dims {
            return Err(QaError::Embedding(format!(
                "query vector has {} dims but the index was built with {}",
                query.len(),
                self.manifest.dims
            )));
        }

        let mut scored: Vec<(usize, f32)> = self
            .vectors
            .iter()
            .enumerate()
            .map(|(i, v)| (i, cosine_similarity(query, v)))
            .collect();
        // Stable sort: ties keep insertion order.
        scored.sort_by(|a, b| b.1.total_cmp(&a.1));
        scored.truncate(k);

        Ok(scored
            .into_iter()
            .filter_map(|(i, score)| {
                self.docstore
                    .get(&self.index_to_id[i])
                    .map(|chunk| SearchHit { chunk, score })
            })
            .collect())
    }

    /// First chunk in index order from `source` with the given role.
    pub fn find_by_metadata(&self, source: &str, role: ChunkRole) -> Option<&Chunk> {
        self.index_to_id
            .iter()
            .filter_map(|id| self.docstore.get(id))
            .find(|c| c.source == source && c.role == role)
    }

    /// True if `dir` holds a complete persisted index.
    pub fn exists(dir: &Path) -> bool {
        dir.join(MANIFEST_FILE).is_file()
    }

    /// Read only the manifest of a persisted index.
    pub fn read_manifest(dir: &Path) -> QaResult<IndexManifest> {
        read_json(&dir.join(MANIFEST_FILE))
    }

    /// Write all artifacts to a staging directory, then swap it in for `dir`.
    pub fn persist(&self, dir: &Path) -> QaResult<()> {
        let staging = sibling(dir, "staging")?;
        if let Err(e) = self.write_artifacts(&staging) {
            let _ = std::fs::remove_dir_all(&staging);
            return Err(e);
        }

        let retired = sibling(dir, "old")?;
        let had_previous = dir.exists();
        if had_previous {
            std::fs::rename(dir, &retired).map_err(|e| {
                let _ = std::fs::remove_dir_all(&staging);
                QaError::IndexIo(format!("cannot retire previous index {}: {}", dir.display(), e))
            })?;
        }
        if let Err(e) = std::fs::rename(&staging, dir) {
            if had_previous {
                let _ = std::fs::rename(&retired, dir);
            }
            let _ = std::fs::remove_dir_all(&staging);
            return Err(QaError::IndexIo(format!(
                "cannot move staged index into {}: {}",
                dir.display(),
                e
            )));
        }
        if had_previous {
            if let Err(e) = std::fs::remove_dir_all(&retired) {
                tracing::warn!(path = %retired.display(), error = %e, "failed to remove retired index");
            }
        }

        tracing::info!(
            dir = %dir.display(),
            chunks = self.len(),
            model = %self.manifest.model,
            "persisted vector index"
        );
        Ok(())
    }

    fn write_artifacts(&self, staging: &Path) -> QaResult<()> {
        std::fs::create_dir_all(staging)?;

        let mut bin = Vec::with_capacity(16 + self.len() * self.manifest.dims * 4);
        bin.extend_from_slice(MAGIC);
        bin.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        bin.extend_from_slice(&(self.manifest.dims as u32).to_le_bytes());
        bin.extend_from_slice(&(self.len() as u32).to_le_bytes());
        for v in &self.vectors {
            bin.extend_from_slice(&vec_to_blob(v));
        }
        std::fs::write(staging.join(INDEX_FILE), bin)?;

        write_json(&staging.join(DOCSTORE_FILE), &self.docstore)?;
        write_json(&staging.join(INDEX_TO_ID_FILE), &self.index_to_id)?;
        // Manifest last: its presence marks the directory as complete.
        write_json(&staging.join(MANIFEST_FILE), &self.manifest)?;
        Ok(())
    }

    /// Read a persisted index back. Fails with [`QaError::IndexIo`] on any
    /// missing, corrupt, or mutually inconsistent artifact.
    pub fn load(dir: &Path) -> QaResult<Self> {
        let manifest: IndexManifest = read_json(&dir.join(MANIFEST_FILE))?;
        if manifest.format_version != FORMAT_VERSION {
            return Err(QaError::IndexIo(format!(
                "unsupported index format version {}",
                manifest.format_version
            )));
        }
        let docstore: BTreeMap<String, Chunk> = read_json(&dir.join(DOCSTORE_FILE))?;
        let index_to_id: Vec<String> = read_json(&dir.join(INDEX_TO_ID_FILE))?;
        let vectors = read_vectors(&dir.join(INDEX_FILE))?;

        let dims = vectors.first().map(|v| v.len()).unwrap_or(0);
        if vectors.len() != index_to_id.len()
            || vectors.len() != manifest.chunk_count
            || dims != manifest.dims
        {
            return Err(QaError::IndexIo(format!(
                "index artifacts in {} disagree on size",
                dir.display()
            )));
        }
        if let Some(missing) = index_to_id.iter().find(|id| !docstore.contains_key(*id)) {
            return Err(QaError::IndexIo(format!(
                "chunk {} is mapped but missing from the document store",
                missing
            )));
        }

        tracing::info!(dir = %dir.display(), chunks = vectors.len(), "loaded vector index");
        Ok(Self {
            manifest,
            vectors,
            index_to_id,
            docstore,
        })
    }
}

fn read_vectors(path: &Path) -> QaResult<Vec<Vec<f32>>> {
    let bytes = std::fs::read(path)
        .map_err(|e| QaError::IndexIo(format!("cannot read {}: {}", path.display(), e)))?;
    if bytes.len() < 16 || &bytes[..4] != MAGIC {
        return Err(QaError::IndexIo(format!("{} is not a vector index", path.display())));
    }
    let read_u32 = |at: usize| u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);
    let version = read_u32(4);
    let dims = read_u32(8) as usize;
    let count = read_u32(12) as usize;
    if version != FORMAT_VERSION {
        return Err(QaError::IndexIo(format!("unsupported vector format version {}", version)));
    }
    let body = &bytes[16..];
    if dims == 0 || body.len() != dims * count * 4 {
        return Err(QaError::IndexIo(format!("{} is truncated or corrupt", path.display())));
    }
    Ok(body.chunks_exact(dims * 4).map(blob_to_vec).collect())
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> QaResult<()> {
    let data = serde_json::to_vec(value).map_err(|e| QaError::IndexIo(e.to_string()))?;
    std::fs::write(path, data)
        .map_err(|e| QaError::IndexIo(format!("cannot write {}: {}", path.display(), e)))
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> QaResult<T> {
    let data = std::fs::read(path)
        .map_err(|e| QaError::IndexIo(format!("cannot read {}: {}", path.display(), e)))?;
    serde_json::from_slice(&data)
        .map_err(|e| QaError::IndexIo(format!("cannot parse {}: {}", path.display(), e)))
}

/// `<dir>.<tag>-<uuid>`, on the same filesystem as `dir` so the
/// swap is a rename.
fn sibling(dir: &Path, tag: &str) -> QaResult<PathBuf> {
    let name = dir
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| QaError::IndexIo(format!("invalid index directory: {}", dir.display())))?;
    let parent = match dir.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    Ok(parent.join(format!("{}.{}-{}", name, tag, uuid::Uuid::new_v4())))
}

fn fingerprint(chunks: &[Chunk]) -> String {
    let mut hasher = Sha256::new();
    for c in chunks {
        hasher.update(c.hash.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn chunk(id: &str, text: &str, role: ChunkRole) -> Chunk {
        Chunk {
            id: id.to_string(),
            text: text.to_string(),
            source: format!("{}.md", id),
            role,
            hash: format!("{:0>64}", id),
        }
    }

    fn sample() -> VectorIndex {
        let chunks = vec![
            chunk("a", "alpha", ChunkRole::SupportDoc),
            chunk("b", "beta", ChunkRole::SupportDoc),
            chunk("c", "gamma", ChunkRole::HtmlFull),
            chunk("d", "delta", ChunkRole::HtmlText),
        ];
        let vectors = vec![
            vec![1.0, 0.0, 0.0],
            vec![0.0, 1.0, 0.0],
            vec![0.7, 0.7, 0.0],
            vec![1.0, 0.0, 0.0],
        ];
        VectorIndex::build(chunks, vectors, "test-model", Some("c.md")).unwrap()
    }

    fn texts(hits: &[SearchHit<'_>]) -> Vec<String> {
        hits.iter().map(|h| h.chunk.text.clone()).collect()
    }

    #[test]
    fn search_orders_nearest_first_with_stable_ties() {
        let index = sample();
        let hits = index.search(&[1.0, 0.0, 0.0], 3).unwrap();
        // alpha and delta tie; alpha was inserted first.
        assert_eq!(texts(&hits), vec!["alpha", "delta", "gamma"]);
        assert!(hits[0].score >= hits[2].score);
    }

    #[test]
    fn k_larger_than_index_returns_everything() {
        let index = sample();
        let hits = index.search(&[0.0, 1.0, 0.0], 50).unwrap();
        assert_eq!(hits.len(), 4);
        assert_eq!(hits[0].chunk.text, "beta");
    }

    #[test]
    fn nan_scores_still_rank_every_chunk() {
        let index = sample();
        let hits = index.search(&[f32::NAN, 0.0, 0.0], 4).unwrap();
        assert_eq!(hits.len(), 4);
    }

    #[test]
    fn wrong_query_dims_is_an_error() {
        assert!(sample().search(&[1.0, 0.0], 2).is_err());
    }

    #[test]
    fn build_rejects_empty_and_mismatched_input() {
        assert!(matches!(
            VectorIndex::build(vec![], vec![], "m", None),
            Err(QaError::EmptyCorpus)
        ));
        let one = vec![chunk("a", "alpha", ChunkRole::SupportDoc)];
        assert!(VectorIndex::build(one.clone(), vec![], "m", None).is_err());
        let two = vec![one[0].clone(), chunk("b", "beta", ChunkRole::SupportDoc)];
        assert!(VectorIndex::build(two, vec![vec![1.0], vec![1.0, 2.0]], "m", None).is_err());
    }

    #[test]
    fn persist_load_roundtrip_preserves_ranking() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("kb");
        let index = sample();
        index.persist(&dir).unwrap();
        assert!(VectorIndex::exists(&dir));

        let loaded = VectorIndex::load(&dir).unwrap();
        assert_eq!(loaded.manifest(), index.manifest());
        for q in [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.3, 0.9, 0.1]] {
            assert_eq!(
                texts(&index.search(&q, 4).unwrap()),
                texts(&loaded.search(&q, 4).unwrap())
            );
        }
    }

    #[test]
    fn persist_replaces_previous_index_and_leaves_no_staging() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("kb");
        sample().persist(&dir).unwrap();

        let replacement = VectorIndex::build(
            vec![chunk("z", "zeta", ChunkRole::SupportDoc)],
            vec![vec![0.0, 0.0, 1.0]],
            "test-model",
            None,
        )
        .unwrap();
        replacement.persist(&dir).unwrap();

        let loaded = VectorIndex::load(&dir).unwrap();
        assert_eq!(loaded.len(), 1);
        let leftovers: Vec<_> = std::fs::read_dir(tmp.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name() != "kb")
            .collect();
        assert!(leftovers.is_empty(), "unexpected leftovers: {:?}", leftovers);
    }

    #[test]
    fn load_rejects_corrupt_vectors() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("kb");
        sample().persist(&dir).unwrap();
        std::fs::write(dir.join(INDEX_FILE), b"QAVI\x01\x00\x00\x00").unwrap();
        assert!(matches!(VectorIndex::load(&dir), Err(QaError::IndexIo(_))));
    }

    #[test]
    fn load_of_missing_dir_is_io_error() {
        let tmp = TempDir::new().unwrap();
        assert!(!VectorIndex::exists(&tmp.path().join("nope")));
        assert!(matches!(
            VectorIndex::load(&tmp.path().join("nope")),
            Err(QaError::IndexIo(_))
        ));
    }

    #[test]
    fn metadata_lookup_filters_by_source_and_role() {
        let index = sample();
        assert_eq!(
            index.find_by_metadata("c.md", ChunkRole::HtmlFull).map(|c| c.text.as_str()),
            Some("gamma")
        );
        assert!(index.find_by_metadata("c.md", ChunkRole::HtmlText).is_none());
    }
}
