//! Knowledge base manager and context retriever.
//!
//! [`KnowledgeBase`] owns the process's active vector index and runs the
//! build pipeline:
//!
//! ```text
//! uploads ──► parse ──► chunk ──► embed ──► index ──► persist ──► publish
//! ```
//!
//! Builds are serialized by a build lock and are all-or-nothing: any stage
//! failure leaves both the in-memory index and the persisted directory as
//! they were. Readers take a cheap `Arc` snapshot of the active index, so a
//! slow build never blocks retrieval against the previous knowledge base.
//!
//! When no index is resident, the first retrieval loads the persisted one.
//! Concurrent first readers share that single load.

use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

use crate::chunk::chunk_documents;
use crate::config::Config;
use crate::embedding::{embed_query, Embedder, EmbeddingHandle};
use crate::error::{BuildStage, QaError, QaResult};
use crate::extract::{parse_document, parse_target_html, DocumentKind};
use crate::index::{IndexManifest, VectorIndex};
use crate::models::{Chunk, ChunkRole, RetrievalResult, SourceDocument, UploadedFile};

/// Outcome of a successful build.
#[derive(Debug, Clone, Serialize)]
pub struct BuildSummary {
    /// Supporting documents that yielded text.
    pub documents: usize,
    /// Supporting documents skipped as unsupported or unreadable.
    pub skipped: Vec<String>,
    pub chunks: usize,
    pub target_html: String,
    pub model: String,
    pub dims: usize,
}

pub struct KnowledgeBase {
    embedding: Arc<EmbeddingHandle>,
    index_dir: PathBuf,
    chunk_size: usize,
    chunk_overlap: usize,
    embed_batch_size: usize,
    active: RwLock<Option<Arc<VectorIndex>>>,
    build_lock: Mutex<()>,
    /// Held while reading or replacing the persisted directory.
    load_lock: Mutex<()>,
}

impl KnowledgeBase {
    pub fn new(config: &Config, embedding: Arc<EmbeddingHandle>) -> Self {
        Self {
            embedding,
            index_dir: config.index.dir.clone(),
            chunk_size: config.chunking.chunk_size,
            chunk_overlap: config.chunking.chunk_overlap,
            embed_batch_size: config.embedding.batch_size.max(1),
            active: RwLock::new(None),
            build_lock: Mutex::new(()),
            load_lock: Mutex::new(()),
        }
    }

    pub fn index_dir(&self) -> &Path {
        &self.index_dir
    }

    /// True if an index is resident or persisted. Never triggers a load.
    pub async fn is_ready(&self) -> bool {
        self.active.read().await.is_some() || VectorIndex::exists(&self.index_dir)
    }

    /// Manifest of the resident index, or of the persisted one if none is
    /// resident. `None` when no knowledge base exists.
    pub async fn manifest(&self) -> QaResult<Option<IndexManifest>> {
        if let Some(index) = self.active.read().await.as_ref() {
            return Ok(Some(index.manifest().clone()));
        }
        if !VectorIndex::exists(&self.index_dir) {
            return Ok(None);
        }
        VectorIndex::read_manifest(&self.index_dir).map(Some)
    }

    /// Build a fresh knowledge base from supporting documents plus the
    /// target HTML page, replacing any existing one.
    pub async fn build(
        &self,
        documents: Vec<UploadedFile>,
        html_file: Option<UploadedFile>,
    ) -> QaResult<BuildSummary> {
        if documents.is_empty() {
            return Err(QaError::UnsupportedInput(
                "at least one supporting document is required".to_string(),
            ));
        }
        let html_file = html_file.ok_or_else(|| {
            QaError::UnsupportedInput("a target HTML file is required".to_string())
        })?;
        if DocumentKind::from_filename(&html_file.filename) != Some(DocumentKind::Html) {
            return Err(QaError::UnsupportedInput(format!(
                "target file must be HTML: {}",
                html_file.filename
            )));
        }

        let _build = self.build_lock.lock().await;
        let started = std::time::Instant::now();
        let target_html = html_file.filename.clone();
        tracing::info!(documents = documents.len(), page = %target_html, "building knowledge base");

        let (parsed, skipped) = offload(BuildStage::Parse, move || parse_uploads(documents, html_file))
            .await
            .map_err(|e| e.at_stage(BuildStage::Parse))?;
        let supporting = parsed.iter().filter(|d| d.role == ChunkRole::SupportDoc).count();

        let (chunk_size, chunk_overlap) = (self.chunk_size, self.chunk_overlap);
        let chunks = offload(BuildStage::Chunk, move || {
            chunk_documents(&parsed, chunk_size, chunk_overlap)
        })
        .await
        .map_err(|e| e.at_stage(BuildStage::Chunk))?;
        tracing::info!(chunks = chunks.len(), "chunked corpus");

        let embedder = self
            .embedding
            .get()
            .await
            .map_err(|e| e.at_stage(BuildStage::Embed))?;
        let vectors = self
            .embed_chunks(embedder.as_ref(), &chunks)
            .await
            .map_err(|e| e.at_stage(BuildStage::Embed))?;

        let index = VectorIndex::build(chunks, vectors, embedder.model_name(), Some(&target_html))
            .map_err(|e| e.at_stage(BuildStage::Index))?;
        let index = Arc::new(index);

        {
            let _load = self.load_lock.lock().await;
            let dir = self.index_dir.clone();
            let staged = index.clone();
            offload(BuildStage::Persist, move || staged.persist(&dir))
                .await
                .map_err(|e| e.at_stage(BuildStage::Persist))?;
            *self.active.write().await = Some(index.clone());
        }

        let manifest = index.manifest();
        tracing::info!(
            chunks = manifest.chunk_count,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "knowledge base built"
        );
        Ok(BuildSummary {
            documents: supporting,
            skipped,
            chunks: manifest.chunk_count,
            target_html,
            model: manifest.model.clone(),
            dims: manifest.dims,
        })
    }

    async fn embed_chunks(&self, embedder: &dyn Embedder, chunks: &[Chunk]) -> QaResult<Vec<Vec<f32>>> {
        let mut vectors = Vec::with_capacity(chunks.len());
        for batch in chunks.chunks(self.embed_batch_size) {
            let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
            let embedded = embedder.embed(&texts).await?;
            if embedded.len() != texts.len() {
                return Err(QaError::Embedding(format!(
                    "embedder returned {} vectors for {} texts",
                    embedded.len(),
                    texts.len()
                )));
            }
            vectors.extend(embedded);
        }
        Ok(vectors)
    }

    /// Top-`k` chunks for `query`, with aligned source names.
    pub async fn retrieve(&self, query: &str, k: usize) -> QaResult<RetrievalResult> {
        let index = self.active_index().await?;
        let hits = self.search(&index, query, k).await?;

        let result = RetrievalResult {
            chunks: hits.iter().map(|c| c.text.clone()).collect(),
            sources: hits.into_iter().map(|c| c.source).collect(),
        };
        tracing::info!(
            k,
            retrieved = result.chunks.len(),
            query = %truncate(query, 50),
            "retrieved context"
        );
        Ok(result)
    }

    /// Locate the full raw markup of the target page.
    ///
    /// Searches the top `k` chunks for the page's file name and keeps the
    /// first whose source and role both match. If ranking buries it, the
    /// document store is scanned by metadata instead.
    pub async fn target_markup(&self, k: usize) -> QaResult<(String, String)> {
        let index = self.active_index().await?;
        let target = index
            .manifest()
            .target_html
            .clone()
            .ok_or_else(|| QaError::TargetMarkupNotFound("<unrecorded target page>".to_string()))?;

        let hits = self.search(&index, &target, k).await?;
        if let Some(chunk) = hits
            .into_iter()
            .find(|c| c.source == target && c.role == ChunkRole::HtmlFull)
        {
            return Ok((target, chunk.text));
        }

        match index.find_by_metadata(&target, ChunkRole::HtmlFull) {
            Some(chunk) => {
                tracing::warn!(page = %target, k, "target markup not in top-k; found by metadata scan");
                Ok((target, chunk.text.clone()))
            }
            None => {
                tracing::error!(page = %target, "target markup not found in knowledge base");
                Err(QaError::TargetMarkupNotFound(target))
            }
        }
    }

    async fn search(&self, index: &Arc<VectorIndex>, query: &str, k: usize) -> QaResult<Vec<Chunk>> {
        let embedder = self.embedding.get().await?;
        let query_vec = embed_query(embedder.as_ref(), query).await?;
        let index = index.clone();
        tokio::task::spawn_blocking(move || {
            index
                .search(&query_vec, k)
                .map(|hits| hits.into_iter().map(|h| h.chunk.clone()).collect())
        })
        .await
        .map_err(|e| QaError::IndexIo(format!("search task failed: {}", e)))?
    }

    /// The resident index, loading the persisted one on first use.
    async fn active_index(&self) -> QaResult<Arc<VectorIndex>> {
        if let Some(index) = self.active.read().await.clone() {
            return Ok(index);
        }

        let _load = self.load_lock.lock().await;
        // Another caller may have finished loading while we waited.
        if let Some(index) = self.active.read().await.clone() {
            return Ok(index);
        }
        if !VectorIndex::exists(&self.index_dir) {
            tracing::error!(dir = %self.index_dir.display(), "no resident or persisted knowledge base");
            return Err(QaError::KnowledgeBaseNotReady);
        }

        let dir = self.index_dir.clone();
        let index = tokio::task::spawn_blocking(move || VectorIndex::load(&dir))
            .await
            .map_err(|e| QaError::IndexIo(format!("load task failed: {}", e)))??;

        let embedder = self.embedding.get().await?;
        check_model(index.manifest(), embedder.as_ref())?;

        let index = Arc::new(index);
        *self.active.write().await = Some(index.clone());
        Ok(index)
    }
}

/// Vectors from a different model live in a different space; refuse them.
fn check_model(manifest: &IndexManifest, embedder: &dyn Embedder) -> QaResult<()> {
    if manifest.model != embedder.model_name() || manifest.dims != embedder.dims() {
        return Err(QaError::IndexIo(format!(
            "index was built with {} ({} dims) but the active embedding model is {} ({} dims); rebuild the knowledge base",
            manifest.model,
            manifest.dims,
            embedder.model_name(),
            embedder.dims()
        )));
    }
    Ok(())
}

/// Parse supporting documents (skipping ones that yield no text) and split
/// the target page into its `html_full` and `html_text` records.
fn parse_uploads(
    documents: Vec<UploadedFile>,
    html_file: UploadedFile,
) -> QaResult<(Vec<SourceDocument>, Vec<String>)> {
    let mut parsed = Vec::with_capacity(documents.len() + 2);
    let mut skipped = Vec::new();

    for file in documents {
        let text = parse_document(&file.filename, &file.bytes);
        if text.trim().is_empty() {
            skipped.push(file.filename);
            continue;
        }
        tracing::info!(source = %file.filename, chars = text.len(), "parsed support document");
        parsed.push(SourceDocument {
            source: file.filename,
            role: ChunkRole::SupportDoc,
            text,
        });
    }

    let page = parse_target_html(&html_file.filename, &html_file.bytes)
        .map_err(|e| QaError::UnsupportedInput(format!("{}: {}", html_file.filename, e)))?;
    tracing::info!(source = %html_file.filename, "parsed target HTML");
    parsed.extend(page);

    Ok((parsed, skipped))
}

async fn offload<T, F>(stage: BuildStage, work: F) -> QaResult<T>
where
    F: FnOnce() -> QaResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| QaError::IndexIo(format!("{} task failed: {}", stage, e)))?
}

fn truncate(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((at, _)) => format!("{}...", &s[..at]),
        None => s.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tempfile::TempDir;

    /// Letter-frequency vectors: deterministic and cheap.
    struct LetterEmbedder;

    #[async_trait]
    impl Embedder for LetterEmbedder {
        fn model_name(&self) -> &str {
            "letters"
        }
        fn dims(&self) -> usize {
            26
        }
        async fn embed(&self, texts: &[String]) -> QaResult<Vec<Vec<f32>>> {
            Ok(texts
                .iter()
                .map(|t| {
                    let mut v = vec![0.0f32; 26];
                    for c in t.to_ascii_lowercase().bytes().filter(u8::is_ascii_lowercase) {
                        v[(c - b'a') as usize] += 1.0;
                    }
                    v
                })
                .collect())
        }
    }

    fn kb(dir: &Path) -> KnowledgeBase {
        let mut config = Config::default();
        config.index.dir = dir.join("kb");
        KnowledgeBase::new(&config, Arc::new(EmbeddingHandle::preloaded(Arc::new(LetterEmbedder))))
    }

    fn html() -> UploadedFile {
        UploadedFile::new("checkout.html", "<html><body><h1>Checkout</h1></body></html>")
    }

    #[tokio::test]
    async fn build_requires_documents_and_html() {
        let tmp = TempDir::new().unwrap();
        let kb = kb(tmp.path());

        let err = kb.build(vec![], Some(html())).await.unwrap_err();
        assert!(matches!(err, QaError::UnsupportedInput(_)));

        let err = kb
            .build(vec![UploadedFile::new("a.md", "text")], None)
            .await
            .unwrap_err();
        assert!(matches!(err, QaError::UnsupportedInput(_)));

        let err = kb
            .build(vec![UploadedFile::new("a.md", "text")], Some(UploadedFile::new("page.txt", "x")))
            .await
            .unwrap_err();
        assert!(matches!(err, QaError::UnsupportedInput(_)));
        assert!(!kb.index_dir().exists());
    }

    #[tokio::test]
    async fn retrieve_before_build_is_not_ready() {
        let tmp = TempDir::new().unwrap();
        let kb = kb(tmp.path());
        assert!(!kb.is_ready().await);
        assert!(matches!(
            kb.retrieve("discount", 4).await,
            Err(QaError::KnowledgeBaseNotReady)
        ));
        assert!(kb.manifest().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn build_then_retrieve_with_sources() {
        let tmp = TempDir::new().unwrap();
        let kb = kb(tmp.path());
        let summary = kb
            .build(
                vec![
                    UploadedFile::new("specs.md", "Discount code SAVE15 applies fifteen percent."),
                    UploadedFile::new("notes.exe", vec![0u8, 1, 2]),
                ],
                Some(html()),
            )
            .await
            .unwrap();
        assert_eq!(summary.documents, 1);
        assert_eq!(summary.skipped, vec!["notes.exe"]);
        assert_eq!(summary.chunks, 3);
        assert!(kb.is_ready().await);

        let result = kb.retrieve("discount code", 10).await.unwrap();
        assert_eq!(result.chunks.len(), 3);
        assert_eq!(result.chunks.len(), result.sources.len());
        assert!(result.sources.contains(&"specs.md".to_string()));
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 2), "hé...");
        assert_eq!(truncate("hi", 5), "hi");
    }
}
