//! Embedding provider abstraction and implementations.
//!
//! Defines the [`Embedder`] trait and concrete backends:
//! - **[`LocalEmbedder`]** runs a fastembed model in-process; weights are
//!   downloaded once into `embedding.cache_dir` and reused across restarts.
//! - **[`OpenAIEmbedder`]** calls an OpenAI-compatible `/embeddings` endpoint.
//! - **[`OllamaEmbedder`]** calls a local Ollama instance's `/api/embed`.
//!
//! Loading a model is expensive, so callers never construct backends per
//! request. They share one [`EmbeddingHandle`], which memoizes the load with
//! single-flight semantics: the first caller performs the load, concurrent
//! callers await that same load, and everyone receives the same instance.
//!
//! Also provides vector utilities used by the index:
//! - [`cosine_similarity`] computes similarity between two vectors
//! - [`vec_to_blob`] / [`blob_to_vec`] encode vectors as little-endian `f32` bytes
//!
//! # Retry Strategy
//!
//! The HTTP backends use exponential backoff for transient errors:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Up to 3 retries with backoff of 1s, 2s, 4s

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;

use crate::config::EmbeddingConfig;
use crate::error::{QaError, QaResult};

const MAX_RETRIES: u32 = 3;

/// A loaded embedding model.
///
/// Implementations must be deterministic for a given model version: the
/// same text always maps to the same vector.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Returns the model identifier (e.g. `"all-minilm-l6-v2"`).
    fn model_name(&self) -> &str;
    /// Returns the embedding vector dimensionality (e.g. `384`).
    fn dims(&self) -> usize;
    /// Embed a batch of texts, returning one vector per input in order.
    async fn embed(&self, texts: &[String]) -> QaResult<Vec<Vec<f32>>>;
}

/// Produces a ready [`Embedder`]. Called at most once per successful load.
#[async_trait]
pub trait EmbedderLoader: Send + Sync {
    async fn load(&self) -> QaResult<Arc<dyn Embedder>>;
}

/// Process-wide, lazily loaded embedding model.
pub struct EmbeddingHandle {
    cell: OnceCell<Arc<dyn Embedder>>,
    loader: Box<dyn EmbedderLoader>,
}

impl EmbeddingHandle {
    pub fn new(loader: impl EmbedderLoader + 'static) -> Self {
        Self {
            cell: OnceCell::new(),
            loader: Box::new(loader),
        }
    }

    /// Handle that loads the backend selected by `config` on first use.
    pub fn from_config(config: &EmbeddingConfig) -> Self {
        Self::new(ConfigLoader {
            config: config.clone(),
        })
    }

    /// Handle around an already-constructed embedder.
    pub fn preloaded(embedder: Arc<dyn Embedder>) -> Self {
        Self {
            cell: OnceCell::new_with(Some(embedder)),
            loader: Box::new(ConfigLoader {
                config: EmbeddingConfig::default(),
            }),
        }
    }

    /// Return the shared embedder, loading it if this is the first call.
    ///
    /// Concurrent first callers share one in-flight load. A failed load is
    /// not cached; the next caller tries again.
    pub async fn get(&self) -> QaResult<Arc<dyn Embedder>> {
        let embedder = self
            .cell
            .get_or_try_init(|| async {
                let started = std::time::Instant::now();
                let embedder = self.loader.load().await?;
                tracing::info!(
                    model = embedder.model_name(),
                    dims = embedder.dims(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "embedding model loaded"
                );
                Ok::<_, QaError>(embedder)
            })
            .await?;
        Ok(embedder.clone())
    }

    pub fn is_loaded(&self) -> bool {
        self.cell.initialized()
    }
}

/// Embed a single query text.
pub async fn embed_query(embedder: &dyn Embedder, text: &str) -> QaResult<Vec<f32>> {
    embedder
        .embed(&[text.to_string()])
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| QaError::Embedding("empty embedding response".to_string()))
}

struct ConfigLoader {
    config: EmbeddingConfig,
}

#[async_trait]
impl EmbedderLoader for ConfigLoader {
    async fn load(&self) -> QaResult<Arc<dyn Embedder>> {
        create_embedder(&self.config).await
    }
}

/// Construct the backend named by `config.provider`.
///
/// | Config Value | Backend |
/// |-------------|----------|
/// | `"local"` | [`LocalEmbedder`] (requires the `local-embeddings-fastembed` feature) |
/// | `"openai"` | [`OpenAIEmbedder`] |
/// | `"ollama"` | [`OllamaEmbedder`] |
pub async fn create_embedder(config: &EmbeddingConfig) -> QaResult<Arc<dyn Embedder>> {
    match config.provider.as_str() {
        #[cfg(feature = "local-embeddings-fastembed")]
        "local" => Ok(Arc::new(LocalEmbedder::load(config).await?)),
        #[cfg(not(feature = "local-embeddings-fastembed"))]
        "local" => Err(QaError::Embedding(
            "local embedding provider requires --features local-embeddings-fastembed".to_string(),
        )),
        "openai" => Ok(Arc::new(OpenAIEmbedder::new(config)?)),
        "ollama" => Ok(Arc::new(OllamaEmbedder::new(config)?)),
        other => Err(QaError::Embedding(format!(
            "unknown embedding provider: {}",
            other
        ))),
    }
}

// ============ Local Provider (fastembed) ============

/// In-process embedding via fastembed (ONNX Runtime bundled).
///
/// Models are downloaded on first use from Hugging Face into the configured
/// cache directory. After that, embeddings run entirely offline.
#[cfg(feature = "local-embeddings-fastembed")]
pub struct LocalEmbedder {
    model_name: String,
    dims: usize,
    batch_size: usize,
    model: Arc<std::sync::Mutex<fastembed::TextEmbedding>>,
}

#[cfg(feature = "local-embeddings-fastembed")]
impl LocalEmbedder {
    /// Load (and on first run, download) the model. Runs on a blocking thread.
    pub async fn load(config: &EmbeddingConfig) -> QaResult<Self> {
        let (model_name, dims) = resolve_local_model(config);
        let fastembed_model = config_to_fastembed_model(&model_name)?;
        let cache_dir = config.cache_dir.clone();

        tracing::info!(model = %model_name, cache_dir = %cache_dir.display(), "loading local embedding model");
        let model = tokio::task::spawn_blocking(move || {
            std::fs::create_dir_all(&cache_dir)
                .map_err(|e| QaError::Embedding(format!("cannot create model cache: {}", e)))?;
            fastembed::TextEmbedding::try_new(
                fastembed::InitOptions::new(fastembed_model)
                    .with_cache_dir(cache_dir)
                    .with_show_download_progress(false),
            )
            .map_err(|e| {
                QaError::Embedding(format!("failed to initialize local embedding model: {}", e))
            })
        })
        .await
        .map_err(|e| QaError::Embedding(e.to_string()))??;

        Ok(Self {
            model_name,
            dims,
            batch_size: config.batch_size,
            model: Arc::new(std::sync::Mutex::new(model)),
        })
    }
}

#[cfg(feature = "local-embeddings-fastembed")]
#[async_trait]
impl Embedder for LocalEmbedder {
    fn model_name(&self) -> &str {
        &self.model_name
    }
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> QaResult<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let model = self.model.clone();
        let texts = texts.to_vec();
        let batch_size = self.batch_size;
        tokio::task::spawn_blocking(move || {
            let mut model = model
                .lock()
                .map_err(|_| QaError::Embedding("embedding model lock poisoned".to_string()))?;
            model
                .embed(texts, Some(batch_size))
                .map_err(|e| QaError::Embedding(format!("local embedding failed: {}", e)))
        })
        .await
        .map_err(|e| QaError::Embedding(e.to_string()))?
    }
}

fn resolve_local_model(config: &EmbeddingConfig) -> (String, usize) {
    let model_name = config.model.clone();
    let dims = config.dims.unwrap_or(match model_name.as_str() {
        "all-minilm-l6-v2" => 384,
        "bge-small-en-v1.5" => 384,
        "bge-base-en-v1.5" => 768,
        "bge-large-en-v1.5" => 1024,
        "nomic-embed-text-v1" | "nomic-embed-text-v1.5" => 768,
        "multilingual-e5-small" => 384,
        "multilingual-e5-base" => 768,
        "multilingual-e5-large" => 1024,
        _ => 384,
    });
    (model_name, dims)
}

#[cfg(feature = "local-embeddings-fastembed")]
fn config_to_fastembed_model(name: &str) -> QaResult<fastembed::EmbeddingModel> {
    match name {
        "all-minilm-l6-v2" => Ok(fastembed::EmbeddingModel::AllMiniLML6V2),
        "bge-small-en-v1.5" => Ok(fastembed::EmbeddingModel::BGESmallENV15),
        "bge-base-en-v1.5" => Ok(fastembed::EmbeddingModel::BGEBaseENV15),
        "bge-large-en-v1.5" => Ok(fastembed::EmbeddingModel::BGELargeENV15),
        "nomic-embed-text-v1" => Ok(fastembed::EmbeddingModel::NomicEmbedTextV1),
        "nomic-embed-text-v1.5" => Ok(fastembed::EmbeddingModel::NomicEmbedTextV15),
        "multilingual-e5-small" => Ok(fastembed::EmbeddingModel::MultilingualE5Small),
        "multilingual-e5-base" => Ok(fastembed::EmbeddingModel::MultilingualE5Base),
        "multilingual-e5-large" => Ok(fastembed::EmbeddingModel::MultilingualE5Large),
        other => Err(QaError::Embedding(format!(
            "unknown local embedding model: '{}'. Supported models: \
             all-minilm-l6-v2, bge-small-en-v1.5, bge-base-en-v1.5, bge-large-en-v1.5, \
             nomic-embed-text-v1, nomic-embed-text-v1.5, \
             multilingual-e5-small, multilingual-e5-base, multilingual-e5-large",
            other
        ))),
    }
}

// ============ OpenAI Provider ============

/// Embeddings via the OpenAI API. Requires `OPENAI_API_KEY`.
pub struct OpenAIEmbedder {
    model: String,
    dims: usize,
    api_key: String,
    client: reqwest::Client,
}

impl OpenAIEmbedder {
    pub fn new(config: &EmbeddingConfig) -> QaResult<Self> {
        let dims = config.dims.ok_or_else(|| {
            QaError::Embedding("embedding.dims required for OpenAI provider".to_string())
        })?;
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| QaError::Embedding("OPENAI_API_KEY environment variable not set".to_string()))?;
        Ok(Self {
            model: config.model.clone(),
            dims,
            api_key,
            client: http_client(config.timeout_secs)?,
        })
    }
}

#[async_trait]
impl Embedder for OpenAIEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> QaResult<Vec<Vec<f32>>> {
        let body = serde_json::json!({ "model": self.model, "input": texts });
        let json = post_with_retry(
            "OpenAI",
            self.client
                .post("https://api.openai.com/v1/embeddings")
                .header("Authorization", format!("Bearer {}", self.api_key))
                .json(&body),
        )
        .await?;
        parse_openai_response(&json)
    }
}

/// Extracts `data[].embedding`, ordered by each item's `index`.
fn parse_openai_response(json: &serde_json::Value) -> QaResult<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| QaError::Embedding("invalid OpenAI response: missing data array".to_string()))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (pos, item) in data.iter().enumerate() {
        let index = item.get("index").and_then(|i| i.as_u64()).unwrap_or(pos as u64);
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| QaError::Embedding("invalid OpenAI response: missing embedding".to_string()))?;
        indexed.push((index, json_floats(embedding)));
    }
    indexed.sort_by_key(|(i, _)| *i);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

// ============ Ollama Provider ============

/// Embeddings via a local Ollama instance (`POST /api/embed`).
pub struct OllamaEmbedder {
    model: String,
    dims: usize,
    url: String,
    client: reqwest::Client,
}

impl OllamaEmbedder {
    pub fn new(config: &EmbeddingConfig) -> QaResult<Self> {
        let dims = config.dims.ok_or_else(|| {
            QaError::Embedding("embedding.dims required for Ollama provider".to_string())
        })?;
        Ok(Self {
            model: config.model.clone(),
            dims,
            url: config
                .url
                .clone()
                .unwrap_or_else(|| "http://localhost:11434".to_string()),
            client: http_client(config.timeout_secs)?,
        })
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> QaResult<Vec<Vec<f32>>> {
        let body = serde_json::json!({ "model": self.model, "input": texts });
        let json = post_with_retry(
            "Ollama",
            self.client
                .post(format!("{}/api/embed", self.url.trim_end_matches('/')))
                .json(&body),
        )
        .await?;
        let embeddings = json
            .get("embeddings")
            .and_then(|e| e.as_array())
            .ok_or_else(|| {
                QaError::Embedding("invalid Ollama response: missing embeddings array".to_string())
            })?;
        embeddings
            .iter()
            .map(|e| {
                e.as_array().map(|a| json_floats(a)).ok_or_else(|| {
                    QaError::Embedding("invalid Ollama response: embedding is not an array".to_string())
                })
            })
            .collect()
    }
}

fn http_client(timeout_secs: u64) -> QaResult<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| QaError::Embedding(e.to_string()))
}

fn json_floats(values: &[serde_json::Value]) -> Vec<f32> {
    values
        .iter()
        .map(|v| v.as_f64().unwrap_or(0.0) as f32)
        .collect()
}

async fn post_with_retry(
    service: &str,
    request: reqwest::RequestBuilder,
) -> QaResult<serde_json::Value> {
    let mut last_err = None;

    for attempt in 0..=MAX_RETRIES {
        if attempt > 0 {
            // Exponential backoff: 1s, 2s, 4s, 8s, ...
            let delay = Duration::from_secs(1 << (attempt - 1).min(5));
            tokio::time::sleep(delay).await;
        }

        let Some(req) = request.try_clone() else {
            return Err(QaError::Embedding("request body is not cloneable".to_string()));
        };

        match req.send().await {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    return response
                        .json()
                        .await
                        .map_err(|e| QaError::Embedding(e.to_string()));
                }

                let body_text = response.text().await.unwrap_or_default();
                let err = QaError::Embedding(format!("{} API error {}: {}", service, status, body_text));
                // Rate limited or server error: retry
                if status.as_u16() == 429 || status.is_server_error() {
                    tracing::warn!(service, attempt, %status, "embedding request failed; retrying");
                    last_err = Some(err);
                    continue;
                }
                return Err(err);
            }
            Err(e) => {
                tracing::warn!(service, attempt, error = %e, "embedding request failed; retrying");
                last_err = Some(QaError::Embedding(format!("{} connection error: {}", service, e)));
            }
        }
    }

    Err(last_err
        .unwrap_or_else(|| QaError::Embedding(format!("{} embedding failed after retries", service))))
}

/// Encode a float vector as little-endian f32 bytes.
///
/// # Example
///
/// ```rust
/// use qa_harness::embedding::{vec_to_blob, blob_to_vec};
///
/// let v = vec![1.0f32, -2.5, 3.125];
/// let blob = vec_to_blob(&v);
/// assert_eq!(blob.len(), 12); // 3 × 4 bytes
/// assert_eq!(blob_to_vec(&blob), v);
/// ```
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode little-endian f32 bytes back into a float vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Compute cosine similarity between two embedding vectors.
///
/// Returns a value in `[-1.0, 1.0]`, or `0.0` for empty vectors or
/// vectors of different lengths.
///
/// ```text
///            a · b
/// cos(θ) = ─────────
///          ‖a‖ × ‖b‖
/// ```
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ConstEmbedder;

    #[async_trait]
    impl Embedder for ConstEmbedder {
        fn model_name(&self) -> &str {
            "const"
        }
        fn dims(&self) -> usize {
            2
        }
        async fn embed(&self, texts: &[String]) -> QaResult<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|_| vec![1.0, 0.0]).collect())
        }
    }

    struct CountingLoader {
        loads: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl EmbedderLoader for CountingLoader {
        async fn load(&self) -> QaResult<Arc<dyn Embedder>> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(Arc::new(ConstEmbedder))
        }
    }

    struct FlakyLoader {
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl EmbedderLoader for FlakyLoader {
        async fn load(&self) -> QaResult<Arc<dyn Embedder>> {
            if self.attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(QaError::Embedding("download interrupted".into()))
            } else {
                Ok(Arc::new(ConstEmbedder))
            }
        }
    }

    #[tokio::test]
    async fn concurrent_first_callers_share_one_load() {
        let loads = Arc::new(AtomicUsize::new(0));
        let handle = Arc::new(EmbeddingHandle::new(CountingLoader {
            loads: loads.clone(),
        }));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let h = handle.clone();
                tokio::spawn(async move { h.get().await.map(|e| Arc::as_ptr(&e) as *const () as usize) })
            })
            .collect();

        let mut ptrs = Vec::new();
        for t in tasks {
            ptrs.push(t.await.unwrap().unwrap());
        }
        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert!(ptrs.windows(2).all(|w| w[0] == w[1]));
        assert!(handle.is_loaded());
    }

    #[tokio::test]
    async fn failed_load_is_retried_by_next_caller() {
        let handle = EmbeddingHandle::new(FlakyLoader {
            attempts: AtomicUsize::new(0),
        });
        assert!(handle.get().await.is_err());
        assert!(!handle.is_loaded());
        assert!(handle.get().await.is_ok());
    }

    #[tokio::test]
    async fn preloaded_handle_skips_loader() {
        let handle = EmbeddingHandle::preloaded(Arc::new(ConstEmbedder));
        assert!(handle.is_loaded());
        let e = handle.get().await.unwrap();
        assert_eq!(embed_query(e.as_ref(), "hi").await.unwrap(), vec![1.0, 0.0]);
    }

    #[test]
    fn openai_response_is_ordered_by_index() {
        let json = serde_json::json!({
            "data": [
                { "index": 1, "embedding": [0.0, 1.0] },
                { "index": 0, "embedding": [1.0, 0.0] }
            ]
        });
        let vecs = parse_openai_response(&json).unwrap();
        assert_eq!(vecs, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
    }

    #[test]
    fn local_model_dims_resolve_from_name() {
        let mut config = EmbeddingConfig::default();
        assert_eq!(resolve_local_model(&config).1, 384);
        config.model = "bge-base-en-v1.5".into();
        assert_eq!(resolve_local_model(&config).1, 768);
    }

    #[test]
    fn test_vec_blob_roundtrip() {
        let vec = vec![1.0f32, -2.5, 3.125, 0.0, -0.001];
        assert_eq!(blob_to_vec(&vec_to_blob(&vec)), vec);
    }

    #[test]
    fn test_cosine_identical() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_orthogonal() {
        let sim = cosine_similarity(&[1.0, 0.0, 0.0], &[0.0, 1.0, 0.0]);
        assert!(sim.abs() < 1e-6);
    }

    #[test]
    fn test_cosine_different_lengths() {
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
    }
}
