//! HTTP API.
//!
//! A thin layer over [`KnowledgeBase`] and [`Generator`]: it parses uploads,
//! enforces the upload allow-lists and the readiness precondition, and maps
//! [`QaError`] variants onto status codes.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/` | Welcome message |
//! | `GET`  | `/health` | Status, version, knowledge base readiness |
//! | `POST` | `/build_knowledge_base` | Multipart: `documents` (repeated) + `html_file` |
//! | `POST` | `/generate_test_cases` | `{"query"}` → `{"test_cases": [...]}` |
//! | `POST` | `/generate_selenium_script` | `{"test_case"}` → `{"script"}` |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "knowledge_base_not_ready", "message": "..." } }
//! ```
//!
//! Request faults (`bad_request`, `unsupported_input`, `empty_corpus`,
//! `knowledge_base_not_ready`) are 400. `target_markup_not_found` is 404.
//! Generation failures (`generation_service_error`, `generation_format_error`,
//! `generation_validation_error`) are 502 so callers can tell a bad model
//! reply from a server fault. Everything else is 500.
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted so the browser front end
//! can be served from anywhere.

use axum::{
    extract::{DefaultBodyLimit, Multipart, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::config::Config;
use crate::embedding::EmbeddingHandle;
use crate::error::QaError;
use crate::generate::Generator;
use crate::kb::{BuildSummary, KnowledgeBase};
use crate::llm::create_chat_model;
use crate::models::{TestCase, UploadedFile};

/// Shared state passed to every handler.
#[derive(Clone)]
pub struct AppState {
    config: Arc<Config>,
    generator: Arc<Generator>,
}

impl AppState {
    pub fn new(config: Config, generator: Generator) -> Self {
        Self {
            config: Arc::new(config),
            generator: Arc::new(generator),
        }
    }

    fn kb(&self) -> &Arc<KnowledgeBase> {
        self.generator.knowledge_base()
    }
}

/// Wire the production components from `config` and serve until the
/// process is terminated.
///
/// The embedding model starts loading in the background immediately, so
/// the first build or query usually finds it ready.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let embedding = Arc::new(EmbeddingHandle::from_config(&config.embedding));
    let kb = Arc::new(KnowledgeBase::new(config, embedding.clone()));
    let model = create_chat_model(&config.generation)?;
    let generator = Generator::new(kb, model, config.retrieval.clone(), config.generation.clone());

    tokio::spawn(async move {
        if let Err(e) = embedding.get().await {
            tracing::error!(error = %e, "embedding model preload failed; will retry on first use");
        }
    });

    let bind_addr = config.server.bind.clone();
    let app = router(AppState::new(config.clone(), generator));

    println!("QA harness API listening on http://{}", bind_addr);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

pub fn router(state: AppState) -> Router {
    let upload_limit = state.config.server.max_upload_mb.max(1) * 1024 * 1024;
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(handle_root))
        .route("/health", get(handle_health))
        .route("/build_knowledge_base", post(handle_build))
        .route("/generate_test_cases", post(handle_generate_test_cases))
        .route("/generate_selenium_script", post(handle_generate_script))
        .layer(DefaultBodyLimit::max(upload_limit))
        .layer(cors)
        .with_state(state)
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

impl From<QaError> for AppError {
    fn from(err: QaError) -> Self {
        let status = match &err {
            e if e.is_client_error() => StatusCode::BAD_REQUEST,
            QaError::TargetMarkupNotFound(_) => StatusCode::NOT_FOUND,
            QaError::GenerationService(_)
            | QaError::GenerationFormat { .. }
            | QaError::GenerationValidation { .. } => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(code = err.code(), error = %err, "request failed");
        } else {
            tracing::warn!(code = err.code(), error = %err, "request rejected");
        }
        AppError {
            status,
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

// ============ GET / and /health ============

#[derive(Serialize)]
struct RootResponse {
    message: &'static str,
}

async fn handle_root() -> Json<RootResponse> {
    Json(RootResponse {
        message: "Welcome to the QA harness API!",
    })
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    knowledge_base_ready: bool,
}

async fn handle_health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        knowledge_base_ready: state.kb().is_ready().await,
    })
}

// ============ POST /build_knowledge_base ============

#[derive(Serialize)]
struct BuildResponse {
    message: &'static str,
    summary: BuildSummary,
}

/// Multipart upload: any number of `documents` parts and one `html_file`.
/// File types are checked against `[upload]` before anything is parsed.
async fn handle_build(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<BuildResponse>, AppError> {
    let upload = &state.config.upload;
    let mut documents = Vec::new();
    let mut html_file: Option<UploadedFile> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| bad_request(format!("invalid multipart body: {}", e)))?
    {
        let name = field.name().unwrap_or_default().to_string();
        let filename = field.file_name().unwrap_or_default().to_string();

        match name.as_str() {
            "documents" => {
                if filename.is_empty() {
                    continue;
                }
                if !upload.is_document_allowed(&filename) {
                    return Err(QaError::UnsupportedInput(format!(
                        "unsupported document type: {}",
                        filename
                    ))
                    .into());
                }
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| bad_request(format!("failed to read {}: {}", filename, e)))?;
                documents.push(UploadedFile::new(filename, bytes.to_vec()));
            }
            "html_file" => {
                if html_file.is_some() {
                    return Err(bad_request("only one html_file may be uploaded"));
                }
                if !upload.is_html_allowed(&filename) {
                    return Err(QaError::UnsupportedInput(format!(
                        "unsupported HTML type: {}",
                        filename
                    ))
                    .into());
                }
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| bad_request(format!("failed to read {}: {}", filename, e)))?;
                html_file = Some(UploadedFile::new(filename, bytes.to_vec()));
            }
            other => {
                tracing::warn!(field = %other, "ignoring unexpected multipart field");
            }
        }
    }

    tracing::info!(documents = documents.len(), html = html_file.is_some(), "build requested");
    let summary = state.kb().build(documents, html_file).await?;
    Ok(Json(BuildResponse {
        message: "Knowledge Base Built Successfully!",
        summary,
    }))
}

// ============ POST /generate_test_cases ============

#[derive(Deserialize)]
struct GenerateTestCasesRequest {
    query: String,
}

#[derive(Serialize)]
struct GenerateTestCasesResponse {
    test_cases: Vec<TestCase>,
}

async fn handle_generate_test_cases(
    State(state): State<AppState>,
    Json(req): Json<GenerateTestCasesRequest>,
) -> Result<Json<GenerateTestCasesResponse>, AppError> {
    let query = req.query.trim();
    if query.is_empty() {
        return Err(bad_request("query must not be empty"));
    }
    ensure_ready(&state).await?;

    let test_cases = state.generator.generate_test_cases(query).await?;
    tracing::info!(count = test_cases.len(), "generated test cases");
    Ok(Json(GenerateTestCasesResponse { test_cases }))
}

// ============ POST /generate_selenium_script ============

#[derive(Deserialize)]
struct GenerateScriptRequest {
    test_case: TestCase,
}

#[derive(Serialize)]
struct GenerateScriptResponse {
    script: String,
}

async fn handle_generate_script(
    State(state): State<AppState>,
    Json(req): Json<GenerateScriptRequest>,
) -> Result<Json<GenerateScriptResponse>, AppError> {
    tracing::info!(test_id = %req.test_case.test_id, "script requested");
    ensure_ready(&state).await?;

    let script = state.generator.generate_script(&req.test_case).await?;
    Ok(Json(GenerateScriptResponse { script }))
}

async fn ensure_ready(state: &AppState) -> Result<(), AppError> {
    if state.kb().is_ready().await {
        Ok(())
    } else {
        Err(QaError::KnowledgeBaseNotReady.into())
    }
}
