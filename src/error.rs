//! Typed failures surfaced by the knowledge-base and generation pipeline.
//!
//! Every variant maps to a distinct remediation for the caller (re-upload,
//! rebuild, retry, inspect model output), so generation failures never
//! collapse into a generic error. [`QaError::code`] gives the stable
//! machine-readable name used by the HTTP layer and the CLI.

use std::fmt;

/// Pipeline stage at which a knowledge-base build failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildStage {
    Parse,
    Chunk,
    Embed,
    Index,
    Persist,
}

impl fmt::Display for BuildStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BuildStage::Parse => "parse",
            BuildStage::Chunk => "chunk",
            BuildStage::Embed => "embed",
            BuildStage::Index => "index",
            BuildStage::Persist => "persist",
        };
        f.write_str(name)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QaError {
    /// Bad file type or an empty upload set.
    #[error("unsupported input: {0}")]
    UnsupportedInput(String),

    /// No usable text remained after parsing and chunking.
    #[error("no usable text remains after parsing and chunking the uploaded documents")]
    EmptyCorpus,

    #[error("knowledge base is not built yet; upload documents and build it first")]
    KnowledgeBaseNotReady,

    #[error("index I/O failed: {0}")]
    IndexIo(String),

    /// A build stage failed; nothing was persisted.
    #[error("knowledge base build failed at {stage} stage: {source}")]
    Build {
        stage: BuildStage,
        #[source]
        source: Box<QaError>,
    },

    /// Embedding model load or inference failure.
    #[error("embedding failed: {0}")]
    Embedding(String),

    /// Network or model-call failure. Not retried.
    #[error("generation service error: {0}")]
    GenerationService(String),

    /// The model reply could not be parsed as the expected structure.
    #[error("model reply is not valid test case JSON ({reason})")]
    GenerationFormat { reason: String, excerpt: String },

    /// The reply parsed, but a record failed schema checks.
    #[error("test case #{index} failed validation: {message}")]
    GenerationValidation { index: usize, message: String },

    /// No `html_full` chunk exists for the target page.
    #[error("target HTML markup for '{0}' not found in knowledge base")]
    TargetMarkupNotFound(String),
}

impl QaError {
    /// Wrap a failure with the build stage it occurred in.
    pub fn at_stage(self, stage: BuildStage) -> QaError {
        match self {
            // Already-classified input errors pass through untouched.
            QaError::EmptyCorpus | QaError::UnsupportedInput(_) | QaError::Build { .. } => self,
            other => QaError::Build {
                stage,
                source: Box::new(other),
            },
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            QaError::UnsupportedInput(_) => "unsupported_input",
            QaError::EmptyCorpus => "empty_corpus",
            QaError::KnowledgeBaseNotReady => "knowledge_base_not_ready",
            QaError::IndexIo(_) => "index_io_error",
            QaError::Build { .. } => "build_failed",
            QaError::Embedding(_) => "embedding_error",
            QaError::GenerationService(_) => "generation_service_error",
            QaError::GenerationFormat { .. } => "generation_format_error",
            QaError::GenerationValidation { .. } => "generation_validation_error",
            QaError::TargetMarkupNotFound(_) => "target_markup_not_found",
        }
    }

    /// True when the fault lies with the request rather than the server.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            QaError::UnsupportedInput(_) | QaError::EmptyCorpus | QaError::KnowledgeBaseNotReady
        )
    }
}

impl From<std::io::Error> for QaError {
    fn from(e: std::io::Error) -> Self {
        QaError::IndexIo(e.to_string())
    }
}

pub type QaResult<T> = std::result::Result<T, QaError>;
