//! Core data models used throughout the QA harness.
//!
//! These types represent the parsed documents, chunks, retrieval results,
//! and generated test cases that flow through the build and generation
//! pipeline.

use serde::{Deserialize, Serialize};

/// What a chunk's text represents within its source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkRole {
    /// Text of an uploaded supporting document.
    SupportDoc,
    /// Full raw markup of the target HTML page (selector source).
    HtmlFull,
    /// Extracted visible text of the target HTML page.
    HtmlText,
}

impl ChunkRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkRole::SupportDoc => "support_doc",
            ChunkRole::HtmlFull => "html_full",
            ChunkRole::HtmlText => "html_text",
        }
    }
}

/// A parsed document ready for chunking.
#[derive(Debug, Clone)]
pub struct SourceDocument {
    /// Uploaded file name, used for grounding attribution.
    pub source: String,
    pub role: ChunkRole,
    pub text: String,
}

/// Raw bytes of an uploaded file and the name it was uploaded under.
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub filename: String,
    pub bytes: Vec<u8>,
}

impl UploadedFile {
    pub fn new(filename: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            filename: filename.into(),
            bytes: bytes.into(),
        }
    }
}

/// A bounded segment of source text with provenance. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub text: String,
    pub source: String,
    pub role: ChunkRole,
    /// SHA-256 of `text`.
    pub hash: String,
}

/// Top-k retrieval output. `chunks[i]` came from `sources[i]`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RetrievalResult {
    pub chunks: Vec<String>,
    pub sources: Vec<String>,
}

impl RetrievalResult {
    /// Source names in first-seen order, without duplicates.
    pub fn unique_sources(&self) -> Vec<String> {
        let mut seen = Vec::new();
        for s in &self.sources {
            if !seen.contains(s) {
                seen.push(s.clone());
            }
        }
        seen
    }

    pub fn joined_context(&self) -> String {
        self.chunks.join("\n\n")
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}

/// A generated, documentation-grounded test case.
///
/// Field names on the wire match the keys the model is instructed to emit.
/// Keys outside these five are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCase {
    #[serde(rename = "Test_ID")]
    pub test_id: String,
    #[serde(rename = "Feature")]
    pub feature: String,
    #[serde(rename = "Test_Scenario")]
    pub test_scenario: String,
    #[serde(rename = "Expected_Result")]
    pub expected_result: String,
    #[serde(rename = "Grounded_In")]
    pub grounded_in: Vec<String>,
}
