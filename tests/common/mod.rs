//! Shared fixtures for integration tests: a deterministic embedder, a
//! scripted chat model, and a small checkout-page corpus.
#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use qa_harness::config::Config;
use qa_harness::embedding::{Embedder, EmbeddingHandle};
use qa_harness::error::{QaError, QaResult};
use qa_harness::generate::Generator;
use qa_harness::kb::KnowledgeBase;
use qa_harness::llm::ChatModel;
use qa_harness::models::UploadedFile;

pub const DIMS: usize = 64;

/// Bag-of-words vectors with FNV-hashed buckets.
pub struct HashEmbedder {
    name: String,
}

impl HashEmbedder {
    pub fn new() -> Self {
        Self::named("hash-64")
    }

    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }

    pub fn vector(text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; DIMS];
        for word in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
        {
            let mut h: u64 = 0xcbf29ce484222325;
            for b in word.to_lowercase().bytes() {
                h ^= b as u64;
                h = h.wrapping_mul(0x100000001b3);
            }
            v[(h % DIMS as u64) as usize] += 1.0;
        }
        v
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    fn model_name(&self) -> &str {
        &self.name
    }
    fn dims(&self) -> usize {
        DIMS
    }
    async fn embed(&self, texts: &[String]) -> QaResult<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| Self::vector(t)).collect())
    }
}

/// Replies from a queue and records every prompt it is sent.
pub struct ScriptedModel {
    replies: Mutex<VecDeque<Result<String, String>>>,
    prompts: Mutex<Vec<String>>,
    calls: AtomicUsize,
}

impl ScriptedModel {
    pub fn new(replies: Vec<Result<String, String>>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            prompts: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn replying(reply: &str) -> Self {
        Self::new(vec![Ok(reply.to_string())])
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatModel for ScriptedModel {
    fn model_name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, prompt: &str, _temperature: f32) -> QaResult<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().unwrap().push(prompt.to_string());
        match self.replies.lock().unwrap().pop_front() {
            Some(Ok(reply)) => Ok(reply),
            Some(Err(message)) => Err(QaError::GenerationService(message)),
            None => Err(QaError::GenerationService("no scripted reply left".to_string())),
        }
    }
}

pub fn test_config(root: &Path) -> Config {
    let mut config = Config::default();
    config.index.dir = root.join("kb");
    config
}

pub fn knowledge_base(config: &Config) -> Arc<KnowledgeBase> {
    knowledge_base_with(config, HashEmbedder::new())
}

pub fn knowledge_base_with(config: &Config, embedder: HashEmbedder) -> Arc<KnowledgeBase> {
    let handle = EmbeddingHandle::preloaded(Arc::new(embedder));
    Arc::new(KnowledgeBase::new(config, Arc::new(handle)))
}

pub fn generator(config: &Config, kb: Arc<KnowledgeBase>, model: Arc<ScriptedModel>) -> Generator {
    Generator::new(kb, model, config.retrieval.clone(), config.generation.clone())
}

pub const SPECS: &str = "# Product Specs\n\n\
The discount code SAVE15 applies a 15% discount to the cart total.\n\n\
Express shipping costs $10. Standard shipping is free.";

pub const UI_GUIDE: &str = "Error messages are displayed in red text below the field.\n\n\
The Pay Now button turns green when the form is valid.";

pub const API: &str = r#"{"endpoint": "/apply_coupon", "method": "POST", "params": {"code": "string"}}"#;

pub const CHECKOUT: &str = r#"<!DOCTYPE html>
<html>
<head><title>Checkout</title><style>.error { color: red; }</style></head>
<body>
  <h1>Checkout</h1>
  <input id="discount-code" name="discount" placeholder="Discount code">
  <button id="apply-discount">Apply</button>
  <p id="total">Total: $100</p>
  <button id="pay-now">Pay Now</button>
  <script>function pay() { return 1 < 2; }</script>
</body>
</html>"#;

pub fn documents() -> Vec<UploadedFile> {
    vec![
        UploadedFile::new("specs.md", SPECS),
        UploadedFile::new("ui.txt", UI_GUIDE),
        UploadedFile::new("api.json", API),
    ]
}

pub fn checkout() -> UploadedFile {
    UploadedFile::new("checkout.html", CHECKOUT)
}

pub fn test_case_json(id: &str, grounded_in: &str) -> String {
    format!(
        r#"{{"Test_ID":"{}","Feature":"Discount","Test_Scenario":"Apply SAVE15","Expected_Result":"Price reduced 15%","Grounded_In":{}}}"#,
        id, grounded_in
    )
}

/// Minimal PDF with one page showing `phrase`, with correct xref offsets.
pub fn minimal_pdf(phrase: &str) -> Vec<u8> {
    let content = format!("BT /F1 12 Tf 100 700 Td ({}) Tj ET", phrase);
    let mut out = Vec::new();
    let mut offsets = Vec::new();
    out.extend_from_slice(b"%PDF-1.4\n");
    offsets.push(out.len());
    out.extend_from_slice(b"1 0 obj << /Type /Catalog /Pages 2 0 R >> endobj\n");
    offsets.push(out.len());
    out.extend_from_slice(b"2 0 obj << /Type /Pages /Kids [3 0 R] /Count 1 >> endobj\n");
    offsets.push(out.len());
    out.extend_from_slice(b"3 0 obj << /Type /Page /Parent 2 0 R /MediaBox [0 0 612 792] /Contents 4 0 R /Resources << /Font << /F1 5 0 R >> >> >> endobj\n");
    offsets.push(out.len());
    out.extend_from_slice(
        format!("4 0 obj << /Length {} >> stream\n{}\nendstream endobj\n", content.len(), content).as_bytes(),
    );
    offsets.push(out.len());
    out.extend_from_slice(b"5 0 obj << /Type /Font /Subtype /Type1 /BaseFont /Helvetica >> endobj\n");
    let xref_start = out.len();
    out.extend_from_slice(b"xref\n0 6\n");
    out.extend_from_slice(format!("{:010} 65535 f \n", 0).as_bytes());
    for offset in offsets {
        out.extend_from_slice(format!("{:010} 00000 n \n", offset).as_bytes());
    }
    out.extend_from_slice(b"trailer << /Size 6 /Root 1 0 R >>\nstartxref\n");
    out.extend_from_slice(format!("{}\n", xref_start).as_bytes());
    out.extend_from_slice(b"%%EOF\n");
    out
}
