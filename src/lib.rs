//! # QA Harness
//!
//! Documentation-grounded test case generation and Selenium script synthesis
//! over a local retrieval-augmented knowledge base.
//!
//! Upload supporting documents plus one target HTML page; the harness parses,
//! chunks, embeds, and indexes them. Queries then retrieve the most relevant
//! chunks and a generative model turns that context into typed test cases or
//! an automation script that uses selectors from the target page.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌────────┐   ┌──────────┐   ┌──────────────┐
//! │ Uploads  │──▶│ Parse  │──▶│  Chunk   │──▶│ Embed+Index  │──▶ index dir
//! │ docs+HTML│   │extract │   │  chunk   │   │embedding/idx │
//! └──────────┘   └────────┘   └──────────┘   └──────┬───────┘
//!                                                   │ retrieve (kb)
//!                                                   ▼
//!                 ┌──────────┐   prompt    ┌──────────────────┐
//!                 │   LLM    │◀───────────│    Generator      │
//!                 │  (llm)   │───reply───▶│ decode / scripts  │
//!                 └──────────┘            └──────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! qah build --html ./checkout.html ./docs/     # build the knowledge base
//! qah generate "discount code rules"           # grounded test cases (JSON)
//! qah script --test-case tc.json --id TC-001   # Selenium script
//! qah serve                                     # HTTP API
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Typed pipeline errors |
//! | [`models`] | Core data types |
//! | [`extract`] | Document parsing (text, JSON, PDF, HTML) |
//! | [`chunk`] | Paragraph chunking with overlap |
//! | [`embedding`] | Embedding providers and the shared model handle |
//! | [`index`] | Vector index with directory persistence |
//! | [`kb`] | Knowledge base build and context retrieval |
//! | [`llm`] | Generative model clients |
//! | [`decode`] | Resilient decoding of model replies |
//! | [`generate`] | Test case and script generation |
//! | [`server`] | HTTP API |

pub mod chunk;
pub mod config;
pub mod decode;
pub mod embedding;
pub mod error;
pub mod extract;
pub mod generate;
pub mod index;
pub mod kb;
pub mod llm;
pub mod models;
pub mod server;
