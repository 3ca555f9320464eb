//! # QA Harness CLI (`qah`)
//!
//! Builds the knowledge base from local files, generates grounded test cases
//! and Selenium scripts, and starts the HTTP API.
//!
//! ## Usage
//!
//! ```bash
//! qah --config ./config/qah.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `qah build --html <page> <docs...>` | Build the knowledge base (directories are walked) |
//! | `qah status` | Show whether a knowledge base exists and what it holds |
//! | `qah generate "<query>"` | Generate test cases as JSON |
//! | `qah script --test-case <file>` | Generate a Selenium script for one test case |
//! | `qah serve` | Start the HTTP API |
//!
//! ## Examples
//!
//! ```bash
//! qah build --html ./site/checkout.html ./docs/product_specs.md ./docs/ui_ux_guide.txt
//! qah generate "discount code validation" --out cases.json
//! qah script --test-case cases.json --id TC-002 --out test_tc_002.py
//! ```

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use walkdir::WalkDir;

use qa_harness::config::{self, Config, UploadConfig};
use qa_harness::embedding::EmbeddingHandle;
use qa_harness::generate::Generator;
use qa_harness::kb::KnowledgeBase;
use qa_harness::llm::create_chat_model;
use qa_harness::models::{TestCase, UploadedFile};
use qa_harness::server;

/// QA Harness: documentation-grounded test cases and Selenium scripts from
/// a local knowledge base.
#[derive(Parser)]
#[command(
    name = "qah",
    about = "QA Harness: grounded test case and Selenium script generation over a local knowledge base",
    version
)]
struct Cli {
    /// Path to configuration file (TOML). Defaults apply when it does not exist.
    #[arg(long, global = true, default_value = "./config/qah.toml")]
    config: PathBuf,

    /// Log filter (e.g. `debug`, `qa_harness=trace`). Overrides `RUST_LOG`.
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the knowledge base, replacing any existing one.
    ///
    /// Every supporting document and the target HTML page are parsed,
    /// chunked, embedded, and written to `[index].dir`.
    Build {
        /// Target HTML page; its markup is the selector source for scripts.
        #[arg(long)]
        html: PathBuf,

        /// Supporting documents or directories containing them.
        #[arg(required = true)]
        documents: Vec<PathBuf>,
    },

    /// Show knowledge base status.
    Status,

    /// Generate test cases for a feature query.
    Generate {
        query: String,

        /// Write the JSON array here instead of stdout.
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Generate a Selenium script for one test case.
    Script {
        /// JSON file with a test case, an array of them, or `{"test_cases": [...]}`.
        #[arg(long)]
        test_case: PathBuf,

        /// Which test case to use when the file holds several.
        #[arg(long)]
        id: Option<String>,

        /// Write the script here instead of stdout.
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Start the HTTP API on `[server].bind`.
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_level.as_deref());

    let cfg = config::load_or_default(&cli.config)?;

    match cli.command {
        Commands::Build { html, documents } => cmd_build(&cfg, &html, &documents).await?,
        Commands::Status => cmd_status(&cfg).await?,
        Commands::Generate { query, out } => cmd_generate(&cfg, &query, out.as_deref()).await?,
        Commands::Script { test_case, id, out } => {
            cmd_script(&cfg, &test_case, id.as_deref(), out.as_deref()).await?
        }
        Commands::Serve => server::run_server(&cfg).await?,
    }

    Ok(())
}

fn init_logging(level: Option<&str>) {
    let filter = match level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

fn knowledge_base(cfg: &Config) -> Arc<KnowledgeBase> {
    let embedding = Arc::new(EmbeddingHandle::from_config(&cfg.embedding));
    Arc::new(KnowledgeBase::new(cfg, embedding))
}

fn generator(cfg: &Config) -> Result<Generator> {
    let model = create_chat_model(&cfg.generation)?;
    Ok(Generator::new(
        knowledge_base(cfg),
        model,
        cfg.retrieval.clone(),
        cfg.generation.clone(),
    ))
}

async fn cmd_build(cfg: &Config, html: &Path, inputs: &[PathBuf]) -> Result<()> {
    let paths = collect_documents(inputs, &cfg.upload)?;
    if paths.is_empty() {
        bail!("No supported documents found in the given paths");
    }
    if !cfg.upload.is_html_allowed(&file_name(html)) {
        bail!("Unsupported HTML type: {}", html.display());
    }

    let mut documents = Vec::with_capacity(paths.len());
    for path in &paths {
        let bytes = std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
        documents.push(UploadedFile::new(file_name(path), bytes));
    }
    let page = std::fs::read(html).with_context(|| format!("Failed to read {}", html.display()))?;
    let html_file = UploadedFile::new(file_name(html), page);

    let summary = knowledge_base(cfg).build(documents, Some(html_file)).await?;

    println!("Knowledge base built at {}", cfg.index.dir.display());
    println!("  documents: {}", summary.documents);
    for skipped in &summary.skipped {
        println!("  skipped:   {} (no usable text)", skipped);
    }
    println!("  page:      {}", summary.target_html);
    println!("  chunks:    {}", summary.chunks);
    println!("  model:     {} ({} dims)", summary.model, summary.dims);
    Ok(())
}

/// Expand directories (recursively) and keep files on the document
/// allow-list. Explicitly named files must be allowed.
fn collect_documents(inputs: &[PathBuf], upload: &UploadConfig) -> Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    for input in inputs {
        if input.is_dir() {
            let mut found: Vec<PathBuf> = WalkDir::new(input)
                .follow_links(true)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file())
                .map(|e| e.into_path())
                .filter(|p| upload.is_document_allowed(&file_name(p)))
                .collect();
            found.sort();
            paths.extend(found);
        } else if upload.is_document_allowed(&file_name(input)) {
            paths.push(input.clone());
        } else {
            bail!("Unsupported document type: {}", input.display());
        }
    }
    Ok(paths)
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

async fn cmd_status(cfg: &Config) -> Result<()> {
    let kb = knowledge_base(cfg);
    match kb.manifest().await? {
        None => {
            println!("No knowledge base at {}", cfg.index.dir.display());
            println!("Run `qah build --html <page> <docs...>` first.");
        }
        Some(m) => {
            println!("Knowledge base at {}", cfg.index.dir.display());
            println!("  built:       {}", m.built_at.to_rfc3339());
            println!("  chunks:      {}", m.chunk_count);
            println!("  page:        {}", m.target_html.as_deref().unwrap_or("-"));
            println!("  model:       {} ({} dims)", m.model, m.dims);
            println!("  fingerprint: {}", m.fingerprint);
        }
    }
    Ok(())
}

async fn cmd_generate(cfg: &Config, query: &str, out: Option<&Path>) -> Result<()> {
    let generator = generator(cfg)?;
    let cases = generator.generate_test_cases(query).await?;
    let json = serde_json::to_string_pretty(&cases)?;

    match out {
        Some(path) => {
            std::fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))?;
            println!("Wrote {} test cases to {}", cases.len(), path.display());
        }
        None => println!("{}", json),
    }
    Ok(())
}

async fn cmd_script(cfg: &Config, file: &Path, id: Option<&str>, out: Option<&Path>) -> Result<()> {
    let data = std::fs::read_to_string(file).with_context(|| format!("Failed to read {}", file.display()))?;
    let test_case = select_test_case(&data, id)?;

    let generator = generator(cfg)?;
    let script = generator.generate_script(&test_case).await?;

    match out {
        Some(path) => {
            std::fs::write(path, &script).with_context(|| format!("Failed to write {}", path.display()))?;
            println!("Wrote script for {} to {}", test_case.test_id, path.display());
        }
        None => print!("{}", script),
    }
    Ok(())
}

fn select_test_case(data: &str, id: Option<&str>) -> Result<TestCase> {
    let value: serde_json::Value = serde_json::from_str(data).context("Test case file is not valid JSON")?;
    let value = match value {
        serde_json::Value::Object(mut map) if map.contains_key("test_cases") => {
            map.remove("test_cases").unwrap_or_default()
        }
        other => other,
    };
    let cases: Vec<TestCase> = if value.is_array() {
        serde_json::from_value(value).context("Invalid test case list")?
    } else {
        vec![serde_json::from_value(value).context("Invalid test case")?]
    };

    match id {
        Some(id) => cases
            .into_iter()
            .find(|c| c.test_id == id)
            .with_context(|| format!("No test case with Test_ID {}", id)),
        None if cases.len() == 1 => Ok(cases.into_iter().next().context("Empty test case list")?),
        None if cases.is_empty() => bail!("Test case file is empty"),
        None => bail!("File holds {} test cases; pick one with --id", cases.len()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ONE: &str = r#"{"Test_ID":"TC-001","Feature":"F","Test_Scenario":"S","Expected_Result":"E","Grounded_In":["a.md"]}"#;

    #[test]
    fn select_single_object() {
        assert_eq!(select_test_case(ONE, None).unwrap().test_id, "TC-001");
    }

    #[test]
    fn select_by_id_from_wrapped_list() {
        let two = ONE.replace("TC-001", "TC-002");
        let data = format!(r#"{{"test_cases":[{},{}]}}"#, ONE, two);
        assert_eq!(select_test_case(&data, Some("TC-002")).unwrap().test_id, "TC-002");
        assert!(select_test_case(&data, None).is_err());
        assert!(select_test_case(&data, Some("TC-404")).is_err());
    }

    #[test]
    fn collect_walks_directories_and_filters() {
        let tmp = tempfile::TempDir::new().unwrap();
        std::fs::write(tmp.path().join("b.md"), "b").unwrap();
        std::fs::write(tmp.path().join("a.txt"), "a").unwrap();
        std::fs::write(tmp.path().join("c.exe"), "c").unwrap();
        let paths = collect_documents(&[tmp.path().to_path_buf()], &UploadConfig::default()).unwrap();
        let names: Vec<String> = paths.iter().map(|p| file_name(p)).collect();
        assert_eq!(names, vec!["a.txt", "b.md"]);

        assert!(collect_documents(&[tmp.path().join("c.exe")], &UploadConfig::default()).is_err());
    }
}
