//! Document parsing: uploaded file bytes to normalized UTF-8 text.
//!
//! Parsing is deliberately forgiving at the batch level. An unsupported
//! extension or a file that fails to parse yields an empty string and a
//! log line, so one bad upload never aborts a whole knowledge-base build.
//! [`extract_text`] is the strict per-format entry point; [`parse_document`]
//! wraps it with the non-fatal policy.

use crate::models::{ChunkRole, SourceDocument};

/// File formats the parser understands, keyed by extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentKind {
    PlainText,
    Json,
    Pdf,
    Html,
}

impl DocumentKind {
    pub fn from_filename(name: &str) -> Option<Self> {
        let ext = std::path::Path::new(name)
            .extension()
            .and_then(|e| e.to_str())?
            .to_ascii_lowercase();
        match ext.as_str() {
            "txt" | "md" | "markdown" | "text" => Some(DocumentKind::PlainText),
            "json" => Some(DocumentKind::Json),
            "pdf" => Some(DocumentKind::Pdf),
            "html" | "htm" => Some(DocumentKind::Html),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub enum ExtractError {
    UnsupportedType(String),
    Encoding(String),
    Json(String),
    Pdf(String),
}

impl std::fmt::Display for ExtractError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExtractError::UnsupportedType(name) => write!(f, "unsupported file type: {}", name),
            ExtractError::Encoding(e) => write!(f, "file is not valid UTF-8: {}", e),
            ExtractError::Json(e) => write!(f, "JSON parse failed: {}", e),
            ExtractError::Pdf(e) => write!(f, "PDF extraction failed: {}", e),
        }
    }
}

impl std::error::Error for ExtractError {}

/// Extract text from `bytes` according to the extension of `filename`.
pub fn extract_text(filename: &str, bytes: &[u8]) -> Result<String, ExtractError> {
    let kind = DocumentKind::from_filename(filename)
        .ok_or_else(|| ExtractError::UnsupportedType(filename.to_string()))?;
    match kind {
        DocumentKind::PlainText => decode_utf8(bytes),
        DocumentKind::Json => extract_json(bytes),
        DocumentKind::Pdf => extract_pdf(bytes),
        DocumentKind::Html => Ok(html_to_text(&decode_utf8(bytes)?)),
    }
}

/// Parse one uploaded document. Never fails: problems are logged and an
/// empty string is returned so the caller can skip the file.
pub fn parse_document(filename: &str, bytes: &[u8]) -> String {
    if DocumentKind::from_filename(filename).is_none() {
        tracing::warn!(file = filename, "unsupported file type for parsing; skipping");
        return String::new();
    }
    match extract_text(filename, bytes) {
        Ok(text) => text,
        Err(e) => {
            tracing::error!(file = filename, error = %e, "failed to parse document");
            String::new()
        }
    }
}

/// Turn the target HTML page into its two records: the raw markup (for
/// selector discovery) and its visible text (for semantic retrieval).
pub fn parse_target_html(filename: &str, bytes: &[u8]) -> Result<Vec<SourceDocument>, ExtractError> {
    let markup = decode_utf8(bytes)?;
    let text = html_to_text(&markup);
    Ok(vec![
        SourceDocument {
            source: filename.to_string(),
            role: ChunkRole::HtmlFull,
            text: markup,
        },
        SourceDocument {
            source: filename.to_string(),
            role: ChunkRole::HtmlText,
            text,
        },
    ])
}

fn decode_utf8(bytes: &[u8]) -> Result<String, ExtractError> {
    let text = std::str::from_utf8(bytes).map_err(|e| ExtractError::Encoding(e.to_string()))?;
    // Editors on Windows like to prepend a BOM.
    Ok(text.trim_start_matches('\u{feff}').to_string())
}

/// Re-serialize structured text in canonical pretty form.
fn extract_json(bytes: &[u8]) -> Result<String, ExtractError> {
    let value: serde_json::Value =
        serde_json::from_slice(bytes).map_err(|e| ExtractError::Json(e.to_string()))?;
    serde_json::to_string_pretty(&value).map_err(|e| ExtractError::Json(e.to_string()))
}

/// Page-by-page extraction; pages are concatenated in order with a
/// paragraph break between them.
fn extract_pdf(bytes: &[u8]) -> Result<String, ExtractError> {
    let pages = pdf_extract::extract_text_from_mem_by_pages(bytes)
        .map_err(|e| ExtractError::Pdf(e.to_string()))?;
    let pages: Vec<&str> = pages
        .iter()
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .collect();
    Ok(pages.join("\n\n"))
}

/// Elements whose bodies are never visible text. `script` and `style`
/// are removed before tokenizing since their bodies may contain `<`.
const RAW_TEXT_ELEMENTS: [&str; 2] = ["script", "style"];
const SKIPPED_ELEMENTS: [&[u8]; 2] = [b"noscript", b"template"];

/// Visible text of an HTML document, whitespace-normalized and joined
/// with single spaces.
pub fn html_to_text(markup: &str) -> String {
    let markup = remove_raw_text_elements(markup);
    match html_text_events(&markup) {
        Some(text) => text,
        None => {
            tracing::debug!("markup is not parseable as a tag stream; stripping tags instead");
            strip_tags(&markup)
        }
    }
}

fn html_text_events(markup: &str) -> Option<String> {
    use quick_xml::events::Event;

    let mut reader = quick_xml::Reader::from_reader(markup.as_bytes());
    reader.config_mut().trim_text(true);
    // HTML void elements (`<br>`, `<input>`) never close.
    reader.config_mut().check_end_names = false;

    let mut pieces: Vec<String> = Vec::new();
    let mut skip_depth = 0usize;
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                let name = e.local_name().as_ref().to_ascii_lowercase();
                if SKIPPED_ELEMENTS.contains(&name.as_slice()) {
                    skip_depth += 1;
                }
            }
            Ok(Event::End(e)) => {
                let name = e.local_name().as_ref().to_ascii_lowercase();
                if SKIPPED_ELEMENTS.contains(&name.as_slice()) {
                    skip_depth = skip_depth.saturating_sub(1);
                }
            }
            Ok(Event::Text(te)) if skip_depth == 0 => {
                let text = match te.unescape() {
                    Ok(t) => t.into_owned(),
                    // Named HTML entities (&nbsp;, &copy;) are not XML entities.
                    Err(_) => decode_common_entities(&String::from_utf8_lossy(te.as_ref())),
                };
                push_normalized(&mut pieces, &text);
            }
            Ok(Event::CData(cd)) if skip_depth == 0 => {
                push_normalized(&mut pieces, &String::from_utf8_lossy(cd.as_ref()));
            }
            Ok(Event::Eof) => break,
            Err(_) => return None,
            _ => {}
        }
        buf.clear();
    }
    Some(pieces.join(" "))
}

fn push_normalized(pieces: &mut Vec<String>, text: &str) {
    let normalized = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if !normalized.is_empty() {
        pieces.push(normalized);
    }
}

fn decode_common_entities(text: &str) -> String {
    text.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

/// Cut out comments and `script`/`style` elements including their bodies.
fn remove_raw_text_elements(markup: &str) -> String {
    // ASCII lowercasing preserves byte offsets.
    let lower = markup.to_ascii_lowercase();
    let mut out = String::with_capacity(markup.len());
    let mut i = 0;
    while i < markup.len() {
        let rest = &lower[i..];
        let Some(open) = rest.find('<') else {
            out.push_str(&markup[i..]);
            break;
        };
        out.push_str(&markup[i..i + open]);
        i += open;
        let rest = &lower[i..];
        if rest.starts_with("<!--") {
            i += rest.find("-->").map(|p| p + 3).unwrap_or(rest.len());
            out.push(' ');
            continue;
        }
        let raw = RAW_TEXT_ELEMENTS.iter().find(|t| {
            rest[1..].starts_with(*t)
                && rest[1 + t.len()..]
                    .chars()
                    .next()
                    .map_or(true, |c| c == '>' || c == '/' || c.is_whitespace())
        });
        match raw {
            Some(tag) => {
                let close = format!("</{}", tag);
                let end = rest.find(&close).unwrap_or(rest.len());
                let after = &rest[end..];
                i += end + after.find('>').map(|p| p + 1).unwrap_or(after.len());
                out.push(' ');
            }
            None => {
                out.push('<');
                i += 1;
            }
        }
    }
    out
}

/// Fallback for markup the event reader rejects: drop every tag.
fn strip_tags(markup: &str) -> String {
    let mut out = String::with_capacity(markup.len());
    let mut in_tag = false;
    for c in markup.chars() {
        match c {
            '<' => in_tag = true,
            '>' if in_tag => {
                in_tag = false;
                out.push(' ');
            }
            _ if !in_tag => out.push(c),
            _ => {}
        }
    }
    decode_common_entities(&out)
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}
