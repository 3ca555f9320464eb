//! Paragraph-boundary text chunker with overlap.
//!
//! Splits document text on paragraph boundaries (`\n\n`) and packs
//! consecutive paragraphs into chunks of at most `chunk_size` characters.
//! Consecutive chunks of the same document share up to `chunk_overlap`
//! characters of trailing paragraphs so a concept spanning a boundary is
//! retrievable from either side. A single paragraph longer than
//! `chunk_size` is hard-split at whitespace with the same overlap.
//!
//! The target page's raw markup (`html_full`) is never split: script
//! generation needs the complete document to find selectors.
//!
//! Each chunk receives a fresh UUID plus a SHA-256 hash of its text.

use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{QaError, QaResult};
use crate::models::{Chunk, ChunkRole, SourceDocument};

const SEPARATOR: &str = "\n\n";

/// Split every document and drop whitespace-only chunks.
///
/// Fails with [`QaError::EmptyCorpus`] when nothing usable remains across
/// the whole set.
pub fn chunk_documents(
    documents: &[SourceDocument],
    chunk_size: usize,
    chunk_overlap: usize,
) -> QaResult<Vec<Chunk>> {
    let mut chunks = Vec::new();
    for doc in documents {
        let pieces = match doc.role {
            ChunkRole::HtmlFull => vec![doc.text.trim().to_string()],
            _ => split_text(&doc.text, chunk_size, chunk_overlap),
        };
        let before = chunks.len();
        chunks.extend(
            pieces
                .into_iter()
                .filter(|p| !p.trim().is_empty())
                .map(|p| make_chunk(&doc.source, doc.role, p)),
        );
        tracing::debug!(
            source = %doc.source,
            role = doc.role.as_str(),
            chunks = chunks.len() - before,
            "chunked document"
        );
    }

    if chunks.is_empty() {
        tracing::error!("no chunks with content remain after chunking and filtering");
        return Err(QaError::EmptyCorpus);
    }
    Ok(chunks)
}

/// Split text into overlapping chunks of at most `chunk_size` characters.
pub fn split_text(text: &str, chunk_size: usize, chunk_overlap: usize) -> Vec<String> {
    let chunk_size = chunk_size.max(1);
    let chunk_overlap = chunk_overlap.min(chunk_size - 1);

    let mut units: Vec<String> = Vec::new();
    for para in text.split(SEPARATOR) {
        let trimmed = para.trim();
        if trimmed.is_empty() {
            continue;
        }
        if char_len(trimmed) > chunk_size {
            units.extend(hard_split(trimmed, chunk_size, chunk_overlap));
        } else {
            units.push(trimmed.to_string());
        }
    }

    merge_units(&units, chunk_size, chunk_overlap)
}

/// Greedily pack units; on flush, keep trailing units totalling no more
/// than `chunk_overlap` characters as the start of the next chunk.
fn merge_units(units: &[String], chunk_size: usize, chunk_overlap: usize) -> Vec<String> {
    let sep_len = SEPARATOR.len();
    let mut chunks = Vec::new();
    let mut window: std::collections::VecDeque<&str> = std::collections::VecDeque::new();
    let mut total = 0usize;

    for unit in units {
        let len = char_len(unit);
        let added = if window.is_empty() { len } else { len + sep_len };

        if total + added > chunk_size && !window.is_empty() {
            chunks.push(join(&window));
            // Shrink to the overlap budget, and far enough that the next
            // unit fits.
            while total > chunk_overlap || (total > 0 && total + sep_len + len > chunk_size) {
                let Some(front) = window.pop_front() else {
                    break;
                };
                total = if window.is_empty() {
                    0
                } else {
                    total - char_len(front) - sep_len
                };
            }
        }

        total += if window.is_empty() { len } else { len + sep_len };
        window.push_back(unit);
    }

    if !window.is_empty() {
        chunks.push(join(&window));
    }
    chunks
}

fn join(window: &std::collections::VecDeque<&str>) -> String {
    window.iter().copied().collect::<Vec<_>>().join(SEPARATOR)
}

/// Window an oversized paragraph into `chunk_size` pieces, preferring to
/// cut at whitespace, with `chunk_overlap` characters carried over.
fn hard_split(text: &str, chunk_size: usize, chunk_overlap: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    let mut pieces = Vec::new();
    let mut start = 0usize;

    while start < chars.len() {
        let mut end = (start + chunk_size).min(chars.len());
        if end < chars.len() {
            // Try to split at a space boundary in the back half of the window
            if let Some(pos) = (start + chunk_size / 2..end).rev().find(|&i| chars[i].is_whitespace()) {
                end = pos;
            }
        }
        let piece: String = chars[start..end].iter().collect();
        let piece = piece.trim();
        if !piece.is_empty() {
            pieces.push(piece.to_string());
        }
        if end >= chars.len() {
            break;
        }
        let mut next = end.saturating_sub(chunk_overlap);
        // Start the overlap on a word boundary when one is close by.
        while next < end && next > start && !chars[next - 1].is_whitespace() {
            next += 1;
        }
        start = if next > start && next < end { next } else { end };
    }
    pieces
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

fn make_chunk(source: &str, role: ChunkRole, text: String) -> Chunk {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let hash = format!("{:x}", hasher.finalize());

    Chunk {
        id: Uuid::new_v4().to_string(),
        text,
        source: source.to_string(),
        role,
        hash,
    }
}
