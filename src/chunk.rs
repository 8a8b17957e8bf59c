//! Overlapping, bounded-size text chunker.
//!
//! Splits document content into segments that respect a configurable
//! `target_tokens` limit. Splitting occurs on paragraph boundaries (`\n\n`)
//! to preserve semantic coherence; each chunk after the first is seeded
//! with the word-aligned tail of its predecessor so neighboring chunks
//! share `overlap_tokens` of context.
//!
//! Chunk identities are derived from the owning document id, the chunk
//! index, and the chunk text, so re-chunking identical content yields
//! identical chunks.

use sha2::{Digest, Sha256};

use crate::config::ChunkingConfig;
use crate::models::Chunk;

/// Approximate chars-per-token ratio for bound calculations.
const CHARS_PER_TOKEN: usize = 4;

/// Estimate the token count of a text under the chars-per-token heuristic.
pub fn estimate_tokens(text: &str) -> usize {
    let chars = text.chars().count();
    if chars == 0 {
        0
    } else {
        chars.div_ceil(CHARS_PER_TOKEN)
    }
}

/// Split text into overlapping chunk strings.
///
/// Pure function: same inputs always produce the same boundaries. Empty or
/// whitespace-only text yields an empty list; text under the target yields
/// exactly one chunk. Overlap is clamped below half the target so each
/// chunk always advances through the source.
pub fn chunk_text(text: &str, target_tokens: usize, overlap_tokens: usize) -> Vec<String> {
    let trimmed_text = text.trim();
    if trimmed_text.is_empty() {
        return Vec::new();
    }

    let max_chars = target_tokens.max(1) * CHARS_PER_TOKEN;
    let overlap_chars = (overlap_tokens * CHARS_PER_TOKEN).min(max_chars / 2);

    if trimmed_text.len() <= max_chars {
        return vec![trimmed_text.to_string()];
    }

    let mut chunks: Vec<String> = Vec::new();
    let mut current_buf = String::new();

    for para in trimmed_text.split("\n\n") {
        let trimmed = para.trim();
        if trimmed.is_empty() {
            continue;
        }

        // If adding this paragraph would exceed max, flush current buffer
        let would_be = if current_buf.is_empty() {
            trimmed.len()
        } else {
            current_buf.len() + 2 + trimmed.len() // +2 for \n\n separator
        };

        if would_be > max_chars && !current_buf.is_empty() {
            flush(&mut chunks, &mut current_buf, overlap_chars);
        }

        // A single paragraph over the limit is hard-split at word boundaries
        if trimmed.len() > max_chars {
            // Flush unless the buffer holds nothing beyond the overlap seed
            // of the chunk just emitted
            let seed_only = chunks
                .last()
                .map(|last| last.ends_with(current_buf.trim()))
                .unwrap_or(false);
            if !current_buf.is_empty() && !seed_only {
                flush(&mut chunks, &mut current_buf, overlap_chars);
            }
            current_buf.clear();
            split_oversized(&mut chunks, trimmed, max_chars, overlap_chars);
            // Seed the next buffer from the last emitted piece
            if let Some(last) = chunks.last() {
                current_buf = overlap_tail(last, overlap_chars);
            }
        } else {
            if !current_buf.is_empty() {
                current_buf.push_str("\n\n");
            }
            current_buf.push_str(trimmed);
        }
    }

    // Flush remaining, unless it is purely the overlap seed of an
    // already-emitted chunk
    let remainder = current_buf.trim();
    if !remainder.is_empty() {
        let is_seed_only = chunks
            .last()
            .map(|last| last.ends_with(remainder))
            .unwrap_or(false);
        if !is_seed_only {
            chunks.push(remainder.to_string());
        }
    }

    if chunks.is_empty() {
        chunks.push(trimmed_text.to_string());
    }

    chunks
}

/// Chunk a document's content and wrap the pieces as [`Chunk`] records.
///
/// Embeddings are attached later by the caller; `embedding` starts `None`.
pub fn build_chunks(document_id: &str, text: &str, config: &ChunkingConfig) -> Vec<Chunk> {
    chunk_text(text, config.target_tokens, config.overlap_tokens)
        .into_iter()
        .enumerate()
        .map(|(index, content)| {
            let token_count = estimate_tokens(&content) as i64;
            Chunk {
                id: chunk_id(document_id, index as i64, &content),
                document_id: document_id.to_string(),
                chunk_index: index as i64,
                token_count,
                content,
                embedding: None,
            }
        })
        .collect()
}

/// Deterministic chunk identity from owner, position, and text.
fn chunk_id(document_id: &str, index: i64, content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(document_id.as_bytes());
    hasher.update(index.to_le_bytes());
    hasher.update(content.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    digest[..32].to_string()
}

fn flush(chunks: &mut Vec<String>, current_buf: &mut String, overlap_chars: usize) {
    let emitted = std::mem::take(current_buf);
    *current_buf = overlap_tail(&emitted, overlap_chars);
    chunks.push(emitted);
}

/// Word-aligned tail of a chunk, used to seed the next chunk's buffer.
///
/// Returns an empty string when the chunk is no longer than the overlap,
/// so small chunks are never duplicated wholesale.
fn overlap_tail(text: &str, overlap_chars: usize) -> String {
    if overlap_chars == 0 || text.len() <= overlap_chars {
        return String::new();
    }

    let mut start = text.len() - overlap_chars;
    while !text.is_char_boundary(start) {
        start -= 1;
    }

    let tail = &text[start..];
    // Advance past the first partial word
    match tail.find(|c: char| c.is_whitespace()) {
        Some(pos) => tail[pos..].trim_start().to_string(),
        None => tail.to_string(),
    }
}

/// Hard-split a paragraph that exceeds the chunk budget on its own.
///
/// Prefers newline or space boundaries within each window; consecutive
/// pieces overlap by `overlap_chars`. Always advances at least one byte
/// per piece.
fn split_oversized(chunks: &mut Vec<String>, para: &str, max_chars: usize, overlap_chars: usize) {
    let mut start = 0usize;

    while start < para.len() {
        let mut end = (start + max_chars).min(para.len());
        while !para.is_char_boundary(end) {
            end -= 1;
        }

        let window = &para[start..end];
        let cut = if end < para.len() {
            window
                .rfind('\n')
                .or_else(|| window.rfind(' '))
                .filter(|&pos| pos > 0)
                .map(|pos| start + pos + 1)
                .unwrap_or(end)
        } else {
            end
        };

        let piece = para[start..cut].trim();
        if !piece.is_empty() {
            chunks.push(piece.to_string());
        }

        if cut >= para.len() {
            break;
        }

        let mut next = cut.saturating_sub(overlap_chars).max(start + 1);
        while next < para.len() && !para.is_char_boundary(next) {
            next += 1;
        }
        start = next;
    }
}
