//! Two-tier chunker (§4.D): parent chunks (~2000 tokens) split into
//! overlapping child chunks (~400 tokens, ~50 token overlap), each with
//! a contiguous monotonic `chunk_index` per document per tier.
//!
//! Generalizes the teacher's `ContentChunker`
//! (`knowledge/chunker.rs`): same byte-window-advance-with-boundary-
//! search shape (`find_sentence_boundary`/`chunk_markdown`'s header
//! preference), but sized by LLM-tokenizer-compatible token counts via
//! `tiktoken-rs` instead of raw byte length, and run twice (parent
//! pass, then a child pass inside each parent) instead of once.

use crate::domain::{Chunk, ChunkTier};
use crate::error::{AppError, Result};
use chrono::Utc;
use std::sync::OnceLock;
use tiktoken_rs::CoreBPE;

#[derive(Debug, Clone)]
pub struct ChunkerConfig {
    pub parent_tokens: usize,
    pub child_tokens: usize,
    pub child_overlap_tokens: usize,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self { parent_tokens: 2000, child_tokens: 400, child_overlap_tokens: 50 }
    }
}

fn tokenizer() -> &'static CoreBPE {
    static BPE: OnceLock<CoreBPE> = OnceLock::new();
    BPE.get_or_init(|| tiktoken_rs::cl100k_base().expect("cl100k_base tokenizer ranks are bundled with tiktoken-rs"))
}

/// LLM-tokenizer-compatible token count, reused wherever the crate
/// needs to budget text against a token limit (context assembly in
/// `rag`, in addition to the chunker itself).
pub(crate) fn count_tokens(text: &str) -> usize {
    tokenizer().encode_ordinary(text).len()
}

/// Roughly how many bytes one token occupies in typical English prose;
/// used only to seed the window-size search, never the final boundary.
const BYTES_PER_TOKEN_ESTIMATE: usize = 4;

/// Find a good sentence boundary to avoid a mid-sentence split, mirroring
/// the teacher's `find_sentence_boundary`.
fn find_sentence_boundary(text: &str) -> usize {
    let search_start = text.len().saturating_sub(100);
    let search_text = &text[nearest_char_boundary(text, search_start)..];

    if let Some(pos) = search_text.rfind(|c: char| c == '.' || c == '!' || c == '?') {
        let end = nearest_char_boundary(text, search_start) + pos + 1;
        return end.min(text.len());
    }
    if let Some(pos) = text.rfind(char::is_whitespace) {
        return pos;
    }
    text.len()
}

fn nearest_char_boundary(text: &str, mut idx: usize) -> usize {
    while idx > 0 && !text.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

/// Snap a candidate window end to the nearest section break that falls
/// strictly after `start` and no later than `candidate_end`, when one
/// exists within the window — headings/slide/sheet boundaries make a
/// better split point than an arbitrary sentence.
fn snap_to_section_break(section_breaks: &[usize], start: usize, candidate_end: usize) -> Option<usize> {
    section_breaks
        .iter()
        .copied()
        .filter(|&b| b > start && b <= candidate_end)
        .max()
}

/// Windows of `text` (as byte ranges) each holding roughly
/// `target_tokens` tokens, advancing by `target_tokens - overlap_tokens`
/// each step so consecutive windows overlap by `overlap_tokens` worth of
/// trailing content. `overlap_tokens = 0` for the non-overlapping parent
/// pass.
fn token_windows(text: &str, section_breaks: &[usize], target_tokens: usize, overlap_tokens: usize) -> Vec<(usize, usize)> {
    if text.is_empty() {
        return Vec::new();
    }
    if count_tokens(text) <= target_tokens {
        return vec![(0, text.len())];
    }

    let mut windows = Vec::new();
    let mut start = 0usize;

    while start < text.len() {
        let mut end = (start + target_tokens * BYTES_PER_TOKEN_ESTIMATE).min(text.len());
        end = nearest_char_boundary(text, end);

        // Shrink until the window is at or under the token budget, or we
        // can't shrink any further without producing an empty window.
        while end > start + 1 && count_tokens(&text[start..end]) > target_tokens {
            end = nearest_char_boundary(text, start + (end - start) * 9 / 10);
        }

        if end < text.len() {
            if let Some(snapped) = snap_to_section_break(section_breaks, start, end) {
                end = snapped;
            } else {
                let boundary = find_sentence_boundary(&text[start..end]);
                if boundary > 0 {
                    end = nearest_char_boundary(text, start + boundary);
                }
            }
        }

        if end <= start {
            end = nearest_char_boundary(text, (start + 1).min(text.len()));
        }

        windows.push((start, end));

        if end >= text.len() {
            break;
        }

        let overlap_bytes = overlap_tokens * BYTES_PER_TOKEN_ESTIMATE;
        let advance = (end - start).saturating_sub(overlap_bytes).max(1);
        start = nearest_char_boundary(text, start + advance);
    }

    windows
}

/// Chunk one document's extracted text into parent and child tiers.
/// Parent chunks are emitted first (`chunk_index` 0..P), then child
/// chunks continue the same index space (`chunk_index` P..P+C) with
/// `parent_chunk_id` set to the owning parent's position in the
/// returned vector — the caller is expected to persist parents first
/// and rewrite these placeholder positions to real database ids.
pub fn chunk_document(document_id: i64, kb_id: i64, text: &str, section_breaks: &[usize], config: &ChunkerConfig) -> Result<Vec<Chunk>> {
    if text.trim().is_empty() {
        return Err(AppError::Validation("cannot chunk empty document text".to_string()));
    }

    let now = Utc::now();
    let mut chunks = Vec::new();
    let mut index = 0i32;

    let parent_windows = token_windows(text, section_breaks, config.parent_tokens, 0);
    let mut parent_positions = Vec::with_capacity(parent_windows.len());

    for (p_start, p_end) in &parent_windows {
        let content = text[*p_start..*p_end].trim().to_string();
        if content.is_empty() {
            continue;
        }
        let token_count = count_tokens(&content) as i32;
        parent_positions.push(chunks.len());
        chunks.push(Chunk {
            id: 0,
            document_id,
            kb_id,
            chunk_index: index,
            tier: ChunkTier::Parent,
            parent_chunk_id: None,
            start_token: 0,
            end_token: token_count,
            content,
            token_count,
            embedding: None,
            concepts: Vec::new(),
            summary: None,
            created_at: now,
        });
        index += 1;
    }

    let parent_snapshot: Vec<(usize, &str)> = parent_positions
        .iter()
        .map(|&pos| (pos, chunks[pos].content.as_str()))
        .collect();

    for (parent_pos, parent_text) in parent_snapshot {
        let child_windows = token_windows(parent_text, &[], config.child_tokens, config.child_overlap_tokens);
        let mut running_token_start = 0i32;

        for (c_start, c_end) in child_windows {
            let content = parent_text[c_start..c_end].trim().to_string();
            if content.is_empty() {
                continue;
            }
            let token_count = count_tokens(&content) as i32;
            chunks.push(Chunk {
                id: 0,
                document_id,
                kb_id,
                chunk_index: index,
                tier: ChunkTier::Child,
                parent_chunk_id: Some(parent_pos as i64),
                start_token: running_token_start,
                end_token: running_token_start + token_count,
                content,
                token_count,
                embedding: None,
                concepts: Vec::new(),
                summary: None,
                created_at: now,
            });
            index += 1;
            running_token_start += token_count;
        }
    }

    Ok(chunks)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_text_yields_a_single_parent_and_child() {
        let text = "This is a short document about Rust async programming.";
        let chunks = chunk_document(1, 1, text, &[], &ChunkerConfig::default()).unwrap();

        let parents: Vec<_> = chunks.iter().filter(|c| c.tier == ChunkTier::Parent).collect();
        let children: Vec<_> = chunks.iter().filter(|c| c.tier == ChunkTier::Child).collect();
        assert_eq!(parents.len(), 1);
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].parent_chunk_id, Some(0));
    }

    #[test]
    fn empty_text_is_rejected() {
        let err = chunk_document(1, 1, "   ", &[], &ChunkerConfig::default()).unwrap_err();
        assert_eq!(err.category(), "validation");
    }

    #[test]
    fn long_text_produces_multiple_parents_and_overlapping_children() {
        let sentence = "The quick brown fox jumps over the lazy dog in the forest near the river. ";
        let text = sentence.repeat(400); // comfortably over one parent window
        let config = ChunkerConfig::default();
        let chunks = chunk_document(1, 1, &text, &[], &config).unwrap();

        let parents: Vec<_> = chunks.iter().filter(|c| c.tier == ChunkTier::Parent).collect();
        let children: Vec<_> = chunks.iter().filter(|c| c.tier == ChunkTier::Child).collect();
        assert!(parents.len() > 1, "expected more than one parent window");
        assert!(children.len() > parents.len(), "expected multiple children per parent on average");

        for parent in &parents {
            assert!(parent.token_count as usize <= config.parent_tokens + 50);
        }
    }

    #[test]
    fn chunk_index_is_contiguous_and_monotonic() {
        let sentence = "Rust ownership and borrowing rules prevent data races at compile time. ";
        let text = sentence.repeat(200);
        let chunks = chunk_document(1, 1, &text, &[], &ChunkerConfig::default()).unwrap();

        for window in chunks.windows(2) {
            assert_eq!(window[1].chunk_index, window[0].chunk_index + 1);
        }
    }

    #[test]
    fn section_breaks_are_preferred_split_points() {
        let mut text = String::new();
        text.push_str(&"word ".repeat(600));
        let break_point = text.len();
        text.push_str("# New Section\n");
        text.push_str(&"more words ".repeat(600));

        let chunks = chunk_document(1, 1, &text, &[break_point], &ChunkerConfig::default()).unwrap();
        let parents: Vec<_> = chunks.iter().filter(|c| c.tier == ChunkTier::Parent).collect();
        assert!(parents.len() >= 2);
    }
}
