//! RAG orchestrator (§4.J): query expansion, hybrid retrieval, context
//! assembly under a token budget, and a final oracle chat completion
//! that must answer only from the assembled context.
//!
//! Query expansion and context assembly have no teacher analogue (the
//! teacher's `agent.rs::process` goes straight from prompt to
//! generation with no retrieval step); both are built plainly here,
//! reusing the oracle's `generate_json`/`generate` calls the same way
//! [`crate::concepts`] and [`crate::suggest`] do, and reusing the
//! chunker's token counter ([`crate::chunk`]) so the context budget
//! uses the same LLM-tokenizer-compatible count as chunking itself.

use crate::chunk::count_tokens;
use crate::error::Result;
use crate::oracle::{system_message, user_message, Message, Oracle};
use crate::retrieval::{hybrid_retrieve, RetrievalConfig, RetrievedChunk};
use crate::store::SqliteStore;
use serde::Deserialize;
use std::collections::HashMap;
use tracing::{debug, warn};

/// Fixed sentinel returned instead of calling the oracle at all when
/// retrieval surfaces no usable context (spec.md §4.J: never
/// hallucinate an answer from nothing).
pub const NO_CONTEXT_ANSWER: &str = "I don't have enough information in your knowledge base to answer that.";

const QUERY_EXPANSION_SYSTEM_PROMPT: &str = "You generate alternate phrasings of a search query to \
improve retrieval recall. Respond with a JSON object {\"paraphrases\": [string, ...]} containing up \
to 3 paraphrases that preserve the original meaning. Respond with ONLY the JSON object, no prose.";

const ANSWER_SYSTEM_PROMPT: &str = "You answer questions using ONLY the provided context. Every \
claim must be grounded in the context below; cite the source document for each claim using the \
literal form [doc_id=N]. If the context does not contain the answer, say so plainly instead of \
guessing.";

#[derive(Debug, Clone)]
pub struct RagConfig {
    pub retrieval: RetrievalConfig,
    pub max_paraphrases: usize,
    pub context_token_budget: usize,
}

impl Default for RagConfig {
    fn default() -> Self {
        Self { retrieval: RetrievalConfig::default(), max_paraphrases: 3, context_token_budget: 6_000 }
    }
}

#[derive(Debug, Clone)]
pub struct RagResponse {
    pub answer: String,
    pub citations: Vec<i64>,
    pub degraded: bool,
    pub chunks_used: usize,
}

#[derive(Debug, Deserialize)]
struct RawExpansion {
    #[serde(default)]
    paraphrases: Vec<String>,
}

/// Ask the oracle for up to `max_paraphrases` alternate phrasings of
/// `query`. Expansion failure is non-fatal: on any oracle error this
/// returns just `[query]`, per spec.md §4.J.
async fn expand_query(oracle: &dyn Oracle, query: &str, max_paraphrases: usize) -> Vec<String> {
    let messages =
        vec![system_message(QUERY_EXPANSION_SYSTEM_PROMPT), user_message(format!("Query: {query}"))];

    match oracle.generate_json(&messages).await {
        Ok(value) => match serde_json::from_value::<RawExpansion>(value) {
            Ok(raw) => {
                let mut queries = vec![query.to_string()];
                queries.extend(raw.paraphrases.into_iter().take(max_paraphrases));
                queries
            }
            Err(e) => {
                warn!(error = %e, "query expansion response malformed, using original query only");
                vec![query.to_string()]
            }
        },
        Err(e) => {
            warn!(error = %e, "query expansion failed, using original query only");
            vec![query.to_string()]
        }
    }
}

/// Fuse retrieval results from every expanded query by chunk id,
/// keeping the best score each chunk earned across all paraphrases and
/// sorting the merged set by that score.
fn fuse_by_chunk_id(results: Vec<(Vec<RetrievedChunk>, bool)>) -> (Vec<RetrievedChunk>, bool) {
    let mut degraded = false;
    let mut best: HashMap<i64, RetrievedChunk> = HashMap::new();
    let mut order: Vec<i64> = Vec::new();

    for (chunks, was_degraded) in results {
        degraded |= was_degraded;
        for chunk in chunks {
            match best.get(&chunk.chunk_id) {
                Some(existing) if existing.score >= chunk.score => {}
                Some(_) => {
                    best.insert(chunk.chunk_id, chunk);
                }
                None => {
                    order.push(chunk.chunk_id);
                    best.insert(chunk.chunk_id, chunk);
                }
            }
        }
    }

    let mut fused: Vec<RetrievedChunk> = order.into_iter().filter_map(|id| best.remove(&id)).collect();
    fused.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    (fused, degraded)
}

/// Concatenate `chunks` with `[doc_id=N]` provenance markers until
/// `token_budget` would be exceeded; chunks are assumed pre-sorted by
/// relevance, so truncation always drops the least relevant tail.
fn assemble_context(chunks: &[RetrievedChunk], token_budget: usize) -> (String, Vec<i64>) {
    let mut context = String::new();
    let mut citations = Vec::new();
    let mut used_tokens = 0usize;

    for chunk in chunks {
        let block = format!("[doc_id={}]\n{}\n\n", chunk.document_id, chunk.content);
        let block_tokens = count_tokens(&block);
        if used_tokens + block_tokens > token_budget && !context.is_empty() {
            break;
        }
        context.push_str(&block);
        used_tokens += block_tokens;
        if !citations.contains(&chunk.document_id) {
            citations.push(chunk.document_id);
        }
    }

    (context, citations)
}

/// Run the full pipeline for one query against one KB's child-chunk
/// corpus: expand, retrieve per expansion, fuse, assemble context,
/// generate. Returns the fixed [`NO_CONTEXT_ANSWER`] sentinel (with no
/// oracle chat call at all) when nothing survives retrieval.
pub async fn answer_query(
    oracle: &dyn Oracle,
    store: &SqliteStore,
    query: &str,
    child_chunks: &[crate::domain::Chunk],
    config: &RagConfig,
) -> Result<RagResponse> {
    let queries = expand_query(oracle, query, config.max_paraphrases).await;

    let mut results = Vec::with_capacity(queries.len());
    for q in &queries {
        let result = hybrid_retrieve(oracle, store, q, child_chunks, &config.retrieval).await?;
        results.push((result.chunks, result.degraded));
    }
    let (fused, degraded) = fuse_by_chunk_id(results);

    if fused.is_empty() {
        debug!(query, "no chunks survived retrieval, returning no-context sentinel");
        return Ok(RagResponse {
            answer: NO_CONTEXT_ANSWER.to_string(),
            citations: Vec::new(),
            degraded,
            chunks_used: 0,
        });
    }

    let (context, citations) = assemble_context(&fused, config.context_token_budget);
    let chunks_used = context.matches("[doc_id=").count();

    let messages = vec![
        system_message(ANSWER_SYSTEM_PROMPT),
        user_message(format!("Context:\n{context}\nQuestion: {query}")),
    ];
    let response = oracle.generate(&messages).await?;

    Ok(RagResponse { answer: response.text, citations, degraded, chunks_used })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn sample_chunk(chunk_id: i64, document_id: i64, score: f32) -> RetrievedChunk {
        RetrievedChunk { document_id, chunk_id, content: format!("content {chunk_id}"), score }
    }

    #[test]
    fn fuse_keeps_best_score_across_expansions() {
        let results = vec![
            (vec![sample_chunk(1, 10, 0.4)], false),
            (vec![sample_chunk(1, 10, 0.9)], false),
        ];
        let (fused, degraded) = fuse_by_chunk_id(results);
        assert_eq!(fused.len(), 1);
        assert_eq!(fused[0].score, 0.9);
        assert!(!degraded);
    }

    #[test]
    fn fuse_propagates_degraded_flag() {
        let results = vec![(vec![sample_chunk(1, 10, 0.5)], true)];
        let (_fused, degraded) = fuse_by_chunk_id(results);
        assert!(degraded);
    }

    #[test]
    fn assemble_context_includes_provenance_markers() {
        let chunks = vec![sample_chunk(1, 10, 0.9), sample_chunk(2, 11, 0.8)];
        let (context, citations) = assemble_context(&chunks, 10_000);
        assert!(context.contains("[doc_id=10]"));
        assert!(context.contains("[doc_id=11]"));
        assert_eq!(citations, vec![10, 11]);
    }

    #[test]
    fn assemble_context_respects_token_budget() {
        let chunks = vec![
            RetrievedChunk { document_id: 1, chunk_id: 1, content: "word ".repeat(500), score: 0.9 },
            RetrievedChunk { document_id: 2, chunk_id: 2, content: "word ".repeat(500), score: 0.8 },
        ];
        let (context, citations) = assemble_context(&chunks, 50);
        assert!(!context.contains("[doc_id=2]"));
        assert_eq!(citations, vec![1]);
    }

    #[test]
    fn assemble_context_always_includes_at_least_one_chunk() {
        let chunks = vec![RetrievedChunk { document_id: 1, chunk_id: 1, content: "word ".repeat(5000), score: 0.9 }];
        let (context, _citations) = assemble_context(&chunks, 1);
        assert!(!context.is_empty());
    }

    #[test]
    fn no_context_answer_is_the_fixed_sentinel() {
        assert_eq!(
            NO_CONTEXT_ANSWER,
            "I don't have enough information in your knowledge base to answer that."
        );
    }

    #[tokio::test]
    async fn stamped_with_chrono_for_determinism_note() {
        // Sanity check that chrono remains the date crate used across the
        // pipeline (no direct date usage in this module's logic, but kept
        // adjacent to document-level tests elsewhere in the crate).
        let _ = Utc::now();
    }
}
