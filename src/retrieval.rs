//! Hybrid retriever (§4.I): sparse TF-IDF leg + dense embedding leg,
//! score fusion, oracle-based rerank, and parent-chunk expansion.
//!
//! The dense leg is grounded on the teacher's
//! `SqliteMemoryStore::cosine_similarity` (`memory.rs`): the same
//! brute-force cosine scan over stored vectors, generalized from one
//! memory table to a KB's child-chunk corpus. No crate in the pack
//! attests a TF-IDF implementation, so the sparse leg is hand-rolled
//! plainly — matching the teacher's own habit of hand-rolling small
//! numeric routines (e.g. `calculate_retention_score` in
//! `knowledge/manager.rs`) rather than reaching for an unattested
//! dependency. Rerank is expressed as an oracle call asking for a
//! relevance score per candidate (`Oracle::relevance_score`), not a
//! local cross-encoder model, since no attested local-inference crate
//! fits and the oracle abstraction already covers "ask a model to
//! score this".

use crate::domain::Chunk;
use crate::error::{AppError, OracleError, Result};
use crate::oracle::Oracle;
use crate::store::SqliteStore;
use futures::future::join_all;
use std::collections::HashMap;
use tracing::{debug, warn};

/// Minimum sparse cosine score to keep a candidate at all (§4.I step 1).
pub const SPARSE_MIN_SCORE: f32 = 0.01;

/// Minimum oracle relevance score (§4.I step 4) a reranked candidate
/// must clear to survive into parent expansion. Candidates the oracle
/// genuinely reranked below this floor are dropped rather than merely
/// sorted to the bottom, so an off-topic query against a corpus that
/// only ever clears the sparse/dense floors on common words (S6) still
/// ends up with nothing to expand.
pub const RERANK_MIN_SCORE: f32 = 0.5;

#[derive(Debug, Clone)]
pub struct RetrievalConfig {
    pub k_sparse: usize,
    pub k_dense: usize,
    pub alpha: f32,
    pub rerank_top_m: usize,
    pub rerank_min_score: f32,
    pub top_k: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self { k_sparse: 50, k_dense: 50, alpha: 0.4, rerank_top_m: 30, rerank_min_score: RERANK_MIN_SCORE, top_k: 5 }
    }
}

/// A parent chunk surfaced by retrieval, with the score it earned and
/// the document it belongs to (for RAG citations).
#[derive(Debug, Clone)]
pub struct RetrievedChunk {
    pub document_id: i64,
    pub chunk_id: i64,
    pub content: String,
    pub score: f32,
}

#[derive(Debug, Clone)]
pub struct RetrievalResult {
    pub chunks: Vec<RetrievedChunk>,
    /// Set when the oracle was unreachable during rerank; fusion order
    /// was kept as the final order instead (§4.E-style graceful
    /// degradation, applied here to the rerank stage).
    pub degraded: bool,
}

fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_ascii_lowercase())
        .collect()
}

/// From-scratch TF-IDF model fit over one KB's child-chunk corpus.
/// Vectors are L2-normalized so cosine similarity reduces to a dot
/// product.
pub struct TfidfModel {
    vocabulary: HashMap<String, usize>,
    idf: Vec<f32>,
    vectors: Vec<(i64, Vec<f32>)>,
}

impl TfidfModel {
    /// Fit over `corpus`, a list of `(chunk_id, text)` pairs. Smooth
    /// IDF (`ln((1+N)/(1+df)) + 1`), matching scikit-learn's default so
    /// a single-document corpus doesn't divide by zero.
    pub fn fit(corpus: &[(i64, String)]) -> Self {
        let n = corpus.len().max(1);
        let mut vocabulary: HashMap<String, usize> = HashMap::new();
        let mut doc_freq: Vec<usize> = Vec::new();
        let tokenized: Vec<(i64, Vec<String>)> =
            corpus.iter().map(|(id, text)| (*id, tokenize(text))).collect();

        for (_, tokens) in &tokenized {
            let mut seen = std::collections::HashSet::new();
            for token in tokens {
                if seen.insert(token.clone()) {
                    let idx = *vocabulary.entry(token.clone()).or_insert_with(|| {
                        doc_freq.push(0);
                        doc_freq.len() - 1
                    });
                    doc_freq[idx] += 1;
                }
            }
        }

        let idf: Vec<f32> = doc_freq
            .iter()
            .map(|&df| (((1 + n) as f32) / ((1 + df) as f32)).ln() + 1.0)
            .collect();

        let vectors = tokenized
            .into_iter()
            .map(|(id, tokens)| (id, Self::tf_idf_vector(&vocabulary, &idf, &tokens)))
            .collect();

        Self { vocabulary, idf, vectors }
    }

    fn tf_idf_vector(vocabulary: &HashMap<String, usize>, idf: &[f32], tokens: &[String]) -> Vec<f32> {
        let mut counts = vec![0f32; vocabulary.len()];
        for token in tokens {
            if let Some(&idx) = vocabulary.get(token) {
                counts[idx] += 1.0;
            }
        }
        let total = tokens.len().max(1) as f32;
        let mut vector: Vec<f32> = counts.iter().enumerate().map(|(i, &c)| (c / total) * idf[i]).collect();
        l2_normalize(&mut vector);
        vector
    }

    /// Transform `query` into the same vector space; out-of-vocabulary
    /// words are silently ignored (they contribute nothing to any
    /// stored document vector either).
    pub fn transform_query(&self, query: &str) -> Vec<f32> {
        let tokens = tokenize(query);
        Self::tf_idf_vector(&self.vocabulary, &self.idf, &tokens)
    }

    /// Cosine similarity of `query_vec` against every document vector
    /// in the fitted corpus, in fitted order.
    pub fn score_all(&self, query_vec: &[f32]) -> Vec<(i64, f32)> {
        self.vectors.iter().map(|(id, v)| (*id, dot(query_vec, v))).collect()
    }
}

fn l2_normalize(v: &mut [f32]) {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot = dot(a, b);
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

/// Min-max normalize `scores` into `[0.0, 1.0]`; a flat or singleton
/// distribution normalizes everything to `1.0` rather than dividing by
/// zero.
fn min_max_normalize(scores: &[(i64, f32)]) -> HashMap<i64, f32> {
    if scores.is_empty() {
        return HashMap::new();
    }
    let min = scores.iter().map(|(_, s)| *s).fold(f32::INFINITY, f32::min);
    let max = scores.iter().map(|(_, s)| *s).fold(f32::NEG_INFINITY, f32::max);
    let span = max - min;
    scores
        .iter()
        .map(|(id, s)| (*id, if span > 0.0 { (s - min) / span } else { 1.0 }))
        .collect()
}

fn top_n(mut scores: Vec<(i64, f32)>, n: usize) -> Vec<(i64, f32)> {
    scores.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    scores.truncate(n);
    scores
}

/// Run the full hybrid pipeline: sparse + dense retrieval over
/// `child_chunks` (already scoped to one KB), fusion, oracle rerank,
/// parent-chunk expansion via `store`, truncated to `config.top_k`.
pub async fn hybrid_retrieve(
    oracle: &dyn Oracle,
    store: &SqliteStore,
    query: &str,
    child_chunks: &[Chunk],
    config: &RetrievalConfig,
) -> Result<RetrievalResult> {
    if child_chunks.is_empty() {
        return Ok(RetrievalResult { chunks: Vec::new(), degraded: false });
    }

    // Sparse leg.
    let corpus: Vec<(i64, String)> = child_chunks.iter().map(|c| (c.id, c.content.clone())).collect();
    let tfidf = TfidfModel::fit(&corpus);
    let query_vec = tfidf.transform_query(query);
    let sparse_raw: Vec<(i64, f32)> =
        tfidf.score_all(&query_vec).into_iter().filter(|(_, s)| *s >= SPARSE_MIN_SCORE).collect();
    let sparse_top = top_n(sparse_raw, config.k_sparse);
    let sparse_norm = min_max_normalize(&sparse_top);

    // Dense leg; degrades to sparse-only when the oracle can't embed
    // the query at all (§4.E-style fallback).
    let (dense_norm, query_embedding_failed) = match oracle.embed(query).await {
        Ok(resp) => {
            let dense_raw: Vec<(i64, f32)> = child_chunks
                .iter()
                .filter_map(|c| c.embedding.as_ref().map(|e| (c.id, cosine_similarity(&resp.embedding, e))))
                .collect();
            let dense_top = top_n(dense_raw, config.k_dense);
            (min_max_normalize(&dense_top), false)
        }
        Err(AppError::Oracle(OracleError::Unavailable(_))) | Err(AppError::Oracle(OracleError::Timeout)) => {
            warn!("oracle unavailable for query embedding, retrieval degraded to sparse-only");
            (HashMap::new(), true)
        }
        Err(other) => return Err(other),
    };

    // Fusion: union of both truncated streams.
    let mut union_ids: Vec<i64> = sparse_norm.keys().copied().collect();
    for id in dense_norm.keys() {
        if !union_ids.contains(id) {
            union_ids.push(*id);
        }
    }

    let fused: Vec<(i64, f32)> = union_ids
        .into_iter()
        .map(|id| {
            let sparse_score = sparse_norm.get(&id).copied().unwrap_or(0.0);
            let dense_score = dense_norm.get(&id).copied().unwrap_or(0.0);
            (id, config.alpha * sparse_score + (1.0 - config.alpha) * dense_score)
        })
        .collect();
    let fusion_ranked = top_n(fused, config.rerank_top_m);

    let by_id: HashMap<i64, &Chunk> = child_chunks.iter().map(|c| (c.id, c)).collect();
    let candidates: Vec<(&Chunk, f32)> =
        fusion_ranked.iter().filter_map(|(id, score)| by_id.get(id).map(|c| (*c, *score))).collect();

    // Rerank via the oracle; gracefully degrade to fusion order if the
    // oracle is unreachable for scoring.
    let rerank_futures = candidates.iter().map(|(chunk, _)| oracle.relevance_score(query, &chunk.content));
    let rerank_results = join_all(rerank_futures).await;

    let mut oracle_unreachable = query_embedding_failed;
    let reranked: Vec<(&Chunk, f32)> = if rerank_results.iter().any(|r| {
        matches!(
            r,
            Err(AppError::Oracle(OracleError::Unavailable(_))) | Err(AppError::Oracle(OracleError::Timeout))
        )
    }) {
        oracle_unreachable = true;
        candidates
    } else {
        let mut scored = Vec::with_capacity(candidates.len());
        for ((chunk, fusion_score), rerank_result) in candidates.into_iter().zip(rerank_results) {
            let score = rerank_result.unwrap_or(fusion_score);
            scored.push((chunk, score));
        }
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        // A rerank score is a genuine relevance judgment, not just a
        // ranking key; candidates the oracle scored below the floor
        // are dropped here rather than carried through to expansion
        // (§4.I step 4, S6).
        scored.retain(|(_, score)| *score >= config.rerank_min_score);
        scored
    };

    // Parent expansion, deduplicated by parent id, keeping the best
    // score any of its children earned.
    let mut parent_best: HashMap<i64, (i64, f32)> = HashMap::new(); // parent_chunk_id -> (document_id, score)
    let mut parent_order: Vec<i64> = Vec::new();
    for (chunk, score) in &reranked {
        let parent_id = chunk.parent_chunk_id.unwrap_or(chunk.id);
        match parent_best.get_mut(&parent_id) {
            Some((_, best)) if *best >= *score => {}
            Some((_, best)) => *best = *score,
            None => {
                parent_order.push(parent_id);
                parent_best.insert(parent_id, (chunk.document_id, *score));
            }
        }
    }

    let mut expanded = Vec::new();
    for parent_id in parent_order {
        let (document_id, score) = parent_best[&parent_id];
        let parent_chunk = store.get_chunk(parent_id).await?;
        let content = match parent_chunk {
            Some(p) => p.content,
            None => by_id.get(&parent_id).map(|c| c.content.clone()).unwrap_or_default(),
        };
        expanded.push(RetrievedChunk { document_id, chunk_id: parent_id, content, score });
    }
    expanded.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    expanded.truncate(config.top_k);

    debug!(candidates = expanded.len(), degraded = oracle_unreachable, "hybrid retrieval complete");
    Ok(RetrievalResult { chunks: expanded, degraded: oracle_unreachable })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tfidf_scores_exact_match_highest() {
        let corpus = vec![
            (1, "rust async tokio runtime".to_string()),
            (2, "python pandas dataframe analysis".to_string()),
        ];
        let model = TfidfModel::fit(&corpus);
        let query = model.transform_query("rust tokio");
        let scores = model.score_all(&query);
        let rust_score = scores.iter().find(|(id, _)| *id == 1).unwrap().1;
        let python_score = scores.iter().find(|(id, _)| *id == 2).unwrap().1;
        assert!(rust_score > python_score);
    }

    #[test]
    fn unrelated_query_scores_near_zero() {
        let corpus = vec![(1, "rust async tokio runtime".to_string())];
        let model = TfidfModel::fit(&corpus);
        let query = model.transform_query("completely unrelated words here");
        let scores = model.score_all(&query);
        assert_eq!(scores[0].1, 0.0);
    }

    #[test]
    fn min_max_normalize_handles_flat_distribution() {
        let scores = vec![(1, 0.5), (2, 0.5)];
        let normalized = min_max_normalize(&scores);
        assert_eq!(normalized[&1], 1.0);
        assert_eq!(normalized[&2], 1.0);
    }

    #[test]
    fn min_max_normalize_handles_empty() {
        assert!(min_max_normalize(&[]).is_empty());
    }

    #[test]
    fn cosine_similarity_of_identical_vectors_is_one() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_similarity_of_zero_vector_is_zero() {
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }
}
