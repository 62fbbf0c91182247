//! Hierarchical summarizer (§4.H): a level-1 (short/long) summary per
//! parent chunk, level-2 section summaries combining sibling level-1
//! summaries, and one level-3 document summary synthesized from all
//! level-2 summaries.
//!
//! Grounded on the same oracle-call-with-typed-error shape as
//! [`crate::concepts::extract_concepts`] (`oracle.rs::generate_json`'s
//! repair retry, reused rather than re-implemented); the only new
//! element here is the bottom-up fold from chunk to section to
//! document, which has no teacher analogue and is built plainly per
//! spec.md §4.H.

use crate::domain::{Summary, SummaryLevel};
use crate::error::{AppError, OracleError, Result};
use crate::oracle::{system_message, user_message, Message, Oracle};
use chrono::Utc;
use serde::Deserialize;

const CHUNK_SYSTEM_PROMPT: &str = "You summarize one section of a technical document. \
Respond with a JSON object with fields \"short_summary\" (1-2 sentences, 100-200 tokens), \
\"long_summary\" (a more detailed paragraph, 500-1000 tokens), \"key_concepts\" (array of \
strings), \"tech_stack\" (array of strings naming tools/languages/frameworks mentioned), \
and \"skill_level\" (one of: beginner, intermediate, advanced, unknown). Respond with ONLY \
the JSON object, no prose.";

const ROLLUP_SYSTEM_PROMPT: &str = "You combine several summaries of parts of a document into \
one summary of the whole. Respond with a JSON object with the same shape as the inputs: \
\"short_summary\", \"long_summary\", \"key_concepts\", \"tech_stack\", \"skill_level\". \
Respond with ONLY the JSON object, no prose.";

#[derive(Debug, Deserialize)]
struct RawSummary {
    short_summary: String,
    #[serde(default)]
    long_summary: Option<String>,
    #[serde(default)]
    key_concepts: Vec<String>,
    #[serde(default)]
    tech_stack: Vec<String>,
    #[serde(default)]
    skill_level: Option<String>,
}

async fn call_oracle(oracle: &dyn Oracle, system_prompt: &str, body: &str) -> Result<RawSummary> {
    let messages = vec![system_message(system_prompt), user_message(body.to_string())];
    let value = oracle.generate_json(&messages).await?;
    serde_json::from_value(value).map_err(|e| {
        AppError::Oracle(OracleError::SchemaViolation(format!(
            "summarizer response did not match the expected schema: {e}"
        )))
    })
}

/// Level-1 summary of one parent chunk's content.
pub async fn summarize_chunk(oracle: &dyn Oracle, document_id: i64, chunk_id: i64, content: &str) -> Result<Summary> {
    let raw = call_oracle(oracle, CHUNK_SYSTEM_PROMPT, &format!("Text:\n{content}")).await?;
    Ok(to_summary(document_id, Some(chunk_id), None, SummaryLevel::Chunk, raw))
}

/// Level-2 section summary combining the level-1 summaries of the
/// chunks that fell in the same section (per the extractor's
/// `section_breaks`, or the whole document when there were none).
/// `parent_id` is the first constituent summary's id, used only to
/// anchor the section in the summary forest — section summaries have
/// no single "owning" chunk.
pub async fn summarize_section(oracle: &dyn Oracle, document_id: i64, parent_id: Option<i64>, constituents: &[Summary]) -> Result<Summary> {
    if constituents.is_empty() {
        return Err(AppError::Validation("cannot summarize an empty section".to_string()));
    }
    let body = render_constituents(constituents);
    let raw = call_oracle(oracle, ROLLUP_SYSTEM_PROMPT, &body).await?;
    Ok(to_summary(document_id, None, parent_id, SummaryLevel::Section, raw))
}

/// Level-3 document summary synthesized from every level-2 section
/// summary (or, for a single-section document, directly from the
/// level-1 summaries).
pub async fn summarize_document(oracle: &dyn Oracle, document_id: i64, constituents: &[Summary]) -> Result<Summary> {
    if constituents.is_empty() {
        return Err(AppError::Validation("cannot summarize a document with no section summaries".to_string()));
    }
    let body = render_constituents(constituents);
    let raw = call_oracle(oracle, ROLLUP_SYSTEM_PROMPT, &body).await?;
    Ok(to_summary(document_id, None, None, SummaryLevel::Document, raw))
}

/// Group parent chunks into sections by `section_breaks` (byte offsets
/// into the full document text where chunking found a structural
/// boundary), returning one `Vec<usize>` of chunk indices per section.
/// A document with no section breaks is one section.
pub fn group_chunks_into_sections(chunk_starts: &[(usize, usize)], section_breaks: &[usize]) -> Vec<Vec<usize>> {
    if section_breaks.is_empty() || chunk_starts.is_empty() {
        return vec![(0..chunk_starts.len()).collect()];
    }

    let mut sorted_breaks = section_breaks.to_vec();
    sorted_breaks.sort_unstable();

    let mut sections: Vec<Vec<usize>> = vec![Vec::new()];
    for (idx, &(start, _end)) in chunk_starts.iter().enumerate() {
        let section = sorted_breaks.iter().filter(|&&b| b <= start).count();
        while sections.len() <= section {
            sections.push(Vec::new());
        }
        sections[section].push(idx);
    }
    sections.retain(|s| !s.is_empty());
    if sections.is_empty() {
        sections.push((0..chunk_starts.len()).collect());
    }
    sections
}

fn render_constituents(constituents: &[Summary]) -> String {
    let mut body = String::from("Combine the following summaries:\n");
    for (i, s) in constituents.iter().enumerate() {
        body.push_str(&format!("\n[{}] {}\n", i + 1, s.short_summary));
        if let Some(long) = &s.long_summary {
            body.push_str(&format!("Detail: {long}\n"));
        }
    }
    body
}

fn to_summary(document_id: i64, chunk_id: Option<i64>, parent_id: Option<i64>, level: SummaryLevel, raw: RawSummary) -> Summary {
    Summary {
        id: 0,
        document_id,
        chunk_id,
        parent_id,
        level,
        short_summary: raw.short_summary,
        long_summary: raw.long_summary,
        key_concepts: raw.key_concepts,
        tech_stack: raw.tech_stack,
        skill_profile: raw.skill_level,
        created_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::{EmbeddingResponse, GenerationResponse};
    use async_trait::async_trait;

    struct StubOracle {
        response: String,
    }

    #[async_trait]
    impl Oracle for StubOracle {
        async fn generate(&self, _messages: &[Message]) -> Result<GenerationResponse> {
            Ok(GenerationResponse {
                text: self.response.clone(),
                tokens_used: None,
                model: "stub".to_string(),
                finish_reason: Some("stop".to_string()),
            })
        }
        async fn embed(&self, _text: &str) -> Result<EmbeddingResponse> {
            unimplemented!()
        }
        async fn list_models(&self) -> Result<Vec<String>> {
            unimplemented!()
        }
        async fn is_model_available(&self, _model: &str) -> Result<bool> {
            unimplemented!()
        }
    }

    fn stub(response: &str) -> StubOracle {
        StubOracle { response: response.to_string() }
    }

    #[tokio::test]
    async fn summarizes_a_chunk_into_a_level_one_summary() {
        let oracle = stub(
            r#"{"short_summary": "about rust", "long_summary": "a longer paragraph", \
            "key_concepts": ["rust"], "tech_stack": ["tokio"], "skill_level": "intermediate"}"#,
        );
        let summary = summarize_chunk(&oracle, 1, 10, "some chunk text").await.unwrap();
        assert_eq!(summary.level, SummaryLevel::Chunk);
        assert_eq!(summary.chunk_id, Some(10));
        assert!(summary.parent_id.is_none());
        assert_eq!(summary.short_summary, "about rust");
    }

    #[tokio::test]
    async fn section_summary_requires_at_least_one_constituent() {
        let oracle = stub("{}");
        let err = summarize_section(&oracle, 1, None, &[]).await.unwrap_err();
        assert_eq!(err.category(), "validation");
    }

    #[tokio::test]
    async fn document_summary_rolls_up_sections() {
        let oracle = stub(
            r#"{"short_summary": "whole doc", "key_concepts": ["rust", "tokio"], "tech_stack": []}"#,
        );
        let section = Summary {
            id: 1,
            document_id: 1,
            chunk_id: None,
            parent_id: None,
            level: SummaryLevel::Section,
            short_summary: "section one".to_string(),
            long_summary: None,
            key_concepts: vec!["rust".to_string()],
            tech_stack: vec![],
            skill_profile: None,
            created_at: Utc::now(),
        };
        let doc_summary = summarize_document(&oracle, 1, std::slice::from_ref(&section)).await.unwrap();
        assert_eq!(doc_summary.level, SummaryLevel::Document);
        assert!(doc_summary.chunk_id.is_none());
        assert!(doc_summary.parent_id.is_none());
    }

    #[tokio::test]
    async fn malformed_response_is_a_schema_violation() {
        let oracle = stub("not json");
        let err = summarize_chunk(&oracle, 1, 1, "text").await.unwrap_err();
        assert_eq!(err.category(), "oracle_schema");
    }

    #[test]
    fn no_section_breaks_yields_a_single_section() {
        let chunks = vec![(0, 10), (10, 20), (20, 30)];
        let sections = group_chunks_into_sections(&chunks, &[]);
        assert_eq!(sections.len(), 1);
        assert_eq!(sections[0], vec![0, 1, 2]);
    }

    #[test]
    fn section_breaks_split_chunks_into_groups() {
        let chunks = vec![(0, 10), (10, 20), (25, 35), (35, 45)];
        let sections = group_chunks_into_sections(&chunks, &[20]);
        assert_eq!(sections.len(), 2);
        assert_eq!(sections[0], vec![0, 1]);
        assert_eq!(sections[1], vec![2, 3]);
    }
}
