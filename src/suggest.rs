//! Build suggester (§4.K): analyze the whole knowledge bank and propose
//! "what to build next" ideas.
//!
//! The knowledge-summary text format fed to the oracle is grounded
//! verbatim on the original `BuildSuggester._summarize_knowledge`
//! (`build_suggester.py`); everything downstream (gating, structured
//! output) is this crate's own plumbing through the `Oracle` trait
//! rather than a direct OpenAI provider.

use crate::domain::{BuildIdeaSeed, Cluster};
use crate::error::{AppError, Result};
use crate::oracle::{system_message, user_message, Oracle};
use chrono::Utc;
use serde::Deserialize;
use std::collections::BTreeMap;

/// Gating thresholds (spec.md §4.K): below any of these there isn't
/// enough structure in the knowledge bank to suggest anything
/// meaningful, and `suggest` returns `insufficient_knowledge` listing
/// every threshold that failed instead of calling the oracle at all.
pub const MIN_DISTINCT_CONCEPTS: usize = 2;
pub const MIN_DOCUMENT_COUNT: usize = 1;
pub const MIN_CLUSTER_COUNT: usize = 1;
pub const MIN_TOTAL_CONTENT_LENGTH: i64 = 200;

const MAX_SAMPLE_DOCS_PER_CLUSTER: usize = 3;
const MAX_CONCEPTS_PER_SAMPLE_DOC: usize = 3;
const MAX_PRIMARY_CONCEPTS_SHOWN: usize = 5;

/// Per-document view `_summarize_knowledge` and the gating thresholds
/// need: which cluster it belongs to, its top concept names, and its
/// content length, without requiring the full `Document`/`Concept`
/// join at the call site.
pub struct DocumentConceptView<'a> {
    pub cluster_id: Option<i64>,
    pub source_type: &'a str,
    pub concept_names: &'a [String],
    pub content_length: i64,
}

/// Check the four gating thresholds and return the names of every one
/// that failed, empty when the knowledge bank has enough structure to
/// suggest from.
fn failed_thresholds(clusters: &BTreeMap<i64, Cluster>, documents: &[DocumentConceptView<'_>]) -> Vec<&'static str> {
    let distinct_concepts: std::collections::HashSet<&str> =
        documents.iter().flat_map(|d| d.concept_names.iter().map(|s| s.as_str())).collect();
    let total_content_length: i64 = documents.iter().map(|d| d.content_length).sum();

    let mut failed = Vec::new();
    if distinct_concepts.len() < MIN_DISTINCT_CONCEPTS {
        failed.push("distinct_concepts");
    }
    if documents.len() < MIN_DOCUMENT_COUNT {
        failed.push("document_count");
    }
    if clusters.len() < MIN_CLUSTER_COUNT {
        failed.push("cluster_count");
    }
    if total_content_length < MIN_TOTAL_CONTENT_LENGTH {
        failed.push("total_content_length");
    }
    failed
}

/// Build the knowledge-bank text summary an oracle call is grounded
/// against. Matches the Python original line for line: `"Empty
/// knowledge bank"` when there are no clusters, else one `CLUSTER
/// {id}: {name}` block per cluster with up to three sample documents.
pub fn summarize_knowledge(clusters: &BTreeMap<i64, Cluster>, documents: &[DocumentConceptView<'_>]) -> String {
    if clusters.is_empty() {
        return "Empty knowledge bank".to_string();
    }

    let mut lines = Vec::new();
    for (cluster_id, cluster) in clusters {
        lines.push(format!("\nCLUSTER {cluster_id}: {}", cluster.name));
        lines.push(format!("  - Documents: {}", cluster.doc_count));
        lines.push(format!(
            "  - Skill level: {}",
            cluster.skill_level.as_deref().unwrap_or("None")
        ));
        let primary: Vec<&str> = cluster
            .primary_concepts
            .iter()
            .take(MAX_PRIMARY_CONCEPTS_SHOWN)
            .map(|s| s.as_str())
            .collect();
        lines.push(format!("  - Primary concepts: {}", primary.join(", ")));

        let cluster_docs: Vec<&DocumentConceptView<'_>> = documents
            .iter()
            .filter(|d| d.cluster_id == Some(*cluster_id))
            .take(MAX_SAMPLE_DOCS_PER_CLUSTER)
            .collect();

        if !cluster_docs.is_empty() {
            lines.push("  - Sample concepts:".to_string());
            for doc in cluster_docs {
                let names: Vec<&str> = doc.concept_names.iter().take(MAX_CONCEPTS_PER_SAMPLE_DOC).map(|s| s.as_str()).collect();
                lines.push(format!("    \u{2022} {}: {}", doc.source_type, names.join(", ")));
            }
        }
    }

    lines.join("\n")
}

#[derive(Debug, Deserialize)]
struct RawSuggestion {
    title: String,
    description: String,
    feasibility: String,
    effort_estimate: String,
    required_skills: Vec<String>,
    missing_knowledge: Vec<String>,
    relevant_clusters: Vec<i64>,
    starter_steps: Vec<String>,
    knowledge_coverage: f32,
}

fn suggestions_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "array",
        "items": {
            "type": "object",
            "properties": {
                "title": {"type": "string"},
                "description": {"type": "string"},
                "feasibility": {"type": "string", "enum": ["high", "medium", "low"]},
                "effort_estimate": {"type": "string"},
                "required_skills": {"type": "array", "items": {"type": "string"}},
                "missing_knowledge": {"type": "array", "items": {"type": "string"}},
                "relevant_clusters": {"type": "array", "items": {"type": "integer"}},
                "starter_steps": {"type": "array", "items": {"type": "string"}},
                "knowledge_coverage": {"type": "number"}
            },
            "required": ["title", "description", "feasibility", "effort_estimate", "required_skills",
                         "missing_knowledge", "relevant_clusters", "starter_steps", "knowledge_coverage"]
        }
    })
}

fn parse_feasibility(raw: &str) -> crate::domain::Feasibility {
    match raw.to_ascii_lowercase().as_str() {
        "high" => crate::domain::Feasibility::High,
        "low" => crate::domain::Feasibility::Low,
        _ => crate::domain::Feasibility::Medium,
    }
}

/// Analyze the knowledge bank and return up to `max_suggestions` build
/// ideas. Gates on all four thresholds before calling the oracle at
/// all — a structured `insufficient_knowledge` error naming every
/// threshold that failed, not an empty oracle call that would just
/// hallucinate generic advice.
pub async fn suggest(
    oracle: &dyn Oracle,
    clusters: &BTreeMap<i64, Cluster>,
    documents: &[DocumentConceptView<'_>],
    max_suggestions: usize,
) -> Result<Vec<BuildIdeaSeed>> {
    let failed = failed_thresholds(clusters, documents);
    if !failed.is_empty() {
        return Err(AppError::Validation(format!("insufficient_knowledge: {}", failed.join(", "))));
    }

    let summary = summarize_knowledge(clusters, documents);
    let schema = suggestions_schema();
    let prompt = format!(
        "Given this knowledge bank summary, suggest up to {max_suggestions} viable projects the owner could build next.\n\n{summary}\n\nRespond with a JSON array matching this schema:\n{schema}"
    );

    let messages = vec![
        system_message(
            "You analyze a personal knowledge bank and suggest concrete, buildable projects. \
             Respond with JSON matching the given schema only, no prose.",
        ),
        user_message(prompt),
    ];

    let value = oracle.generate_json(&messages).await?;
    let raw: Vec<RawSuggestion> = serde_json::from_value(value).map_err(|e| {
        AppError::Oracle(crate::error::OracleError::SchemaViolation(format!(
            "build suggestion response did not match the expected schema: {e}"
        )))
    })?;
    let now = Utc::now();

    let seeds = raw
        .into_iter()
        .take(max_suggestions)
        .map(|r| BuildIdeaSeed {
            id: 0,
            kb_id: 0,
            title: r.title,
            description: r.description,
            feasibility: parse_feasibility(&r.feasibility),
            effort_estimate: r.effort_estimate,
            required_skills: r.required_skills,
            missing_knowledge: r.missing_knowledge,
            relevant_clusters: r.relevant_clusters,
            starter_steps: r.starter_steps,
            knowledge_coverage: r.knowledge_coverage.clamp(0.0, 1.0),
            referenced_sections: Vec::new(),
            status: crate::domain::IdeaStatus::Proposed,
            generated_at: now,
        })
        .collect();

    Ok(seeds)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::{EmbeddingResponse, GenerationResponse, Message, Oracle};
    use async_trait::async_trait;
    use chrono::Utc;

    /// Never actually called: `suggest` must reject on the cluster-count
    /// gate before reaching the oracle.
    struct UnreachableOracle;

    #[async_trait]
    impl Oracle for UnreachableOracle {
        async fn generate(&self, _messages: &[Message]) -> Result<GenerationResponse> {
            unreachable!("gate should reject before calling the oracle")
        }
        async fn embed(&self, _text: &str) -> Result<EmbeddingResponse> {
            unreachable!("gate should reject before calling the oracle")
        }
        async fn list_models(&self) -> Result<Vec<String>> {
            unreachable!()
        }
        async fn is_model_available(&self, _model: &str) -> Result<bool> {
            unreachable!()
        }
    }

    fn sample_cluster(id: i64, name: &str) -> Cluster {
        let now = Utc::now();
        Cluster {
            id,
            kb_id: 1,
            name: name.to_string(),
            primary_concepts: vec!["rust".to_string(), "tokio".to_string()],
            skill_level: Some("intermediate".to_string()),
            doc_ids: vec![1, 2],
            doc_count: 2,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn empty_knowledge_bank_summary_matches_python_literal() {
        let clusters = BTreeMap::new();
        assert_eq!(summarize_knowledge(&clusters, &[]), "Empty knowledge bank");
    }

    #[test]
    fn summary_includes_cluster_header_and_sample_docs() {
        let mut clusters = BTreeMap::new();
        clusters.insert(0, sample_cluster(0, "Rust Async"));
        let docs = vec![DocumentConceptView {
            cluster_id: Some(0),
            source_type: "file",
            concept_names: &["tokio".to_string(), "async".to_string()],
            content_length: 500,
        }];

        let summary = summarize_knowledge(&clusters, &docs);
        assert!(summary.contains("CLUSTER 0: Rust Async"));
        assert!(summary.contains("- Documents: 2"));
        assert!(summary.contains("- Primary concepts: rust, tokio"));
        assert!(summary.contains("file: tokio, async"));
    }

    #[tokio::test]
    async fn no_documents_is_rejected_before_calling_oracle() {
        let mut clusters = BTreeMap::new();
        clusters.insert(0, sample_cluster(0, "Solo"));
        let oracle = UnreachableOracle;

        let err = suggest(&oracle, &clusters, &[], 5).await.unwrap_err();
        assert!(err.to_string().contains("insufficient_knowledge"));
        assert!(err.to_string().contains("document_count"));
    }

    #[tokio::test]
    async fn too_few_distinct_concepts_and_too_short_content_are_both_listed() {
        let clusters = BTreeMap::new();
        let oracle = UnreachableOracle;
        let docs = vec![DocumentConceptView {
            cluster_id: None,
            source_type: "text",
            concept_names: &["rust".to_string()],
            content_length: 10,
        }];

        let err = suggest(&oracle, &clusters, &docs, 5).await.unwrap_err();
        let message = err.to_string();
        assert!(message.contains("distinct_concepts"));
        assert!(message.contains("cluster_count"));
        assert!(message.contains("total_content_length"));
    }

    #[test]
    fn thresholds_all_pass_for_a_well_populated_knowledge_bank() {
        let mut clusters = BTreeMap::new();
        clusters.insert(0, sample_cluster(0, "Rust Async"));
        let docs = vec![DocumentConceptView {
            cluster_id: Some(0),
            source_type: "file",
            concept_names: &["rust".to_string(), "tokio".to_string()],
            content_length: 5000,
        }];
        assert!(failed_thresholds(&clusters, &docs).is_empty());
    }
}
