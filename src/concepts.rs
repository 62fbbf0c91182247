//! Concept extractor (§4.F): one oracle call per document pulls out a
//! concept list, a skill level, a primary topic, and a suggested
//! cluster name, with one repair retry on schema violation and then a
//! typed `oracle_schema` error.
//!
//! Grounded on the teacher's oracle-call-with-typed-error pattern
//! (`oracle.rs::generate_json`'s repair retry, reused here rather than
//! re-implemented) and the strict-JSON object contract spec.md assigns
//! this component; the object shape itself (concepts + skill_level +
//! primary_topic + suggested_cluster in one call) follows
//! `original_source/.../backend/concept_extractor.py`'s single
//! extraction call rather than splitting concepts from metadata.

use crate::domain::Concept;
use crate::error::{AppError, OracleError, Result};
use crate::oracle::{system_message, user_message, Message, Oracle};
use chrono::Utc;
use serde::Deserialize;
use std::collections::HashMap;

const SYSTEM_PROMPT: &str = "You extract key technical concepts and metadata from text. \
Respond with a JSON object with exactly four fields: \"concepts\" (array of objects each with \
\"name\" (string), \"category\" (string, one of: technology, skill, topic, tool), and \
\"confidence\" (number between 0.0 and 1.0)), \"skill_level\" (one of: beginner, intermediate, \
advanced, unknown), \"primary_topic\" (string), and \"suggested_cluster\" (a short string naming \
the topical cluster this content belongs to). Respond with ONLY the JSON object, no prose.";

#[derive(Debug, Deserialize)]
struct RawConcept {
    name: String,
    category: String,
    confidence: f32,
}

#[derive(Debug, Deserialize)]
struct RawExtraction {
    #[serde(default)]
    concepts: Vec<RawConcept>,
    #[serde(default)]
    skill_level: Option<String>,
    #[serde(default)]
    primary_topic: Option<String>,
    #[serde(default)]
    suggested_cluster: Option<String>,
}

/// Everything one concept-extraction call over a document produces:
/// the deduplicated concept list plus the metadata [`crate::cluster`]
/// needs to place the document (`suggested_cluster`) and the document
/// record stores (`skill_level`).
#[derive(Debug, Clone)]
pub struct ConceptExtraction {
    pub concepts: Vec<Concept>,
    pub skill_level: Option<String>,
    pub primary_topic: String,
    pub suggested_cluster: String,
}

fn build_messages(text: &str) -> Vec<Message> {
    vec![system_message(SYSTEM_PROMPT), user_message(format!("Text:\n{text}"))]
}

/// Extract concepts and classification metadata for `document_id` from
/// `text`. Confidence is clamped into `[0.0, 1.0]`; duplicate concept
/// names (case-sensitive, as produced by the oracle) coalesce to the
/// highest confidence seen rather than appearing twice. A missing
/// `suggested_cluster`/`primary_topic` falls back to `"General"` /
/// `"uncategorized"`, matching the teacher's Python default rather than
/// failing the whole extraction over an optional field.
pub async fn extract_concepts(oracle: &dyn Oracle, document_id: i64, text: &str) -> Result<ConceptExtraction> {
    let messages = build_messages(text);
    let value = oracle.generate_json(&messages).await?;
    let raw: RawExtraction = serde_json::from_value(value).map_err(|e| {
        AppError::Oracle(OracleError::SchemaViolation(format!(
            "concept extraction response did not match the expected schema: {e}"
        )))
    })?;

    let now = Utc::now();
    let mut by_name: HashMap<String, Concept> = HashMap::new();
    let mut order: Vec<String> = Vec::new();

    for r in raw.concepts {
        let confidence = r.confidence.clamp(0.0, 1.0);
        match by_name.get_mut(&r.name) {
            Some(existing) if existing.confidence < confidence => {
                existing.confidence = confidence;
                existing.category = r.category;
            }
            Some(_) => {}
            None => {
                order.push(r.name.clone());
                by_name.insert(
                    r.name.clone(),
                    Concept {
                        id: 0,
                        document_id,
                        name: r.name,
                        category: r.category,
                        confidence,
                        created_at: now,
                    },
                );
            }
        }
    }

    let concepts = order.into_iter().filter_map(|name| by_name.remove(&name)).collect();
    Ok(ConceptExtraction {
        concepts,
        skill_level: raw.skill_level,
        primary_topic: raw.primary_topic.unwrap_or_else(|| "uncategorized".to_string()),
        suggested_cluster: raw.suggested_cluster.unwrap_or_else(|| "General".to_string()),
    })
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

    #[tokio::test]
    async fn parses_well_formed_extraction() {
        let oracle = StubOracle {
            response: r#"{"concepts": [{"name": "Rust", "category": "technology", "confidence": 0.95}], \
            "skill_level": "intermediate", "primary_topic": "systems programming", \
            "suggested_cluster": "Rust"}"#
                .to_string(),
        };
        let extraction = extract_concepts(&oracle, 1, "some rust code").await.unwrap();
        assert_eq!(extraction.concepts.len(), 1);
        assert_eq!(extraction.concepts[0].name, "Rust");
        assert_eq!(extraction.concepts[0].confidence, 0.95);
        assert_eq!(extraction.skill_level.as_deref(), Some("intermediate"));
        assert_eq!(extraction.suggested_cluster, "Rust");
    }

    #[tokio::test]
    async fn confidence_is_clamped_into_unit_interval() {
        let oracle = StubOracle {
            response: r#"{"concepts": [{"name": "X", "category": "topic", "confidence": 1.5}]}"#.to_string(),
        };
        let extraction = extract_concepts(&oracle, 1, "text").await.unwrap();
        assert_eq!(extraction.concepts[0].confidence, 1.0);
    }

    #[tokio::test]
    async fn duplicate_names_coalesce_to_max_confidence() {
        let oracle = StubOracle {
            response: r#"{"concepts": [
                {"name": "Rust", "category": "technology", "confidence": 0.4},
                {"name": "Rust", "category": "technology", "confidence": 0.9}
            ]}"#
            .to_string(),
        };
        let extraction = extract_concepts(&oracle, 1, "text").await.unwrap();
        assert_eq!(extraction.concepts.len(), 1);
        assert_eq!(extraction.concepts[0].confidence, 0.9);
    }

    #[tokio::test]
    async fn missing_cluster_and_topic_fall_back_to_defaults() {
        let oracle = StubOracle { response: r#"{"concepts": []}"#.to_string() };
        let extraction = extract_concepts(&oracle, 1, "text").await.unwrap();
        assert_eq!(extraction.suggested_cluster, "General");
        assert_eq!(extraction.primary_topic, "uncategorized");
        assert!(extraction.skill_level.is_none());
    }

    #[tokio::test]
    async fn malformed_json_is_a_schema_violation_error() {
        let oracle = StubOracle { response: "not json at all".to_string() };
        let err = extract_concepts(&oracle, 1, "text").await.unwrap_err();
        assert_eq!(err.category(), "oracle_schema");
    }
}
