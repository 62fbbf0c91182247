//! Job handlers (§4.C) wiring the pipeline stages together behind the
//! [`crate::jobs::JobHandler`] trait: `JobKind::Ingest` runs chunk →
//! embed → extract-concepts → cluster → summarize → commit for one
//! document in a single job, and `JobKind::Suggest` runs the build
//! suggester over a whole knowledge base.
//!
//! Grounded on the teacher's daemon wiring one concrete task type per
//! registered handler (`agency-daemon.rs`'s `AppState` composing the
//! library's pieces into one running process); this module is the
//! `knowbank` analogue, composing `chunk`/`embedding`/`concepts`/
//! `cluster`/`summarize` into the two job kinds this crate actually
//! enqueues.

use crate::chunk::{chunk_document, ChunkerConfig};
use crate::concepts::extract_concepts;
use crate::domain::{ChunkTier, Document, JobKind, SourceType};
use crate::embedding::{EmbeddingOutcome, EmbeddingService};
use crate::error::{AppError, Result};
use crate::jobs::JobHandler;
use crate::oracle::Oracle;
use crate::store::{ClusterAssignmentInput, IngestOutcome, NewDocument, SqliteStore};
use crate::suggest::{self, DocumentConceptView};
use crate::summarize;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

/// Job payload for `JobKind::Ingest`: everything the pipeline needs
/// that isn't already derivable from the store. Text extraction
/// (`ingest::extractors`) happens before enqueueing, not inside the
/// job, so the job itself never touches the filesystem or network.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestPayload {
    pub kb_id: i64,
    pub source_type: SourceType,
    pub filename: Option<String>,
    pub source_url: Option<String>,
    pub image_path: Option<String>,
    pub raw_text: String,
    #[serde(default)]
    pub section_breaks: Vec<usize>,
}

/// Job payload for `JobKind::Suggest`: which knowledge base to
/// analyze and how many ideas to return at most.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuggestPayload {
    pub kb_id: i64,
    #[serde(default = "default_max_suggestions")]
    pub max_suggestions: usize,
}

fn default_max_suggestions() -> usize {
    5
}

pub struct IngestJobHandler {
    store: Arc<SqliteStore>,
    oracle: Arc<dyn Oracle>,
    embedding: Arc<EmbeddingService>,
    chunk_config: ChunkerConfig,
}

impl IngestJobHandler {
    pub fn new(store: Arc<SqliteStore>, oracle: Arc<dyn Oracle>, embedding: Arc<EmbeddingService>, chunk_config: ChunkerConfig) -> Self {
        Self { store, oracle, embedding, chunk_config }
    }

    async fn run_ingest(&self, owner_username: &str, payload: IngestPayload) -> Result<Document> {
        let document = self
            .store
            .create_document(NewDocument {
                kb_id: payload.kb_id,
                owner_username: owner_username.to_string(),
                source_type: payload.source_type,
                filename: payload.filename,
                source_url: payload.source_url,
                image_path: payload.image_path,
                content_length: payload.raw_text.len() as i64,
                raw_text: payload.raw_text.clone(),
            })
            .await?;

        let mut chunks = chunk_document(document.id, payload.kb_id, &payload.raw_text, &payload.section_breaks, &self.chunk_config)?;

        let mut degraded_embeddings = false;
        for chunk in chunks.iter_mut().filter(|c| c.tier == ChunkTier::Child) {
            match self.embedding.embed(self.oracle.as_ref(), &chunk.content).await? {
                EmbeddingOutcome::Embedded(vector) => chunk.embedding = Some(vector),
                EmbeddingOutcome::Degraded => degraded_embeddings = true,
            }
        }
        if degraded_embeddings {
            warn!(document_id = document.id, "one or more chunks embedded in degraded (TF-IDF-only) mode");
        }

        let extraction = extract_concepts(self.oracle.as_ref(), document.id, &payload.raw_text).await?;
        let concept_names: Vec<String> = extraction.concepts.iter().map(|c| c.name.clone()).collect();

        // The actual cluster read-decide-write happens inside
        // `commit_ingest`'s transaction, not here: deciding against a
        // snapshot fetched before the commit transaction starts would
        // let two concurrent ingestions into the same (still-empty)
        // cluster both see "no existing cluster" and each mint their
        // own, one clobbering the other on commit (§5, S4). Only the
        // inputs to that decision travel with the outcome.
        let cluster_assignment = Some(ClusterAssignmentInput {
            kb_id: payload.kb_id,
            concept_names: concept_names.clone(),
            suggested_cluster_name: extraction.suggested_cluster.clone(),
            skill_level: extraction.skill_level.clone(),
        });

        let parent_chunks: Vec<_> = chunks.iter().filter(|c| c.tier == ChunkTier::Parent).collect();
        let parent_spans = approximate_byte_spans(&parent_chunks);

        let mut summaries = Vec::new();
        if !parent_chunks.is_empty() {
            let sections = summarize::group_chunks_into_sections(&parent_spans, &payload.section_breaks);
            let mut section_summaries = Vec::with_capacity(sections.len());

            for section in &sections {
                let mut chunk_summaries = Vec::with_capacity(section.len());
                for &idx in section {
                    let parent = parent_chunks[idx];
                    // Real chunk ids are only known after `commit_ingest`
                    // persists them; summaries reference the in-memory
                    // chunk's position here and are re-anchored to real
                    // ids by `commit_ingest` alongside the chunks
                    // themselves (both are written in the same transaction).
                    let summary = summarize::summarize_chunk(self.oracle.as_ref(), document.id, idx as i64, &parent.content).await?;
                    chunk_summaries.push(summary);
                }
                let section_summary = summarize::summarize_section(self.oracle.as_ref(), document.id, None, &chunk_summaries).await?;
                section_summaries.push(section_summary);
                summaries.extend(chunk_summaries);
            }

            let doc_summary = summarize::summarize_document(self.oracle.as_ref(), document.id, &section_summaries).await?;
            summaries.extend(section_summaries);
            summaries.push(doc_summary);
        }

        self.store
            .commit_ingest(IngestOutcome {
                document_id: document.id,
                owner_username: owner_username.to_string(),
                skill_level: extraction.skill_level,
                chunks,
                concepts: extraction.concepts,
                summaries,
                cluster_assignment,
            })
            .await?;

        info!(document_id = document.id, kb_id = payload.kb_id, "document ingested");
        self.store.get_document(document.id).await?.ok_or_else(|| AppError::Internal("document vanished immediately after ingest commit".to_string()))
    }
}

/// Reconstruct each parent chunk's approximate byte span in the
/// original document by walking their content lengths in order. Parent
/// windows are contiguous and non-overlapping (`chunk.rs` chunks the
/// parent tier with zero overlap), so this is exact up to the
/// whitespace `chunk_document` trims from each window's edges.
fn approximate_byte_spans(parents: &[&crate::domain::Chunk]) -> Vec<(usize, usize)> {
    let mut offset = 0usize;
    parents
        .iter()
        .map(|c| {
            let start = offset;
            offset += c.content.len();
            (start, offset)
        })
        .collect()
}

#[async_trait::async_trait]
impl JobHandler for IngestJobHandler {
    fn kind(&self) -> JobKind {
        JobKind::Ingest
    }

    async fn run(&self, job: &crate::domain::Job) -> Result<serde_json::Value> {
        let payload: IngestPayload = serde_json::from_value(job.payload.clone())
            .map_err(|e| AppError::Validation(format!("malformed ingest job payload: {e}")))?;
        let document = self.run_ingest(&job.owner_username, payload).await?;
        serde_json::to_value(&document).map_err(|e| AppError::Internal(e.to_string()))
    }
}

pub struct SuggestJobHandler {
    store: Arc<SqliteStore>,
    oracle: Arc<dyn Oracle>,
}

impl SuggestJobHandler {
    pub fn new(store: Arc<SqliteStore>, oracle: Arc<dyn Oracle>) -> Self {
        Self { store, oracle }
    }

    async fn run_suggest(&self, payload: SuggestPayload) -> Result<Vec<i64>> {
        let clusters = self.store.list_clusters_for_kb(payload.kb_id).await?;
        let documents = self.store.list_documents_for_kb(payload.kb_id).await?;

        let mut concept_names_by_doc = Vec::with_capacity(documents.len());
        for doc in &documents {
            let concepts = self.store.list_concepts_for_document(doc.id).await?;
            concept_names_by_doc.push(concepts.into_iter().map(|c| c.name).collect::<Vec<String>>());
        }

        let views: Vec<DocumentConceptView<'_>> = documents
            .iter()
            .zip(concept_names_by_doc.iter())
            .map(|(doc, names)| DocumentConceptView {
                cluster_id: doc.cluster_id,
                source_type: doc.source_type.as_str(),
                concept_names: names,
                content_length: doc.content_length,
            })
            .collect();

        let seeds = suggest::suggest(self.oracle.as_ref(), &clusters, &views, payload.max_suggestions).await?;
        self.store.add_build_idea_seeds(&seeds).await
    }
}

#[async_trait::async_trait]
impl JobHandler for SuggestJobHandler {
    fn kind(&self) -> JobKind {
        JobKind::Suggest
    }

    async fn run(&self, job: &crate::domain::Job) -> Result<serde_json::Value> {
        let payload: SuggestPayload = serde_json::from_value(job.payload.clone())
            .map_err(|e| AppError::Validation(format!("malformed suggest job payload: {e}")))?;
        let ids = self.run_suggest(payload).await?;
        serde_json::to_value(&ids).map_err(|e| AppError::Internal(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn approximate_spans_are_contiguous_and_non_overlapping() {
        let a = crate::domain::Chunk {
            id: 0,
            document_id: 1,
            kb_id: 1,
            chunk_index: 0,
            tier: ChunkTier::Parent,
            parent_chunk_id: None,
            start_token: 0,
            end_token: 10,
            content: "hello".to_string(),
            token_count: 2,
            embedding: None,
            concepts: Vec::new(),
            summary: None,
            created_at: chrono::Utc::now(),
        };
        let mut b = a.clone();
        b.content = "world!!".to_string();
        let parents = vec![&a, &b];

        let spans = approximate_byte_spans(&parents);
        assert_eq!(spans, vec![(0, 5), (5, 12)]);
    }

    #[test]
    fn default_max_suggestions_is_five() {
        assert_eq!(default_max_suggestions(), 5);
    }

    #[test]
    fn ingest_payload_round_trips_through_json() {
        let payload = IngestPayload {
            kb_id: 1,
            source_type: SourceType::Text,
            filename: None,
            source_url: None,
            image_path: None,
            raw_text: "hello".to_string(),
            section_breaks: vec![10, 20],
        };
        let value = serde_json::to_value(&payload).unwrap();
        let round_tripped: IngestPayload = serde_json::from_value(value).unwrap();
        assert_eq!(round_tripped.kb_id, 1);
        assert_eq!(round_tripped.section_breaks, vec![10, 20]);
    }
}
