//! knowbank: a personal knowledge-bank service.
//!
//! Ingests documents (text, URLs, files, images) into per-user knowledge
//! bases, chunks them two tiers deep, extracts concepts, clusters
//! documents by shared concepts, builds hierarchical summaries, and
//! answers questions over the corpus with hybrid (sparse + dense)
//! retrieval-augmented generation. A background worker pool runs the
//! pipeline stages as durable jobs; a usage/quota layer enforces
//! plan-based limits per billing period.
//!
//! # Example
//!
//! ```rust,no_run
//! use knowbank::{AppConfig, SqliteStore};
//!
//! #[tokio::main]
//! async fn main() -> knowbank::Result<()> {
//!     let config = AppConfig::default();
//!     let store = SqliteStore::new(&config.store).await?;
//!     let _ = store;
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod chunk;
pub mod cluster;
pub mod concepts;
pub mod config;
pub mod domain;
pub mod embedding;
pub mod error;
pub mod ingest;
pub mod jobs;
pub mod oracle;
pub mod pipeline;
pub mod rag;
pub mod retrieval;
pub mod store;
pub mod suggest;
pub mod summarize;
pub mod usage;

pub use cache::{CacheConfig, Namespace, ResponseCache};
pub use chunk::{chunk_document, ChunkerConfig};
pub use cluster::ClusteringEngine;
pub use concepts::{extract_concepts, ConceptExtraction};
pub use config::{
    AppConfig, ChunkConfig, ClusterConfig, IngestConfig, OracleConfig, StoreConfig, UsageConfig,
    WorkerConfig,
};
pub use domain::{
    BuildIdeaSeed, Chunk, ChunkTier, ChunkingStatus, Cluster, Concept, Document, Feasibility,
    IdeaStatus, Job, JobError, JobKind, JobProgress, JobState, KnowledgeBase, Plan,
    RateLimitOverride, SavedIdea, SourceType, Subscription, Summary, SummaryLevel, SummaryStatus,
    UsageRecord, User, VectorDocument,
};
pub use embedding::{EmbeddingOutcome, EmbeddingService};
pub use error::{AppError, OracleError, Result};
pub use ingest::{
    extract, extract_image, extract_url, extract_zip_archive, validate_url,
    validate_url_resolving, ArchiveLimits, ArchiveStats, ExtractedText, Extractor,
    ExtractorRegistry, NoopOcr, OcrEngine,
};
pub use jobs::{backoff_for_attempt, enqueue, JobHandler, NewJob, WorkerPool};
pub use oracle::{
    assistant_message, system_message, user_message, EmbeddingResponse, GenerationResponse,
    HttpOracleClient, Message, Oracle, Role,
};
pub use pipeline::{IngestJobHandler, IngestPayload, SuggestJobHandler, SuggestPayload};
pub use rag::{answer_query, RagConfig, RagResponse, NO_CONTEXT_ANSWER};
pub use retrieval::{hybrid_retrieve, RetrievalConfig, RetrievalResult, RetrievedChunk};
pub use store::{IngestOutcome, NewDocument, SqliteStore};
pub use suggest::{summarize_knowledge, suggest, DocumentConceptView};
pub use summarize::{
    group_chunks_into_sections, summarize_chunk, summarize_document, summarize_section,
};
pub use usage::{
    check_knowledge_base_quota, check_quota, check_storage_quota, new_period_record, period_end,
    period_start, record_usage, Counter, Operation,
};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(VERSION.starts_with(char::is_numeric));
    }
}
