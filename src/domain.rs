//! Closed record types for every entity in §3 of the data model. These
//! cross module boundaries (store, retrieval, rag, ...) as plain data;
//! no entity holds an owning reference to another, only ids, per the
//! "cyclic references as ids + lookup" design note.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub hashed_password: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeBase {
    pub id: i64,
    pub owner_username: String,
    pub name: String,
    pub is_default: bool,
    pub document_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Text,
    Url,
    File,
    Image,
}

impl SourceType {
    pub fn as_str(self) -> &'static str {
        match self {
            SourceType::Text => "text",
            SourceType::Url => "url",
            SourceType::File => "file",
            SourceType::Image => "image",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkingStatus {
    Pending,
    Chunked,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SummaryStatus {
    Pending,
    Summarized,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: i64,
    /// Globally unique, monotonically assigned vector-store key (§4.M).
    pub doc_id: i64,
    pub kb_id: i64,
    pub owner_username: String,
    pub cluster_id: Option<i64>,
    pub source_type: SourceType,
    pub filename: Option<String>,
    pub source_url: Option<String>,
    pub image_path: Option<String>,
    pub content_length: i64,
    pub skill_level: Option<String>,
    pub chunking_status: ChunkingStatus,
    pub summary_status: SummaryStatus,
    pub chunk_count: i64,
    pub ingested_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorDocument {
    pub doc_id: i64,
    pub raw_text: String,
    pub tfidf_vector: Option<Vec<f32>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkTier {
    Parent,
    Child,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub id: i64,
    pub document_id: i64,
    pub kb_id: i64,
    /// Contiguous, insertion-order-stable index across both tiers.
    pub chunk_index: i32,
    pub tier: ChunkTier,
    pub parent_chunk_id: Option<i64>,
    pub start_token: i32,
    pub end_token: i32,
    pub content: String,
    pub token_count: i32,
    pub embedding: Option<Vec<f32>>,
    pub concepts: Vec<String>,
    pub summary: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Concept {
    pub id: i64,
    pub document_id: i64,
    pub name: String,
    pub category: String,
    pub confidence: f32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cluster {
    pub id: i64,
    pub kb_id: i64,
    pub name: String,
    /// Top-5 most frequent concept names across all members.
    pub primary_concepts: Vec<String>,
    pub skill_level: Option<String>,
    pub doc_ids: Vec<i64>,
    pub doc_count: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SummaryLevel {
    Chunk = 1,
    Section = 2,
    Document = 3,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Summary {
    pub id: i64,
    pub document_id: i64,
    pub chunk_id: Option<i64>,
    pub parent_id: Option<i64>,
    pub level: SummaryLevel,
    pub short_summary: String,
    pub long_summary: Option<String>,
    pub key_concepts: Vec<String>,
    pub tech_stack: Vec<String>,
    pub skill_profile: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Feasibility {
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdeaStatus {
    Proposed,
    Saved,
    Dismissed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildIdeaSeed {
    pub id: i64,
    pub kb_id: i64,
    pub title: String,
    pub description: String,
    pub feasibility: Feasibility,
    pub effort_estimate: String,
    pub required_skills: Vec<String>,
    pub missing_knowledge: Vec<String>,
    pub relevant_clusters: Vec<i64>,
    pub starter_steps: Vec<String>,
    pub knowledge_coverage: f32,
    pub referenced_sections: Vec<i64>,
    pub status: IdeaStatus,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SavedIdea {
    pub id: i64,
    pub owner_username: String,
    pub seed_id: i64,
    pub notes: Option<String>,
    pub saved_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Processing,
    Success,
    Failure,
    Retry,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Ingest,
    Embed,
    ExtractConcepts,
    Cluster,
    Summarize,
    Suggest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobProgress {
    pub percent: u8,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub kind: JobKind,
    pub owner_username: String,
    pub payload: serde_json::Value,
    pub state: JobState,
    pub progress: JobProgress,
    pub attempt: u32,
    pub max_attempts: u32,
    pub result: Option<serde_json::Value>,
    pub error: Option<JobError>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobError {
    pub kind: String,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Plan {
    Free,
    Starter,
    Pro,
    Enterprise,
}

impl Plan {
    pub fn as_str(self) -> &'static str {
        match self {
            Plan::Free => "free",
            Plan::Starter => "starter",
            Plan::Pro => "pro",
            Plan::Enterprise => "enterprise",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub id: i64,
    pub username: String,
    pub plan: Plan,
    pub status: String,
    pub current_period_start: Option<DateTime<Utc>>,
    pub current_period_end: Option<DateTime<Utc>>,
    pub cancel_at_period_end: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    pub id: i64,
    pub username: String,
    pub subscription_id: Option<i64>,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub api_calls: i64,
    pub documents_uploaded: i64,
    pub ai_requests: i64,
    pub storage_bytes: i64,
    pub search_queries: i64,
    pub build_suggestions: i64,
    pub created_at: DateTime<Utc>,
}

/// Per-user override of plan limits (§3 expansion), grounded on the
/// `rate_limit_overrides` table; takes precedence over the plan default
/// whenever a field is `Some`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitOverride {
    pub username: String,
    pub api_calls_per_minute: Option<i64>,
    pub api_calls_per_day: Option<i64>,
    pub documents_per_month: Option<i64>,
    pub ai_requests_per_day: Option<i64>,
    pub storage_mb: Option<i64>,
    pub knowledge_bases: Option<i64>,
    pub reason: Option<String>,
    pub granted_by: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}
