//! Configuration for the knowledge bank.

use crate::cache::CacheConfig;
use serde::{Deserialize, Serialize};

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub oracle: OracleConfig,
    pub store: StoreConfig,
    pub cache: CacheConfig,
    pub ingest: IngestConfig,
    pub chunk: ChunkConfig,
    pub cluster: ClusterConfig,
    pub usage: UsageConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    /// Set when running under the test harness; relaxes quota strictness
    /// and disables the LRU embedding cache so tests are deterministic.
    #[serde(default)]
    pub testing: bool,
}

/// Oracle (abstract LLM/embedding provider) connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OracleConfig {
    /// Base endpoint, e.g. `http://localhost:11434` or a hosted provider URL.
    pub endpoint: String,
    /// API key/bearer token, if the provider requires one.
    pub api_key: Option<String>,
    pub text_model: String,
    pub embedding_model: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_embedding_dimension")]
    pub embedding_dimension: usize,
}

fn default_max_tokens() -> u32 {
    2048
}

fn default_temperature() -> f32 {
    0.3
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_embedding_dimension() -> usize {
    768
}

/// Durable storage settings (§4.M).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// SQLite DSN, e.g. `sqlite:knowbank.db` or `sqlite::memory:`.
    pub database_url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Filesystem root for stored image artifacts.
    #[serde(default = "default_image_store_path")]
    pub image_store_path: String,
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: u64,
}

fn default_max_connections() -> u32 {
    5
}

fn default_image_store_path() -> String {
    "./data/images".to_string()
}

fn default_max_upload_bytes() -> u64 {
    100 * 1024 * 1024
}

/// Ingestion/archive-recursion limits (§4.B).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    #[serde(default = "default_max_archive_depth")]
    pub max_archive_depth: u32,
    #[serde(default = "default_max_archive_files")]
    pub max_archive_files: usize,
    #[serde(default = "default_max_entry_bytes")]
    pub max_entry_bytes: u64,
    #[serde(default = "default_max_urls_per_request")]
    pub max_urls_per_request: usize,
}

fn default_max_archive_depth() -> u32 {
    5
}

fn default_max_archive_files() -> usize {
    1000
}

fn default_max_entry_bytes() -> u64 {
    10 * 1024 * 1024
}

fn default_max_urls_per_request() -> usize {
    10
}

/// Two-tier chunker sizing (§4.D).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkConfig {
    #[serde(default = "default_parent_tokens")]
    pub parent_tokens: usize,
    #[serde(default = "default_child_tokens")]
    pub child_tokens: usize,
    #[serde(default = "default_child_overlap_tokens")]
    pub child_overlap_tokens: usize,
    #[serde(default = "default_embedding_cache_entries")]
    pub embedding_cache_entries: usize,
}

fn default_parent_tokens() -> usize {
    2000
}

fn default_child_tokens() -> usize {
    400
}

fn default_child_overlap_tokens() -> usize {
    50
}

fn default_embedding_cache_entries() -> usize {
    10_000
}

/// Clustering engine (§4.G).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f32,
    #[serde(default = "default_name_bonus")]
    pub name_match_bonus: f32,
}

fn default_similarity_threshold() -> f32 {
    0.30
}

fn default_name_bonus() -> f32 {
    0.2
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: default_similarity_threshold(),
            name_match_bonus: default_name_bonus(),
        }
    }
}

/// Usage accounting defaults (§4.L).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageConfig {
    #[serde(default = "default_plan")]
    pub default_plan: String,
}

fn default_plan() -> String {
    "free".to_string()
}

impl Default for UsageConfig {
    fn default() -> Self {
        Self {
            default_plan: default_plan(),
        }
    }
}

/// Job queue worker pool (§5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_worker_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_worker_concurrency() -> usize {
    4
}

fn default_max_attempts() -> u32 {
    3
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: default_worker_concurrency(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:11434".to_string(),
            api_key: None,
            text_model: "llama3.2".to_string(),
            embedding_model: "nomic-embed-text".to_string(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            timeout_secs: default_timeout_secs(),
            embedding_dimension: default_embedding_dimension(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite:knowbank.db?mode=rwc".to_string(),
            max_connections: default_max_connections(),
            image_store_path: default_image_store_path(),
            max_upload_bytes: default_max_upload_bytes(),
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_archive_depth: default_max_archive_depth(),
            max_archive_files: default_max_archive_files(),
            max_entry_bytes: default_max_entry_bytes(),
            max_urls_per_request: default_max_urls_per_request(),
        }
    }
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            parent_tokens: default_parent_tokens(),
            child_tokens: default_child_tokens(),
            child_overlap_tokens: default_child_overlap_tokens(),
            embedding_cache_entries: default_embedding_cache_entries(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            oracle: OracleConfig::default(),
            store: StoreConfig::default(),
            cache: CacheConfig::default(),
            ingest: IngestConfig::default(),
            chunk: ChunkConfig::default(),
            cluster: ClusterConfig::default(),
            usage: UsageConfig::default(),
            worker: WorkerConfig::default(),
            testing: false,
        }
    }
}

impl AppConfig {
    /// Load configuration from a file, dispatching on extension.
    pub fn from_file<P: AsRef<std::path::Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(&path)?;
        let config = match path.as_ref().extension().and_then(|s| s.to_str()) {
            Some("json") => serde_json::from_str(&content)?,
            Some("toml") => toml::from_str(&content)?,
            Some("yaml") | Some("yml") => serde_yml::from_str(&content)?,
            _ => return Err(anyhow::anyhow!("unsupported config file format")),
        };
        Ok(config)
    }

    /// Save configuration to a file, dispatching on extension.
    pub fn to_file<P: AsRef<std::path::Path>>(&self, path: P) -> anyhow::Result<()> {
        let content = match path.as_ref().extension().and_then(|s| s.to_str()) {
            Some("json") => serde_json::to_string_pretty(self)?,
            Some("toml") => toml::to_string(self)?,
            Some("yaml") | Some("yml") => serde_yml::to_string(self)?,
            _ => return Err(anyhow::anyhow!("unsupported config file format")),
        };
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Validate configuration invariants that would otherwise surface as
    /// confusing runtime errors much later.
    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.oracle.endpoint.starts_with("http") {
            return Err(anyhow::anyhow!(
                "invalid oracle endpoint: {}",
                self.oracle.endpoint
            ));
        }
        if self.oracle.text_model.is_empty() {
            return Err(anyhow::anyhow!("oracle text model cannot be empty"));
        }
        if self.oracle.embedding_model.is_empty() {
            return Err(anyhow::anyhow!("oracle embedding model cannot be empty"));
        }
        if self.oracle.embedding_dimension == 0 {
            return Err(anyhow::anyhow!("embedding dimension must be greater than 0"));
        }
        if self.store.database_url.is_empty() {
            return Err(anyhow::anyhow!("database_url cannot be empty"));
        }
        if !(0.0..=1.0).contains(&self.cluster.similarity_threshold) {
            return Err(anyhow::anyhow!(
                "cluster similarity_threshold must be between 0.0 and 1.0"
            ));
        }
        if self.chunk.child_overlap_tokens >= self.chunk.child_tokens {
            return Err(anyhow::anyhow!(
                "child_overlap_tokens must be smaller than child_tokens"
            ));
        }
        if self.worker.concurrency == 0 {
            return Err(anyhow::anyhow!("worker concurrency must be greater than 0"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.cluster.similarity_threshold, 0.30);
    }

    #[test]
    fn rejects_bad_oracle_endpoint() {
        let mut config = AppConfig::default();
        config.oracle.endpoint = "not-a-url".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_overlap_not_smaller_than_child_size() {
        let mut config = AppConfig::default();
        config.chunk.child_overlap_tokens = config.chunk.child_tokens;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_out_of_range_similarity_threshold() {
        let mut config = AppConfig::default();
        config.cluster.similarity_threshold = 1.5;
        assert!(config.validate().is_err());
    }
}
