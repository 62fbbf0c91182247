//! Embedding service (§4.E): embed chunk text via the oracle, cached in
//! a bounded in-process LRU keyed by content hash.
//!
//! LRU grounded on the `lru` crate, attested across the pack
//! (`motedb`, `danielmriley-aigent`, `zircote-subcog`,
//! `deadbranch-forks-ironclaw`) for exactly this shape of bounded
//! content cache. Falls back to a degraded TF-IDF-only mode when the
//! oracle is unavailable: embeddings stay `None` rather than failing
//! the whole ingest, since the sparse retrieval leg (§4.I) still works
//! without them.

use crate::error::{AppError, OracleError, Result};
use crate::oracle::Oracle;
use lru::LruCache;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::num::NonZeroUsize;
use std::sync::Mutex;
use tracing::{debug, warn};

/// Bounded LRU capacity (spec: ~10k entries).
const DEFAULT_CAPACITY: usize = 10_000;

fn content_key(text: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    text.hash(&mut hasher);
    hasher.finish()
}

/// Outcome of an embedding request: either a vector, or an explicit
/// note that the oracle was unavailable and search must fall back to
/// the sparse (TF-IDF) leg for this chunk.
#[derive(Debug, Clone)]
pub enum EmbeddingOutcome {
    Embedded(Vec<f32>),
    Degraded,
}

pub struct EmbeddingService {
    cache: Mutex<LruCache<u64, Vec<f32>>>,
}

impl EmbeddingService {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::new(1).unwrap());
        Self { cache: Mutex::new(LruCache::new(capacity)) }
    }

    /// Embed `text` through `oracle`, serving from cache when the exact
    /// content was embedded before. An unavailable oracle degrades to
    /// [`EmbeddingOutcome::Degraded`] rather than propagating the error,
    /// per §4.E; any other oracle error (e.g. a malformed response) is
    /// still surfaced.
    pub async fn embed(&self, oracle: &dyn Oracle, text: &str) -> Result<EmbeddingOutcome> {
        let key = content_key(text);

        if let Some(cached) = self.cache.lock().expect("embedding cache lock poisoned").get(&key) {
            debug!("embedding cache hit");
            return Ok(EmbeddingOutcome::Embedded(cached.clone()));
        }

        match oracle.embed(text).await {
            Ok(response) => {
                self.cache
                    .lock()
                    .expect("embedding cache lock poisoned")
                    .put(key, response.embedding.clone());
                Ok(EmbeddingOutcome::Embedded(response.embedding))
            }
            Err(AppError::Oracle(OracleError::Unavailable(reason))) => {
                warn!(reason = %reason, "oracle unavailable, degrading to TF-IDF-only search for this chunk");
                Ok(EmbeddingOutcome::Degraded)
            }
            Err(AppError::Oracle(OracleError::Timeout)) => {
                warn!("oracle timed out, degrading to TF-IDF-only search for this chunk");
                Ok(EmbeddingOutcome::Degraded)
            }
            Err(other) => Err(other),
        }
    }

    pub fn len(&self) -> usize {
        self.cache.lock().expect("embedding cache lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for EmbeddingService {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::{EmbeddingResponse, GenerationResponse, Message};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Clone, Copy)]
    enum FailureMode {
        Unavailable,
        Timeout,
        SchemaViolation,
    }

    struct CountingOracle {
        calls: AtomicUsize,
        fail_with: Option<FailureMode>,
    }

    impl CountingOracle {
        fn ok() -> Self {
            Self { calls: AtomicUsize::new(0), fail_with: None }
        }
        fn failing(mode: FailureMode) -> Self {
            Self { calls: AtomicUsize::new(0), fail_with: Some(mode) }
        }
    }

    #[async_trait]
    impl Oracle for CountingOracle {
        async fn generate(&self, _messages: &[Message]) -> Result<GenerationResponse> {
            unimplemented!()
        }
        async fn embed(&self, text: &str) -> Result<EmbeddingResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.fail_with {
                Some(FailureMode::Unavailable) => Err(AppError::Oracle(OracleError::Unavailable("connection refused".to_string()))),
                Some(FailureMode::Timeout) => Err(AppError::Oracle(OracleError::Timeout)),
                Some(FailureMode::SchemaViolation) => Err(AppError::Oracle(OracleError::SchemaViolation("bad".to_string()))),
                None => Ok(EmbeddingResponse { embedding: vec![text.len() as f32], model: "stub".to_string() }),
            }
        }
        async fn list_models(&self) -> Result<Vec<String>> {
            unimplemented!()
        }
        async fn is_model_available(&self, _model: &str) -> Result<bool> {
            unimplemented!()
        }
    }

    #[tokio::test]
    async fn repeated_content_is_served_from_cache() {
        let oracle = CountingOracle::ok();
        let service = EmbeddingService::new();

        service.embed(&oracle, "hello world").await.unwrap();
        service.embed(&oracle, "hello world").await.unwrap();

        assert_eq!(oracle.calls.load(Ordering::SeqCst), 1);
        assert_eq!(service.len(), 1);
    }

    #[tokio::test]
    async fn unavailable_oracle_degrades_instead_of_failing() {
        let oracle = CountingOracle::failing(FailureMode::Unavailable);
        let service = EmbeddingService::new();

        let outcome = service.embed(&oracle, "text").await.unwrap();
        assert!(matches!(outcome, EmbeddingOutcome::Degraded));
    }

    #[tokio::test]
    async fn timeout_also_degrades() {
        let oracle = CountingOracle::failing(FailureMode::Timeout);
        let service = EmbeddingService::new();
        let outcome = service.embed(&oracle, "text").await.unwrap();
        assert!(matches!(outcome, EmbeddingOutcome::Degraded));
    }

    #[tokio::test]
    async fn schema_violation_is_not_swallowed() {
        let oracle = CountingOracle::failing(FailureMode::SchemaViolation);
        let service = EmbeddingService::new();
        let err = service.embed(&oracle, "text").await.unwrap_err();
        assert_eq!(err.category(), "oracle_schema");
    }
}
