//! Error taxonomy for the knowledge bank.

use thiserror::Error;

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, AppError>;

/// Top-level error type. Every variant maps to one of the ten error
/// kinds a caller-facing layer (HTTP, CLI, ...) needs to distinguish.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("quota exceeded: {0}")]
    Quota(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("extraction failed: {0}")]
    Extraction(String),

    #[error("oracle error: {0}")]
    Oracle(#[from] OracleError),

    #[error("cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("generic error: {0}")]
    Generic(#[from] anyhow::Error),
}

/// Errors from the Oracle (abstract LLM/embedding provider) boundary.
#[derive(Error, Debug)]
pub enum OracleError {
    #[error("oracle unavailable: {0}")]
    Unavailable(String),

    #[error("model not found: {0}")]
    ModelNotFound(String),

    #[error("generation failed: {0}")]
    GenerationFailed(String),

    #[error("embedding failed: {0}")]
    EmbeddingFailed(String),

    #[error("oracle returned malformed schema: {0}")]
    SchemaViolation(String),

    #[error("oracle timed out")]
    Timeout,
}

impl AppError {
    /// Whether the operation that produced this error is safe to retry
    /// with backoff (used by the job queue, §4.C).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AppError::Oracle(OracleError::Timeout)
                | AppError::Oracle(OracleError::Unavailable(_))
                | AppError::Http(_)
        )
    }

    /// Stable category string for logging/metrics, and the spec's
    /// ten-kind error taxonomy.
    pub fn category(&self) -> &'static str {
        match self {
            AppError::Validation(_) => "validation",
            AppError::Unauthorized => "unauthorized",
            AppError::Forbidden(_) => "forbidden",
            AppError::Quota(_) => "quota",
            AppError::NotFound(_) => "not_found",
            AppError::Conflict(_) => "conflict",
            AppError::Extraction(_) => "extraction",
            AppError::Oracle(OracleError::SchemaViolation(_)) => "oracle_schema",
            AppError::Oracle(_) => "oracle_unavailable",
            AppError::Cancelled => "cancelled",
            AppError::Internal(_)
            | AppError::Io(_)
            | AppError::Serialization(_)
            | AppError::Http(_)
            | AppError::Database(_)
            | AppError::Generic(_) => "internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oracle_timeout_is_retryable() {
        let err = AppError::Oracle(OracleError::Timeout);
        assert!(err.is_retryable());
    }

    #[test]
    fn validation_is_not_retryable() {
        let err = AppError::Validation("missing field".into());
        assert!(!err.is_retryable());
    }

    #[test]
    fn schema_violation_has_its_own_category() {
        let err = AppError::Oracle(OracleError::SchemaViolation("bad json".into()));
        assert_eq!(err.category(), "oracle_schema");

        let unavailable = AppError::Oracle(OracleError::Timeout);
        assert_eq!(unavailable.category(), "oracle_unavailable");
    }

    #[test]
    fn categories_cover_all_ten_kinds() {
        assert_eq!(AppError::Unauthorized.category(), "unauthorized");
        assert_eq!(AppError::Forbidden("x".into()).category(), "forbidden");
        assert_eq!(AppError::Quota("x".into()).category(), "quota");
        assert_eq!(AppError::NotFound("x".into()).category(), "not_found");
        assert_eq!(AppError::Conflict("x".into()).category(), "conflict");
        assert_eq!(AppError::Extraction("x".into()).category(), "extraction");
        assert_eq!(AppError::Cancelled.category(), "cancelled");
        assert_eq!(AppError::Internal("x".into()).category(), "internal");
    }
}
