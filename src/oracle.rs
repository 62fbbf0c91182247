//! The abstract "Oracle" boundary: every call out to an LLM provider for
//! chat generation, embeddings, or strict-JSON extraction goes through
//! this trait. The provider itself is a collaborator this crate does not
//! implement; `HttpOracleClient` is a thin, provider-agnostic transport
//! (any endpoint that speaks the same chat/embedding JSON shape Ollama
//! popularized, which most self-hosted and OpenAI-compatible servers do).

use crate::cache::{CacheConfig, Namespace, ResponseCache};
use crate::error::{AppError, OracleError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, error, info};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

#[derive(Debug, Clone)]
pub struct GenerationResponse {
    pub text: String,
    pub tokens_used: Option<u32>,
    pub model: String,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone)]
pub struct EmbeddingResponse {
    pub embedding: Vec<f32>,
    pub model: String,
}

/// Everything the knowledge bank asks of the oracle: chat generation,
/// embeddings, strict-JSON structured extraction (for concepts), and a
/// single-shot relevance score (for rerank, §4.I).
#[async_trait]
pub trait Oracle: Send + Sync {
    async fn generate(&self, messages: &[Message]) -> Result<GenerationResponse>;
    async fn embed(&self, text: &str) -> Result<EmbeddingResponse>;
    async fn list_models(&self) -> Result<Vec<String>>;
    async fn is_model_available(&self, model: &str) -> Result<bool>;

    /// Ask the oracle for a JSON value conforming to the caller's prompt
    /// instructions, with one repair retry before giving up. Used by the
    /// concept extractor (§4.F) and the build suggester (§4.K).
    async fn generate_json(&self, messages: &[Message]) -> Result<serde_json::Value> {
        let response = self.generate(messages).await?;
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(&response.text) {
            return Ok(value);
        }

        let mut repair_messages = messages.to_vec();
        repair_messages.push(Message {
            role: Role::User,
            content: format!(
                "Your previous response was not valid JSON:\n{}\nRespond again with ONLY valid JSON, no prose.",
                response.text
            ),
        });
        let repaired = self.generate(&repair_messages).await?;
        serde_json::from_str(&repaired.text).map_err(|e| {
            AppError::Oracle(OracleError::SchemaViolation(format!(
                "oracle did not return valid JSON after repair attempt: {e}"
            )))
        })
    }

    /// Ask for a single relevance score in [0.0, 1.0] for a query/candidate
    /// pair; used as the cross-encoder rerank stand-in (§4.I).
    async fn relevance_score(&self, query: &str, candidate: &str) -> Result<f32> {
        let messages = vec![
            Message {
                role: Role::System,
                content: "You score how relevant a passage is to a query. Respond with only a single number between 0.0 and 1.0.".to_string(),
            },
            Message {
                role: Role::User,
                content: format!("Query: {query}\n\nPassage: {candidate}\n\nRelevance score:"),
            },
        ];
        let response = self.generate(&messages).await?;
        response
            .text
            .trim()
            .parse::<f32>()
            .map(|v| v.clamp(0.0, 1.0))
            .map_err(|e| AppError::Oracle(OracleError::GenerationFailed(e.to_string())))
    }
}

pub struct HttpOracleClient {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    text_model: String,
    embedding_model: String,
    max_tokens: u32,
    temperature: f32,
    timeout_secs: u64,
    cache: Option<Arc<ResponseCache>>,
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<Message>,
    stream: bool,
    options: ChatOptions,
}

#[derive(Debug, Serialize)]
struct ChatOptions {
    num_predict: u32,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    model: String,
    message: Message,
    done: bool,
    #[serde(default)]
    done_reason: Option<String>,
    #[serde(default)]
    eval_count: Option<u32>,
}

#[derive(Debug, Serialize)]
struct EmbedRequest {
    model: String,
    prompt: String,
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embedding: Vec<f32>,
}

#[derive(Debug, Deserialize)]
struct ModelsResponse {
    models: Vec<ModelInfo>,
}

#[derive(Debug, Deserialize)]
struct ModelInfo {
    name: String,
}

impl HttpOracleClient {
    pub fn new(config: &crate::config::OracleConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .expect("failed to build oracle HTTP client");

        Self {
            client,
            endpoint: config.endpoint.clone(),
            api_key: config.api_key.clone(),
            text_model: config.text_model.clone(),
            embedding_model: config.embedding_model.clone(),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            timeout_secs: config.timeout_secs,
            cache: None,
        }
    }

    pub async fn with_cache(
        config: &crate::config::OracleConfig,
        cache_config: CacheConfig,
    ) -> Result<Self> {
        let mut client = Self::new(config);
        client.cache = Some(Arc::new(ResponseCache::new(cache_config).await?));
        Ok(client)
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}/api/{}", self.endpoint.trim_end_matches('/'), path)
    }

    fn auth(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }
}

#[async_trait]
impl Oracle for HttpOracleClient {
    async fn generate(&self, messages: &[Message]) -> Result<GenerationResponse> {
        debug!(count = messages.len(), "oracle generate");

        let cache_key = self.cache.as_ref().map(|_| {
            let params = serde_json::to_string(messages).unwrap_or_default();
            ResponseCache::compute_key(Namespace::Analytics, &self.text_model, &params)
        });

        if let (Some(cache), Some(key)) = (&self.cache, &cache_key) {
            if let Ok(Some(cached)) = cache.get(Namespace::Analytics, key).await {
                debug!("oracle cache hit");
                return Ok(GenerationResponse {
                    text: cached,
                    tokens_used: None,
                    model: self.text_model.clone(),
                    finish_reason: Some("cached".to_string()),
                });
            }
        }

        let request = ChatRequest {
            model: self.text_model.clone(),
            messages: messages.to_vec(),
            stream: false,
            options: ChatOptions {
                num_predict: self.max_tokens,
                temperature: self.temperature,
            },
        };

        let url = self.api_url("chat");
        let response = timeout(
            Duration::from_secs(self.timeout_secs),
            self.auth(self.client.post(&url).json(&request)).send(),
        )
        .await
        .map_err(|_| AppError::Oracle(OracleError::Timeout))?
        .map_err(|e| AppError::Oracle(OracleError::Unavailable(e.to_string())))?;

        if !response.status().is_success() {
            let text = response.text().await.unwrap_or_else(|_| "unknown error".to_string());
            error!(error = %text, "oracle generation error");
            return Err(AppError::Oracle(OracleError::GenerationFailed(text)));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| AppError::Oracle(OracleError::GenerationFailed(e.to_string())))?;

        if !parsed.done {
            return Err(AppError::Oracle(OracleError::GenerationFailed(
                "incomplete response".to_string(),
            )));
        }

        let text = parsed.message.content.clone();
        if let (Some(cache), Some(key)) = (&self.cache, &cache_key) {
            if let Err(e) = cache.set(Namespace::Analytics, key, &text).await {
                error!(error = %e, "failed to cache oracle response");
            }
        }

        info!(tokens = parsed.eval_count.unwrap_or(0), "oracle generation complete");
        Ok(GenerationResponse {
            text,
            tokens_used: parsed.eval_count,
            model: parsed.model,
            finish_reason: parsed.done_reason,
        })
    }

    async fn embed(&self, text: &str) -> Result<EmbeddingResponse> {
        debug!(len = text.len(), "oracle embed");

        let request = EmbedRequest {
            model: self.embedding_model.clone(),
            prompt: text.to_string(),
        };

        let url = self.api_url("embeddings");
        let response = timeout(
            Duration::from_secs(self.timeout_secs),
            self.auth(self.client.post(&url).json(&request)).send(),
        )
        .await
        .map_err(|_| AppError::Oracle(OracleError::Timeout))?
        .map_err(|e| AppError::Oracle(OracleError::Unavailable(e.to_string())))?;

        if !response.status().is_success() {
            let text = response.text().await.unwrap_or_else(|_| "unknown error".to_string());
            return Err(AppError::Oracle(OracleError::EmbeddingFailed(text)));
        }

        let parsed: EmbedResponse = response
            .json()
            .await
            .map_err(|e| AppError::Oracle(OracleError::EmbeddingFailed(e.to_string())))?;

        Ok(EmbeddingResponse {
            embedding: parsed.embedding,
            model: self.embedding_model.clone(),
        })
    }

    async fn list_models(&self) -> Result<Vec<String>> {
        let url = self.api_url("tags");
        let response = timeout(
            Duration::from_secs(self.timeout_secs),
            self.auth(self.client.get(&url)).send(),
        )
        .await
        .map_err(|_| AppError::Oracle(OracleError::Timeout))?
        .map_err(|e| AppError::Oracle(OracleError::Unavailable(e.to_string())))?;

        if !response.status().is_success() {
            let text = response.text().await.unwrap_or_else(|_| "unknown error".to_string());
            return Err(AppError::Oracle(OracleError::GenerationFailed(text)));
        }

        let parsed: ModelsResponse = response
            .json()
            .await
            .map_err(|e| AppError::Oracle(OracleError::GenerationFailed(e.to_string())))?;

        Ok(parsed.models.into_iter().map(|m| m.name).collect())
    }

    async fn is_model_available(&self, model: &str) -> Result<bool> {
        let models = self.list_models().await?;
        Ok(models.iter().any(|m| m == model))
    }
}

pub fn system_message(content: impl Into<String>) -> Message {
    Message { role: Role::System, content: content.into() }
}

pub fn user_message(content: impl Into<String>) -> Message {
    Message { role: Role::User, content: content.into() }
}

pub fn assistant_message(content: impl Into<String>) -> Message {
    Message { role: Role::Assistant, content: content.into() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::automock;

    #[automock]
    #[async_trait]
    #[allow(dead_code)]
    pub trait MockOracle: Send + Sync {
        async fn generate(&self, messages: &[Message]) -> Result<GenerationResponse>;
        async fn embed(&self, text: &str) -> Result<EmbeddingResponse>;
    }

    #[test]
    fn message_constructors_set_role() {
        assert_eq!(system_message("hi").role, Role::System);
        assert_eq!(user_message("hi").role, Role::User);
        assert_eq!(assistant_message("hi").role, Role::Assistant);
    }

    #[test]
    fn api_url_joins_endpoint_and_path() {
        let config = crate::config::OracleConfig::default();
        let client = HttpOracleClient::new(&config);
        assert_eq!(client.api_url("chat"), "http://localhost:11434/api/chat");
    }

    #[tokio::test]
    async fn mock_oracle_generate() {
        let mut mock = MockMockOracle::new();
        mock.expect_generate().times(1).returning(|_| {
            Ok(GenerationResponse {
                text: "hello".to_string(),
                tokens_used: Some(3),
                model: "test".to_string(),
                finish_reason: Some("stop".to_string()),
            })
        });
        let response = mock.generate(&[user_message("hi")]).await.unwrap();
        assert_eq!(response.text, "hello");
    }
}
