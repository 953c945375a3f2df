//! Embedding provider abstraction and implementations.
//!
//! Defines the [`EmbeddingProvider`] capability — `{name, dimensions,
//! embed, embed_single}` — and four variants:
//!
//! - **local** — deterministic 384-dimension hashed bag-of-words
//!   projection; no network, no model download. The fallback used when
//!   no API key is configured, and the provider the test suite runs on.
//! - **openai** / **voyage** / **cohere** — batch POST with a bearer
//!   token. Responses are order-preserved (OpenAI responses are re-sorted
//!   by their `index` field) and every returned vector's length is
//!   validated against the declared dimensionality.
//!
//! Remote calls go through the retry layer in [`crate::fetch`]: capped
//! exponential backoff with jitter on transient transport errors and on
//! {429, 500, 502, 503, 504}, honouring `Retry-After`.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::config::EmbeddingConfig;
use crate::error::ProviderError;
use crate::fetch::{backoff_delay, is_retryable_status, is_transient_error, RetryPolicy};

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Provider name (e.g. `"local"`, `"openai"`).
    fn name(&self) -> &str;

    /// Fixed output dimensionality.
    fn dimensions(&self) -> usize;

    /// Embed a batch, one vector per text, preserving input order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError>;

    /// Convenience wrapper for a single text.
    async fn embed_single(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        let mut vectors = self.embed(std::slice::from_ref(&text.to_string())).await?;
        vectors
            .pop()
            .ok_or_else(|| ProviderError::BadResponse("empty embedding response".to_string()))
    }
}

/// Instantiate the provider selected by the configuration.
pub fn create_provider(config: &EmbeddingConfig) -> anyhow::Result<Arc<dyn EmbeddingProvider>> {
    match config.provider.as_str() {
        "local" => Ok(Arc::new(LocalProvider::new())),
        "openai" => Ok(Arc::new(RemoteProvider::openai(config)?)),
        "voyage" => Ok(Arc::new(RemoteProvider::voyage(config)?)),
        "cohere" => Ok(Arc::new(RemoteProvider::cohere(config)?)),
        other => anyhow::bail!("unknown embedding provider: {}", other),
    }
}

// ============ Local provider ============

const LOCAL_DIMENSIONS: usize = 384;

/// Deterministic local embeddings: lowercase, strip punctuation,
/// tokenise on whitespace, drop tokens of length ≤ 2, then project each
/// token's term frequency into a fixed 384-dimension vector by hashing
/// its characters into an index and a sign bit. L2-normalised.
pub struct LocalProvider;

impl LocalProvider {
    pub fn new() -> Self {
        Self
    }

    fn embed_one(text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; LOCAL_DIMENSIONS];

        let cleaned: String = text
            .to_lowercase()
            .chars()
            .map(|c| if c.is_alphanumeric() { c } else { ' ' })
            .collect();

        let mut frequencies: std::collections::HashMap<&str, u32> = std::collections::HashMap::new();
        for token in cleaned.split_whitespace() {
            if token.chars().count() <= 2 {
                continue;
            }
            *frequencies.entry(token).or_insert(0) += 1;
        }

        for (token, tf) in frequencies {
            let hash = fnv1a(token);
            let index = (hash % LOCAL_DIMENSIONS as u32) as usize;
            let sign = if (hash >> 31) & 1 == 1 { -1.0 } else { 1.0 };
            vector[index] += sign * tf as f32;
        }

        let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }
}

impl Default for LocalProvider {
    fn default() -> Self {
        Self::new()
    }
}

fn fnv1a(token: &str) -> u32 {
    let mut hash: u32 = 2166136261;
    for byte in token.bytes() {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(16777619);
    }
    hash
}

#[async_trait]
impl EmbeddingProvider for LocalProvider {
    fn name(&self) -> &str {
        "local"
    }

    fn dimensions(&self) -> usize {
        LOCAL_DIMENSIONS
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        Ok(texts.iter().map(|t| Self::embed_one(t)).collect())
    }
}

// ============ Remote providers ============

enum RemoteKind {
    OpenAi,
    Voyage,
    Cohere,
}

pub struct RemoteProvider {
    kind: RemoteKind,
    name: &'static str,
    model: String,
    dims: usize,
    api_key: String,
    endpoint: String,
    batch_size: usize,
    client: reqwest::Client,
    retry: RetryPolicy,
}

impl RemoteProvider {
    fn new(
        kind: RemoteKind,
        name: &'static str,
        config: &EmbeddingConfig,
        env_key: &str,
        default_model: &str,
        default_dims: usize,
        default_base: &str,
        path: &str,
    ) -> anyhow::Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .or_else(|| std::env::var(env_key).ok())
            .ok_or(ProviderError::MissingApiKey(name.to_string()))?;
        let model = config.model.clone().unwrap_or_else(|| default_model.to_string());
        let base = config
            .api_base
            .clone()
            .unwrap_or_else(|| default_base.to_string());

        Ok(Self {
            kind,
            name,
            model,
            dims: default_dims,
            api_key,
            endpoint: format!("{}{}", base.trim_end_matches('/'), path),
            batch_size: config.batch_size,
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .expect("reqwest client construction cannot fail with static options"),
            retry: RetryPolicy::default(),
        })
    }

    pub fn openai(config: &EmbeddingConfig) -> anyhow::Result<Self> {
        Self::new(
            RemoteKind::OpenAi,
            "openai",
            config,
            "OPENAI_API_KEY",
            "text-embedding-3-small",
            1536,
            "https://api.openai.com",
            "/v1/embeddings",
        )
    }

    pub fn voyage(config: &EmbeddingConfig) -> anyhow::Result<Self> {
        Self::new(
            RemoteKind::Voyage,
            "voyage",
            config,
            "VOYAGE_API_KEY",
            "voyage-3",
            1024,
            "https://api.voyageai.com",
            "/v1/embeddings",
        )
    }

    pub fn cohere(config: &EmbeddingConfig) -> anyhow::Result<Self> {
        Self::new(
            RemoteKind::Cohere,
            "cohere",
            config,
            "COHERE_API_KEY",
            "embed-english-v3.0",
            1024,
            "https://api.cohere.com",
            "/v1/embed",
        )
    }

    fn request_body(&self, texts: &[String]) -> serde_json::Value {
        match self.kind {
            RemoteKind::OpenAi | RemoteKind::Voyage => serde_json::json!({
                "model": self.model,
                "input": texts,
            }),
            RemoteKind::Cohere => serde_json::json!({
                "model": self.model,
                "texts": texts,
                "input_type": "search_document",
            }),
        }
    }

    fn parse_response(
        &self,
        json: &serde_json::Value,
        expected: usize,
    ) -> Result<Vec<Vec<f32>>, ProviderError> {
        let vectors = match self.kind {
            RemoteKind::OpenAi | RemoteKind::Voyage => parse_indexed_data(json)?,
            RemoteKind::Cohere => parse_embedding_rows(json)?,
        };

        if vectors.len() != expected {
            return Err(ProviderError::BadResponse(format!(
                "expected {} embeddings, got {}",
                expected,
                vectors.len()
            )));
        }
        for vector in &vectors {
            if vector.len() != self.dims {
                return Err(ProviderError::BadResponse(format!(
                    "embedding length {} does not match provider dimensions {}",
                    vector.len(),
                    self.dims
                )));
            }
        }
        Ok(vectors)
    }

    /// POST one batch with retry/backoff.
    async fn post_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        let body = self.request_body(texts);
        let mut last_err: Option<ProviderError> = None;

        for attempt in 0..self.retry.max_attempts {
            if attempt > 0 {
                let retry_after = match &last_err {
                    Some(ProviderError::Http { status: 429, message }) => parse_retry_after(message),
                    _ => None,
                };
                tokio::time::sleep(backoff_delay(&self.retry, attempt - 1, retry_after)).await;
            }

            let response = self
                .client
                .post(&self.endpoint)
                .header(reqwest::header::AUTHORIZATION, format!("Bearer {}", self.api_key))
                .json(&body)
                .send()
                .await;

            match response {
                Ok(response) => {
                    let status = response.status().as_u16();
                    if response.status().is_success() {
                        let json: serde_json::Value = response
                            .json()
                            .await
                            .map_err(|e| ProviderError::BadResponse(e.to_string()))?;
                        return self.parse_response(&json, texts.len());
                    }

                    let retry_after = response
                        .headers()
                        .get(reqwest::header::RETRY_AFTER)
                        .and_then(|v| v.to_str().ok())
                        .map(|s| s.to_string());
                    let message = response.text().await.unwrap_or_default();
                    let err = ProviderError::Http {
                        status,
                        message: match retry_after {
                            Some(after) => format!("retry-after={} {}", after, message),
                            None => message,
                        },
                    };
                    if is_retryable_status(status) {
                        last_err = Some(err);
                        continue;
                    }
                    return Err(err);
                }
                Err(e) => {
                    let message = e.to_string();
                    if is_transient_error(&message) || e.is_timeout() || e.is_connect() {
                        last_err = Some(ProviderError::Transport(message));
                        continue;
                    }
                    return Err(ProviderError::Transport(message));
                }
            }
        }

        Err(last_err
            .unwrap_or_else(|| ProviderError::Transport("embedding failed after retries".to_string())))
    }
}

#[async_trait]
impl EmbeddingProvider for RemoteProvider {
    fn name(&self) -> &str {
        self.name
    }

    fn dimensions(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        let mut all = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size.max(1)) {
            all.extend(self.post_batch(batch).await?);
        }
        Ok(all)
    }
}

/// Parse a `{data: [{index, embedding}]}` response, re-sorting by the
/// `index` field so output order matches input order.
fn parse_indexed_data(json: &serde_json::Value) -> Result<Vec<Vec<f32>>, ProviderError> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| ProviderError::BadResponse("missing data array".to_string()))?;

    let mut indexed: Vec<(usize, Vec<f32>)> = Vec::with_capacity(data.len());
    for (fallback_index, item) in data.iter().enumerate() {
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(fallback_index);
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| ProviderError::BadResponse("missing embedding field".to_string()))?;
        let vector = embedding
            .iter()
            .map(|v| {
                v.as_f64()
                    .map(|f| f as f32)
                    .ok_or_else(|| ProviderError::BadResponse("non-numeric embedding value".to_string()))
            })
            .collect::<Result<Vec<f32>, _>>()?;
        indexed.push((index, vector));
    }

    indexed.sort_by_key(|(index, _)| *index);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

/// Parse a `{embeddings: [[…]]}` response (Cohere shape).
fn parse_embedding_rows(json: &serde_json::Value) -> Result<Vec<Vec<f32>>, ProviderError> {
    let rows = json
        .get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| ProviderError::BadResponse("missing embeddings array".to_string()))?;

    rows.iter()
        .map(|row| {
            row.as_array()
                .ok_or_else(|| ProviderError::BadResponse("embedding row is not an array".to_string()))?
                .iter()
                .map(|v| {
                    v.as_f64()
                        .map(|f| f as f32)
                        .ok_or_else(|| ProviderError::BadResponse("non-numeric embedding value".to_string()))
                })
                .collect()
        })
        .collect()
}

fn parse_retry_after(message: &str) -> Option<Duration> {
    let rest = message.strip_prefix("retry-after=")?;
    let value: f64 = rest.split_whitespace().next()?.parse().ok()?;
    Some(Duration::from_secs_f64(value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_local_dimensions_and_norm() {
        let provider = LocalProvider::new();
        let vector = provider.embed_single("The quick brown fox jumps").await.unwrap();
        assert_eq!(vector.len(), LOCAL_DIMENSIONS);

        let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5, "unit norm, got {}", norm);
    }

    #[tokio::test]
    async fn test_local_deterministic() {
        let provider = LocalProvider::new();
        let a = provider.embed_single("alpha content").await.unwrap();
        let b = provider.embed_single("alpha content").await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_local_distinguishes_texts() {
        let provider = LocalProvider::new();
        let a = provider.embed_single("tokio async runtime").await.unwrap();
        let b = provider.embed_single("postgres storage engine").await.unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_local_short_tokens_dropped() {
        let provider = LocalProvider::new();
        // Tokens of length <= 2 are dropped, so these embed identically.
        let a = provider.embed_single("at of to running fast").await.unwrap();
        let b = provider.embed_single("running fast").await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_local_empty_text_zero_vector() {
        let provider = LocalProvider::new();
        let vector = provider.embed_single("").await.unwrap();
        assert_eq!(vector.len(), LOCAL_DIMENSIONS);
        assert!(vector.iter().all(|v| *v == 0.0));
    }

    #[tokio::test]
    async fn test_local_batch_preserves_order() {
        let provider = LocalProvider::new();
        let texts = vec![
            "first text".to_string(),
            "second text".to_string(),
            "third text".to_string(),
        ];
        let batch = provider.embed(&texts).await.unwrap();
        for (i, text) in texts.iter().enumerate() {
            let single = provider.embed_single(text).await.unwrap();
            assert_eq!(batch[i], single);
        }
    }

    #[test]
    fn test_parse_indexed_data_resorts() {
        let json = serde_json::json!({
            "data": [
                {"index": 1, "embedding": [0.0, 1.0]},
                {"index": 0, "embedding": [1.0, 0.0]},
            ]
        });
        let vectors = parse_indexed_data(&json).unwrap();
        assert_eq!(vectors[0], vec![1.0, 0.0]);
        assert_eq!(vectors[1], vec![0.0, 1.0]);
    }

    #[test]
    fn test_parse_embedding_rows() {
        let json = serde_json::json!({"embeddings": [[1.0, 2.0], [3.0, 4.0]]});
        let vectors = parse_embedding_rows(&json).unwrap();
        assert_eq!(vectors.len(), 2);
        assert_eq!(vectors[1], vec![3.0, 4.0]);
    }

    #[test]
    fn test_parse_bad_shapes_rejected() {
        assert!(parse_indexed_data(&serde_json::json!({"nope": []})).is_err());
        assert!(parse_embedding_rows(&serde_json::json!({"embeddings": "x"})).is_err());
    }

    #[test]
    fn test_create_provider_local() {
        let config = crate::config::Config::defaults(std::path::PathBuf::from("/tmp/x"));
        let provider = create_provider(&config.embedding).unwrap();
        assert_eq!(provider.name(), "local");
        assert_eq!(provider.dimensions(), LOCAL_DIMENSIONS);
    }
}
