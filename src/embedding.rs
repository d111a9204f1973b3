//! Embedding generation with a content-hash-keyed cache.
//!
//! Document embeddings are memoized by the content hash of the normalized
//! page text, so re-archiving unchanged content never re-invokes the
//! provider. Cache fills are coalesced per key; query embeddings are
//! generated fresh (a free-text query has no stable hash key).

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::retry::RetryPolicy;
use crate::singleflight::KeyedLocks;

#[derive(Debug, thiserror::Error)]
pub enum EmbeddingError {
    #[error("embedding provider unavailable: {0}")]
    Unavailable(String),

    #[error("embedding dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },
}

impl EmbeddingError {
    pub fn is_transient(&self) -> bool {
        matches!(self, EmbeddingError::Unavailable(_))
    }
}

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;
    fn model_name(&self) -> &str;
    fn dimensions(&self) -> usize;
}

/// Remote inference client (HuggingFace feature-extraction style API).
pub struct InferenceClient {
    http: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
    dimensions: usize,
    retry: RetryPolicy,
}

impl InferenceClient {
    pub fn new(
        http: reqwest::Client,
        endpoint: &str,
        model: &str,
        api_key: Option<String>,
        dimensions: usize,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            http,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            model: model.to_string(),
            api_key,
            dimensions,
            retry,
        }
    }

    async fn embed_once(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let url = format!("{}/{}", self.endpoint, self.model);
        let mut req = self.http.post(&url).json(&serde_json::json!({
            "inputs": [text],
            "options": { "wait_for_model": true },
        }));
        if let Some(ref key) = self.api_key {
            req = req.bearer_auth(key);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| EmbeddingError::Unavailable(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(EmbeddingError::Unavailable(format!(
                "provider returned {status}"
            )));
        }

        let value: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| EmbeddingError::Unavailable(e.to_string()))?;

        parse_vector(&value)
            .ok_or_else(|| EmbeddingError::Unavailable("malformed provider response".into()))
    }
}

/// The API returns `[[f32; D]]` for list inputs and `[f32; D]` for plain
/// text; accept both.
fn parse_vector(value: &serde_json::Value) -> Option<Vec<f32>> {
    let arr = value.as_array()?;
    let inner = match arr.first() {
        Some(serde_json::Value::Array(inner)) => inner,
        Some(serde_json::Value::Number(_)) => arr,
        _ => return None,
    };
    inner
        .iter()
        .map(|v| v.as_f64().map(|f| f as f32))
        .collect()
}

#[async_trait]
impl EmbeddingProvider for InferenceClient {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        self.retry
            .run("embedding", EmbeddingError::is_transient, || {
                self.embed_once(text)
            })
            .await
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

/// Caching front for the embedding provider.
pub struct EmbeddingService {
    provider: Arc<dyn EmbeddingProvider>,
    cache: Mutex<HashMap<String, Arc<Vec<f32>>>>,
    locks: KeyedLocks<String>,
}

impl EmbeddingService {
    pub fn new(provider: Arc<dyn EmbeddingProvider>) -> Self {
        Self {
            provider,
            cache: Mutex::new(HashMap::new()),
            locks: KeyedLocks::new(),
        }
    }

    pub fn model_name(&self) -> &str {
        self.provider.model_name()
    }

    pub fn dimensions(&self) -> usize {
        self.provider.dimensions()
    }

    /// Embed exhibit text, memoized by content hash. Concurrent misses on
    /// the same hash produce exactly one provider call; other hashes are
    /// unaffected.
    pub async fn embed_document(
        &self,
        text: &str,
        content_hash: &str,
    ) -> Result<Vec<f32>, EmbeddingError> {
        if let Some(cached) = self.lookup(content_hash) {
            return Ok(cached.as_ref().clone());
        }

        let key_lock = self.locks.for_key(&content_hash.to_string());
        let _guard = key_lock.lock().await;

        // a concurrent caller may have filled the cache while we waited
        if let Some(cached) = self.lookup(content_hash) {
            return Ok(cached.as_ref().clone());
        }

        let vector = self.generate(text).await?;
        self.cache
            .lock()
            .expect("embedding cache poisoned")
            .insert(content_hash.to_string(), Arc::new(vector.clone()));
        Ok(vector)
    }

    /// Embed a free-text search query; not cached.
    pub async fn embed_query(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        self.generate(text).await
    }

    pub fn is_cached(&self, content_hash: &str) -> bool {
        self.lookup(content_hash).is_some()
    }

    fn lookup(&self, content_hash: &str) -> Option<Arc<Vec<f32>>> {
        self.cache
            .lock()
            .expect("embedding cache poisoned")
            .get(content_hash)
            .cloned()
    }

    async fn generate(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let vector = self.provider.embed(text).await?;
        let expected = self.provider.dimensions();
        if vector.len() != expected {
            return Err(EmbeddingError::DimensionMismatch {
                expected,
                got: vector.len(),
            });
        }
        Ok(vector)
    }
}
