//! Context narratives: generated historical commentary per exhibit.
//!
//! Narratives are expensive to produce, so they are cached to disk
//! (contexts.json) and generation is coalesced per exhibit id. The cache
//! survives restarts; deleting an exhibit invalidates its entry.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::retry::RetryPolicy;
use crate::singleflight::KeyedLocks;
use crate::storage::StorageManager;

const CONTEXTS_FILE: &str = "contexts.json";

#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error("narrative generation failed: {0}")]
    GenerationFailed(String),

    #[error("no context for exhibit {0}")]
    NotFound(String),

    #[error("context store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("context store is corrupt: {0}")]
    Corrupt(String),
}

impl ContextError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ContextError::GenerationFailed(_))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContextRecord {
    pub exhibit_id: String,
    pub narrative: String,
    pub era: String,
    pub significance: String,
    #[serde(default)]
    pub related_topics: Vec<String>,
    pub generated_at: DateTime<Utc>,
}

/// The facts handed to the provider; everything else about the exhibit is
/// deliberately withheld.
#[derive(Debug, Clone)]
pub struct ExhibitFacts {
    pub exhibit_id: String,
    pub url: String,
    pub title: String,
    pub snapshot_timestamp: String,
    pub snippet: Option<String>,
}

#[async_trait]
pub trait NarrativeProvider: Send + Sync {
    async fn generate(&self, facts: &ExhibitFacts) -> Result<ContextRecord, ContextError>;
}

/// Chat-completions client (OpenAI style API).
pub struct ChatCompletionClient {
    http: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
    retry: RetryPolicy,
}

/// Shape the model is asked to reply with.
#[derive(Deserialize)]
struct NarrativePayload {
    narrative: String,
    era: String,
    significance: String,
    #[serde(default)]
    related_topics: Vec<String>,
}

impl ChatCompletionClient {
    pub fn new(
        http: reqwest::Client,
        endpoint: &str,
        model: &str,
        api_key: Option<String>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            http,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            model: model.to_string(),
            api_key,
            retry,
        }
    }

    fn prompt(facts: &ExhibitFacts) -> String {
        let mut prompt = format!(
            "You are a web historian. A page titled \"{}\" at {} was captured \
             by a web archive at timestamp {}.",
            facts.title, facts.url, facts.snapshot_timestamp
        );
        if let Some(ref snippet) = facts.snippet {
            prompt.push_str(&format!(" An excerpt of its content: \"{snippet}\"."));
        }
        prompt.push_str(
            " Reply with a JSON object with keys \"narrative\" (2-3 sentences of \
             historical context for this page), \"era\" (a short label for the web \
             era it belongs to), \"significance\" (one sentence), and \
             \"related_topics\" (up to 5 short strings). Reply with JSON only.",
        );
        prompt
    }

    async fn generate_once(&self, facts: &ExhibitFacts) -> Result<ContextRecord, ContextError> {
        let url = format!("{}/chat/completions", self.endpoint);
        let mut req = self.http.post(&url).json(&serde_json::json!({
            "model": self.model,
            "messages": [{ "role": "user", "content": Self::prompt(facts) }],
            "response_format": { "type": "json_object" },
        }));
        if let Some(ref key) = self.api_key {
            req = req.bearer_auth(key);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| ContextError::GenerationFailed(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(ContextError::GenerationFailed(format!(
                "provider returned {status}"
            )));
        }

        let value: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| ContextError::GenerationFailed(e.to_string()))?;

        let content = value
            .pointer("/choices/0/message/content")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ContextError::GenerationFailed("empty completion".to_string()))?;

        let payload: NarrativePayload = serde_json::from_str(content)
            .map_err(|e| ContextError::GenerationFailed(format!("malformed completion: {e}")))?;

        Ok(ContextRecord {
            exhibit_id: facts.exhibit_id.clone(),
            narrative: payload.narrative,
            era: payload.era,
            significance: payload.significance,
            related_topics: payload.related_topics,
            generated_at: Utc::now(),
        })
    }
}

#[async_trait]
impl NarrativeProvider for ChatCompletionClient {
    async fn generate(&self, facts: &ExhibitFacts) -> Result<ContextRecord, ContextError> {
        self.retry
            .run("narrative", ContextError::is_transient, || {
                self.generate_once(facts)
            })
            .await
    }
}

/// Disk-backed narrative cache with per-exhibit generation coalescing.
pub struct ContextCache {
    storage: Arc<dyn StorageManager>,
    provider: Arc<dyn NarrativeProvider>,
    records: RwLock<HashMap<String, ContextRecord>>,
    locks: KeyedLocks<String>,
}

impl ContextCache {
    pub fn new(
        storage: Arc<dyn StorageManager>,
        provider: Arc<dyn NarrativeProvider>,
    ) -> Result<Self, ContextError> {
        let records = if storage.exists(CONTEXTS_FILE) {
            let bytes = storage.read(CONTEXTS_FILE)?;
            let list: Vec<ContextRecord> = serde_json::from_slice(&bytes)
                .map_err(|e| ContextError::Corrupt(e.to_string()))?;
            list.into_iter().map(|r| (r.exhibit_id.clone(), r)).collect()
        } else {
            HashMap::new()
        };

        Ok(Self {
            storage,
            provider,
            records: RwLock::new(records),
            locks: KeyedLocks::new(),
        })
    }

    pub fn len(&self) -> usize {
        self.records.read().expect("context lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cached record, if any. Never triggers generation.
    pub fn cached(&self, exhibit_id: &str) -> Option<ContextRecord> {
        self.records
            .read()
            .expect("context lock poisoned")
            .get(exhibit_id)
            .cloned()
    }

    /// Return the cached narrative or generate one. The bool is true when
    /// the record came from the cache. Concurrent misses for the same
    /// exhibit produce a single provider call.
    pub async fn get_or_generate(
        &self,
        facts: &ExhibitFacts,
    ) -> Result<(ContextRecord, bool), ContextError> {
        if let Some(record) = self.cached(&facts.exhibit_id) {
            return Ok((record, true));
        }

        let key_lock = self.locks.for_key(&facts.exhibit_id);
        let _guard = key_lock.lock().await;

        // re-check: another caller may have generated while we waited
        if let Some(record) = self.cached(&facts.exhibit_id) {
            return Ok((record, true));
        }

        let record = self.provider.generate(facts).await?;
        {
            let mut records = self.records.write().expect("context lock poisoned");
            records.insert(facts.exhibit_id.clone(), record.clone());
        }
        if let Err(err) = self.persist() {
            log::error!("failed to persist context cache: {err}");
        }

        Ok((record, false))
    }

    /// Drop the record for a deleted exhibit, if present.
    pub fn invalidate(&self, exhibit_id: &str) -> Result<(), ContextError> {
        let removed = self
            .records
            .write()
            .expect("context lock poisoned")
            .remove(exhibit_id)
            .is_some();
        if removed {
            self.persist()?;
        }
        Ok(())
    }

    fn persist(&self) -> Result<(), ContextError> {
        let records = self.records.read().expect("context lock poisoned");
        let mut list: Vec<&ContextRecord> = records.values().collect();
        list.sort_by(|a, b| a.exhibit_id.cmp(&b.exhibit_id));
        let bytes = serde_json::to_vec_pretty(&list)
            .map_err(|e| ContextError::Corrupt(e.to_string()))?;
        self.storage.write(CONTEXTS_FILE, &bytes)?;
        Ok(())
    }
}
