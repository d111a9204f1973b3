//! Shared fakes for the integration tests: a snapshot index that echoes
//! requests, a canned page server, a deterministic token-bucket embedder
//! and a stub narrator.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use crate::config::Config;
use crate::context::{ContextCache, ContextError, ContextRecord, ExhibitFacts, NarrativeProvider};
use crate::embedding::{EmbeddingError, EmbeddingProvider, EmbeddingService};
use crate::engine::Engine;
use crate::exhibit::ExhibitStore;
use crate::fetch::{ContentFetch, ContentFetcher, FetchError, FetchedDocument};
use crate::index::SimilarityIndex;
use crate::resolver::{Capture, ResolveError, SnapshotIndex, SnapshotResolver};
use crate::storage::BackendLocal;
use crate::vectors::VectorStorage;

pub const DIMS: usize = 16;

pub fn test_config() -> Config {
    let mut config = Config::default();
    config.embedding.dimensions = DIMS;
    config
}

pub fn page(title: &str, body: &str) -> String {
    format!("<html><head><title>{title}</title></head><body>{body}</body></html>")
}

/// Snapshot index that answers every URL with a single 200 capture. The
/// capture timestamp can be overridden per URL.
pub struct EchoIndex {
    timestamps: HashMap<String, String>,
    pub calls: AtomicUsize,
}

impl EchoIndex {
    pub fn new() -> Self {
        Self {
            timestamps: HashMap::new(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_timestamp(mut self, url: &str, timestamp: &str) -> Self {
        self.timestamps.insert(url.to_string(), timestamp.to_string());
        self
    }
}

#[async_trait]
impl SnapshotIndex for EchoIndex {
    async fn captures(
        &self,
        url: &str,
        _from_date: Option<&str>,
        _to_date: Option<&str>,
    ) -> Result<Vec<Capture>, ResolveError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let timestamp = self
            .timestamps
            .get(url)
            .cloned()
            .unwrap_or_else(|| "20010101000000".to_string());
        Ok(vec![Capture {
            timestamp,
            original: url.to_string(),
            status_code: Some(200),
        }])
    }
}

/// Snapshot index with a fixed capture list, for selection-policy tests.
pub struct FixedIndex {
    pub captures: Vec<Capture>,
    pub calls: AtomicUsize,
}

impl FixedIndex {
    pub fn new(captures: Vec<Capture>) -> Self {
        Self {
            captures,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl SnapshotIndex for FixedIndex {
    async fn captures(
        &self,
        _url: &str,
        _from_date: Option<&str>,
        _to_date: Option<&str>,
    ) -> Result<Vec<Capture>, ResolveError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.captures.clone())
    }
}

/// Serves canned HTML keyed by a substring of the replay URL.
pub struct PageServer {
    pages: Vec<(String, String)>,
    default_html: String,
    content_type: String,
    pub delay: Duration,
    pub calls: AtomicUsize,
}

impl PageServer {
    pub fn new(default_html: &str) -> Self {
        Self {
            pages: Vec::new(),
            default_html: default_html.to_string(),
            content_type: "text/html; charset=utf-8".to_string(),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_page(mut self, url_fragment: &str, html: &str) -> Self {
        self.pages.push((url_fragment.to_string(), html.to_string()));
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_content_type(mut self, content_type: &str) -> Self {
        self.content_type = content_type.to_string();
        self
    }
}

#[async_trait]
impl ContentFetch for PageServer {
    async fn fetch_raw(
        &self,
        candidate: &crate::resolver::SnapshotCandidate,
    ) -> Result<FetchedDocument, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let html = self
            .pages
            .iter()
            .find(|(fragment, _)| candidate.archive_url.contains(fragment))
            .map(|(_, html)| html.clone())
            .unwrap_or_else(|| self.default_html.clone());
        Ok(FetchedDocument {
            content_type: Some(self.content_type.clone()),
            body: html.into_bytes(),
        })
    }
}

/// Deterministic embedder: each lowercase token is hashed into one of the
/// vector's buckets, so texts sharing words land closer in cosine space.
pub struct TokenEmbedder {
    pub calls: AtomicUsize,
}

impl TokenEmbedder {
    pub fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
        }
    }
}

pub fn token_vector(text: &str) -> Vec<f32> {
    let mut vector = vec![0.0f32; DIMS];
    for token in text.to_lowercase().split_whitespace() {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        token.hash(&mut hasher);
        vector[(hasher.finish() as usize) % DIMS] += 1.0;
    }
    // never return a zero vector, the index rejects those
    if vector.iter().all(|v| *v == 0.0) {
        vector[0] = 1.0;
    }
    vector
}

#[async_trait]
impl EmbeddingProvider for TokenEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(token_vector(text))
    }

    fn model_name(&self) -> &str {
        "token-bucket-test"
    }

    fn dimensions(&self) -> usize {
        DIMS
    }
}

pub struct StubNarrator {
    pub calls: AtomicUsize,
}

impl StubNarrator {
    pub fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl NarrativeProvider for StubNarrator {
    async fn generate(&self, facts: &ExhibitFacts) -> Result<ContextRecord, ContextError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(ContextRecord {
            exhibit_id: facts.exhibit_id.clone(),
            narrative: format!("{} captured at {}", facts.title, facts.snapshot_timestamp),
            era: "dot-com".to_string(),
            significance: "test exhibit".to_string(),
            related_topics: vec![],
            generated_at: Utc::now(),
        })
    }
}

pub struct Harness {
    pub engine: Arc<Engine>,
    pub snapshots: Arc<EchoIndex>,
    pub pages: Arc<PageServer>,
    pub embedder: Arc<TokenEmbedder>,
    pub narrator: Arc<StubNarrator>,
    pub dir: tempfile::TempDir,
}

pub fn build_engine_in(
    dir: &Path,
    config: Config,
    snapshots: Arc<dyn SnapshotIndex>,
    pages: Arc<dyn ContentFetch>,
    embedder: Arc<dyn EmbeddingProvider>,
    narrator: Arc<dyn NarrativeProvider>,
    index: SimilarityIndex,
) -> Arc<Engine> {
    let storage = Arc::new(BackendLocal::new(dir).unwrap());
    let store = ExhibitStore::load(storage.clone()).unwrap();
    let vectors = VectorStorage::new(dir.join("vectors.bin"));
    let embeddings = EmbeddingService::new(embedder);
    let contexts = ContextCache::new(storage, narrator).unwrap();
    let resolver = SnapshotResolver::new(snapshots, "https://web.archive.org/web");
    let fetcher = ContentFetcher::new(pages);

    Arc::new(Engine::new(
        config, store, index, vectors, embeddings, contexts, resolver, fetcher,
    ))
}

pub fn harness_with(snapshots: EchoIndex, pages: PageServer) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let snapshots = Arc::new(snapshots);
    let pages = Arc::new(pages);
    let embedder = Arc::new(TokenEmbedder::new());
    let narrator = Arc::new(StubNarrator::new());

    let engine = build_engine_in(
        dir.path(),
        test_config(),
        snapshots.clone(),
        pages.clone(),
        embedder.clone(),
        narrator.clone(),
        SimilarityIndex::new(DIMS),
    );

    Harness {
        engine,
        snapshots,
        pages,
        embedder,
        narrator,
        dir,
    }
}

pub fn harness() -> Harness {
    harness_with(EchoIndex::new(), PageServer::new(&page("Default", "default body")))
}
