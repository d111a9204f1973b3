//! Orchestration: the full ingestion pipeline plus search, listing and
//! context generation. Everything the web layer exposes goes through here.

use chrono::Utc;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use crate::config::Config;
use crate::context::{
    ChatCompletionClient, ContextCache, ContextError, ContextRecord, ExhibitFacts,
};
use crate::embedding::{EmbeddingError, EmbeddingService, InferenceClient};
use crate::exhibit::{exhibit_id, Exhibit, ExhibitStore, ExhibitStoreError};
use crate::fetch::{self, ContentFetcher, FetchError, ReplayClient};
use crate::fingerprint::{Acquired, FingerprintKey, FingerprintStore};
use crate::index::{IndexEntry, IndexError, SearchFilters, SimilarityIndex};
use crate::resolver::{CdxClient, ResolveError, SnapshotResolver};
use crate::retry::RetryPolicy;
use crate::storage::{BackendLocal, StorageManager};
use crate::vectors::{model_id, VectorStorage, VectorStorageError};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("exhibit not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Embedding(#[from] EmbeddingError),

    #[error(transparent)]
    Context(#[from] ContextError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<ExhibitStoreError> for EngineError {
    fn from(err: ExhibitStoreError) -> Self {
        EngineError::Internal(err.to_string())
    }
}

impl From<IndexError> for EngineError {
    fn from(err: IndexError) -> Self {
        EngineError::Internal(err.to_string())
    }
}

impl From<VectorStorageError> for EngineError {
    fn from(err: VectorStorageError) -> Self {
        EngineError::Internal(err.to_string())
    }
}

pub struct ArchiveOutcome {
    pub exhibit: Exhibit,
    /// False when the request resolved to an exhibit that already existed.
    pub created: bool,
}

pub struct SearchHit {
    pub exhibit: Exhibit,
    pub score: f32,
}

pub struct SearchResponse {
    pub results: Vec<SearchHit>,
    pub took_ms: u64,
}

pub struct Engine {
    config: Config,
    store: ExhibitStore,
    index: RwLock<SimilarityIndex>,
    vectors: VectorStorage,
    model_id: [u8; 32],
    fingerprints: FingerprintStore,
    embeddings: EmbeddingService,
    contexts: ContextCache,
    resolver: SnapshotResolver,
    fetcher: ContentFetcher,
}

impl Engine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Config,
        store: ExhibitStore,
        index: SimilarityIndex,
        vectors: VectorStorage,
        embeddings: EmbeddingService,
        contexts: ContextCache,
        resolver: SnapshotResolver,
        fetcher: ContentFetcher,
    ) -> Self {
        let model = config.embedding.model.clone();
        Self {
            fingerprints: FingerprintStore::new(Duration::from_secs(config.lease_ttl_secs)),
            config,
            store,
            index: RwLock::new(index),
            vectors,
            model_id: model_id(&model),
            embeddings,
            contexts,
            resolver,
            fetcher,
        }
    }

    /// Wire up the engine against the real upstream services.
    pub fn bootstrap(config: Config) -> anyhow::Result<Arc<Self>> {
        let storage: Arc<dyn StorageManager> = Arc::new(BackendLocal::new(config.base_path())?);
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.fetch.timeout_secs))
            .user_agent(&config.fetch.user_agent)
            .build()?;
        let retry = RetryPolicy::from(&config.retry);

        let cdx = Arc::new(CdxClient::new(
            http.clone(),
            &config.snapshot.cdx_endpoint,
            config.snapshot.page_size,
            retry,
        ));
        let resolver = SnapshotResolver::new(cdx, &config.snapshot.replay_endpoint);
        let fetcher = ContentFetcher::new(Arc::new(ReplayClient::new(http.clone(), retry)));

        let embeddings = EmbeddingService::new(Arc::new(InferenceClient::new(
            http.clone(),
            &config.embedding.endpoint,
            &config.embedding.model,
            std::env::var("HUGGINGFACE_API_KEY").ok(),
            config.embedding.dimensions,
            retry,
        )));

        let narrator = Arc::new(ChatCompletionClient::new(
            http,
            &config.narrative.endpoint,
            &config.narrative.model,
            std::env::var("OPENAI_API_KEY").ok(),
            retry,
        ));
        let contexts = ContextCache::new(storage.clone(), narrator)?;

        let store = ExhibitStore::load(storage)?;

        let vectors = VectorStorage::new(config.base_path().join("vectors.bin"));
        let mid = model_id(&config.embedding.model);
        let index = if vectors.exists() {
            match vectors.load(&mid, config.embedding.dimensions) {
                Ok(index) => index,
                Err(err) => {
                    log::warn!("vector file unusable ({err}), rebuilding index from exhibits");
                    SimilarityIndex::new(config.embedding.dimensions)
                }
            }
        } else {
            SimilarityIndex::new(config.embedding.dimensions)
        };

        let engine = Arc::new(Self::new(
            config, store, index, vectors, embeddings, contexts, resolver, fetcher,
        ));

        let repaired = engine.reconcile_index()?;
        if repaired > 0 {
            log::info!("reconciled {repaired} index entries on startup");
        }

        Ok(engine)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Archive a URL: resolve a snapshot, fetch and normalize it, embed it,
    /// and persist the exhibit. Concurrent requests for the same URL and
    /// date range coalesce into one ingestion; re-archiving a URL that
    /// resolves to an already-stored snapshot returns the existing exhibit.
    pub async fn archive(
        self: &Arc<Self>,
        url: &str,
        from_date: Option<&str>,
        to_date: Option<&str>,
    ) -> Result<ArchiveOutcome, EngineError> {
        let canonical = fetch::canonical_url(url);
        let key = FingerprintKey {
            canonical_url: canonical.clone(),
            from_date: from_date.map(str::to_string),
            to_date: to_date.map(str::to_string),
        };

        loop {
            match self.fingerprints.acquire(&key).await {
                Acquired::Existing(id) => {
                    if let Some(exhibit) = self.store.get(&id) {
                        return Ok(ArchiveOutcome {
                            exhibit,
                            created: false,
                        });
                    }
                    // stale mapping (exhibit was deleted), reclaim the key
                    self.fingerprints.evict(&key);
                }
                Acquired::Lease(token) => {
                    return match self.ingest(&canonical, from_date, to_date).await {
                        Ok(outcome) => {
                            self.fingerprints.commit(token, &outcome.exhibit.id);
                            Ok(outcome)
                        }
                        Err(err) => {
                            self.fingerprints.release(token);
                            Err(err)
                        }
                    };
                }
            }
        }
    }

    async fn ingest(
        self: &Arc<Self>,
        canonical_url: &str,
        from_date: Option<&str>,
        to_date: Option<&str>,
    ) -> Result<ArchiveOutcome, EngineError> {
        let candidate = self.resolver.resolve(canonical_url, from_date, to_date).await?;
        let id = exhibit_id(canonical_url, &candidate.timestamp);

        // same snapshot as an earlier ingestion: nothing to fetch
        if let Some(existing) = self.store.get(&id) {
            log::debug!("archive of {canonical_url} resolved to existing exhibit {id}");
            return Ok(ArchiveOutcome {
                exhibit: existing,
                created: false,
            });
        }

        log::debug!(
            "ingesting {canonical_url}: capture {} (status {})",
            candidate.timestamp,
            candidate.status_code
        );
        let content = self.fetcher.fetch(&candidate, canonical_url).await?;
        let input = fetch::embedding_input(&content);
        let embedding = self
            .embeddings
            .embed_document(&input, &content.content_hash)
            .await?;

        let exhibit = Exhibit {
            id,
            original_url: canonical_url.to_string(),
            archive_snapshot_url: candidate.archive_url.clone(),
            domain: content.domain,
            title: content.title,
            description: content.description,
            thumbnail_url: content.thumbnail_url,
            tags: vec![],
            snapshot_timestamp: candidate.timestamp,
            archived_at: Utc::now(),
            content_hash: content.content_hash,
            embedding,
            indexed: true,
        };

        // persistence runs on its own task so request cancellation cannot
        // leave the store and index half-committed
        let engine = self.clone();
        let stored = tokio::spawn(async move { engine.persist(exhibit) })
            .await
            .map_err(|e| EngineError::Internal(e.to_string()))??;

        Ok(ArchiveOutcome {
            exhibit: stored,
            created: true,
        })
    }

    /// Store first, index second. An index failure leaves the record with
    /// `indexed = false`; startup reconciliation repairs it later.
    fn persist(&self, exhibit: Exhibit) -> Result<Exhibit, EngineError> {
        let stored = self.store.insert(exhibit)?;

        let entry = IndexEntry {
            vector: stored.embedding.clone(),
            domain: stored.domain.clone(),
            year: stored.snapshot_year().unwrap_or(0),
            archived_at: stored.archived_at.timestamp(),
        };
        let upserted = {
            let mut index = self.index.write().expect("index lock poisoned");
            index.upsert(&stored.id, entry)
        };

        match upserted {
            Ok(()) => {
                if let Err(err) = self.save_index() {
                    log::error!("failed to persist vector index: {err}");
                }
            }
            Err(err) => {
                log::error!("index write failed for exhibit {}: {err}", stored.id);
                self.store.set_indexed(&stored.id, false)?;
            }
        }

        Ok(self.store.get(&stored.id).unwrap_or(stored))
    }

    pub async fn search(
        &self,
        query: &str,
        limit: usize,
        filters: &SearchFilters,
    ) -> Result<SearchResponse, EngineError> {
        let started = Instant::now();
        let vector = self.embeddings.embed_query(query).await?;
        let k = limit.clamp(1, self.config.search.max_results);

        let hits = {
            let index = self.index.read().expect("index lock poisoned");
            index.search(&vector, k, filters)?
        };

        let results = hits
            .into_iter()
            .filter_map(|hit| {
                self.store
                    .get(&hit.id)
                    .filter(|e| e.indexed)
                    .map(|exhibit| SearchHit {
                        exhibit,
                        score: hit.score,
                    })
            })
            .collect();

        Ok(SearchResponse {
            results,
            took_ms: started.elapsed().as_millis() as u64,
        })
    }

    /// Raw embedding for arbitrary text, bypassing search.
    pub async fn embed_text(&self, text: &str) -> Result<Vec<f32>, EngineError> {
        Ok(self.embeddings.embed_query(text).await?)
    }

    pub fn list(
        &self,
        page: usize,
        per_page: usize,
        domain: Option<&str>,
    ) -> (Vec<Exhibit>, usize) {
        let per_page = per_page.clamp(1, self.config.search.max_results);
        self.store.list(page, per_page, domain)
    }

    pub fn get(&self, id: &str) -> Result<Exhibit, EngineError> {
        self.store
            .get(id)
            .ok_or_else(|| EngineError::NotFound(id.to_string()))
    }

    pub fn delete(&self, id: &str) -> Result<(), EngineError> {
        if !self.store.delete(id)? {
            return Err(EngineError::NotFound(id.to_string()));
        }

        {
            let mut index = self.index.write().expect("index lock poisoned");
            index.remove(id);
        }
        if let Err(err) = self.save_index() {
            log::error!("failed to persist vector index after delete: {err}");
        }
        if let Err(err) = self.contexts.invalidate(id) {
            log::error!("failed to invalidate context for {id}: {err}");
        }
        self.fingerprints.evict_exhibit(id);

        Ok(())
    }

    /// Cached-or-generated narrative for an exhibit. The bool is true when
    /// the narrative came from the cache.
    pub async fn generate_context(
        &self,
        exhibit_id: &str,
    ) -> Result<(ContextRecord, bool), EngineError> {
        let exhibit = self.get(exhibit_id)?;
        let facts = ExhibitFacts {
            exhibit_id: exhibit.id.clone(),
            url: exhibit.original_url.clone(),
            title: exhibit.title.clone(),
            snapshot_timestamp: exhibit.snapshot_timestamp.clone(),
            snippet: exhibit.description.clone(),
        };
        Ok(self.contexts.get_or_generate(&facts).await?)
    }

    /// Cached narrative only; never triggers generation.
    pub fn cached_context(&self, exhibit_id: &str) -> Result<ContextRecord, EngineError> {
        self.contexts
            .cached(exhibit_id)
            .ok_or_else(|| EngineError::NotFound(exhibit_id.to_string()))
    }

    /// Bring the similarity index back in line with the exhibit store:
    /// entries for deleted exhibits are dropped, stored exhibits missing
    /// from the index (or flagged `indexed = false`) are re-inserted.
    /// Returns the number of repairs.
    pub fn reconcile_index(&self) -> Result<usize, EngineError> {
        let mut repaired = 0;
        {
            let mut index = self.index.write().expect("index lock poisoned");

            let known: Vec<String> = index.iter().map(|(id, _)| id.clone()).collect();
            for id in known {
                if !self.store.contains(&id) {
                    index.remove(&id);
                    repaired += 1;
                }
            }

            for exhibit in self.store.all() {
                if exhibit.indexed && index.contains(&exhibit.id) {
                    continue;
                }
                let entry = IndexEntry {
                    vector: exhibit.embedding.clone(),
                    domain: exhibit.domain.clone(),
                    year: exhibit.snapshot_year().unwrap_or(0),
                    archived_at: exhibit.archived_at.timestamp(),
                };
                match index.upsert(&exhibit.id, entry) {
                    Ok(()) => {
                        self.store.set_indexed(&exhibit.id, true)?;
                        repaired += 1;
                    }
                    Err(err) => {
                        log::warn!("cannot reindex exhibit {}: {err}", exhibit.id);
                    }
                }
            }
        }

        if repaired > 0 {
            self.save_index()?;
        }
        Ok(repaired)
    }

    pub fn save_index(&self) -> Result<(), EngineError> {
        let index = self.index.read().expect("index lock poisoned");
        self.vectors.save(&index, &self.model_id)?;
        Ok(())
    }

    pub fn exhibit_count(&self) -> usize {
        self.store.len()
    }

    pub fn indexed_count(&self) -> usize {
        self.index.read().expect("index lock poisoned").len()
    }
}
