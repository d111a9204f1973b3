use crate::storage::{BackendLocal, StorageManager};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8080";
const DEFAULT_CDX_ENDPOINT: &str = "https://web.archive.org/cdx/search/cdx";
const DEFAULT_REPLAY_ENDPOINT: &str = "https://web.archive.org/web";
const DEFAULT_EMBEDDING_ENDPOINT: &str =
    "https://api-inference.huggingface.co/pipeline/feature-extraction";
const DEFAULT_EMBEDDING_MODEL: &str = "BAAI/bge-small-en-v1.5";
const DEFAULT_EMBEDDING_DIMENSIONS: usize = 384;
const DEFAULT_NARRATIVE_ENDPOINT: &str = "https://api.openai.com/v1";
const DEFAULT_NARRATIVE_MODEL: &str = "gpt-4o-mini";
const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 15;
const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64; rv:124.0) Gecko/20100101 Firefox/124.0";
const DEFAULT_RETRY_MAX_ATTEMPTS: u32 = 4;
const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 250;
const DEFAULT_RETRY_MAX_DELAY_MS: u64 = 8_000;
const DEFAULT_LEASE_TTL_SECS: u64 = 120;
const DEFAULT_MAX_RESULTS: usize = 50;
const DEFAULT_CDX_PAGE_SIZE: usize = 500;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Admin token required for destructive endpoints (delete, invalidate).
    /// Unset means those endpoints are rejected outright.
    #[serde(default)]
    pub admin_token: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
            admin_token: None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SnapshotConfig {
    #[serde(default = "default_cdx_endpoint")]
    pub cdx_endpoint: String,

    #[serde(default = "default_replay_endpoint")]
    pub replay_endpoint: String,

    /// Captures fetched per CDX page when paginating.
    #[serde(default = "default_cdx_page_size")]
    pub page_size: usize,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            cdx_endpoint: DEFAULT_CDX_ENDPOINT.to_string(),
            replay_endpoint: DEFAULT_REPLAY_ENDPOINT.to_string(),
            page_size: DEFAULT_CDX_PAGE_SIZE,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FetchConfig {
    #[serde(default = "default_fetch_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_FETCH_TIMEOUT_SECS,
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_endpoint")]
    pub endpoint: String,

    #[serde(default = "default_embedding_model")]
    pub model: String,

    /// All stored vectors must have this length. Changing the model to one
    /// with different output dimensions requires an index migration.
    #[serde(default = "default_embedding_dimensions")]
    pub dimensions: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_EMBEDDING_ENDPOINT.to_string(),
            model: DEFAULT_EMBEDDING_MODEL.to_string(),
            dimensions: DEFAULT_EMBEDDING_DIMENSIONS,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NarrativeConfig {
    #[serde(default = "default_narrative_endpoint")]
    pub endpoint: String,

    #[serde(default = "default_narrative_model")]
    pub model: String,
}

impl Default for NarrativeConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_NARRATIVE_ENDPOINT.to_string(),
            model: DEFAULT_NARRATIVE_MODEL.to_string(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_retry_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_retry_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_retry_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_RETRY_MAX_ATTEMPTS,
            base_delay_ms: DEFAULT_RETRY_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_RETRY_MAX_DELAY_MS,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Hard cap on `limit`/`per_page`; larger requests are clamped, not rejected.
    #[serde(default = "default_max_results")]
    pub max_results: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            max_results: DEFAULT_MAX_RESULTS,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub snapshot: SnapshotConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub narrative: NarrativeConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default = "default_lease_ttl_secs")]
    pub lease_ttl_secs: u64,
    #[serde(default)]
    pub search: SearchConfig,

    #[serde(skip_serializing, skip_deserializing)]
    base_path: PathBuf,
}

// hand-written so `lease_ttl_secs` gets its real default; a derive would
// zero it, which `validate()` rejects
impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            snapshot: SnapshotConfig::default(),
            fetch: FetchConfig::default(),
            embedding: EmbeddingConfig::default(),
            narrative: NarrativeConfig::default(),
            retry: RetryConfig::default(),
            lease_ttl_secs: DEFAULT_LEASE_TTL_SECS,
            search: SearchConfig::default(),
            base_path: PathBuf::new(),
        }
    }
}

fn default_bind_addr() -> String {
    DEFAULT_BIND_ADDR.to_string()
}
fn default_cdx_endpoint() -> String {
    DEFAULT_CDX_ENDPOINT.to_string()
}
fn default_replay_endpoint() -> String {
    DEFAULT_REPLAY_ENDPOINT.to_string()
}
fn default_cdx_page_size() -> usize {
    DEFAULT_CDX_PAGE_SIZE
}
fn default_fetch_timeout_secs() -> u64 {
    DEFAULT_FETCH_TIMEOUT_SECS
}
fn default_user_agent() -> String {
    DEFAULT_USER_AGENT.to_string()
}
fn default_embedding_endpoint() -> String {
    DEFAULT_EMBEDDING_ENDPOINT.to_string()
}
fn default_embedding_model() -> String {
    DEFAULT_EMBEDDING_MODEL.to_string()
}
fn default_embedding_dimensions() -> usize {
    DEFAULT_EMBEDDING_DIMENSIONS
}
fn default_narrative_endpoint() -> String {
    DEFAULT_NARRATIVE_ENDPOINT.to_string()
}
fn default_narrative_model() -> String {
    DEFAULT_NARRATIVE_MODEL.to_string()
}
fn default_retry_max_attempts() -> u32 {
    DEFAULT_RETRY_MAX_ATTEMPTS
}
fn default_retry_base_delay_ms() -> u64 {
    DEFAULT_RETRY_BASE_DELAY_MS
}
fn default_retry_max_delay_ms() -> u64 {
    DEFAULT_RETRY_MAX_DELAY_MS
}
fn default_lease_ttl_secs() -> u64 {
    DEFAULT_LEASE_TTL_SECS
}
fn default_max_results() -> usize {
    DEFAULT_MAX_RESULTS
}

impl Config {
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.retry.max_attempts == 0 {
            anyhow::bail!("retry.max_attempts must be greater than 0");
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            anyhow::bail!(
                "retry.base_delay_ms ({}) must not exceed retry.max_delay_ms ({})",
                self.retry.base_delay_ms,
                self.retry.max_delay_ms
            );
        }
        if self.embedding.dimensions == 0 {
            anyhow::bail!("embedding.dimensions must be greater than 0");
        }
        if self.search.max_results == 0 {
            anyhow::bail!("search.max_results must be greater than 0");
        }
        if self.lease_ttl_secs == 0 {
            anyhow::bail!("lease_ttl_secs must be greater than 0");
        }
        if self.snapshot.page_size == 0 {
            anyhow::bail!("snapshot.page_size must be greater than 0");
        }
        Ok(())
    }

    pub fn load_with(base_path: &Path) -> anyhow::Result<Self> {
        let store = BackendLocal::new(base_path)?;

        // create new if does not exist
        if !store.exists("config.yaml") {
            store.write(
                "config.yaml",
                serde_yml::to_string(&Self::default())?.as_bytes(),
            )?;
        }

        let config_str = String::from_utf8(store.read("config.yaml")?)
            .map_err(|_| anyhow::anyhow!("config file is not valid utf8"))?;
        let mut config: Self = serde_yml::from_str(&config_str)
            .map_err(|e| anyhow::anyhow!("config is malformed: {e}"))?;

        config.base_path = base_path.to_path_buf();
        config.validate()?;

        // resave in case config version needs an upgrade
        if config_str != serde_yml::to_string(&config)? {
            config.save()?;
        }

        Ok(config)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let store = BackendLocal::new(&self.base_path)?;
        store.write("config.yaml", serde_yml::to_string(self)?.as_bytes())?;
        Ok(())
    }
}
