//! Exhibit records and their durable store.
//!
//! An exhibit is one archived page: metadata plus the embedding derived
//! from its normalized content. Records are immutable after creation
//! (except the `indexed` repair flag) and persisted as a single JSON file
//! through the atomic storage backend.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::storage::StorageManager;

const EXHIBITS_FILE: &str = "exhibits.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Exhibit {
    pub id: String,

    pub original_url: String,
    pub archive_snapshot_url: String,
    pub domain: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail_url: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,

    /// Capture time of the archived snapshot, 14-digit YYYYMMDDHHMMSS.
    pub snapshot_timestamp: String,
    /// When this system ingested the page (distinct from the capture time).
    pub archived_at: DateTime<Utc>,

    pub content_hash: String,
    pub embedding: Vec<f32>,

    /// False only when the similarity-index write failed after the record
    /// was stored; such records are hidden from search until reconciled.
    #[serde(default = "default_indexed")]
    pub indexed: bool,
}

fn default_indexed() -> bool {
    true
}

impl Exhibit {
    /// Year of the capture, used by search year filters.
    pub fn snapshot_year(&self) -> Option<u16> {
        self.snapshot_timestamp.get(0..4)?.parse().ok()
    }
}

/// Derive the stable exhibit id from the original URL and the resolved
/// capture timestamp. Re-archiving the same snapshot always lands on the
/// same id, which is what makes ingestion idempotent.
pub fn exhibit_id(original_url: &str, snapshot_timestamp: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(original_url.as_bytes());
    hasher.update(b":");
    hasher.update(snapshot_timestamp.as_bytes());
    let digest = hasher.finalize();
    digest[..8].iter().map(|b| format!("{b:02x}")).collect()
}

#[derive(Debug, thiserror::Error)]
pub enum ExhibitStoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt exhibit store: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// Durable exhibit store: in-memory map, rewritten to exhibits.json on
/// every mutation through the atomic storage backend.
pub struct ExhibitStore {
    storage: Arc<dyn StorageManager>,
    exhibits: RwLock<HashMap<String, Exhibit>>,
}

impl ExhibitStore {
    pub fn load(storage: Arc<dyn StorageManager>) -> Result<Self, ExhibitStoreError> {
        let exhibits = if storage.exists(EXHIBITS_FILE) {
            let bytes = storage.read(EXHIBITS_FILE)?;
            let records: Vec<Exhibit> = serde_json::from_slice(&bytes)?;
            records.into_iter().map(|e| (e.id.clone(), e)).collect()
        } else {
            HashMap::new()
        };

        Ok(Self {
            storage,
            exhibits: RwLock::new(exhibits),
        })
    }

    pub fn len(&self) -> usize {
        self.exhibits.read().expect("exhibit store lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, id: &str) -> Option<Exhibit> {
        self.exhibits
            .read()
            .expect("exhibit store lock poisoned")
            .get(id)
            .cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.exhibits
            .read()
            .expect("exhibit store lock poisoned")
            .contains_key(id)
    }

    /// Insert a new exhibit. Inserting an id that already exists is a no-op
    /// returning the stored record (ids are immutable once assigned).
    pub fn insert(&self, exhibit: Exhibit) -> Result<Exhibit, ExhibitStoreError> {
        {
            let mut map = self.exhibits.write().expect("exhibit store lock poisoned");
            if let Some(existing) = map.get(&exhibit.id) {
                return Ok(existing.clone());
            }
            map.insert(exhibit.id.clone(), exhibit.clone());
        }
        self.persist()?;
        Ok(exhibit)
    }

    /// List exhibits, newest ingestion first, optionally filtered by
    /// normalized domain. `page` is 1-based; `total` counts all matches.
    pub fn list(
        &self,
        page: usize,
        per_page: usize,
        domain: Option<&str>,
    ) -> (Vec<Exhibit>, usize) {
        // stored domains are lowercase with www. stripped; normalize the
        // filter the same way so it matches however the caller typed it
        let domain = domain.map(|d| {
            let d = d.to_ascii_lowercase();
            d.strip_prefix("www.").unwrap_or(&d).to_string()
        });

        let map = self.exhibits.read().expect("exhibit store lock poisoned");
        let mut matches: Vec<&Exhibit> = map
            .values()
            .filter(|e| domain.as_deref().map(|d| e.domain == d).unwrap_or(true))
            .collect();

        matches.sort_by(|a, b| {
            b.archived_at
                .cmp(&a.archived_at)
                .then_with(|| a.id.cmp(&b.id))
        });

        let total = matches.len();
        let page = page.max(1);
        let start = (page - 1).saturating_mul(per_page);
        let items = matches
            .into_iter()
            .skip(start)
            .take(per_page)
            .cloned()
            .collect();

        (items, total)
    }

    pub fn delete(&self, id: &str) -> Result<bool, ExhibitStoreError> {
        let removed = self
            .exhibits
            .write()
            .expect("exhibit store lock poisoned")
            .remove(id)
            .is_some();
        if removed {
            self.persist()?;
        }
        Ok(removed)
    }

    pub fn set_indexed(&self, id: &str, indexed: bool) -> Result<(), ExhibitStoreError> {
        {
            let mut map = self.exhibits.write().expect("exhibit store lock poisoned");
            match map.get_mut(id) {
                Some(exhibit) => exhibit.indexed = indexed,
                None => return Ok(()),
            }
        }
        self.persist()
    }

    /// Snapshot of every stored exhibit, for startup index reconciliation.
    pub fn all(&self) -> Vec<Exhibit> {
        self.exhibits
            .read()
            .expect("exhibit store lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    fn persist(&self) -> Result<(), ExhibitStoreError> {
        let records: Vec<Exhibit> = {
            let map = self.exhibits.read().expect("exhibit store lock poisoned");
            let mut records: Vec<Exhibit> = map.values().cloned().collect();
            records.sort_by(|a, b| a.id.cmp(&b.id));
            records
        };
        let bytes = serde_json::to_vec_pretty(&records)?;
        self.storage.write(EXHIBITS_FILE, &bytes)?;
        Ok(())
    }
}
