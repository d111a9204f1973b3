//! In-memory cosine similarity index over exhibit embeddings.

use std::collections::HashMap;

#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("vector dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("vector has zero norm")]
    ZeroNormVector,
}

#[derive(Debug, Clone)]
pub struct IndexEntry {
    pub vector: Vec<f32>,
    pub domain: String,
    pub year: u16,
    pub archived_at: i64,
}

#[derive(Debug, Clone, Default)]
pub struct SearchFilters {
    pub domain: Option<String>,
    pub year_from: Option<u16>,
    pub year_to: Option<u16>,
}

impl SearchFilters {
    fn matches(&self, entry: &IndexEntry) -> bool {
        if let Some(ref domain) = self.domain {
            let want = domain.to_ascii_lowercase();
            let want = want.strip_prefix("www.").unwrap_or(&want);
            if !entry.domain.eq_ignore_ascii_case(want) {
                return false;
            }
        }
        if let Some(from) = self.year_from {
            if entry.year < from {
                return false;
            }
        }
        if let Some(to) = self.year_to {
            if entry.year > to {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Hit {
    pub id: String,
    pub score: f32,
}

pub struct SimilarityIndex {
    entries: HashMap<String, IndexEntry>,
    dimensions: usize,
}

fn norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

fn cosine(a: &[f32], a_norm: f32, b: &[f32], b_norm: f32) -> f32 {
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    dot / (a_norm * b_norm)
}

impl SimilarityIndex {
    pub fn new(dimensions: usize) -> Self {
        Self {
            entries: HashMap::new(),
            dimensions,
        }
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &IndexEntry)> {
        self.entries.iter()
    }

    /// Insert or fully replace the entry for `id`.
    pub fn upsert(&mut self, id: &str, entry: IndexEntry) -> Result<(), IndexError> {
        if entry.vector.len() != self.dimensions {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimensions,
                got: entry.vector.len(),
            });
        }
        if norm(&entry.vector) == 0.0 {
            return Err(IndexError::ZeroNormVector);
        }
        self.entries.insert(id.to_string(), entry);
        Ok(())
    }

    pub fn remove(&mut self, id: &str) -> bool {
        self.entries.remove(id).is_some()
    }

    /// Top-k entries by cosine similarity to `query`, after filters.
    ///
    /// Ordering is total: score descending, then newest `archived_at`,
    /// then id ascending, so equal corpora always rank identically.
    pub fn search(
        &self,
        query: &[f32],
        k: usize,
        filters: &SearchFilters,
    ) -> Result<Vec<Hit>, IndexError> {
        if query.len() != self.dimensions {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimensions,
                got: query.len(),
            });
        }
        let query_norm = norm(query);
        if query_norm == 0.0 {
            return Err(IndexError::ZeroNormVector);
        }

        let mut scored: Vec<(&String, &IndexEntry, f32)> = self
            .entries
            .iter()
            .filter(|(_, entry)| filters.matches(entry))
            .map(|(id, entry)| {
                let entry_norm = norm(&entry.vector);
                (id, entry, cosine(query, query_norm, &entry.vector, entry_norm))
            })
            .collect();

        scored.sort_by(|a, b| {
            b.2.partial_cmp(&a.2)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.1.archived_at.cmp(&a.1.archived_at))
                .then_with(|| a.0.cmp(b.0))
        });
        scored.truncate(k);

        Ok(scored
            .into_iter()
            .map(|(id, _, score)| Hit {
                id: id.clone(),
                score,
            })
            .collect())
    }
}
