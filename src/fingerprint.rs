//! Fingerprint store: request coalescing for ingestion.
//!
//! Maps a canonical ingestion key (url + optional date range) to either a
//! finished exhibit id or an in-flight lease. At most one ingestion runs
//! per key: the first caller gets a lease, everyone else awaits the
//! outcome and re-checks. Leases carry a TTL so a crashed or abandoned
//! worker never wedges the key; the state is in-memory only and rebuilds
//! empty on restart.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FingerprintKey {
    pub canonical_url: String,
    pub from_date: Option<String>,
    pub to_date: Option<String>,
}

/// Exclusive right to perform the ingestion for one key. Must be resolved
/// with `commit` or `release`; dropping it without either leaves the entry
/// pending until the lease TTL expires.
#[derive(Debug)]
pub struct LeaseToken {
    key: FingerprintKey,
    lease_id: u64,
}

pub enum Acquired {
    /// A finished ingestion already exists for this key.
    Existing(String),
    /// The caller is now the sole worker for this key.
    Lease(LeaseToken),
}

enum Entry {
    Pending {
        lease_id: u64,
        expires_at: Instant,
        done_tx: watch::Sender<bool>,
    },
    Done {
        exhibit_id: String,
    },
}

pub struct FingerprintStore {
    entries: Mutex<HashMap<FingerprintKey, Entry>>,
    lease_ttl: Duration,
    next_lease_id: AtomicU64,
}

impl FingerprintStore {
    pub fn new(lease_ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            lease_ttl,
            next_lease_id: AtomicU64::new(1),
        }
    }

    /// Atomically claim the key or learn its outcome. Callers finding a
    /// live pending entry await its resolution and then re-check, so
    /// concurrent duplicates trigger exactly one unit of work.
    pub async fn acquire(&self, key: &FingerprintKey) -> Acquired {
        loop {
            let mut done_rx = {
                let mut entries = self.entries.lock().expect("fingerprint lock poisoned");
                match entries.get(key) {
                    Some(Entry::Done { exhibit_id }) => {
                        return Acquired::Existing(exhibit_id.clone());
                    }
                    Some(Entry::Pending {
                        expires_at,
                        done_tx,
                        ..
                    }) if *expires_at > Instant::now() => done_tx.subscribe(),
                    // absent, or an expired lease to reclaim
                    _ => {
                        let lease_id = self.next_lease_id.fetch_add(1, Ordering::SeqCst);
                        let (done_tx, _) = watch::channel(false);
                        entries.insert(
                            key.clone(),
                            Entry::Pending {
                                lease_id,
                                expires_at: Instant::now() + self.lease_ttl,
                                done_tx,
                            },
                        );
                        return Acquired::Lease(LeaseToken {
                            key: key.clone(),
                            lease_id,
                        });
                    }
                }
            };

            // Wakes when the holder commits or releases; a closed channel
            // means the entry was replaced, which is also a reason to
            // re-check.
            let _ = done_rx.changed().await;
        }
    }

    /// Record the successful outcome and wake all waiters.
    pub fn commit(&self, token: LeaseToken, exhibit_id: &str) {
        let mut entries = self.entries.lock().expect("fingerprint lock poisoned");
        if let Some(Entry::Pending { lease_id, done_tx, .. }) = entries.get(&token.key) {
            if *lease_id != token.lease_id {
                // lease expired and was reclaimed; the new holder owns the entry
                return;
            }
            let _ = done_tx.send(true);
        } else {
            return;
        }
        entries.insert(
            token.key,
            Entry::Done {
                exhibit_id: exhibit_id.to_string(),
            },
        );
    }

    /// Clear a failed ingestion so the next request may retry the key.
    pub fn release(&self, token: LeaseToken) {
        let mut entries = self.entries.lock().expect("fingerprint lock poisoned");
        if let Some(Entry::Pending { lease_id, done_tx, .. }) = entries.get(&token.key) {
            if *lease_id == token.lease_id {
                let _ = done_tx.send(true);
                entries.remove(&token.key);
            }
        }
    }

    /// Drop a `done` entry whose exhibit no longer exists (e.g. deleted),
    /// so the key can be ingested again.
    pub fn evict(&self, key: &FingerprintKey) {
        let mut entries = self.entries.lock().expect("fingerprint lock poisoned");
        if matches!(entries.get(key), Some(Entry::Done { .. })) {
            entries.remove(key);
        }
    }

    /// Drop every `done` entry that resolved to `exhibit_id`. Used when an
    /// exhibit is deleted through the API rather than by key.
    pub fn evict_exhibit(&self, exhibit_id: &str) {
        let mut entries = self.entries.lock().expect("fingerprint lock poisoned");
        entries.retain(|_, entry| match entry {
            Entry::Done { exhibit_id: done_id } => done_id != exhibit_id,
            Entry::Pending { .. } => true,
        });
    }

    #[cfg(test)]
    fn pending_count(&self) -> usize {
        self.entries
            .lock()
            .unwrap()
            .values()
            .filter(|e| matches!(e, Entry::Pending { .. }))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn key(url: &str) -> FingerprintKey {
        FingerprintKey {
            canonical_url: url.to_string(),
            from_date: None,
            to_date: None,
        }
    }

    #[tokio::test]
    async fn test_first_acquire_gets_lease() {
        let store = FingerprintStore::new(Duration::from_secs(60));
        match store.acquire(&key("http://a.example")).await {
            Acquired::Lease(_) => {}
            Acquired::Existing(_) => panic!("expected lease"),
        }
    }

    #[tokio::test]
    async fn test_commit_then_acquire_returns_existing() {
        let store = FingerprintStore::new(Duration::from_secs(60));
        let k = key("http://a.example");

        let token = match store.acquire(&k).await {
            Acquired::Lease(t) => t,
            _ => panic!("expected lease"),
        };
        store.commit(token, "ex-1");

        match store.acquire(&k).await {
            Acquired::Existing(id) => assert_eq!(id, "ex-1"),
            _ => panic!("expected existing"),
        }
    }

    #[tokio::test]
    async fn test_release_makes_key_retryable() {
        let store = FingerprintStore::new(Duration::from_secs(60));
        let k = key("http://a.example");

        let token = match store.acquire(&k).await {
            Acquired::Lease(t) => t,
            _ => panic!("expected lease"),
        };
        store.release(token);
        assert_eq!(store.pending_count(), 0);

        match store.acquire(&k).await {
            Acquired::Lease(_) => {}
            _ => panic!("expected fresh lease after release"),
        }
    }

    #[tokio::test]
    async fn test_waiters_coalesce_on_pending() {
        let store = Arc::new(FingerprintStore::new(Duration::from_secs(60)));
        let k = key("http://a.example");

        let token = match store.acquire(&k).await {
            Acquired::Lease(t) => t,
            _ => panic!("expected lease"),
        };

        let mut waiters = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            let k = k.clone();
            waiters.push(tokio::spawn(async move { store.acquire(&k).await }));
        }

        // give the waiters time to park on the pending entry
        tokio::time::sleep(Duration::from_millis(20)).await;
        store.commit(token, "ex-9");

        for handle in waiters {
            match handle.await.unwrap() {
                Acquired::Existing(id) => assert_eq!(id, "ex-9"),
                Acquired::Lease(_) => panic!("waiter should observe the committed result"),
            }
        }
    }

    #[tokio::test]
    async fn test_expired_lease_is_reclaimed() {
        let store = FingerprintStore::new(Duration::from_millis(10));
        let k = key("http://a.example");

        let stale = match store.acquire(&k).await {
            Acquired::Lease(t) => t,
            _ => panic!("expected lease"),
        };

        tokio::time::sleep(Duration::from_millis(30)).await;

        // a new caller reclaims the expired lease instead of waiting forever
        let fresh = match store.acquire(&k).await {
            Acquired::Lease(t) => t,
            _ => panic!("expected reclaimed lease"),
        };

        // the stale holder's commit must not clobber the new owner
        store.commit(stale, "stale-result");
        assert_eq!(store.pending_count(), 1);

        store.commit(fresh, "fresh-result");
        match store.acquire(&k).await {
            Acquired::Existing(id) => assert_eq!(id, "fresh-result"),
            Acquired::Lease(_) => panic!("fresh commit should be visible"),
        }
    }

    #[tokio::test]
    async fn test_evict_exhibit_by_id() {
        let store = FingerprintStore::new(Duration::from_secs(60));
        let ka = key("http://a.example");
        let kb = key("http://b.example");

        for (k, id) in [(&ka, "ex-1"), (&kb, "ex-2")] {
            let token = match store.acquire(k).await {
                Acquired::Lease(t) => t,
                _ => panic!(),
            };
            store.commit(token, id);
        }

        store.evict_exhibit("ex-1");

        match store.acquire(&ka).await {
            Acquired::Lease(_) => {}
            _ => panic!("evicted key should be claimable"),
        }
        // unrelated key keeps its result
        match store.acquire(&kb).await {
            Acquired::Existing(id) => assert_eq!(id, "ex-2"),
            _ => panic!("other key should be untouched"),
        }
    }

    #[tokio::test]
    async fn test_evict_done_entry() {
        let store = FingerprintStore::new(Duration::from_secs(60));
        let k = key("http://a.example");

        let token = match store.acquire(&k).await {
            Acquired::Lease(t) => t,
            _ => panic!(),
        };
        store.commit(token, "ex-1");
        store.evict(&k);

        match store.acquire(&k).await {
            Acquired::Lease(_) => {}
            _ => panic!("expected lease after evict"),
        }
    }
}
