//! Deduplication cache keyed by chunk fingerprint.
//!
//! Records which fingerprints have already been delivered so identical chunks
//! are never sent twice. Entries expire after a configured number of hours
//! and the cache evicts oldest-first when it exceeds its entry limit.
//! Persistence is write-behind through [`DebouncedStore`].

use chrono::{Duration as ChronoDuration, Utc};
use std::time::Duration;

use crate::config::CacheConfig;
use crate::models::CacheEntry;
use crate::persist::DebouncedStore;

pub struct DedupCache {
    store: DebouncedStore<CacheEntry>,
    expiry: ChronoDuration,
    max_entries: usize,
}

impl DedupCache {
    /// Open (or create) the cache under the configured state directory.
    pub fn open(config: &CacheConfig) -> Self {
        let path = config.state_dir.join("chunks.json");
        Self {
            store: DebouncedStore::load(path, Duration::from_millis(config.debounce_ms)),
            expiry: ChronoDuration::hours(config.expiry_hours),
            max_entries: config.max_entries,
        }
    }

    /// True when `fingerprint` has a live (non-expired) delivered entry.
    ///
    /// The delivery orchestrator treats `true` as "already delivered" and
    /// must skip the chunk without a network call.
    pub async fn has(&self, fingerprint: &str) -> bool {
        self.get(fingerprint).await.map(|e| e.exists).unwrap_or(false)
    }

    /// Fetch an entry; expired entries read as absent and are purged.
    pub async fn get(&self, fingerprint: &str) -> Option<CacheEntry> {
        let cutoff = Utc::now() - self.expiry;
        let (entry, purged) = self.store.with_map(|map| {
            match map.get(fingerprint) {
                Some(e) if e.timestamp < cutoff => {
                    map.remove(fingerprint);
                    (None, true)
                }
                Some(e) => (Some(e.clone()), false),
                None => (None, false),
            }
        });
        if purged {
            self.store.mark_dirty();
        }
        entry
    }

    /// Insert or replace an entry, evicting oldest entries first when the
    /// cache is at its size limit.
    pub async fn set(&self, fingerprint: &str, entry: CacheEntry) {
        let max = self.max_entries;
        let cutoff = Utc::now() - self.expiry;
        self.store.with_map(|map| {
            map.retain(|_, e| e.timestamp >= cutoff);
            while map.len() >= max && !map.contains_key(fingerprint) {
                let oldest = map
                    .iter()
                    .min_by_key(|(_, e)| e.timestamp)
                    .map(|(k, _)| k.clone());
                match oldest {
                    Some(key) => {
                        map.remove(&key);
                    }
                    None => break,
                }
            }
            map.insert(fingerprint.to_string(), entry);
        });
        self.store.mark_dirty();
    }

    /// Record a successful delivery for `fingerprint`.
    pub async fn mark_delivered(&self, fingerprint: &str, external_id: Option<String>) {
        let entry = CacheEntry {
            fingerprint: fingerprint.to_string(),
            exists: true,
            timestamp: Utc::now(),
            external_id,
        };
        self.set(fingerprint, entry).await;
    }

    pub async fn delete(&self, fingerprint: &str) {
        let removed = self.store.with_map(|map| map.remove(fingerprint).is_some());
        if removed {
            self.store.mark_dirty();
        }
    }

    /// Drop all expired entries. Returns how many were removed.
    pub async fn purge_expired(&self) -> usize {
        let cutoff = Utc::now() - self.expiry;
        let removed = self.store.with_map(|map| {
            let before = map.len();
            map.retain(|_, e| e.timestamp >= cutoff);
            before - map.len()
        });
        if removed > 0 {
            self.store.mark_dirty();
        }
        removed
    }

    /// Entries past the expiry window but not yet purged.
    pub async fn count_expired(&self) -> usize {
        let cutoff = Utc::now() - self.expiry;
        self.store
            .with_map(|map| map.values().filter(|e| e.timestamp < cutoff).count())
    }

    /// Timestamp of the most recently delivered entry, if any.
    pub async fn newest_timestamp(&self) -> Option<chrono::DateTime<Utc>> {
        self.store
            .with_map(|map| map.values().map(|e| e.timestamp).max())
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    /// Flush outstanding mutations and stop the flush loop.
    pub async fn shutdown(&self) {
        self.store.shutdown().await;
    }
}
