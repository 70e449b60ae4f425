//! Write-behind JSON persistence with a single-owner flush loop.
//!
//! Both the deduplication cache and the change-detection index persist as a
//! JSON map rewritten whole-file (temp file + rename, so readers never see a
//! partial write). Mutations mark the store dirty; one background task per
//! store wakes on that signal, waits out a debounce window while coalescing
//! further mutations, and writes a snapshot. Because the loop is the only
//! writer and no timer is ever cancelled and rescheduled, concurrent mutation
//! bursts cannot race two flushes.
//!
//! Persistence failures are logged and swallowed: a store that cannot flush
//! degrades to "always reprocess" rather than aborting the pipeline.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// A persistent string-keyed map with debounced write-behind flushing.
pub struct DebouncedStore<V> {
    inner: Arc<StoreInner<V>>,
    flush_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

struct StoreInner<V> {
    path: PathBuf,
    map: Mutex<HashMap<String, V>>,
    dirty: Notify,
    /// Bumped on every mutation; the flush loop re-reads it to coalesce bursts.
    generation: AtomicU64,
    flushed_generation: AtomicU64,
    debounce: Duration,
    cancel: CancellationToken,
}

impl<V> DebouncedStore<V>
where
    V: Serialize + DeserializeOwned + Clone + Send + 'static,
{
    /// Load the store from `path` and start its flush loop.
    ///
    /// An absent or corrupt file loads as an empty map; startup never fails
    /// on bad persisted state.
    pub fn load(path: impl Into<PathBuf>, debounce: Duration) -> Self {
        let path = path.into();
        let map = read_map(&path);

        let inner = Arc::new(StoreInner {
            path,
            map: Mutex::new(map),
            dirty: Notify::new(),
            generation: AtomicU64::new(0),
            flushed_generation: AtomicU64::new(0),
            debounce,
            cancel: CancellationToken::new(),
        });

        let task = tokio::spawn(flush_loop(Arc::clone(&inner)));

        Self {
            inner,
            flush_task: Mutex::new(Some(task)),
        }
    }

    /// Run `f` against the map. Call [`Self::mark_dirty`] after mutating.
    pub fn with_map<R>(&self, f: impl FnOnce(&mut HashMap<String, V>) -> R) -> R {
        let mut guard = self.inner.map.lock().expect("store map poisoned");
        f(&mut guard)
    }

    /// Record a mutation and wake the flush loop.
    pub fn mark_dirty(&self) {
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        self.inner.dirty.notify_one();
    }

    pub fn len(&self) -> usize {
        self.with_map(|m| m.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Write a snapshot immediately, bypassing the debounce window.
    pub fn flush_now(&self) {
        write_snapshot(&self.inner);
    }

    /// Stop the flush loop and write any outstanding mutations.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        let task = self.flush_task.lock().expect("flush task lock").take();
        if let Some(task) = task {
            let _ = task.await;
        }
        if self.inner.generation.load(Ordering::SeqCst)
            != self.inner.flushed_generation.load(Ordering::SeqCst)
        {
            write_snapshot(&self.inner);
        }
    }
}

/// The single writer: waits for the dirty signal, coalesces a burst of
/// mutations behind one debounce window, then writes a snapshot.
async fn flush_loop<V>(inner: Arc<StoreInner<V>>)
where
    V: Serialize + Clone,
{
    loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => return,
            _ = inner.dirty.notified() => {}
        }

        // Quiet-period coalescing: keep sleeping while mutations keep landing.
        loop {
            let seen = inner.generation.load(Ordering::SeqCst);
            tokio::select! {
                _ = inner.cancel.cancelled() => return,
                _ = tokio::time::sleep(inner.debounce) => {}
            }
            if inner.generation.load(Ordering::SeqCst) == seen {
                break;
            }
        }

        write_snapshot(&inner);
    }
}

fn write_snapshot<V>(inner: &StoreInner<V>)
where
    V: Serialize + Clone,
{
    let generation = inner.generation.load(Ordering::SeqCst);
    let snapshot: HashMap<String, V> = {
        let guard = inner.map.lock().expect("store map poisoned");
        guard.clone()
    };

    match serde_json::to_vec_pretty(&snapshot) {
        Ok(bytes) => {
            if let Err(e) = atomic_write(&inner.path, &bytes) {
                warn!(path = %inner.path.display(), error = %e, "store flush failed");
            } else {
                inner.flushed_generation.store(generation, Ordering::SeqCst);
                debug!(
                    path = %inner.path.display(),
                    entries = snapshot.len(),
                    "store flushed"
                );
            }
        }
        Err(e) => warn!(path = %inner.path.display(), error = %e, "store serialization failed"),
    }
}

/// Whole-file atomic rewrite: write a sibling temp file, then rename over.
fn atomic_write(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)
}

fn read_map<V: DeserializeOwned>(path: &Path) -> HashMap<String, V> {
    match std::fs::read_to_string(path) {
        Ok(content) => match serde_json::from_str(&content) {
            Ok(map) => map,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "corrupt store file, starting empty");
                HashMap::new()
            }
        },
        Err(_) => HashMap::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn absent_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store: DebouncedStore<String> =
            DebouncedStore::load(dir.path().join("missing.json"), Duration::from_millis(10));
        assert!(store.is_empty());
        store.shutdown().await;
    }

    #[tokio::test]
    async fn corrupt_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        std::fs::write(&path, "{ not valid json").unwrap();
        let store: DebouncedStore<i64> = DebouncedStore::load(&path, Duration::from_millis(10));
        assert!(store.is_empty());
        store.shutdown().await;
    }

    #[tokio::test]
    async fn mutations_survive_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        {
            let store: DebouncedStore<String> =
                DebouncedStore::load(&path, Duration::from_secs(60));
            store.with_map(|m| m.insert("k".into(), "v".into()));
            store.mark_dirty();
            // Debounce window is a minute; shutdown must flush anyway.
            store.shutdown().await;
        }
        let reloaded: DebouncedStore<String> =
            DebouncedStore::load(&path, Duration::from_millis(10));
        assert_eq!(reloaded.with_map(|m| m.get("k").cloned()), Some("v".into()));
        reloaded.shutdown().await;
    }

    #[tokio::test]
    async fn burst_of_mutations_coalesces_to_one_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        let store: DebouncedStore<u64> = DebouncedStore::load(&path, Duration::from_millis(20));
        for i in 0..100u64 {
            store.with_map(|m| m.insert(format!("k{}", i), i));
            store.mark_dirty();
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        let on_disk: HashMap<String, u64> = read_map(&path);
        assert_eq!(on_disk.len(), 100);
        store.shutdown().await;
    }

    #[tokio::test]
    async fn flush_now_bypasses_debounce() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        let store: DebouncedStore<bool> = DebouncedStore::load(&path, Duration::from_secs(60));
        store.with_map(|m| m.insert("x".into(), true));
        store.mark_dirty();
        store.flush_now();
        let on_disk: HashMap<String, bool> = read_map(&path);
        assert_eq!(on_disk.get("x"), Some(&true));
        store.shutdown().await;
    }
}
