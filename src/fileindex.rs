//! Change-detection index: skips files unchanged since the last run.
//!
//! Stores a [`FileFingerprint`] (mtime + SHA-256 content hash + chunk count)
//! per file. A file is modified when its mtime is strictly newer than the
//! stored one OR its content hash differs; either alone triggers
//! reprocessing. Any I/O error while checking counts as modified; a file is
//! never silently skipped on bad information. Persistence mirrors the dedup
//! cache's debounced write-behind discipline.

use sha2::{Digest, Sha256};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

use crate::config::CacheConfig;
use crate::models::{FileFingerprint, SourceFile};
use crate::persist::DebouncedStore;

pub struct FileIndex {
    store: DebouncedStore<FileFingerprint>,
}

impl FileIndex {
    pub fn open(config: &CacheConfig) -> Self {
        let path = config.state_dir.join("files.json");
        Self {
            store: DebouncedStore::load(path, Duration::from_millis(config.debounce_ms)),
        }
    }

    /// True when the file is new, changed, or unreadable.
    pub async fn is_file_modified(&self, path: &Path) -> bool {
        let key = key_for(path);
        let stored = self.store.with_map(|m| m.get(&key).cloned());
        let Some(stored) = stored else {
            return true; // new file
        };

        let Ok(mtime) = file_mtime(path) else {
            return true;
        };
        if mtime > stored.last_modified {
            return true;
        }

        match hash_file(path) {
            Ok(hash) => hash != stored.content_hash,
            Err(_) => true,
        }
    }

    /// Filter `files` down to those that need reprocessing.
    pub async fn modified_files(&self, files: Vec<SourceFile>) -> Vec<SourceFile> {
        let mut modified = Vec::new();
        for file in files {
            if self.is_file_modified(&file.path).await {
                modified.push(file);
            } else {
                debug!(path = %file.path.display(), "unchanged, skipping");
            }
        }
        modified
    }

    /// Record the state that was actually processed.
    ///
    /// Callers pass the hash of the content they read and the mtime observed
    /// when the file was selected, never a fresh disk read: an edit landing
    /// while the old content was in flight must still read as modified on
    /// the next run.
    pub async fn update_file_info(
        &self,
        path: &Path,
        content_hash: &str,
        last_modified: i64,
        chunk_count: usize,
    ) {
        let fingerprint = FileFingerprint {
            file_path: path.to_path_buf(),
            content_hash: content_hash.to_string(),
            last_modified,
            chunk_count,
        };
        self.store
            .with_map(|m| m.insert(key_for(path), fingerprint));
        self.store.mark_dirty();
    }

    /// Drop entries for files no longer present on disk. Returns how many
    /// were removed.
    pub async fn cleanup(&self) -> usize {
        let removed = self.store.with_map(|map| {
            let before = map.len();
            map.retain(|_, fp| fp.file_path.exists());
            before - map.len()
        });
        if removed > 0 {
            self.store.mark_dirty();
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    pub async fn shutdown(&self) {
        self.store.shutdown().await;
    }
}

fn key_for(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

fn file_mtime(path: &Path) -> std::io::Result<i64> {
    let modified = std::fs::metadata(path)?.modified()?;
    Ok(modified
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64)
}

/// SHA-256 over the full file bytes.
pub fn hash_file(path: &Path) -> std::io::Result<String> {
    let bytes = std::fs::read(path)?;
    Ok(hash_bytes(&bytes))
}

/// SHA-256 over already-read content. Matches [`hash_file`] byte for byte so
/// a hash taken at read time compares cleanly against a later disk read.
pub fn hash_content(text: &str) -> String {
    hash_bytes(text.as_bytes())
}

fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn config(dir: &Path) -> CacheConfig {
        CacheConfig {
            state_dir: PathBuf::from(dir),
            expiry_hours: 24,
            max_entries: 1000,
            debounce_ms: 10,
        }
    }

    #[tokio::test]
    async fn new_file_is_modified() {
        let dir = tempfile::tempdir().unwrap();
        let index = FileIndex::open(&config(dir.path()));
        let file = dir.path().join("fresh.rs");
        std::fs::write(&file, "fn main() {}").unwrap();
        assert!(index.is_file_modified(&file).await);
        index.shutdown().await;
    }

    async fn record_current(index: &FileIndex, path: &Path, content: &str) {
        index
            .update_file_info(path, &hash_content(content), file_mtime(path).unwrap(), 1)
            .await;
    }

    #[tokio::test]
    async fn unchanged_file_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let index = FileIndex::open(&config(dir.path()));
        let file = dir.path().join("same.rs");
        std::fs::write(&file, "fn main() {}").unwrap();
        record_current(&index, &file, "fn main() {}").await;
        assert!(!index.is_file_modified(&file).await);
        index.shutdown().await;
    }

    #[tokio::test]
    async fn content_change_triggers_reprocessing() {
        let dir = tempfile::tempdir().unwrap();
        let index = FileIndex::open(&config(dir.path()));
        let file = dir.path().join("edited.rs");
        std::fs::write(&file, "fn main() {}").unwrap();
        record_current(&index, &file, "fn main() {}").await;
        std::fs::write(&file, "fn main() { panic!() }").unwrap();
        assert!(index.is_file_modified(&file).await);
        index.shutdown().await;
    }

    #[tokio::test]
    async fn edit_during_delivery_still_reads_as_modified() {
        let dir = tempfile::tempdir().unwrap();
        let index = FileIndex::open(&config(dir.path()));
        let file = dir.path().join("racy.rs");
        std::fs::write(&file, "old body").unwrap();
        let read_hash = hash_content("old body");
        let scan_mtime = file_mtime(&file).unwrap();

        // The file changes while the old content is in flight; the record
        // keeps the hash of what was actually delivered.
        std::fs::write(&file, "new body").unwrap();
        index.update_file_info(&file, &read_hash, scan_mtime, 1).await;

        assert!(index.is_file_modified(&file).await);
        index.shutdown().await;
    }

    #[tokio::test]
    async fn missing_file_counts_as_modified() {
        let dir = tempfile::tempdir().unwrap();
        let index = FileIndex::open(&config(dir.path()));
        let file = dir.path().join("there.rs");
        std::fs::write(&file, "x").unwrap();
        record_current(&index, &file, "x").await;
        std::fs::remove_file(&file).unwrap();
        // I/O error while checking: conservatively modified.
        assert!(index.is_file_modified(&file).await);
        index.shutdown().await;
    }

    #[tokio::test]
    async fn cleanup_drops_deleted_files() {
        let dir = tempfile::tempdir().unwrap();
        let index = FileIndex::open(&config(dir.path()));
        let keep = dir.path().join("keep.rs");
        let gone = dir.path().join("gone.rs");
        std::fs::write(&keep, "a").unwrap();
        std::fs::write(&gone, "b").unwrap();
        record_current(&index, &keep, "a").await;
        record_current(&index, &gone, "b").await;
        std::fs::remove_file(&gone).unwrap();
        assert_eq!(index.cleanup().await, 1);
        assert_eq!(index.len(), 1);
        index.shutdown().await;
    }
}
