//! Core data models used throughout Chunk Courier.
//!
//! These types represent the chunks, cache entries, file fingerprints, and
//! delivery results that flow through the ingestion and delivery pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Hard upper bound on chunk content accepted by the indexing service.
pub const SERVER_MAX_CHUNK_BYTES: usize = 1_000_000;

/// A bounded piece of a source file, ready for delivery.
///
/// Chunks are produced in strictly increasing `index` order per file and are
/// never reordered downstream.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    /// Chunk text. Always `<=` the configured max chunk size.
    pub content: String,
    /// Zero-based position of this chunk within its file.
    pub index: usize,
    pub line_count: usize,
    pub char_count: usize,
    /// True when the content matches an assignment/declaration/keyword pattern.
    pub has_code: bool,
    /// Language inferred from the file extension (e.g. `"rust"`, `"plain"`).
    pub language: String,
    /// Deterministic SHA-256 over `(file_path, index, content)`.
    pub fingerprint: String,
}

/// A delivered-chunk record owned by the deduplication cache.
///
/// Created on successful delivery, read on every new chunk to short-circuit
/// resends, evicted on expiry or when the cache exceeds its entry limit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub fingerprint: String,
    pub exists: bool,
    pub timestamp: DateTime<Utc>,
    /// Id assigned by the remote indexing service, when it returned one.
    #[serde(default)]
    pub external_id: Option<String>,
}

/// Per-file record used by the change-detection index to skip unmodified files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileFingerprint {
    pub file_path: PathBuf,
    /// SHA-256 over the full file bytes.
    pub content_hash: String,
    /// Modification time (unix seconds) observed when the file was processed.
    pub last_modified: i64,
    /// Number of chunks produced the last time the file was processed.
    pub chunk_count: usize,
}

/// Opaque connection handle owned by the pool for its entire lifetime.
///
/// Callers receive one from `acquire` and must hand it back to `release`;
/// they never retain it past release.
#[derive(Debug, Clone, PartialEq)]
pub struct PooledConnection {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
}

/// A batch of chunks for one file, queued in the request batcher.
#[derive(Debug, Clone)]
pub struct BatchRequest {
    pub chunks: Vec<Chunk>,
    pub file_path: PathBuf,
    /// Higher dispatches first within a file group. Defaults to 0.
    pub priority: i32,
    pub enqueued_at: DateTime<Utc>,
}

/// Terminal outcome of one chunk's delivery attempt chain.
#[derive(Debug, Clone)]
pub struct DeliveryResult {
    pub success: bool,
    pub external_id: Option<String>,
    pub error: Option<String>,
    /// Retries consumed (0 when the first attempt succeeded).
    pub retry_count: u32,
    pub processing_time_ms: u64,
}

impl DeliveryResult {
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            external_id: None,
            error: Some(error.into()),
            retry_count: 0,
            processing_time_ms: 0,
        }
    }
}

/// Aggregated outcome of processing one file end to end.
#[derive(Debug, Clone, Default)]
pub struct FileReport {
    pub file_path: PathBuf,
    /// Delivery job id carried in wire metadata and completion callbacks.
    pub job_id: String,
    /// SHA-256 of the content that was actually read and split, recorded in
    /// the change index instead of a fresh (possibly newer) disk read.
    pub content_hash: String,
    pub total_chunks: usize,
    pub successful_chunks: usize,
    pub failed_chunks: usize,
    /// Chunks skipped because the dedup cache already held their fingerprint.
    pub skipped_chunks: usize,
    pub total_bytes: u64,
    pub elapsed_ms: u64,
    /// One human-readable string per failed chunk, plus a cancellation marker
    /// when the run was cancelled mid-file.
    pub errors: Vec<String>,
    pub cancelled: bool,
}

/// Point-in-time connection pool counters.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    pub active: usize,
    pub queued: usize,
    pub total: usize,
    pub avg_response_time_ms: f64,
}

/// A workspace file selected for ingestion.
#[derive(Debug, Clone)]
pub struct SourceFile {
    pub path: PathBuf,
    /// Path relative to the workspace root, used in wire metadata.
    pub relative_path: String,
    pub size_bytes: u64,
    pub modified: DateTime<Utc>,
}
