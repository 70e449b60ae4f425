//! Delivery orchestration: the end-to-end per-file pipeline.
//!
//! For each selected file: health precheck → read → split → dedup-check →
//! compress → deliver (pooled directly, or through the request batcher) →
//! retry with exponential backoff and jitter → record fingerprints → report
//! progress and aggregate a [`FileReport`].
//!
//! Concurrency is bounded at two levels: `file_batch_size` files in flight
//! across the run, `chunk_concurrency` chunk deliveries in flight per file.
//! A single [`CancellationToken`] is observed at the top of every loop and
//! before every network call; once raised, no new chunk attempt begins,
//! in-flight attempts fail fast, and aggregates record cancellation
//! distinctly instead of passing partial work off as success.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::batcher::{BatchDispatcher, RequestBatcher};
use crate::compress;
use crate::config::{CompressionConfig, Config, DeliveryConfig};
use crate::dedup::DedupCache;
use crate::fileindex::{hash_content, FileIndex};
use crate::models::{BatchRequest, Chunk, DeliveryResult, FileReport, SourceFile};
use crate::pool::ConnectionPool;
use crate::progress::{display_path, ProgressEvent, ProgressReporter};
use crate::remote::{ChunkDelivery, ChunkTransport, SendError};
use crate::splitter::{split, SplitMode};

/// Marker recorded in a [`FileReport`]'s error list when a run is cancelled
/// mid-file.
pub const CANCELLED_MARKER: &str = "cancelled: delivery interrupted before completion";

/// Rough chars-per-token ratio used for the completion callback estimate.
const CHARS_PER_TOKEN: u64 = 4;

/// Called once per file after its delivery job settles:
/// `(job_id, success, chunks_processed, tokens_estimate)`.
pub type JobCompleteHook = Arc<dyn Fn(&str, bool, usize, usize) + Send + Sync>;

/// Aggregate outcome of one sync run.
#[derive(Debug, Default)]
pub struct RunSummary {
    pub files_processed: usize,
    pub files_failed: usize,
    pub chunks_delivered: usize,
    pub chunks_skipped: usize,
    pub chunks_failed: usize,
    pub total_bytes: u64,
    pub elapsed_ms: u64,
    pub cancelled: bool,
    /// Terminal per-file errors (read failures, failed health prechecks).
    pub file_errors: Vec<String>,
    pub reports: Vec<FileReport>,
}

/// Outcome of one chunk's trip through the pipeline.
enum ChunkOutcome {
    /// Fingerprint was already in the dedup cache; no network call happened.
    Skipped,
    Done(DeliveryResult),
    Cancelled,
}

/// Drives the ingestion pipeline. Cheap to clone; all state is shared.
#[derive(Clone)]
pub struct Deliverer {
    config: Arc<Config>,
    transport: Arc<dyn ChunkTransport>,
    pool: ConnectionPool,
    batcher: Option<RequestBatcher>,
    dedup: Arc<DedupCache>,
    index: Arc<FileIndex>,
    cancel: CancellationToken,
    progress: Arc<dyn ProgressReporter>,
    on_job_complete: Option<JobCompleteHook>,
}

impl Deliverer {
    pub fn new(
        config: Config,
        transport: Arc<dyn ChunkTransport>,
        dedup: Arc<DedupCache>,
        index: Arc<FileIndex>,
        cancel: CancellationToken,
        progress: Arc<dyn ProgressReporter>,
    ) -> Self {
        let pool = ConnectionPool::new(config.pool.max_connections);
        let batcher = if config.batcher.enabled {
            let dispatcher = Arc::new(PooledDispatcher {
                transport: Arc::clone(&transport),
                pool: pool.clone(),
                compression: config.compression.clone(),
                delivery: config.delivery.clone(),
                cancel: cancel.clone(),
            });
            Some(RequestBatcher::new(&config.batcher, dispatcher))
        } else {
            None
        };

        Self {
            config: Arc::new(config),
            transport,
            pool,
            batcher,
            dedup,
            index,
            cancel,
            progress,
            on_job_complete: None,
        }
    }

    /// Register a callback invoked when a file's delivery job settles.
    ///
    /// The indexing service reports completion out of band through the
    /// configured webhook; this hook is the local counterpart, fired with
    /// the job id, outcome, chunk count, and a rough token estimate.
    pub fn with_job_complete_hook(mut self, hook: JobCompleteHook) -> Self {
        self.on_job_complete = Some(hook);
        self
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Process `files`, honoring the change-detection gate unless `full`.
    pub async fn run(&self, files: Vec<SourceFile>, full: bool) -> RunSummary {
        let started = Instant::now();
        let mut summary = RunSummary::default();

        let selected = if full {
            files
        } else {
            self.index.modified_files(files).await
        };
        info!(files = selected.len(), "starting delivery run");

        for wave in selected.chunks(self.config.delivery.file_batch_size) {
            if self.cancel.is_cancelled() {
                summary.cancelled = true;
                break;
            }

            let mut join = JoinSet::new();
            for (slot, file) in wave.iter().cloned().enumerate() {
                let this = self.clone();
                join.spawn(async move {
                    let outcome = this.process_file(&file).await;
                    (slot, file, outcome)
                });
            }

            let mut wave_results: Vec<(usize, SourceFile, Result<FileReport>)> = Vec::new();
            while let Some(joined) = join.join_next().await {
                match joined {
                    Ok(entry) => wave_results.push(entry),
                    Err(e) => {
                        summary.files_failed += 1;
                        summary.file_errors.push(format!("worker task failed: {}", e));
                    }
                }
            }
            wave_results.sort_by_key(|(slot, _, _)| *slot);

            for (_, file, outcome) in wave_results {
                match outcome {
                    Ok(report) => self.absorb_report(&mut summary, &file, report).await,
                    Err(e) => {
                        summary.files_failed += 1;
                        summary
                            .file_errors
                            .push(format!("{}: {:#}", file.path.display(), e));
                        warn!(path = %file.path.display(), error = %e, "file processing failed");
                    }
                }
            }
        }

        summary.cancelled |= self.cancel.is_cancelled();
        summary.elapsed_ms = started.elapsed().as_millis() as u64;
        summary
    }

    async fn absorb_report(&self, summary: &mut RunSummary, file: &SourceFile, report: FileReport) {
        summary.files_processed += 1;
        summary.chunks_delivered += report.successful_chunks - report.skipped_chunks;
        summary.chunks_skipped += report.skipped_chunks;
        summary.chunks_failed += report.failed_chunks;
        summary.total_bytes += report.total_bytes;
        summary.cancelled |= report.cancelled;

        let complete = report.failed_chunks == 0 && !report.cancelled;
        if complete {
            // Only a fully delivered file may be skipped on the next run, and
            // the record must describe the content that was delivered, not
            // whatever is on disk now.
            self.index
                .update_file_info(
                    &file.path,
                    &report.content_hash,
                    file.modified.timestamp(),
                    report.total_chunks,
                )
                .await;
        }

        if let Some(hook) = &self.on_job_complete {
            let tokens = (report.total_bytes / CHARS_PER_TOKEN) as usize;
            hook(&report.job_id, complete, report.successful_chunks, tokens);
        }

        self.progress.report(ProgressEvent::FileDone {
            file: display_path(&file.path),
            successful: report.successful_chunks,
            failed: report.failed_chunks,
            skipped: report.skipped_chunks,
        });
        summary.reports.push(report);
    }

    /// Process one file end to end.
    ///
    /// Errors returned here are terminal for this file only (unreadable
    /// file, failed health precheck); other files continue unaffected.
    pub async fn process_file(&self, file: &SourceFile) -> Result<FileReport> {
        let started = Instant::now();

        // Liveness precheck: fail this file loudly rather than burning the
        // retry budget on every chunk of a down service.
        self.transport.health_check().await.with_context(|| {
            format!(
                "health precheck failed before processing {}",
                file.path.display()
            )
        })?;

        let content = std::fs::read_to_string(&file.path)
            .with_context(|| format!("failed to read {}", file.path.display()))?;

        let job_id = Uuid::new_v4().to_string();
        let mode = if self.config.chunking.semantic {
            SplitMode::Semantic
        } else {
            SplitMode::Line
        };

        let mut report = FileReport {
            file_path: file.path.clone(),
            job_id: job_id.clone(),
            content_hash: hash_content(&content),
            ..FileReport::default()
        };

        let streaming = file.size_bytes >= self.config.chunking.stream_threshold_bytes;
        if streaming {
            self.process_streaming(file, &content, mode, &job_id, &mut report)
                .await;
        } else {
            self.process_buffered(file, &content, mode, &job_id, &mut report)
                .await;
        }

        if report.cancelled {
            report.errors.push(CANCELLED_MARKER.to_string());
        }
        report.elapsed_ms = started.elapsed().as_millis() as u64;
        debug!(
            path = %file.path.display(),
            total = report.total_chunks,
            ok = report.successful_chunks,
            failed = report.failed_chunks,
            cancelled = report.cancelled,
            "file processed"
        );
        Ok(report)
    }

    /// Normal path: materialize the chunk list, deliver with bounded
    /// chunk-level concurrency, report results in index order.
    async fn process_buffered(
        &self,
        file: &SourceFile,
        content: &str,
        mode: SplitMode,
        job_id: &str,
        report: &mut FileReport,
    ) {
        let chunks: Vec<Chunk> = split(
            content,
            self.config.chunking.max_chunk_size,
            &file.relative_path,
            mode,
        )
        .collect();
        report.total_chunks = chunks.len();
        let total = chunks.len();

        let semaphore = Arc::new(Semaphore::new(self.config.delivery.chunk_concurrency));
        let mut join = JoinSet::new();
        for chunk in chunks {
            let this = self.clone();
            let semaphore = Arc::clone(&semaphore);
            let relative = file.relative_path.clone();
            let job_id = job_id.to_string();
            join.spawn(async move {
                let _permit = semaphore.acquire().await;
                let index = chunk.index;
                let outcome = this.deliver_chunk(&relative, &job_id, chunk).await;
                (index, outcome)
            });
        }

        let mut outcomes: Vec<(usize, ChunkOutcome)> = Vec::with_capacity(total);
        let mut done = 0usize;
        while let Some(joined) = join.join_next().await {
            match joined {
                Ok(entry) => {
                    done += 1;
                    self.progress.report(ProgressEvent::Delivering {
                        file: display_path(&file.path),
                        n: done,
                        total,
                    });
                    outcomes.push(entry);
                }
                Err(e) => {
                    report.failed_chunks += 1;
                    report.errors.push(format!("chunk worker failed: {}", e));
                }
            }
        }
        // Chunk ordering guarantee: aggregate in index order.
        outcomes.sort_by_key(|(index, _)| *index);
        for (index, outcome) in outcomes {
            self.absorb_chunk(report, index, outcome);
        }
        report.total_bytes = content.len() as u64;
    }

    /// Large-file path: produce and deliver chunks incrementally, yielding
    /// after each one so other pending work gets scheduled.
    async fn process_streaming(
        &self,
        file: &SourceFile,
        content: &str,
        mode: SplitMode,
        job_id: &str,
        report: &mut FileReport,
    ) {
        debug!(path = %file.path.display(), size = file.size_bytes, "streaming large file");
        let chunks = split(
            content,
            self.config.chunking.max_chunk_size,
            &file.relative_path,
            mode,
        );

        let mut produced = 0usize;
        for chunk in chunks {
            produced += 1;
            if self.cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            let index = chunk.index;
            let outcome = self
                .deliver_chunk(&file.relative_path, job_id, chunk)
                .await;
            self.absorb_chunk(report, index, outcome);
            self.progress.report(ProgressEvent::Delivering {
                file: display_path(&file.path),
                n: produced,
                total: 0,
            });
            if report.cancelled {
                break;
            }
            // Cooperative backpressure between chunks.
            tokio::task::yield_now().await;
        }
        report.total_chunks = produced;
        report.total_bytes = content.len() as u64;
    }

    fn absorb_chunk(&self, report: &mut FileReport, index: usize, outcome: ChunkOutcome) {
        match outcome {
            ChunkOutcome::Skipped => {
                report.skipped_chunks += 1;
                report.successful_chunks += 1;
            }
            ChunkOutcome::Done(result) if result.success => {
                report.successful_chunks += 1;
            }
            ChunkOutcome::Done(result) => {
                report.failed_chunks += 1;
                report.errors.push(format!(
                    "chunk {}: {}",
                    index,
                    result.error.unwrap_or_else(|| "delivery failed".to_string())
                ));
            }
            ChunkOutcome::Cancelled => {
                report.cancelled = true;
            }
        }
    }

    /// Deliver one chunk: dedup gate, then batcher or direct pooled send,
    /// then record the fingerprint on success.
    async fn deliver_chunk(&self, relative_path: &str, job_id: &str, chunk: Chunk) -> ChunkOutcome {
        if self.cancel.is_cancelled() {
            return ChunkOutcome::Cancelled;
        }

        // Dedup guarantee: a cached fingerprint is never re-sent.
        if self.dedup.has(&chunk.fingerprint).await {
            debug!(fingerprint = %chunk.fingerprint, "chunk already delivered, skipping");
            return ChunkOutcome::Skipped;
        }

        let fingerprint = chunk.fingerprint.clone();
        let outcome = match &self.batcher {
            Some(batcher) => {
                let request = BatchRequest {
                    chunks: vec![chunk],
                    file_path: relative_path.into(),
                    priority: 0,
                    enqueued_at: Utc::now(),
                };
                match batcher.add_request(request).await {
                    Ok(mut results) if !results.is_empty() => {
                        let result = results.remove(0);
                        if result.error.as_deref() == Some(CANCELLED_MARKER) {
                            ChunkOutcome::Cancelled
                        } else {
                            ChunkOutcome::Done(result)
                        }
                    }
                    Ok(_) => ChunkOutcome::Done(DeliveryResult::failure(
                        "batcher returned no result for chunk",
                    )),
                    Err(e) => ChunkOutcome::Done(DeliveryResult::failure(e.to_string())),
                }
            }
            None => {
                deliver_pooled(
                    self.transport.as_ref(),
                    &self.pool,
                    &self.config.compression,
                    &self.config.delivery,
                    relative_path,
                    job_id,
                    chunk,
                    &self.cancel,
                )
                .await
            }
        };

        if let ChunkOutcome::Done(result) = &outcome {
            if result.success {
                self.dedup
                    .mark_delivered(&fingerprint, result.external_id.clone())
                    .await;
            }
        }
        outcome
    }

    /// Flush caches and tear down the pool and batcher.
    pub async fn shutdown(&self) {
        if let Some(batcher) = &self.batcher {
            batcher.shutdown();
        }
        self.pool.destroy();
        self.dedup.shutdown().await;
        self.index.shutdown().await;
    }
}

/// Dispatcher used by the request batcher: same pooled retry path as direct
/// delivery, applied to a flushed file group.
struct PooledDispatcher {
    transport: Arc<dyn ChunkTransport>,
    pool: ConnectionPool,
    compression: CompressionConfig,
    delivery: DeliveryConfig,
    cancel: CancellationToken,
}

#[async_trait]
impl BatchDispatcher for PooledDispatcher {
    async fn dispatch(&self, file_path: &Path, chunks: &[Chunk]) -> Vec<DeliveryResult> {
        let relative = file_path.to_string_lossy();
        let job_id = Uuid::new_v4().to_string();
        let mut results = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            let outcome = deliver_pooled(
                self.transport.as_ref(),
                &self.pool,
                &self.compression,
                &self.delivery,
                &relative,
                &job_id,
                chunk.clone(),
                &self.cancel,
            )
            .await;
            results.push(match outcome {
                ChunkOutcome::Done(result) => result,
                ChunkOutcome::Cancelled => DeliveryResult::failure(CANCELLED_MARKER),
                // The dispatcher never consults the dedup cache.
                ChunkOutcome::Skipped => unreachable!("dispatcher does not dedup"),
            });
        }
        results
    }
}

/// Compress, acquire a pooled connection, send with retry, release.
#[allow(clippy::too_many_arguments)]
async fn deliver_pooled(
    transport: &dyn ChunkTransport,
    pool: &ConnectionPool,
    compression: &CompressionConfig,
    delivery_cfg: &DeliveryConfig,
    relative_path: &str,
    job_id: &str,
    chunk: Chunk,
    cancel: &CancellationToken,
) -> ChunkOutcome {
    if cancel.is_cancelled() {
        return ChunkOutcome::Cancelled;
    }

    let payload = match compress::encode(&chunk.content, compression) {
        Ok(payload) => payload,
        Err(e) => return ChunkOutcome::Done(DeliveryResult::failure(e.to_string())),
    };
    let delivery = ChunkDelivery {
        chunk,
        payload,
        file_path: relative_path.to_string(),
        job_id: job_id.to_string(),
    };

    let conn = match pool.acquire().await {
        Ok(conn) => conn,
        Err(e) => return ChunkOutcome::Done(DeliveryResult::failure(e.to_string())),
    };
    let started = Instant::now();
    let outcome = send_with_retry(transport, &delivery, delivery_cfg, cancel).await;
    pool.release(conn, started.elapsed());
    outcome
}

/// One chunk's attempt chain: up to `max_retries` retries after the initial
/// attempt, with `2^(n-1) * base` backoff plus jitter in `[0, base/2)`.
async fn send_with_retry(
    transport: &dyn ChunkTransport,
    delivery: &ChunkDelivery,
    config: &DeliveryConfig,
    cancel: &CancellationToken,
) -> ChunkOutcome {
    let started = Instant::now();
    let base = Duration::from_millis(config.retry_base_delay_ms.max(1));
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        if cancel.is_cancelled() {
            return ChunkOutcome::Cancelled;
        }

        // Biased so an attempt that completed in the same tick as a
        // cancellation still counts as delivered.
        let result = tokio::select! {
            biased;
            result = transport.send_chunk(delivery) => result,
            _ = cancel.cancelled() => return ChunkOutcome::Cancelled,
        };

        match result {
            Ok(external_id) => {
                return ChunkOutcome::Done(DeliveryResult {
                    success: true,
                    external_id,
                    error: None,
                    retry_count: attempt - 1,
                    processing_time_ms: started.elapsed().as_millis() as u64,
                });
            }
            Err(SendError::Cancelled) => return ChunkOutcome::Cancelled,
            Err(e) if e.is_retryable() && attempt <= config.max_retries => {
                let backoff = base * 2u32.pow(attempt - 1);
                let jitter_ceiling = (base.as_millis() as u64 / 2).max(1);
                let jitter =
                    Duration::from_millis(rand::thread_rng().gen_range(0..jitter_ceiling));
                debug!(
                    attempt,
                    backoff_ms = (backoff + jitter).as_millis() as u64,
                    error = %e,
                    "transient delivery failure, backing off"
                );
                tokio::select! {
                    _ = cancel.cancelled() => return ChunkOutcome::Cancelled,
                    _ = tokio::time::sleep(backoff + jitter) => {}
                }
            }
            Err(e) if e.is_retryable() => {
                return ChunkOutcome::Done(DeliveryResult {
                    success: false,
                    external_id: None,
                    error: Some(format!(
                        "retries exhausted after {} attempts: {}",
                        attempt, e
                    )),
                    retry_count: attempt - 1,
                    processing_time_ms: started.elapsed().as_millis() as u64,
                });
            }
            Err(e) => {
                // Non-5xx error response: terminal for this chunk, no retry.
                return ChunkOutcome::Done(DeliveryResult {
                    success: false,
                    external_id: None,
                    error: Some(e.to_string()),
                    retry_count: attempt - 1,
                    processing_time_ms: started.elapsed().as_millis() as u64,
                });
            }
        }
    }
}
