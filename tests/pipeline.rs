//! End-to-end pipeline tests against a scripted transport.
//!
//! Covers the delivery guarantees users depend on: cached chunks are never
//! resent, the retry budget is a hard ceiling, cancellation stops cleanly
//! without corrupting state, and incomplete files are reprocessed on the
//! next run.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use async_trait::async_trait;
use chunk_courier::config::{
    BatcherConfig, CacheConfig, ChunkingConfig, CompressionConfig, Config, DeliveryConfig,
    EndpointConfig, PoolConfig, WorkspaceConfig,
};
use chunk_courier::dedup::DedupCache;
use chunk_courier::deliver::{Deliverer, CANCELLED_MARKER};
use chunk_courier::fileindex::FileIndex;
use chunk_courier::progress::NullProgress;
use chunk_courier::remote::{ChunkDelivery, ChunkTransport, SendError};
use chunk_courier::scan::scan_workspace;

/// What the scripted transport does with each chunk.
enum Behavior {
    Accept,
    ServerError,
    /// Accept, then cancel the token once `after` chunks have been accepted.
    CancelAfter {
        after: usize,
        token: CancellationToken,
    },
    /// Accept, overwriting the source file once on the first call.
    RewriteOnce {
        path: PathBuf,
        new_content: String,
        done: AtomicBool,
    },
}

struct ScriptedTransport {
    behavior: Behavior,
    calls: AtomicUsize,
    healthy: bool,
}

impl ScriptedTransport {
    fn accepting() -> Arc<Self> {
        Arc::new(Self {
            behavior: Behavior::Accept,
            calls: AtomicUsize::new(0),
            healthy: true,
        })
    }

    fn erroring() -> Arc<Self> {
        Arc::new(Self {
            behavior: Behavior::ServerError,
            calls: AtomicUsize::new(0),
            healthy: true,
        })
    }

    fn cancelling_after(after: usize, token: CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            behavior: Behavior::CancelAfter { after, token },
            calls: AtomicUsize::new(0),
            healthy: true,
        })
    }

    fn rewriting_once(path: &Path, new_content: &str) -> Arc<Self> {
        Arc::new(Self {
            behavior: Behavior::RewriteOnce {
                path: path.to_path_buf(),
                new_content: new_content.to_string(),
                done: AtomicBool::new(false),
            },
            calls: AtomicUsize::new(0),
            healthy: true,
        })
    }

    fn unhealthy() -> Arc<Self> {
        Arc::new(Self {
            behavior: Behavior::Accept,
            calls: AtomicUsize::new(0),
            healthy: false,
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChunkTransport for ScriptedTransport {
    async fn send_chunk(&self, delivery: &ChunkDelivery) -> Result<Option<String>, SendError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        match &self.behavior {
            Behavior::Accept => Ok(Some(format!("ext-{}", delivery.chunk.fingerprint))),
            Behavior::ServerError => Err(SendError::Server {
                status: 503,
                message: "overloaded".into(),
            }),
            Behavior::CancelAfter { after, token } => {
                if n >= *after {
                    token.cancel();
                }
                Ok(Some(format!("ext-{}", n)))
            }
            Behavior::RewriteOnce {
                path,
                new_content,
                done,
            } => {
                if !done.swap(true, Ordering::SeqCst) {
                    fs::write(path, new_content).unwrap();
                }
                Ok(Some(format!("ext-{}", n)))
            }
        }
    }

    async fn health_check(&self) -> anyhow::Result<()> {
        if self.healthy {
            Ok(())
        } else {
            anyhow::bail!("service down")
        }
    }
}

fn test_config(workspace: &Path, state: &Path) -> Config {
    Config {
        endpoint: EndpointConfig {
            url: "http://127.0.0.1:1".into(),
            auth_token: None,
            user_id: "u-test".into(),
            workspace_id: "ws-test".into(),
            webhook_url: None,
        },
        workspace: WorkspaceConfig {
            root: workspace.to_path_buf(),
            include_globs: vec!["**/*".to_string()],
            exclude_globs: Vec::new(),
            follow_symlinks: false,
        },
        chunking: ChunkingConfig {
            max_chunk_size: 50,
            semantic: false,
            stream_threshold_bytes: u64::MAX,
        },
        compression: CompressionConfig::default(),
        cache: CacheConfig {
            state_dir: state.to_path_buf(),
            expiry_hours: 24,
            max_entries: 10_000,
            debounce_ms: 10,
        },
        pool: PoolConfig { max_connections: 2 },
        batcher: BatcherConfig::default(),
        delivery: DeliveryConfig {
            retry_base_delay_ms: 1,
            chunk_concurrency: 1,
            ..DeliveryConfig::default()
        },
    }
}

fn deliverer(
    config: Config,
    transport: Arc<ScriptedTransport>,
    cancel: CancellationToken,
) -> Deliverer {
    let dedup = Arc::new(DedupCache::open(&config.cache));
    let index = Arc::new(FileIndex::open(&config.cache));
    Deliverer::new(
        config,
        transport,
        dedup,
        index,
        cancel,
        Arc::new(NullProgress),
    )
}

fn write_lines(path: &Path, lines: usize) {
    let body: String = (0..lines).map(|i| format!("line number {}\n", i)).collect();
    fs::write(path, body).unwrap();
}

#[tokio::test]
async fn sync_delivers_every_chunk_once() {
    let workspace = TempDir::new().unwrap();
    let state = TempDir::new().unwrap();
    write_lines(&workspace.path().join("a.txt"), 6);
    write_lines(&workspace.path().join("b.txt"), 4);

    let config = test_config(workspace.path(), state.path());
    let files = scan_workspace(&config.workspace).unwrap();
    assert_eq!(files.len(), 2);

    let transport = ScriptedTransport::accepting();
    let courier = deliverer(config, transport.clone(), CancellationToken::new());
    let summary = courier.run(files, false).await;
    courier.shutdown().await;

    assert_eq!(summary.files_processed, 2);
    assert!(summary.chunks_delivered > 0);
    assert_eq!(summary.chunks_failed, 0);
    assert!(!summary.cancelled);
    assert_eq!(transport.calls(), summary.chunks_delivered);
}

#[tokio::test]
async fn unmodified_files_are_skipped_on_rerun() {
    let workspace = TempDir::new().unwrap();
    let state = TempDir::new().unwrap();
    write_lines(&workspace.path().join("a.txt"), 6);

    let config = test_config(workspace.path(), state.path());
    let files = scan_workspace(&config.workspace).unwrap();

    let first = ScriptedTransport::accepting();
    let courier = deliverer(config.clone(), first.clone(), CancellationToken::new());
    let summary = courier.run(files.clone(), false).await;
    courier.shutdown().await;
    assert!(summary.chunks_delivered > 0);

    // Second run: change index says nothing moved, no files processed.
    let second = ScriptedTransport::accepting();
    let courier = deliverer(config, second.clone(), CancellationToken::new());
    let summary = courier.run(files, false).await;
    courier.shutdown().await;

    assert_eq!(summary.files_processed, 0);
    assert_eq!(second.calls(), 0);
}

#[tokio::test]
async fn cached_chunks_never_touch_the_network() {
    let workspace = TempDir::new().unwrap();
    let state = TempDir::new().unwrap();
    write_lines(&workspace.path().join("a.txt"), 6);

    let config = test_config(workspace.path(), state.path());
    let files = scan_workspace(&config.workspace).unwrap();

    let first = ScriptedTransport::accepting();
    let courier = deliverer(config.clone(), first.clone(), CancellationToken::new());
    let summary = courier.run(files.clone(), true).await;
    courier.shutdown().await;
    let delivered = summary.chunks_delivered;
    assert!(delivered > 0);

    // Full resync bypasses the file index, but every fingerprint is cached.
    let second = ScriptedTransport::accepting();
    let courier = deliverer(config, second.clone(), CancellationToken::new());
    let summary = courier.run(files, true).await;
    courier.shutdown().await;

    assert_eq!(summary.files_processed, 1);
    assert_eq!(summary.chunks_skipped, delivered);
    assert_eq!(summary.chunks_delivered, 0);
    assert_eq!(second.calls(), 0);
}

#[tokio::test]
async fn retry_budget_is_a_hard_ceiling() {
    let workspace = TempDir::new().unwrap();
    let state = TempDir::new().unwrap();
    // One line, one chunk: makes the attempt arithmetic exact.
    write_lines(&workspace.path().join("a.txt"), 1);

    let config = test_config(workspace.path(), state.path());
    let files = scan_workspace(&config.workspace).unwrap();

    let transport = ScriptedTransport::erroring();
    let courier = deliverer(config, transport.clone(), CancellationToken::new());
    let summary = courier.run(files, true).await;
    courier.shutdown().await;

    assert_eq!(summary.chunks_failed, 1);
    // 1 initial attempt + 3 retries, never a 5th.
    assert_eq!(transport.calls(), 4);
    let report = &summary.reports[0];
    assert!(report.errors[0].contains("retries exhausted"));
}

#[tokio::test]
async fn cancellation_stops_cleanly_mid_file() {
    let workspace = TempDir::new().unwrap();
    let state = TempDir::new().unwrap();
    // 15 short lines pack into 5 chunks at max_chunk_size 50.
    write_lines(&workspace.path().join("a.txt"), 15);

    let mut config = test_config(workspace.path(), state.path());
    // Stream so chunks go out strictly one at a time.
    config.chunking.stream_threshold_bytes = 0;
    let files = scan_workspace(&config.workspace).unwrap();

    let cancel = CancellationToken::new();
    let transport = ScriptedTransport::cancelling_after(2, cancel.clone());
    let courier = deliverer(config, transport.clone(), cancel);
    let summary = courier.run(files, true).await;
    courier.shutdown().await;

    assert!(summary.cancelled);
    let report = &summary.reports[0];
    assert_eq!(report.successful_chunks, 2);
    assert_eq!(report.failed_chunks, 0);
    assert!(report.cancelled);
    assert!(report.errors.iter().any(|e| e == CANCELLED_MARKER));
    // Nothing went out after the token was raised.
    assert_eq!(transport.calls(), 2);
}

#[tokio::test]
async fn interrupted_file_is_reprocessed_next_run() {
    let workspace = TempDir::new().unwrap();
    let state = TempDir::new().unwrap();
    write_lines(&workspace.path().join("a.txt"), 12);

    let mut config = test_config(workspace.path(), state.path());
    config.chunking.stream_threshold_bytes = 0;
    let files = scan_workspace(&config.workspace).unwrap();

    let cancel = CancellationToken::new();
    let transport = ScriptedTransport::cancelling_after(2, cancel.clone());
    let courier = deliverer(config.clone(), transport, cancel);
    courier.run(files.clone(), true).await;
    courier.shutdown().await;

    // The incomplete file was never recorded in the index, so a normal run
    // picks it up again; the two delivered chunks ride the dedup cache.
    let second = ScriptedTransport::accepting();
    let courier = deliverer(config, second.clone(), CancellationToken::new());
    let summary = courier.run(files, false).await;
    courier.shutdown().await;

    assert_eq!(summary.files_processed, 1);
    assert_eq!(summary.chunks_skipped, 2);
    assert_eq!(summary.chunks_failed, 0);
    assert_eq!(second.calls(), summary.chunks_delivered);
}

#[tokio::test]
async fn file_edited_during_delivery_is_reprocessed_next_run() {
    let workspace = TempDir::new().unwrap();
    let state = TempDir::new().unwrap();
    let target = workspace.path().join("a.txt");
    write_lines(&target, 6);

    let config = test_config(workspace.path(), state.path());
    let files = scan_workspace(&config.workspace).unwrap();

    // The file is overwritten while its old content is still being sent.
    // The run completes, but the index must record what was delivered, not
    // what is on disk afterwards.
    let first = ScriptedTransport::rewriting_once(&target, "fresh content after the edit\n");
    let courier = deliverer(config.clone(), first.clone(), CancellationToken::new());
    let summary = courier.run(files, false).await;
    courier.shutdown().await;
    assert_eq!(summary.chunks_failed, 0);
    assert!(first.calls() > 0);

    let rescanned = scan_workspace(&config.workspace).unwrap();
    let second = ScriptedTransport::accepting();
    let courier = deliverer(config, second.clone(), CancellationToken::new());
    let summary = courier.run(rescanned, false).await;
    courier.shutdown().await;

    assert_eq!(summary.files_processed, 1);
    assert!(
        second.calls() > 0,
        "edited content was silently skipped and never delivered"
    );
}

#[tokio::test]
async fn failed_health_check_is_terminal_for_the_file() {
    let workspace = TempDir::new().unwrap();
    let state = TempDir::new().unwrap();
    write_lines(&workspace.path().join("a.txt"), 3);

    let config = test_config(workspace.path(), state.path());
    let files = scan_workspace(&config.workspace).unwrap();

    let transport = ScriptedTransport::unhealthy();
    let courier = deliverer(config, transport.clone(), CancellationToken::new());
    let summary = courier.run(files, true).await;
    courier.shutdown().await;

    assert_eq!(summary.files_processed, 0);
    assert_eq!(summary.files_failed, 1);
    assert!(summary.file_errors[0].contains("health precheck failed"));
    assert_eq!(transport.calls(), 0);
}

#[tokio::test]
async fn batched_delivery_matches_direct_delivery() {
    let workspace = TempDir::new().unwrap();
    let state = TempDir::new().unwrap();
    write_lines(&workspace.path().join("a.txt"), 6);

    let mut config = test_config(workspace.path(), state.path());
    config.batcher = BatcherConfig {
        enabled: true,
        coalescing_window_ms: 5,
        max_batch_size: 16,
    };
    let files = scan_workspace(&config.workspace).unwrap();

    let transport = ScriptedTransport::accepting();
    let courier = deliverer(config, transport.clone(), CancellationToken::new());
    let summary = courier.run(files, true).await;
    courier.shutdown().await;

    assert_eq!(summary.files_processed, 1);
    assert_eq!(summary.chunks_failed, 0);
    assert_eq!(transport.calls(), summary.chunks_delivered);
}

#[tokio::test]
async fn job_complete_hook_fires_per_file() {
    let workspace = TempDir::new().unwrap();
    let state = TempDir::new().unwrap();
    write_lines(&workspace.path().join("a.txt"), 4);

    let config = test_config(workspace.path(), state.path());
    let files = scan_workspace(&config.workspace).unwrap();

    let hook_calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hook_calls);
    let transport = ScriptedTransport::accepting();
    let courier = deliverer(config, transport, CancellationToken::new())
        .with_job_complete_hook(Arc::new(move |job_id, success, chunks, _tokens| {
            assert!(!job_id.is_empty());
            assert!(success);
            assert!(chunks > 0);
            counter.fetch_add(1, Ordering::SeqCst);
        }));
    courier.run(files, true).await;
    courier.shutdown().await;

    assert_eq!(hook_calls.load(Ordering::SeqCst), 1);
}
