//! # Chunk Courier CLI (`courier`)
//!
//! The `courier` binary drives the ingestion pipeline: it scans the
//! configured workspace, splits files into chunks, and delivers them to the
//! remote indexing service with deduplication, retry, and cancellation.
//!
//! ## Usage
//!
//! ```bash
//! courier --config ./courier.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `courier sync` | Deliver chunks from files modified since the last run |
//! | `courier sync --full` | Ignore the change index and reprocess every file |
//! | `courier sync --dry-run` | Show file and chunk counts without delivering |
//! | `courier check` | Validate config and probe the endpoint's health |
//! | `courier stats` | Summarize local cache and index state |
//! | `courier clean` | Drop expired dedup entries and stale index records |

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use chunk_courier::config::{self, Config};
use chunk_courier::dedup::DedupCache;
use chunk_courier::deliver::Deliverer;
use chunk_courier::fileindex::FileIndex;
use chunk_courier::models::SourceFile;
use chunk_courier::progress::{JsonProgress, NullProgress, ProgressEvent, ProgressReporter, StderrProgress};
use chunk_courier::remote::{ChunkTransport, HttpTransport};
use chunk_courier::scan::scan_workspace;
use chunk_courier::splitter::{split, SplitMode};
use chunk_courier::stats::run_stats;

/// Chunk Courier CLI: deliver workspace code chunks to a remote indexing
/// service.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/courier.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "courier",
    about = "Chunk Courier — workspace chunk ingestion and delivery pipeline",
    version,
    long_about = "Chunk Courier scans a workspace, splits files into bounded chunks \
    (line-based or semantic), deduplicates against previously delivered content, and \
    delivers the rest to a remote indexing service through a bounded connection pool \
    with retry, backoff, and graceful cancellation."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./courier.toml")]
    config: PathBuf,

    /// Emit progress as JSON lines on stderr instead of human text.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Deliver chunks from modified workspace files.
    ///
    /// Scans the workspace, skips files the change index marks unmodified,
    /// splits the rest into chunks, and delivers every chunk not already in
    /// the dedup cache. Ctrl-C stops the run cleanly: in-flight chunks are
    /// abandoned, caches are flushed, and partial files are reprocessed on
    /// the next run.
    Sync {
        /// Ignore the change index and reprocess every file from scratch.
        #[arg(long)]
        full: bool,

        /// Show file and chunk counts without delivering anything.
        #[arg(long)]
        dry_run: bool,

        /// Maximum number of files to process.
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Validate the configuration and probe the endpoint's health.
    Check,

    /// Summarize local cache and index state.
    Stats,

    /// Drop expired dedup entries and index records for deleted files.
    Clean,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Sync {
            full,
            dry_run,
            limit,
        } => {
            let progress: Arc<dyn ProgressReporter> = if dry_run {
                Arc::new(NullProgress)
            } else if cli.json {
                Arc::new(JsonProgress)
            } else {
                Arc::new(StderrProgress)
            };
            run_sync(config, full, dry_run, limit, progress).await
        }
        Commands::Check => run_check(&config).await,
        Commands::Stats => run_stats(&config).await,
        Commands::Clean => run_clean(&config).await,
    }
}

async fn run_sync(
    config: Config,
    full: bool,
    dry_run: bool,
    limit: Option<usize>,
    progress: Arc<dyn ProgressReporter>,
) -> Result<()> {
    progress.report(ProgressEvent::Scanning);
    let mut files = scan_workspace(&config.workspace)?;
    if let Some(limit) = limit {
        files.truncate(limit);
    }

    let index = Arc::new(FileIndex::open(&config.cache));
    if dry_run {
        let selected = if full {
            files
        } else {
            index.modified_files(files).await
        };
        let result = print_dry_run(&config, &selected);
        index.shutdown().await;
        return result;
    }

    let dedup = Arc::new(DedupCache::open(&config.cache));
    let transport: Arc<dyn ChunkTransport> = Arc::new(HttpTransport::new(&config)?);

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, finishing in-flight work");
            signal_cancel.cancel();
        }
    });

    let deliverer = Deliverer::new(config, transport, dedup, index, cancel, progress);
    let summary = deliverer.run(files, full).await;
    deliverer.shutdown().await;

    println!(
        "sync complete: {} files, {} chunks delivered, {} cached, {} failed in {:.1}s",
        summary.files_processed,
        summary.chunks_delivered,
        summary.chunks_skipped,
        summary.chunks_failed,
        summary.elapsed_ms as f64 / 1000.0
    );
    for error in &summary.file_errors {
        eprintln!("error: {}", error);
    }
    if summary.cancelled {
        println!("sync was interrupted; rerun to pick up where it left off");
    }

    if summary.files_failed > 0 || summary.chunks_failed > 0 {
        anyhow::bail!(
            "{} files and {} chunks failed to deliver",
            summary.files_failed,
            summary.chunks_failed
        );
    }
    Ok(())
}

fn print_dry_run(config: &Config, files: &[SourceFile]) -> Result<()> {
    let mode = if config.chunking.semantic {
        SplitMode::Semantic
    } else {
        SplitMode::Line
    };

    let mut total_chunks = 0usize;
    let mut total_bytes = 0u64;
    for file in files {
        let content = match std::fs::read_to_string(&file.path) {
            Ok(content) => content,
            Err(e) => {
                eprintln!("skipping {}: {}", file.path.display(), e);
                continue;
            }
        };
        let chunks = split(
            &content,
            config.chunking.max_chunk_size,
            &file.relative_path,
            mode,
        )
        .count();
        println!("{}  {} chunks", file.relative_path, chunks);
        total_chunks += chunks;
        total_bytes += file.size_bytes;
    }
    println!(
        "dry run: {} files, {} chunks, {} bytes — nothing delivered",
        files.len(),
        total_chunks,
        total_bytes
    );
    Ok(())
}

async fn run_check(config: &Config) -> Result<()> {
    println!("config ok: workspace {}", config.workspace.root.display());
    println!(
        "chunking: max {} chars, {} mode",
        config.chunking.max_chunk_size,
        if config.chunking.semantic {
            "semantic"
        } else {
            "line"
        }
    );
    println!(
        "endpoint: {} (auth {})",
        config.endpoint.url,
        if config.endpoint.auth_token.is_some() {
            "bearer"
        } else {
            "none"
        }
    );

    let transport = HttpTransport::new(config)?;
    transport.health_check().await?;
    println!("endpoint healthy");
    Ok(())
}

async fn run_clean(config: &Config) -> Result<()> {
    let dedup = DedupCache::open(&config.cache);
    let index = FileIndex::open(&config.cache);

    let purged = dedup.purge_expired().await;
    let removed = index.cleanup().await;
    dedup.shutdown().await;
    index.shutdown().await;

    println!(
        "clean: purged {} expired chunk entries, removed {} stale file records",
        purged, removed
    );
    Ok(())
}
