use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::models::SERVER_MAX_CHUNK_BYTES;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub endpoint: EndpointConfig,
    pub workspace: WorkspaceConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub compression: CompressionConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub batcher: BatcherConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EndpointConfig {
    /// Base URL of the remote indexing service, e.g. `http://127.0.0.1:8901`.
    pub url: String,
    /// Optional bearer token sent on both delivery and health requests.
    #[serde(default)]
    pub auth_token: Option<String>,
    /// Stable id identifying this installation to the service.
    pub user_id: String,
    /// Workspace identifier carried in chunk metadata.
    pub workspace_id: String,
    /// Optional webhook URL the service calls on job completion.
    #[serde(default)]
    pub webhook_url: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WorkspaceConfig {
    pub root: PathBuf,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
}

fn default_include_globs() -> Vec<String> {
    vec!["**/*".to_string()]
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_chunk_size")]
    pub max_chunk_size: usize,
    /// Use semantic-boundary splitting for recognized languages.
    #[serde(default)]
    pub semantic: bool,
    /// Files at or above this size stream chunks instead of materializing them.
    #[serde(default = "default_stream_threshold")]
    pub stream_threshold_bytes: u64,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_chunk_size: default_max_chunk_size(),
            semantic: false,
            stream_threshold_bytes: default_stream_threshold(),
        }
    }
}

fn default_max_chunk_size() -> usize {
    2000
}
fn default_stream_threshold() -> u64 {
    512 * 1024
}

#[derive(Debug, Deserialize, Clone)]
pub struct CompressionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Payloads smaller than this are never compressed.
    #[serde(default = "default_min_compress_bytes")]
    pub min_size_bytes: usize,
    /// Compressed output must be at most this fraction of the input.
    #[serde(default = "default_max_ratio")]
    pub max_ratio: f64,
    #[serde(default = "default_compress_level")]
    pub level: i32,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_size_bytes: default_min_compress_bytes(),
            max_ratio: default_max_ratio(),
            level: default_compress_level(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_min_compress_bytes() -> usize {
    1024
}
fn default_max_ratio() -> f64 {
    0.9
}
fn default_compress_level() -> i32 {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    /// Directory holding `chunks.json` (dedup cache) and `files.json` (index).
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    #[serde(default = "default_expiry_hours")]
    pub expiry_hours: i64,
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            expiry_hours: default_expiry_hours(),
            max_entries: default_max_entries(),
            debounce_ms: default_debounce_ms(),
        }
    }
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".courier")
}
fn default_expiry_hours() -> i64 {
    24 * 7
}
fn default_max_entries() -> usize {
    50_000
}
fn default_debounce_ms() -> u64 {
    500
}

#[derive(Debug, Deserialize, Clone)]
pub struct PoolConfig {
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
        }
    }
}

fn default_max_connections() -> usize {
    4
}

#[derive(Debug, Deserialize, Clone)]
pub struct BatcherConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_coalescing_window_ms")]
    pub coalescing_window_ms: u64,
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            coalescing_window_ms: default_coalescing_window_ms(),
            max_batch_size: default_max_batch_size(),
        }
    }
}

fn default_coalescing_window_ms() -> u64 {
    50
}
fn default_max_batch_size() -> usize {
    16
}

#[derive(Debug, Deserialize, Clone)]
pub struct DeliveryConfig {
    /// Retries after the initial attempt (3 retries = 4 attempts total).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base backoff delay; attempt n waits `2^(n-1) * base` plus jitter.
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_chunk_timeout_secs")]
    pub chunk_timeout_secs: u64,
    #[serde(default = "default_health_timeout_secs")]
    pub health_timeout_secs: u64,
    /// Files processed concurrently.
    #[serde(default = "default_file_batch_size")]
    pub file_batch_size: usize,
    /// Chunk deliveries in flight per file.
    #[serde(default = "default_chunk_concurrency")]
    pub chunk_concurrency: usize,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            chunk_timeout_secs: default_chunk_timeout_secs(),
            health_timeout_secs: default_health_timeout_secs(),
            file_batch_size: default_file_batch_size(),
            chunk_concurrency: default_chunk_concurrency(),
        }
    }
}

fn default_max_retries() -> u32 {
    3
}
fn default_retry_base_delay_ms() -> u64 {
    1000
}
fn default_chunk_timeout_secs() -> u64 {
    30
}
fn default_health_timeout_secs() -> u64 {
    5
}
fn default_file_batch_size() -> usize {
    4
}
fn default_chunk_concurrency() -> usize {
    2
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    if config.endpoint.url.is_empty() {
        anyhow::bail!("endpoint.url must not be empty");
    }
    if config.endpoint.user_id.is_empty() {
        anyhow::bail!("endpoint.user_id must not be empty");
    }

    if config.chunking.max_chunk_size == 0 {
        anyhow::bail!("chunking.max_chunk_size must be > 0");
    }
    if config.chunking.max_chunk_size > SERVER_MAX_CHUNK_BYTES {
        anyhow::bail!(
            "chunking.max_chunk_size must be <= {} (server limit)",
            SERVER_MAX_CHUNK_BYTES
        );
    }

    if !(0.0..=1.0).contains(&config.compression.max_ratio) {
        anyhow::bail!("compression.max_ratio must be in [0.0, 1.0]");
    }

    if config.cache.expiry_hours < 1 {
        anyhow::bail!("cache.expiry_hours must be >= 1");
    }
    if config.cache.max_entries == 0 {
        anyhow::bail!("cache.max_entries must be > 0");
    }

    if config.pool.max_connections == 0 {
        anyhow::bail!("pool.max_connections must be > 0");
    }

    if config.batcher.max_batch_size == 0 {
        anyhow::bail!("batcher.max_batch_size must be > 0");
    }

    if config.delivery.file_batch_size == 0 || config.delivery.chunk_concurrency == 0 {
        anyhow::bail!("delivery.file_batch_size and delivery.chunk_concurrency must be > 0");
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(body: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(body.as_bytes()).unwrap();
        f
    }

    const MINIMAL: &str = r#"
[endpoint]
url = "http://127.0.0.1:8901"
user_id = "u-123"
workspace_id = "ws-1"

[workspace]
root = "/tmp/src"
"#;

    #[test]
    fn minimal_config_loads_with_defaults() {
        let f = write_config(MINIMAL);
        let cfg = load_config(f.path()).unwrap();
        assert_eq!(cfg.chunking.max_chunk_size, 2000);
        assert_eq!(cfg.pool.max_connections, 4);
        assert_eq!(cfg.delivery.max_retries, 3);
        assert!(!cfg.batcher.enabled);
    }

    #[test]
    fn zero_chunk_size_rejected() {
        let f = write_config(&format!("{}\n[chunking]\nmax_chunk_size = 0\n", MINIMAL));
        assert!(load_config(f.path()).is_err());
    }

    #[test]
    fn oversized_chunk_size_rejected() {
        let f = write_config(&format!(
            "{}\n[chunking]\nmax_chunk_size = 2000000\n",
            MINIMAL
        ));
        assert!(load_config(f.path()).is_err());
    }

    #[test]
    fn empty_user_id_rejected() {
        let body = MINIMAL.replace("u-123", "");
        let f = write_config(&body);
        assert!(load_config(f.path()).is_err());
    }
}
