//! Local state statistics.
//!
//! Provides a quick summary of the courier's on-disk state: dedup cache
//! entries, change-detection index entries, and state file sizes. Used by
//! `courier stats` to give confidence that syncs and caching are working as
//! expected.

use anyhow::Result;
use chrono::Utc;

use crate::config::Config;
use crate::dedup::DedupCache;
use crate::fileindex::FileIndex;

/// Run the stats command: read the state files and print a summary.
pub async fn run_stats(config: &Config) -> Result<()> {
    let dedup = DedupCache::open(&config.cache);
    let index = FileIndex::open(&config.cache);

    let state_dir = &config.cache.state_dir;
    let chunks_size = file_size(&state_dir.join("chunks.json"));
    let files_size = file_size(&state_dir.join("files.json"));

    let cached_chunks = dedup.len();
    let expired = dedup.count_expired().await;
    let indexed_files = index.len();
    let last_delivery = dedup.newest_timestamp().await;

    println!("Chunk Courier — Local State");
    println!("===========================");
    println!();
    println!("  State dir:       {}", state_dir.display());
    println!(
        "  Dedup cache:     {} entries ({}, {} expired)",
        cached_chunks,
        format_bytes(chunks_size),
        expired
    );
    println!(
        "  File index:      {} files ({})",
        indexed_files,
        format_bytes(files_size)
    );
    println!(
        "  Last delivery:   {}",
        match last_delivery {
            Some(ts) => format_ts_relative(ts.timestamp()),
            None => "never".to_string(),
        }
    );
    println!(
        "  Expiry window:   {} hours, cap {} entries",
        config.cache.expiry_hours, config.cache.max_entries
    );
    println!();

    dedup.shutdown().await;
    index.shutdown().await;
    Ok(())
}

fn file_size(path: &std::path::Path) -> u64 {
    std::fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}

/// Format a Unix timestamp as a relative time string (e.g. "3 hours ago").
fn format_ts_relative(ts: i64) -> String {
    let delta = Utc::now().timestamp() - ts;
    if delta < 0 {
        return "in the future".to_string();
    }
    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86_400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else {
        let days = delta / 86_400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_formatting() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(3 * 1024 * 1024), "3.0 MB");
    }

    #[test]
    fn relative_times() {
        let now = Utc::now().timestamp();
        assert_eq!(format_ts_relative(now), "just now");
        assert_eq!(format_ts_relative(now - 120), "2 mins ago");
        assert_eq!(format_ts_relative(now - 7200), "2 hours ago");
        assert_eq!(format_ts_relative(now - 3 * 86_400), "3 days ago");
    }
}
