//! Delivery progress reporting.
//!
//! Reports observable progress during `courier sync` so users see which file
//! is being delivered and how far along it is. Progress is emitted on
//! **stderr** so stdout remains parseable for scripts.

use std::io::Write;
use std::path::Path;

/// A single progress event for a sync run.
#[derive(Clone, Debug)]
pub enum ProgressEvent {
    /// Workspace scan in progress (no totals yet).
    Scanning,
    /// A file's chunks are being delivered: n of total done.
    Delivering {
        file: String,
        n: usize,
        total: usize,
    },
    /// A file finished, with its chunk outcome counts.
    FileDone {
        file: String,
        successful: usize,
        failed: usize,
        skipped: usize,
    },
}

/// Reports sync progress. Implementations write to stderr (human or JSON).
pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: ProgressEvent);
}

/// Human-friendly progress on stderr:
/// `sync src/lib.rs  delivering  3 / 12 chunks`.
pub struct StderrProgress;

impl ProgressReporter for StderrProgress {
    fn report(&self, event: ProgressEvent) {
        let line = match &event {
            ProgressEvent::Scanning => "sync  scanning workspace...\n".to_string(),
            ProgressEvent::Delivering { file, n, total } => {
                format!("sync {}  delivering  {} / {} chunks\n", file, n, total)
            }
            ProgressEvent::FileDone {
                file,
                successful,
                failed,
                skipped,
            } => format!(
                "sync {}  done  {} delivered, {} failed, {} cached\n",
                file, successful, failed, skipped
            ),
        };
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl ProgressReporter for JsonProgress {
    fn report(&self, event: ProgressEvent) {
        let obj = match &event {
            ProgressEvent::Scanning => serde_json::json!({
                "event": "progress",
                "phase": "scanning"
            }),
            ProgressEvent::Delivering { file, n, total } => serde_json::json!({
                "event": "progress",
                "phase": "delivering",
                "file": file,
                "n": n,
                "total": total
            }),
            ProgressEvent::FileDone {
                file,
                successful,
                failed,
                skipped,
            } => serde_json::json!({
                "event": "progress",
                "phase": "file_done",
                "file": file,
                "successful": successful,
                "failed": failed,
                "skipped": skipped
            }),
        };
        let _ = writeln!(std::io::stderr().lock(), "{}", obj);
    }
}

/// Discards all events. Used by tests and library callers that poll results.
pub struct NullProgress;

impl ProgressReporter for NullProgress {
    fn report(&self, _event: ProgressEvent) {}
}

/// Shorten a path for display, keeping the tail components.
pub fn display_path(path: &Path) -> String {
    let s = path.to_string_lossy();
    if s.len() <= 60 {
        return s.to_string();
    }
    let tail: Vec<&str> = s.rsplit('/').take(3).collect();
    format!("…/{}", tail.into_iter().rev().collect::<Vec<_>>().join("/"))
}
