//! Bounded content chunking.
//!
//! Splits raw file text into [`Chunk`]s that respect a configurable
//! `max_chunk_size` (measured in characters). Line mode accumulates whole
//! lines into a buffer and flushes when the next line would overflow; a
//! single line longer than the limit is sliced into exact-size pieces so the
//! size invariant holds unconditionally. Semantic mode (see [`crate::semantic`])
//! packs language-aware boundaries and falls back to line mode when a file
//! yields none.
//!
//! Splitting is a pure function of its inputs: the returned iterator is
//! finite, restartable, and cheap to abandon early (e.g. on cancellation).

use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::collections::VecDeque;

use crate::models::Chunk;
use crate::semantic;

/// Assignment / declaration / keyword pattern used for the code heuristic.
static CODE_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?m)(=\s*[^=]|\b(fn|def|function|class|struct|impl|let|const|var|import|from|return|pub|public|private|if|for|while|match)\b)"#,
    )
    .expect("code heuristic regex")
});

/// How the splitter decides chunk boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitMode {
    /// Accumulate lines up to the size budget.
    Line,
    /// Pack semantic boundaries (functions, classes, imports); falls back to
    /// line mode when no boundaries are found.
    Semantic,
}

/// Split `text` into chunks no larger than `max_chunk_size` characters.
///
/// Produces nothing for empty or whitespace-only input. Chunk indices are
/// contiguous starting at 0.
pub fn split<'a>(
    text: &'a str,
    max_chunk_size: usize,
    file_path: &'a str,
    mode: SplitMode,
) -> ChunkIter<'a> {
    let language = language_from_path(file_path);
    match mode {
        SplitMode::Semantic => {
            match semantic::split_semantic(text, max_chunk_size, file_path, &language) {
                Some(chunks) => ChunkIter::Packed(chunks.into_iter()),
                // No recognizable boundaries: line mode.
                None => ChunkIter::Lines(LineChunks::new(text, max_chunk_size, file_path, language)),
            }
        }
        SplitMode::Line => {
            ChunkIter::Lines(LineChunks::new(text, max_chunk_size, file_path, language))
        }
    }
}

/// Iterator over produced chunks; line mode is fully lazy.
pub enum ChunkIter<'a> {
    Lines(LineChunks<'a>),
    Packed(std::vec::IntoIter<Chunk>),
}

impl Iterator for ChunkIter<'_> {
    type Item = Chunk;

    fn next(&mut self) -> Option<Chunk> {
        match self {
            ChunkIter::Lines(inner) => inner.next(),
            ChunkIter::Packed(inner) => inner.next(),
        }
    }
}

/// Lazy line-accumulating splitter.
pub struct LineChunks<'a> {
    lines: std::str::SplitInclusive<'a, char>,
    /// Slices of an oversized line waiting to be emitted verbatim.
    pending: VecDeque<String>,
    buf: String,
    buf_chars: usize,
    max: usize,
    file_path: &'a str,
    language: String,
    index: usize,
    exhausted: bool,
}

impl<'a> LineChunks<'a> {
    fn new(text: &'a str, max: usize, file_path: &'a str, language: String) -> Self {
        Self {
            lines: text.split_inclusive('\n'),
            pending: VecDeque::new(),
            buf: String::new(),
            buf_chars: 0,
            max: max.max(1),
            file_path,
            language,
            index: 0,
            exhausted: false,
        }
    }

    fn emit(&mut self, content: String) -> Chunk {
        let chunk = make_chunk(self.file_path, self.index, content, &self.language);
        self.index += 1;
        chunk
    }

    /// Flush the accumulated buffer, trimmed of trailing whitespace.
    /// Returns `None` when the buffer held only whitespace.
    fn flush_buf(&mut self) -> Option<Chunk> {
        let content = self.buf.trim_end().to_string();
        self.buf.clear();
        self.buf_chars = 0;
        if content.is_empty() {
            None
        } else {
            Some(self.emit(content))
        }
    }

    /// Slice an oversized line into exact `max`-character pieces.
    ///
    /// Pieces are emitted verbatim (no trimming) so they reassemble to the
    /// original line, except that a whitespace-only piece (e.g. the trailing
    /// newline left over after exact slicing) is dropped, matching what
    /// `flush_buf` does for whitespace-only buffers.
    fn slice_long_line(&mut self, line: &str) {
        let chars: Vec<char> = line.chars().collect();
        for piece in chars.chunks(self.max) {
            if piece.iter().all(|c| c.is_whitespace()) {
                continue;
            }
            self.pending.push_back(piece.iter().collect());
        }
    }
}

impl Iterator for LineChunks<'_> {
    type Item = Chunk;

    fn next(&mut self) -> Option<Chunk> {
        loop {
            if let Some(piece) = self.pending.pop_front() {
                return Some(self.emit(piece));
            }
            if self.exhausted {
                return None;
            }

            match self.lines.next() {
                Some(line) => {
                    let line_chars = line.chars().count();

                    if line_chars > self.max {
                        let flushed = self.flush_buf();
                        self.slice_long_line(line);
                        if let Some(chunk) = flushed {
                            return Some(chunk);
                        }
                        continue;
                    }

                    if self.buf_chars + line_chars > self.max && !self.buf.is_empty() {
                        let flushed = self.flush_buf();
                        self.buf.push_str(line);
                        self.buf_chars = line_chars;
                        if let Some(chunk) = flushed {
                            return Some(chunk);
                        }
                        continue;
                    }

                    self.buf.push_str(line);
                    self.buf_chars += line_chars;
                }
                None => {
                    self.exhausted = true;
                    if let Some(chunk) = self.flush_buf() {
                        return Some(chunk);
                    }
                    return None;
                }
            }
        }
    }
}

/// Build a [`Chunk`] with derived metadata and a deterministic fingerprint.
pub fn make_chunk(file_path: &str, index: usize, content: String, language: &str) -> Chunk {
    let line_count = content.lines().count();
    let char_count = content.chars().count();
    let has_code = CODE_PATTERN.is_match(&content);
    let fingerprint = fingerprint(file_path, index, &content);
    Chunk {
        content,
        index,
        line_count,
        char_count,
        has_code,
        language: language.to_string(),
        fingerprint,
    }
}

/// Deterministic SHA-256 fingerprint over `(file_path, index, content)`.
pub fn fingerprint(file_path: &str, index: usize, content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(file_path.as_bytes());
    hasher.update([0u8]);
    hasher.update(index.to_string().as_bytes());
    hasher.update([0u8]);
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Infer a language tag from the file extension. Unknown extensions map to
/// `"plain"`, which selects the default boundary regex set in semantic mode.
pub fn language_from_path(file_path: &str) -> String {
    let ext = file_path.rsplit('.').next().unwrap_or_default();
    let lang = match ext.to_ascii_lowercase().as_str() {
        "rs" => "rust",
        "py" => "python",
        "js" | "jsx" | "mjs" => "javascript",
        "ts" | "tsx" => "typescript",
        "go" => "go",
        "java" => "java",
        "c" | "h" => "c",
        "cc" | "cpp" | "hpp" | "cxx" => "cpp",
        "rb" => "ruby",
        "md" | "markdown" => "markdown",
        "json" => "json",
        "toml" => "toml",
        "yml" | "yaml" => "yaml",
        "sh" | "bash" => "shell",
        _ => "plain",
    };
    lang.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(text: &str, max: usize) -> Vec<Chunk> {
        split(text, max, "test.txt", SplitMode::Line).collect()
    }

    #[test]
    fn empty_input_produces_nothing() {
        assert!(collect("", 100).is_empty());
        assert!(collect("   \n \t \n", 100).is_empty());
    }

    #[test]
    fn small_text_single_chunk() {
        let chunks = collect("Hello, world!", 100);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].index, 0);
        assert_eq!(chunks[0].content, "Hello, world!");
    }

    #[test]
    fn three_lines_at_max_two() {
        let chunks = collect("a\nb\nc\n", 2);
        let texts: Vec<&str> = chunks.iter().map(|c| c.content.as_str()).collect();
        assert_eq!(texts, vec!["a", "b", "c"]);
        let indices: Vec<usize> = chunks.iter().map(|c| c.index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
    }

    #[test]
    fn long_line_sliced_exactly() {
        let line: String = "x".repeat(5000);
        let chunks = collect(&line, 1000);
        assert_eq!(chunks.len(), 5);
        for c in &chunks {
            assert_eq!(c.char_count, 1000);
        }
        let rebuilt: String = chunks.iter().map(|c| c.content.as_str()).collect();
        assert_eq!(rebuilt, line);
    }

    #[test]
    fn long_line_with_trailing_newline_emits_no_blank_chunk() {
        let line = "x".repeat(1000) + "\n";
        let chunks = collect(&line, 1000);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].content, "x".repeat(1000));
        for c in &chunks {
            assert!(!c.content.trim().is_empty());
        }
    }

    #[test]
    fn size_invariant_holds() {
        let text = "short\n".repeat(50) + &"y".repeat(3333) + "\nshort again\n";
        for max in [7, 64, 100, 1000] {
            for chunk in collect(&text, max) {
                assert!(
                    chunk.char_count <= max,
                    "chunk of {} chars exceeds max {}",
                    chunk.char_count,
                    max
                );
            }
        }
    }

    #[test]
    fn reassembly_up_to_trailing_trim() {
        let text = "fn main() {\n    println!(\"hi\");\n}\n\nfn other() {}\n";
        let chunks = collect(text, 20);
        let rebuilt = chunks
            .iter()
            .map(|c| c.content.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        // Every original non-empty line survives in order.
        let mut rest = rebuilt.as_str();
        for line in text.lines().filter(|l| !l.trim().is_empty()) {
            let pos = rest.find(line.trim_end()).expect("line missing after split");
            rest = &rest[pos..];
        }
    }

    #[test]
    fn indices_strictly_increasing() {
        let text = (0..100).map(|i| format!("line {}\n", i)).collect::<String>();
        let chunks = collect(&text, 40);
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.index, i);
        }
    }

    #[test]
    fn fingerprint_deterministic_and_distinct() {
        let a = fingerprint("a.rs", 0, "body");
        assert_eq!(a, fingerprint("a.rs", 0, "body"));
        assert_ne!(a, fingerprint("a.rs", 1, "body"));
        assert_ne!(a, fingerprint("b.rs", 0, "body"));
        assert_ne!(a, fingerprint("a.rs", 0, "other"));
    }

    #[test]
    fn splitter_is_restartable() {
        let text = "alpha\nbeta\ngamma\n";
        let first: Vec<Chunk> = split(text, 6, "f.txt", SplitMode::Line).collect();
        let second: Vec<Chunk> = split(text, 6, "f.txt", SplitMode::Line).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn code_heuristic_and_language() {
        let chunks: Vec<Chunk> = split("let x = 1;\n", 100, "src/lib.rs", SplitMode::Line).collect();
        assert!(chunks[0].has_code);
        assert_eq!(chunks[0].language, "rust");

        let prose: Vec<Chunk> = split("just some words\n", 100, "notes.txt", SplitMode::Line).collect();
        assert!(!prose[0].has_code);
        assert_eq!(prose[0].language, "plain");
    }

    #[test]
    fn early_abandonment_is_cheap() {
        let text = "line\n".repeat(10_000);
        let mut iter = split(&text, 10, "big.txt", SplitMode::Line);
        assert!(iter.next().is_some());
        // Dropping the iterator here must not have materialized the rest.
        drop(iter);
    }
}
