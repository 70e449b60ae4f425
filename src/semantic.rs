//! Language-aware semantic boundary detection and packing.
//!
//! Scans a file line by line, tracking brace depth and multi-line comment
//! state, and classifies lines by per-language regexes into imports,
//! comments, functions, classes, methods, and blocks. Closed boundaries are
//! scored by importance, small neighbors are merged, and the result is packed
//! greedily into size-bounded chunks. Files with no recognizable boundaries
//! fall back to line-based splitting (handled by the caller).

use once_cell::sync::Lazy;
use regex::Regex;

use crate::models::Chunk;
use crate::splitter::{make_chunk, split, SplitMode};

/// Boundaries under this many characters are merged in runs of up to
/// [`MERGE_RUN_MAX`] before packing, to avoid many tiny chunks.
const SMALL_BOUNDARY_CHARS: usize = 200;
const MERGE_RUN_MAX: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BoundaryKind {
    Import,
    Comment,
    Function,
    Class,
    Method,
    Block,
}

impl BoundaryKind {
    fn base_importance(self) -> u32 {
        match self {
            BoundaryKind::Class => 10,
            BoundaryKind::Function => 8,
            BoundaryKind::Method => 6,
            BoundaryKind::Block => 4,
            BoundaryKind::Import => 2,
            BoundaryKind::Comment => 1,
        }
    }

    /// Imports and comments are single-line boundaries.
    fn closes_immediately(self) -> bool {
        matches!(self, BoundaryKind::Import | BoundaryKind::Comment)
    }
}

#[derive(Debug)]
struct Boundary {
    kind: BoundaryKind,
    text: String,
    importance: u32,
}

/// Per-language line classification regexes.
struct BoundaryPatterns {
    import: Regex,
    comment: Regex,
    class: Regex,
    function: Regex,
    method: Regex,
    block: Regex,
    exported: Regex,
    public: Regex,
}

fn re(pattern: &str) -> Regex {
    Regex::new(pattern).expect("boundary regex")
}

static RUST_PATTERNS: Lazy<BoundaryPatterns> = Lazy::new(|| BoundaryPatterns {
    import: re(r"^use\s+[\w:]"),
    comment: re(r"^(//|/\*|\*)"),
    class: re(r"^(pub(\([^)]*\))?\s+)?(struct|enum|trait|union)\s+\w+|^impl\b"),
    function: re(r"^(pub(\([^)]*\))?\s+)?(async\s+)?(unsafe\s+)?fn\s+\w+"),
    method: re(r"^$a"), // methods are detected by indentation, see classify()
    block: re(r"^(if|for|while|loop|match)\b"),
    exported: re(r"^pub\b"),
    public: re(r"^pub\s+(?:async\s+)?(?:fn|struct|enum|trait)\b"),
});

static PYTHON_PATTERNS: Lazy<BoundaryPatterns> = Lazy::new(|| BoundaryPatterns {
    import: re(r"^(import|from)\s+\w"),
    comment: re(r"^#"),
    class: re(r"^class\s+\w+"),
    function: re(r"^(async\s+)?def\s+\w+"),
    method: re(r"^$a"),
    block: re(r"^(if|for|while|with|try)\b"),
    exported: re(r"^$a"),
    public: re(r"^(async\s+)?(def|class)\s+[^_]"),
});

static JS_PATTERNS: Lazy<BoundaryPatterns> = Lazy::new(|| BoundaryPatterns {
    import: re(r"^(import\s|const\s+\w+\s*=\s*require\()"),
    comment: re(r"^(//|/\*|\*)"),
    class: re(r"^(export\s+)?(default\s+)?(abstract\s+)?class\s+\w+|^(export\s+)?interface\s+\w+"),
    function: re(
        r"^(export\s+)?(default\s+)?(async\s+)?function\s*\*?\s*\w+|^(export\s+)?const\s+\w+\s*=\s*(async\s*)?\(",
    ),
    method: re(r"^$a"),
    block: re(r"^(if|for|while|switch|try)\b"),
    exported: re(r"^export\b"),
    public: re(r"\bpublic\b"),
});

static GO_PATTERNS: Lazy<BoundaryPatterns> = Lazy::new(|| BoundaryPatterns {
    import: re(r#"^import\s"#),
    comment: re(r"^(//|/\*)"),
    class: re(r"^type\s+\w+\s+(struct|interface)\b"),
    function: re(r"^func\s+(\(\s*\w+\s+\*?\w+\s*\)\s*)?\w+"),
    method: re(r"^$a"),
    block: re(r"^(if|for|switch|select)\b"),
    exported: re(r"^(func|type)\s+(\([^)]*\)\s*)?[A-Z]"),
    public: re(r"^$a"),
});

static DEFAULT_PATTERNS: Lazy<BoundaryPatterns> = Lazy::new(|| BoundaryPatterns {
    import: re(r"^(import|from|use|require|#include)\b"),
    comment: re(r"^(//|#|/\*|\*|--)"),
    class: re(r"\b(class|struct|interface|enum|trait)\s+\w+"),
    function: re(r"\b(function|fn|def|func|sub)\s+\w+|^\w[\w\s*&<>,:]*\s+\w+\s*\([^;]*\)\s*\{?\s*$"),
    method: re(r"^$a"),
    block: re(r"^(if|for|while|switch|try|do)\b"),
    exported: re(r"^(export|pub)\b"),
    public: re(r"\bpublic\b"),
});

/// Unrecognized languages use the default set; this is not an error.
fn patterns_for(language: &str) -> &'static BoundaryPatterns {
    match language {
        "rust" => &RUST_PATTERNS,
        "python" => &PYTHON_PATTERNS,
        "javascript" | "typescript" => &JS_PATTERNS,
        "go" => &GO_PATTERNS,
        _ => &DEFAULT_PATTERNS,
    }
}

/// Split `text` by semantic boundaries. Returns `None` when no boundaries
/// were found so the caller can fall back to line-based splitting.
pub(crate) fn split_semantic(
    text: &str,
    max_chunk_size: usize,
    file_path: &str,
    language: &str,
) -> Option<Vec<Chunk>> {
    let boundaries = detect_boundaries(text, language);
    if boundaries.is_empty() {
        return None;
    }
    let merged = merge_small(boundaries);
    Some(pack(merged, max_chunk_size, file_path, language))
}

fn detect_boundaries(text: &str, language: &str) -> Vec<Boundary> {
    let patterns = patterns_for(language);
    let mut boundaries = Vec::new();
    let mut open: Option<(BoundaryKind, String, i32, u32)> = None;
    let mut depth: i32 = 0;
    let mut in_block_comment = false;

    for raw_line in text.lines() {
        let line = raw_line.trim_start();
        let indented = raw_line.len() != line.len();

        if in_block_comment {
            if let Some((kind, mut buf, depth_at_open, importance)) = open.take() {
                buf.push_str(raw_line);
                buf.push('\n');
                if line.contains("*/") {
                    in_block_comment = false;
                    boundaries.push(Boundary {
                        kind,
                        text: buf.trim_end().to_string(),
                        importance,
                    });
                } else {
                    open = Some((kind, buf, depth_at_open, importance));
                }
            } else if line.contains("*/") {
                in_block_comment = false;
            }
            continue;
        }

        let delta = brace_delta(line);

        if let Some((kind, mut buf, depth_at_open, importance)) = open.take() {
            buf.push_str(raw_line);
            buf.push('\n');
            depth += delta;
            if depth <= depth_at_open {
                boundaries.push(Boundary {
                    kind,
                    text: buf.trim_end().to_string(),
                    importance,
                });
            } else {
                open = Some((kind, buf, depth_at_open, importance));
            }
            continue;
        }

        if line.is_empty() {
            depth += delta;
            continue;
        }

        match classify(line, indented, patterns) {
            Some(kind) => {
                let importance = score(kind, line, patterns);
                if kind == BoundaryKind::Comment && line.contains("/*") && !line.contains("*/") {
                    // Multi-line comment opens; consume until the closer.
                    in_block_comment = true;
                    open = Some((kind, format!("{}\n", raw_line), depth, importance));
                    continue;
                }
                if kind.closes_immediately() {
                    depth += delta;
                    boundaries.push(Boundary {
                        kind,
                        text: raw_line.trim_end().to_string(),
                        importance,
                    });
                    continue;
                }
                let depth_at_open = depth;
                depth += delta;
                if depth <= depth_at_open {
                    // Single-line definition, braces balanced on the open line.
                    boundaries.push(Boundary {
                        kind,
                        text: raw_line.trim_end().to_string(),
                        importance,
                    });
                } else {
                    open = Some((kind, format!("{}\n", raw_line), depth_at_open, importance));
                }
            }
            None => {
                depth += delta;
            }
        }
    }

    // Unterminated boundary at EOF still counts.
    if let Some((kind, buf, _, importance)) = open {
        boundaries.push(Boundary {
            kind,
            text: buf.trim_end().to_string(),
            importance,
        });
    }

    boundaries
}

fn classify(line: &str, indented: bool, patterns: &BoundaryPatterns) -> Option<BoundaryKind> {
    if patterns.comment.is_match(line) {
        return Some(BoundaryKind::Comment);
    }
    if patterns.import.is_match(line) {
        return Some(BoundaryKind::Import);
    }
    if patterns.class.is_match(line) {
        return Some(BoundaryKind::Class);
    }
    if patterns.function.is_match(line) {
        // Indented definitions are methods on an enclosing type.
        return Some(if indented {
            BoundaryKind::Method
        } else {
            BoundaryKind::Function
        });
    }
    if patterns.method.is_match(line) {
        return Some(BoundaryKind::Method);
    }
    if patterns.block.is_match(line) {
        return Some(BoundaryKind::Block);
    }
    None
}

fn score(kind: BoundaryKind, line: &str, patterns: &BoundaryPatterns) -> u32 {
    let mut importance = kind.base_importance();
    if patterns.exported.is_match(line) {
        importance += 2;
    }
    if patterns.public.is_match(line) {
        importance += 1;
    }
    importance
}

/// Net brace-depth change contributed by a line, ignoring braces that appear
/// after a line-comment marker.
fn brace_delta(line: &str) -> i32 {
    let code = line.split("//").next().unwrap_or(line);
    let mut delta = 0;
    for c in code.chars() {
        match c {
            '{' => delta += 1,
            '}' => delta -= 1,
            _ => {}
        }
    }
    delta
}

/// Merge runs of small boundaries (document order) to avoid tiny chunks.
fn merge_small(boundaries: Vec<Boundary>) -> Vec<Boundary> {
    let mut merged: Vec<Boundary> = Vec::with_capacity(boundaries.len());
    let mut run = 0usize;

    for b in boundaries {
        let small = b.text.chars().count() < SMALL_BOUNDARY_CHARS;
        if small && run > 0 && run < MERGE_RUN_MAX {
            let prev = merged.last_mut().expect("merge target");
            prev.text.push('\n');
            prev.text.push_str(&b.text);
            prev.importance = prev.importance.max(b.importance);
            run += 1;
            continue;
        }
        run = if small { 1 } else { 0 };
        merged.push(b);
    }

    merged
}

/// Greedily pack boundaries by descending importance into bounded chunks.
fn pack(
    mut boundaries: Vec<Boundary>,
    max_chunk_size: usize,
    file_path: &str,
    language: &str,
) -> Vec<Chunk> {
    boundaries.sort_by(|a, b| b.importance.cmp(&a.importance));

    let mut contents: Vec<String> = Vec::new();
    let mut buf = String::new();
    let mut buf_chars = 0usize;

    for b in &boundaries {
        let b_chars = b.text.chars().count();

        if b_chars > max_chunk_size {
            if !buf.is_empty() {
                contents.push(std::mem::take(&mut buf));
                buf_chars = 0;
            }
            // Oversized boundary: fall back to line slicing for this text.
            for piece in split(&b.text, max_chunk_size, file_path, SplitMode::Line) {
                contents.push(piece.content);
            }
            continue;
        }

        let would_be = if buf.is_empty() {
            b_chars
        } else {
            buf_chars + 2 + b_chars // +2 for the \n\n separator
        };
        if would_be > max_chunk_size && !buf.is_empty() {
            contents.push(std::mem::take(&mut buf));
            buf_chars = 0;
        }
        if !buf.is_empty() {
            buf.push_str("\n\n");
            buf_chars += 2;
        }
        buf.push_str(&b.text);
        buf_chars += b_chars;
    }
    if !buf.is_empty() {
        contents.push(buf);
    }

    contents
        .into_iter()
        .enumerate()
        .map(|(i, content)| make_chunk(file_path, i, content, language))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::splitter::ChunkIter;

    const RUST_SRC: &str = r#"use std::fmt;

/// Greeter.
pub struct Greeter {
    name: String,
}

pub fn greet(name: &str) -> String {
    format!("hello {}", name)
}

fn helper() {
    let x = 1;
    if x > 0 {
        println!("{}", x);
    }
}
"#;

    #[test]
    fn detects_rust_boundaries() {
        let boundaries = detect_boundaries(RUST_SRC, "rust");
        let kinds: Vec<BoundaryKind> = boundaries.iter().map(|b| b.kind).collect();
        assert!(kinds.contains(&BoundaryKind::Import));
        assert!(kinds.contains(&BoundaryKind::Class));
        assert!(kinds.contains(&BoundaryKind::Function));
    }

    #[test]
    fn exported_scores_higher() {
        let boundaries = detect_boundaries(RUST_SRC, "rust");
        let public_fn = boundaries
            .iter()
            .find(|b| b.text.contains("pub fn greet"))
            .unwrap();
        let private_fn = boundaries
            .iter()
            .find(|b| b.text.contains("fn helper"))
            .unwrap();
        assert!(public_fn.importance > private_fn.importance);
    }

    #[test]
    fn no_boundaries_falls_back() {
        assert!(split_semantic("plain prose with no code at all", 500, "a.txt", "plain").is_none());
    }

    #[test]
    fn packed_chunks_respect_max() {
        let chunks = split_semantic(RUST_SRC, 120, "lib.rs", "rust").unwrap();
        assert!(!chunks.is_empty());
        for c in &chunks {
            assert!(c.char_count <= 120, "chunk {} chars > 120", c.char_count);
        }
    }

    #[test]
    fn packed_indices_contiguous() {
        let chunks = split_semantic(RUST_SRC, 150, "lib.rs", "rust").unwrap();
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.index, i);
        }
    }

    #[test]
    fn small_boundaries_merge_in_runs() {
        let src = "use a;\nuse b;\nuse c;\nuse d;\nuse e;\n";
        let merged = merge_small(detect_boundaries(src, "rust"));
        // Five one-line imports collapse into runs of up to three.
        assert!(merged.len() <= 2, "got {} boundaries", merged.len());
    }

    #[test]
    fn semantic_mode_falls_back_via_split() {
        let iter = split("no code here", 100, "notes.txt", SplitMode::Semantic);
        assert!(matches!(iter, ChunkIter::Lines(_)));
    }

    #[test]
    fn python_class_and_methods() {
        let src = "import os\n\nclass Thing:\n    def run(self):\n        pass\n";
        let boundaries = detect_boundaries(src, "python");
        assert!(boundaries.iter().any(|b| b.kind == BoundaryKind::Class));
    }

    #[test]
    fn block_comment_is_one_boundary() {
        let src = "/* first\n   second\n   third */\nfn f() {}\n";
        let boundaries = detect_boundaries(src, "rust");
        let comment = boundaries
            .iter()
            .find(|b| b.kind == BoundaryKind::Comment)
            .unwrap();
        assert!(comment.text.contains("second"));
    }
}
