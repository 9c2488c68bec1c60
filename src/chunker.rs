//! The Chunker collaborator: a pure function of file bytes + path.
//! Tree-sitter-style code chunking is explicitly out of scope; this module
//! ships the minimal chunker needed to exercise the indexing pipeline end to
//! end, and the [`Chunker`] trait is the seam a richer implementation would
//! plug into.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChunkKind {
    Code,
    Doc,
}

impl ChunkKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Code => "code",
            Self::Doc => "doc",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub chunk_id: String,
    pub file_path: String,
    pub kind: ChunkKind,
    pub content: String,
    pub content_hash: String,
    pub start_line: u32,
    pub end_line: u32,
    pub symbol: Option<String>,
}

pub trait Chunker: Send + Sync {
    fn chunk(&self, file_path: &str, content: &str) -> Vec<Chunk>;
}

/// Splits a file on blank-line runs, bounded by `max_lines` per chunk.
/// `chunk_id` is `blake3(file_path :: start_line)` so it stays stable across
/// re-indexing of an unchanged file.
pub struct LineChunker {
    pub max_lines: usize,
    pub doc_extensions: Vec<String>,
}

impl Default for LineChunker {
    fn default() -> Self {
        Self {
            max_lines: 60,
            doc_extensions: vec!["md".into(), "mdx".into(), "rst".into(), "txt".into()],
        }
    }
}

impl LineChunker {
    fn kind_for(&self, file_path: &str) -> ChunkKind {
        let ext = file_path.rsplit('.').next().unwrap_or("");
        if self.doc_extensions.iter().any(|e| e == ext) {
            ChunkKind::Doc
        } else {
            ChunkKind::Code
        }
    }

    pub fn chunk_id(file_path: &str, start_line: u32) -> String {
        blake3::hash(format!("{file_path}::{start_line}").as_bytes()).to_hex().to_string()
    }
}

impl Chunker for LineChunker {
    fn chunk(&self, file_path: &str, content: &str) -> Vec<Chunk> {
        let kind = self.kind_for(file_path);
        let lines: Vec<&str> = content.lines().collect();
        if lines.is_empty() {
            return Vec::new();
        }

        let mut chunks = Vec::new();
        let mut start = 0usize;
        while start < lines.len() {
            let end = (start + self.max_lines).min(lines.len());
            let body = lines[start..end].join("\n");
            if !body.trim().is_empty() {
                let start_line = (start + 1) as u32;
                let end_line = end as u32;
                chunks.push(Chunk {
                    chunk_id: Self::chunk_id(file_path, start_line),
                    file_path: file_path.to_string(),
                    kind,
                    content_hash: blake3::hash(body.as_bytes()).to_hex().to_string(),
                    content: body,
                    start_line,
                    end_line,
                    symbol: None,
                });
            }
            start = end;
        }
        chunks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_ids_are_stable_for_unchanged_files() {
        let chunker = LineChunker::default();
        let content = "line one\nline two\n";
        let a = chunker.chunk("a.rs", content);
        let b = chunker.chunk("a.rs", content);
        assert_eq!(a.len(), b.len());
        assert_eq!(a[0].chunk_id, b[0].chunk_id);
    }

    #[test]
    fn markdown_extension_yields_doc_kind() {
        let chunker = LineChunker::default();
        let chunks = chunker.chunk("README.md", "hello\nworld\n");
        assert_eq!(chunks[0].kind, ChunkKind::Doc);
    }

    #[test]
    fn splits_long_files_across_chunks() {
        let chunker = LineChunker { max_lines: 2, ..Default::default() };
        let content = "a\nb\nc\nd\ne\n";
        let chunks = chunker.chunk("a.rs", content);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].start_line, 1);
        assert_eq!(chunks[0].end_line, 2);
    }

    #[test]
    fn empty_file_yields_no_chunks() {
        let chunker = LineChunker::default();
        assert!(chunker.chunk("empty.rs", "").is_empty());
    }
}
