//! Document chunkers.
//!
//! A chunker splits loaded documents into embedding-sized pieces and emits
//! them in batches of at most `batch_size`, with a final possibly-smaller
//! batch. Chunk ids are `<parent_id>_<n>` so they are stable for a given
//! (document, chunker config); chunk metadata copies the parent's and mirrors
//! the chunk content under the `text` key.
//!
//! Two strategies:
//! - **[`RecursiveChunker`]** (default) — splits on an ordered separator list
//!   (`"\n\n"`, `"\n"`, `" "`, `""`), recursing to finer separators until
//!   every piece fits `chunk_size`, then merges adjacent pieces back up with
//!   up to `chunk_overlap` characters of overlap.
//! - **[`CharacterChunker`]** — fixed-size character windows with optional
//!   overlap.
//!
//! Lengths are measured in characters, not bytes, so multi-byte text never
//! splits inside a code point.

use crate::models::{Metadata, RagDocument, METADATA_TEXT_KEY};

/// Default separators, coarsest first. The empty separator is the terminal
/// hard-split level.
pub fn default_separators() -> Vec<String> {
    vec![
        "\n\n".to_string(),
        "\n".to_string(),
        " ".to_string(),
        String::new(),
    ]
}

/// Splits documents into batches of chunks.
pub trait Chunker: std::fmt::Debug + Send + Sync {
    /// Chunker name as referenced in file metadata (`chunker_name`).
    fn name(&self) -> &str;

    /// Split `documents` into chunk batches. Every batch except possibly the
    /// last holds exactly `batch_size` chunks.
    fn chunk(&self, documents: &[RagDocument]) -> Vec<Vec<RagDocument>>;
}

/// Build one chunk document from its parent.
fn make_chunk(parent: &RagDocument, index: usize, content: &str) -> RagDocument {
    let mut metadata: Metadata = parent.metadata.clone();
    metadata.insert(
        METADATA_TEXT_KEY.to_string(),
        serde_json::Value::String(content.to_string()),
    );
    RagDocument::new(format!("{}_{}", parent.id, index), content, metadata)
}

/// Accumulate per-document chunk texts into fixed-size batches.
fn into_batches(
    documents: &[RagDocument],
    batch_size: usize,
    split: impl Fn(&str) -> Vec<String>,
) -> Vec<Vec<RagDocument>> {
    let mut batches = Vec::new();
    let mut pending: Vec<RagDocument> = Vec::new();

    for doc in documents {
        for (i, piece) in split(&doc.content).iter().enumerate() {
            pending.push(make_chunk(doc, i, piece));
            if pending.len() == batch_size {
                batches.push(std::mem::take(&mut pending));
            }
        }
    }

    if !pending.is_empty() {
        batches.push(pending);
    }
    batches
}

// ═══════════════════════════════════════════════════════════════════════
// Recursive chunker
// ═══════════════════════════════════════════════════════════════════════

/// Separator-aware recursive chunker.
#[derive(Debug, Clone)]
pub struct RecursiveChunker {
    chunk_size: usize,
    chunk_overlap: usize,
    batch_size: usize,
    separators: Vec<String>,
}

impl Default for RecursiveChunker {
    fn default() -> Self {
        Self {
            chunk_size: 500,
            chunk_overlap: 0,
            batch_size: 1000,
            separators: default_separators(),
        }
    }
}

impl RecursiveChunker {
    /// Create a chunker. Fails when `chunk_size` is zero or the overlap is
    /// not strictly smaller than the chunk size.
    pub fn new(chunk_size: usize, chunk_overlap: usize, batch_size: usize) -> anyhow::Result<Self> {
        if chunk_size == 0 {
            anyhow::bail!("chunk_size must be > 0");
        }
        if chunk_overlap >= chunk_size {
            anyhow::bail!("chunk_overlap must be smaller than chunk_size");
        }
        if batch_size == 0 {
            anyhow::bail!("batch_size must be > 0");
        }
        Ok(Self {
            chunk_size,
            chunk_overlap,
            batch_size,
            separators: default_separators(),
        })
    }

    /// Split one text into chunk strings.
    pub fn split_text(&self, text: &str) -> Vec<String> {
        if text.trim().is_empty() {
            return vec![text.to_string()];
        }
        self.split_with(text, &self.separators)
    }

    fn split_with(&self, text: &str, separators: &[String]) -> Vec<String> {
        if char_len(text) <= self.chunk_size {
            return vec![text.to_string()];
        }

        // Highest-priority separator that actually occurs; the empty
        // separator is the terminal hard split.
        let mut sep = String::new();
        let mut remaining: &[String] = &[];
        for (i, candidate) in separators.iter().enumerate() {
            if candidate.is_empty() || text.contains(candidate.as_str()) {
                sep = candidate.clone();
                remaining = &separators[i + 1..];
                break;
            }
        }

        if sep.is_empty() {
            return window_split(text, self.chunk_size, self.chunk_overlap);
        }

        let mut pieces: Vec<String> = Vec::new();
        for part in text.split(sep.as_str()) {
            if part.is_empty() {
                continue;
            }
            if char_len(part) > self.chunk_size {
                pieces.extend(self.split_with(part, remaining));
            } else {
                pieces.push(part.to_string());
            }
        }

        merge_pieces(pieces, &sep, self.chunk_size, self.chunk_overlap)
    }
}

impl Chunker for RecursiveChunker {
    fn name(&self) -> &str {
        "recursive"
    }

    fn chunk(&self, documents: &[RagDocument]) -> Vec<Vec<RagDocument>> {
        into_batches(documents, self.batch_size, |text| self.split_text(text))
    }
}

/// Merge adjacent pieces back into chunks of at most `chunk_size` characters,
/// carrying up to `overlap` trailing characters into the next chunk.
fn merge_pieces(pieces: Vec<String>, sep: &str, chunk_size: usize, overlap: usize) -> Vec<String> {
    let sep_len = char_len(sep);
    let mut chunks: Vec<String> = Vec::new();
    let mut current: Vec<String> = Vec::new();

    let joined_len = |parts: &[String]| -> usize {
        if parts.is_empty() {
            return 0;
        }
        parts.iter().map(|p| char_len(p)).sum::<usize>() + sep_len * (parts.len() - 1)
    };

    for piece in pieces {
        let piece_len = char_len(&piece);
        let extra = if current.is_empty() {
            piece_len
        } else {
            piece_len + sep_len
        };

        if joined_len(&current) + extra > chunk_size && !current.is_empty() {
            chunks.push(current.join(sep));

            // Drop leading pieces until only the overlap tail remains and the
            // incoming piece fits again.
            while !current.is_empty()
                && (joined_len(&current) > overlap
                    || joined_len(&current) + piece_len + sep_len > chunk_size)
            {
                current.remove(0);
            }
        }

        current.push(piece);
    }

    if !current.is_empty() {
        let tail = current.join(sep);
        // The overlap tail alone is not a chunk.
        if chunks.last().map(|prev| !prev.ends_with(&tail)).unwrap_or(true) {
            chunks.push(tail);
        }
    }
    chunks
}

/// Hard character windows with overlap: the terminal split level.
fn window_split(text: &str, size: usize, overlap: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    let step = size.saturating_sub(overlap).max(1);
    let mut out = Vec::new();
    let mut start = 0;
    while start < chars.len() {
        let end = (start + size).min(chars.len());
        out.push(chars[start..end].iter().collect());
        if end == chars.len() {
            break;
        }
        start += step;
    }
    out
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

// ═══════════════════════════════════════════════════════════════════════
// Character chunker
// ═══════════════════════════════════════════════════════════════════════

/// Fixed-size window chunker with optional overlap.
#[derive(Debug, Clone)]
pub struct CharacterChunker {
    chunk_size: usize,
    chunk_overlap: usize,
    batch_size: usize,
}

impl CharacterChunker {
    pub fn new(chunk_size: usize, chunk_overlap: usize, batch_size: usize) -> anyhow::Result<Self> {
        if chunk_size == 0 {
            anyhow::bail!("chunk_size must be > 0");
        }
        if chunk_overlap >= chunk_size {
            anyhow::bail!("chunk_overlap must be smaller than chunk_size");
        }
        if batch_size == 0 {
            anyhow::bail!("batch_size must be > 0");
        }
        Ok(Self {
            chunk_size,
            chunk_overlap,
            batch_size,
        })
    }
}

impl Chunker for CharacterChunker {
    fn name(&self) -> &str {
        "character"
    }

    fn chunk(&self, documents: &[RagDocument]) -> Vec<Vec<RagDocument>> {
        into_batches(documents, self.batch_size, |text| {
            if text.is_empty() {
                vec![String::new()]
            } else {
                window_split(text, self.chunk_size, self.chunk_overlap)
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Metadata;

    fn doc(id: &str, content: &str) -> RagDocument {
        RagDocument::new(id, content, Metadata::new())
    }

    #[test]
    fn test_small_text_single_chunk() {
        let chunker = RecursiveChunker::new(500, 0, 1000).unwrap();
        let batches = chunker.chunk(&[doc("d1", "Hello, world!")]);
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 1);
        assert_eq!(batches[0][0].id, "d1_0");
        assert_eq!(batches[0][0].content, "Hello, world!");
    }

    #[test]
    fn test_chunk_metadata_mirrors_text() {
        let mut metadata = Metadata::new();
        metadata.insert("origin".to_string(), serde_json::json!("s3"));
        let parent = RagDocument::new("d1", "alpha beta", metadata);
        let chunker = RecursiveChunker::default();
        let batches = chunker.chunk(&[parent]);
        let chunk = &batches[0][0];
        assert_eq!(chunk.metadata["origin"], serde_json::json!("s3"));
        assert_eq!(chunk.metadata["text"], serde_json::json!("alpha beta"));
    }

    #[test]
    fn test_no_chunk_exceeds_size_plus_overlap() {
        let chunk_size = 50;
        let overlap = 10;
        let chunker = RecursiveChunker::new(chunk_size, overlap, 1000).unwrap();
        let text = "The quick brown fox jumps over the lazy dog. ".repeat(40);
        for piece in chunker.split_text(&text) {
            assert!(
                piece.chars().count() <= chunk_size + overlap,
                "chunk too long: {} chars",
                piece.chars().count()
            );
        }
    }

    #[test]
    fn test_adjacent_overlap_bounded() {
        let overlap = 8;
        let chunker = RecursiveChunker::new(40, overlap, 1000).unwrap();
        // Distinct words so a shared suffix/prefix can only come from the
        // overlap carry, not from repetition in the text itself.
        let text = (0..100)
            .map(|i| format!("tok{:03}", i))
            .collect::<Vec<_>>()
            .join(" ");
        let pieces = chunker.split_text(&text);
        for pair in pieces.windows(2) {
            let a: Vec<char> = pair[0].chars().collect();
            let b: Vec<char> = pair[1].chars().collect();
            // longest suffix of a that is a prefix of b
            let max_shared = (0..=a.len().min(b.len()))
                .rev()
                .find(|&n| a[a.len() - n..] == b[..n])
                .unwrap_or(0);
            assert!(
                max_shared <= overlap,
                "adjacent chunks share {} chars, overlap budget {}",
                max_shared,
                overlap
            );
        }
    }

    #[test]
    fn test_oversized_word_hard_splits() {
        let chunker = RecursiveChunker::new(10, 0, 1000).unwrap();
        let text = "a".repeat(35);
        let pieces = chunker.split_text(&text);
        assert_eq!(pieces.len(), 4);
        assert!(pieces.iter().all(|p| p.chars().count() <= 10));
        assert_eq!(pieces.concat(), text);
    }

    #[test]
    fn test_batches_respect_batch_size() {
        let chunker = RecursiveChunker::new(10, 0, 3).unwrap();
        let text = (0..10)
            .map(|i| format!("para{}", i))
            .collect::<Vec<_>>()
            .join("\n\n");
        let batches = chunker.chunk(&[doc("d1", &text)]);
        assert!(batches.len() > 1);
        for batch in &batches[..batches.len() - 1] {
            assert_eq!(batch.len(), 3);
        }
        assert!(batches.last().unwrap().len() <= 3);
    }

    #[test]
    fn test_chunk_ids_stable_across_runs() {
        let chunker = RecursiveChunker::new(20, 5, 1000).unwrap();
        let text = "one two three four five six seven eight nine ten";
        let first = chunker.chunk(&[doc("d1", text)]);
        let second = chunker.chunk(&[doc("d1", text)]);
        let ids =
            |batches: &[Vec<RagDocument>]| -> Vec<String> {
                batches.iter().flatten().map(|c| c.id.clone()).collect()
            };
        assert_eq!(ids(&first), ids(&second));
        assert_eq!(ids(&first)[0], "d1_0");
    }

    #[test]
    fn test_empty_document_yields_one_chunk() {
        let chunker = RecursiveChunker::default();
        let batches = chunker.chunk(&[doc("d1", "")]);
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 1);
        assert_eq!(batches[0][0].id, "d1_0");
    }

    #[test]
    fn test_invalid_config_rejected() {
        assert!(RecursiveChunker::new(0, 0, 100).is_err());
        assert!(RecursiveChunker::new(100, 100, 100).is_err());
        assert!(RecursiveChunker::new(100, 0, 0).is_err());
        assert!(CharacterChunker::new(0, 0, 100).is_err());
    }

    #[test]
    fn test_character_chunker_windows() {
        let chunker = CharacterChunker::new(4, 1, 1000).unwrap();
        let batches = chunker.chunk(&[doc("d1", "abcdefgh")]);
        let contents: Vec<&str> = batches[0].iter().map(|c| c.content.as_str()).collect();
        assert_eq!(contents, vec!["abcd", "defg", "gh"]);
    }

    #[test]
    fn test_multibyte_text_never_panics() {
        let chunker = RecursiveChunker::new(5, 2, 1000).unwrap();
        let text = "日本語のテキストを分割する".repeat(4);
        let pieces = chunker.split_text(&text);
        assert!(!pieces.is_empty());
        for piece in pieces {
            assert!(piece.chars().count() <= 7);
        }
    }
}
