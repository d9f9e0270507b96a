//! Token-bounded, overlapping text chunker.
//!
//! Splits document text into [`Chunk`]s of at most `target_tokens` tokens.
//! Consecutive chunks share `floor(overlap_fraction * target_tokens)` tokens
//! so that context spanning a boundary is present in both neighbours.
//!
//! A token is a Unicode word-boundary segment (UAX #29) that is not pure
//! whitespace. Each chunk's text is the exact source substring from its
//! first token's start to its last token's end; offsets are in characters.
//!
//! Each chunk receives a deterministic UUID derived from its document ID
//! and chunk number, plus a SHA-256 hash of its text.

use sha2::{Digest, Sha256};
use unicode_segmentation::UnicodeSegmentation;
use uuid::Uuid;

use crate::config::DocumentsConfig;
use crate::error::{RagError, Result, Stage};
use crate::models::Chunk;

/// Upper bound (exclusive) on the overlap fraction.
pub const MAX_OVERLAP_FRACTION: f64 = 0.9;

/// Chunking parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChunkParams {
    pub target_tokens: usize,
    pub overlap_fraction: f64,
}

impl ChunkParams {
    pub fn new(target_tokens: usize, overlap_fraction: f64) -> Self {
        Self {
            target_tokens,
            overlap_fraction,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.target_tokens == 0 {
            return Err(RagError::validation(
                Stage::Chunk,
                "target_tokens must be greater than zero",
            ));
        }
        if !(0.0..MAX_OVERLAP_FRACTION).contains(&self.overlap_fraction) {
            return Err(RagError::validation(
                Stage::Chunk,
                format!(
                    "overlap_fraction must be in [0, {}), got {}",
                    MAX_OVERLAP_FRACTION, self.overlap_fraction
                ),
            ));
        }
        Ok(())
    }

    /// Number of tokens shared by consecutive chunks.
    pub fn overlap_tokens(&self) -> usize {
        (self.overlap_fraction * self.target_tokens as f64).floor() as usize
    }
}

impl From<&DocumentsConfig> for ChunkParams {
    fn from(config: &DocumentsConfig) -> Self {
        Self::new(config.chunk_size, config.overlap_fraction())
    }
}

#[derive(Debug, Clone, Copy)]
struct Token {
    byte_start: usize,
    byte_end: usize,
    char_start: usize,
    char_end: usize,
}

fn tokenize(text: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut byte_pos = 0;
    let mut char_pos = 0;

    for (start, segment) in text.split_word_bound_indices() {
        char_pos += text[byte_pos..start].chars().count();
        byte_pos = start;
        let len_chars = segment.chars().count();

        if !segment.chars().all(char::is_whitespace) {
            tokens.push(Token {
                byte_start: start,
                byte_end: start + segment.len(),
                char_start: char_pos,
                char_end: char_pos + len_chars,
            });
        }

        byte_pos = start + segment.len();
        char_pos += len_chars;
    }

    tokens
}

/// Count tokens in `text` using the chunker's tokenisation.
pub fn count_tokens(text: &str) -> usize {
    tokenize(text).len()
}

/// Split text into overlapping chunks.
/// Returns chunks with contiguous chunk numbers starting at 0.
pub fn chunk_text(document_id: &str, text: &str, params: ChunkParams) -> Result<Vec<Chunk>> {
    chunk_text_with_progress(document_id, text, params, |_| {})
}

/// Like [`chunk_text`], reporting the fraction of tokens consumed after
/// every emitted chunk. The fraction never decreases and is 1.0 exactly
/// once, after the last chunk.
pub fn chunk_text_with_progress(
    document_id: &str,
    text: &str,
    params: ChunkParams,
    mut progress: impl FnMut(f64),
) -> Result<Vec<Chunk>> {
    params.validate()?;

    let tokens = tokenize(text);
    if tokens.is_empty() {
        return Err(RagError::validation(
            Stage::Chunk,
            "text is empty or contains only whitespace",
        ));
    }

    let total = tokens.len();
    let overlap = params.overlap_tokens();
    let mut chunks = Vec::with_capacity(total / params.target_tokens.max(1) + 1);
    let mut start = 0;

    loop {
        let end = (start + params.target_tokens).min(total);
        chunks.push(make_chunk(
            document_id,
            chunks.len() as i64,
            text,
            &tokens[start..end],
        ));

        if end == total {
            progress(1.0);
            break;
        }
        progress(end as f64 / total as f64);

        // overlap < target_tokens, so the cursor always moves forward
        start = end.saturating_sub(overlap).max(start + 1);
    }

    Ok(chunks)
}

fn make_chunk(document_id: &str, number: i64, text: &str, tokens: &[Token]) -> Chunk {
    let first = tokens[0];
    let last = tokens[tokens.len() - 1];
    let body = &text[first.byte_start..last.byte_end];

    let mut hasher = Sha256::new();
    hasher.update(body.as_bytes());
    let hash = format!("{:x}", hasher.finalize());

    Chunk {
        id: chunk_id(document_id, number),
        document_id: document_id.to_string(),
        chunk_number: number,
        text: body.to_string(),
        token_count: tokens.len(),
        start_offset: first.char_start,
        end_offset: last.char_end,
        hash,
    }
}

/// Deterministic chunk id for `(document_id, chunk_number)`.
pub fn chunk_id(document_id: &str, chunk_number: i64) -> String {
    let name = format!("{}:{}", document_id, chunk_number);
    Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn words(n: usize) -> String {
        (0..n)
            .map(|i| format!("w{}", i))
            .collect::<Vec<_>>()
            .join(" ")
    }

    #[test]
    fn test_short_text_single_chunk_single_iteration() {
        let mut calls = Vec::new();
        let chunks = chunk_text_with_progress(
            "doc1",
            "Hello there world",
            ChunkParams::new(10, 0.1),
            |p| calls.push(p),
        )
        .unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].chunk_number, 0);
        assert_eq!(chunks[0].text, "Hello there world");
        assert_eq!(chunks[0].token_count, 3);
        assert_eq!(calls, vec![1.0]);
    }

    #[test]
    fn test_empty_and_whitespace_are_rejected() {
        for text in ["", "   \n\t  "] {
            let err = chunk_text("doc1", text, ChunkParams::new(10, 0.1)).unwrap_err();
            assert!(matches!(
                err,
                RagError::Validation {
                    stage: Stage::Chunk,
                    ..
                }
            ));
        }
    }

    #[test]
    fn test_invalid_params_are_rejected() {
        assert!(chunk_text("doc1", "abc", ChunkParams::new(0, 0.1)).is_err());
        assert!(chunk_text("doc1", "abc", ChunkParams::new(10, 0.9)).is_err());
        assert!(chunk_text("doc1", "abc", ChunkParams::new(10, -0.1)).is_err());
    }

    #[test]
    fn test_overlap_between_consecutive_chunks() {
        // 25 tokens, target 10, overlap 2 -> starts at 0, 8, 16
        let text = words(25);
        let chunks = chunk_text("doc1", &text, ChunkParams::new(10, 0.2)).unwrap();
        assert_eq!(chunks.len(), 3);
        assert!(chunks[0].text.starts_with("w0 "));
        assert!(chunks[0].text.ends_with(" w9"));
        assert!(chunks[1].text.starts_with("w8 "));
        assert!(chunks[2].text.starts_with("w16 "));
        assert!(chunks[2].text.ends_with(" w24"));
        assert_eq!(chunks[2].token_count, 9);
    }

    #[test]
    fn test_no_overlap_is_a_partition() {
        let text = words(30);
        let chunks = chunk_text("doc1", &text, ChunkParams::new(10, 0.0)).unwrap();
        assert_eq!(chunks.len(), 3);
        let total: usize = chunks.iter().map(|c| c.token_count).sum();
        assert_eq!(total, 30);
    }

    #[test]
    fn test_high_overlap_small_target_terminates() {
        // target 1 -> overlap floor(0.89) = 0; target 2 -> overlap 1
        let text = words(50);
        let one = chunk_text("doc1", &text, ChunkParams::new(1, 0.89)).unwrap();
        assert_eq!(one.len(), 50);
        let two = chunk_text("doc1", &text, ChunkParams::new(2, 0.89)).unwrap();
        assert_eq!(two.len(), 49);
    }

    #[test]
    fn test_offsets_are_characters_and_reproduce_text() {
        let text = "Grüße aus Köln. Ünïcödé wörds everywhere, naïve café.";
        let chunks = chunk_text("doc1", text, ChunkParams::new(4, 0.25)).unwrap();
        let chars: Vec<char> = text.chars().collect();
        for c in &chunks {
            let span: String = chars[c.start_offset..c.end_offset].iter().collect();
            assert_eq!(span, c.text);
            assert_eq!(c.char_count(), c.text.chars().count());
        }
    }

    #[test]
    fn test_ids_are_deterministic() {
        let a = chunk_text("doc1", &words(30), ChunkParams::new(10, 0.1)).unwrap();
        let b = chunk_text("doc1", &words(30), ChunkParams::new(10, 0.1)).unwrap();
        assert_eq!(a[1].id, b[1].id);
        assert_eq!(a[1].id, chunk_id("doc1", 1));
        assert_ne!(chunk_id("doc1", 1), chunk_id("doc2", 1));
    }

    #[test]
    fn test_hash_tracks_text() {
        let chunks = chunk_text("doc1", "same same", ChunkParams::new(1, 0.0)).unwrap();
        assert_eq!(chunks[0].hash, chunks[1].hash);
        assert_eq!(chunks[0].hash.len(), 64);
    }

    #[test]
    fn test_punctuation_counts_as_tokens() {
        assert_eq!(count_tokens("Hello, world!"), 4);
        assert_eq!(count_tokens("  "), 0);
    }

    proptest! {
        #[test]
        fn prop_chunks_are_bounded_contiguous_and_overlapping(
            n in 1usize..300,
            target in 1usize..40,
            overlap in 0.0f64..0.89,
        ) {
            let text = words(n);
            let params = ChunkParams::new(target, overlap);
            let mut last = 0.0;
            let mut finals = 0;
            let chunks = chunk_text_with_progress("doc", &text, params, |p| {
                assert!(p >= last);
                last = p;
                if p == 1.0 {
                    finals += 1;
                }
            })
            .unwrap();

            prop_assert_eq!(finals, 1);
            prop_assert!(!chunks.is_empty());
            if n <= target {
                prop_assert_eq!(chunks.len(), 1);
            }

            let shared = params.overlap_tokens();
            for (i, c) in chunks.iter().enumerate() {
                prop_assert_eq!(c.chunk_number, i as i64);
                prop_assert!(c.token_count <= target);
                prop_assert!(c.token_count >= 1);
            }
            for pair in chunks.windows(2) {
                let a = &pair[0];
                let b = &pair[1];
                prop_assert!(b.start_offset > a.start_offset);
                prop_assert!(b.start_offset <= a.end_offset + 1);
                let common = count_tokens(&text[b.start_offset..a.end_offset.max(b.start_offset)]);
                prop_assert_eq!(common, shared.min(a.token_count - 1));
            }
            prop_assert_eq!(chunks[0].start_offset, 0);
            prop_assert_eq!(chunks.last().unwrap().end_offset, text.chars().count());
        }
    }
}
