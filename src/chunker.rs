//! Token-aware chunking.
//!
//! Budgets are counted with the embedding model's own tokenizer. Consecutive
//! chunks share exactly `chunk_overlap` tokens; a window end snaps to a
//! semantic breakpoint (blank line or heading) when one falls within ±10% of
//! the target size. Whitespace-only windows are skipped and indexes
//! renumbered so chunk indexes stay a gap-free prefix.

use regex::Regex;
use std::sync::Arc;
use std::sync::LazyLock;

use crate::embed::tokenize::TokenCounter;
use crate::error::{EngineError, EngineResult};

#[derive(Debug, Clone)]
pub struct TextChunk {
    pub chunk_index: u32,
    pub text: String,
    pub token_count: u32,
}

pub struct Chunker {
    chunk_size: usize,
    chunk_overlap: usize,
    counter: Arc<dyn TokenCounter>,
}

static HEADING_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^#{1,6}\s").expect("static regex"));
static BLANK_LINE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n[ \t]*\n").expect("static regex"));

impl Chunker {
    pub fn new(
        chunk_size: usize,
        chunk_overlap: usize,
        counter: Arc<dyn TokenCounter>,
    ) -> EngineResult<Self> {
        if chunk_size == 0 {
            return Err(EngineError::ConfigValidation("chunk_size must be positive".into()));
        }
        if chunk_overlap >= chunk_size {
            return Err(EngineError::ConfigValidation(format!(
                "chunk_overlap ({chunk_overlap}) must be smaller than chunk_size ({chunk_size})"
            )));
        }
        Ok(Self { chunk_size, chunk_overlap, counter })
    }

    /// Byte offsets where a new semantic unit begins.
    fn breakpoints(text: &str) -> Vec<usize> {
        let mut points: Vec<usize> = HEADING_RE.find_iter(text).map(|m| m.start()).collect();
        points.extend(BLANK_LINE_RE.find_iter(text).map(|m| m.end()));
        points.sort_unstable();
        points.dedup();
        points
    }

    /// Token indexes at which a semantic unit begins (first token starting at
    /// or after each breakpoint byte).
    fn breakpoint_tokens(spans: &[(usize, usize)], breakpoints: &[usize]) -> Vec<usize> {
        let mut out = Vec::with_capacity(breakpoints.len());
        for &bp in breakpoints {
            let idx = spans.partition_point(|&(start, _)| start < bp);
            if idx > 0 && idx < spans.len() {
                out.push(idx);
            }
        }
        out.dedup();
        out
    }

    pub fn chunk(&self, text: &str) -> Vec<TextChunk> {
        let spans = self.counter.token_spans(text);
        let total = spans.len();
        if total == 0 {
            return Vec::new();
        }

        if total <= self.chunk_size {
            let slice = &text[spans[0].0..spans[total - 1].1];
            if slice.trim().is_empty() {
                return Vec::new();
            }
            return vec![TextChunk {
                chunk_index: 0,
                text: slice.to_string(),
                token_count: total as u32,
            }];
        }

        let break_tokens = Self::breakpoint_tokens(&spans, &Self::breakpoints(text));
        let slack = (self.chunk_size / 10).max(1);

        let mut chunks = Vec::new();
        let mut next_index = 0u32;
        let mut start = 0usize;

        loop {
            let target_end = (start + self.chunk_size).min(total);
            let mut end = target_end;

            // Snap to a breakpoint within the ±10% window, preferring the one
            // closest to the target. Never snap past the end of the text or
            // back into the overlap region.
            if target_end < total {
                let lo = target_end.saturating_sub(slack).max(start + 1);
                let hi = (target_end + slack).min(start + self.chunk_size).min(total);
                let candidate = break_tokens
                    .iter()
                    .filter(|&&t| t >= lo && t <= hi)
                    .min_by_key(|&&t| target_end.abs_diff(t));
                if let Some(&t) = candidate {
                    end = t;
                }
            }

            let slice = &text[spans[start].0..spans[end - 1].1];
            if !slice.trim().is_empty() {
                chunks.push(TextChunk {
                    chunk_index: next_index,
                    text: slice.to_string(),
                    token_count: (end - start) as u32,
                });
                next_index += 1;
            }

            if end >= total {
                break;
            }
            // Exact token overlap with the emitted window.
            start = (end - self.chunk_overlap).max(start + 1);
        }

        chunks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embed::tokenize::{whitespace, WhitespaceTokenCounter};

    fn words(n: usize) -> String {
        (0..n).map(|i| format!("w{i}")).collect::<Vec<_>>().join(" ")
    }

    #[test]
    fn rejects_overlap_not_smaller_than_size() {
        assert!(Chunker::new(10, 10, whitespace()).is_err());
        assert!(Chunker::new(0, 0, whitespace()).is_err());
        assert!(Chunker::new(10, 3, whitespace()).is_ok());
    }

    #[test]
    fn short_text_is_one_chunk() {
        let chunker = Chunker::new(100, 10, whitespace()).unwrap();
        let chunks = chunker.chunk("just a few words");
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].chunk_index, 0);
        assert_eq!(chunks[0].token_count, 4);
    }

    #[test]
    fn empty_and_whitespace_only_produce_nothing() {
        let chunker = Chunker::new(100, 10, whitespace()).unwrap();
        assert!(chunker.chunk("").is_empty());
        assert!(chunker.chunk("   \n\t \n ").is_empty());
    }

    #[test]
    fn every_chunk_respects_the_token_budget() {
        let chunker = Chunker::new(50, 10, whitespace()).unwrap();
        let text = words(500);
        let chunks = chunker.chunk(&text);
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.token_count as usize <= 50);
            assert_eq!(
                chunk.token_count as usize,
                WhitespaceTokenCounter.count(&chunk.text)
            );
        }
    }

    #[test]
    fn consecutive_chunks_share_exactly_the_overlap() {
        let chunker = Chunker::new(50, 10, whitespace()).unwrap();
        let text = words(500);
        let chunks = chunker.chunk(&text);

        for pair in chunks.windows(2) {
            let prev: Vec<&str> = pair[0].text.split_whitespace().collect();
            let next: Vec<&str> = pair[1].text.split_whitespace().collect();
            let tail = &prev[prev.len() - 10..];
            let head = &next[..10];
            assert_eq!(tail, head, "overlap region must be the same 10 tokens");
        }
    }

    #[test]
    fn chunk_indexes_are_a_gap_free_prefix() {
        let chunker = Chunker::new(40, 8, whitespace()).unwrap();
        let chunks = chunker.chunk(&words(300));
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.chunk_index as usize, i);
        }
    }

    #[test]
    fn window_snaps_to_a_heading_near_the_target() {
        // 95 filler words, then a heading, then more text: with
        // chunk_size=100 the heading at token 95 is inside the 10% window,
        // so the first chunk ends right before it.
        let text = format!("{}\n\n## Section Two\n{}", words(95), words(50));
        let chunker = Chunker::new(100, 10, whitespace()).unwrap();
        let chunks = chunker.chunk(&text);
        assert!(chunks.len() >= 2);
        assert!(!chunks[0].text.contains("Section"));
        assert!(chunks[1].text.contains("## Section Two"));
    }

    #[test]
    fn coverage_is_complete_no_tokens_dropped() {
        let chunker = Chunker::new(30, 5, whitespace()).unwrap();
        let text = words(200);
        let chunks = chunker.chunk(&text);
        // The last word of the input must appear in the final chunk.
        assert!(chunks.last().unwrap().text.ends_with("w199"));
        // And the first word in the first chunk.
        assert!(chunks[0].text.starts_with("w0"));
    }
}
