//! Token counting for the chunker.
//!
//! The chunker counts with the embedding model's own tokenizer so chunk
//! budgets line up with the model's context window. Backends that ship a
//! HuggingFace tokenizer use [`HfTokenCounter`]; the whitespace counter is
//! the fallback (and what the deterministic test embedder uses).

use std::sync::Arc;
use tokenizers::Tokenizer;
use tracing::warn;

use crate::error::{EngineError, EngineResult};

/// A token span is a byte range into the original text. Spans are
/// non-overlapping and ordered; the chunker slices text with them.
pub trait TokenCounter: Send + Sync {
    fn token_spans(&self, text: &str) -> Vec<(usize, usize)>;

    fn count(&self, text: &str) -> usize {
        self.token_spans(text).len()
    }
}

/// Whitespace-delimited counting. Every non-whitespace run is one token.
pub struct WhitespaceTokenCounter;

impl TokenCounter for WhitespaceTokenCounter {
    fn token_spans(&self, text: &str) -> Vec<(usize, usize)> {
        let mut spans = Vec::new();
        let mut start: Option<usize> = None;
        for (i, ch) in text.char_indices() {
            if ch.is_whitespace() {
                if let Some(s) = start.take() {
                    spans.push((s, i));
                }
            } else if start.is_none() {
                start = Some(i);
            }
        }
        if let Some(s) = start {
            spans.push((s, text.len()));
        }
        spans
    }
}

/// HuggingFace tokenizer wrapper.
pub struct HfTokenCounter {
    tokenizer: Tokenizer,
}

impl HfTokenCounter {
    /// Fetches (or reads from cache) the tokenizer of a Hub repository.
    pub fn from_pretrained(repo: &str) -> EngineResult<Self> {
        let tokenizer = Tokenizer::from_pretrained(repo, None).map_err(|e| {
            EngineError::ModelLoadFailure {
                model: repo.to_string(),
                detail: format!("tokenizer load failed: {e}"),
            }
        })?;
        Ok(Self { tokenizer })
    }

    /// Converts tokenizer offsets to valid byte offsets into `text`.
    /// Tokenizer offsets may be expressed in characters depending on the
    /// pre-tokenizer; anything that is not a char boundary is snapped back.
    fn to_byte_spans(text: &str, offsets: &[(usize, usize)]) -> Vec<(usize, usize)> {
        let char_starts: Vec<usize> = text.char_indices().map(|(i, _)| i).collect();
        let as_byte = |pos: usize| -> usize {
            if pos <= text.len() && text.is_char_boundary(pos) {
                return pos;
            }
            // Treat as a char index.
            char_starts.get(pos).copied().unwrap_or(text.len())
        };

        offsets
            .iter()
            .filter(|(s, e)| e > s)
            .map(|&(s, e)| {
                let mut bs = as_byte(s).min(text.len());
                let mut be = as_byte(e).min(text.len());
                while bs > 0 && !text.is_char_boundary(bs) {
                    bs -= 1;
                }
                while be < text.len() && !text.is_char_boundary(be) {
                    be += 1;
                }
                (bs, be)
            })
            .filter(|(s, e)| e > s)
            .collect()
    }
}

impl TokenCounter for HfTokenCounter {
    fn token_spans(&self, text: &str) -> Vec<(usize, usize)> {
        match self.tokenizer.encode(text, false) {
            Ok(encoding) => Self::to_byte_spans(text, encoding.get_offsets()),
            Err(e) => {
                warn!(error = %e, "tokenizer encode failed, falling back to whitespace counting");
                WhitespaceTokenCounter.token_spans(text)
            }
        }
    }
}

pub fn whitespace() -> Arc<dyn TokenCounter> {
    Arc::new(WhitespaceTokenCounter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whitespace_spans_cover_words_exactly() {
        let text = "one  two\nthree";
        let spans = WhitespaceTokenCounter.token_spans(text);
        let words: Vec<&str> = spans.iter().map(|&(s, e)| &text[s..e]).collect();
        assert_eq!(words, vec!["one", "two", "three"]);
        assert_eq!(WhitespaceTokenCounter.count(text), 3);
    }

    #[test]
    fn whitespace_only_text_has_no_tokens() {
        assert_eq!(WhitespaceTokenCounter.count("  \n\t  "), 0);
        assert_eq!(WhitespaceTokenCounter.count(""), 0);
    }

    #[test]
    fn byte_span_snapping_respects_char_boundaries() {
        let text = "héllo wörld";
        // Offsets expressed as char indices (what some pre-tokenizers emit).
        let spans = HfTokenCounter::to_byte_spans(text, &[(0, 5), (6, 11)]);
        for &(s, e) in &spans {
            assert!(text.is_char_boundary(s));
            assert!(text.is_char_boundary(e));
        }
        let joined: Vec<&str> = spans.iter().map(|&(s, e)| &text[s..e]).collect();
        assert_eq!(joined.len(), 2);
        assert!(joined[0].starts_with('h'));
    }
}
