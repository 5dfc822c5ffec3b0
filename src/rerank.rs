//! Pluggable reranking over search candidates.
//!
//! A strategy scores candidates in `[0, 1]` without reordering them; the
//! search pipeline owns the final sort. When a strategy produces
//! near-degenerate variance (all scores within a hair of each other), the
//! deterministic lexical scorer takes over so the ordering stays useful;
//! that fallback is part of the contract, not an implementation detail.

use chrono::{DateTime, Utc};
use fastembed::{RerankInitOptions, RerankerModel, TextRerank};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use crate::embed::Loader;
use crate::error::{EngineError, EngineResult};
use crate::types::{ContentKind, RerankStrategy};

/// Score range below which a strategy's output is considered degenerate.
const DEGENERATE_RANGE: f32 = 1e-3;

/// A search candidate as the reranker sees it.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub text: String,
    /// `1 - cosine_distance`, clamped to `[0, 1]`.
    pub vector_score: f32,
    pub doc_id: i64,
    pub chunk_index: u32,
    pub content_type: ContentKind,
    pub source: String,
    pub doc_created_at: DateTime<Utc>,
}

pub trait Reranker: Send + Sync {
    fn name(&self) -> &'static str;

    /// Returns one score per candidate, aligned with the input order.
    fn score(&self, query: &str, candidates: &[Candidate]) -> EngineResult<Vec<f32>>;

    /// Releases any loaded model. Default: nothing to release.
    fn cleanup(&self) {}
}

/// Deterministic lexical overlap score: fraction of query tokens present in
/// the candidate, dampened by the vector score for stable tie-breaks.
pub fn lexical_scores(query: &str, candidates: &[Candidate]) -> Vec<f32> {
    let query_tokens: HashSet<String> = tokenize_lower(query).collect();
    candidates
        .iter()
        .map(|c| {
            if query_tokens.is_empty() {
                return c.vector_score.clamp(0.0, 1.0);
            }
            let candidate_tokens: HashSet<String> = tokenize_lower(&c.text).collect();
            let overlap = query_tokens.intersection(&candidate_tokens).count() as f32;
            let lexical = overlap / query_tokens.len() as f32;
            (0.8 * lexical + 0.2 * c.vector_score).clamp(0.0, 1.0)
        })
        .collect()
}

fn tokenize_lower(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
}

fn score_range(scores: &[f32]) -> f32 {
    let mut min = f32::INFINITY;
    let mut max = f32::NEG_INFINITY;
    for &s in scores {
        min = min.min(s);
        max = max.max(s);
    }
    if scores.is_empty() { 0.0 } else { max - min }
}

/// Runs a strategy and applies the degenerate-variance fallback.
pub fn rerank_with_fallback(
    reranker: &dyn Reranker,
    query: &str,
    candidates: &[Candidate],
) -> EngineResult<Vec<f32>> {
    if candidates.is_empty() {
        return Ok(Vec::new());
    }
    let scores = reranker.score(query, candidates)?;
    debug_assert_eq!(scores.len(), candidates.len());

    if candidates.len() > 1 && score_range(&scores) < DEGENERATE_RANGE {
        warn!(
            strategy = reranker.name(),
            range = score_range(&scores),
            "degenerate rerank scores, falling back to lexical ordering"
        );
        return Ok(lexical_scores(query, candidates));
    }
    Ok(scores)
}

// ---------------------------------------------------------------------------
// Strategies
// ---------------------------------------------------------------------------

/// Pass-through: the vector score is the score.
pub struct DisabledReranker;

impl Reranker for DisabledReranker {
    fn name(&self) -> &'static str {
        "disabled"
    }

    fn score(&self, _query: &str, candidates: &[Candidate]) -> EngineResult<Vec<f32>> {
        Ok(candidates.iter().map(|c| c.vector_score.clamp(0.0, 1.0)).collect())
    }
}

/// Cross-encoder scoring of `(query, candidate)` pairs via a secondary
/// model. Raw logits squash through a sigmoid into `[0, 1]`.
pub struct CrossEncoderReranker {
    cache_dir: PathBuf,
    loader: Loader<Mutex<TextRerank>>,
}

impl CrossEncoderReranker {
    pub fn new(cache_dir: PathBuf) -> Self {
        Self { cache_dir, loader: Loader::new() }
    }

    fn ensure_model(&self) -> EngineResult<Arc<Mutex<TextRerank>>> {
        self.loader.get_or_load("jina-reranker-v1-turbo-en", || {
            info!("loading cross-encoder reranking model");
            let options = RerankInitOptions::new(RerankerModel::JINARerankerV1TurboEn)
                .with_cache_dir(self.cache_dir.clone())
                .with_show_download_progress(false);
            let model = TextRerank::try_new(options).map_err(|e| {
                EngineError::ModelLoadFailure {
                    model: "jina-reranker-v1-turbo-en".to_string(),
                    detail: e.to_string(),
                }
            })?;
            Ok(Mutex::new(model))
        })
    }

    pub fn is_loaded(&self) -> bool {
        self.loader.is_loaded()
    }
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

impl Reranker for CrossEncoderReranker {
    fn name(&self) -> &'static str {
        "cross-encoder"
    }

    fn score(&self, query: &str, candidates: &[Candidate]) -> EngineResult<Vec<f32>> {
        let model = self.ensure_model()?;
        let documents: Vec<&str> = candidates.iter().map(|c| c.text.as_str()).collect();

        let mut guard = model.lock();
        let ranked = guard
            .rerank(query, documents, false, None)
            .map_err(|e| EngineError::TransientEmbedFailure(format!("rerank failed: {e}")))?;

        // Results come back sorted by relevance; realign to input order.
        let mut scores = vec![0.0f32; candidates.len()];
        for item in ranked {
            if let Some(slot) = scores.get_mut(item.index) {
                *slot = sigmoid(item.score);
            }
        }
        Ok(scores)
    }

    fn cleanup(&self) {
        self.loader.unload();
    }
}

/// Re-scores multimodal candidates through their textual proxies (captions,
/// alt text, sibling text) blended with the vector score.
pub struct TextDerivedReranker;

impl Reranker for TextDerivedReranker {
    fn name(&self) -> &'static str {
        "text-derived"
    }

    fn score(&self, query: &str, candidates: &[Candidate]) -> EngineResult<Vec<f32>> {
        let lexical = lexical_scores(query, candidates);
        Ok(candidates
            .iter()
            .zip(lexical)
            .map(|(c, lex)| {
                // Image candidates lean on their textual proxy; text
                // candidates keep more of the vector signal.
                let weight = if c.content_type == ContentKind::Image { 0.7 } else { 0.4 };
                (weight * lex + (1.0 - weight) * c.vector_score).clamp(0.0, 1.0)
            })
            .collect())
    }
}

/// Scores by non-vector features: document recency and source priority.
pub struct MetadataReranker {
    /// Sources matching any of these prefixes rank above the rest.
    pub priority_prefixes: Vec<String>,
}

impl MetadataReranker {
    pub fn new(priority_prefixes: Vec<String>) -> Self {
        Self { priority_prefixes }
    }

    fn recency_score(created_at: DateTime<Utc>) -> f32 {
        let age_days = (Utc::now() - created_at).num_days().max(0) as f32;
        // Half-life of thirty days.
        (0.5f32).powf(age_days / 30.0)
    }
}

impl Reranker for MetadataReranker {
    fn name(&self) -> &'static str {
        "metadata"
    }

    fn score(&self, _query: &str, candidates: &[Candidate]) -> EngineResult<Vec<f32>> {
        Ok(candidates
            .iter()
            .map(|c| {
                let recency = Self::recency_score(c.doc_created_at);
                let priority = if self
                    .priority_prefixes
                    .iter()
                    .any(|p| c.source.starts_with(p.as_str()))
                {
                    1.0
                } else {
                    0.0
                };
                (0.6 * recency + 0.3 * priority + 0.1 * c.vector_score).clamp(0.0, 1.0)
            })
            .collect())
    }
}

/// Weighted composition of the other strategies.
pub struct HybridReranker {
    cross_encoder: CrossEncoderReranker,
    metadata: MetadataReranker,
}

impl HybridReranker {
    pub fn new(cache_dir: PathBuf) -> Self {
        Self {
            cross_encoder: CrossEncoderReranker::new(cache_dir),
            metadata: MetadataReranker::new(Vec::new()),
        }
    }
}

impl Reranker for HybridReranker {
    fn name(&self) -> &'static str {
        "hybrid"
    }

    fn score(&self, query: &str, candidates: &[Candidate]) -> EngineResult<Vec<f32>> {
        // The cross-encoder is the primary signal; when it cannot load the
        // lexical scorer stands in so hybrid still works offline.
        let primary = match self.cross_encoder.score(query, candidates) {
            Ok(scores) => scores,
            Err(e) => {
                warn!(error = %e, "hybrid reranker: cross-encoder unavailable, using lexical signal");
                lexical_scores(query, candidates)
            }
        };
        let meta = self.metadata.score(query, candidates)?;

        Ok(primary
            .iter()
            .zip(meta)
            .zip(candidates)
            .map(|((p, m), c)| (0.6 * p + 0.2 * m + 0.2 * c.vector_score).clamp(0.0, 1.0))
            .collect())
    }

    fn cleanup(&self) {
        self.cross_encoder.cleanup();
    }
}

/// Builds the reranker for a strategy. `cache_dir` holds reranking model
/// weights alongside the embedding caches.
pub fn build_reranker(strategy: RerankStrategy, cache_dir: PathBuf) -> Arc<dyn Reranker> {
    match strategy {
        RerankStrategy::CrossEncoder => Arc::new(CrossEncoderReranker::new(cache_dir)),
        RerankStrategy::TextDerived => Arc::new(TextDerivedReranker),
        RerankStrategy::Metadata => Arc::new(MetadataReranker::new(Vec::new())),
        RerankStrategy::Hybrid => Arc::new(HybridReranker::new(cache_dir)),
        RerankStrategy::Disabled => Arc::new(DisabledReranker),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(text: &str, vector_score: f32) -> Candidate {
        Candidate {
            text: text.to_string(),
            vector_score,
            doc_id: 1,
            chunk_index: 0,
            content_type: ContentKind::Text,
            source: "docs/a.md".into(),
            doc_created_at: Utc::now(),
        }
    }

    #[test]
    fn disabled_strategy_passes_vector_scores_through() {
        let candidates = vec![candidate("a", 0.9), candidate("b", 0.3)];
        let scores = DisabledReranker.score("query", &candidates).unwrap();
        assert_eq!(scores, vec![0.9, 0.3]);
    }

    #[test]
    fn lexical_scorer_prefers_overlapping_text() {
        let candidates = vec![
            candidate("rust borrow checker rules", 0.5),
            candidate("gardening in spring", 0.5),
        ];
        let scores = lexical_scores("borrow checker", &candidates);
        assert!(scores[0] > scores[1]);
        assert!(scores.iter().all(|s| (0.0..=1.0).contains(s)));
    }

    #[test]
    fn degenerate_scores_fall_back_to_lexical() {
        struct FlatReranker;
        impl Reranker for FlatReranker {
            fn name(&self) -> &'static str {
                "flat"
            }
            fn score(&self, _q: &str, c: &[Candidate]) -> EngineResult<Vec<f32>> {
                Ok(vec![0.5; c.len()])
            }
        }

        let candidates = vec![
            candidate("completely unrelated words", 0.5),
            candidate("the searched phrase appears here", 0.5),
        ];
        let scores =
            rerank_with_fallback(&FlatReranker, "searched phrase", &candidates).unwrap();
        assert!(
            scores[1] > scores[0],
            "fallback must use lexical overlap, got {scores:?}"
        );
    }

    #[test]
    fn non_degenerate_scores_are_kept_verbatim() {
        struct SpreadReranker;
        impl Reranker for SpreadReranker {
            fn name(&self) -> &'static str {
                "spread"
            }
            fn score(&self, _q: &str, c: &[Candidate]) -> EngineResult<Vec<f32>> {
                Ok(c.iter().enumerate().map(|(i, _)| i as f32 * 0.1).collect())
            }
        }
        let candidates = vec![candidate("a", 0.1), candidate("b", 0.2)];
        let scores = rerank_with_fallback(&SpreadReranker, "q", &candidates).unwrap();
        assert_eq!(scores, vec![0.0, 0.1]);
    }

    #[test]
    fn metadata_strategy_rewards_recency_and_priority() {
        let mut old = candidate("x", 0.5);
        old.doc_created_at = Utc::now() - chrono::Duration::days(365);
        old.source = "archive/old.md".into();
        let mut fresh = candidate("y", 0.5);
        fresh.source = "docs/new.md".into();

        let reranker = MetadataReranker::new(vec!["docs/".into()]);
        let scores = reranker.score("q", &[old, fresh]).unwrap();
        assert!(scores[1] > scores[0]);
    }

    #[test]
    fn text_derived_weights_image_proxies_heavier() {
        let mut image = candidate("diagram of the ingestion pipeline", 0.2);
        image.content_type = ContentKind::Image;
        let text = candidate("diagram of the ingestion pipeline", 0.2);

        let reranker = TextDerivedReranker;
        let scores = reranker.score("ingestion pipeline", &[image, text]).unwrap();
        // Same text, same vector score: the image candidate leans harder on
        // the (high) lexical signal.
        assert!(scores[0] > scores[1]);
    }
}
