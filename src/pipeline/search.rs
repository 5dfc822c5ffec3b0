//! Search pipeline: query embedding → ANN lookup → metadata join →
//! optional rerank → ordered results.
//!
//! Every stage is a suspension point: cancellation returns no partial
//! results, while a deadline expiry returns the best results gathered at the
//! last completed stage (or `Timeout` if none are ready yet).

use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::{SearchOptions, RERANK_EXPANSION};
use crate::error::{EngineError, EngineResult};
use crate::index::SharedIndex;
use crate::rerank::{rerank_with_fallback, Candidate, Reranker};
use crate::store::MetadataStore;
use crate::types::{ResultDocument, SearchHit, SearchResponse, SystemInfo};

pub struct SearchDeps {
    pub metadata: Arc<MetadataStore>,
    pub index: SharedIndex,
}

struct JoinedCandidate {
    candidate: Candidate,
    content_id: Option<String>,
    title: String,
}

/// Runs a whole search synchronously; the engine calls this inside
/// `spawn_blocking` so concurrent searches share the index read lock.
pub fn run_sync(
    deps: &SearchDeps,
    embedder: Arc<dyn crate::embed::Embedder>,
    reranker: Option<Arc<dyn Reranker>>,
    query: &str,
    options: SearchOptions,
    system: &SystemInfo,
    cancel: CancellationToken,
) -> EngineResult<SearchResponse> {
    let started = Instant::now();
    options.validate()?;
    let deadline = options.timeout_ms.map(|ms| {
        (started + std::time::Duration::from_millis(ms), ms)
    });

    // Boundary behaviours: empty queries and top_k = 0 are empty results,
    // not errors.
    if query.trim().is_empty() || options.top_k == 0 {
        return Ok(SearchResponse::default());
    }

    // The caller-declared model must match the corpus.
    if let Some(declared) = &options.embedding_model {
        if declared != &system.model_name {
            return Err(EngineError::ModelMismatch {
                stored: system.model_name.clone(),
                requested: declared.clone(),
            });
        }
    }

    let check_cancelled = |stage: &str| -> EngineResult<()> {
        if cancel.is_cancelled() {
            debug!(stage, "search cancelled");
            return Err(EngineError::Cancelled);
        }
        Ok(())
    };
    let expired = |deadline: &Option<(Instant, u64)>| {
        deadline.map(|(at, _)| Instant::now() >= at).unwrap_or(false)
    };

    // Stage 1: embed the query. In multimodal corpora this goes through the
    // model's text tower into the joint space.
    check_cancelled("embed")?;
    if expired(&deadline) {
        return Err(EngineError::Timeout(deadline.unwrap().1));
    }
    let query_vec = embedder
        .embed_text(&[query.to_string()])?
        .into_iter()
        .next()
        .ok_or_else(|| EngineError::Index("embedder returned no query vector".into()))?;

    // Stage 2: ANN lookup, over-fetched when a rerank will follow.
    check_cancelled("ann")?;
    let rerank_enabled = options.rerank.unwrap_or(true) && reranker.is_some();
    let fetch_k = if rerank_enabled {
        options.top_k.saturating_mul(RERANK_EXPANSION).max(options.top_k)
    } else {
        options.top_k
    };

    let (labels, distances, id_pairs) = {
        let guard = deps.index.read();
        let Some(index) = guard.as_ref() else {
            return Ok(SearchResponse {
                query_time_ms: started.elapsed().as_millis() as u64,
                ..Default::default()
            });
        };
        let (labels, distances) = index.search(&query_vec, fetch_k)?;
        let id_pairs: Vec<Option<String>> = labels
            .iter()
            .map(|label| index.embedding_id_for(*label).cloned())
            .collect();
        (labels, distances, id_pairs)
    };

    // Stage 3: metadata join. A label missing from the bijection, or an id
    // missing from the store, is a desync: drop the candidate, keep going,
    // and tell the caller to consider a rebuild.
    check_cancelled("join")?;
    let mut desynced = 0usize;
    let known_ids: Vec<String> = id_pairs.iter().flatten().cloned().collect();
    desynced += id_pairs.iter().filter(|p| p.is_none()).count();

    let rows = deps.metadata.get_chunks_by_embedding_ids(&known_ids)?;

    let mut joined: Vec<JoinedCandidate> = Vec::new();
    for ((label, dist), id) in labels.iter().zip(&distances).zip(&id_pairs) {
        let Some(id) = id else {
            warn!(label, "index label has no embedding id; skipping candidate");
            continue;
        };
        let Some((chunk, document)) = rows.get(id) else {
            warn!(label, embedding_id = %id, "embedding id missing from metadata store; skipping candidate");
            desynced += 1;
            continue;
        };
        if let Some(filter) = options.content_type {
            if chunk.content_type != filter {
                continue;
            }
        }
        joined.push(JoinedCandidate {
            candidate: Candidate {
                text: chunk.text.clone(),
                vector_score: (1.0 - dist).clamp(0.0, 1.0),
                doc_id: document.doc_id,
                chunk_index: chunk.chunk_index,
                content_type: chunk.content_type,
                source: document.source.clone(),
                doc_created_at: document.created_at,
            },
            content_id: chunk.content_id.clone(),
            title: document.title.clone(),
        });
    }

    let warning = (desynced > 0).then(|| {
        format!(
            "IndexDesync: {desynced} candidate(s) had no matching metadata and were dropped; \
             re-ingest with force_rebuild=true to restore the index mapping"
        )
    });

    // Stage 4: rerank, unless the deadline already spent the budget; the
    // vector-scored results are the best gathered so far.
    check_cancelled("rerank")?;
    let mut scores: Vec<f32> = joined.iter().map(|j| j.candidate.vector_score).collect();
    if rerank_enabled && !joined.is_empty() && !expired(&deadline) {
        let candidates: Vec<Candidate> = joined.iter().map(|j| j.candidate.clone()).collect();
        let reranker = reranker.expect("rerank_enabled implies a reranker");
        match rerank_with_fallback(reranker.as_ref(), query, &candidates) {
            Ok(updated) => scores = updated,
            Err(e) if matches!(e, EngineError::Cancelled) => return Err(e),
            Err(e) => {
                warn!(error = %e, "reranking failed; keeping vector ordering");
            }
        }
    } else if rerank_enabled && expired(&deadline) {
        debug!("search deadline expired before rerank; returning vector-scored results");
    }

    // Stage 5: deterministic ordering (score descending, ties by
    // (doc_id, chunk_index) ascending), then cut to top_k.
    let mut ranked: Vec<(f32, JoinedCandidate)> = scores.into_iter().zip(joined).collect();
    ranked.sort_by(|a, b| {
        b.0.total_cmp(&a.0)
            .then_with(|| a.1.candidate.doc_id.cmp(&b.1.candidate.doc_id))
            .then_with(|| a.1.candidate.chunk_index.cmp(&b.1.candidate.chunk_index))
    });
    ranked.truncate(options.top_k);

    let results = ranked
        .into_iter()
        .map(|(score, j)| SearchHit {
            text: j.candidate.text,
            score: score.clamp(0.0, 1.0),
            document: ResultDocument {
                id: j.candidate.doc_id,
                source: j.candidate.source,
                title: j.title,
            },
            content_id: j.content_id,
            content_type: j.candidate.content_type,
            chunk_index: Some(j.candidate.chunk_index),
        })
        .collect();

    Ok(SearchResponse {
        results,
        query_time_ms: started.elapsed().as_millis() as u64,
        warning,
    })
}
