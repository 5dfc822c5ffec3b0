use axum::{extract::State, Json};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::config::{SearchOptions, MAX_SEARCH_QUERY_LENGTH};
use crate::error::{EngineError, EngineResult};
use crate::state::AppState;
use crate::types::{ContentKind, RerankStrategy, SearchResponse};

#[derive(Debug, Deserialize)]
pub struct SearchRequest {
    pub query: String,
    #[serde(default)]
    pub top_k: Option<usize>,
    #[serde(default)]
    pub rerank: Option<bool>,
    #[serde(default)]
    pub reranking_strategy: Option<RerankStrategy>,
    #[serde(default)]
    pub content_type: Option<ContentKind>,
    #[serde(default)]
    pub embedding_model: Option<String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

pub async fn search(
    State(state): State<AppState>,
    Json(request): Json<SearchRequest>,
) -> EngineResult<Json<SearchResponse>> {
    if request.query.len() > MAX_SEARCH_QUERY_LENGTH {
        return Err(EngineError::BadRequest(format!(
            "query too long ({} chars), maximum is {}",
            request.query.len(),
            MAX_SEARCH_QUERY_LENGTH
        )));
    }

    let mut options = SearchOptions {
        rerank: request.rerank,
        reranking_strategy: request.reranking_strategy,
        content_type: request.content_type,
        embedding_model: request.embedding_model,
        timeout_ms: request.timeout_ms,
        ..Default::default()
    };
    if let Some(top_k) = request.top_k {
        options.top_k = top_k.min(1000);
    }

    let response = state
        .engine
        .search(&request.query, options, CancellationToken::new())
        .await?;
    Ok(Json(response))
}
