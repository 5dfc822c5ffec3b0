use axum::{extract::State, Json};
use serde::Deserialize;

use crate::config::ResetOptions;
use crate::error::EngineResult;
use crate::state::AppState;
use crate::types::{EngineStats, ResetReport};

pub async fn get_stats(State(state): State<AppState>) -> EngineResult<Json<EngineStats>> {
    Ok(Json(state.engine.get_stats()?))
}

#[derive(Debug, Default, Deserialize)]
pub struct ResetRequest {
    #[serde(default)]
    pub full: bool,
    #[serde(default)]
    pub documents: bool,
    #[serde(default)]
    pub index: bool,
    #[serde(default)]
    pub content: bool,
    #[serde(default)]
    pub verify: bool,
}

pub async fn reset(
    State(state): State<AppState>,
    Json(request): Json<ResetRequest>,
) -> EngineResult<Json<ResetReport>> {
    let options = ResetOptions {
        full: request.full,
        documents: request.documents,
        index: request.index,
        content: request.content,
        verify: request.verify,
    };
    let report = state.engine.reset(options).await?;
    Ok(Json(report))
}
