use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::Deserialize;
use serde_json::json;

use crate::error::EngineResult;
use crate::state::AppState;
use crate::store::{ContentFormat, ContentPayload};

#[derive(Debug, Deserialize)]
pub struct ContentQuery {
    #[serde(default = "default_format")]
    pub format: ContentFormat,
}

fn default_format() -> ContentFormat {
    ContentFormat::Base64
}

pub async fn get_content(
    State(state): State<AppState>,
    Path(content_id): Path<String>,
    Query(query): Query<ContentQuery>,
) -> EngineResult<Json<serde_json::Value>> {
    let metadata = state.engine.get_content_metadata(&content_id)?;
    let payload = state.engine.get_content(&content_id, query.format)?;
    let body = match payload {
        ContentPayload::FilePath(path) => json!({
            "content_id": content_id,
            "format": "file_path",
            "path": path.to_string_lossy(),
            "byte_length": metadata.byte_length,
            "mime": metadata.mime,
        }),
        ContentPayload::Base64(data) => json!({
            "content_id": content_id,
            "format": "base64",
            "data": data,
            "byte_length": metadata.byte_length,
            "mime": metadata.mime,
        }),
    };
    Ok(Json(body))
}
