use axum::{extract::State, Json};
use base64::Engine as _;
use serde::Deserialize;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

use crate::config::IngestOptions;
use crate::error::{EngineError, EngineResult};
use crate::pipeline::ingest::IngestSource;
use crate::state::AppState;
use crate::types::{IngestReport, Mode};

#[derive(Debug, Deserialize)]
pub struct IngestRequest {
    /// Directory or file to ingest. Mutually exclusive with `bytes`.
    #[serde(default)]
    pub path: Option<String>,
    /// Inline content, base64-encoded. Requires `name`.
    #[serde(default)]
    pub bytes: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub mime: Option<String>,

    #[serde(default)]
    pub mode: Option<Mode>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub chunk_size: Option<u32>,
    #[serde(default)]
    pub chunk_overlap: Option<u32>,
    #[serde(default)]
    pub batch_size: Option<u32>,
    #[serde(default)]
    pub force_rebuild: bool,
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
}

pub async fn ingest(
    State(state): State<AppState>,
    Json(request): Json<IngestRequest>,
) -> EngineResult<Json<IngestReport>> {
    let source = match (&request.path, &request.bytes) {
        (Some(path), None) => {
            let path = PathBuf::from(path);
            if path.is_dir() {
                IngestSource::Directory(path)
            } else {
                IngestSource::File(path)
            }
        }
        (None, Some(encoded)) => {
            let name = request
                .name
                .clone()
                .ok_or_else(|| EngineError::BadRequest("inline bytes require a name".into()))?;
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(encoded)
                .map_err(|e| EngineError::BadRequest(format!("bytes are not valid base64: {e}")))?;
            IngestSource::Blob { name, bytes, mime: request.mime.clone() }
        }
        (Some(_), Some(_)) => {
            return Err(EngineError::BadRequest(
                "provide either path or bytes, not both".into(),
            ));
        }
        (None, None) => {
            return Err(EngineError::BadRequest("provide a path or inline bytes".into()));
        }
    };

    let options = IngestOptions {
        mode: request.mode.unwrap_or(state.config.default_mode),
        model: request.model.unwrap_or_else(|| state.config.default_model.clone()),
        chunk_size: request.chunk_size,
        chunk_overlap: request.chunk_overlap,
        batch_size: request.batch_size,
        force_rebuild: request.force_rebuild,
        include: request.include,
        exclude: request.exclude,
    };

    let report = state
        .engine
        .ingest(source, options, CancellationToken::new())
        .await?;
    Ok(Json(report))
}
