use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;

/// Suggested fix attached to user-visible failures: a machine-usable action
/// name, an example command or API call, and a one-line explanation.
#[derive(Debug, Clone, Serialize)]
pub struct Resolution {
    pub action: String,
    pub command: String,
    pub explanation: String,
}

impl Resolution {
    pub fn new(action: &str, command: &str, explanation: &str) -> Self {
        Self {
            action: action.to_string(),
            command: command.to_string(),
            explanation: explanation.to_string(),
        }
    }

    fn rebuild(explanation: &str) -> Self {
        Self::new(
            "force_rebuild",
            "POST /api/ingest {\"path\": \"<corpus>\", \"force_rebuild\": true}",
            explanation,
        )
    }
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("File not found: {0}")]
    MissingFile(String),

    #[error("Failed to load model '{model}': {detail}")]
    ModelLoadFailure { model: String, detail: String },

    #[error("Unsupported model: {0}")]
    UnsupportedModel(String),

    #[error("Model capability error: {0}")]
    Capability(String),

    #[error("Mode mismatch: {0}")]
    ModeMismatch(String),

    #[error("Model mismatch: corpus was built with '{stored}', caller requested '{requested}'")]
    ModelMismatch { stored: String, requested: String },

    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: u32, actual: u32 },

    #[error("Index desync: {0}")]
    IndexDesync(String),

    #[error("Storage cap exceeded: {0}")]
    StorageCapExceeded(String),

    #[error("Content integrity failure for {content_id}: {detail}")]
    IntegrityFailure { content_id: String, detail: String },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Operation timed out after {0}ms")]
    Timeout(u64),

    #[error("Transient embedding failure: {0}")]
    TransientEmbedFailure(String),

    #[error("Invalid configuration: {0}")]
    ConfigValidation(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Index error: {0}")]
    Index(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),

    #[error("Bad request: {0}")]
    BadRequest(String),
}

impl EngineError {
    /// Stable error-kind string carried in every user-visible failure.
    /// These are wire-format identifiers; renaming one is a breaking change.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::InvalidPath(_) => "InvalidPath",
            EngineError::MissingFile(_) => "MissingFile",
            EngineError::ModelLoadFailure { .. } => "ModelLoadFailure",
            EngineError::UnsupportedModel(_) => "UnsupportedModel",
            EngineError::Capability(_) => "CapabilityError",
            EngineError::ModeMismatch(_) => "ModeMismatch",
            EngineError::ModelMismatch { .. } => "ModelMismatch",
            EngineError::DimensionMismatch { .. } => "DimensionMismatch",
            EngineError::IndexDesync(_) => "IndexDesync",
            EngineError::StorageCapExceeded(_) => "StorageCapExceeded",
            EngineError::IntegrityFailure { .. } => "IntegrityFailure",
            EngineError::Cancelled => "Cancelled",
            EngineError::Timeout(_) => "Timeout",
            EngineError::TransientEmbedFailure(_) => "TransientEmbedFailure",
            EngineError::ConfigValidation(_) => "ConfigValidation",
            EngineError::Storage(_) => "StorageError",
            EngineError::Index(_) => "IndexError",
            EngineError::Io(_) => "IoError",
            EngineError::Serde(_) => "SerializationError",
            EngineError::Internal(_) => "InternalError",
            EngineError::BadRequest(_) => "BadRequest",
        }
    }

    /// Fatal kinds abort the operation and require an explicit rebuild.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EngineError::DimensionMismatch { .. } | EngineError::IndexDesync(_)
        )
    }

    pub fn resolution(&self) -> Option<Resolution> {
        match self {
            EngineError::ModelMismatch { stored, .. } => Some(Resolution::rebuild(&format!(
                "The corpus is bound to '{stored}'. Re-ingest with force_rebuild=true to switch models; this discards the existing index and embeddings."
            ))),
            EngineError::DimensionMismatch { expected, actual } => Some(Resolution::rebuild(
                &format!("Stored vectors are {expected}-dimensional but the model produces {actual}. Rebuild the corpus with the current model."),
            )),
            EngineError::IndexDesync(_) => Some(Resolution::rebuild(
                "The vector index and the metadata store disagree. Rebuilding re-embeds the corpus and restores the label mapping.",
            )),
            EngineError::ModeMismatch(_) | EngineError::Capability(_) => Some(Resolution::new(
                "change_mode_or_model",
                "POST /api/ingest {\"mode\": \"multimodal\", \"model\": \"clip-vit-b-32\"}",
                "Pick a model whose capabilities cover the requested mode; text-only models cannot serve a multimodal corpus.",
            )),
            EngineError::UnsupportedModel(name) => Some(Resolution::new(
                "choose_registered_model",
                "GET /api/stats",
                &format!("'{name}' is not in the model registry; stats lists the supported models."),
            )),
            EngineError::StorageCapExceeded(_) => Some(Resolution::new(
                "raise_cap_or_prune",
                "LODESTONE_MAX_CONTENT_DIR_MB=2048",
                "Raise the content store caps or reset the corpus to reclaim space.",
            )),
            EngineError::IntegrityFailure { content_id, .. } => Some(Resolution::new(
                "reingest_content",
                &format!("POST /api/reset {{\"verify\": true}} (affected: {content_id})"),
                "Stored bytes no longer match their content hash; re-ingest the source document.",
            )),
            _ => None,
        }
    }
}

impl From<rusqlite::Error> for EngineError {
    fn from(e: rusqlite::Error) -> Self {
        EngineError::Storage(e.to_string())
    }
}

impl From<r2d2::Error> for EngineError {
    fn from(e: r2d2::Error) -> Self {
        EngineError::Storage(format!("connection pool: {e}"))
    }
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let status = match &self {
            EngineError::InvalidPath(_)
            | EngineError::BadRequest(_)
            | EngineError::ConfigValidation(_)
            | EngineError::Serde(_) => StatusCode::BAD_REQUEST,
            EngineError::MissingFile(_) => StatusCode::NOT_FOUND,
            EngineError::UnsupportedModel(_)
            | EngineError::Capability(_)
            | EngineError::ModeMismatch(_)
            | EngineError::ModelMismatch { .. }
            | EngineError::DimensionMismatch { .. } => StatusCode::CONFLICT,
            EngineError::StorageCapExceeded(_) => StatusCode::INSUFFICIENT_STORAGE,
            EngineError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            EngineError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = json!({
            "error": self.kind(),
            "message": self.to_string(),
            "details": null,
            "resolution": self.resolution(),
        });

        (status, Json(body)).into_response()
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_stable_strings() {
        assert_eq!(
            EngineError::Capability("image embed on text model".into()).kind(),
            "CapabilityError"
        );
        assert_eq!(
            EngineError::DimensionMismatch { expected: 384, actual: 768 }.kind(),
            "DimensionMismatch"
        );
        assert_eq!(EngineError::Cancelled.kind(), "Cancelled");
    }

    #[test]
    fn fatal_kinds_carry_rebuild_resolution() {
        let err = EngineError::IndexDesync("label 42 missing".into());
        assert!(err.is_fatal());
        let res = err.resolution().expect("desync must carry a resolution");
        assert_eq!(res.action, "force_rebuild");
        assert!(res.command.contains("force_rebuild"));
    }

    #[test]
    fn model_mismatch_names_both_models() {
        let err = EngineError::ModelMismatch {
            stored: "all-MiniLM-L6-v2".into(),
            requested: "bge-base-en-v1.5".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("all-MiniLM-L6-v2"));
        assert!(msg.contains("bge-base-en-v1.5"));
        assert!(!err.is_fatal());
    }
}
