use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

/// Top-level corpus configuration: which content types are allowed and which
/// model family serves them. Fixed at first ingest, changed only by rebuild.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Text,
    Multimodal,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Text => "text",
            Mode::Multimodal => "multimodal",
        }
    }

    pub fn parse(s: &str) -> EngineResult<Self> {
        match s {
            "text" => Ok(Mode::Text),
            "multimodal" => Ok(Mode::Multimodal),
            other => Err(EngineError::ConfigValidation(format!(
                "unknown mode '{other}' (expected 'text' or 'multimodal')"
            ))),
        }
    }
}

/// Content type of a chunk or document. Documents may be `Mixed`; individual
/// chunks are always `Text` or `Image`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    Text,
    Image,
    Mixed,
}

impl ContentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentKind::Text => "text",
            ContentKind::Image => "image",
            ContentKind::Mixed => "mixed",
        }
    }

    pub fn parse(s: &str) -> EngineResult<Self> {
        match s {
            "text" => Ok(ContentKind::Text),
            "image" => Ok(ContentKind::Image),
            "mixed" => Ok(ContentKind::Mixed),
            other => Err(EngineError::Storage(format!("unknown content type '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelType {
    #[serde(rename = "sentence-transformer")]
    SentenceTransformer,
    #[serde(rename = "clip")]
    Clip,
}

impl ModelType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelType::SentenceTransformer => "sentence-transformer",
            ModelType::Clip => "clip",
        }
    }

    pub fn parse(s: &str) -> EngineResult<Self> {
        match s {
            "sentence-transformer" => Ok(ModelType::SentenceTransformer),
            "clip" => Ok(ModelType::Clip),
            other => Err(EngineError::Storage(format!("unknown model type '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RerankStrategy {
    CrossEncoder,
    TextDerived,
    Metadata,
    Hybrid,
    Disabled,
}

impl RerankStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RerankStrategy::CrossEncoder => "cross-encoder",
            RerankStrategy::TextDerived => "text-derived",
            RerankStrategy::Metadata => "metadata",
            RerankStrategy::Hybrid => "hybrid",
            RerankStrategy::Disabled => "disabled",
        }
    }

    pub fn parse(s: &str) -> EngineResult<Self> {
        match s {
            "cross-encoder" => Ok(RerankStrategy::CrossEncoder),
            "text-derived" => Ok(RerankStrategy::TextDerived),
            "metadata" => Ok(RerankStrategy::Metadata),
            "hybrid" => Ok(RerankStrategy::Hybrid),
            "disabled" => Ok(RerankStrategy::Disabled),
            other => Err(EngineError::ConfigValidation(format!(
                "unknown reranking strategy '{other}'"
            ))),
        }
    }

    /// Mode-dependent default: cross-encoder for text corpora, text-derived
    /// proxies for multimodal ones.
    pub fn default_for(mode: Mode) -> Self {
        match mode {
            Mode::Text => RerankStrategy::CrossEncoder,
            Mode::Multimodal => RerankStrategy::TextDerived,
        }
    }
}

/// Singleton record describing the corpus configuration. Source of truth for
/// every compatibility check; rewritten only under force-rebuild.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemInfo {
    pub mode: Mode,
    pub model_name: String,
    pub model_type: ModelType,
    pub model_dimensions: u32,
    pub model_version: String,
    pub supported_content_types: Vec<ContentKind>,
    pub reranking_strategy: RerankStrategy,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub doc_id: i64,
    pub source: String,
    pub title: String,
    pub content_type: ContentKind,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub chunk_id: i64,
    pub doc_id: i64,
    pub chunk_index: u32,
    pub text: String,
    pub token_count: u32,
    pub content_type: ContentKind,
    pub embedding_id: String,
    pub content_id: Option<String>,
}

/// Summary returned by a completed ingest run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IngestReport {
    pub documents_processed: usize,
    pub chunks_created: usize,
    pub embeddings_generated: usize,
    pub processing_time_ms: u64,
    /// Files skipped with their reasons (oversize, unreadable, unsupported).
    pub skipped: Vec<SkippedFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkippedFile {
    pub path: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultDocument {
    pub id: i64,
    pub source: String,
    pub title: String,
}

/// One ranked search result. `score` is in `[0, 1]`, higher is better.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub text: String,
    pub score: f32,
    pub document: ResultDocument,
    pub content_id: Option<String>,
    pub content_type: ContentKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk_index: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchResponse {
    pub results: Vec<SearchHit>,
    pub query_time_ms: u64,
    /// Advisory warning (e.g. index desync detected and recovered from).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResetReport {
    pub documents_removed: usize,
    pub chunks_removed: usize,
    pub embeddings_removed: usize,
    pub content_objects_removed: usize,
    pub index_removed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSpecificConfig {
    pub chunk_size: u32,
    pub chunk_overlap: u32,
    pub batch_size: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsModelInfo {
    pub name: String,
    pub dimensions: u32,
    pub model_specific_config: ModelSpecificConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineStats {
    pub database_exists: bool,
    pub index_exists: bool,
    pub mode: Option<Mode>,
    pub model_info: Option<StatsModelInfo>,
    pub compatibility: Option<String>,
    pub document_count: usize,
    pub chunk_count: usize,
    pub index_size: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_round_trips_through_strings() {
        assert_eq!(Mode::parse("text").unwrap(), Mode::Text);
        assert_eq!(Mode::parse("multimodal").unwrap(), Mode::Multimodal);
        assert!(Mode::parse("hybrid").is_err());
        assert_eq!(Mode::Multimodal.as_str(), "multimodal");
    }

    #[test]
    fn default_rerank_strategy_follows_mode() {
        assert_eq!(RerankStrategy::default_for(Mode::Text), RerankStrategy::CrossEncoder);
        assert_eq!(
            RerankStrategy::default_for(Mode::Multimodal),
            RerankStrategy::TextDerived
        );
    }
}
