use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{EngineError, EngineResult};
use crate::types::{Mode, RerankStrategy};

/// Maximum allowed length for search queries (characters).
pub const MAX_SEARCH_QUERY_LENGTH: usize = 1000;

/// Candidate expansion factor applied before reranking: the ANN stage fetches
/// `top_k * RERANK_EXPANSION` candidates so the reranker has room to reorder.
pub const RERANK_EXPANSION: usize = 4;

/// Text document extensions accepted by the ingestion pipeline.
pub const TEXT_EXTENSIONS: &[&str] = &[
    "md", "mdx", "markdown", "txt", "rst", "adoc",
    "html", "htm", "tex",
    "json", "yaml", "yml", "toml", "xml", "csv",
];

/// Image extensions accepted in multimodal mode.
pub const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "webp", "bmp"];

pub fn is_text_extension(ext: &str) -> bool {
    TEXT_EXTENSIONS.contains(&ext)
}

pub fn is_image_extension(ext: &str) -> bool {
    IMAGE_EXTENSIONS.contains(&ext)
}

pub fn mime_for_image_extension(ext: &str) -> &'static str {
    match ext {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "bmp" => "image/bmp",
        _ => "application/octet-stream",
    }
}

/// Process-level configuration, resolved once at startup from `LODESTONE_*`
/// environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub listen_addr: String,
    pub data_dir: String,
    /// Rotated log files land here; defaults to `<data_dir>/logs`.
    pub log_dir: String,
    pub default_mode: Mode,
    pub default_model: String,
    pub content: ContentStoreConfig,
    pub resources: ResourceConfig,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let port = std::env::var("LODESTONE_PORT").unwrap_or_else(|_| "9821".to_string());

        let data_dir = std::env::var("LODESTONE_DATA_DIR").unwrap_or_else(|_| {
            dirs::data_local_dir()
                .map(|d| d.join("lodestone").to_string_lossy().to_string())
                .unwrap_or_else(|| ".lodestone-data".to_string())
        });

        let log_dir = std::env::var("LODESTONE_LOG_DIR").unwrap_or_else(|_| {
            PathBuf::from(&data_dir).join("logs").to_string_lossy().to_string()
        });

        let default_mode = std::env::var("LODESTONE_MODE")
            .ok()
            .and_then(|v| Mode::parse(&v).ok())
            .unwrap_or(Mode::Text);

        let default_model = std::env::var("LODESTONE_MODEL")
            .unwrap_or_else(|_| "all-MiniLM-L6-v2".to_string());

        let content = ContentStoreConfig {
            content_dir: PathBuf::from(&data_dir).join("content"),
            max_file_size: env_usize("LODESTONE_MAX_FILE_SIZE", 10 * 1024 * 1024),
            max_content_dir_size: env_usize("LODESTONE_MAX_CONTENT_DIR_MB", 1024) * 1024 * 1024,
            enable_deduplication: env_bool("LODESTONE_CONTENT_DEDUP", true),
        };

        let resources = ResourceConfig {
            memory_threshold_mb: env_usize("LODESTONE_MEMORY_THRESHOLD_MB", 512) as u64,
            cleanup_interval_ms: env_usize("LODESTONE_CLEANUP_INTERVAL_MS", 30_000) as u64,
            idle_eviction_secs: env_usize("LODESTONE_IDLE_EVICTION_SECS", 300) as u64,
            enable_gc: env_bool("LODESTONE_ENABLE_GC", true),
            auto_cleanup: env_bool("LODESTONE_AUTO_CLEANUP", true),
        };

        Self {
            listen_addr: format!("127.0.0.1:{}", port),
            data_dir,
            log_dir,
            default_mode,
            default_model,
            content,
            resources,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentStoreConfig {
    pub content_dir: PathBuf,
    /// Per-file byte cap; oversize puts fail with StorageCapExceeded.
    pub max_file_size: usize,
    /// Aggregate byte cap for the whole content directory.
    pub max_content_dir_size: usize,
    pub enable_deduplication: bool,
}

impl ContentStoreConfig {
    pub fn validate(&self) -> EngineResult<()> {
        if self.max_file_size == 0 {
            return Err(EngineError::ConfigValidation(
                "max_file_size must be positive".into(),
            ));
        }
        if self.max_content_dir_size < self.max_file_size {
            return Err(EngineError::ConfigValidation(
                "max_content_dir_size must be at least max_file_size".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceConfig {
    pub memory_threshold_mb: u64,
    pub cleanup_interval_ms: u64,
    /// A resource is considered idle once untouched for this long.
    pub idle_eviction_secs: u64,
    pub enable_gc: bool,
    pub auto_cleanup: bool,
}

impl ResourceConfig {
    pub fn validate(&self) -> EngineResult<()> {
        if self.memory_threshold_mb < 64 {
            return Err(EngineError::ConfigValidation(
                "memory_threshold_mb must be at least 64".into(),
            ));
        }
        if self.cleanup_interval_ms < 5000 {
            return Err(EngineError::ConfigValidation(
                "cleanup_interval_ms must be at least 5000".into(),
            ));
        }
        Ok(())
    }
}

/// Per-call ingestion options. Unset chunking fields fall back to the model
/// registry's recommendations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestOptions {
    pub mode: Mode,
    pub model: String,
    #[serde(default)]
    pub chunk_size: Option<u32>,
    #[serde(default)]
    pub chunk_overlap: Option<u32>,
    #[serde(default)]
    pub batch_size: Option<u32>,
    #[serde(default)]
    pub force_rebuild: bool,
    /// Glob patterns relative to the ingest root; empty means "everything
    /// with a supported extension".
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
}

impl IngestOptions {
    pub fn new(mode: Mode, model: &str) -> Self {
        Self {
            mode,
            model: model.to_string(),
            chunk_size: None,
            chunk_overlap: None,
            batch_size: None,
            force_rebuild: false,
            include: Vec::new(),
            exclude: Vec::new(),
        }
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.model.trim().is_empty() {
            return Err(EngineError::ConfigValidation("model must not be empty".into()));
        }
        if let (Some(size), Some(overlap)) = (self.chunk_size, self.chunk_overlap) {
            if overlap >= size {
                return Err(EngineError::ConfigValidation(format!(
                    "chunk_overlap ({overlap}) must be smaller than chunk_size ({size})"
                )));
            }
        }
        if self.chunk_size == Some(0) {
            return Err(EngineError::ConfigValidation("chunk_size must be positive".into()));
        }
        if self.batch_size == Some(0) {
            return Err(EngineError::ConfigValidation("batch_size must be positive".into()));
        }
        Ok(())
    }
}

/// Per-call search options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchOptions {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// None keeps the corpus default from SystemInfo.
    #[serde(default)]
    pub rerank: Option<bool>,
    #[serde(default)]
    pub reranking_strategy: Option<RerankStrategy>,
    #[serde(default)]
    pub content_type: Option<crate::types::ContentKind>,
    /// Caller-declared model; must match SystemInfo when set.
    #[serde(default)]
    pub embedding_model: Option<String>,
    /// Search deadline; expiry returns the best results gathered so far.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

fn default_top_k() -> usize {
    10
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            rerank: None,
            reranking_strategy: None,
            content_type: None,
            embedding_model: None,
            timeout_ms: None,
        }
    }
}

impl SearchOptions {
    pub fn validate(&self) -> EngineResult<()> {
        if self.top_k > 1000 {
            return Err(EngineError::ConfigValidation(
                "top_k must be at most 1000".into(),
            ));
        }
        Ok(())
    }
}

/// Reset scope. `full` drops everything including SystemInfo; otherwise the
/// individual flags select what is cleared.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResetOptions {
    #[serde(default)]
    pub full: bool,
    #[serde(default)]
    pub documents: bool,
    #[serde(default)]
    pub index: bool,
    #[serde(default)]
    pub content: bool,
    /// Verify content-store integrity while resetting; mismatched objects are
    /// reported and removed.
    #[serde(default)]
    pub verify: bool,
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .map(|v| matches!(v.as_str(), "1" | "true" | "yes"))
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlap_must_stay_below_chunk_size() {
        let mut opts = IngestOptions::new(Mode::Text, "all-MiniLM-L6-v2");
        opts.chunk_size = Some(100);
        opts.chunk_overlap = Some(100);
        assert!(opts.validate().is_err());
        opts.chunk_overlap = Some(20);
        assert!(opts.validate().is_ok());
    }

    #[test]
    fn resource_thresholds_have_floors() {
        let cfg = ResourceConfig {
            memory_threshold_mb: 32,
            cleanup_interval_ms: 30_000,
            idle_eviction_secs: 300,
            enable_gc: true,
            auto_cleanup: true,
        };
        assert!(cfg.validate().is_err());

        let cfg = ResourceConfig { memory_threshold_mb: 64, cleanup_interval_ms: 1000, ..cfg };
        assert!(cfg.validate().is_err());

        let cfg = ResourceConfig { cleanup_interval_ms: 5000, ..cfg };
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn extension_tables_distinguish_text_and_image() {
        assert!(is_text_extension("md"));
        assert!(!is_text_extension("png"));
        assert!(is_image_extension("png"));
        assert_eq!(mime_for_image_extension("jpeg"), "image/jpeg");
    }
}
