//! Model registry: the static table of models this engine knows how to run,
//! with the metadata that drives chunker and batch configuration.

use std::path::PathBuf;
use std::sync::Arc;

use crate::error::{EngineError, EngineResult};
use crate::types::ModelType;

use super::clip::ClipEmbedder;
use super::hashed::HashEmbedder;
use super::text::SentenceTransformerEmbedder;
use super::{Embedder, Task};

#[derive(Debug, Clone)]
pub struct ModelDescriptor {
    pub name: &'static str,
    pub model_type: ModelType,
    pub dimensions: u32,
    pub max_context: u32,
    pub supported_tasks: &'static [Task],
    pub recommended_chunk_size: u32,
    pub recommended_overlap: u32,
    /// Text batch size; image batches are smaller.
    pub recommended_batch_size: u32,
    pub image_batch_size: u32,
    pub version: &'static str,
    /// Hub repository providing the tokenizer for token-aware chunking.
    pub tokenizer_repo: &'static str,
}

impl ModelDescriptor {
    pub fn supports(&self, task: Task) -> bool {
        self.supported_tasks.contains(&task)
    }

    pub fn fingerprint(&self) -> String {
        format!("{}@{}", self.name, self.dimensions)
    }
}

const TEXT_ONLY: &[Task] = &[Task::EmbedText];
const TEXT_AND_IMAGE: &[Task] = &[Task::EmbedText, Task::EmbedImage];

static MODELS: &[ModelDescriptor] = &[
    ModelDescriptor {
        name: "all-MiniLM-L6-v2",
        model_type: ModelType::SentenceTransformer,
        dimensions: 384,
        max_context: 256,
        supported_tasks: TEXT_ONLY,
        recommended_chunk_size: 220,
        recommended_overlap: 32,
        recommended_batch_size: 256,
        image_batch_size: 0,
        version: "2",
        tokenizer_repo: "sentence-transformers/all-MiniLM-L6-v2",
    },
    ModelDescriptor {
        name: "bge-small-en-v1.5",
        model_type: ModelType::SentenceTransformer,
        dimensions: 384,
        max_context: 512,
        supported_tasks: TEXT_ONLY,
        recommended_chunk_size: 450,
        recommended_overlap: 64,
        recommended_batch_size: 256,
        image_batch_size: 0,
        version: "1.5",
        tokenizer_repo: "BAAI/bge-small-en-v1.5",
    },
    ModelDescriptor {
        name: "bge-base-en-v1.5",
        model_type: ModelType::SentenceTransformer,
        dimensions: 768,
        max_context: 512,
        supported_tasks: TEXT_ONLY,
        recommended_chunk_size: 450,
        recommended_overlap: 64,
        recommended_batch_size: 128,
        image_batch_size: 0,
        version: "1.5",
        tokenizer_repo: "BAAI/bge-base-en-v1.5",
    },
    ModelDescriptor {
        name: "clip-vit-b-32",
        model_type: ModelType::Clip,
        dimensions: 512,
        max_context: 77,
        supported_tasks: TEXT_AND_IMAGE,
        recommended_chunk_size: 60,
        recommended_overlap: 8,
        recommended_batch_size: 128,
        image_batch_size: 16,
        version: "1",
        tokenizer_repo: "openai/clip-vit-base-patch32",
    },
];

pub fn descriptor(name: &str) -> EngineResult<&'static ModelDescriptor> {
    // Deterministic offline embedders register themselves by prefix; they
    // exist for tests and air-gapped smoke runs.
    if let Some(desc) = HashEmbedder::descriptor_for(name) {
        return Ok(desc);
    }
    MODELS
        .iter()
        .find(|m| m.name == name)
        .ok_or_else(|| EngineError::UnsupportedModel(name.to_string()))
}

pub fn all_models() -> &'static [ModelDescriptor] {
    MODELS
}

/// Builds the embedder for a registered model. Heavy weights stay unloaded
/// until the first embed call.
pub fn build_embedder(name: &str, cache_dir: PathBuf) -> EngineResult<Arc<dyn Embedder>> {
    if HashEmbedder::descriptor_for(name).is_some() {
        return Ok(Arc::new(HashEmbedder::from_name(name)?));
    }

    let desc = descriptor(name)?;
    match desc.model_type {
        ModelType::SentenceTransformer => {
            Ok(Arc::new(SentenceTransformerEmbedder::new(desc, cache_dir)?))
        }
        ModelType::Clip => Ok(Arc::new(ClipEmbedder::new(desc, cache_dir)?)),
    }
}
