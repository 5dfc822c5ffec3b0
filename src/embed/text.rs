//! Sentence-transformer embedder backed by fastembed's ONNX runtime.

use fastembed::{EmbeddingModel, TextEmbedding, TextInitOptions};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use crate::error::{EngineError, EngineResult};

use super::registry::ModelDescriptor;
use super::tokenize::{HfTokenCounter, TokenCounter, WhitespaceTokenCounter};
use super::{Embedder, Loader, ModelInfo};

/// Maps registry names onto fastembed's model enum.
fn fastembed_model(name: &str) -> EngineResult<EmbeddingModel> {
    match name {
        "all-MiniLM-L6-v2" => Ok(EmbeddingModel::AllMiniLML6V2),
        "bge-small-en-v1.5" => Ok(EmbeddingModel::BGESmallENV15),
        "bge-base-en-v1.5" => Ok(EmbeddingModel::BGEBaseENV15),
        other => Err(EngineError::UnsupportedModel(other.to_string())),
    }
}

/// The loaded model is wrapped in a mutex: fastembed's `embed` takes
/// `&mut self`, and the session is shared across concurrent pipelines.
struct LoadedModel {
    model: Mutex<TextEmbedding>,
}

pub struct SentenceTransformerEmbedder {
    descriptor: &'static ModelDescriptor,
    cache_dir: PathBuf,
    loader: Loader<LoadedModel>,
    tokenizer: Mutex<Option<Arc<dyn TokenCounter>>>,
}

impl SentenceTransformerEmbedder {
    pub fn new(descriptor: &'static ModelDescriptor, cache_dir: PathBuf) -> EngineResult<Self> {
        // Constructing is cheap; weights download/load on first embed call.
        fastembed_model(descriptor.name)?;
        Ok(Self {
            descriptor,
            cache_dir,
            loader: Loader::new(),
            tokenizer: Mutex::new(None),
        })
    }

    fn ensure_model(&self) -> EngineResult<Arc<LoadedModel>> {
        self.loader.get_or_load(self.descriptor.name, || {
            info!(
                model = self.descriptor.name,
                dims = self.descriptor.dimensions,
                "loading sentence-transformer model"
            );
            let options = TextInitOptions::new(fastembed_model(self.descriptor.name)?)
                .with_cache_dir(self.cache_dir.clone())
                .with_show_download_progress(false);
            let model = TextEmbedding::try_new(options).map_err(|e| {
                EngineError::ModelLoadFailure {
                    model: self.descriptor.name.to_string(),
                    detail: e.to_string(),
                }
            })?;
            Ok(LoadedModel { model: Mutex::new(model) })
        })
    }
}

impl Embedder for SentenceTransformerEmbedder {
    fn model_info(&self) -> ModelInfo {
        ModelInfo {
            name: self.descriptor.name.to_string(),
            model_type: self.descriptor.model_type,
            dimensions: self.descriptor.dimensions,
            version: self.descriptor.version.to_string(),
            supported_tasks: self.descriptor.supported_tasks.to_vec(),
        }
    }

    fn is_loaded(&self) -> bool {
        self.loader.is_loaded()
    }

    fn load(&self) -> EngineResult<()> {
        self.ensure_model().map(|_| ())
    }

    fn embed_text(&self, texts: &[String]) -> EngineResult<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let loaded = self.ensure_model()?;
        let mut model = loaded.model.lock();
        let embeddings = model
            .embed(texts.to_vec(), Some(self.descriptor.recommended_batch_size as usize))
            .map_err(|e| EngineError::TransientEmbedFailure(e.to_string()))?;

        // Verify dimensionality once per call; a mismatch here means the
        // registry entry and the actual weights disagree.
        if let Some(first) = embeddings.first() {
            if first.len() != self.descriptor.dimensions as usize {
                return Err(EngineError::DimensionMismatch {
                    expected: self.descriptor.dimensions,
                    actual: first.len() as u32,
                });
            }
        }
        Ok(embeddings)
    }

    fn token_counter(&self) -> Arc<dyn TokenCounter> {
        let mut slot = self.tokenizer.lock();
        if let Some(counter) = slot.as_ref() {
            return counter.clone();
        }
        let counter: Arc<dyn TokenCounter> =
            match HfTokenCounter::from_pretrained(self.descriptor.tokenizer_repo) {
                Ok(hf) => Arc::new(hf),
                Err(e) => {
                    tracing::warn!(
                        model = self.descriptor.name,
                        error = %e,
                        "tokenizer unavailable, counting whitespace tokens"
                    );
                    Arc::new(WhitespaceTokenCounter)
                }
            };
        *slot = Some(counter.clone());
        counter
    }

    fn cleanup(&self) {
        self.loader.unload();
        *self.tokenizer.lock() = None;
    }

    fn approx_bytes(&self) -> u64 {
        if self.is_loaded() {
            // ONNX session plus tokenizer for the MiniLM/BGE family.
            (self.descriptor.dimensions as u64) * 1_000_000 / 2
        } else {
            0
        }
    }
}
