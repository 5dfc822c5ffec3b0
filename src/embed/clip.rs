//! CLIP-class embedder: one joint embedding space served by two towers.
//!
//! fastembed ships both halves of clip-vit-b-32 (the text tower as a
//! `TextEmbedding` model, the vision tower as an `ImageEmbedding` model),
//! so text queries embed into the same 512-dimensional space as images.
//! Text-only use of this model is first-class, not a degraded path.

use fastembed::{
    EmbeddingModel, ImageEmbedding, ImageEmbeddingModel, ImageInitOptions, TextEmbedding,
    TextInitOptions,
};
use parking_lot::Mutex;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use crate::error::{EngineError, EngineResult};

use super::registry::ModelDescriptor;
use super::tokenize::{HfTokenCounter, TokenCounter, WhitespaceTokenCounter};
use super::{Embedder, Loader, ModelInfo};

struct TextTower {
    model: Mutex<TextEmbedding>,
}

struct VisionTower {
    model: Mutex<ImageEmbedding>,
}

pub struct ClipEmbedder {
    descriptor: &'static ModelDescriptor,
    cache_dir: PathBuf,
    text_loader: Loader<TextTower>,
    vision_loader: Loader<VisionTower>,
    tokenizer: Mutex<Option<Arc<dyn TokenCounter>>>,
}

impl ClipEmbedder {
    pub fn new(descriptor: &'static ModelDescriptor, cache_dir: PathBuf) -> EngineResult<Self> {
        Ok(Self {
            descriptor,
            cache_dir,
            text_loader: Loader::new(),
            vision_loader: Loader::new(),
            tokenizer: Mutex::new(None),
        })
    }

    fn ensure_text_tower(&self) -> EngineResult<Arc<TextTower>> {
        self.text_loader.get_or_load(self.descriptor.name, || {
            info!(model = self.descriptor.name, "loading CLIP text tower");
            let options = TextInitOptions::new(EmbeddingModel::ClipVitB32)
                .with_cache_dir(self.cache_dir.clone())
                .with_show_download_progress(false);
            let model = TextEmbedding::try_new(options).map_err(|e| {
                EngineError::ModelLoadFailure {
                    model: self.descriptor.name.to_string(),
                    detail: format!("text tower: {e}"),
                }
            })?;
            Ok(TextTower { model: Mutex::new(model) })
        })
    }

    fn ensure_vision_tower(&self) -> EngineResult<Arc<VisionTower>> {
        self.vision_loader.get_or_load(self.descriptor.name, || {
            info!(model = self.descriptor.name, "loading CLIP vision tower");
            let options = ImageInitOptions::new(ImageEmbeddingModel::ClipVitB32)
                .with_cache_dir(self.cache_dir.clone())
                .with_show_download_progress(false);
            let model = ImageEmbedding::try_new(options).map_err(|e| {
                EngineError::ModelLoadFailure {
                    model: self.descriptor.name.to_string(),
                    detail: format!("vision tower: {e}"),
                }
            })?;
            Ok(VisionTower { model: Mutex::new(model) })
        })
    }

    fn check_dims(&self, embeddings: &[Vec<f32>]) -> EngineResult<()> {
        if let Some(first) = embeddings.first() {
            if first.len() != self.descriptor.dimensions as usize {
                return Err(EngineError::DimensionMismatch {
                    expected: self.descriptor.dimensions,
                    actual: first.len() as u32,
                });
            }
        }
        Ok(())
    }
}

impl Embedder for ClipEmbedder {
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
        self.text_loader.is_loaded() || self.vision_loader.is_loaded()
    }

    fn load(&self) -> EngineResult<()> {
        self.ensure_text_tower().map(|_| ())
    }

    fn embed_text(&self, texts: &[String]) -> EngineResult<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let tower = self.ensure_text_tower()?;
        let mut model = tower.model.lock();
        let embeddings = model
            .embed(texts.to_vec(), Some(self.descriptor.recommended_batch_size as usize))
            .map_err(|e| EngineError::TransientEmbedFailure(e.to_string()))?;
        self.check_dims(&embeddings)?;
        Ok(embeddings)
    }

    fn embed_image(&self, images: &[Vec<u8>]) -> EngineResult<Vec<Vec<f32>>> {
        if images.is_empty() {
            return Ok(Vec::new());
        }
        let tower = self.ensure_vision_tower()?;

        // The vision tower reads files; spill the byte payloads into a temp
        // directory that lives for the duration of the call.
        let dir = tempfile::tempdir()?;
        let mut paths = Vec::with_capacity(images.len());
        for (i, bytes) in images.iter().enumerate() {
            let path = dir.path().join(format!("img-{i}"));
            let mut file = std::fs::File::create(&path)?;
            file.write_all(bytes)?;
            paths.push(path);
        }

        let mut model = tower.model.lock();
        let embeddings = model
            .embed(paths, Some(self.descriptor.image_batch_size as usize))
            .map_err(|e| EngineError::TransientEmbedFailure(e.to_string()))?;
        self.check_dims(&embeddings)?;
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
        self.text_loader.unload();
        self.vision_loader.unload();
        *self.tokenizer.lock() = None;
    }

    fn approx_bytes(&self) -> u64 {
        let mut total = 0u64;
        if self.text_loader.is_loaded() {
            total += 250_000_000;
        }
        if self.vision_loader.is_loaded() {
            total += 350_000_000;
        }
        total
    }
}
