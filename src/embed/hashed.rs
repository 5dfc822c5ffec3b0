//! Deterministic offline embedders.
//!
//! `hash-embed-*` models produce feature-hashed bag-of-token vectors: each
//! token contributes a fixed pseudo-random direction, so cosine similarity
//! tracks token overlap. No weights, no downloads, fully deterministic:
//! exactly what the test suite and air-gapped smoke runs need.
//! They register in the model registry like any other model.

use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::EngineResult;
use crate::types::ModelType;

use super::registry::ModelDescriptor;
use super::tokenize::{TokenCounter, WhitespaceTokenCounter};
use super::{Embedder, ModelInfo, Task};

static HASH_MODELS: &[ModelDescriptor] = &[
    ModelDescriptor {
        name: "hash-embed-384",
        model_type: ModelType::SentenceTransformer,
        dimensions: 384,
        max_context: 8192,
        supported_tasks: &[Task::EmbedText],
        recommended_chunk_size: 500,
        recommended_overlap: 100,
        recommended_batch_size: 256,
        image_batch_size: 0,
        version: "1",
        tokenizer_repo: "",
    },
    ModelDescriptor {
        name: "hash-embed-768",
        model_type: ModelType::SentenceTransformer,
        dimensions: 768,
        max_context: 8192,
        supported_tasks: &[Task::EmbedText],
        recommended_chunk_size: 500,
        recommended_overlap: 100,
        recommended_batch_size: 256,
        image_batch_size: 0,
        version: "1",
        tokenizer_repo: "",
    },
    ModelDescriptor {
        name: "hash-clip-512",
        model_type: ModelType::Clip,
        dimensions: 512,
        max_context: 8192,
        supported_tasks: &[Task::EmbedText, Task::EmbedImage],
        recommended_chunk_size: 500,
        recommended_overlap: 100,
        recommended_batch_size: 128,
        image_batch_size: 16,
        version: "1",
        tokenizer_repo: "",
    },
];

pub struct HashEmbedder {
    descriptor: &'static ModelDescriptor,
    loaded: AtomicBool,
}

impl HashEmbedder {
    pub fn descriptor_for(name: &str) -> Option<&'static ModelDescriptor> {
        HASH_MODELS.iter().find(|m| m.name == name)
    }

    pub fn from_name(name: &str) -> EngineResult<Self> {
        let descriptor = Self::descriptor_for(name).ok_or_else(|| {
            crate::error::EngineError::UnsupportedModel(name.to_string())
        })?;
        Ok(Self { descriptor, loaded: AtomicBool::new(false) })
    }

    fn direction(seed: &[u8], dims: usize) -> Vec<f32> {
        let digest = Sha256::digest(seed);
        let mut state = u64::from_le_bytes(digest[..8].try_into().expect("digest is 32 bytes"));
        (0..dims)
            .map(|_| {
                state = state.wrapping_add(0x9e3779b97f4a7c15);
                let mut z = state;
                z = (z ^ (z >> 30)).wrapping_mul(0xbf58476d1ce4e5b9);
                z = (z ^ (z >> 27)).wrapping_mul(0x94d049bb133111eb);
                z ^= z >> 31;
                ((z >> 11) as f64 / (1u64 << 53) as f64) as f32 - 0.5
            })
            .collect()
    }

    fn normalize(mut v: Vec<f32>) -> Vec<f32> {
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > f32::EPSILON {
            for x in v.iter_mut() {
                *x /= norm;
            }
        }
        v
    }

    fn embed_one_text(&self, text: &str) -> Vec<f32> {
        let dims = self.descriptor.dimensions as usize;
        let mut acc = vec![0.0f32; dims];
        let mut any = false;
        for token in text.split_whitespace() {
            let token: String = token
                .chars()
                .filter(|c| c.is_alphanumeric())
                .collect::<String>()
                .to_lowercase();
            if token.is_empty() {
                continue;
            }
            any = true;
            for (a, d) in acc.iter_mut().zip(Self::direction(token.as_bytes(), dims)) {
                *a += d;
            }
        }
        if !any {
            acc = Self::direction(text.as_bytes(), dims);
        }
        Self::normalize(acc)
    }
}

impl Embedder for HashEmbedder {
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
        self.loaded.load(Ordering::Acquire)
    }

    fn load(&self) -> EngineResult<()> {
        self.loaded.store(true, Ordering::Release);
        Ok(())
    }

    fn embed_text(&self, texts: &[String]) -> EngineResult<Vec<Vec<f32>>> {
        self.load()?;
        Ok(texts.iter().map(|t| self.embed_one_text(t)).collect())
    }

    fn embed_image(&self, images: &[Vec<u8>]) -> EngineResult<Vec<Vec<f32>>> {
        if !self.descriptor.supports(Task::EmbedImage) {
            return Err(crate::error::EngineError::Capability(format!(
                "model '{}' does not support image embedding",
                self.descriptor.name
            )));
        }
        self.load()?;
        let dims = self.descriptor.dimensions as usize;
        Ok(images
            .iter()
            .map(|bytes| Self::normalize(Self::direction(bytes, dims)))
            .collect())
    }

    fn token_counter(&self) -> Arc<dyn TokenCounter> {
        Arc::new(WhitespaceTokenCounter)
    }

    fn cleanup(&self) {
        self.loaded.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cosine(a: &[f32], b: &[f32]) -> f32 {
        a.iter().zip(b).map(|(x, y)| x * y).sum()
    }

    #[test]
    fn identical_text_embeds_identically() {
        let embedder = HashEmbedder::from_name("hash-embed-384").unwrap();
        let out = embedder
            .embed_text(&["the quick brown fox".into(), "the quick brown fox".into()])
            .unwrap();
        assert_eq!(out[0], out[1]);
        assert_eq!(out[0].len(), 384);
    }

    #[test]
    fn similarity_tracks_token_overlap() {
        let embedder = HashEmbedder::from_name("hash-embed-384").unwrap();
        let out = embedder
            .embed_text(&[
                "rust memory safety borrow checker".into(),
                "rust borrow checker explained".into(),
                "gardening tips for tomatoes".into(),
            ])
            .unwrap();
        let related = cosine(&out[0], &out[1]);
        let unrelated = cosine(&out[0], &out[2]);
        assert!(
            related > unrelated,
            "overlapping text must score higher ({related} vs {unrelated})"
        );
    }

    #[test]
    fn text_only_variant_rejects_images() {
        let embedder = HashEmbedder::from_name("hash-embed-768").unwrap();
        let err = embedder.embed_image(&[vec![1, 2, 3]]).unwrap_err();
        assert_eq!(err.kind(), "CapabilityError");
    }

    #[test]
    fn clip_variant_embeds_images_deterministically() {
        let embedder = HashEmbedder::from_name("hash-clip-512").unwrap();
        let a = embedder.embed_image(&[vec![9, 9, 9]]).unwrap();
        let b = embedder.embed_image(&[vec![9, 9, 9]]).unwrap();
        assert_eq!(a, b);
        assert_eq!(a[0].len(), 512);
    }
}
