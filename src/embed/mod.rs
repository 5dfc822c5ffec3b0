//! Polymorphic embedding layer.
//!
//! Backends implement the [`Embedder`] trait; the registry maps model names
//! to descriptors and constructors. Embedding identity is content-addressed:
//! `embedding_id = sha256(normalized content, content type, model
//! fingerprint)`, so identical input under the same model is the same record
//! everywhere.

pub mod clip;
pub mod hashed;
pub mod registry;
pub mod text;
pub mod tokenize;

use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::sync::Arc;

use crate::error::{EngineError, EngineResult};
use crate::types::{ContentKind, ModelType};
use tokenize::TokenCounter;

/// Tasks a model can perform; used by the validator and capability checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Task {
    EmbedText,
    EmbedImage,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelInfo {
    pub name: String,
    pub model_type: ModelType,
    pub dimensions: u32,
    pub version: String,
    pub supported_tasks: Vec<Task>,
}

impl ModelInfo {
    pub fn supports(&self, task: Task) -> bool {
        self.supported_tasks.contains(&task)
    }

    /// Namespaces embedding ids: same content under a different model (or a
    /// different dimensionality) must produce a different id.
    pub fn fingerprint(&self) -> String {
        format!("{}@{}", self.name, self.dimensions)
    }
}

/// Capability-polymorphic embedder. Image embedding defaults to a capability
/// failure so text-only backends only implement what they support.
pub trait Embedder: Send + Sync {
    fn model_info(&self) -> ModelInfo;

    fn is_loaded(&self) -> bool;

    /// Loads the underlying model. Idempotent; concurrent callers share one
    /// load attempt.
    fn load(&self) -> EngineResult<()>;

    fn embed_text(&self, texts: &[String]) -> EngineResult<Vec<Vec<f32>>>;

    fn embed_image(&self, images: &[Vec<u8>]) -> EngineResult<Vec<Vec<f32>>> {
        let _ = images;
        Err(EngineError::Capability(format!(
            "model '{}' does not support image embedding",
            self.model_info().name
        )))
    }

    /// The tokenizer the chunker must count with.
    fn token_counter(&self) -> Arc<dyn TokenCounter>;

    /// Releases the loaded model. Must be safe to call repeatedly.
    fn cleanup(&self);

    /// Rough resident footprint once loaded, for eviction accounting.
    fn approx_bytes(&self) -> u64 {
        0
    }
}

/// Canonical text normalization applied before hashing: line endings become
/// `\n`, outer whitespace is trimmed. Embedders receive the normalized text
/// too, so the id always describes exactly what was embedded.
pub fn normalize_text(text: &str) -> String {
    text.replace("\r\n", "\n").trim().to_string()
}

/// Content-addressed embedding identity.
pub fn embedding_id(content: &[u8], content_type: ContentKind, fingerprint: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    hasher.update([0x1e]);
    hasher.update(content_type.as_str().as_bytes());
    hasher.update([0x1e]);
    hasher.update(fingerprint.as_bytes());
    format!("{:x}", hasher.finalize())
}

pub fn text_embedding_id(text: &str, fingerprint: &str) -> String {
    embedding_id(normalize_text(text).as_bytes(), ContentKind::Text, fingerprint)
}

// ---------------------------------------------------------------------------
// Lazy loader
// ---------------------------------------------------------------------------

enum LoadState<T> {
    Unloaded,
    Loading,
    Loaded(Arc<T>),
    Failed(String),
}

/// Single-flight lazy loader: the first caller performs the load, concurrent
/// callers park on the condvar and share the outcome. A failure is sticky
/// until `unload` (model load failures are not transient).
pub(crate) struct Loader<T> {
    state: Mutex<LoadState<T>>,
    ready: Condvar,
}

impl<T> Loader<T> {
    pub fn new() -> Self {
        Self { state: Mutex::new(LoadState::Unloaded), ready: Condvar::new() }
    }

    pub fn is_loaded(&self) -> bool {
        matches!(*self.state.lock(), LoadState::Loaded(_))
    }

    pub fn get_or_load<F>(&self, model_name: &str, load: F) -> EngineResult<Arc<T>>
    where
        F: FnOnce() -> EngineResult<T>,
    {
        {
            let mut state = self.state.lock();
            loop {
                match &*state {
                    LoadState::Loaded(model) => return Ok(model.clone()),
                    LoadState::Failed(detail) => {
                        return Err(EngineError::ModelLoadFailure {
                            model: model_name.to_string(),
                            detail: detail.clone(),
                        });
                    }
                    LoadState::Loading => {
                        self.ready.wait(&mut state);
                    }
                    LoadState::Unloaded => {
                        *state = LoadState::Loading;
                        break;
                    }
                }
            }
        }

        let outcome = load();

        let mut state = self.state.lock();
        match outcome {
            Ok(model) => {
                let model = Arc::new(model);
                *state = LoadState::Loaded(model.clone());
                self.ready.notify_all();
                Ok(model)
            }
            Err(err) => {
                *state = LoadState::Failed(err.to_string());
                self.ready.notify_all();
                Err(err)
            }
        }
    }

    pub fn unload(&self) {
        let mut state = self.state.lock();
        *state = LoadState::Unloaded;
        self.ready.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedding_ids_are_deterministic_and_namespaced() {
        let a = text_embedding_id("hello world", "all-MiniLM-L6-v2@384");
        let b = text_embedding_id("hello world", "all-MiniLM-L6-v2@384");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);

        // Different fingerprint, different id.
        let c = text_embedding_id("hello world", "bge-base-en-v1.5@768");
        assert_ne!(a, c);

        // Different content type, different id.
        let d = embedding_id(b"hello world", ContentKind::Image, "all-MiniLM-L6-v2@384");
        assert_ne!(a, d);
    }

    #[test]
    fn normalization_makes_line_ending_variants_identical() {
        assert_eq!(
            text_embedding_id("a\r\nb\n", "m@1"),
            text_embedding_id("a\nb", "m@1"),
        );
        assert_eq!(
            text_embedding_id("  padded  ", "m@1"),
            text_embedding_id("padded", "m@1"),
        );
    }

    #[test]
    fn loader_runs_load_once_and_shares_the_result() {
        let loader = Loader::new();
        let mut calls = 0;
        let first = loader.get_or_load("m", || {
            calls += 1;
            Ok(42u32)
        });
        assert_eq!(*first.unwrap(), 42);
        assert!(loader.is_loaded());

        let second = loader.get_or_load("m", || {
            calls += 1;
            Ok(7u32)
        });
        assert_eq!(*second.unwrap(), 42);
        assert_eq!(calls, 1);
    }

    #[test]
    fn loader_failure_is_sticky_until_unload() {
        let loader: Loader<u32> = Loader::new();
        let err = loader
            .get_or_load("broken", || Err(EngineError::Internal(anyhow::anyhow!("boom"))))
            .unwrap_err();
        assert_eq!(err.kind(), "InternalError");

        // The stored failure is reported without re-running the closure.
        let err = loader.get_or_load("broken", || Ok(1u32)).unwrap_err();
        assert_eq!(err.kind(), "ModelLoadFailure");

        loader.unload();
        assert_eq!(*loader.get_or_load("broken", || Ok(1u32)).unwrap(), 1);
    }
}
