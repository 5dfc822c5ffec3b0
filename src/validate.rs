//! Mode/model compatibility validation.
//!
//! Four rules guard a corpus over its lifetime: a text-only model cannot
//! serve a multimodal corpus; a multimodal model may serve a text corpus
//! (with a warning); switching models requires an explicit rebuild; declared
//! dimensions must agree everywhere vectors are stored.

use tracing::warn;

use crate::embed::registry::ModelDescriptor;
use crate::embed::Task;
use crate::error::{EngineError, EngineResult};
use crate::types::{Mode, SystemInfo};

/// Outcome of a successful validation; `warning` carries R2's advisory.
#[derive(Debug, Clone, Default)]
pub struct Validation {
    pub warning: Option<String>,
}

/// R1/R2: is this model usable in this mode at all?
pub fn validate_mode_model(mode: Mode, descriptor: &ModelDescriptor) -> EngineResult<Validation> {
    match mode {
        Mode::Multimodal => {
            if !descriptor.supports(Task::EmbedImage) {
                return Err(EngineError::Capability(format!(
                    "model '{}' is text-only and cannot serve a multimodal corpus",
                    descriptor.name
                )));
            }
            Ok(Validation::default())
        }
        Mode::Text => {
            if descriptor.supports(Task::EmbedImage) {
                let warning = format!(
                    "model '{}' is multimodal but the corpus mode is text; image \
                     inputs will be rejected at ingest",
                    descriptor.name
                );
                warn!("{warning}");
                Ok(Validation { warning: Some(warning) })
            } else {
                Ok(Validation::default())
            }
        }
    }
}

/// R3: a corpus keeps its model unless the caller explicitly rebuilds.
pub fn validate_against_existing(
    existing: &SystemInfo,
    mode: Mode,
    descriptor: &ModelDescriptor,
    force_rebuild: bool,
) -> EngineResult<()> {
    if force_rebuild {
        return Ok(());
    }
    if existing.model_name != descriptor.name {
        return Err(EngineError::ModelMismatch {
            stored: existing.model_name.clone(),
            requested: descriptor.name.to_string(),
        });
    }
    if existing.mode != mode {
        return Err(EngineError::ModeMismatch(format!(
            "corpus mode is '{}' but the caller requested '{}'; re-ingest with \
             force_rebuild=true to change modes",
            existing.mode.as_str(),
            mode.as_str()
        )));
    }
    // Same model name must mean same dimensions; anything else is a registry
    // drift that only a rebuild can repair.
    validate_dimensions(existing.model_dimensions, descriptor.dimensions)?;
    Ok(())
}

/// R4: dimensions declared by the model must equal the stored ones.
pub fn validate_dimensions(stored: u32, declared: u32) -> EngineResult<()> {
    if stored != declared {
        return Err(EngineError::DimensionMismatch { expected: stored, actual: declared });
    }
    Ok(())
}
