//! Memory-aware, progress-reported batching for embedding calls.
//!
//! Items run in input order; failed items are reported per-index, never
//! silently dropped. Transient failures retry with exponential backoff;
//! memory pressure triggers an eviction pass, then a one-shot batch halving
//! before an OOM-class error surfaces.

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{EngineError, EngineResult};
use crate::resources::ResourceManager;

/// Default batch sizes by payload weight: text is cheap, images are not.
pub const DEFAULT_TEXT_BATCH: usize = 128;
pub const DEFAULT_IMAGE_BATCH: usize = 16;

const MAX_RETRIES: usize = 3;
const BACKOFF_BASE_MS: u64 = 200;

#[derive(Debug, Clone, Copy)]
pub struct BatchProgress {
    pub completed: usize,
    pub total: usize,
}

pub type ProgressFn = Arc<dyn Fn(BatchProgress) + Send + Sync>;

#[derive(Debug)]
pub struct BatchFailure {
    /// Index into the caller's item slice.
    pub index: usize,
    pub error: String,
}

#[derive(Debug, Default)]
pub struct BatchOutcome {
    /// One slot per input item, in input order; `None` marks a failed item.
    pub vectors: Vec<Option<Vec<f32>>>,
    pub failures: Vec<BatchFailure>,
}

impl BatchOutcome {
    pub fn succeeded(&self) -> usize {
        self.vectors.iter().filter(|v| v.is_some()).count()
    }
}

pub struct BatchOptimizer {
    resources: Arc<ResourceManager>,
}

impl BatchOptimizer {
    pub fn new(resources: Arc<ResourceManager>) -> Self {
        Self { resources }
    }

    /// Embeds `items` through `embed` in batches of `batch_size`.
    /// Synchronous by design: model inference is blocking, so callers run
    /// this inside `spawn_blocking`.
    pub fn run<T, F>(
        &self,
        items: &[T],
        batch_size: usize,
        embed: F,
        progress: Option<ProgressFn>,
        cancel: &CancellationToken,
    ) -> EngineResult<BatchOutcome>
    where
        T: Clone,
        F: Fn(&[T]) -> EngineResult<Vec<Vec<f32>>>,
    {
        let batch_size = batch_size.max(1);
        let mut outcome = BatchOutcome {
            vectors: vec![None; items.len()],
            failures: Vec::new(),
        };

        let mut completed = 0usize;
        for batch_start in (0..items.len()).step_by(batch_size) {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }

            // Release idle heavyweights before the next allocation spike.
            self.resources.prepare_for_allocation();

            let batch_end = (batch_start + batch_size).min(items.len());
            let batch = &items[batch_start..batch_end];

            match self.run_batch(batch, &embed, cancel)? {
                Ok(vectors) => {
                    for (offset, vector) in vectors.into_iter().enumerate() {
                        outcome.vectors[batch_start + offset] = Some(vector);
                    }
                }
                Err(detail) => {
                    warn!(
                        batch_start,
                        batch_len = batch.len(),
                        error = %detail,
                        "batch failed after retries; items reported individually"
                    );
                    for offset in 0..batch.len() {
                        outcome.failures.push(BatchFailure {
                            index: batch_start + offset,
                            error: detail.clone(),
                        });
                    }
                }
            }

            completed += batch.len();
            if let Some(report) = &progress {
                report(BatchProgress { completed, total: items.len() });
            }
        }

        Ok(outcome)
    }

    /// One batch with retries and the memory-halving path. The outer
    /// `EngineResult` carries aborts (cancellation, OOM); the inner `Result`
    /// distinguishes a batch that merely failed its items.
    fn run_batch<T, F>(
        &self,
        batch: &[T],
        embed: &F,
        cancel: &CancellationToken,
    ) -> EngineResult<Result<Vec<Vec<f32>>, String>>
    where
        T: Clone,
        F: Fn(&[T]) -> EngineResult<Vec<Vec<f32>>>,
    {
        if self.resources.over_threshold() {
            self.resources.evict_idle();
            if self.resources.over_threshold() && batch.len() > 1 {
                // Halve once: two sub-batches, no further subdivision.
                debug!(batch_len = batch.len(), "memory pressure: halving batch");
                let mid = batch.len() / 2;
                let first = self.embed_with_retries(&batch[..mid], embed, cancel)?;
                let second = self.embed_with_retries(&batch[mid..], embed, cancel)?;
                return Ok(match (first, second) {
                    (Ok(mut head), Ok(tail)) => {
                        head.extend(tail);
                        Ok(head)
                    }
                    (Err(e), _) | (_, Err(e)) => {
                        if self.resources.over_threshold() {
                            return Err(EngineError::Internal(anyhow::anyhow!(
                                "memory budget exhausted while embedding (threshold {} MB): {e}",
                                self.resources.memory_threshold_bytes() / (1024 * 1024)
                            )));
                        }
                        Err(e)
                    }
                });
            }
        }

        self.embed_with_retries(batch, embed, cancel)
    }

    fn embed_with_retries<T, F>(
        &self,
        batch: &[T],
        embed: &F,
        cancel: &CancellationToken,
    ) -> EngineResult<Result<Vec<Vec<f32>>, String>>
    where
        T: Clone,
        F: Fn(&[T]) -> EngineResult<Vec<Vec<f32>>>,
    {
        let mut last_error = String::new();
        for attempt in 0..=MAX_RETRIES {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            if attempt > 0 {
                let backoff = BACKOFF_BASE_MS * (1u64 << (attempt - 1));
                debug!(attempt, backoff_ms = backoff, "retrying failed embed batch");
                std::thread::sleep(Duration::from_millis(backoff));
            }

            match embed(batch) {
                Ok(vectors) => {
                    if vectors.len() != batch.len() {
                        return Ok(Err(format!(
                            "embedder returned {} vectors for {} inputs",
                            vectors.len(),
                            batch.len()
                        )));
                    }
                    return Ok(Ok(vectors));
                }
                // Only transient failures are retried locally; anything else
                // propagates to the pipeline boundary.
                Err(EngineError::TransientEmbedFailure(detail)) => {
                    last_error = detail;
                }
                Err(other) => return Err(other),
            }
        }
        Ok(Err(last_error))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResourceConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn optimizer() -> BatchOptimizer {
        let resources = ResourceManager::new(ResourceConfig {
            // High threshold so tests never trip the memory path.
            memory_threshold_mb: 1 << 20,
            cleanup_interval_ms: 5000,
            idle_eviction_secs: 300,
            enable_gc: false,
            auto_cleanup: false,
        })
        .unwrap();
        BatchOptimizer::new(resources)
    }

    fn echo_embed(batch: &[String]) -> EngineResult<Vec<Vec<f32>>> {
        Ok(batch.iter().map(|s| vec![s.len() as f32]).collect())
    }

    #[test]
    fn preserves_input_order_across_batches() {
        let items: Vec<String> = (0..25).map(|i| "x".repeat(i + 1)).collect();
        let outcome = optimizer()
            .run(&items, 4, echo_embed, None, &CancellationToken::new())
            .unwrap();
        assert_eq!(outcome.succeeded(), 25);
        for (i, vector) in outcome.vectors.iter().enumerate() {
            assert_eq!(vector.as_ref().unwrap()[0], (i + 1) as f32);
        }
    }

    #[test]
    fn transient_failures_are_retried_then_succeed() {
        let attempts = AtomicUsize::new(0);
        let flaky = |batch: &[String]| {
            if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(EngineError::TransientEmbedFailure("warming up".into()))
            } else {
                echo_embed(batch)
            }
        };
        let items = vec!["a".to_string(), "bb".to_string()];
        let outcome = optimizer()
            .run(&items, 8, flaky, None, &CancellationToken::new())
            .unwrap();
        assert_eq!(outcome.succeeded(), 2);
        assert!(outcome.failures.is_empty());
        assert!(attempts.load(Ordering::SeqCst) >= 3);
    }

    #[test]
    fn exhausted_retries_report_items_not_dropped() {
        let always_fail = |_batch: &[String]| -> EngineResult<Vec<Vec<f32>>> {
            Err(EngineError::TransientEmbedFailure("model hiccup".into()))
        };
        let items = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let outcome = optimizer()
            .run(&items, 2, always_fail, None, &CancellationToken::new())
            .unwrap();
        assert_eq!(outcome.succeeded(), 0);
        assert_eq!(outcome.failures.len(), 3);
        let indexes: Vec<usize> = outcome.failures.iter().map(|f| f.index).collect();
        assert_eq!(indexes, vec![0, 1, 2]);
    }

    #[test]
    fn capability_errors_propagate_instead_of_retrying() {
        let calls = AtomicUsize::new(0);
        let incapable = |_batch: &[String]| -> EngineResult<Vec<Vec<f32>>> {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(EngineError::Capability("no image support".into()))
        };
        let items = vec!["a".to_string()];
        let err = optimizer()
            .run(&items, 8, incapable, None, &CancellationToken::new())
            .unwrap_err();
        assert_eq!(err.kind(), "CapabilityError");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cancellation_aborts_between_batches() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let items = vec!["a".to_string()];
        let err = optimizer().run(&items, 8, echo_embed, None, &cancel).unwrap_err();
        assert_eq!(err.kind(), "Cancelled");
    }

    #[test]
    fn progress_is_reported_per_batch() {
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = seen.clone();
        let progress: ProgressFn = Arc::new(move |p: BatchProgress| {
            sink.lock().push((p.completed, p.total));
        });

        let items: Vec<String> = (0..10).map(|i| i.to_string()).collect();
        optimizer()
            .run(&items, 4, echo_embed, Some(progress), &CancellationToken::new())
            .unwrap();
        assert_eq!(*seen.lock(), vec![(4, 10), (8, 10), (10, 10)]);
    }
}
