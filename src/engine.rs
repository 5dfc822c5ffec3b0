//! The engine façade: the public operations surface consumed by the HTTP
//! routes, CLIs and tests. Composes the stores, index, embedders, rerankers
//! and pipelines; owns the corpus writer lock.

use dashmap::DashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{AppConfig, IngestOptions, ResetOptions, SearchOptions};
use crate::embed::registry;
use crate::embed::Embedder;
use crate::error::{EngineError, EngineResult};
use crate::index::{SharedIndex, VectorIndex};
use crate::pipeline::ingest::{self, IngestDeps, IngestSource};
use crate::pipeline::search::{self, SearchDeps};
use crate::preprocess::PreprocessorRegistry;
use crate::rerank::{build_reranker, Reranker};
use crate::resources::{EmbedderResource, ResourceManager};
use crate::store::{ContentFormat, ContentPayload, ContentStore, MetadataStore};
use crate::types::{
    EngineStats, IngestReport, ModelSpecificConfig, ResetReport, RerankStrategy, SearchResponse,
    StatsModelInfo,
};
use crate::validate;

pub struct Engine {
    config: AppConfig,
    metadata: Arc<MetadataStore>,
    content: Arc<ContentStore>,
    index: SharedIndex,
    index_path: PathBuf,
    resources: Arc<ResourceManager>,
    preprocessors: Arc<PreprocessorRegistry>,
    embedders: DashMap<String, Arc<dyn Embedder>>,
    rerankers: DashMap<String, Arc<dyn Reranker>>,
    /// One writer per corpus: every mutating operation serializes here.
    writer_lock: tokio::sync::Mutex<()>,
    model_cache_dir: PathBuf,
}

impl Engine {
    pub fn open(config: AppConfig) -> EngineResult<Arc<Self>> {
        let data_dir = PathBuf::from(&config.data_dir);
        std::fs::create_dir_all(&data_dir)?;

        let metadata = Arc::new(MetadataStore::open(&data_dir.join("metadata.db"))?);
        let content = Arc::new(ContentStore::new(config.content.clone(), metadata.clone())?);
        let resources = ResourceManager::new(config.resources.clone())?;
        let index_path = data_dir.join("index.bin");
        let model_cache_dir = data_dir.join("models");

        let index: SharedIndex = Arc::new(parking_lot::RwLock::new(None));
        // Eagerly load an existing index when the corpus is already built;
        // dims come from SystemInfo so a drifted file fails fast.
        if index_path.exists() {
            if let Some(info) = metadata.get_system_info()? {
                match VectorIndex::load(&index_path, Some(info.model_dimensions)) {
                    Ok(loaded) => {
                        info!(size = loaded.len(), dims = loaded.dims(), "vector index loaded at startup");
                        *index.write() = Some(loaded);
                    }
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => warn!(error = %e, "existing index unreadable; it will be rebuilt on ingest"),
                }
            }
        }

        Ok(Arc::new(Self {
            config,
            metadata,
            content,
            index,
            index_path,
            resources,
            preprocessors: Arc::new(PreprocessorRegistry::default()),
            embedders: DashMap::new(),
            rerankers: DashMap::new(),
            writer_lock: tokio::sync::Mutex::new(()),
            model_cache_dir,
        }))
    }

    /// Opens an engine with a caller-supplied embedder bound to its model
    /// name. This is the seam for custom embedding backends (and for the
    /// deterministic offline embedders in tests).
    pub fn open_with_embedder(
        config: AppConfig,
        embedder: Arc<dyn Embedder>,
    ) -> EngineResult<Arc<Self>> {
        let engine = Self::open(config)?;
        let name = embedder.model_info().name.clone();
        engine
            .resources
            .register(Arc::new(EmbedderResource { embedder: embedder.clone() }));
        engine.embedders.insert(name, embedder);
        Ok(engine)
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn resources(&self) -> &Arc<ResourceManager> {
        &self.resources
    }

    fn embedder_for(&self, model: &str) -> EngineResult<Arc<dyn Embedder>> {
        if let Some(existing) = self.embedders.get(model) {
            return Ok(existing.value().clone());
        }
        self.resources.prepare_for_allocation();
        let embedder = registry::build_embedder(model, self.model_cache_dir.clone())?;
        self.resources
            .register(Arc::new(EmbedderResource { embedder: embedder.clone() }));
        self.embedders.insert(model.to_string(), embedder.clone());
        Ok(embedder)
    }

    fn reranker_for(&self, strategy: RerankStrategy) -> Option<Arc<dyn Reranker>> {
        if strategy == RerankStrategy::Disabled {
            return None;
        }
        let key = strategy.as_str().to_string();
        if let Some(existing) = self.rerankers.get(&key) {
            return Some(existing.value().clone());
        }
        let reranker = build_reranker(strategy, self.model_cache_dir.clone());
        self.resources.register(Arc::new(crate::resources::RerankerResource {
            name: key.clone(),
            reranker: reranker.clone(),
        }));
        self.rerankers.insert(key, reranker.clone());
        Some(reranker)
    }

    /// Links a caller token to the process-shutdown token so either can stop
    /// the operation; the guard tears the relay task down afterwards.
    fn linked_token(
        &self,
        caller: &CancellationToken,
    ) -> (CancellationToken, tokio_util::sync::DropGuard) {
        let merged = CancellationToken::new();
        let relay = merged.clone();
        let a = caller.clone();
        let b = self.resources.cancellation_token();
        let stop = merged.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = a.cancelled() => relay.cancel(),
                _ = b.cancelled() => relay.cancel(),
                _ = relay.cancelled() => {}
            }
        });
        let guard = stop.drop_guard();
        (merged, guard)
    }

    // ------------------------------------------------------------------
    // Public operations
    // ------------------------------------------------------------------

    pub async fn ingest(
        &self,
        source: IngestSource,
        options: IngestOptions,
        cancel: CancellationToken,
    ) -> EngineResult<IngestReport> {
        let _writer = self.writer_lock.lock().await;
        let (cancel, _guard) = self.linked_token(&cancel);

        let embedder = self.embedder_for(&options.model)?;
        self.resources.touch(&format!("embedder:{}", options.model));

        let deps = IngestDeps {
            metadata: self.metadata.clone(),
            content: self.content.clone(),
            index: self.index.clone(),
            index_path: self.index_path.clone(),
            resources: self.resources.clone(),
            preprocessors: self.preprocessors.clone(),
            max_file_size: self.config.content.max_file_size,
        };

        tokio::task::spawn_blocking(move || {
            ingest::run_sync(&deps, embedder, source, options, cancel)
        })
        .await
        .map_err(|e| EngineError::Internal(anyhow::anyhow!("ingest task panicked: {e}")))?
    }

    pub async fn search(
        &self,
        query: &str,
        options: SearchOptions,
        cancel: CancellationToken,
    ) -> EngineResult<SearchResponse> {
        let Some(system) = self.metadata.get_system_info()? else {
            // No corpus yet: an empty result, not an error.
            return Ok(SearchResponse::default());
        };

        let (cancel, _guard) = self.linked_token(&cancel);
        self.ensure_index_loaded(system.model_dimensions).await?;

        let embedder = self.embedder_for(&system.model_name)?;
        self.resources.touch(&format!("embedder:{}", system.model_name));

        let rerank_requested = options.rerank.unwrap_or(true);
        let strategy = options.reranking_strategy.unwrap_or(system.reranking_strategy);
        let reranker = rerank_requested.then(|| self.reranker_for(strategy)).flatten();

        let deps = SearchDeps { metadata: self.metadata.clone(), index: self.index.clone() };
        let query = query.to_string();
        let system = system.clone();

        tokio::task::spawn_blocking(move || {
            search::run_sync(&deps, embedder, reranker, &query, options, &system, cancel)
        })
        .await
        .map_err(|e| EngineError::Internal(anyhow::anyhow!("search task panicked: {e}")))?
    }

    async fn ensure_index_loaded(&self, dims: u32) -> EngineResult<()> {
        if self.index.read().is_some() || !self.index_path.exists() {
            return Ok(());
        }
        let index_path = self.index_path.clone();
        let loaded = tokio::task::spawn_blocking(move || {
            VectorIndex::load(&index_path, Some(dims))
        })
        .await
        .map_err(|e| EngineError::Internal(anyhow::anyhow!("index load panicked: {e}")))??;

        let mut guard = self.index.write();
        if guard.is_none() {
            *guard = Some(loaded);
        }
        Ok(())
    }

    pub fn get_content(
        &self,
        content_id: &str,
        format: ContentFormat,
    ) -> EngineResult<ContentPayload> {
        self.content.get(content_id, format)
    }

    pub fn get_content_metadata(
        &self,
        content_id: &str,
    ) -> EngineResult<crate::store::ContentMetadata> {
        self.content.get_metadata(content_id)
    }

    pub fn get_stats(&self) -> EngineResult<EngineStats> {
        let system = self.metadata.get_system_info()?;
        let database_exists = system.is_some() || self.metadata.has_data()?;
        let index_exists = self.index_path.exists();

        let (model_info, compatibility) = match &system {
            Some(info) => {
                let descriptor = registry::descriptor(&info.model_name).ok();
                let model_info = descriptor.map(|d| StatsModelInfo {
                    name: d.name.to_string(),
                    dimensions: d.dimensions,
                    model_specific_config: ModelSpecificConfig {
                        chunk_size: d.recommended_chunk_size,
                        chunk_overlap: d.recommended_overlap,
                        batch_size: d.recommended_batch_size,
                    },
                });
                let mut compatibility = match descriptor {
                    Some(d) => match validate::validate_mode_model(info.mode, d) {
                        Ok(v) => v.warning.unwrap_or_else(|| "ok".to_string()),
                        Err(e) => format!("invalid: {e}"),
                    },
                    None => format!("model '{}' not in registry", info.model_name),
                };
                // Bijection health: every index label must map to a stored
                // chunk and vice versa.
                if let Some(index) = self.index.read().as_ref() {
                    let store_ids = self.metadata.embedding_ids()?;
                    let (orphans, unmapped) = index.bijection_gaps(&store_ids);
                    if !orphans.is_empty() || !unmapped.is_empty() {
                        compatibility = format!(
                            "desync: {} index label(s) and {} stored embedding(s) unmatched; \
                             rebuild recommended",
                            orphans.len(),
                            unmapped.len()
                        );
                    }
                }
                (model_info, Some(compatibility))
            }
            None => (None, None),
        };

        Ok(EngineStats {
            database_exists,
            index_exists,
            mode: system.as_ref().map(|s| s.mode),
            model_info,
            compatibility,
            document_count: self.metadata.document_count()?,
            chunk_count: self.metadata.chunk_count()?,
            index_size: self.index.read().as_ref().map(|i| i.len()).unwrap_or(0),
        })
    }

    pub async fn reset(&self, options: ResetOptions) -> EngineResult<ResetReport> {
        let _writer = self.writer_lock.lock().await;

        let mut report = self.metadata.reset(&options)?;

        if options.full || options.content {
            let removed = self.content.clear()?;
            report.content_objects_removed = report.content_objects_removed.max(removed);
        } else if options.verify {
            self.content.collect_garbage(true)?;
        }

        if options.full || options.index || options.documents {
            *self.index.write() = None;
            if self.index_path.exists() {
                std::fs::remove_file(&self.index_path)?;
                report.index_removed = true;
            }
        }

        info!(full = options.full, "engine reset complete");
        Ok(report)
    }

    /// Flushes durable state and releases every resource. Idempotent; safe
    /// to race with in-flight operations (they are cancelled first).
    pub fn shutdown(&self) {
        if self.resources.is_shut_down() {
            return;
        }
        // Persist the index before models go away; failures here are logged
        // and never propagate out of shutdown.
        let guard = self.index.read();
        if let Some(index) = guard.as_ref() {
            if let Err(e) = index.save(&self.index_path) {
                warn!(error = %e, "failed to flush vector index during shutdown");
            }
        }
        drop(guard);

        // Embedders and rerankers are registered resources; the manager
        // releases them exactly once.
        self.resources.shutdown();
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}
