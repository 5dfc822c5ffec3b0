//! Ingestion pipeline: discovery → preprocessing → chunking → embedding →
//! transactional persistence → index publication.
//!
//! One document is one transaction; a failed batch cannot corrupt the
//! database, and the index file on disk only moves forward at consistent
//! checkpoints. Re-ingesting a source replaces its chunks atomically and
//! embedding dedup keeps the store compact.

use globset::{Glob, GlobSet, GlobSetBuilder};
use ignore::WalkBuilder;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::chunker::Chunker;
use crate::config::{
    is_image_extension, is_text_extension, mime_for_image_extension, IngestOptions, ResetOptions,
};
use crate::embed::registry::{self, ModelDescriptor};
use crate::embed::{embedding_id, normalize_text, Embedder};
use crate::error::{EngineError, EngineResult};
use crate::index::{GraphParams, SharedIndex, VectorIndex};
use crate::preprocess::{PreprocessMode, PreprocessorRegistry};
use crate::resources::ResourceManager;
use crate::store::{ContentStore, MetadataStore, NewChunk};
use crate::types::{ContentKind, IngestReport, Mode, SkippedFile, SystemInfo};
use crate::validate;

use super::batch::{BatchOptimizer, BatchProgress, ProgressFn, DEFAULT_IMAGE_BATCH};

/// What callers can feed the pipeline.
#[derive(Debug, Clone)]
pub enum IngestSource {
    Directory(PathBuf),
    File(PathBuf),
    Blob { name: String, bytes: Vec<u8>, mime: Option<String> },
}

/// Everything the pipeline borrows from the engine.
pub struct IngestDeps {
    pub metadata: Arc<MetadataStore>,
    pub content: Arc<ContentStore>,
    pub index: SharedIndex,
    pub index_path: PathBuf,
    pub resources: Arc<ResourceManager>,
    pub preprocessors: Arc<PreprocessorRegistry>,
    pub max_file_size: usize,
}

struct DiscoveredFile {
    path: PathBuf,
    source: String,
    kind: ContentKind,
}

/// Index checkpoint cadence, in documents.
const CHECKPOINT_EVERY: usize = 16;

/// Runs a whole ingest synchronously; the engine calls this inside
/// `spawn_blocking` under the corpus writer lock.
pub fn run_sync(
    deps: &IngestDeps,
    embedder: Arc<dyn Embedder>,
    source: IngestSource,
    options: IngestOptions,
    cancel: CancellationToken,
) -> EngineResult<IngestReport> {
    let started = Instant::now();
    options.validate()?;

    let descriptor = registry::descriptor(&options.model)?;
    validate::validate_mode_model(options.mode, descriptor)?;

    let existing = deps.metadata.get_system_info()?;
    let is_first_ingest = existing.is_none();
    if let Some(info) = &existing {
        validate::validate_against_existing(info, options.mode, descriptor, options.force_rebuild)?;
    }

    let rebuilding = options.force_rebuild && existing.is_some();
    if rebuilding {
        info!(model = descriptor.name, "force rebuild: discarding corpus artefacts");
        deps.metadata.reset(&ResetOptions {
            documents: true,
            content: true,
            ..Default::default()
        })?;
        deps.content.clear()?;
        *deps.index.write() = None;
        if deps.index_path.exists() {
            std::fs::remove_file(&deps.index_path)?;
        }
    }

    ensure_index(deps, descriptor, rebuilding || is_first_ingest)?;

    // In-memory blobs are spilled to a scratch file so the rest of the
    // pipeline reads every source the same way; the temp dir outlives the
    // run and the stable `blob:<name>` source id keeps re-ingest idempotent.
    let blob_scratch = tempfile::tempdir()?;

    let mut report = IngestReport::default();
    let files = discover(deps, &source, &options, blob_scratch.path(), &mut report)?;
    info!(
        files = files.len(),
        skipped = report.skipped.len(),
        mode = options.mode.as_str(),
        model = descriptor.name,
        "ingest discovery complete"
    );

    let chunker = build_chunker(&options, descriptor, embedder.as_ref())?;
    let optimizer = BatchOptimizer::new(deps.resources.clone());

    for file in &files {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        match ingest_one(
            deps,
            &embedder,
            descriptor,
            &chunker,
            &optimizer,
            &options,
            file,
            &cancel,
        ) {
            Ok((chunks, embedded)) => {
                report.documents_processed += 1;
                report.chunks_created += chunks;
                report.embeddings_generated += embedded;
            }
            Err(e) if e.is_fatal() || matches!(e, EngineError::Cancelled) => return Err(e),
            Err(e) => {
                warn!(source = %file.source, error = %e, "document failed, continuing with the rest");
                report.skipped.push(SkippedFile {
                    path: file.source.clone(),
                    reason: e.to_string(),
                });
            }
        }

        if report.documents_processed % CHECKPOINT_EVERY == 0 && report.documents_processed > 0 {
            save_index(deps)?;
        }
    }

    save_index(deps)?;

    if is_first_ingest || rebuilding {
        write_system_info(deps, &options, descriptor, &embedder)?;
    }

    report.processing_time_ms = started.elapsed().as_millis() as u64;
    info!(
        documents = report.documents_processed,
        chunks = report.chunks_created,
        embeddings = report.embeddings_generated,
        elapsed_ms = report.processing_time_ms,
        "ingest complete"
    );
    Ok(report)
}

fn ensure_index(
    deps: &IngestDeps,
    descriptor: &ModelDescriptor,
    fresh: bool,
) -> EngineResult<()> {
    let mut guard = deps.index.write();
    if guard.is_some() && !fresh {
        validate::validate_dimensions(guard.as_ref().map(|i| i.dims() as u32).unwrap_or(0), descriptor.dimensions)?;
        return Ok(());
    }
    if guard.is_none() && deps.index_path.exists() && !fresh {
        let loaded = VectorIndex::load(&deps.index_path, Some(descriptor.dimensions))?;
        *guard = Some(loaded);
        return Ok(());
    }
    if guard.is_none() {
        *guard = Some(VectorIndex::initialize(
            descriptor.dimensions as usize,
            4096,
            GraphParams::default(),
        ));
    }
    Ok(())
}

fn build_chunker(
    options: &IngestOptions,
    descriptor: &ModelDescriptor,
    embedder: &dyn Embedder,
) -> EngineResult<Chunker> {
    let size = options.chunk_size.unwrap_or(descriptor.recommended_chunk_size) as usize;
    let overlap = options.chunk_overlap.unwrap_or(descriptor.recommended_overlap) as usize;
    Chunker::new(size, overlap, embedder.token_counter())
}

fn build_globset(patterns: &[String]) -> EngineResult<Option<GlobSet>> {
    if patterns.is_empty() {
        return Ok(None);
    }
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern).map_err(|e| {
            EngineError::ConfigValidation(format!("bad glob pattern '{pattern}': {e}"))
        })?;
        builder.add(glob);
    }
    Ok(Some(builder.build().map_err(|e| {
        EngineError::ConfigValidation(format!("glob set: {e}"))
    })?))
}

fn classify_extension(path: &Path, mode: Mode) -> Option<ContentKind> {
    let ext = path.extension().unwrap_or_default().to_string_lossy().to_lowercase();
    if is_text_extension(&ext) {
        Some(ContentKind::Text)
    } else if is_image_extension(&ext) && mode == Mode::Multimodal {
        Some(ContentKind::Image)
    } else {
        None
    }
}

fn discover(
    deps: &IngestDeps,
    source: &IngestSource,
    options: &IngestOptions,
    blob_scratch: &Path,
    report: &mut IngestReport,
) -> EngineResult<Vec<DiscoveredFile>> {
    match source {
        IngestSource::Blob { name, bytes, mime } => {
            let kind = classify_blob(name, mime.as_deref(), options.mode)?;
            if bytes.len() > deps.max_file_size {
                return Err(EngineError::StorageCapExceeded(format!(
                    "blob '{name}' is {} bytes, over the {}-byte per-file cap",
                    bytes.len(),
                    deps.max_file_size
                )));
            }
            let file_name = Path::new(name)
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| "blob.txt".to_string());
            let path = blob_scratch.join(file_name);
            std::fs::write(&path, bytes)?;
            Ok(vec![DiscoveredFile { path, source: format!("blob:{name}"), kind }])
        }
        IngestSource::File(path) => {
            let path = normalize_path(path)?;
            let Some(kind) = classify_extension(&path, options.mode) else {
                return Err(EngineError::InvalidPath(format!(
                    "{} has no supported extension for {} mode",
                    path.display(),
                    options.mode.as_str()
                )));
            };
            check_size(deps, &path)?;
            Ok(vec![DiscoveredFile {
                source: path.to_string_lossy().to_string(),
                path,
                kind,
            }])
        }
        IngestSource::Directory(root) => {
            let root = normalize_path(root)?;
            if !root.is_dir() {
                return Err(EngineError::InvalidPath(format!(
                    "{} is not a directory",
                    root.display()
                )));
            }
            let include = build_globset(&options.include)?;
            let exclude = build_globset(&options.exclude)?;

            let mut files = Vec::new();
            let walker = WalkBuilder::new(&root)
                .hidden(false)
                .git_ignore(true)
                .git_global(true)
                .git_exclude(true)
                .max_depth(Some(20))
                .build();

            for entry in walker.filter_map(|e| e.ok()) {
                if !entry.file_type().is_some_and(|ft| ft.is_file()) {
                    continue;
                }
                let path = entry.into_path();
                let rel = path.strip_prefix(&root).unwrap_or(&path).to_string_lossy().replace('\\', "/");

                if let Some(include) = &include {
                    if !include.is_match(&rel) {
                        continue;
                    }
                }
                if let Some(exclude) = &exclude {
                    if exclude.is_match(&rel) {
                        continue;
                    }
                }
                let Some(kind) = classify_extension(&path, options.mode) else {
                    continue;
                };
                if let Err(e) = check_size(deps, &path) {
                    report.skipped.push(SkippedFile { path: rel, reason: e.to_string() });
                    continue;
                }
                files.push(DiscoveredFile {
                    source: path.to_string_lossy().to_string(),
                    path,
                    kind,
                });
            }

            // Stable order keeps label assignment and logs reproducible.
            files.sort_by(|a, b| a.source.cmp(&b.source));
            Ok(files)
        }
    }
}

fn classify_blob(name: &str, mime: Option<&str>, mode: Mode) -> EngineResult<ContentKind> {
    let ext = Path::new(name).extension().unwrap_or_default().to_string_lossy().to_lowercase();
    let looks_like_image = mime.map(|m| m.starts_with("image/")).unwrap_or(false)
        || is_image_extension(&ext);

    if looks_like_image {
        if mode == Mode::Multimodal {
            Ok(ContentKind::Image)
        } else {
            Err(EngineError::ModeMismatch(format!(
                "image blob '{name}' cannot join a text-mode corpus"
            )))
        }
    } else if is_text_extension(&ext)
        || ext.is_empty()
        || mime.map(|m| m.starts_with("text/")).unwrap_or(false)
    {
        Ok(ContentKind::Text)
    } else {
        Err(EngineError::InvalidPath(format!("blob '{name}' has an unsupported extension")))
    }
}

fn normalize_path(path: &Path) -> EngineResult<PathBuf> {
    if !path.exists() {
        return Err(EngineError::MissingFile(path.display().to_string()));
    }
    Ok(dunce::canonicalize(path)?)
}

fn check_size(deps: &IngestDeps, path: &Path) -> EngineResult<()> {
    let len = std::fs::metadata(path)?.len();
    if len > deps.max_file_size as u64 {
        return Err(EngineError::StorageCapExceeded(format!(
            "{} is {len} bytes, over the {}-byte per-file cap",
            path.display(),
            deps.max_file_size
        )));
    }
    Ok(())
}

/// Derives a human caption from an image filename: the text proxy indexed
/// (and searched) for the image.
fn caption_from_name(path_or_name: &str) -> String {
    let stem = Path::new(path_or_name)
        .file_stem()
        .unwrap_or_default()
        .to_string_lossy()
        .to_string();
    stem.replace(['_', '-', '.'], " ").split_whitespace().collect::<Vec<_>>().join(" ")
}

#[allow(clippy::too_many_arguments)]
fn ingest_one(
    deps: &IngestDeps,
    embedder: &Arc<dyn Embedder>,
    descriptor: &ModelDescriptor,
    chunker: &Chunker,
    optimizer: &BatchOptimizer,
    options: &IngestOptions,
    file: &DiscoveredFile,
    cancel: &CancellationToken,
) -> EngineResult<(usize, usize)> {
    let fingerprint = descriptor.fingerprint();

    // Build the chunk list (text windows, or one content-addressed chunk per
    // image) before touching any store.
    let (new_chunks, image_bytes, doc_kind, title) = match file.kind {
        ContentKind::Text | ContentKind::Mixed => {
            let raw = read_text(file)?;
            let language = crate::preprocess::detect_language(
                &Path::new(&file.source)
                    .extension()
                    .unwrap_or_default()
                    .to_string_lossy()
                    .to_lowercase(),
            );
            let cleaned = deps.preprocessors.run(language, &raw, PreprocessMode::Placeholder);
            let chunks: Vec<NewChunk> = chunker
                .chunk(&cleaned)
                .into_iter()
                .map(|c| {
                    let normalized = normalize_text(&c.text);
                    NewChunk {
                        chunk_index: c.chunk_index,
                        embedding_id: embedding_id(
                            normalized.as_bytes(),
                            ContentKind::Text,
                            &fingerprint,
                        ),
                        text: normalized,
                        token_count: c.token_count,
                        content_type: ContentKind::Text,
                        content_id: None,
                    }
                })
                .collect();
            let title = title_for(file);
            (chunks, Vec::new(), ContentKind::Text, title)
        }
        ContentKind::Image => {
            let bytes = read_bytes(file)?;
            let ext = file
                .path
                .extension()
                .unwrap_or_default()
                .to_string_lossy()
                .to_lowercase();
            let content_id = deps.content.put(&bytes, mime_for_image_extension(&ext))?;
            let caption = caption_from_name(&file.path.to_string_lossy());
            let chunk = NewChunk {
                chunk_index: 0,
                embedding_id: embedding_id(&bytes, ContentKind::Image, &fingerprint),
                token_count: caption.split_whitespace().count() as u32,
                text: caption,
                content_type: ContentKind::Image,
                content_id: Some(content_id),
            };
            let title = title_for(file);
            (vec![chunk], bytes, ContentKind::Image, title)
        }
    };

    // Embed unique ids only; duplicates inside a document collapse to one
    // model call and one record.
    let mut unique: Vec<&NewChunk> = Vec::new();
    let mut seen = std::collections::HashSet::new();
    for chunk in &new_chunks {
        if seen.insert(chunk.embedding_id.as_str()) {
            unique.push(chunk);
        }
    }

    let progress: ProgressFn = {
        let source = file.source.clone();
        Arc::new(move |p: BatchProgress| {
            debug!(source = %source, completed = p.completed, total = p.total, "embedding progress");
        })
    };

    let mut vectors: std::collections::HashMap<String, Vec<f32>> = std::collections::HashMap::new();
    let batch_size = options.batch_size.map(|b| b as usize);

    let text_inputs: Vec<String> = unique
        .iter()
        .filter(|c| c.content_type == ContentKind::Text)
        .map(|c| c.text.clone())
        .collect();
    let text_ids: Vec<String> = unique
        .iter()
        .filter(|c| c.content_type == ContentKind::Text)
        .map(|c| c.embedding_id.clone())
        .collect();
    if !text_inputs.is_empty() {
        let embed = |batch: &[String]| embedder.embed_text(batch);
        let outcome = optimizer.run(
            &text_inputs,
            batch_size.unwrap_or(descriptor.recommended_batch_size as usize),
            embed,
            Some(progress.clone()),
            cancel,
        )?;
        if !outcome.failures.is_empty() {
            return Err(EngineError::TransientEmbedFailure(format!(
                "{} of {} text chunks failed to embed",
                outcome.failures.len(),
                text_inputs.len()
            )));
        }
        for (id, vector) in text_ids.into_iter().zip(outcome.vectors) {
            let vector = vector.ok_or_else(|| {
                EngineError::TransientEmbedFailure(format!("missing vector for embedding {id}"))
            })?;
            vectors.insert(id, vector);
        }
    }

    let image_ids: Vec<String> = unique
        .iter()
        .filter(|c| c.content_type == ContentKind::Image)
        .map(|c| c.embedding_id.clone())
        .collect();
    if !image_ids.is_empty() {
        let inputs = vec![image_bytes.clone()];
        let embed = |batch: &[Vec<u8>]| embedder.embed_image(batch);
        let image_batch = if descriptor.image_batch_size > 0 {
            descriptor.image_batch_size as usize
        } else {
            DEFAULT_IMAGE_BATCH
        };
        let outcome = optimizer.run(&inputs, image_batch, embed, Some(progress), cancel)?;
        if !outcome.failures.is_empty() {
            return Err(EngineError::TransientEmbedFailure(format!(
                "image '{}' failed to embed",
                file.source
            )));
        }
        for (id, vector) in image_ids.into_iter().zip(outcome.vectors) {
            let vector = vector.ok_or_else(|| {
                EngineError::TransientEmbedFailure(format!("missing vector for embedding {id}"))
            })?;
            vectors.insert(id, vector);
        }
    }

    if cancel.is_cancelled() {
        return Err(EngineError::Cancelled);
    }

    // One transaction per document, then mirror the outcome into the
    // in-memory index under the write lock.
    let outcome = deps.metadata.ingest_document(
        &file.source,
        &title,
        doc_kind,
        descriptor.dimensions,
        &new_chunks,
    )?;

    {
        let mut guard = deps.index.write();
        let index = guard.as_mut().ok_or_else(|| {
            EngineError::Index("vector index not initialized".into())
        })?;
        for freed in &outcome.freed_embedding_ids {
            index.remove_by_id(freed);
        }
        for id in &outcome.new_embedding_ids {
            let vector = vectors.get(id).ok_or_else(|| {
                EngineError::Index(format!("no vector computed for embedding {id}"))
            })?;
            index.add_with_id(vector, id)?;
        }
    }

    Ok((outcome.chunks_inserted, outcome.new_embedding_ids.len()))
}

fn title_for(file: &DiscoveredFile) -> String {
    let name = Path::new(&file.source)
        .file_stem()
        .unwrap_or_default()
        .to_string_lossy()
        .to_string();
    if name.is_empty() { file.source.clone() } else { name }
}

fn read_text(file: &DiscoveredFile) -> EngineResult<String> {
    std::fs::read_to_string(&file.path)
        .map_err(|_| EngineError::MissingFile(file.path.display().to_string()))
}

fn read_bytes(file: &DiscoveredFile) -> EngineResult<Vec<u8>> {
    std::fs::read(&file.path).map_err(|_| EngineError::MissingFile(file.path.display().to_string()))
}

fn save_index(deps: &IngestDeps) -> EngineResult<()> {
    let guard = deps.index.read();
    if let Some(index) = guard.as_ref() {
        index.save(&deps.index_path)?;
    }
    Ok(())
}

fn write_system_info(
    deps: &IngestDeps,
    options: &IngestOptions,
    descriptor: &ModelDescriptor,
    embedder: &Arc<dyn Embedder>,
) -> EngineResult<()> {
    let now = chrono::Utc::now();
    let supported = match options.mode {
        Mode::Text => vec![ContentKind::Text],
        Mode::Multimodal => vec![ContentKind::Text, ContentKind::Image],
    };
    let info = SystemInfo {
        mode: options.mode,
        model_name: descriptor.name.to_string(),
        model_type: descriptor.model_type,
        model_dimensions: descriptor.dimensions,
        model_version: embedder.model_info().version,
        supported_content_types: supported,
        reranking_strategy: crate::types::RerankStrategy::default_for(options.mode),
        created_at: now,
        updated_at: now,
    };
    deps.metadata.set_system_info(&info)
}
