//! Multimodal corpus flows: mixed ingest, content-addressed image storage,
//! cross-type filtering, and text-derived reranking.

use base64::Engine as _;
use std::path::Path;
use tokio_util::sync::CancellationToken;

use lodestone::config::{ContentStoreConfig, ResourceConfig};
use lodestone::types::ContentKind;
use lodestone::{
    AppConfig, ContentFormat, ContentPayload, Engine, IngestOptions, IngestSource, Mode,
    SearchOptions,
};

fn test_config(dir: &Path) -> AppConfig {
    AppConfig {
        listen_addr: "127.0.0.1:0".into(),
        data_dir: dir.to_string_lossy().to_string(),
        log_dir: dir.join("logs").to_string_lossy().to_string(),
        default_mode: Mode::Multimodal,
        default_model: "hash-clip-512".into(),
        content: ContentStoreConfig {
            content_dir: dir.join("content"),
            max_file_size: 10 * 1024 * 1024,
            max_content_dir_size: 100 * 1024 * 1024,
            enable_deduplication: true,
        },
        resources: ResourceConfig {
            memory_threshold_mb: 4096,
            cleanup_interval_ms: 30_000,
            idle_eviction_secs: 300,
            enable_gc: false,
            auto_cleanup: true,
        },
    }
}

const FAKE_PNG: &[u8] = b"\x89PNG\r\n\x1a\nnot-a-real-image-but-stable-bytes";

fn write_corpus(dir: &Path) {
    let docs = dir.join("docs");
    std::fs::create_dir_all(&docs).unwrap();
    std::fs::write(
        docs.join("architecture.md"),
        "# Architecture\n\nThe ingestion pipeline feeds the vector index. \
         Chunks flow from the chunker into the embedding batches.",
    )
    .unwrap();
    std::fs::write(docs.join("ingestion_pipeline_diagram.png"), FAKE_PNG).unwrap();
}

fn options() -> IngestOptions {
    IngestOptions::new(Mode::Multimodal, "hash-clip-512")
}

#[tokio::test]
async fn mixed_corpus_ingests_text_and_images() {
    let dir = tempfile::tempdir().unwrap();
    write_corpus(dir.path());
    let engine = Engine::open(test_config(dir.path())).unwrap();

    let report = engine
        .ingest(
            IngestSource::Directory(dir.path().join("docs")),
            options(),
            CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(report.documents_processed, 2);
    assert!(report.chunks_created >= 2);

    let stats = engine.get_stats().unwrap();
    assert_eq!(stats.mode, Some(Mode::Multimodal));
    assert_eq!(stats.index_size, stats.chunk_count);
}

#[tokio::test]
async fn image_results_carry_resolvable_content_handles() {
    let dir = tempfile::tempdir().unwrap();
    write_corpus(dir.path());
    let engine = Engine::open(test_config(dir.path())).unwrap();
    engine
        .ingest(
            IngestSource::Directory(dir.path().join("docs")),
            options(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    // Filter to images only; k larger than the corpus returns everything
    // that passes the filter.
    let search = SearchOptions {
        top_k: 20,
        rerank: Some(false),
        content_type: Some(ContentKind::Image),
        ..Default::default()
    };
    let response = engine
        .search("ingestion pipeline diagram", search, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(response.results.len(), 1);
    let hit = &response.results[0];
    assert_eq!(hit.content_type, ContentKind::Image);
    assert_eq!(hit.text, "ingestion pipeline diagram");
    let content_id = hit.content_id.clone().expect("image hits carry a content id");

    match engine.get_content(&content_id, ContentFormat::Base64).unwrap() {
        ContentPayload::Base64(encoded) => {
            let bytes = base64::engine::general_purpose::STANDARD.decode(encoded).unwrap();
            assert_eq!(bytes, FAKE_PNG);
        }
        other => panic!("expected base64 payload, got {other:?}"),
    }

    match engine.get_content(&content_id, ContentFormat::FilePath).unwrap() {
        ContentPayload::FilePath(path) => {
            assert_eq!(std::fs::read(path).unwrap(), FAKE_PNG);
        }
        other => panic!("expected file path payload, got {other:?}"),
    }
}

#[tokio::test]
async fn text_derived_rerank_lifts_caption_matches() {
    let dir = tempfile::tempdir().unwrap();
    write_corpus(dir.path());
    let engine = Engine::open(test_config(dir.path())).unwrap();
    engine
        .ingest(
            IngestSource::Directory(dir.path().join("docs")),
            options(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    // Multimodal corpora default to the text-derived strategy, which scores
    // image candidates through their captions.
    let search = SearchOptions { top_k: 10, rerank: Some(true), ..Default::default() };
    let response = engine
        .search("ingestion pipeline diagram", search, CancellationToken::new())
        .await
        .unwrap();

    let image_rank = response
        .results
        .iter()
        .position(|r| r.content_type == ContentKind::Image)
        .expect("image candidate must survive reranking");
    assert_eq!(image_rank, 0, "caption-exact match should rank first");
}

#[tokio::test]
async fn images_are_excluded_from_text_mode_corpora() {
    let dir = tempfile::tempdir().unwrap();
    write_corpus(dir.path());
    let mut config = test_config(dir.path());
    config.default_mode = Mode::Text;
    let engine = Engine::open(config).unwrap();

    let report = engine
        .ingest(
            IngestSource::Directory(dir.path().join("docs")),
            IngestOptions::new(Mode::Text, "hash-embed-384"),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    // Only the markdown file is picked up; the png never enters a text-mode
    // corpus.
    assert_eq!(report.documents_processed, 1);
    let stats = engine.get_stats().unwrap();
    assert_eq!(stats.document_count, 1);
}

#[tokio::test]
async fn image_blobs_round_trip_through_the_content_store() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::open(test_config(dir.path())).unwrap();

    let report = engine
        .ingest(
            IngestSource::Blob {
                name: "whiteboard_sketch.png".into(),
                bytes: FAKE_PNG.to_vec(),
                mime: Some("image/png".into()),
            },
            options(),
            CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(report.documents_processed, 1);
    assert_eq!(report.chunks_created, 1);

    // Re-ingesting the same blob is idempotent: same source id, same
    // content hash, no growth.
    let stats_before = engine.get_stats().unwrap();
    engine
        .ingest(
            IngestSource::Blob {
                name: "whiteboard_sketch.png".into(),
                bytes: FAKE_PNG.to_vec(),
                mime: Some("image/png".into()),
            },
            options(),
            CancellationToken::new(),
        )
        .await
        .unwrap();
    let stats_after = engine.get_stats().unwrap();
    assert_eq!(stats_before.chunk_count, stats_after.chunk_count);
    assert_eq!(stats_before.document_count, stats_after.document_count);
    assert_eq!(stats_before.index_size, stats_after.index_size);
}
