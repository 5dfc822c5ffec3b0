//! Lodestone: a local, embedded retrieval engine.
//!
//! Documents go in (text, or text+images in multimodal mode); the engine
//! chunks them, embeds the chunks, persists metadata in SQLite and vectors
//! in a content-addressed HNSW index file, and answers semantic queries with
//! optional reranking. Everything runs inside one process; nothing talks to
//! the network except model weight downloads on first use.

pub mod chunker;
pub mod config;
pub mod embed;
pub mod engine;
pub mod error;
pub mod index;
pub mod pipeline;
pub mod preprocess;
pub mod rerank;
pub mod resources;
pub mod routes;
pub mod server;
pub mod state;
pub mod store;
pub mod types;
pub mod validate;

pub use config::{AppConfig, IngestOptions, ResetOptions, SearchOptions};
pub use engine::Engine;
pub use error::{EngineError, EngineResult, Resolution};
pub use pipeline::ingest::IngestSource;
pub use store::{ContentFormat, ContentPayload};
pub use types::{EngineStats, IngestReport, Mode, SearchHit, SearchResponse, SystemInfo};
