//! SQLite metadata store: documents, chunks, embedding bookkeeping,
//! content references, and the SystemInfo singleton.
//!
//! The schema is owned by the engine and versioned through
//! `PRAGMA user_version`; migrations are forward-only. Reads go through an
//! r2d2 connection pool (WAL mode, parallel readers); writes are serialized
//! by the ingestion pipeline's corpus lock, so a single writer connection at
//! a time is an invariant callers uphold, not something this module enforces.

use chrono::Utc;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::config::ResetOptions;
use crate::error::{EngineError, EngineResult};
use crate::types::{
    ChunkRecord, ContentKind, DocumentRecord, Mode, ModelType, RerankStrategy, ResetReport,
    SystemInfo,
};

/// Current schema version. Bump together with a new `migrate_to_*` step.
const SCHEMA_VERSION: i32 = 1;

const CREATE_SCHEMA_V1: &str = r#"
CREATE TABLE IF NOT EXISTS system_info (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    mode TEXT NOT NULL,
    model_name TEXT NOT NULL,
    model_type TEXT NOT NULL,
    model_dimensions INTEGER NOT NULL,
    model_version TEXT NOT NULL,
    supported_content_types TEXT NOT NULL,
    reranking_strategy TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS documents (
    doc_id INTEGER PRIMARY KEY AUTOINCREMENT,
    source TEXT NOT NULL UNIQUE,
    title TEXT NOT NULL,
    content_type TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS chunks (
    chunk_id INTEGER PRIMARY KEY AUTOINCREMENT,
    doc_id INTEGER NOT NULL REFERENCES documents(doc_id) ON DELETE CASCADE,
    chunk_index INTEGER NOT NULL,
    text TEXT NOT NULL,
    token_count INTEGER NOT NULL,
    content_type TEXT NOT NULL,
    embedding_id TEXT NOT NULL UNIQUE,
    content_id TEXT,
    UNIQUE (doc_id, chunk_index)
);
CREATE INDEX IF NOT EXISTS idx_chunks_doc ON chunks(doc_id);

CREATE TABLE IF NOT EXISTS embeddings (
    embedding_id TEXT PRIMARY KEY,
    dims INTEGER NOT NULL,
    refcount INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS content_refs (
    content_id TEXT PRIMARY KEY,
    byte_length INTEGER NOT NULL,
    mime TEXT NOT NULL,
    storage_path TEXT NOT NULL,
    refcount INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);
"#;

/// A chunk ready for insertion; the pipeline computes embedding ids and
/// token counts before touching the store.
#[derive(Debug, Clone)]
pub struct NewChunk {
    pub chunk_index: u32,
    pub text: String,
    pub token_count: u32,
    pub content_type: ContentKind,
    pub embedding_id: String,
    pub content_id: Option<String>,
}

/// Outcome of one document's transactional ingest: what the index must add
/// and what it may now tombstone.
#[derive(Debug, Default)]
pub struct DocumentTxnOutcome {
    pub doc_id: i64,
    /// Embedding ids inserted for the first time (need vectors in the index).
    pub new_embedding_ids: Vec<String>,
    /// Embedding ids whose refcount dropped to zero (index tombstones).
    pub freed_embedding_ids: Vec<String>,
    /// Content ids whose refcount dropped to zero (GC candidates).
    pub freed_content_ids: Vec<String>,
    /// Chunks actually inserted (cross-document duplicates are reused, not
    /// re-inserted).
    pub chunks_inserted: usize,
}

pub struct MetadataStore {
    pool: Pool<SqliteConnectionManager>,
    db_path: PathBuf,
}

impl MetadataStore {
    /// Opens (or initializes) the store at `path` and applies any pending
    /// forward-only migrations.
    pub fn open(path: &Path) -> EngineResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let manager = SqliteConnectionManager::file(path).with_init(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA foreign_keys = ON;
                 PRAGMA busy_timeout = 5000;",
            )
        });
        let pool = Pool::builder()
            .max_size(8)
            .build(manager)
            .map_err(|e| EngineError::Storage(format!("failed to open pool: {e}")))?;

        let store = Self { pool, db_path: path.to_path_buf() };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> EngineResult<()> {
        let conn = self.pool.get()?;
        let version: i32 = conn.query_row("PRAGMA user_version", [], |r| r.get(0))?;

        if version > SCHEMA_VERSION {
            return Err(EngineError::Storage(format!(
                "database schema v{version} is newer than this engine (v{SCHEMA_VERSION})"
            )));
        }

        if version < 1 {
            debug!("applying schema migration v1");
            conn.execute_batch(CREATE_SCHEMA_V1)?;
            conn.pragma_update(None, "user_version", 1)?;
            info!(db = %self.db_path.display(), "metadata schema initialized at v1");
        }

        Ok(())
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    // ------------------------------------------------------------------
    // SystemInfo singleton
    // ------------------------------------------------------------------

    pub fn get_system_info(&self) -> EngineResult<Option<SystemInfo>> {
        let conn = self.pool.get()?;
        let row = conn
            .query_row(
                "SELECT mode, model_name, model_type, model_dimensions, model_version,
                        supported_content_types, reranking_strategy, created_at, updated_at
                 FROM system_info WHERE id = 1",
                [],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, String>(6)?,
                        row.get::<_, String>(7)?,
                        row.get::<_, String>(8)?,
                    ))
                },
            )
            .optional()?;

        let Some((mode, name, mtype, dims, version, types, strategy, created, updated)) = row
        else {
            return Ok(None);
        };

        let supported_content_types = types
            .split(',')
            .filter(|s| !s.is_empty())
            .map(ContentKind::parse)
            .collect::<EngineResult<Vec<_>>>()?;

        Ok(Some(SystemInfo {
            mode: Mode::parse(&mode)?,
            model_name: name,
            model_type: ModelType::parse(&mtype)?,
            model_dimensions: dims as u32,
            model_version: version,
            supported_content_types,
            reranking_strategy: RerankStrategy::parse(&strategy)?,
            created_at: created.parse().map_err(|e| {
                EngineError::Storage(format!("bad created_at timestamp: {e}"))
            })?,
            updated_at: updated.parse().map_err(|e| {
                EngineError::Storage(format!("bad updated_at timestamp: {e}"))
            })?,
        }))
    }

    pub fn set_system_info(&self, info: &SystemInfo) -> EngineResult<()> {
        let conn = self.pool.get()?;
        let types = info
            .supported_content_types
            .iter()
            .map(|t| t.as_str())
            .collect::<Vec<_>>()
            .join(",");
        conn.execute(
            "INSERT INTO system_info
                 (id, mode, model_name, model_type, model_dimensions, model_version,
                  supported_content_types, reranking_strategy, created_at, updated_at)
             VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(id) DO UPDATE SET
                 mode = excluded.mode,
                 model_name = excluded.model_name,
                 model_type = excluded.model_type,
                 model_dimensions = excluded.model_dimensions,
                 model_version = excluded.model_version,
                 supported_content_types = excluded.supported_content_types,
                 reranking_strategy = excluded.reranking_strategy,
                 updated_at = excluded.updated_at",
            params![
                info.mode.as_str(),
                info.model_name,
                info.model_type.as_str(),
                info.model_dimensions as i64,
                info.model_version,
                types,
                info.reranking_strategy.as_str(),
                info.created_at.to_rfc3339(),
                info.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Documents & chunks
    // ------------------------------------------------------------------

    /// Atomically replaces a document and its chunks: the upsert, the removal
    /// of prior chunks, embedding refcount adjustments and the new chunk rows
    /// commit together or not at all.
    pub fn ingest_document(
        &self,
        source: &str,
        title: &str,
        content_type: ContentKind,
        dims: u32,
        chunks: &[NewChunk],
    ) -> EngineResult<DocumentTxnOutcome> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        let now = Utc::now().to_rfc3339();

        tx.execute(
            "INSERT INTO documents (source, title, content_type, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)
             ON CONFLICT(source) DO UPDATE SET
                 title = excluded.title,
                 content_type = excluded.content_type,
                 updated_at = excluded.updated_at",
            params![source, title, content_type.as_str(), now],
        )?;
        let doc_id: i64 = tx.query_row(
            "SELECT doc_id FROM documents WHERE source = ?1",
            params![source],
            |r| r.get(0),
        )?;

        let mut outcome = DocumentTxnOutcome { doc_id, ..Default::default() };

        // Drop prior chunks of this document, releasing their embeddings and
        // content references.
        let old: Vec<(String, Option<String>)> = {
            let mut stmt =
                tx.prepare("SELECT embedding_id, content_id FROM chunks WHERE doc_id = ?1")?;
            let rows = stmt.query_map(params![doc_id], |r| Ok((r.get(0)?, r.get(1)?)))?;
            rows.collect::<Result<_, _>>()?
        };
        tx.execute("DELETE FROM chunks WHERE doc_id = ?1", params![doc_id])?;
        for (embedding_id, content_id) in &old {
            if Self::decr_refcount(&tx, "embeddings", "embedding_id", embedding_id)? {
                tx.execute(
                    "DELETE FROM embeddings WHERE embedding_id = ?1",
                    params![embedding_id],
                )?;
                outcome.freed_embedding_ids.push(embedding_id.clone());
            }
            if let Some(cid) = content_id {
                if Self::decr_refcount(&tx, "content_refs", "content_id", cid)? {
                    outcome.freed_content_ids.push(cid.clone());
                }
            }
        }

        // Insert the new chunks. A chunk whose embedding already exists (in
        // another document, or earlier in this batch) is deduplicated: the
        // existing record serves it and no duplicate row is inserted.
        // Refcounts track chunk rows only, so skipped duplicates never leak a
        // reference. Indexes are reassigned here so they stay gap-free after
        // skips.
        let mut next_index: i64 = 0;
        for chunk in chunks {
            let exists: Option<i64> = tx
                .query_row(
                    "SELECT refcount FROM embeddings WHERE embedding_id = ?1",
                    params![chunk.embedding_id],
                    |r| r.get(0),
                )
                .optional()?;

            if exists.is_some() {
                debug!(embedding_id = %chunk.embedding_id, "deduplicated chunk embedding");
                continue;
            }

            tx.execute(
                "INSERT INTO embeddings (embedding_id, dims, refcount) VALUES (?1, ?2, 1)",
                params![chunk.embedding_id, dims as i64],
            )?;
            tx.execute(
                "INSERT INTO chunks
                     (doc_id, chunk_index, text, token_count, content_type,
                      embedding_id, content_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    doc_id,
                    next_index,
                    chunk.text,
                    chunk.token_count as i64,
                    chunk.content_type.as_str(),
                    chunk.embedding_id,
                    chunk.content_id,
                ],
            )?;
            next_index += 1;
            outcome.new_embedding_ids.push(chunk.embedding_id.clone());
            outcome.chunks_inserted += 1;

            if let Some(cid) = &chunk.content_id {
                tx.execute(
                    "UPDATE content_refs SET refcount = refcount + 1 WHERE content_id = ?1",
                    params![cid],
                )?;
            }
        }

        tx.commit()?;
        Ok(outcome)
    }

    /// Decrements a refcount column, returning true when it reached zero.
    fn decr_refcount(
        tx: &rusqlite::Transaction<'_>,
        table: &str,
        key_col: &str,
        key: &str,
    ) -> EngineResult<bool> {
        tx.execute(
            &format!("UPDATE {table} SET refcount = MAX(refcount - 1, 0) WHERE {key_col} = ?1"),
            params![key],
        )?;
        let remaining: Option<i64> = tx
            .query_row(
                &format!("SELECT refcount FROM {table} WHERE {key_col} = ?1"),
                params![key],
                |r| r.get(0),
            )
            .optional()?;
        Ok(remaining == Some(0))
    }

    /// Fetches chunk rows (joined with their documents) for a set of
    /// embedding ids. Missing ids are silently absent; callers preserve their
    /// own ordering by mapping over the returned id-keyed map.
    pub fn get_chunks_by_embedding_ids(
        &self,
        ids: &[String],
    ) -> EngineResult<HashMap<String, (ChunkRecord, DocumentRecord)>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let conn = self.pool.get()?;
        let placeholders = std::iter::repeat("?")
            .take(ids.len())
            .collect::<Vec<_>>()
            .join(",");
        let sql = format!(
            "SELECT c.chunk_id, c.doc_id, c.chunk_index, c.text, c.token_count,
                    c.content_type, c.embedding_id, c.content_id,
                    d.source, d.title, d.content_type, d.created_at
             FROM chunks c JOIN documents d ON d.doc_id = c.doc_id
             WHERE c.embedding_id IN ({placeholders})"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(ids.iter()), |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, String>(6)?,
                row.get::<_, Option<String>>(7)?,
                row.get::<_, String>(8)?,
                row.get::<_, String>(9)?,
                row.get::<_, String>(10)?,
                row.get::<_, String>(11)?,
            ))
        })?;

        let mut map = HashMap::new();
        for row in rows {
            let (
                chunk_id,
                doc_id,
                chunk_index,
                text,
                token_count,
                chunk_type,
                embedding_id,
                content_id,
                source,
                title,
                doc_type,
                doc_created,
            ) = row?;
            let chunk = ChunkRecord {
                chunk_id,
                doc_id,
                chunk_index: chunk_index as u32,
                text,
                token_count: token_count as u32,
                content_type: ContentKind::parse(&chunk_type)?,
                embedding_id: embedding_id.clone(),
                content_id,
            };
            let document = DocumentRecord {
                doc_id,
                source,
                title,
                content_type: ContentKind::parse(&doc_type)?,
                created_at: doc_created.parse().map_err(|e| {
                    EngineError::Storage(format!("bad document timestamp: {e}"))
                })?,
            };
            map.insert(embedding_id, (chunk, document));
        }
        Ok(map)
    }

    /// All embedding ids currently referenced by chunks. Used for bijection
    /// verification against the index trailer map.
    pub fn embedding_ids(&self) -> EngineResult<Vec<String>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare("SELECT embedding_id FROM chunks")?;
        let rows = stmt.query_map([], |r| r.get::<_, String>(0))?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    pub fn has_data(&self) -> EngineResult<bool> {
        let conn = self.pool.get()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM documents", [], |r| r.get(0))?;
        Ok(count > 0)
    }

    pub fn document_count(&self) -> EngineResult<usize> {
        let conn = self.pool.get()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM documents", [], |r| r.get(0))?;
        Ok(count as usize)
    }

    pub fn chunk_count(&self) -> EngineResult<usize> {
        let conn = self.pool.get()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM chunks", [], |r| r.get(0))?;
        Ok(count as usize)
    }

    pub fn embedding_count(&self) -> EngineResult<usize> {
        let conn = self.pool.get()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM embeddings", [], |r| r.get(0))?;
        Ok(count as usize)
    }

    // ------------------------------------------------------------------
    // Content references (used by the content store)
    // ------------------------------------------------------------------

    pub fn content_ref_insert(
        &self,
        content_id: &str,
        byte_length: u64,
        mime: &str,
        storage_path: &str,
    ) -> EngineResult<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO content_refs (content_id, byte_length, mime, storage_path, refcount, created_at)
             VALUES (?1, ?2, ?3, ?4, 0, ?5)
             ON CONFLICT(content_id) DO NOTHING",
            params![content_id, byte_length as i64, mime, storage_path, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn content_ref_get(
        &self,
        content_id: &str,
    ) -> EngineResult<Option<(u64, String, String, i64)>> {
        let conn = self.pool.get()?;
        Ok(conn
            .query_row(
                "SELECT byte_length, mime, storage_path, refcount
                 FROM content_refs WHERE content_id = ?1",
                params![content_id],
                |r| {
                    Ok((
                        r.get::<_, i64>(0)? as u64,
                        r.get::<_, String>(1)?,
                        r.get::<_, String>(2)?,
                        r.get::<_, i64>(3)?,
                    ))
                },
            )
            .optional()?)
    }

    pub fn content_ref_adjust(&self, content_id: &str, delta: i64) -> EngineResult<i64> {
        let conn = self.pool.get()?;
        conn.execute(
            "UPDATE content_refs SET refcount = MAX(refcount + ?2, 0) WHERE content_id = ?1",
            params![content_id, delta],
        )?;
        let refcount: i64 = conn.query_row(
            "SELECT refcount FROM content_refs WHERE content_id = ?1",
            params![content_id],
            |r| r.get(0),
        )?;
        Ok(refcount)
    }

    pub fn content_ref_delete(&self, content_id: &str) -> EngineResult<()> {
        let conn = self.pool.get()?;
        conn.execute("DELETE FROM content_refs WHERE content_id = ?1", params![content_id])?;
        Ok(())
    }

    pub fn content_total_bytes(&self) -> EngineResult<u64> {
        let conn = self.pool.get()?;
        let total: i64 = conn.query_row(
            "SELECT COALESCE(SUM(byte_length), 0) FROM content_refs",
            [],
            |r| r.get(0),
        )?;
        Ok(total as u64)
    }

    /// Content refs that are garbage-collectable (refcount == 0).
    pub fn content_refs_unreferenced(&self) -> EngineResult<Vec<(String, String)>> {
        let conn = self.pool.get()?;
        let mut stmt = conn
            .prepare("SELECT content_id, storage_path FROM content_refs WHERE refcount = 0")?;
        let rows = stmt.query_map([], |r| Ok((r.get(0)?, r.get(1)?)))?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    pub fn all_content_refs(&self) -> EngineResult<Vec<(String, String)>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare("SELECT content_id, storage_path FROM content_refs")?;
        let rows = stmt.query_map([], |r| Ok((r.get(0)?, r.get(1)?)))?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    // ------------------------------------------------------------------
    // Reset
    // ------------------------------------------------------------------

    /// Clears corpus state according to `options` inside one transaction and
    /// reports what was removed. Content bytes on disk are the content
    /// store's job; this only clears rows.
    pub fn reset(&self, options: &ResetOptions) -> EngineResult<ResetReport> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        let mut report = ResetReport::default();

        let clear_documents = options.full || options.documents;
        let clear_content = options.full || options.content;

        if clear_documents {
            report.chunks_removed =
                tx.query_row("SELECT COUNT(*) FROM chunks", [], |r| r.get::<_, i64>(0))? as usize;
            report.documents_removed = tx
                .query_row("SELECT COUNT(*) FROM documents", [], |r| r.get::<_, i64>(0))?
                as usize;
            report.embeddings_removed = tx
                .query_row("SELECT COUNT(*) FROM embeddings", [], |r| r.get::<_, i64>(0))?
                as usize;
            tx.execute("DELETE FROM chunks", [])?;
            tx.execute("DELETE FROM documents", [])?;
            tx.execute("DELETE FROM embeddings", [])?;
        }

        if clear_content {
            report.content_objects_removed = tx
                .query_row("SELECT COUNT(*) FROM content_refs", [], |r| r.get::<_, i64>(0))?
                as usize;
            tx.execute("DELETE FROM content_refs", [])?;
        }

        if options.full {
            tx.execute("DELETE FROM system_info", [])?;
        }

        tx.commit()?;
        if report.documents_removed > 0 || report.content_objects_removed > 0 {
            info!(
                documents = report.documents_removed,
                chunks = report.chunks_removed,
                content = report.content_objects_removed,
                "metadata store reset"
            );
        } else {
            warn!("reset requested on an already-empty store");
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::TempDir;

    fn open_store(dir: &TempDir) -> MetadataStore {
        MetadataStore::open(&dir.path().join("metadata.db")).unwrap()
    }

    fn sample_chunk(index: u32, text: &str, embedding_id: &str) -> NewChunk {
        NewChunk {
            chunk_index: index,
            text: text.to_string(),
            token_count: text.split_whitespace().count() as u32,
            content_type: ContentKind::Text,
            embedding_id: embedding_id.to_string(),
            content_id: None,
        }
    }

    #[test]
    fn system_info_round_trips() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        assert!(store.get_system_info().unwrap().is_none());

        let now = Utc::now();
        let info = SystemInfo {
            mode: Mode::Text,
            model_name: "all-MiniLM-L6-v2".into(),
            model_type: ModelType::SentenceTransformer,
            model_dimensions: 384,
            model_version: "1".into(),
            supported_content_types: vec![ContentKind::Text],
            reranking_strategy: RerankStrategy::CrossEncoder,
            created_at: now,
            updated_at: now,
        };
        store.set_system_info(&info).unwrap();

        let loaded = store.get_system_info().unwrap().unwrap();
        assert_eq!(loaded.mode, Mode::Text);
        assert_eq!(loaded.model_dimensions, 384);
        assert_eq!(loaded.supported_content_types, vec![ContentKind::Text]);
    }

    #[test]
    fn reingest_replaces_chunks_atomically() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        let first = vec![sample_chunk(0, "alpha", "e1"), sample_chunk(1, "beta", "e2")];
        let out = store
            .ingest_document("doc.md", "Doc", ContentKind::Text, 384, &first)
            .unwrap();
        assert_eq!(out.chunks_inserted, 2);
        assert_eq!(out.new_embedding_ids, vec!["e1".to_string(), "e2".to_string()]);
        assert_eq!(store.chunk_count().unwrap(), 2);

        // Re-ingest with one chunk kept and one replaced.
        let second = vec![sample_chunk(0, "alpha", "e1"), sample_chunk(1, "gamma", "e3")];
        let out = store
            .ingest_document("doc.md", "Doc", ContentKind::Text, 384, &second)
            .unwrap();
        assert_eq!(store.chunk_count().unwrap(), 2);
        assert_eq!(store.document_count().unwrap(), 1);
        // e2 was freed, e1 reused, e3 added.
        assert!(out.freed_embedding_ids.contains(&"e2".to_string()));
        assert!(out.new_embedding_ids.contains(&"e3".to_string()));
    }

    #[test]
    fn cross_document_duplicates_share_embeddings() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        store
            .ingest_document("a.md", "A", ContentKind::Text, 384, &[sample_chunk(0, "same", "e1")])
            .unwrap();
        let out = store
            .ingest_document("b.md", "B", ContentKind::Text, 384, &[sample_chunk(0, "same", "e1")])
            .unwrap();

        // Second document reuses the record; no duplicate chunk row appears.
        assert_eq!(out.chunks_inserted, 0);
        assert!(out.new_embedding_ids.is_empty());
        assert_eq!(store.embedding_count().unwrap(), 1);

        // Removing document B must not free the shared embedding.
        let out = store
            .ingest_document("b.md", "B", ContentKind::Text, 384, &[])
            .unwrap();
        assert!(out.freed_embedding_ids.is_empty());
        assert_eq!(store.embedding_count().unwrap(), 1);
    }

    #[test]
    fn chunk_lookup_joins_documents() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        store
            .ingest_document(
                "doc.md",
                "Title",
                ContentKind::Text,
                384,
                &[sample_chunk(0, "hello world", "e1")],
            )
            .unwrap();

        let map = store.get_chunks_by_embedding_ids(&["e1".to_string(), "missing".to_string()]).unwrap();
        assert_eq!(map.len(), 1);
        let (chunk, doc) = &map["e1"];
        assert_eq!(chunk.text, "hello world");
        assert_eq!(doc.title, "Title");
    }

    #[test]
    fn full_reset_clears_everything_including_system_info() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        store
            .ingest_document("doc.md", "Doc", ContentKind::Text, 384, &[sample_chunk(0, "x", "e1")])
            .unwrap();
        let now = Utc::now();
        store
            .set_system_info(&SystemInfo {
                mode: Mode::Text,
                model_name: "all-MiniLM-L6-v2".into(),
                model_type: ModelType::SentenceTransformer,
                model_dimensions: 384,
                model_version: "1".into(),
                supported_content_types: vec![ContentKind::Text],
                reranking_strategy: RerankStrategy::Disabled,
                created_at: now,
                updated_at: now,
            })
            .unwrap();

        let report = store.reset(&ResetOptions { full: true, ..Default::default() }).unwrap();
        assert_eq!(report.documents_removed, 1);
        assert_eq!(report.chunks_removed, 1);
        assert!(!store.has_data().unwrap());
        assert!(store.get_system_info().unwrap().is_none());
    }
}
