//! Content-addressed blob store.
//!
//! Bytes live under `content/<aa>/<sha256-hex>` where `aa` is the first hash
//! byte; metadata and refcounts live in the relational store's `content_refs`
//! table. Identical bytes short-circuit to the existing object.

use base64::Engine as _;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::ContentStoreConfig;
use crate::error::{EngineError, EngineResult};
use crate::store::metadata::MetadataStore;

/// Retrieval format: a readable path on disk, or inline base64 for RPC
/// callers that cannot touch the filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentFormat {
    FilePath,
    Base64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub enum ContentPayload {
    FilePath(PathBuf),
    Base64(String),
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ContentMetadata {
    pub byte_length: u64,
    pub mime: String,
    pub created_at: Option<String>,
}

pub struct ContentStore {
    config: ContentStoreConfig,
    metadata: Arc<MetadataStore>,
}

impl ContentStore {
    pub fn new(config: ContentStoreConfig, metadata: Arc<MetadataStore>) -> EngineResult<Self> {
        config.validate()?;
        std::fs::create_dir_all(&config.content_dir)?;
        Ok(Self { config, metadata })
    }

    pub fn content_id_for(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        format!("{:x}", hasher.finalize())
    }

    fn object_path(&self, content_id: &str) -> PathBuf {
        let shard = &content_id[..2.min(content_id.len())];
        self.config.content_dir.join(shard).join(content_id)
    }

    /// Stores bytes, returning their content id. Existing content
    /// short-circuits; size caps are enforced before any write.
    pub fn put(&self, bytes: &[u8], mime: &str) -> EngineResult<String> {
        if bytes.len() > self.config.max_file_size {
            return Err(EngineError::StorageCapExceeded(format!(
                "object of {} bytes exceeds per-file cap of {} bytes",
                bytes.len(),
                self.config.max_file_size
            )));
        }

        let content_id = Self::content_id_for(bytes);

        if self.config.enable_deduplication {
            if let Some((_, _, path, _)) = self.metadata.content_ref_get(&content_id)? {
                if Path::new(&path).exists() {
                    debug!(content_id = %content_id, "content already stored, deduplicating");
                    return Ok(content_id);
                }
                // Row without bytes: fall through and rewrite the object.
                warn!(content_id = %content_id, "content row exists but bytes are missing, rewriting");
            }
        }

        let stored = self.metadata.content_total_bytes()?;
        if stored + bytes.len() as u64 > self.config.max_content_dir_size as u64 {
            return Err(EngineError::StorageCapExceeded(format!(
                "content directory would grow past its cap of {} bytes",
                self.config.max_content_dir_size
            )));
        }

        let path = self.object_path(&content_id);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        // Write-then-rename so a crash never leaves a partial object at the
        // durable path.
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, &path)?;

        self.metadata.content_ref_insert(
            &content_id,
            bytes.len() as u64,
            mime,
            &path.to_string_lossy(),
        )?;

        debug!(content_id = %content_id, bytes = bytes.len(), mime = mime, "stored content object");
        Ok(content_id)
    }

    pub fn exists(&self, content_id: &str) -> EngineResult<bool> {
        match self.metadata.content_ref_get(content_id)? {
            Some((_, _, path, _)) => Ok(Path::new(&path).exists()),
            None => Ok(false),
        }
    }

    pub fn get(&self, content_id: &str, format: ContentFormat) -> EngineResult<ContentPayload> {
        let Some((_, _, path, _)) = self.metadata.content_ref_get(content_id)? else {
            return Err(EngineError::MissingFile(format!("content {content_id}")));
        };
        let path = PathBuf::from(path);
        if !path.exists() {
            return Err(EngineError::IntegrityFailure {
                content_id: content_id.to_string(),
                detail: "object bytes missing from content directory".into(),
            });
        }

        match format {
            ContentFormat::FilePath => Ok(ContentPayload::FilePath(path)),
            ContentFormat::Base64 => {
                let bytes = std::fs::read(&path)?;
                Ok(ContentPayload::Base64(
                    base64::engine::general_purpose::STANDARD.encode(bytes),
                ))
            }
        }
    }

    pub fn get_metadata(&self, content_id: &str) -> EngineResult<ContentMetadata> {
        let Some((byte_length, mime, _, _)) = self.metadata.content_ref_get(content_id)? else {
            return Err(EngineError::MissingFile(format!("content {content_id}")));
        };
        Ok(ContentMetadata { byte_length, mime, created_at: None })
    }

    pub fn ref_inc(&self, content_id: &str) -> EngineResult<()> {
        self.metadata.content_ref_adjust(content_id, 1)?;
        Ok(())
    }

    pub fn ref_dec(&self, content_id: &str) -> EngineResult<()> {
        self.metadata.content_ref_adjust(content_id, -1)?;
        Ok(())
    }

    /// Re-hashes stored bytes and compares against the content id.
    pub fn verify(&self, content_id: &str) -> EngineResult<()> {
        let Some((_, _, path, _)) = self.metadata.content_ref_get(content_id)? else {
            return Err(EngineError::MissingFile(format!("content {content_id}")));
        };
        let bytes = std::fs::read(&path).map_err(|_| EngineError::IntegrityFailure {
            content_id: content_id.to_string(),
            detail: "object bytes missing from content directory".into(),
        })?;
        let actual = Self::content_id_for(&bytes);
        if actual != content_id {
            return Err(EngineError::IntegrityFailure {
                content_id: content_id.to_string(),
                detail: format!("stored bytes hash to {actual}"),
            });
        }
        Ok(())
    }

    /// Removes unreferenced objects (refcount == 0), optionally verifying
    /// surviving objects. Returns how many objects were deleted.
    pub fn collect_garbage(&self, verify_survivors: bool) -> EngineResult<usize> {
        let mut removed = 0usize;
        for (content_id, path) in self.metadata.content_refs_unreferenced()? {
            if let Err(e) = std::fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(content_id = %content_id, error = %e, "failed to remove content object");
                    continue;
                }
            }
            self.metadata.content_ref_delete(&content_id)?;
            removed += 1;
        }

        if verify_survivors {
            // Hashing every surviving object is CPU-bound; fan it out.
            use rayon::prelude::*;
            let survivors = self.metadata.all_content_refs()?;
            let failures: Vec<(String, String)> = survivors
                .par_iter()
                .filter_map(|(content_id, _)| {
                    self.verify(content_id)
                        .err()
                        .map(|e| (content_id.clone(), e.to_string()))
                })
                .collect();
            for (content_id, error) in failures {
                warn!(content_id = %content_id, error = %error, "content integrity check failed");
            }
        }

        Ok(removed)
    }

    /// Removes every stored object and its directory tree. Used by reset.
    pub fn clear(&self) -> EngineResult<usize> {
        let refs = self.metadata.all_content_refs()?;
        let count = refs.len();
        for (_, path) in refs {
            let _ = std::fs::remove_file(path);
        }
        if self.config.content_dir.exists() {
            std::fs::remove_dir_all(&self.config.content_dir)?;
            std::fs::create_dir_all(&self.config.content_dir)?;
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ContentStoreConfig;
    use tempfile::TempDir;

    fn fixture(max_file: usize, max_dir: usize) -> (TempDir, ContentStore, Arc<MetadataStore>) {
        let dir = TempDir::new().unwrap();
        let metadata = Arc::new(MetadataStore::open(&dir.path().join("metadata.db")).unwrap());
        let store = ContentStore::new(
            ContentStoreConfig {
                content_dir: dir.path().join("content"),
                max_file_size: max_file,
                max_content_dir_size: max_dir,
                enable_deduplication: true,
            },
            metadata.clone(),
        )
        .unwrap();
        (dir, store, metadata)
    }

    #[test]
    fn put_is_deterministic_and_deduplicates() {
        let (_dir, store, _meta) = fixture(1024, 4096);
        let id1 = store.put(b"hello", "text/plain").unwrap();
        let id2 = store.put(b"hello", "text/plain").unwrap();
        assert_eq!(id1, id2);
        assert_eq!(id1, ContentStore::content_id_for(b"hello"));
        assert!(store.exists(&id1).unwrap());
    }

    #[test]
    fn oversize_put_fails_with_cap_error() {
        let (_dir, store, _meta) = fixture(8, 4096);
        let err = store.put(b"way too many bytes", "text/plain").unwrap_err();
        assert_eq!(err.kind(), "StorageCapExceeded");
    }

    #[test]
    fn aggregate_cap_is_enforced() {
        let (_dir, store, _meta) = fixture(64, 100);
        store.put(&[0u8; 60], "application/octet-stream").unwrap();
        let err = store.put(&[1u8; 60], "application/octet-stream").unwrap_err();
        assert_eq!(err.kind(), "StorageCapExceeded");
    }

    #[test]
    fn get_supports_both_formats() {
        let (_dir, store, _meta) = fixture(1024, 4096);
        let id = store.put(b"payload", "text/plain").unwrap();

        match store.get(&id, ContentFormat::FilePath).unwrap() {
            ContentPayload::FilePath(path) => {
                assert_eq!(std::fs::read(path).unwrap(), b"payload");
            }
            other => panic!("expected file path, got {other:?}"),
        }

        match store.get(&id, ContentFormat::Base64).unwrap() {
            ContentPayload::Base64(encoded) => {
                let decoded =
                    base64::engine::general_purpose::STANDARD.decode(encoded).unwrap();
                assert_eq!(decoded, b"payload");
            }
            other => panic!("expected base64, got {other:?}"),
        }
    }

    #[test]
    fn verify_detects_corruption() {
        let (_dir, store, meta) = fixture(1024, 4096);
        let id = store.put(b"original", "text/plain").unwrap();
        assert!(store.verify(&id).is_ok());

        let (_, _, path, _) = meta.content_ref_get(&id).unwrap().unwrap();
        std::fs::write(&path, b"tampered").unwrap();
        let err = store.verify(&id).unwrap_err();
        assert_eq!(err.kind(), "IntegrityFailure");
    }

    #[test]
    fn garbage_collection_honours_refcounts() {
        let (_dir, store, _meta) = fixture(1024, 4096);
        let kept = store.put(b"kept", "text/plain").unwrap();
        let dropped = store.put(b"dropped", "text/plain").unwrap();
        store.ref_inc(&kept).unwrap();

        let removed = store.collect_garbage(false).unwrap();
        assert_eq!(removed, 1);
        assert!(store.exists(&kept).unwrap());
        assert!(!store.exists(&dropped).unwrap());
    }
}
