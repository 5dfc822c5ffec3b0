//! Approximate nearest-neighbour index with a self-describing binary file.
//!
//! The index stores numeric labels only; the label→embedding-id bijection
//! rides along in the file trailer. Deletion tombstones labels in memory and
//! compacts on save, so the file's map is a bijection at rest.

pub mod format;
pub mod hnsw;

use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::error::{EngineError, EngineResult};
use format::{IndexHeader, FORMAT_VERSION};
pub use hnsw::{cosine_distance, GraphParams};
use hnsw::HnswGraph;

/// Default search-time beam width (`expansion_search` in the ancestry of
/// these parameters).
pub const DEFAULT_EF_SEARCH: usize = 64;

#[derive(Debug)]
pub struct VectorIndex {
    dims: usize,
    max_elements: usize,
    params: GraphParams,
    graph: HnswGraph,
    /// slot → normalized vector; slots are insertion-ordered and dense.
    vectors: Vec<Vec<f32>>,
    /// slot → label.
    labels: Vec<u32>,
    label_to_slot: HashMap<u32, usize>,
    /// label → embedding id (the persisted bijection).
    id_map: BTreeMap<u32, String>,
    deleted: HashSet<u32>,
    next_label: u32,
}

impl VectorIndex {
    pub fn initialize(dims: usize, max_elements: usize, params: GraphParams) -> Self {
        Self {
            dims,
            max_elements,
            params,
            graph: HnswGraph::new(&params),
            vectors: Vec::new(),
            labels: Vec::new(),
            label_to_slot: HashMap::new(),
            id_map: BTreeMap::new(),
            deleted: HashSet::new(),
            next_label: 0,
        }
    }

    /// Loads an index file and rebuilds the graph from its records. When
    /// `expected_dims` is set, a mismatching header fails before any graph
    /// work happens.
    pub fn load(path: &Path, expected_dims: Option<u32>) -> EngineResult<Self> {
        let file = std::fs::File::open(path)
            .map_err(|_| EngineError::MissingFile(path.display().to_string()))?;
        let mut reader = BufReader::new(file);

        let header = IndexHeader::read(&mut reader)?;
        if let Some(expected) = expected_dims {
            if header.dims != expected {
                return Err(EngineError::DimensionMismatch {
                    expected,
                    actual: header.dims,
                });
            }
        }

        let records = format::read_records(&mut reader, header.dims as usize)?;
        let id_map = format::read_id_map(&mut reader)?;

        let params = GraphParams {
            m: header.m,
            ef_construction: header.ef_construction,
            seed: header.seed,
        };
        let mut index = Self::initialize(
            header.dims as usize,
            header.max_elements as usize,
            params,
        );

        for (label, vector) in records {
            // Records were normalized before save; reinserting them verbatim
            // keeps the round-trip bit-exact.
            index.add_raw(label, vector)?;
        }
        index.id_map = id_map;
        index.next_label = index.labels.iter().max().map(|l| l + 1).unwrap_or(0);

        debug!(
            path = %path.display(),
            size = index.len(),
            dims = index.dims,
            "vector index loaded"
        );
        Ok(index)
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    pub fn params(&self) -> GraphParams {
        self.params
    }

    /// Number of live (non-tombstoned) vectors.
    pub fn len(&self) -> usize {
        self.labels.len() - self.deleted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains_label(&self, label: u32) -> bool {
        self.label_to_slot.contains_key(&label) && !self.deleted.contains(&label)
    }

    pub fn id_map(&self) -> &BTreeMap<u32, String> {
        &self.id_map
    }

    pub fn embedding_id_for(&self, label: u32) -> Option<&String> {
        self.id_map.get(&label)
    }

    fn normalize(&self, vector: &[f32]) -> EngineResult<Vec<f32>> {
        if vector.len() != self.dims {
            return Err(EngineError::DimensionMismatch {
                expected: self.dims as u32,
                actual: vector.len() as u32,
            });
        }
        let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if !norm.is_finite() || norm <= f32::EPSILON {
            return Err(EngineError::Index(
                "cannot index a zero or non-finite vector".into(),
            ));
        }
        Ok(vector.iter().map(|x| x / norm).collect())
    }

    /// Adds a vector under an explicit label. The vector is L2-normalized on
    /// the way in; duplicate labels are rejected.
    pub fn add(&mut self, label: u32, vector: &[f32]) -> EngineResult<()> {
        let normalized = self.normalize(vector)?;
        self.add_raw(label, normalized)
    }

    /// Insertion without normalization, for vectors that are already unit
    /// length (i.e. records read back from an index file).
    fn add_raw(&mut self, label: u32, normalized: Vec<f32>) -> EngineResult<()> {
        if self.label_to_slot.contains_key(&label) {
            return Err(EngineError::Index(format!("duplicate label {label}")));
        }
        if normalized.len() != self.dims {
            return Err(EngineError::DimensionMismatch {
                expected: self.dims as u32,
                actual: normalized.len() as u32,
            });
        }

        if self.labels.len() >= self.max_elements {
            // Soft capacity: grow like the reserve-doubling indexes this one
            // descends from rather than failing mid-ingest.
            self.max_elements = (self.max_elements * 2).max(1024);
        }

        let slot = self.vectors.len();
        self.vectors.push(normalized);
        self.labels.push(label);
        self.label_to_slot.insert(label, slot);
        self.graph.insert(slot, &self.vectors);
        if label >= self.next_label {
            self.next_label = label + 1;
        }
        Ok(())
    }

    /// Adds a vector and binds it to an embedding id under a fresh label.
    pub fn add_with_id(&mut self, vector: &[f32], embedding_id: &str) -> EngineResult<u32> {
        let label = self.next_label;
        self.add(label, vector)?;
        self.id_map.insert(label, embedding_id.to_string());
        Ok(label)
    }

    /// Tombstones the label bound to `embedding_id`. The slot stays in the
    /// graph for connectivity until the next save compacts it away.
    pub fn remove_by_id(&mut self, embedding_id: &str) -> bool {
        let label = self
            .id_map
            .iter()
            .find(|(_, id)| id.as_str() == embedding_id)
            .map(|(label, _)| *label);
        match label {
            Some(label) => {
                self.id_map.remove(&label);
                self.deleted.insert(label);
                true
            }
            None => false,
        }
    }

    /// k-nearest labels with cosine distances in [0, 2]. An empty index
    /// yields an empty result; `k` larger than the live size yields all.
    pub fn search(&self, query: &[f32], k: usize) -> EngineResult<(Vec<u32>, Vec<f32>)> {
        if self.is_empty() || k == 0 {
            return Ok((Vec::new(), Vec::new()));
        }
        let normalized = self.normalize(query)?;

        // Widen the beam past tombstones so k live results can surface.
        let ef = DEFAULT_EF_SEARCH.max(k) + self.deleted.len();
        let hits = self.graph.search(&normalized, k, ef, &self.vectors, |slot| {
            !self.deleted.contains(&self.labels[slot])
        });

        let mut labels = Vec::with_capacity(hits.len());
        let mut distances = Vec::with_capacity(hits.len());
        for (slot, dist) in hits {
            labels.push(self.labels[slot]);
            distances.push(dist);
        }
        Ok((labels, distances))
    }

    /// Writes the index to `path`, compacting tombstones. Publication is
    /// write-to-temp then rename, so readers never observe a partial file.
    pub fn save(&self, path: &Path) -> EngineResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let header = IndexHeader {
            version: FORMAT_VERSION,
            dims: self.dims as u32,
            max_elements: self.max_elements as u32,
            m: self.params.m,
            ef_construction: self.params.ef_construction,
            seed: self.params.seed,
        };

        let live: Vec<(u32, &[f32])> = self
            .labels
            .iter()
            .zip(self.vectors.iter())
            .filter(|(label, _)| !self.deleted.contains(label))
            .map(|(label, vector)| (*label, vector.as_slice()))
            .collect();

        let tmp = tmp_path(path);
        {
            let file = std::fs::File::create(&tmp)?;
            let mut writer = BufWriter::new(file);
            header.write(&mut writer)?;
            format::write_records(&mut writer, &live)?;
            format::write_id_map(&mut writer, &self.id_map)?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        std::fs::rename(&tmp, path)?;

        info!(path = %path.display(), size = live.len(), "vector index saved");
        Ok(())
    }

    /// Verifies the bijection between the trailer map and a set of embedding
    /// ids from the metadata store. Returns labels that have no id and ids
    /// that have no label.
    pub fn bijection_gaps(&self, store_ids: &[String]) -> (Vec<u32>, Vec<String>) {
        let store_set: HashSet<&str> = store_ids.iter().map(|s| s.as_str()).collect();
        let mapped: HashSet<&str> = self.id_map.values().map(|s| s.as_str()).collect();

        let orphan_labels: Vec<u32> = self
            .labels
            .iter()
            .filter(|l| !self.deleted.contains(l) && !self.id_map.contains_key(l))
            .copied()
            .collect();
        let unmapped_ids: Vec<String> = store_set
            .difference(&mapped)
            .map(|s| s.to_string())
            .collect();

        if !orphan_labels.is_empty() || !unmapped_ids.is_empty() {
            warn!(
                orphan_labels = orphan_labels.len(),
                unmapped_ids = unmapped_ids.len(),
                "index/store bijection has gaps"
            );
        }
        (orphan_labels, unmapped_ids)
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Shared handle used across concurrent searches and the single writer.
pub type SharedIndex = std::sync::Arc<RwLock<Option<VectorIndex>>>;

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn unit(dims: usize, hot: usize) -> Vec<f32> {
        let mut v = vec![0.0f32; dims];
        v[hot] = 1.0;
        v
    }

    #[test]
    fn duplicate_labels_are_rejected() {
        let mut index = VectorIndex::initialize(4, 16, GraphParams::default());
        index.add(1, &unit(4, 0)).unwrap();
        let err = index.add(1, &unit(4, 1)).unwrap_err();
        assert!(err.to_string().contains("duplicate label"));
    }

    #[test]
    fn wrong_dimension_vector_is_rejected() {
        let mut index = VectorIndex::initialize(4, 16, GraphParams::default());
        let err = index.add(0, &[1.0, 0.0]).unwrap_err();
        assert_eq!(err.kind(), "DimensionMismatch");
    }

    #[test]
    fn empty_search_and_k_zero_are_empty() {
        let index = VectorIndex::initialize(4, 16, GraphParams::default());
        let (labels, dists) = index.search(&unit(4, 0), 5).unwrap();
        assert!(labels.is_empty() && dists.is_empty());

        let mut index = index;
        index.add(0, &unit(4, 0)).unwrap();
        let (labels, _) = index.search(&unit(4, 0), 0).unwrap();
        assert!(labels.is_empty());
    }

    #[test]
    fn search_returns_all_when_k_exceeds_size() {
        let mut index = VectorIndex::initialize(4, 16, GraphParams::default());
        for i in 0..3 {
            index.add(i, &unit(4, i as usize)).unwrap();
        }
        let (labels, dists) = index.search(&unit(4, 0), 10).unwrap();
        assert_eq!(labels.len(), 3);
        assert_eq!(labels[0], 0);
        assert!(dists[0] < 1e-6);
        assert!(dists.iter().all(|d| (0.0..=2.0).contains(d)));
    }

    #[test]
    fn save_load_round_trips_vectors_and_map() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("index.bin");

        let mut index = VectorIndex::initialize(8, 64, GraphParams::default());
        for i in 0..20u32 {
            let mut v = vec![0.1f32; 8];
            v[(i % 8) as usize] = 1.0 + i as f32 * 0.01;
            index.add_with_id(&v, &format!("embedding-{i}")).unwrap();
        }
        index.save(&path).unwrap();

        let loaded = VectorIndex::load(&path, Some(8)).unwrap();
        assert_eq!(loaded.len(), 20);
        assert_eq!(loaded.id_map().len(), 20);
        assert_eq!(loaded.embedding_id_for(7).unwrap(), "embedding-7");

        // Same query against both instances agrees: the graph rebuild is
        // deterministic and vectors survive bit-for-bit (up to one
        // normalization, which is idempotent).
        let query = unit(8, 3);
        let (a, da) = index.search(&query, 5).unwrap();
        let (b, db) = loaded.search(&query, 5).unwrap();
        assert_eq!(a, b);
        for (x, y) in da.iter().zip(db.iter()) {
            assert!((x - y).abs() < 1e-6);
        }
    }

    #[test]
    fn pure_vector_payload_has_exact_file_size() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("index.bin");

        let dims = 32;
        let mut index = VectorIndex::initialize(dims, 64, GraphParams::default());
        for i in 0..10u32 {
            let mut v = vec![0.5f32; dims];
            v[i as usize] = 2.0;
            index.add(i, &v).unwrap(); // raw labels: no trailer map
        }
        index.save(&path).unwrap();

        let len = std::fs::metadata(&path).unwrap().len() as usize;
        assert_eq!(len, format::pure_payload_len(10, dims));
    }

    #[test]
    fn load_rejects_dimension_mismatch() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("index.bin");

        let mut index = VectorIndex::initialize(16, 64, GraphParams::default());
        index.add(0, &unit(16, 0)).unwrap();
        index.save(&path).unwrap();

        let err = VectorIndex::load(&path, Some(384)).unwrap_err();
        assert_eq!(err.kind(), "DimensionMismatch");
    }

    #[test]
    fn removal_tombstones_then_compacts_on_save() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("index.bin");

        let mut index = VectorIndex::initialize(4, 16, GraphParams::default());
        for i in 0..4u32 {
            index.add_with_id(&unit(4, i as usize), &format!("id-{i}")).unwrap();
        }
        assert!(index.remove_by_id("id-2"));
        assert!(!index.remove_by_id("id-2"));
        assert_eq!(index.len(), 3);

        let (labels, _) = index.search(&unit(4, 2), 4).unwrap();
        assert!(!labels.contains(&2));

        index.save(&path).unwrap();
        let loaded = VectorIndex::load(&path, Some(4)).unwrap();
        assert_eq!(loaded.len(), 3);
        assert!(!loaded.contains_label(2));
        assert_eq!(loaded.id_map().len(), 3);
    }

    #[test]
    fn bijection_gap_detection() {
        let mut index = VectorIndex::initialize(4, 16, GraphParams::default());
        index.add_with_id(&unit(4, 0), "id-0").unwrap();
        index.add(99, &unit(4, 1)).unwrap(); // label with no id binding

        let (orphans, unmapped) =
            index.bijection_gaps(&["id-0".to_string(), "id-ghost".to_string()]);
        assert_eq!(orphans, vec![99]);
        assert_eq!(unmapped, vec!["id-ghost".to_string()]);
    }
}
