//! Binary index file properties: the exact-size law and durable round-trips.

use lodestone::index::{GraphParams, VectorIndex};

/// Deterministic pseudo-random vector source (no RNG dependency).
fn pseudo_vector(seed: u32, dims: usize) -> Vec<f32> {
    let mut state = seed as u64 * 2654435761 + 1;
    (0..dims)
        .map(|_| {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            ((state >> 33) as f32 / (1u64 << 31) as f32) - 0.5
        })
        .collect()
}

#[test]
fn pure_vector_payload_matches_the_spec_size_exactly() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("index.bin");

    let dims = 512;
    let mut index = VectorIndex::initialize(dims, 1024, GraphParams::default());
    for label in 0..100u32 {
        index.add(label, &pseudo_vector(label, dims)).unwrap();
    }
    index.save(&path).unwrap();

    // header(24) + count(4) + 100 * (label(4) + 512 floats)
    let expected = 24 + 4 + 100 * (4 + 512 * 4);
    assert_eq!(expected, 204_828);
    assert_eq!(std::fs::metadata(&path).unwrap().len(), expected as u64);
}

#[test]
fn save_load_save_is_bitwise_stable() {
    let dir = tempfile::tempdir().unwrap();
    let first_path = dir.path().join("a.bin");
    let second_path = dir.path().join("b.bin");

    let dims = 512;
    let mut index = VectorIndex::initialize(dims, 1024, GraphParams::default());
    for label in 0..100u32 {
        index.add(label, &pseudo_vector(label, dims)).unwrap();
    }
    index.save(&first_path).unwrap();

    let loaded = VectorIndex::load(&first_path, Some(dims as u32)).unwrap();
    assert_eq!(loaded.len(), 100);
    loaded.save(&second_path).unwrap();

    let first = std::fs::read(&first_path).unwrap();
    let second = std::fs::read(&second_path).unwrap();
    assert_eq!(first, second, "reload then save must reproduce the file bit-for-bit");
}

#[test]
fn loaded_index_answers_like_the_original() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("index.bin");

    let dims = 64;
    let mut index = VectorIndex::initialize(dims, 256, GraphParams::default());
    for label in 0..50u32 {
        index
            .add_with_id(&pseudo_vector(label, dims), &format!("id-{label}"))
            .unwrap();
    }
    index.save(&path).unwrap();
    let loaded = VectorIndex::load(&path, Some(dims as u32)).unwrap();

    for probe in [0u32, 13, 49] {
        let query = pseudo_vector(probe, dims);
        let (before, d_before) = index.search(&query, 5).unwrap();
        let (after, d_after) = loaded.search(&query, 5).unwrap();
        assert_eq!(before, after);
        for (x, y) in d_before.iter().zip(d_after.iter()) {
            assert!((x - y).abs() < 1e-6);
        }
        assert_eq!(before[0], probe, "self-query must find its own label first");
    }
    assert_eq!(loaded.embedding_id_for(13).unwrap(), "id-13");
}

#[test]
fn trailer_grows_the_file_past_the_pure_payload_size() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("index.bin");

    let dims = 16;
    let mut index = VectorIndex::initialize(dims, 64, GraphParams::default());
    for label in 0..4u32 {
        index
            .add_with_id(&pseudo_vector(label, dims), &format!("embedding-{label}"))
            .unwrap();
    }
    index.save(&path).unwrap();

    let pure = 24 + 4 + 4 * (4 + dims * 4);
    let actual = std::fs::metadata(&path).unwrap().len() as usize;
    assert!(actual > pure, "id trailer must be present when the map is non-empty");
    assert_eq!(actual % 4, 0, "file must stay 4-byte aligned");
}
