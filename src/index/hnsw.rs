//! HNSW graph over normalized vectors with cosine distance.
//!
//! The graph is never serialized: level assignment draws from a seeded
//! generator, so rebuilding from the same seed and insertion order yields the
//! same graph. That property is what lets the index file store vectors only.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

/// Construction parameters persisted in the index header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GraphParams {
    pub m: u16,
    pub ef_construction: u16,
    pub seed: u32,
}

impl Default for GraphParams {
    fn default() -> Self {
        // The same knobs the corpus of local indexes converges on:
        // connectivity 16, build expansion 128.
        Self { m: 16, ef_construction: 128, seed: 0x9e37 }
    }
}

/// Level cap; with m = 16 a corpus would need ~16^12 vectors to reach it.
const MAX_LEVEL: usize = 12;

/// Deterministic 64-bit generator (splitmix64). Deliberately hand-rolled:
/// the graph must be reconstructible from the header seed for the lifetime
/// of the file format, so the stream cannot depend on an external crate's
/// version-to-version stability.
#[derive(Debug)]
struct SplitMix64 {
    state: u64,
}

impl SplitMix64 {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    fn next_u64(&mut self) -> u64 {
        self.state = self.state.wrapping_add(0x9e3779b97f4a7c15);
        let mut z = self.state;
        z = (z ^ (z >> 30)).wrapping_mul(0xbf58476d1ce4e5b9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94d049bb133111eb);
        z ^ (z >> 31)
    }

    /// Uniform in (0, 1].
    fn next_unit(&mut self) -> f64 {
        ((self.next_u64() >> 11) as f64 + 1.0) / ((1u64 << 53) as f64)
    }
}

/// Cosine distance between two L2-normalized vectors, in [0, 2].
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    (1.0 - dot).clamp(0.0, 2.0)
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Candidate {
    dist: f32,
    slot: usize,
}

impl Eq for Candidate {}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.dist
            .total_cmp(&other.dist)
            .then_with(|| self.slot.cmp(&other.slot))
    }
}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug)]
struct Node {
    level: usize,
    /// Neighbor lists for levels 0..=level.
    neighbors: Vec<Vec<usize>>,
}

#[derive(Debug)]
pub struct HnswGraph {
    m: usize,
    m0: usize,
    ef_construction: usize,
    level_mult: f64,
    rng: SplitMix64,
    entry: Option<usize>,
    nodes: Vec<Node>,
}

impl HnswGraph {
    pub fn new(params: &GraphParams) -> Self {
        let m = (params.m as usize).max(2);
        Self {
            m,
            m0: m * 2,
            ef_construction: (params.ef_construction as usize).max(m),
            level_mult: 1.0 / (m as f64).ln(),
            rng: SplitMix64::new(params.seed as u64),
            entry: None,
            nodes: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn draw_level(&mut self) -> usize {
        let unit = self.rng.next_unit();
        ((-unit.ln() * self.level_mult).floor() as usize).min(MAX_LEVEL)
    }

    fn cap_for(&self, level: usize) -> usize {
        if level == 0 { self.m0 } else { self.m }
    }

    /// Inserts the vector at `slot` (must equal the current node count).
    /// `vectors[slot]` must already hold the normalized vector.
    pub fn insert(&mut self, slot: usize, vectors: &[Vec<f32>]) {
        debug_assert_eq!(slot, self.nodes.len());
        let level = self.draw_level();
        self.nodes.push(Node {
            level,
            neighbors: vec![Vec::new(); level + 1],
        });

        let Some(entry) = self.entry else {
            self.entry = Some(slot);
            return;
        };

        let query = &vectors[slot];
        let top = self.nodes[entry].level;
        let mut ep = entry;

        // Greedy descent through the levels above the new node's level.
        for lc in ((level + 1)..=top).rev() {
            ep = self.greedy_closest(query, ep, lc, vectors);
        }

        // Connect on each level the node participates in.
        for lc in (0..=level.min(top)).rev() {
            let found = self.search_layer(query, ep, self.ef_construction, lc, vectors);
            ep = found.first().map(|c| c.slot).unwrap_or(ep);

            let cap = self.cap_for(lc);
            let chosen: Vec<usize> =
                found.iter().take(cap).map(|c| c.slot).collect();

            for &nb in &chosen {
                self.nodes[slot].neighbors[lc].push(nb);
                self.nodes[nb].neighbors[lc].push(slot);
                self.prune(nb, lc, vectors);
            }
        }

        if level > top {
            self.entry = Some(slot);
        }
    }

    /// Trims a node's neighbor list back to its cap, keeping the closest.
    fn prune(&mut self, slot: usize, level: usize, vectors: &[Vec<f32>]) {
        let cap = self.cap_for(level);
        if self.nodes[slot].neighbors[level].len() <= cap {
            return;
        }
        let base = &vectors[slot];
        let mut scored: Vec<(f32, usize)> = self.nodes[slot].neighbors[level]
            .iter()
            .map(|&nb| (cosine_distance(base, &vectors[nb]), nb))
            .collect();
        scored.sort_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
        scored.truncate(cap);
        self.nodes[slot].neighbors[level] = scored.into_iter().map(|(_, nb)| nb).collect();
    }

    fn greedy_closest(
        &self,
        query: &[f32],
        mut ep: usize,
        level: usize,
        vectors: &[Vec<f32>],
    ) -> usize {
        let mut best = cosine_distance(query, &vectors[ep]);
        loop {
            let mut improved = false;
            for &nb in &self.nodes[ep].neighbors[level] {
                let d = cosine_distance(query, &vectors[nb]);
                if d < best {
                    best = d;
                    ep = nb;
                    improved = true;
                }
            }
            if !improved {
                return ep;
            }
        }
    }

    /// Best-first beam search on one level; returns up to `ef` candidates
    /// sorted by ascending distance.
    fn search_layer(
        &self,
        query: &[f32],
        entry: usize,
        ef: usize,
        level: usize,
        vectors: &[Vec<f32>],
    ) -> Vec<Candidate> {
        let mut visited = vec![false; self.nodes.len()];
        visited[entry] = true;

        let first = Candidate { dist: cosine_distance(query, &vectors[entry]), slot: entry };
        let mut frontier = BinaryHeap::new();
        frontier.push(Reverse(first));
        // Max-heap: the worst kept result sits on top for cheap eviction.
        let mut kept = BinaryHeap::new();
        kept.push(first);

        while let Some(Reverse(current)) = frontier.pop() {
            let worst = kept.peek().map(|c| c.dist).unwrap_or(f32::INFINITY);
            if kept.len() >= ef && current.dist > worst {
                break;
            }
            for &nb in &self.nodes[current.slot].neighbors[level] {
                if visited[nb] {
                    continue;
                }
                visited[nb] = true;
                let cand = Candidate { dist: cosine_distance(query, &vectors[nb]), slot: nb };
                let worst = kept.peek().map(|c| c.dist).unwrap_or(f32::INFINITY);
                if kept.len() < ef || cand.dist < worst {
                    frontier.push(Reverse(cand));
                    kept.push(cand);
                    if kept.len() > ef {
                        kept.pop();
                    }
                }
            }
        }

        let mut out = kept.into_vec();
        out.sort();
        out
    }

    /// k-nearest live slots for `query`. `is_live` filters tombstoned slots
    /// out of the result set without removing them from the graph (they stay
    /// navigable until the next compaction).
    pub fn search<F>(
        &self,
        query: &[f32],
        k: usize,
        ef: usize,
        vectors: &[Vec<f32>],
        is_live: F,
    ) -> Vec<(usize, f32)>
    where
        F: Fn(usize) -> bool,
    {
        let Some(entry) = self.entry else {
            return Vec::new();
        };
        if k == 0 {
            return Vec::new();
        }

        let mut ep = entry;
        for lc in (1..=self.nodes[entry].level).rev() {
            ep = self.greedy_closest(query, ep, lc, vectors);
        }

        let beam = ef.max(k).max(1);
        self.search_layer(query, ep, beam, 0, vectors)
            .into_iter()
            .filter(|c| is_live(c.slot))
            .take(k)
            .map(|c| (c.slot, c.dist))
            .collect()
    }
}
