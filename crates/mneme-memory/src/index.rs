//! Vector similarity and the nearest-neighbour index seam.
//!
//! [`VectorIndex`] is the pluggable search structure each partition owns.
//! [`FlatIndex`] is the exact, exhaustive implementation used by default;
//! an approximate index can be swapped in through
//! [`RecordStore::with_index_factory`](crate::store::RecordStore::with_index_factory).

use std::collections::HashMap;

use mneme_types::MemoryId;

// ─────────────────────────────────────────────────────────────────────────────
// Similarity
// ─────────────────────────────────────────────────────────────────────────────

/// Compute the cosine similarity between two equal-length vectors.
///
/// Returns a value in `[-1.0, 1.0]`, or `0.0` if either vector has zero norm.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

/// Cosine similarity clamped to `[0, 1]`, the score reported to callers.
pub fn similarity_score(a: &[f32], b: &[f32]) -> f32 {
    cosine_similarity(a, b).clamp(0.0, 1.0)
}

// ─────────────────────────────────────────────────────────────────────────────
// VectorIndex
// ─────────────────────────────────────────────────────────────────────────────

/// Nearest-neighbour search over the vectors of one partition.
pub trait VectorIndex: Send + Sync {
    fn insert(&mut self, id: MemoryId, vector: Vec<f32>);

    fn remove(&mut self, id: &MemoryId) -> bool;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Score every vector accepted by `accept` against `query`.
    ///
    /// Results are ordered by score descending, ties broken by newer id
    /// first. `top_k = None` returns every accepted entry.
    fn search(
        &self,
        query: &[f32],
        top_k: Option<usize>,
        accept: &dyn Fn(&MemoryId) -> bool,
    ) -> Vec<(MemoryId, f32)>;
}

/// Constructor for a fresh, empty index of the given dimension.
pub type IndexFactory = dyn Fn(usize) -> Box<dyn VectorIndex> + Send + Sync;

/// Ordering used for every ranked list: score descending, then newer first.
pub fn rank_order(a: (&MemoryId, f32), b: (&MemoryId, f32)) -> std::cmp::Ordering {
    b.1.total_cmp(&a.1).then_with(|| b.0.cmp(a.0))
}

// ─────────────────────────────────────────────────────────────────────────────
// FlatIndex
// ─────────────────────────────────────────────────────────────────────────────

/// Exhaustive index: every query scores every stored vector.
#[derive(Debug, Default)]
pub struct FlatIndex {
    dimension: usize,
    ids: Vec<MemoryId>,
    vectors: Vec<Vec<f32>>,
    positions: HashMap<MemoryId, usize>,
}

impl FlatIndex {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            ..Self::default()
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }
}

impl VectorIndex for FlatIndex {
    fn insert(&mut self, id: MemoryId, vector: Vec<f32>) {
        if let Some(&pos) = self.positions.get(&id) {
            self.vectors[pos] = vector;
            return;
        }
        self.positions.insert(id.clone(), self.ids.len());
        self.ids.push(id);
        self.vectors.push(vector);
    }

    fn remove(&mut self, id: &MemoryId) -> bool {
        let Some(pos) = self.positions.remove(id) else {
            return false;
        };
        self.ids.swap_remove(pos);
        self.vectors.swap_remove(pos);
        if let Some(moved) = self.ids.get(pos) {
            self.positions.insert(moved.clone(), pos);
        }
        true
    }

    fn len(&self) -> usize {
        self.ids.len()
    }

    fn search(
        &self,
        query: &[f32],
        top_k: Option<usize>,
        accept: &dyn Fn(&MemoryId) -> bool,
    ) -> Vec<(MemoryId, f32)> {
        let mut scored: Vec<(&MemoryId, f32)> = self
            .ids
            .iter()
            .zip(&self.vectors)
            .filter(|&(id, v)| v.len() == query.len() && accept(id))
            .map(|(id, v)| (id, similarity_score(v, query)))
            .collect();
        scored.sort_by(|a, b| rank_order(*a, *b));
        if let Some(k) = top_k {
            scored.truncate(k);
        }
        scored.into_iter().map(|(id, s)| (id.clone(), s)).collect()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
