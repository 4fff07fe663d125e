//! Embedding function seam and the memoizing cache in front of it.
//!
//! [`EmbeddingCache::get_or_compute`] keeps a bounded LRU map keyed by a hash
//! of the input text. Concurrent misses for the same key share a single
//! in-flight computation: the first caller runs the embedder, the others
//! await its result.
//!
//! ```rust
//! use std::sync::Arc;
//! use std::time::Duration;
//! use mneme_memory::embedding::{EmbeddingCache, HashingEmbedder};
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let embedder = Arc::new(HashingEmbedder::new(64));
//! let cache = EmbeddingCache::new(embedder, 100, Duration::from_secs(1));
//! let a = cache.get_or_compute("open the settings page").await.unwrap();
//! let b = cache.get_or_compute("open the settings page").await.unwrap();
//! assert_eq!(a, b);
//! assert_eq!(cache.stats().hits, 1);
//! # });
//! ```

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tracing::debug;

use crate::error::MemoryError;

// ─────────────────────────────────────────────────────────────────────────────
// Embedder trait
// ─────────────────────────────────────────────────────────────────────────────

/// External `embed(text) -> vector` function.
///
/// Implementations should report failures as
/// [`MemoryError::EmbeddingUnavailable`].
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Length of every vector this embedder returns.
    fn dimension(&self) -> usize;

    async fn embed(&self, text: &str) -> Result<Vec<f32>, MemoryError>;
}

// ─────────────────────────────────────────────────────────────────────────────
// HashingEmbedder
// ─────────────────────────────────────────────────────────────────────────────

const STOPWORDS: &[&str] = &[
    "a", "an", "and", "at", "by", "for", "in", "is", "it", "of", "on", "or", "the", "to", "with",
];

/// Deterministic offline embedder based on signed feature hashing of word
/// tokens. Texts sharing words land close together; no model required.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimension: usize,
}

impl HashingEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }

    /// Synchronous embedding, L2-normalised. Text without any usable token
    /// maps to the zero vector.
    pub fn embed_sync(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dimension];
        for token in tokenize(text) {
            let h = fnv1a(token.as_bytes());
            let slot = (h % self.dimension as u64) as usize;
            let sign = if (h >> 63) == 0 { 1.0 } else { -1.0 };
            v[slot] += sign;
        }
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            v.iter_mut().for_each(|x| *x /= norm);
        }
        v
    }
}

#[async_trait]
impl Embedder for HashingEmbedder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, MemoryError> {
        Ok(self.embed_sync(text))
    }
}

/// Lower-cased alphanumeric words, stopwords removed.
pub fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .filter(|t| !STOPWORDS.contains(&t.as_str()))
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in bytes {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

// ─────────────────────────────────────────────────────────────────────────────
// LRU map
// ─────────────────────────────────────────────────────────────────────────────

/// Least-recently-used map from key hash to vector. Recency is a monotonic
/// tick; the oldest tick is evicted first.
struct Lru {
    capacity: usize,
    tick: u64,
    entries: HashMap<u64, (Arc<Vec<f32>>, u64)>,
    order: BTreeMap<u64, u64>,
}

impl Lru {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            tick: 0,
            entries: HashMap::new(),
            order: BTreeMap::new(),
        }
    }

    fn get(&mut self, key: u64) -> Option<Arc<Vec<f32>>> {
        self.tick += 1;
        let tick = self.tick;
        let (vector, last) = self.entries.get_mut(&key)?;
        self.order.remove(last);
        *last = tick;
        self.order.insert(tick, key);
        Some(Arc::clone(vector))
    }

    fn insert(&mut self, key: u64, vector: Arc<Vec<f32>>) {
        if self.capacity == 0 {
            return;
        }
        self.tick += 1;
        if let Some((_, old)) = self.entries.insert(key, (vector, self.tick)) {
            self.order.remove(&old);
        }
        self.order.insert(self.tick, key);
        while self.entries.len() > self.capacity {
            let Some((_, evicted)) = self.order.pop_first() else {
                break;
            };
            self.entries.remove(&evicted);
        }
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// EmbeddingCache
// ─────────────────────────────────────────────────────────────────────────────

type InFlight = Arc<OnceCell<Arc<Vec<f32>>>>;

struct CacheState {
    lru: Lru,
    in_flight: HashMap<u64, InFlight>,
}

/// Cache hit/miss counters. `misses` counts actual embedder invocations.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub size: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
    pub usage_percent: f64,
}

/// Bounded, concurrency-safe memo in front of an [`Embedder`].
pub struct EmbeddingCache {
    embedder: Arc<dyn Embedder>,
    timeout: Duration,
    capacity: usize,
    state: Mutex<CacheState>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl EmbeddingCache {
    pub fn new(embedder: Arc<dyn Embedder>, capacity: usize, timeout: Duration) -> Self {
        Self {
            embedder,
            timeout,
            capacity,
            state: Mutex::new(CacheState {
                lru: Lru::new(capacity),
                in_flight: HashMap::new(),
            }),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn dimension(&self) -> usize {
        self.embedder.dimension()
    }

    /// Return the cached vector for `text`, computing it at most once across
    /// concurrent callers.
    ///
    /// Errors: [`MemoryError::Timeout`] when the embedder exceeds the
    /// configured timeout, [`MemoryError::DimensionMismatch`] when it returns
    /// a vector of the wrong length, otherwise whatever the embedder reports
    /// (normally [`MemoryError::EmbeddingUnavailable`]). Failures are not
    /// cached.
    pub async fn get_or_compute(&self, text: &str) -> Result<Vec<f32>, MemoryError> {
        let key = cache_key(text);
        let cell = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(hit) = state.lru.get(key) {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(hit.as_ref().clone());
            }
            Arc::clone(state.in_flight.entry(key).or_default())
        };

        let result = cell
            .get_or_try_init(|| async {
                self.misses.fetch_add(1, Ordering::Relaxed);
                debug!(key, "embedding cache miss");
                let embedded = tokio::time::timeout(self.timeout, self.embedder.embed(text)).await;
                let vector = match embedded {
                    Ok(result) => result?,
                    Err(_) => return Err(MemoryError::Timeout(self.timeout)),
                };
                let expected = self.embedder.dimension();
                if vector.len() != expected {
                    return Err(MemoryError::DimensionMismatch {
                        expected,
                        actual: vector.len(),
                    });
                }
                Ok(Arc::new(vector))
            })
            .await
            .map(Arc::clone);

        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state
            .in_flight
            .get(&key)
            .is_some_and(|current| Arc::ptr_eq(current, &cell))
        {
            state.in_flight.remove(&key);
        }
        let vector = result?;
        state.lru.insert(key, Arc::clone(&vector));
        Ok(vector.as_ref().clone())
    }

    pub fn stats(&self) -> CacheStats {
        let size = self
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .lru
            .len();
        let usage_percent = if self.capacity == 0 {
            0.0
        } else {
            size as f64 / self.capacity as f64 * 100.0
        };
        CacheStats {
            size,
            capacity: self.capacity,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            usage_percent,
        }
    }
}

fn cache_key(text: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    text.hash(&mut hasher);
    hasher.finish()
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::cosine_similarity;
    use std::sync::atomic::AtomicUsize;

    /// Counts invocations and sleeps to widen the race window.
    struct SlowCounting {
        calls: AtomicUsize,
        delay: Duration,
    }

    #[async_trait]
    impl Embedder for SlowCounting {
        fn dimension(&self) -> usize {
            4
        }

        async fn embed(&self, _text: &str) -> Result<Vec<f32>, MemoryError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok(vec![1.0, 0.0, 0.0, 0.0])
        }
    }

    struct Failing;

    #[async_trait]
    impl Embedder for Failing {
        fn dimension(&self) -> usize {
            4
        }

        async fn embed(&self, _text: &str) -> Result<Vec<f32>, MemoryError> {
            Err(MemoryError::EmbeddingUnavailable("model offline".into()))
        }
    }

    struct WrongDimension;

    #[async_trait]
    impl Embedder for WrongDimension {
        fn dimension(&self) -> usize {
            4
        }

        async fn embed(&self, _text: &str) -> Result<Vec<f32>, MemoryError> {
            Ok(vec![1.0, 2.0])
        }
    }

    fn slow(delay_ms: u64) -> Arc<SlowCounting> {
        Arc::new(SlowCounting {
            calls: AtomicUsize::new(0),
            delay: Duration::from_millis(delay_ms),
        })
    }

    // ── HashingEmbedder ──────────────────────────────────────────────────────

    #[test]
    fn hashing_embedder_is_deterministic_and_normalised() {
        let e = HashingEmbedder::new(128);
        let a = e.embed_sync("Login form with email and password");
        let b = e.embed_sync("Login form with email and password");
        assert_eq!(a, b);
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn hashing_embedder_relates_shared_words() {
        let e = HashingEmbedder::new(384);
        let doc = e.embed_sync("Login form with email and password");
        let related = e.embed_sync("email login");
        let unrelated = e.embed_sync("weather forecast tomorrow");
        assert!(cosine_similarity(&doc, &related) > cosine_similarity(&doc, &unrelated));
    }

    #[test]
    fn tokenize_drops_stopwords_and_case() {
        let tokens: Vec<String> = tokenize("Open THE Settings, and save!").collect();
        assert_eq!(tokens, vec!["open", "settings", "save"]);
    }

    // ── Lru ──────────────────────────────────────────────────────────────────

    #[test]
    fn lru_evicts_least_recently_used() {
        let mut lru = Lru::new(2);
        lru.insert(1, Arc::new(vec![1.0]));
        lru.insert(2, Arc::new(vec![2.0]));
        assert!(lru.get(1).is_some()); // 2 is now the oldest
        lru.insert(3, Arc::new(vec![3.0]));
        assert!(lru.get(2).is_none());
        assert!(lru.get(1).is_some());
        assert!(lru.get(3).is_some());
        assert_eq!(lru.len(), 2);
    }

    #[test]
    fn lru_with_zero_capacity_stores_nothing() {
        let mut lru = Lru::new(0);
        lru.insert(1, Arc::new(vec![1.0]));
        assert_eq!(lru.len(), 0);
    }

    // ── EmbeddingCache ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn second_lookup_is_a_hit() {
        let embedder = slow(0);
        let cache = EmbeddingCache::new(embedder.clone(), 10, Duration::from_secs(1));
        cache.get_or_compute("x").await.unwrap();
        cache.get_or_compute("x").await.unwrap();
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 1);
        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses, stats.size), (1, 1, 1));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_misses_compute_once() {
        let embedder = slow(50);
        let cache = Arc::new(EmbeddingCache::new(embedder.clone(), 10, Duration::from_secs(5)));
        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let cache = Arc::clone(&cache);
                tokio::spawn(async move { cache.get_or_compute("x").await })
            })
            .collect();
        for t in tasks {
            assert_eq!(t.await.unwrap().unwrap(), vec![1.0, 0.0, 0.0, 0.0]);
        }
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn capacity_bounds_entries() {
        let cache =
            EmbeddingCache::new(Arc::new(HashingEmbedder::new(8)), 3, Duration::from_secs(1));
        for i in 0..10 {
            cache.get_or_compute(&format!("text {i}")).await.unwrap();
        }
        let stats = cache.stats();
        assert_eq!(stats.size, 3);
        assert!((stats.usage_percent - 100.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn failure_propagates_and_is_not_cached() {
        let cache = EmbeddingCache::new(Arc::new(Failing), 10, Duration::from_secs(1));
        let err = cache.get_or_compute("x").await.unwrap_err();
        assert!(matches!(err, MemoryError::EmbeddingUnavailable(_)));
        assert!(cache.get_or_compute("x").await.is_err());
        assert_eq!(cache.stats().size, 0);
        assert_eq!(cache.stats().misses, 2);
    }

    #[tokio::test]
    async fn slow_embedder_times_out() {
        let cache = EmbeddingCache::new(slow(200), 10, Duration::from_millis(10));
        let err = cache.get_or_compute("x").await.unwrap_err();
        assert!(matches!(err, MemoryError::Timeout(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn wrong_dimension_is_rejected() {
        let cache = EmbeddingCache::new(Arc::new(WrongDimension), 10, Duration::from_secs(1));
        let err = cache.get_or_compute("x").await.unwrap_err();
        assert!(matches!(err, MemoryError::DimensionMismatch { expected: 4, actual: 2 }));
    }
}
