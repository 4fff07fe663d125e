//! Retrieval Engine.
//!
//! Nearest-neighbour search across partitions with conjunctive metadata
//! filtering, score thresholds and offset pagination. Each requested
//! partition is scored on the blocking pool concurrently with the others, so
//! latency tracks the slowest partition rather than their sum.
//!
//! When the embedder is down the engine falls back to keyword matching over
//! record content and flags the result set as `degraded`.
//!
//! ```rust,ignore
//! let results = retriever
//!     .search(&SearchQuery::new("email login").partition(Partition::Observation).limit(5))
//!     .await?;
//! for hit in &results.hits {
//!     println!("{} {:.2}", hit.record.id, hit.score);
//! }
//! ```

use std::sync::Arc;
use std::time::Instant;

use futures_util::future::try_join_all;
use mneme_types::{MemoryRecord, Metadata, MemoryId, Partition};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::embedding::{EmbeddingCache, tokenize};
use crate::error::MemoryError;
use crate::index::rank_order;
use crate::store::{PartitionState, RecordStore};

// ─────────────────────────────────────────────────────────────────────────────
// Query / results
// ─────────────────────────────────────────────────────────────────────────────

/// Search request. Built with chained setters:
///
/// ```rust
/// use mneme_memory::search::SearchQuery;
/// use mneme_types::{Partition, keys};
///
/// let q = SearchQuery::new("submit the form")
///     .partition(Partition::Action)
///     .filter(keys::SUCCESS, true)
///     .min_score(0.5)
///     .limit(5);
/// assert_eq!(q.partitions, vec![Partition::Action]);
/// assert_eq!(q.offset, 0);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchQuery {
    pub text: String,
    /// Partitions to search; empty means all of them.
    pub partitions: Vec<Partition>,
    pub limit: usize,
    pub offset: usize,
    /// AND-only equality predicate over metadata.
    pub filter: Metadata,
    pub min_score: f32,
}

impl SearchQuery {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            partitions: Vec::new(),
            limit: 10,
            offset: 0,
            filter: Metadata::new(),
            min_score: 0.0,
        }
    }

    /// Add a partition to the search set.
    pub fn partition(mut self, partition: Partition) -> Self {
        if !self.partitions.contains(&partition) {
            self.partitions.push(partition);
        }
        self
    }

    pub fn partitions(mut self, partitions: impl IntoIterator<Item = Partition>) -> Self {
        for p in partitions {
            self = self.partition(p);
        }
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    pub fn filter(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filter.insert(key, value);
        self
    }

    pub fn min_score(mut self, min_score: f32) -> Self {
        self.min_score = min_score;
        self
    }

    fn resolved_partitions(&self) -> Vec<Partition> {
        if self.partitions.is_empty() {
            Partition::ALL.to_vec()
        } else {
            self.partitions.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub record: MemoryRecord,
    /// Cosine similarity in `[0, 1]`, or keyword coverage when degraded.
    pub score: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResults {
    /// The requested page.
    pub hits: Vec<SearchHit>,
    /// Matches across all pages.
    pub total_count: usize,
    /// `true` when scores come from keyword matching instead of embeddings.
    pub degraded: bool,
    pub search_time_ms: f64,
}

impl SearchResults {
    pub fn empty() -> Self {
        Self {
            hits: Vec::new(),
            total_count: 0,
            degraded: false,
            search_time_ms: 0.0,
        }
    }

    pub fn ids(&self) -> Vec<MemoryId> {
        self.hits.iter().map(|h| h.record.id.clone()).collect()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Scoring
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Clone)]
enum Scoring {
    Vector(Arc<Vec<f32>>),
    Keywords(Arc<Vec<String>>),
}

struct PartitionHits {
    total: usize,
    top: Vec<SearchHit>,
}

/// Fraction of query terms that occur in `content` (case-insensitive).
pub fn keyword_score(terms: &[String], content: &str) -> f32 {
    if terms.is_empty() {
        return 0.0;
    }
    let haystack = content.to_lowercase();
    let matched = terms.iter().filter(|t| haystack.contains(t.as_str())).count();
    matched as f32 / terms.len() as f32
}

fn query_terms(text: &str) -> Vec<String> {
    let terms: Vec<String> = tokenize(text).collect();
    if terms.is_empty() && !text.trim().is_empty() {
        vec![text.trim().to_lowercase()]
    } else {
        terms
    }
}

/// Score one partition and keep the best `window` hits.
fn score_partition(
    state: &PartitionState,
    scoring: &Scoring,
    filter: &Metadata,
    min_score: f32,
    window: usize,
) -> PartitionHits {
    let mut scored: Vec<(MemoryId, f32)> = match scoring {
        Scoring::Vector(query) => {
            let accept = |id: &MemoryId| state.get(id).is_some_and(|r| r.metadata.matches(filter));
            state.index().search(query, None, &accept)
        }
        Scoring::Keywords(terms) => {
            let mut scored: Vec<(MemoryId, f32)> = state
                .records()
                .filter(|r| r.metadata.matches(filter))
                .map(|r| (r.id.clone(), keyword_score(terms, &r.content)))
                .filter(|(_, s)| *s > 0.0)
                .collect();
            scored.sort_by(|a, b| rank_order((&a.0, a.1), (&b.0, b.1)));
            scored
        }
    };
    scored.retain(|(_, s)| *s >= min_score);
    let total = scored.len();
    scored.truncate(window);
    let top = scored
        .into_iter()
        .filter_map(|(id, score)| {
            state.get(&id).map(|record| SearchHit {
                record: record.clone(),
                score,
            })
        })
        .collect();
    PartitionHits { total, top }
}

// ─────────────────────────────────────────────────────────────────────────────
// Retriever
// ─────────────────────────────────────────────────────────────────────────────

/// Runs [`SearchQuery`]s against a [`RecordStore`].
pub struct Retriever {
    store: Arc<RecordStore>,
    cache: Arc<EmbeddingCache>,
}

impl Retriever {
    pub fn new(store: Arc<RecordStore>, cache: Arc<EmbeddingCache>) -> Self {
        Self { store, cache }
    }

    /// Execute `query`. An `offset` past the end yields an empty page with
    /// the correct `total_count`.
    #[instrument(
        skip(self, query),
        fields(query = %query.text, limit = query.limit, offset = query.offset)
    )]
    pub async fn search(&self, query: &SearchQuery) -> Result<SearchResults, MemoryError> {
        let started = Instant::now();
        let (scoring, degraded) = match self.cache.get_or_compute(&query.text).await {
            Ok(vector) => (Scoring::Vector(Arc::new(vector)), false),
            Err(err @ (MemoryError::EmbeddingUnavailable(_) | MemoryError::Timeout(_))) => {
                warn!(error = %err, "embedding unavailable; falling back to keyword match");
                (Scoring::Keywords(Arc::new(query_terms(&query.text))), true)
            }
            Err(err) => return Err(err),
        };

        let window = query.offset.saturating_add(query.limit);
        let jobs = query.resolved_partitions().into_iter().map(|partition| {
            let scoring = scoring.clone();
            let filter = query.filter.clone();
            let min_score = query.min_score;
            async move {
                let state = self.store.read_partition(partition).await?;
                let hits = tokio::task::spawn_blocking(move || {
                    score_partition(&state, &scoring, &filter, min_score, window)
                })
                .await?;
                Ok::<_, MemoryError>(hits)
            }
        });
        let per_partition = try_join_all(jobs).await?;

        let total_count: usize = per_partition.iter().map(|p| p.total).sum();
        let mut merged: Vec<SearchHit> = per_partition.into_iter().flat_map(|p| p.top).collect();
        merged.sort_by(|a, b| rank_order((&a.record.id, a.score), (&b.record.id, b.score)));
        let hits: Vec<SearchHit> =
            merged.into_iter().skip(query.offset).take(query.limit).collect();

        let search_time_ms = started.elapsed().as_secs_f64() * 1000.0;
        debug!(total_count, returned = hits.len(), degraded, search_time_ms, "search complete");
        Ok(SearchResults {
            hits,
            total_count,
            degraded,
            search_time_ms,
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::{Embedder, HashingEmbedder};
    use async_trait::async_trait;
    use mneme_types::{ActionSpec, RecordKind, keys};
    use std::time::Duration;

    const DIM: usize = 64;

    struct Offline;

    #[async_trait]
    impl Embedder for Offline {
        fn dimension(&self) -> usize {
            DIM
        }

        async fn embed(&self, _text: &str) -> Result<Vec<f32>, MemoryError> {
            Err(MemoryError::EmbeddingUnavailable("offline".into()))
        }
    }

    fn setup(embedder: Arc<dyn Embedder>) -> (Arc<RecordStore>, Retriever) {
        let store = Arc::new(RecordStore::in_memory(DIM));
        let cache = Arc::new(EmbeddingCache::new(embedder, 100, Duration::from_secs(1)));
        (Arc::clone(&store), Retriever::new(store, cache))
    }

    async fn put(store: &RecordStore, kind: RecordKind, content: &str, meta: Metadata) -> MemoryId {
        let vector = HashingEmbedder::new(DIM).embed_sync(content);
        store
            .insert(MemoryRecord::new(kind, content, vector, meta))
            .await
            .unwrap()
    }

    fn action(success: bool) -> RecordKind {
        RecordKind::Action {
            action: ActionSpec::new("click"),
            success,
        }
    }

    #[test]
    fn keyword_score_is_term_coverage() {
        let terms = vec!["password".to_string(), "reset".to_string()];
        assert_eq!(keyword_score(&terms, "Enter your PASSWORD"), 0.5);
        assert_eq!(keyword_score(&terms, "nothing here"), 0.0);
        assert_eq!(keyword_score(&[], "anything"), 0.0);
    }

    #[tokio::test]
    async fn best_match_ranks_first_across_partitions() {
        let (store, retriever) = setup(Arc::new(HashingEmbedder::new(DIM)));
        let inbox = "inbox shows unread mail";
        let target = put(&store, RecordKind::observation(), inbox, Metadata::new()).await;
        put(&store, action(true), "weather widget refreshed", Metadata::new()).await;
        let results = retriever.search(&SearchQuery::new("unread mail inbox")).await.unwrap();
        assert!(!results.degraded);
        assert_eq!(results.hits[0].record.id, target);
        assert!(results.hits[0].score > 0.5);
    }

    #[tokio::test]
    async fn partition_restriction_is_honoured() {
        let (store, retriever) = setup(Arc::new(HashingEmbedder::new(DIM)));
        put(&store, RecordKind::observation(), "save button", Metadata::new()).await;
        let act = put(&store, action(true), "save button", Metadata::new()).await;
        let results = retriever
            .search(&SearchQuery::new("save button").partition(Partition::Action))
            .await
            .unwrap();
        assert_eq!(results.total_count, 1);
        assert_eq!(results.hits[0].record.id, act);
    }

    #[tokio::test]
    async fn metadata_filter_is_conjunctive() {
        let (store, retriever) = setup(Arc::new(HashingEmbedder::new(DIM)));
        let tagged = |success: bool, app: &str| {
            Metadata::new().with(keys::SUCCESS, success).with("app", app)
        };
        let ok = put(&store, action(true), "submit form", tagged(true, "crm")).await;
        put(&store, action(false), "submit form", tagged(false, "crm")).await;
        put(&store, action(true), "submit form", tagged(true, "mail")).await;
        let results = retriever
            .search(
                &SearchQuery::new("submit form")
                    .filter(keys::SUCCESS, true)
                    .filter("app", "crm"),
            )
            .await
            .unwrap();
        assert_eq!(results.ids(), vec![ok]);
    }

    #[tokio::test]
    async fn min_score_drops_weak_matches() {
        let (store, retriever) = setup(Arc::new(HashingEmbedder::new(DIM)));
        put(&store, RecordKind::observation(), "alpha beta", Metadata::new()).await;
        put(&store, RecordKind::observation(), "completely different words", Metadata::new()).await;
        let results = retriever
            .search(&SearchQuery::new("alpha beta").min_score(0.9))
            .await
            .unwrap();
        assert_eq!(results.total_count, 1);
    }

    #[tokio::test]
    async fn pages_concatenate_to_full_ordering() {
        let (store, retriever) = setup(Arc::new(HashingEmbedder::new(DIM)));
        for i in 0..7 {
            let page = format!("report page {i}");
            put(&store, RecordKind::observation(), &page, Metadata::new()).await;
            put(&store, action(true), &format!("open report {i}"), Metadata::new()).await;
        }
        let full = retriever.search(&SearchQuery::new("report").limit(100)).await.unwrap();
        assert_eq!(full.total_count, 14);

        let mut paged = Vec::new();
        let mut offset = 0;
        while offset < full.total_count {
            let page = retriever
                .search(&SearchQuery::new("report").offset(offset).limit(3))
                .await
                .unwrap();
            assert_eq!(page.total_count, full.total_count);
            paged.extend(page.ids());
            offset += 3;
        }
        assert_eq!(paged, full.ids());
    }

    #[tokio::test]
    async fn offset_past_end_is_empty_not_error() {
        let (store, retriever) = setup(Arc::new(HashingEmbedder::new(DIM)));
        put(&store, RecordKind::observation(), "one", Metadata::new()).await;
        let page = retriever.search(&SearchQuery::new("one").offset(5)).await.unwrap();
        assert!(page.hits.is_empty());
        assert_eq!(page.total_count, 1);
    }

    #[tokio::test]
    async fn outage_falls_back_to_keywords() {
        let (store, retriever) = setup(Arc::new(Offline));
        let prompt = "Enter your password to continue";
        let hit = put(&store, RecordKind::observation(), prompt, Metadata::new()).await;
        put(&store, RecordKind::observation(), "Calendar for next week", Metadata::new()).await;
        let results = retriever.search(&SearchQuery::new("password")).await.unwrap();
        assert!(results.degraded);
        assert_eq!(results.ids(), vec![hit]);
        assert_eq!(results.hits[0].score, 1.0);
    }
}
