//! `mneme-memory` – The Semantic Memory Engine.
//!
//! A persistent, embedding-indexed record store with tiered retention,
//! backed by a local SQLite substrate.
//!
//! # Modules
//!
//! - [`embedding`] – the [`Embedder`] seam, an offline
//!   [`HashingEmbedder`], and the concurrency-safe [`EmbeddingCache`].
//! - [`index`] – cosine similarity and the pluggable
//!   [`VectorIndex`][index::VectorIndex].
//! - [`store`] – [`RecordStore`][store::RecordStore]: lazily opened,
//!   partitioned by record kind, with atomic batch inserts.
//! - [`search`] – [`Retriever`][search::Retriever]: concurrent multi-partition
//!   nearest-neighbour search with keyword fallback.
//! - [`retention`] – [`RetentionEngine`][retention::RetentionEngine]: age,
//!   dedup and quota sweeps that never touch pinned records.
//! - [`manager`] – [`MemoryManager`]: the facade that ties it together.

pub mod config;
pub mod embedding;
pub mod error;
pub mod index;
pub mod manager;
pub mod retention;
pub mod retry;
pub mod search;
pub mod store;

pub use config::MemoryConfig;
pub use embedding::{CacheStats, Embedder, EmbeddingCache, HashingEmbedder};
pub use error::MemoryError;
pub use manager::{MemoryManager, MemoryStats, QuotaStatus, StoreRequest};
pub use retention::{RetentionPolicy, RetentionSummary, RetentionTier};
pub use retry::RetryConfig;
pub use search::{SearchHit, SearchQuery, SearchResults};
