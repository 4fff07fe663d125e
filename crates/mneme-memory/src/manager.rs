//! Memory Manager – the facade callers talk to.
//!
//! Owns the [`RecordStore`], the [`EmbeddingCache`] and the retention
//! policy, and layers the operational contracts on top of them:
//!
//! | Concern            | Behaviour                                                        |
//! |--------------------|------------------------------------------------------------------|
//! | Disabled backend   | writes return [`MemoryId::disabled()`], reads return empty       |
//! | Storage failure    | `StorageUnavailable` switches the manager off, never panics      |
//! | Transient failure  | bounded retry with exponential backoff ([`RetryConfig`])         |
//! | Size quota         | `QuotaExceeded` runs a synchronous sweep, then retries once      |
//! | Quota warning      | at `warning_percent` a warning is logged and retention may run   |
//! | Tier quota         | enforced on the write path before `store()` returns              |
//! | Sessions           | the first write opens a session; every record carries its id     |
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use mneme_memory::{HashingEmbedder, MemoryConfig, MemoryManager};
//! use mneme_types::{Metadata, RecordKind};
//!
//! # async fn demo() -> Result<(), mneme_memory::MemoryError> {
//! let embedder = Arc::new(HashingEmbedder::new(256));
//! let manager = MemoryManager::open(MemoryConfig::in_memory(256), embedder)?;
//! let id = manager
//!     .store("Login form with email and password", RecordKind::observation(), Metadata::new())
//!     .await?;
//! let results = manager.search(&manager.query("email login")).await?;
//! assert_eq!(results.hits[0].record.id, id);
//! # Ok(())
//! # }
//! ```
//!
//! [`RetryConfig`]: crate::retry::RetryConfig

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::SecondsFormat;
use futures_util::future::try_join_all;
use mneme_types::{
    ActionSpec, InputKind, InputValidator, MemoryId, MemoryRecord, Metadata, Partition, RecordKind,
    WorkflowStep, keys,
};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::config::MemoryConfig;
use crate::embedding::{CacheStats, Embedder, EmbeddingCache, HashingEmbedder};
use crate::error::MemoryError;
use crate::retention::{RetentionEngine, RetentionPolicy, RetentionSummary, SizeCap};
use crate::search::{Retriever, SearchHit, SearchQuery, SearchResults};
use crate::store::RecordStore;

/// Key of the persisted retention-policy blob.
const RETENTION_POLICY_BLOB: &str = "retention_policy";

// ─────────────────────────────────────────────────────────────────────────────
// Reports
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryStats {
    pub enabled: bool,
    pub counts_by_kind: BTreeMap<Partition, usize>,
    pub total: usize,
    pub size_estimate: u64,
    pub quota_usage_percent: f64,
    pub cache: CacheStats,
    pub session: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaStatus {
    pub used_bytes: u64,
    pub limit_bytes: u64,
    pub usage_percent: f64,
    pub warning: Option<String>,
    pub should_cleanup: bool,
}

/// One item of a [`MemoryManager::store_batch`] call.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreRequest {
    pub content: String,
    pub kind: RecordKind,
    pub metadata: Metadata,
}

impl StoreRequest {
    pub fn new(content: impl Into<String>, kind: RecordKind) -> Self {
        Self {
            content: content.into(),
            kind,
            metadata: Metadata::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// MemoryManager
// ─────────────────────────────────────────────────────────────────────────────

pub struct MemoryManager {
    config: MemoryConfig,
    enabled: AtomicBool,
    store: Arc<RecordStore>,
    cache: Arc<EmbeddingCache>,
    retriever: Retriever,
    validator: Option<Arc<dyn InputValidator>>,
    session: Mutex<Option<String>>,
    /// Loaded lazily from the persisted blob, falling back to the config.
    policy: AsyncMutex<Option<RetentionPolicy>>,
    /// Serialises retention sweeps.
    sweeping: AsyncMutex<()>,
}

impl MemoryManager {
    /// Build a manager. No I/O happens until the first operation.
    pub fn open(config: MemoryConfig, embedder: Arc<dyn Embedder>) -> Result<Self, MemoryError> {
        if embedder.dimension() != config.storage.dimension {
            return Err(MemoryError::DimensionMismatch {
                expected: config.storage.dimension,
                actual: embedder.dimension(),
            });
        }
        config.retention.validate().map_err(MemoryError::InvalidConfig)?;
        Ok(Self::build(config, embedder))
    }

    /// A manager whose writes are no-ops and whose reads are empty.
    pub fn disabled() -> Self {
        let mut config = MemoryConfig::in_memory(1);
        config.enabled = false;
        Self::build(config, Arc::new(HashingEmbedder::new(1)))
    }

    fn build(config: MemoryConfig, embedder: Arc<dyn Embedder>) -> Self {
        let store = Arc::new(
            RecordStore::new(config.storage.path.clone(), config.storage.dimension)
                .with_max_bytes(config.storage.max_size_bytes()),
        );
        let cache = Arc::new(EmbeddingCache::new(
            embedder,
            config.cache.capacity,
            config.embedding.timeout(),
        ));
        let retriever = Retriever::new(Arc::clone(&store), Arc::clone(&cache));
        Self {
            enabled: AtomicBool::new(config.enabled),
            config,
            store,
            cache,
            retriever,
            validator: None,
            session: Mutex::new(None),
            policy: AsyncMutex::new(None),
            sweeping: AsyncMutex::new(()),
        }
    }

    /// Check every stored content string with `validator` first.
    pub fn with_validator(mut self, validator: Arc<dyn InputValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    pub fn record_store(&self) -> &RecordStore {
        &self.store
    }

    /// Stop accepting operations. Subsequent writes no-op.
    pub fn close(&self) {
        if self.enabled.swap(false, Ordering::AcqRel) {
            let session = self.end_session();
            info!(?session, "memory manager closed");
        }
    }

    fn disable(&self, reason: &str) {
        if self.enabled.swap(false, Ordering::AcqRel) {
            error!(reason, "storage unavailable; memory features disabled");
        }
    }

    /// Turn `StorageUnavailable` into a disabled manager plus `fallback`.
    fn degrade<T>(
        &self,
        result: Result<T, MemoryError>,
        fallback: impl FnOnce() -> T,
    ) -> Result<T, MemoryError> {
        match result {
            Err(MemoryError::StorageUnavailable(reason)) => {
                self.disable(&reason);
                Ok(fallback())
            }
            other => other,
        }
    }

    async fn with_retry<T, F, Fut>(&self, mut op: F) -> Result<T, MemoryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, MemoryError>>,
    {
        let retry = &self.config.retry;
        let mut attempt = 1;
        loop {
            match op().await {
                Err(err) if err.is_retryable() && retry.should_retry(attempt) => {
                    let delay = retry.delay_for(attempt);
                    warn!(attempt, ?delay, error = %err, "transient storage failure; retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    /// Retried write; on `QuotaExceeded` sweep down to the cleanup target
    /// and try exactly once more.
    async fn write<T, F, Fut>(&self, mut op: F) -> Result<T, MemoryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, MemoryError>>,
    {
        match self.with_retry(&mut op).await {
            Err(MemoryError::QuotaExceeded { used, limit }) => {
                warn!(used, limit, "storage quota exceeded; running retention before retrying");
                let target = self.config.storage.cleanup_target_bytes();
                {
                    let _sweeping = self.sweeping.lock().await;
                    self.sweep(SizeCap {
                        limit_bytes: target,
                        target_bytes: target,
                    })
                    .await?;
                }
                self.with_retry(op).await
            }
            other => other,
        }
    }

    // ── Sessions ─────────────────────────────────────────────────────────────

    /// Open a session, replacing any active one. Returns its id.
    pub fn start_session(&self, id: Option<String>) -> String {
        let id = id.unwrap_or_else(|| format!("session_{}", Uuid::new_v4().simple()));
        *self.session.lock().unwrap_or_else(PoisonError::into_inner) = Some(id.clone());
        info!(session = %id, "session started");
        id
    }

    /// Close the active session, returning its id.
    pub fn end_session(&self) -> Option<String> {
        let ended = self.session.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(id) = &ended {
            info!(session = %id, "session ended");
        }
        ended
    }

    pub fn current_session(&self) -> Option<String> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn ensure_session(&self) -> String {
        let mut slot = self.session.lock().unwrap_or_else(PoisonError::into_inner);
        match slot.as_ref() {
            Some(id) => id.clone(),
            None => {
                let id = format!("session_{}", Uuid::new_v4().simple());
                debug!(session = %id, "session opened on first write");
                *slot = Some(id.clone());
                id
            }
        }
    }

    // ── Writes ───────────────────────────────────────────────────────────────

    fn check_input(&self, content: &str) -> Result<(), MemoryError> {
        let Some(validator) = &self.validator else {
            return Ok(());
        };
        let verdict = validator.validate(content, InputKind::General);
        if verdict.ok {
            return Ok(());
        }
        let reason = verdict.reason.unwrap_or_else(|| "rejected".to_string());
        warn!(%reason, "content rejected by validator");
        Err(MemoryError::ValidationRejected {
            kind: InputKind::General,
            reason,
        })
    }

    /// Validate caller metadata and add the fields every record carries.
    fn prepare(&self, request: StoreRequest) -> Result<(MemoryId, StoreRequest), MemoryError> {
        self.check_input(&request.content)?;
        let StoreRequest {
            content,
            kind,
            mut metadata,
        } = request;
        metadata.validate()?;
        let id = MemoryId::generate(kind.partition());
        metadata.insert_default(
            keys::CREATED_AT,
            id.created_at().to_rfc3339_opts(SecondsFormat::Micros, true),
        );
        metadata.insert_default(keys::SESSION_ID, self.ensure_session());
        if let Some(success) = kind.success() {
            metadata.insert_default(keys::SUCCESS, success);
        }
        Ok((id, StoreRequest { content, kind, metadata }))
    }

    /// Embed and persist `content`. Returns the sentinel id when disabled.
    #[instrument(skip(self, content, metadata), fields(partition = %kind.partition()))]
    pub async fn store(
        &self,
        content: impl Into<String>,
        kind: RecordKind,
        metadata: Metadata,
    ) -> Result<MemoryId, MemoryError> {
        if !self.is_enabled() {
            debug!("memory disabled; store skipped");
            return Ok(MemoryId::disabled());
        }
        let (id, request) = self.prepare(StoreRequest {
            content: content.into(),
            kind,
            metadata,
        })?;
        let vector = self.cache.get_or_compute(&request.content).await?;
        let record = MemoryRecord {
            id,
            kind: request.kind,
            content: request.content,
            vector,
            metadata: request.metadata,
        };
        let partition = record.partition();

        let stored = self.write(|| self.store.insert(record.clone())).await;
        let id = match self.degrade(stored.map(Some), || None)? {
            Some(id) => id,
            None => return Ok(MemoryId::disabled()),
        };
        self.after_write(&[partition]).await;
        debug!(%id, "memory stored");
        Ok(id)
    }

    /// Embed every item, then insert them in one atomic batch.
    #[instrument(skip(self, items), fields(count = items.len()))]
    pub async fn store_batch(
        &self,
        items: Vec<StoreRequest>,
    ) -> Result<Vec<MemoryId>, MemoryError> {
        if !self.is_enabled() {
            return Ok(vec![MemoryId::disabled(); items.len()]);
        }
        let count = items.len();
        let prepared = items
            .into_iter()
            .map(|item| self.prepare(item))
            .collect::<Result<Vec<_>, _>>()?;
        let embeddings = prepared.iter().map(|(_, r)| self.cache.get_or_compute(&r.content));
        let vectors = try_join_all(embeddings).await?;
        let records: Vec<MemoryRecord> = prepared
            .into_iter()
            .zip(vectors)
            .map(|((id, request), vector)| MemoryRecord {
                id,
                kind: request.kind,
                content: request.content,
                vector,
                metadata: request.metadata,
            })
            .collect();
        let partitions: Vec<Partition> = records
            .iter()
            .map(MemoryRecord::partition)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let stored = self.write(|| self.store.insert_batch(records.clone())).await;
        let ids = match self.degrade(stored.map(Some), || None)? {
            Some(ids) => ids,
            None => return Ok(vec![MemoryId::disabled(); count]),
        };
        self.after_write(&partitions).await;
        Ok(ids)
    }

    pub async fn store_observation(
        &self,
        content: impl Into<String>,
        interpretation: Option<String>,
        provider: Option<String>,
        screen_text: Option<String>,
        metadata: Metadata,
    ) -> Result<MemoryId, MemoryError> {
        let kind = RecordKind::Observation {
            interpretation,
            provider,
            screen_text,
        };
        self.store(content, kind, metadata).await
    }

    pub async fn store_action(
        &self,
        content: impl Into<String>,
        action: ActionSpec,
        success: bool,
        metadata: Metadata,
    ) -> Result<MemoryId, MemoryError> {
        self.store(content, RecordKind::Action { action, success }, metadata)
            .await
    }

    pub async fn store_workflow(
        &self,
        content: impl Into<String>,
        name: impl Into<String>,
        steps: Vec<WorkflowStep>,
        success: bool,
        duration_secs: f64,
        metadata: Metadata,
    ) -> Result<MemoryId, MemoryError> {
        let kind = RecordKind::Workflow {
            name: name.into(),
            steps,
            success,
            duration_secs,
        };
        self.store(content, kind, metadata).await
    }

    /// Maintenance after a committed write. The write already succeeded, so
    /// failures here are logged and never reach the caller.
    async fn after_write(&self, partitions: &[Partition]) {
        if let Err(err) = self.maintain(partitions).await {
            warn!(error = %err, "post-write maintenance failed; record kept");
        }
    }

    /// Tier quota for the touched partitions, then the usage warning.
    async fn maintain(&self, partitions: &[Partition]) -> Result<(), MemoryError> {
        let engine = RetentionEngine::new(self.retention_policy().await?);
        for &partition in partitions {
            engine.enforce_quota(&self.store, partition).await?;
        }

        let quota = self.check_quota().await?;
        if let Some(warning) = &quota.warning {
            warn!(usage_percent = quota.usage_percent, "{warning}");
            // Someone else already sweeping is good enough.
            if let Ok(_sweeping) = self.sweeping.try_lock() {
                // Trim below the warning line so the next write does not
                // sweep again.
                let storage = &self.config.storage;
                let cap = SizeCap {
                    limit_bytes: storage.warning_bytes().saturating_sub(1),
                    target_bytes: storage.cleanup_target_bytes(),
                };
                self.sweep(cap).await?;
            }
        }
        Ok(())
    }

    /// Delete a record. `false` when it did not exist or memory is disabled.
    pub async fn delete(&self, id: &MemoryId) -> Result<bool, MemoryError> {
        if !self.is_enabled() {
            return Ok(false);
        }
        let deleted = self.with_retry(|| self.store.delete(id)).await;
        self.degrade(deleted, || false)
    }

    /// Additively merge `patch` into a record's metadata. `None` when the
    /// record does not exist or memory is disabled.
    pub async fn patch_metadata(
        &self,
        id: &MemoryId,
        patch: Metadata,
    ) -> Result<Option<MemoryRecord>, MemoryError> {
        if !self.is_enabled() {
            return Ok(None);
        }
        let patched = self
            .with_retry(|| self.store.update_metadata(id, patch.clone()))
            .await;
        match self.degrade(patched.map(Some), || None) {
            Err(MemoryError::NotFound(_)) => Ok(None),
            other => other,
        }
    }

    /// Protect a record from every retention phase.
    pub async fn pin(&self, id: &MemoryId) -> Result<bool, MemoryError> {
        let patched = self
            .patch_metadata(id, Metadata::new().with(keys::PINNED, true))
            .await?;
        Ok(patched.is_some())
    }

    // ── Reads ────────────────────────────────────────────────────────────────

    /// A query pre-filled with the configured default limit and min score.
    pub fn query(&self, text: impl Into<String>) -> SearchQuery {
        SearchQuery::new(text)
            .limit(self.config.search.default_limit)
            .min_score(self.config.search.default_min_score)
    }

    pub async fn search(&self, query: &SearchQuery) -> Result<SearchResults, MemoryError> {
        if !self.is_enabled() {
            return Ok(SearchResults::empty());
        }
        let results = self.retriever.search(query).await;
        self.degrade(results, SearchResults::empty)
    }

    /// Workflows similar to `query`, optionally only successful ones.
    pub async fn find_similar_workflows(
        &self,
        query: &str,
        limit: usize,
        success_only: bool,
    ) -> Result<Vec<SearchHit>, MemoryError> {
        let mut q = self.query(query).partition(Partition::Workflow).limit(limit);
        if success_only {
            q = q.filter(keys::SUCCESS, true);
        }
        Ok(self.search(&q).await?.hits)
    }

    /// The record with `id`, or `None` when it does not exist.
    pub async fn get(&self, id: &MemoryId) -> Result<Option<MemoryRecord>, MemoryError> {
        if !self.is_enabled() || id.is_disabled() {
            return Ok(None);
        }
        let found = self.with_retry(|| self.store.get(id)).await;
        match self.degrade(found.map(Some), || None) {
            Err(MemoryError::NotFound(_)) => Ok(None),
            other => other,
        }
    }

    pub async fn stats(&self) -> Result<MemoryStats, MemoryError> {
        let mut stats = MemoryStats {
            enabled: self.is_enabled(),
            counts_by_kind: Partition::ALL.iter().map(|&p| (p, 0)).collect(),
            total: 0,
            size_estimate: 0,
            quota_usage_percent: 0.0,
            cache: self.cache.stats(),
            session: self.current_session(),
        };
        if !stats.enabled {
            return Ok(stats);
        }
        for partition in Partition::ALL {
            let count = self.store.count(partition).await;
            let Some(count) = self.degrade(count.map(Some), || None)? else {
                stats.enabled = false;
                return Ok(stats);
            };
            stats.counts_by_kind.insert(partition, count);
            stats.total += count;
        }
        let quota = self.check_quota().await?;
        stats.size_estimate = quota.used_bytes;
        stats.quota_usage_percent = quota.usage_percent;
        Ok(stats)
    }

    pub async fn check_quota(&self) -> Result<QuotaStatus, MemoryError> {
        let limit_bytes = self.config.storage.max_size_bytes();
        let used_bytes = if self.is_enabled() {
            let used = self.store.total_size().await;
            self.degrade(used, || 0)?
        } else {
            0
        };
        let usage_percent = if limit_bytes == 0 {
            0.0
        } else {
            used_bytes as f64 / limit_bytes as f64 * 100.0
        };
        let over = usage_percent >= self.config.storage.warning_percent;
        let warning = over.then(|| {
            format!(
                "memory usage at {usage_percent:.1}% of {} MB quota",
                self.config.storage.max_size_mb
            )
        });
        Ok(QuotaStatus {
            used_bytes,
            limit_bytes,
            usage_percent,
            warning,
            should_cleanup: over,
        })
    }

    // ── Retention ────────────────────────────────────────────────────────────

    fn size_cap(&self) -> SizeCap {
        SizeCap {
            limit_bytes: self.config.storage.max_size_bytes(),
            target_bytes: self.config.storage.cleanup_target_bytes(),
        }
    }

    async fn sweep(&self, cap: SizeCap) -> Result<RetentionSummary, MemoryError> {
        RetentionEngine::new(self.retention_policy().await?)
            .run(&self.store, Some(cap))
            .await
    }

    /// Full age / dedup / quota / size sweep.
    #[instrument(skip(self))]
    pub async fn run_retention(&self) -> Result<RetentionSummary, MemoryError> {
        if !self.is_enabled() {
            return Ok(RetentionSummary::default());
        }
        let _sweeping = self.sweeping.lock().await;
        let summary = self.sweep(self.size_cap()).await;
        self.degrade(summary, RetentionSummary::default)
    }

    /// The active policy: the persisted blob if one was saved, otherwise the
    /// configured one. A persisted blob that does not parse or validate is
    /// `InvalidConfig` until [`set_retention_policy`](Self::set_retention_policy)
    /// replaces it.
    pub async fn retention_policy(&self) -> Result<RetentionPolicy, MemoryError> {
        let mut slot = self.policy.lock().await;
        if let Some(policy) = slot.as_ref() {
            return Ok(policy.clone());
        }
        let policy = match self.store.load_blob(RETENTION_POLICY_BLOB).await? {
            Some(json) => {
                let invalid = |reason: String| {
                    warn!(%reason, "persisted retention policy rejected");
                    MemoryError::InvalidConfig(format!("persisted retention policy: {reason}"))
                };
                let policy = serde_json::from_str::<RetentionPolicy>(&json)
                    .map_err(|e| invalid(e.to_string()))?;
                policy.validate().map_err(invalid)?;
                policy.normalized()
            }
            None => self.config.retention.clone().normalized(),
        };
        *slot = Some(policy.clone());
        Ok(policy)
    }

    /// Replace and persist the retention policy.
    pub async fn set_retention_policy(&self, policy: RetentionPolicy) -> Result<(), MemoryError> {
        policy.validate().map_err(MemoryError::InvalidConfig)?;
        let policy = policy.normalized();
        let mut slot = self.policy.lock().await;
        self.store
            .save_blob(RETENTION_POLICY_BLOB, serde_json::to_string(&policy)?)
            .await?;
        info!(tiers = policy.tiers.len(), "retention policy updated");
        *slot = Some(policy);
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
