//! Retention & eviction policy engine.
//!
//! Keeps each partition inside its configured bounds while protecting
//! important records. A sweep runs three phases per partition, each inside
//! the partition's exclusive section so concurrent inserts cannot be swept
//! away mid-phase:
//!
//! 1. **Age** – delete records older than the oldest tier's `max_age`,
//!    unless pinned.
//! 2. **Dedup** – within each tier's age band, cluster near-duplicates
//!    (cosine similarity ≥ `dedup_threshold`) and keep one representative:
//!    the protected members if any, otherwise the newest.
//! 3. **Quota** – when a tier holds more than `max_count` records, delete the
//!    lowest-importance excess (pinned > manual > auto, then oldest first).
//!
//! An optional size cap then trims the globally least important records
//! until the store is back under its cleanup target. Every phase is
//! idempotent: a second sweep with no intervening writes deletes nothing.

use std::cmp::Ordering as CmpOrdering;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use mneme_types::{MemoryId, MemoryRecord, Partition, Source};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::error::MemoryError;
use crate::index::similarity_score;
use crate::store::{PartitionState, RecordStore};

const DAY_SECS: u64 = 24 * 60 * 60;

// ─────────────────────────────────────────────────────────────────────────────
// Policy
// ─────────────────────────────────────────────────────────────────────────────

/// Which records a tier shields from dedup and quota deletion, on top of
/// pinned records which are shielded everywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeepPredicate {
    #[default]
    PinnedOnly,
    /// Records whose outcome was a success.
    Successful,
    /// Records created explicitly rather than captured automatically.
    Manual,
}

fn default_dedup_threshold() -> f32 {
    0.95
}

/// Policy for records whose age falls in this tier's band.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetentionTier {
    pub name: String,
    /// Upper bound of the band. A record belongs to the first tier (by
    /// ascending `max_age_secs`) whose bound it does not exceed.
    pub max_age_secs: u64,
    /// Per-partition record cap for this band.
    pub max_count: usize,
    #[serde(default = "default_dedup_threshold")]
    pub dedup_threshold: f32,
    #[serde(default)]
    pub keep: KeepPredicate,
}

impl RetentionTier {
    pub fn new(name: impl Into<String>, max_age: Duration, max_count: usize) -> Self {
        Self {
            name: name.into(),
            max_age_secs: max_age.as_secs(),
            max_count,
            dedup_threshold: default_dedup_threshold(),
            keep: KeepPredicate::PinnedOnly,
        }
    }

    pub fn with_keep(mut self, keep: KeepPredicate) -> Self {
        self.keep = keep;
        self
    }

    pub fn with_dedup_threshold(mut self, threshold: f32) -> Self {
        self.dedup_threshold = threshold;
        self
    }

    /// `true` when `record` must not be removed by dedup or quota.
    pub fn protects(&self, record: &MemoryRecord) -> bool {
        record.is_pinned()
            || match self.keep {
                KeepPredicate::PinnedOnly => false,
                KeepPredicate::Successful => record.success() == Some(true),
                KeepPredicate::Manual => record.metadata.source() == Source::Manual,
            }
    }
}

/// Weights behind the quota ranking. Higher survives longer; ties go to the
/// newer record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImportanceWeights {
    pub pinned: f64,
    pub manual: f64,
    pub auto: f64,
}

impl Default for ImportanceWeights {
    fn default() -> Self {
        Self {
            pinned: 100.0,
            manual: 10.0,
            auto: 1.0,
        }
    }
}

impl ImportanceWeights {
    pub fn score(&self, record: &MemoryRecord) -> f64 {
        if record.is_pinned() {
            self.pinned
        } else {
            match record.metadata.source() {
                Source::Manual => self.manual,
                Source::Auto => self.auto,
            }
        }
    }

    /// Least important first, oldest first among equals.
    fn eviction_order(&self, a: &MemoryRecord, b: &MemoryRecord) -> CmpOrdering {
        self.score(a)
            .total_cmp(&self.score(b))
            .then_with(|| a.id.cmp(&b.id))
    }
}

/// Tier definitions plus importance weights. Persisted alongside the data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionPolicy {
    pub tiers: Vec<RetentionTier>,
    pub weights: ImportanceWeights,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            tiers: vec![
                RetentionTier::new("recent", Duration::from_secs(7 * DAY_SECS), 10_000),
                RetentionTier::new("medium", Duration::from_secs(30 * DAY_SECS), 5_000)
                    .with_keep(KeepPredicate::Successful),
                RetentionTier::new("archive", Duration::from_secs(90 * DAY_SECS), 1_000)
                    .with_keep(KeepPredicate::Successful),
            ],
            weights: ImportanceWeights::default(),
        }
    }
}

impl RetentionPolicy {
    pub fn new(tiers: Vec<RetentionTier>) -> Self {
        Self {
            tiers,
            weights: ImportanceWeights::default(),
        }
        .normalized()
    }

    /// Tiers ordered newest band first.
    pub fn normalized(mut self) -> Self {
        self.tiers.sort_by_key(|t| t.max_age_secs);
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.tiers.is_empty() {
            return Err("retention policy needs at least one tier".into());
        }
        for tier in &self.tiers {
            if tier.dedup_threshold.is_nan() || tier.dedup_threshold <= 0.0 {
                return Err(format!("tier `{}`: dedup_threshold must be positive", tier.name));
            }
        }
        Ok(())
    }

    /// Index of the tier whose band contains a record of `age`. Records
    /// older than every band belong to the oldest tier.
    pub fn tier_index(&self, age: chrono::Duration) -> usize {
        let secs = age.num_seconds().max(0) as u64;
        self.tiers
            .iter()
            .position(|t| secs <= t.max_age_secs)
            .unwrap_or_else(|| self.tiers.len().saturating_sub(1))
    }

    /// Smallest `max_count` of any tier. A partition at or below it cannot
    /// violate any tier quota.
    pub fn min_count(&self) -> usize {
        self.tiers.iter().map(|t| t.max_count).min().unwrap_or(usize::MAX)
    }

    fn oldest_max_age_secs(&self) -> Option<u64> {
        self.tiers.iter().map(|t| t.max_age_secs).max()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Summary
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetentionSummary {
    pub deleted_count: usize,
    /// Estimated bytes released.
    pub freed_estimate: u64,
    pub duration: Duration,
    pub age_deleted: usize,
    pub dedup_deleted: usize,
    pub quota_deleted: usize,
    pub size_deleted: usize,
}

impl RetentionSummary {
    fn record(&mut self, phase: Phase, deleted: usize, freed: u64) {
        self.deleted_count += deleted;
        self.freed_estimate += freed;
        match phase {
            Phase::Age => self.age_deleted += deleted,
            Phase::Dedup => self.dedup_deleted += deleted,
            Phase::Quota => self.quota_deleted += deleted,
            Phase::Size => self.size_deleted += deleted,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Phase {
    Age,
    Dedup,
    Quota,
    Size,
}

/// Global size cap applied after the per-partition phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeCap {
    pub limit_bytes: u64,
    /// Usage to trim down to once `limit_bytes` is exceeded.
    pub target_bytes: u64,
}

// ─────────────────────────────────────────────────────────────────────────────
// Planning (pure)
// ─────────────────────────────────────────────────────────────────────────────

fn age_of(record: &MemoryRecord, now: DateTime<Utc>) -> chrono::Duration {
    now - record.created_at()
}

fn plan_age(state: &PartitionState, policy: &RetentionPolicy, now: DateTime<Utc>) -> Vec<MemoryId> {
    let Some(limit) = policy.oldest_max_age_secs() else {
        return Vec::new();
    };
    state
        .records()
        .filter(|r| !r.is_pinned() && age_of(r, now).num_seconds() > limit as i64)
        .map(|r| r.id.clone())
        .collect()
}

/// Records of each tier band, newest first.
fn by_tier<'a>(
    state: &'a PartitionState,
    policy: &RetentionPolicy,
    now: DateTime<Utc>,
) -> Vec<Vec<&'a MemoryRecord>> {
    let mut bands: Vec<Vec<&MemoryRecord>> = vec![Vec::new(); policy.tiers.len()];
    for record in state.records().rev() {
        if let Some(band) = bands.get_mut(policy.tier_index(age_of(record, now))) {
            band.push(record);
        }
    }
    bands
}

fn plan_dedup(
    state: &PartitionState,
    policy: &RetentionPolicy,
    now: DateTime<Utc>,
) -> Vec<MemoryId> {
    let mut doomed = Vec::new();
    for (tier, band) in policy.tiers.iter().zip(by_tier(state, policy, now)) {
        let (protected, rest): (Vec<&MemoryRecord>, Vec<&MemoryRecord>) =
            band.into_iter().partition(|r| tier.protects(r));
        let mut seeds: Vec<&[f32]> = Vec::new();
        for record in protected {
            if !seeds
                .iter()
                .any(|s| similarity_score(s, &record.vector) >= tier.dedup_threshold)
            {
                seeds.push(&record.vector);
            }
        }
        for record in rest {
            if seeds
                .iter()
                .any(|s| similarity_score(s, &record.vector) >= tier.dedup_threshold)
            {
                doomed.push(record.id.clone());
            } else {
                seeds.push(&record.vector);
            }
        }
    }
    doomed
}

fn plan_quota(
    state: &PartitionState,
    policy: &RetentionPolicy,
    now: DateTime<Utc>,
) -> Vec<MemoryId> {
    let mut doomed = Vec::new();
    for (tier, band) in policy.tiers.iter().zip(by_tier(state, policy, now)) {
        if band.len() <= tier.max_count {
            continue;
        }
        let excess = band.len() - tier.max_count;
        let mut candidates: Vec<&MemoryRecord> =
            band.into_iter().filter(|r| !tier.protects(r)).collect();
        candidates.sort_by(|a, b| policy.weights.eviction_order(a, b));
        doomed.extend(candidates.into_iter().take(excess).map(|r| r.id.clone()));
    }
    doomed
}

// ─────────────────────────────────────────────────────────────────────────────
// RetentionEngine
// ─────────────────────────────────────────────────────────────────────────────

/// Applies a [`RetentionPolicy`] to a [`RecordStore`].
#[derive(Debug, Clone)]
pub struct RetentionEngine {
    policy: RetentionPolicy,
}

impl RetentionEngine {
    pub fn new(policy: RetentionPolicy) -> Self {
        Self {
            policy: policy.normalized(),
        }
    }

    pub fn policy(&self) -> &RetentionPolicy {
        &self.policy
    }

    /// Full sweep at the current time.
    pub async fn run(
        &self,
        store: &RecordStore,
        size_cap: Option<SizeCap>,
    ) -> Result<RetentionSummary, MemoryError> {
        self.run_at(store, size_cap, Utc::now()).await
    }

    /// Full sweep evaluated as of `now`.
    #[instrument(skip(self, store))]
    pub async fn run_at(
        &self,
        store: &RecordStore,
        size_cap: Option<SizeCap>,
        now: DateTime<Utc>,
    ) -> Result<RetentionSummary, MemoryError> {
        let started = Instant::now();
        let mut summary = RetentionSummary::default();

        for partition in Partition::ALL {
            let mut guard = store.lock_partition(partition).await?;

            let doomed = plan_age(&guard, &self.policy, now);
            let (n, freed) = guard.delete(&doomed).await?;
            summary.record(Phase::Age, n, freed);

            // Clustering is quadratic in the worst case; keep it off the
            // async workers.
            let policy = self.policy.clone();
            let (mut guard, doomed) = tokio::task::spawn_blocking(move || {
                let doomed = plan_dedup(&guard, &policy, now);
                (guard, doomed)
            })
            .await?;
            let (n, freed) = guard.delete(&doomed).await?;
            summary.record(Phase::Dedup, n, freed);

            let doomed = plan_quota(&guard, &self.policy, now);
            let (n, freed) = guard.delete(&doomed).await?;
            summary.record(Phase::Quota, n, freed);

            debug!(%partition, remaining = guard.len(), "partition swept");
        }

        if let Some(cap) = size_cap {
            self.trim_to_size(store, cap, now, &mut summary).await?;
        }

        summary.duration = started.elapsed();
        info!(
            deleted = summary.deleted_count,
            freed = summary.freed_estimate,
            age = summary.age_deleted,
            dedup = summary.dedup_deleted,
            quota = summary.quota_deleted,
            size = summary.size_deleted,
            "retention sweep complete"
        );
        Ok(summary)
    }

    /// Quota phase for a single partition, used on the write path.
    pub async fn enforce_quota(
        &self,
        store: &RecordStore,
        partition: Partition,
    ) -> Result<RetentionSummary, MemoryError> {
        let started = Instant::now();
        let mut summary = RetentionSummary::default();
        let mut guard = store.lock_partition(partition).await?;
        if guard.len() > self.policy.min_count() {
            let doomed = plan_quota(&guard, &self.policy, Utc::now());
            let (n, freed) = guard.delete(&doomed).await?;
            summary.record(Phase::Quota, n, freed);
            if n > 0 {
                debug!(%partition, deleted = n, "tier quota enforced");
            }
        }
        summary.duration = started.elapsed();
        Ok(summary)
    }

    async fn trim_to_size(
        &self,
        store: &RecordStore,
        cap: SizeCap,
        now: DateTime<Utc>,
        summary: &mut RetentionSummary,
    ) -> Result<(), MemoryError> {
        if store.total_size().await? <= cap.limit_bytes {
            return Ok(());
        }
        let mut guards = store.lock_all().await?;
        let used: u64 = guards.iter().map(|g| g.bytes()).sum();
        if used <= cap.limit_bytes {
            return Ok(());
        }

        let mut candidates: Vec<(usize, &MemoryRecord, u64)> = Vec::new();
        for (slot, guard) in guards.iter().enumerate() {
            for record in guard.records() {
                // A policy without tiers still protects pinned records.
                let tier = self.policy.tiers.get(self.policy.tier_index(age_of(record, now)));
                let protected = match tier {
                    Some(tier) => tier.protects(record),
                    None => record.is_pinned(),
                };
                if !protected {
                    candidates.push((slot, record, guard.size_of(&record.id).unwrap_or(0)));
                }
            }
        }
        candidates.sort_by(|a, b| self.policy.weights.eviction_order(a.1, b.1));

        let mut remaining = used;
        let mut doomed: Vec<Vec<MemoryId>> = vec![Vec::new(); guards.len()];
        for (slot, record, size) in candidates {
            if remaining <= cap.target_bytes {
                break;
            }
            doomed[slot].push(record.id.clone());
            remaining = remaining.saturating_sub(size);
        }

        for (guard, ids) in guards.iter_mut().zip(doomed) {
            let (n, freed) = guard.delete(&ids).await?;
            summary.record(Phase::Size, n, freed);
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
