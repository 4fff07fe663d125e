//! [`DecisionEngine`] – the autonomous ANALYZE → SEARCH → DECIDE → ACT loop.
//!
//! Each iteration:
//!
//! 1. **Analyze** – ask the [`SituationAnalyzer`] what it sees. A timeout or
//!    analyzer error is not fatal: it yields a zero-confidence analysis, which
//!    routes the iteration to `Cautious`.
//! 2. **Search** – look up similar prior `Action` and `Workflow` records in
//!    the [`MemoryManager`]. Memory failures are logged and treated as "no
//!    priors"; they never abort the loop.
//! 3. **Decide** – [`select_strategy`] picks one of three strategies:
//!
//!    | Strategy | When | Does |
//!    |---|---|---|
//!    | `Proven` | confident, successful prior scoring ≥ `proven_similarity` | replays it |
//!    | `Exploratory` | confident, no usable prior | best-ranked candidate not yet exhausted |
//!    | `Cautious` | low confidence, or nothing left to try | narrow re-analysis, no action |
//!
//! 4. **Act** – the chosen action passes the [`KernelGate`] (if configured)
//!    and then the [`ActionExecutor`].
//! 5. **Learn** – the attempt is stored as an `Action` record tagged with
//!    strategy, confidence and goal, whatever the outcome.
//!
//! The loop ends with a [`DecisionReport`] as soon as the analyzer reports
//! the goal satisfied, or with [`DecisionError::GoalUnreachable`] once
//! `max_iterations` or the action budget run out.
//!
//! # Example
//!
//! ```rust,no_run
//! # use std::sync::Arc;
//! # use mneme_memory::MemoryManager;
//! # use mneme_runtime::decision::*;
//! # async fn demo(analyzer: Arc<dyn SituationAnalyzer>, executor: Arc<dyn ActionExecutor>) {
//! let engine = DecisionEngine::new(
//!     DecisionConfig::default(),
//!     Arc::new(MemoryManager::disabled()),
//!     analyzer,
//!     executor,
//! );
//! match engine.run("log in to the dashboard").await {
//!     Ok(report) => println!("done in {} iterations", report.iterations),
//!     Err(e) => eprintln!("{e}"),
//! }
//! # }
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use mneme_kernel::{KernelError, KernelGate};
use mneme_memory::{MemoryManager, SearchHit};
use mneme_types::{
    ActionSpec, MemoryRecord, Metadata, Partition, REANALYZE, REPLAY_WORKFLOW, RecordKind, keys,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::loop_guard::LoopGuard;

// ─────────────────────────────────────────────────────────────────────────────
// External seams
// ─────────────────────────────────────────────────────────────────────────────

/// Failure of an analyzer or executor call.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExternalError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    /// Transient; the attempt counts as a failure and the loop continues.
    #[error("{0}")]
    Retryable(String),
    /// Ends the loop.
    #[error("{0}")]
    Fatal(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisScope {
    Full,
    /// Lower-risk, information-gathering look used by cautious steps.
    Narrow,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisRequest {
    pub goal: String,
    pub scope: AnalysisScope,
    pub iteration: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Analysis {
    pub description: String,
    /// In `[0, 1]`.
    pub confidence: f64,
    /// Ranked, best first.
    #[serde(default)]
    pub candidate_actions: Vec<ActionSpec>,
    #[serde(default)]
    pub goal_satisfied: bool,
}

impl Analysis {
    /// What the loop works with when the analyzer could not answer.
    pub fn blind(goal: &str) -> Self {
        Self {
            description: goal.to_string(),
            confidence: 0.0,
            candidate_actions: Vec::new(),
            goal_satisfied: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ActionOutcome {
    pub success: bool,
    pub error: Option<String>,
    pub duration: Duration,
}

impl ActionOutcome {
    pub fn succeeded(duration: Duration) -> Self {
        Self {
            success: true,
            error: None,
            duration,
        }
    }

    pub fn failed(error: impl Into<String>, duration: Duration) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            duration,
        }
    }
}

/// Interprets the current situation (vision model, page parser...).
#[async_trait]
pub trait SituationAnalyzer: Send + Sync {
    async fn analyze(&self, request: &AnalysisRequest) -> Result<Analysis, ExternalError>;
}

/// Carries out one action in the outside world.
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    async fn execute(&self, action: &ActionSpec) -> Result<ActionOutcome, ExternalError>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecisionConfig {
    /// Minimum confidence for acting rather than re-analyzing.
    pub confidence_threshold: f64,
    /// Minimum prior similarity for a `Proven` replay.
    pub proven_similarity: f32,
    pub search_min_score: f32,
    pub search_limit: usize,
    pub max_iterations: u32,
    /// Executed actions allowed per run; cautious steps are free.
    pub action_budget: u32,
    /// Consecutive failures before a signature is abandoned.
    pub retry_limit: usize,
    /// Consecutive failed `Proven` replays before switching strategy.
    pub max_proven_failures: usize,
    pub analyze_timeout_ms: u64,
    pub act_timeout_ms: u64,
    /// Store every attempt as an `Action` record.
    pub learning_enabled: bool,
}

impl Default for DecisionConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.7,
            proven_similarity: 0.8,
            search_min_score: 0.5,
            search_limit: 5,
            max_iterations: 10,
            action_budget: 10,
            retry_limit: 3,
            max_proven_failures: 2,
            analyze_timeout_ms: 30_000,
            act_timeout_ms: 60_000,
            learning_enabled: true,
        }
    }
}

impl DecisionConfig {
    pub fn validate(&self) -> Result<(), DecisionError> {
        let invalid = |msg: &str| -> Result<(), DecisionError> {
            Err(DecisionError::InvalidConfig(msg.to_string()))
        };
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return invalid("confidence_threshold must be within [0, 1]");
        }
        if !(0.0..=1.0).contains(&self.proven_similarity) {
            return invalid("proven_similarity must be within [0, 1]");
        }
        if self.max_iterations == 0 {
            return invalid("max_iterations must be at least 1");
        }
        if self.action_budget == 0 {
            return invalid("action_budget must be at least 1");
        }
        if self.retry_limit == 0 {
            return invalid("retry_limit must be at least 1");
        }
        Ok(())
    }

    fn analyze_timeout(&self) -> Duration {
        Duration::from_millis(self.analyze_timeout_ms)
    }

    fn act_timeout(&self) -> Duration {
        Duration::from_millis(self.act_timeout_ms)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Results
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    Proven,
    Exploratory,
    Cautious,
}

impl Strategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Strategy::Proven => "proven",
            Strategy::Exploratory => "exploratory",
            Strategy::Cautious => "cautious",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One completed iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEntry {
    pub iteration: u32,
    pub strategy: Strategy,
    /// Signature of the attempted action.
    pub action: String,
    pub success: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionReport {
    pub goal: String,
    /// Completed iterations (actions plus cautious steps).
    pub iterations: u32,
    pub actions_taken: u32,
    pub trace: Vec<TraceEntry>,
}

/// Running totals across every `run` of one engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineStats {
    pub total_decisions: usize,
    pub successful_actions: usize,
    pub failed_actions: usize,
    pub cautious_steps: usize,
    pub by_strategy: BTreeMap<Strategy, usize>,
}

#[derive(Error, Debug)]
pub enum DecisionError {
    #[error("goal `{goal}` unreachable after {iterations} iterations")]
    GoalUnreachable {
        goal: String,
        iterations: u32,
        trace: Vec<TraceEntry>,
    },
    #[error("executor failed on `{action}`: {reason}")]
    ExecutorFailed { action: String, reason: String },
    #[error("invalid decision config: {0}")]
    InvalidConfig(String),
}

// ─────────────────────────────────────────────────────────────────────────────
// Strategy selection
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Proven { action: ActionSpec, similarity: f32 },
    Exploratory { action: ActionSpec },
    Cautious,
}

impl Decision {
    pub fn strategy(&self) -> Strategy {
        match self {
            Decision::Proven { .. } => Strategy::Proven,
            Decision::Exploratory { .. } => Strategy::Exploratory,
            Decision::Cautious => Strategy::Cautious,
        }
    }
}

/// The action a stored record can be replayed as, if any.
pub fn replay_action(record: &MemoryRecord) -> Option<ActionSpec> {
    match &record.kind {
        RecordKind::Action { action, .. } if !action.is_information_gathering() => {
            Some(action.clone())
        }
        RecordKind::Workflow { name, .. } => Some(
            ActionSpec::new(REPLAY_WORKFLOW)
                .with_target(name.clone())
                .with_param("memory_id", record.id.as_str()),
        ),
        _ => None,
    }
}

/// Pick a strategy for one iteration. Pure; no I/O.
pub fn select_strategy(
    analysis: &Analysis,
    priors: &[SearchHit],
    guard: &LoopGuard,
    config: &DecisionConfig,
) -> Decision {
    if analysis.confidence < config.confidence_threshold {
        return Decision::Cautious;
    }

    if guard.proven_allowed() {
        let proven = priors
            .iter()
            .filter(|hit| hit.score >= config.proven_similarity)
            .filter(|hit| hit.record.metadata.success() == Some(true))
            .find_map(|hit| {
                replay_action(&hit.record)
                    .filter(|action| !guard.is_exhausted(&action.signature()))
                    .map(|action| (action, hit.score))
            });
        if let Some((action, similarity)) = proven {
            return Decision::Proven { action, similarity };
        }
    }

    analysis
        .candidate_actions
        .iter()
        .find(|a| !a.is_information_gathering() && !guard.is_exhausted(&a.signature()))
        .map(|action| Decision::Exploratory { action: action.clone() })
        .unwrap_or(Decision::Cautious)
}

// ─────────────────────────────────────────────────────────────────────────────
// DecisionEngine
// ─────────────────────────────────────────────────────────────────────────────

/// How one ACT step ended.
enum Attempt {
    Done { success: bool, error: Option<String> },
    /// Refused by the kernel; never executed.
    Rejected(String),
    Fatal(String),
}

pub struct DecisionEngine {
    config: DecisionConfig,
    memory: Arc<MemoryManager>,
    analyzer: Arc<dyn SituationAnalyzer>,
    executor: Arc<dyn ActionExecutor>,
    gate: Option<Arc<KernelGate>>,
    stats: Mutex<EngineStats>,
}

impl DecisionEngine {
    pub fn new(
        config: DecisionConfig,
        memory: Arc<MemoryManager>,
        analyzer: Arc<dyn SituationAnalyzer>,
        executor: Arc<dyn ActionExecutor>,
    ) -> Self {
        Self {
            config,
            memory,
            analyzer,
            executor,
            gate: None,
            stats: Mutex::new(EngineStats::default()),
        }
    }

    /// Route every action through `gate` before execution.
    pub fn with_gate(mut self, gate: Arc<KernelGate>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn config(&self) -> &DecisionConfig {
        &self.config
    }

    pub fn stats(&self) -> EngineStats {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Drive the loop until `goal` is satisfied or the budgets run out.
    #[instrument(skip(self), fields(max_iterations = self.config.max_iterations))]
    pub async fn run(&self, goal: &str) -> Result<DecisionReport, DecisionError> {
        self.config.validate()?;

        let mut guard = LoopGuard::new(self.config.retry_limit, self.config.max_proven_failures);
        let mut trace: Vec<TraceEntry> = Vec::new();
        let mut actions_taken = 0u32;
        // A cautious step's narrow analysis stands in for the next ANALYZE.
        let mut carried: Option<Analysis> = None;

        for iteration in 1..=self.config.max_iterations {
            let analysis = match carried.take() {
                Some(analysis) => analysis,
                None => self.analyze(goal, AnalysisScope::Full, iteration).await.0,
            };
            if analysis.goal_satisfied {
                return Ok(self.report(goal, actions_taken, trace));
            }

            let priors = self.search_priors(&analysis.description).await;
            let decision = select_strategy(&analysis, &priors, &guard, &self.config);
            let acts = decision.strategy() != Strategy::Cautious;
            if acts && actions_taken >= self.config.action_budget {
                info!(actions_taken, "action budget exhausted");
                break;
            }
            if let Decision::Proven { action, similarity } = &decision {
                debug!(%action, similarity, "replaying proven action");
            }
            self.count(|s| {
                s.total_decisions += 1;
                *s.by_strategy.entry(decision.strategy()).or_insert(0) += 1;
            });

            let (action, strategy) = match decision {
                Decision::Cautious => {
                    let (narrow, error) =
                        self.analyze(goal, AnalysisScope::Narrow, iteration).await;
                    let success = error.is_none();
                    let action = ActionSpec::new(REANALYZE).with_target(goal);
                    self.count(|s| s.cautious_steps += 1);
                    let error_text = error.as_deref();
                    self.learn(goal, &analysis, Strategy::Cautious, &action, success, error_text)
                        .await;
                    trace.push(TraceEntry {
                        iteration,
                        strategy: Strategy::Cautious,
                        action: action.signature(),
                        success,
                        error,
                    });
                    carried = Some(narrow);
                    continue;
                }
                Decision::Proven { action, .. } => (action, Strategy::Proven),
                Decision::Exploratory { action } => (action, Strategy::Exploratory),
            };

            actions_taken += 1;
            let signature = action.signature();
            let (success, error, fatal) = match self.act(&action).await {
                Attempt::Done { success, error } => (success, error, false),
                Attempt::Rejected(reason) => {
                    guard.mark_exhausted(&signature);
                    self.count(|s| s.failed_actions += 1);
                    trace.push(TraceEntry {
                        iteration,
                        strategy,
                        action: signature,
                        success: false,
                        error: Some(reason),
                    });
                    continue;
                }
                Attempt::Fatal(reason) => (false, Some(reason), true),
            };

            if guard.record(&signature, success, strategy == Strategy::Proven) {
                warn!(%signature, failures = guard.failures(&signature), "giving up on action");
            }
            self.count(|s| {
                if success {
                    s.successful_actions += 1;
                } else {
                    s.failed_actions += 1;
                }
            });
            self.learn(goal, &analysis, strategy, &action, success, error.as_deref())
                .await;
            trace.push(TraceEntry {
                iteration,
                strategy,
                action: signature.clone(),
                success,
                error: error.clone(),
            });

            if fatal {
                return Err(DecisionError::ExecutorFailed {
                    action: signature,
                    reason: error.unwrap_or_default(),
                });
            }
        }

        if carried.as_ref().is_some_and(|a| a.goal_satisfied) {
            return Ok(self.report(goal, actions_taken, trace));
        }
        warn!(goal, iterations = trace.len(), "goal unreachable");
        Err(DecisionError::GoalUnreachable {
            goal: goal.to_string(),
            iterations: trace.len() as u32,
            trace,
        })
    }

    // ── Steps ────────────────────────────────────────────────────────────────

    /// Never fails: timeouts and analyzer errors become a blind analysis.
    async fn analyze(
        &self,
        goal: &str,
        scope: AnalysisScope,
        iteration: u32,
    ) -> (Analysis, Option<String>) {
        let request = AnalysisRequest {
            goal: goal.to_string(),
            scope,
            iteration,
        };
        let timeout = self.config.analyze_timeout();
        let result = match tokio::time::timeout(timeout, self.analyzer.analyze(&request)).await {
            Ok(result) => result,
            Err(_) => Err(ExternalError::Timeout(timeout)),
        };
        match result {
            Ok(mut analysis) => {
                analysis.confidence = analysis.confidence.clamp(0.0, 1.0);
                if analysis.confidence.is_nan() {
                    analysis.confidence = 0.0;
                }
                (analysis, None)
            }
            Err(e) => {
                warn!(?scope, error = %e, "analysis failed; treating confidence as 0");
                (Analysis::blind(goal), Some(format!("analysis failed: {e}")))
            }
        }
    }

    async fn search_priors(&self, description: &str) -> Vec<SearchHit> {
        let query = self
            .memory
            .query(description)
            .partitions([Partition::Action, Partition::Workflow])
            .min_score(self.config.search_min_score)
            .limit(self.config.search_limit);
        match self.memory.search(&query).await {
            Ok(results) => results.hits,
            Err(e) => {
                warn!(error = %e, "prior search failed; continuing without memory");
                Vec::new()
            }
        }
    }

    async fn act(&self, action: &ActionSpec) -> Attempt {
        if let Some(gate) = &self.gate {
            match gate.authorize_action(action) {
                Ok(()) => {}
                Err(e @ KernelError::RateLimited { .. }) => {
                    return Attempt::Done {
                        success: false,
                        error: Some(e.to_string()),
                    };
                }
                Err(e) => return Attempt::Rejected(e.to_string()),
            }
        }

        let timeout = self.config.act_timeout();
        let started = Instant::now();
        let result = match tokio::time::timeout(timeout, self.executor.execute(action)).await {
            Ok(result) => result,
            Err(_) => Err(ExternalError::Timeout(timeout)),
        };
        match result {
            Ok(outcome) => {
                debug!(
                    %action,
                    success = outcome.success,
                    took = ?outcome.duration,
                    "action executed"
                );
                Attempt::Done {
                    success: outcome.success,
                    error: outcome.error,
                }
            }
            Err(ExternalError::Fatal(reason)) => Attempt::Fatal(reason),
            Err(e) => {
                debug!(%action, error = %e, elapsed = ?started.elapsed(), "action failed");
                Attempt::Done {
                    success: false,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    async fn learn(
        &self,
        goal: &str,
        analysis: &Analysis,
        strategy: Strategy,
        action: &ActionSpec,
        success: bool,
        error: Option<&str>,
    ) {
        if !self.config.learning_enabled {
            return;
        }
        let outcome = match error {
            None if success => "succeeded".to_string(),
            None => "failed".to_string(),
            Some(e) => format!("failed: {e}"),
        };
        let content = format!("{}: {action} while {}; {outcome}", strategy, analysis.description);
        let metadata = Metadata::new()
            .with(keys::STRATEGY, strategy.as_str())
            .with(keys::CONFIDENCE, analysis.confidence)
            .with(keys::GOAL, goal);
        if let Err(e) = self
            .memory
            .store(content, RecordKind::Action { action: action.clone(), success }, metadata)
            .await
        {
            warn!(error = %e, "failed to store decision outcome");
        }
    }

    // ── Helpers ──────────────────────────────────────────────────────────────

    fn count(&self, update: impl FnOnce(&mut EngineStats)) {
        update(&mut self.stats.lock().unwrap_or_else(PoisonError::into_inner));
    }

    fn report(&self, goal: &str, actions_taken: u32, trace: Vec<TraceEntry>) -> DecisionReport {
        info!(goal, iterations = trace.len(), actions_taken, "goal satisfied");
        DecisionReport {
            goal: goal.to_string(),
            iterations: trace.len() as u32,
            actions_taken,
            trace,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    use mneme_kernel::{AuditLog, SecurityConfig, SecurityValidator};
    use mneme_memory::{HashingEmbedder, MemoryConfig, SearchQuery};

    const DIM: usize = 256;

    // ── Doubles ──────────────────────────────────────────────────────────────

    /// Plays back `script`, then repeats `fallback` forever.
    struct ScriptedAnalyzer {
        script: Mutex<VecDeque<Result<Analysis, ExternalError>>>,
        fallback: Analysis,
        delay: Duration,
        requests: Mutex<Vec<AnalysisRequest>>,
    }

    impl ScriptedAnalyzer {
        fn new(script: Vec<Result<Analysis, ExternalError>>, fallback: Analysis) -> Self {
            Self {
                script: Mutex::new(script.into()),
                fallback,
                delay: Duration::ZERO,
                requests: Mutex::new(Vec::new()),
            }
        }

        fn slow(delay: Duration) -> Self {
            Self {
                delay,
                ..Self::new(vec![], satisfied())
            }
        }

        fn scopes(&self) -> Vec<AnalysisScope> {
            self.requests.lock().unwrap().iter().map(|r| r.scope).collect()
        }
    }

    #[async_trait]
    impl SituationAnalyzer for ScriptedAnalyzer {
        async fn analyze(&self, request: &AnalysisRequest) -> Result<Analysis, ExternalError> {
            self.requests.lock().unwrap().push(request.clone());
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let next = self.script.lock().unwrap().pop_front();
            next.unwrap_or_else(|| Ok(self.fallback.clone()))
        }
    }

    /// Plays back `script`, then answers with `default_success`.
    struct ScriptedExecutor {
        script: Mutex<VecDeque<Result<ActionOutcome, ExternalError>>>,
        default_success: bool,
        executed: Mutex<Vec<ActionSpec>>,
    }

    impl ScriptedExecutor {
        fn new(script: Vec<Result<ActionOutcome, ExternalError>>, default_success: bool) -> Self {
            Self {
                script: Mutex::new(script.into()),
                default_success,
                executed: Mutex::new(Vec::new()),
            }
        }

        fn executed(&self) -> Vec<ActionSpec> {
            self.executed.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ActionExecutor for ScriptedExecutor {
        async fn execute(&self, action: &ActionSpec) -> Result<ActionOutcome, ExternalError> {
            self.executed.lock().unwrap().push(action.clone());
            let next = self.script.lock().unwrap().pop_front();
            next.unwrap_or_else(|| {
                Ok(if self.default_success {
                    ActionOutcome::succeeded(Duration::from_millis(5))
                } else {
                    ActionOutcome::failed("element not found", Duration::from_millis(5))
                })
            })
        }
    }

    fn analysis(description: &str, confidence: f64, candidates: Vec<ActionSpec>) -> Analysis {
        Analysis {
            description: description.to_string(),
            confidence,
            candidate_actions: candidates,
            goal_satisfied: false,
        }
    }

    fn satisfied() -> Analysis {
        Analysis {
            goal_satisfied: true,
            ..analysis("dashboard visible", 1.0, vec![])
        }
    }

    fn memory() -> Arc<MemoryManager> {
        let embedder = Arc::new(HashingEmbedder::new(DIM));
        Arc::new(MemoryManager::open(MemoryConfig::in_memory(DIM), embedder).unwrap())
    }

    fn engine(
        config: DecisionConfig,
        memory: Arc<MemoryManager>,
        analyzer: Arc<ScriptedAnalyzer>,
        executor: Arc<ScriptedExecutor>,
    ) -> DecisionEngine {
        DecisionEngine::new(config, memory, analyzer, executor)
    }

    fn pick(analysis: &Analysis, priors: &[SearchHit], guard: &LoopGuard) -> Decision {
        select_strategy(analysis, priors, guard, &DecisionConfig::default())
    }

    fn hit(kind: RecordKind, success: bool, score: f32) -> SearchHit {
        let metadata = Metadata::new().with(keys::SUCCESS, success);
        SearchHit {
            record: MemoryRecord::new(kind, "prior", vec![0.0; 4], metadata),
            score,
        }
    }

    fn login() -> ActionSpec {
        ActionSpec::new("click").with_target("#login")
    }

    fn email() -> ActionSpec {
        ActionSpec::new("type").with_target("#email").with_param("text", "a@b.c")
    }

    // ── select_strategy ──────────────────────────────────────────────────────

    #[test]
    fn low_confidence_is_cautious() {
        let guard = LoopGuard::new(3, 2);
        let a = analysis("login page", 0.69, vec![login()]);
        let priors = [hit(RecordKind::Action { action: login(), success: true }, true, 0.99)];
        assert_eq!(pick(&a, &priors, &guard), Decision::Cautious);
    }

    #[test]
    fn successful_similar_prior_is_proven() {
        let guard = LoopGuard::new(3, 2);
        let a = analysis("login page", 0.9, vec![email()]);
        let priors = [hit(RecordKind::Action { action: login(), success: true }, true, 0.85)];
        assert_eq!(
            pick(&a, &priors, &guard),
            Decision::Proven { action: login(), similarity: 0.85 }
        );
    }

    #[test]
    fn weak_or_failed_priors_fall_back_to_candidates() {
        let guard = LoopGuard::new(3, 2);
        let a = analysis("login page", 0.9, vec![email()]);
        let priors = [
            hit(RecordKind::Action { action: login(), success: true }, true, 0.79),
            hit(RecordKind::Action { action: login(), success: false }, false, 0.99),
        ];
        assert_eq!(
            pick(&a, &priors, &guard),
            Decision::Exploratory { action: email() }
        );
    }

    #[test]
    fn workflow_prior_replays_by_name() {
        let guard = LoopGuard::new(3, 2);
        let kind = RecordKind::Workflow {
            name: "login_flow".into(),
            steps: vec![],
            success: true,
            duration_secs: 3.0,
        };
        let prior = hit(kind, true, 0.9);
        let id = prior.record.id.clone();
        let a = analysis("login page", 0.9, vec![]);
        let Decision::Proven { action, .. } = pick(&a, &[prior], &guard) else {
            panic!("expected proven");
        };
        assert_eq!(action.action_type, REPLAY_WORKFLOW);
        assert_eq!(action.target.as_deref(), Some("login_flow"));
        assert_eq!(action.params["memory_id"], id.as_str());
    }

    #[test]
    fn reanalyze_records_are_never_replayed() {
        let guard = LoopGuard::new(3, 2);
        let reanalyze = ActionSpec::new(REANALYZE).with_target("log in");
        let a = analysis("login page", 0.9, vec![]);
        let priors = [hit(RecordKind::Action { action: reanalyze, success: true }, true, 1.0)];
        assert_eq!(pick(&a, &priors, &guard), Decision::Cautious);
    }

    #[test]
    fn proven_streak_switches_to_exploratory() {
        let mut guard = LoopGuard::new(5, 2);
        guard.record(&login().signature(), false, true);
        guard.record(&login().signature(), false, true);
        let a = analysis("login page", 0.9, vec![email()]);
        let priors = [hit(RecordKind::Action { action: login(), success: true }, true, 0.95)];
        assert_eq!(
            pick(&a, &priors, &guard),
            Decision::Exploratory { action: email() }
        );
    }

    #[test]
    fn exhausted_candidates_are_skipped_then_cautious() {
        let mut guard = LoopGuard::new(1, 2);
        let submit = ActionSpec::new("click").with_target("#submit");
        let a = analysis("form", 0.9, vec![email(), submit.clone()]);
        guard.record(&email().signature(), false, false);
        assert_eq!(
            pick(&a, &[], &guard),
            Decision::Exploratory { action: submit.clone() }
        );
        guard.record(&submit.signature(), false, false);
        assert_eq!(pick(&a, &[], &guard), Decision::Cautious);
    }

    // ── run ──────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn exploratory_success_then_goal_satisfied() {
        let memory = memory();
        let analyzer = Arc::new(ScriptedAnalyzer::new(
            vec![Ok(analysis("login page with email field", 0.9, vec![email()]))],
            satisfied(),
        ));
        let executor = Arc::new(ScriptedExecutor::new(vec![], true));
        let engine = engine(
            DecisionConfig::default(),
            memory.clone(),
            analyzer.clone(),
            executor.clone(),
        );

        let report = engine.run("log in").await.unwrap();
        assert_eq!(report.iterations, 1);
        assert_eq!(report.actions_taken, 1);
        assert_eq!(report.trace[0].strategy, Strategy::Exploratory);
        assert!(report.trace[0].success);
        assert_eq!(executor.executed(), vec![email()]);

        let learned = memory
            .search(&SearchQuery::new("type email").partition(Partition::Action))
            .await
            .unwrap();
        assert_eq!(learned.total_count, 1);
        let record = &learned.hits[0].record;
        assert_eq!(record.metadata.get(keys::STRATEGY).unwrap(), "exploratory");
        assert_eq!(record.metadata.get(keys::GOAL).unwrap(), "log in");
        assert_eq!(record.success(), Some(true));
    }

    #[tokio::test]
    async fn cautious_step_reanalyzes_narrowly_without_spending_budget() {
        let memory = memory();
        let analyzer = Arc::new(ScriptedAnalyzer::new(
            vec![
                Ok(analysis("blurry page", 0.3, vec![email()])),
                Ok(analysis("login page with email field", 0.9, vec![email()])),
            ],
            satisfied(),
        ));
        let executor = Arc::new(ScriptedExecutor::new(vec![], true));
        let config = DecisionConfig {
            action_budget: 1,
            ..DecisionConfig::default()
        };
        let engine = engine(config, memory.clone(), analyzer.clone(), executor.clone());

        let report = engine.run("log in").await.unwrap();
        let strategies: Vec<Strategy> = report.trace.iter().map(|t| t.strategy).collect();
        assert_eq!(strategies, vec![Strategy::Cautious, Strategy::Exploratory]);
        assert_eq!(report.actions_taken, 1);
        assert_eq!(report.trace[0].action, "reanalyze:log in");
        assert_eq!(
            analyzer.scopes(),
            vec![AnalysisScope::Full, AnalysisScope::Narrow, AnalysisScope::Full]
        );
        assert_eq!(memory.stats().await.unwrap().counts_by_kind[&Partition::Action], 2);
    }

    #[tokio::test]
    async fn proven_replays_successful_prior() {
        let memory = memory();
        memory
            .store_action("login page sign in button", login(), true, Metadata::new())
            .await
            .unwrap();
        let analyzer = Arc::new(ScriptedAnalyzer::new(
            vec![Ok(analysis("login page sign in button", 0.9, vec![email()]))],
            satisfied(),
        ));
        let executor = Arc::new(ScriptedExecutor::new(vec![], true));
        let engine = engine(DecisionConfig::default(), memory, analyzer, executor.clone());

        let report = engine.run("log in").await.unwrap();
        assert_eq!(report.trace[0].strategy, Strategy::Proven);
        assert_eq!(executor.executed(), vec![login()]);
    }

    #[tokio::test]
    async fn repeated_proven_failures_switch_strategy_then_give_up() {
        let memory = memory();
        memory
            .store_action("login page sign in button", login(), true, Metadata::new())
            .await
            .unwrap();
        let analyzer = Arc::new(ScriptedAnalyzer::new(
            vec![],
            analysis("login page sign in button", 0.9, vec![email()]),
        ));
        let executor = Arc::new(ScriptedExecutor::new(vec![], false));
        let config = DecisionConfig {
            max_iterations: 4,
            ..DecisionConfig::default()
        };
        let engine = engine(config, memory, analyzer, executor.clone());

        let result = engine.run("log in").await;
        let Err(DecisionError::GoalUnreachable { iterations, trace, .. }) = result else {
            panic!("expected GoalUnreachable");
        };
        assert_eq!(iterations, 4);
        let strategies: Vec<Strategy> = trace.iter().map(|t| t.strategy).collect();
        assert_eq!(
            strategies,
            vec![Strategy::Proven, Strategy::Proven, Strategy::Exploratory, Strategy::Exploratory]
        );
        assert!(trace.iter().all(|t| !t.success));
        assert_eq!(executor.executed().len(), 4);
    }

    #[tokio::test]
    async fn action_budget_ends_the_run() {
        let form = analysis("form", 0.9, vec![email()]);
        let analyzer = Arc::new(ScriptedAnalyzer::new(vec![], form));
        let executor = Arc::new(ScriptedExecutor::new(vec![], false));
        let config = DecisionConfig {
            action_budget: 2,
            retry_limit: 10,
            ..DecisionConfig::default()
        };
        let engine = engine(config, memory(), analyzer, executor.clone());

        let err = engine.run("submit").await.unwrap_err();
        assert!(matches!(err, DecisionError::GoalUnreachable { iterations: 2, .. }));
        assert_eq!(executor.executed().len(), 2);
    }

    #[tokio::test]
    async fn analyzer_timeout_routes_to_cautious() {
        let analyzer = Arc::new(ScriptedAnalyzer::slow(Duration::from_secs(5)));
        let executor = Arc::new(ScriptedExecutor::new(vec![], true));
        let config = DecisionConfig {
            analyze_timeout_ms: 20,
            max_iterations: 2,
            ..DecisionConfig::default()
        };
        let engine = engine(config, memory(), analyzer.clone(), executor.clone());

        let Err(DecisionError::GoalUnreachable { trace, .. }) = engine.run("log in").await else {
            panic!("expected GoalUnreachable");
        };
        assert!(trace.iter().all(|t| t.strategy == Strategy::Cautious && !t.success));
        assert!(trace[0].error.as_deref().unwrap().contains("timed out"));
        assert!(executor.executed().is_empty());
        assert_eq!(analyzer.scopes().len(), 3);
    }

    #[tokio::test]
    async fn fatal_executor_error_is_learned_then_surfaced() {
        let memory = memory();
        let form = analysis("form", 0.9, vec![email()]);
        let analyzer = Arc::new(ScriptedAnalyzer::new(vec![], form));
        let executor = Arc::new(ScriptedExecutor::new(
            vec![Err(ExternalError::Fatal("browser crashed".into()))],
            true,
        ));
        let engine = engine(DecisionConfig::default(), memory.clone(), analyzer, executor);

        let err = engine.run("log in").await.unwrap_err();
        assert!(matches!(
            &err,
            DecisionError::ExecutorFailed { action, reason }
                if action == "type:#email" && reason == "browser crashed"
        ));
        assert_eq!(memory.stats().await.unwrap().counts_by_kind[&Partition::Action], 1);
    }

    #[tokio::test]
    async fn retryable_errors_count_as_failures() {
        let analyzer = Arc::new(ScriptedAnalyzer::new(
            vec![Ok(analysis("form", 0.9, vec![email()]))],
            satisfied(),
        ));
        let executor = Arc::new(ScriptedExecutor::new(
            vec![Err(ExternalError::Retryable("stale element".into()))],
            true,
        ));
        let engine = engine(DecisionConfig::default(), memory(), analyzer, executor);

        let report = engine.run("log in").await.unwrap();
        assert!(!report.trace[0].success);
        assert_eq!(report.trace[0].error.as_deref(), Some("stale element"));
        assert_eq!(engine.stats().failed_actions, 1);
    }

    #[tokio::test]
    async fn kernel_rejection_exhausts_signature_without_executing() {
        let memory = memory();
        let shell = ActionSpec::new("shell").with_param("cmd", "rm -rf /");
        let analyzer = Arc::new(ScriptedAnalyzer::new(
            vec![
                Ok(analysis("terminal open", 0.9, vec![shell.clone(), email()])),
                Ok(analysis("terminal open", 0.9, vec![shell, email()])),
            ],
            satisfied(),
        ));
        let executor = Arc::new(ScriptedExecutor::new(vec![], true));
        let audit = Arc::new(AuditLog::default());
        let validator = SecurityValidator::with_defaults(SecurityConfig::default()).unwrap();
        let gate = Arc::new(KernelGate::new(validator, audit.clone()));
        let engine = engine(DecisionConfig::default(), memory.clone(), analyzer, executor.clone())
            .with_gate(gate);

        let report = engine.run("clean up").await.unwrap();
        assert_eq!(report.trace.len(), 2);
        assert!(!report.trace[0].success);
        assert_eq!(report.trace[0].action, "shell:");
        assert_eq!(executor.executed(), vec![email()]);
        assert_eq!(audit.security_summary().security_events, 1);
        // Only the executed action is learned.
        assert_eq!(memory.stats().await.unwrap().counts_by_kind[&Partition::Action], 1);
    }

    #[tokio::test]
    async fn disabled_memory_degrades_to_exploratory() {
        let analyzer = Arc::new(ScriptedAnalyzer::new(
            vec![Ok(analysis("login page", 0.9, vec![login()]))],
            satisfied(),
        ));
        let executor = Arc::new(ScriptedExecutor::new(vec![], true));
        let engine = engine(
            DecisionConfig::default(),
            Arc::new(MemoryManager::disabled()),
            analyzer,
            executor,
        );

        let report = engine.run("log in").await.unwrap();
        assert_eq!(report.trace[0].strategy, Strategy::Exploratory);
    }

    #[tokio::test]
    async fn goal_already_satisfied_takes_no_action() {
        let analyzer = Arc::new(ScriptedAnalyzer::new(vec![], satisfied()));
        let executor = Arc::new(ScriptedExecutor::new(vec![], true));
        let engine = engine(DecisionConfig::default(), memory(), analyzer, executor.clone());

        let report = engine.run("log in").await.unwrap();
        assert_eq!(report.iterations, 0);
        assert!(executor.executed().is_empty());
    }

    #[tokio::test]
    async fn learning_can_be_disabled() {
        let memory = memory();
        let analyzer = Arc::new(ScriptedAnalyzer::new(
            vec![Ok(analysis("form", 0.9, vec![email()]))],
            satisfied(),
        ));
        let executor = Arc::new(ScriptedExecutor::new(vec![], true));
        let config = DecisionConfig {
            learning_enabled: false,
            ..DecisionConfig::default()
        };
        engine(config, memory.clone(), analyzer, executor).run("log in").await.unwrap();
        assert_eq!(memory.stats().await.unwrap().total, 0);
    }

    #[tokio::test]
    async fn stats_accumulate_across_runs() {
        let analyzer = Arc::new(ScriptedAnalyzer::new(
            vec![
                Ok(analysis("blurry", 0.1, vec![])),
                Ok(analysis("form", 0.9, vec![email()])),
            ],
            satisfied(),
        ));
        let executor = Arc::new(ScriptedExecutor::new(vec![], true));
        let engine = engine(DecisionConfig::default(), memory(), analyzer, executor);

        engine.run("log in").await.unwrap();
        engine.run("log in").await.unwrap();
        let stats = engine.stats();
        assert_eq!(stats.total_decisions, 2);
        assert_eq!(stats.cautious_steps, 1);
        assert_eq!(stats.successful_actions, 1);
        assert_eq!(stats.by_strategy[&Strategy::Exploratory], 1);
    }

    #[tokio::test]
    async fn invalid_config_is_rejected_before_running() {
        let analyzer = Arc::new(ScriptedAnalyzer::new(vec![], satisfied()));
        let executor = Arc::new(ScriptedExecutor::new(vec![], true));
        let config = DecisionConfig {
            max_iterations: 0,
            ..DecisionConfig::default()
        };
        let err = engine(config, memory(), analyzer.clone(), executor).run("x").await.unwrap_err();
        assert!(matches!(err, DecisionError::InvalidConfig(_)));
        assert!(analyzer.scopes().is_empty());
    }
}
