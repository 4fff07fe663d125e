//! `mneme-runtime` – The Decision Loop
//!
//! The execution engine that turns a goal into actions, consulting memory
//! before acting and feeding every outcome back into it.
//!
//! # Modules
//!
//! - [`decision`] – [`DecisionEngine`][decision::DecisionEngine]: the
//!   ANALYZE → SEARCH → DECIDE → ACT → LEARN loop, choosing between
//!   `Proven`, `Exploratory` and `Cautious` strategies.
//! - [`loop_guard`] – [`LoopGuard`][loop_guard::LoopGuard]: per-signature
//!   failure streaks that force a strategy switch instead of retrying the
//!   same failing action forever.
//! - [`embedder`] – [`OllamaEmbedder`][embedder::OllamaEmbedder]: HTTP
//!   embedding client for a local [Ollama](https://ollama.com) server.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]: global
//!   `tracing` subscriber with optional OTLP span export.
//!
//! # Kernel gating
//!
//! When a [`KernelGate`] is attached with
//! [`DecisionEngine::with_gate`][decision::DecisionEngine::with_gate], every
//! action is validated and rate-limited before it reaches the executor. The
//! gate is re-exported here so callers need no direct `mneme-kernel`
//! dependency.

pub mod decision;
pub mod embedder;
pub mod loop_guard;
pub mod telemetry;

pub use decision::{
    ActionExecutor, ActionOutcome, Analysis, AnalysisRequest, AnalysisScope, DecisionConfig,
    DecisionEngine, DecisionError, DecisionReport, EngineStats, ExternalError, SituationAnalyzer,
    Strategy, TraceEntry,
};
pub use embedder::{EmbedderError, OllamaEmbedder};
pub use loop_guard::LoopGuard;
pub use telemetry::{TracerProviderGuard, init_tracing};

pub use mneme_kernel::KernelGate;
