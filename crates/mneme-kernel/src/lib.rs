//! `mneme-kernel` – Security & Enforcement
//!
//! It does not think; it enforces rules on what enters memory and what the
//! decision loop is allowed to do.
//!
//! # Modules
//!
//! - [`validator`] – [`SecurityValidator`][validator::SecurityValidator]:
//!   a rule engine that checks every input against the rules registered for
//!   its [`InputKind`][mneme_types::InputKind] (commands, paths, URLs, SQL,
//!   HTML, general text).
//! - [`audit`] – [`AuditLog`][audit::AuditLog]: bounded in-memory ring of
//!   security events with an optional JSON-lines file sink.
//! - [`rate_limiter`] – [`ActionRateLimiter`][rate_limiter::ActionRateLimiter]:
//!   per-action-type token buckets.
//! - [`kernel_gate`] – [`KernelGate`][kernel_gate::KernelGate]: the single
//!   interception point combining validation, rate limiting and auditing.

pub mod audit;
pub mod kernel_gate;
pub mod rate_limiter;
pub mod validator;

pub use audit::{AuditCategory, AuditEntry, AuditLevel, AuditLog, SecuritySummary};
pub use kernel_gate::KernelGate;
pub use rate_limiter::{ActionLimit, ActionRateLimiter, RateLimitConfig};
pub use validator::{Rule, SecurityConfig, SecurityValidator};

use mneme_types::InputKind;
use thiserror::Error;

/// Errors raised by the kernel's checks.
#[derive(Error, Debug)]
pub enum KernelError {
    /// Input or action failed validation. Must not be retried unmodified.
    #[error("{kind} input rejected: {reason}")]
    Rejected { kind: InputKind, reason: String },
    #[error("rate limit exceeded for action `{action}`")]
    RateLimited { action: String },
    #[error("invalid rule pattern: {0}")]
    InvalidPattern(String),
    #[error("audit sink I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl KernelError {
    /// Prefix a rejection reason with where the input came from.
    pub(crate) fn in_context(self, context: &str) -> Self {
        match self {
            KernelError::Rejected { kind, reason } => KernelError::Rejected {
                kind,
                reason: format!("{context}: {reason}"),
            },
            other => other,
        }
    }
}
