//! [`ActionRateLimiter`] – per-action-type token buckets.
//!
//! Every action type gets its own GCRA bucket (`governor` keyed limiter):
//! `per_minute` sustained, `burst` back-to-back. Individual action types can
//! be given their own limits through [`RateLimitConfig::overrides`].

use std::collections::{BTreeMap, HashMap};
use std::num::NonZeroU32;

use governor::{DefaultDirectRateLimiter, DefaultKeyedRateLimiter, Quota, RateLimiter};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::KernelError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionLimit {
    pub per_minute: u32,
    pub burst: u32,
}

impl ActionLimit {
    fn quota(self) -> Quota {
        let rate = NonZeroU32::new(self.per_minute).unwrap_or(NonZeroU32::MIN);
        let burst = NonZeroU32::new(self.burst).unwrap_or(NonZeroU32::MIN);
        Quota::per_minute(rate).allow_burst(burst)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub per_minute: u32,
    pub burst: u32,
    pub overrides: BTreeMap<String, ActionLimit>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            per_minute: 60,
            burst: 10,
            overrides: BTreeMap::new(),
        }
    }
}

pub struct ActionRateLimiter {
    default: DefaultKeyedRateLimiter<String>,
    overrides: HashMap<String, DefaultDirectRateLimiter>,
}

impl ActionRateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        let default = ActionLimit {
            per_minute: config.per_minute,
            burst: config.burst,
        };
        Self {
            default: RateLimiter::keyed(default.quota()),
            overrides: config
                .overrides
                .iter()
                .map(|(action, limit)| (action.clone(), RateLimiter::direct(limit.quota())))
                .collect(),
        }
    }

    /// Take one token for `action_type`.
    pub fn check(&self, action_type: &str) -> Result<(), KernelError> {
        let allowed = match self.overrides.get(action_type) {
            Some(limiter) => limiter.check().is_ok(),
            None => self.default.check_key(&action_type.to_string()).is_ok(),
        };
        if allowed {
            Ok(())
        } else {
            debug!(action_type, "rate limit hit");
            Err(KernelError::RateLimited {
                action: action_type.to_string(),
            })
        }
    }
}

impl Default for ActionRateLimiter {
    fn default() -> Self {
        Self::new(&RateLimitConfig::default())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn burst_then_limited() {
        let limiter = ActionRateLimiter::default();
        for _ in 0..10 {
            assert!(limiter.check("click").is_ok());
        }
        assert!(matches!(
            limiter.check("click"),
            Err(KernelError::RateLimited { action }) if action == "click"
        ));
    }

    #[test]
    fn buckets_are_per_action_type() {
        let limiter = ActionRateLimiter::new(&RateLimitConfig {
            burst: 1,
            ..RateLimitConfig::default()
        });
        assert!(limiter.check("click").is_ok());
        assert!(limiter.check("click").is_err());
        assert!(limiter.check("type").is_ok());
    }

    #[test]
    fn overrides_take_precedence() {
        let mut config = RateLimitConfig::default();
        config.overrides.insert(
            "navigate".into(),
            ActionLimit {
                per_minute: 1,
                burst: 2,
            },
        );
        let limiter = ActionRateLimiter::new(&config);
        assert!(limiter.check("navigate").is_ok());
        assert!(limiter.check("navigate").is_ok());
        assert!(limiter.check("navigate").is_err());
    }
}
