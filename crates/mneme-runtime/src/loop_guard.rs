//! [`LoopGuard`] – repeated-failure detector for the decision loop.
//!
//! Detects when the engine keeps attempting the same failing action and
//! tells [`select_strategy`][crate::decision::select_strategy] to move on to
//! something else before the loop burns its whole budget on one signature.
//!
//! # Algorithm
//!
//! The guard keeps a consecutive-failure streak per action signature
//! (`action_type:target`). A success resets that signature's streak. Once a
//! streak reaches `retry_limit` the signature is *exhausted* and is never
//! chosen again for the rest of the run. A signature rejected by the kernel
//! is exhausted immediately, since retrying it unmodified cannot succeed.
//!
//! Independently, the guard counts consecutive failed `Proven` replays;
//! after `max_proven_failures` of them in a row, `Proven` is off the table
//! until some action succeeds.
//!
//! # Example
//!
//! ```rust
//! use mneme_runtime::loop_guard::LoopGuard;
//!
//! let mut guard = LoopGuard::new(2, 1);
//!
//! assert!(!guard.record("click:#login", false, true));
//! assert!(!guard.proven_allowed()); // one failed replay is the limit
//! assert!(guard.record("click:#login", false, false)); // second failure → exhausted
//! assert!(guard.is_exhausted("click:#login"));
//! assert_eq!(guard.failures("click:#login"), 2);
//! ```

use std::collections::{HashMap, HashSet};

use tracing::debug;

// ─────────────────────────────────────────────────────────────────────────────
// LoopGuard
// ─────────────────────────────────────────────────────────────────────────────

/// Tracks failure streaks for one decision run.
#[derive(Debug, Clone)]
pub struct LoopGuard {
    /// Consecutive failures that exhaust a signature.
    retry_limit: usize,
    /// Consecutive failed `Proven` replays that disable `Proven`.
    max_proven_failures: usize,
    streaks: HashMap<String, usize>,
    exhausted: HashSet<String>,
    proven_streak: usize,
}

impl LoopGuard {
    /// Create a new guard.
    ///
    /// A `retry_limit` of 1 exhausts a signature on its first failure.
    pub fn new(retry_limit: usize, max_proven_failures: usize) -> Self {
        Self {
            retry_limit: retry_limit.max(1),
            max_proven_failures,
            streaks: HashMap::new(),
            exhausted: HashSet::new(),
            proven_streak: 0,
        }
    }

    /// Record the outcome of one attempt of `signature`.
    ///
    /// Returns `true` when this attempt exhausted the signature.
    pub fn record(&mut self, signature: &str, success: bool, proven: bool) -> bool {
        if success {
            self.streaks.remove(signature);
            self.proven_streak = 0;
            return false;
        }

        if proven {
            self.proven_streak += 1;
        }
        let streak = self.streaks.entry(signature.to_string()).or_insert(0);
        *streak += 1;
        if *streak >= self.retry_limit && self.exhausted.insert(signature.to_string()) {
            debug!(signature, failures = *streak, "signature exhausted");
            return true;
        }
        false
    }

    /// Never pick `signature` again in this run.
    pub fn mark_exhausted(&mut self, signature: &str) {
        self.exhausted.insert(signature.to_string());
    }

    pub fn is_exhausted(&self, signature: &str) -> bool {
        self.exhausted.contains(signature)
    }

    /// Consecutive failures recorded for `signature`.
    pub fn failures(&self, signature: &str) -> usize {
        self.streaks.get(signature).copied().unwrap_or(0)
    }

    /// `false` once `max_proven_failures` replays in a row have failed.
    pub fn proven_allowed(&self) -> bool {
        self.proven_streak < self.max_proven_failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_resets_the_streak() {
        let mut guard = LoopGuard::new(3, 2);
        guard.record("click:#go", false, false);
        guard.record("click:#go", false, false);
        assert_eq!(guard.failures("click:#go"), 2);
        guard.record("click:#go", true, false);
        assert_eq!(guard.failures("click:#go"), 0);
        assert!(!guard.record("click:#go", false, false));
    }

    #[test]
    fn exhausts_at_retry_limit() {
        let mut guard = LoopGuard::new(3, 2);
        assert!(!guard.record("type:#email", false, false));
        assert!(!guard.record("type:#email", false, false));
        assert!(guard.record("type:#email", false, false));
        assert!(guard.is_exhausted("type:#email"));
        // Only reported once.
        assert!(!guard.record("type:#email", false, false));
    }

    #[test]
    fn signatures_are_tracked_independently() {
        let mut guard = LoopGuard::new(2, 2);
        guard.record("a:", false, false);
        guard.record("b:", false, false);
        assert!(!guard.is_exhausted("a:"));
        assert!(guard.record("a:", false, false));
        assert!(!guard.is_exhausted("b:"));
    }

    #[test]
    fn proven_streak_blocks_proven() {
        let mut guard = LoopGuard::new(5, 2);
        assert!(guard.proven_allowed());
        guard.record("click:#login", false, true);
        assert!(guard.proven_allowed());
        guard.record("click:#login", false, true);
        assert!(!guard.proven_allowed());
        // An exploratory failure does not lift the block.
        guard.record("type:#email", false, false);
        assert!(!guard.proven_allowed());
        guard.record("type:#email", true, false);
        assert!(guard.proven_allowed());
    }

    #[test]
    fn mark_exhausted_is_immediate() {
        let mut guard = LoopGuard::new(3, 2);
        guard.mark_exhausted("shell:");
        assert!(guard.is_exhausted("shell:"));
        assert_eq!(guard.failures("shell:"), 0);
    }

    #[test]
    fn failures_survive_exhaustion() {
        let mut guard = LoopGuard::new(2, 5);
        guard.record("click:#save", false, false);
        assert!(guard.record("click:#save", false, false));
        assert_eq!(guard.failures("click:#save"), 2);
        // A later success still clears the streak but not the exhaustion.
        guard.record("click:#save", true, false);
        assert_eq!(guard.failures("click:#save"), 0);
        assert!(guard.is_exhausted("click:#save"));
    }

    #[test]
    fn retry_limit_zero_behaves_as_one() {
        let mut guard = LoopGuard::new(0, 1);
        assert!(guard.record("any:", false, false));
    }
}
