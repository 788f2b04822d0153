//! Retention policy for the external compaction caller.
//!
//! The engine has no timer of its own; whoever drives compaction (the
//! `statebase compact` command, or a periodic job around it) asks the policy
//! for a target and hands it to [`Backend::compact`](super::Backend::compact).

use crate::core::config::CompactionConfig;
use serde::{Deserialize, Serialize};

/// How much history to keep when compacting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompactionPolicy {
    /// Most recent revisions kept.
    pub retain_revisions: i64,
}

impl Default for CompactionPolicy {
    fn default() -> Self {
        Self {
            retain_revisions: 1000,
        }
    }
}

impl From<&CompactionConfig> for CompactionPolicy {
    fn from(config: &CompactionConfig) -> Self {
        Self {
            retain_revisions: config.retain_revisions,
        }
    }
}

impl CompactionPolicy {
    /// Create a policy keeping `retain_revisions` revisions.
    pub fn with_retention(retain_revisions: i64) -> Self {
        Self { retain_revisions }
    }

    /// Propose a compaction target, or `None` when it would not advance the
    /// watermark.
    pub fn propose_target(&self, current_revision: i64, watermark: i64) -> Option<i64> {
        let target = current_revision.saturating_sub(self.retain_revisions.max(0));
        // Only propose if it advances the watermark
        (target > watermark).then_some(target)
    }

    /// Clamp an explicit target so it never eats into the retained window.
    pub fn clamp(&self, target: i64, current_revision: i64) -> i64 {
        let max_target = current_revision.saturating_sub(self.retain_revisions.max(0));
        target.min(max_target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_propose_target() {
        let policy = CompactionPolicy::with_retention(100);
        assert_eq!(policy.propose_target(1000, 0), Some(900));
        assert_eq!(policy.propose_target(1000, 900), None);
        assert_eq!(policy.propose_target(50, 0), None);
    }

    #[test]
    fn test_zero_retention_compacts_everything() {
        let policy = CompactionPolicy::with_retention(0);
        assert_eq!(policy.propose_target(42, 10), Some(42));
    }

    #[test]
    fn test_clamp() {
        let policy = CompactionPolicy::with_retention(10);
        assert_eq!(policy.clamp(95, 100), 90);
        assert_eq!(policy.clamp(20, 100), 20);
    }
}
