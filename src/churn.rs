//! Contact responsiveness tracking.
//!
//! The lookup engine reports every request outcome here. Consecutive failures
//! past the threshold demote a contact to the head of its bucket, which makes
//! it the first one pinged (and replaced if still dead) when a newcomer shows
//! up. Nothing is evicted directly from this module.

use std::num::NonZeroUsize;
use std::time::Duration;

use lru::LruCache;

use crate::identity::NodeId;
use crate::routing::{RoutingTable, random_id_for_bucket};

/// Upper bound on contacts with a tracked failure streak.
const MAX_TRACKED_CONTACTS: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChurnVerdict {
    /// Failing, but still below the demotion threshold.
    Suspect(u32),
    Demote,
}

pub struct ChurnMonitor {
    failures: LruCache<NodeId, u32>,
    threshold: u32,
}

impl ChurnMonitor {
    pub fn new(threshold: u32) -> Self {
        Self {
            failures: LruCache::new(
                NonZeroUsize::new(MAX_TRACKED_CONTACTS).expect("MAX_TRACKED_CONTACTS must be non-zero"),
            ),
            threshold: threshold.max(1),
        }
    }

    pub fn record_success(&mut self, id: &NodeId) {
        self.failures.pop(id);
    }

    pub fn record_failure(&mut self, id: &NodeId) -> ChurnVerdict {
        let count = self.failures.get_or_insert_mut(*id, || 0);
        *count = count.saturating_add(1);
        if *count >= self.threshold {
            ChurnVerdict::Demote
        } else {
            ChurnVerdict::Suspect(*count)
        }
    }

    /// Contacts currently on a failure streak.
    pub fn failing_count(&self) -> usize {
        self.failures.len()
    }
}

/// One random lookup target per bucket that has gone quiet for `threshold`.
pub fn refresh_targets(routing: &RoutingTable, threshold: Duration) -> Vec<(usize, NodeId)> {
    let self_id = routing.self_id();
    routing
        .stale_bucket_indices(threshold)
        .into_iter()
        .map(|idx| (idx, random_id_for_bucket(&self_id, idx)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Contact;

    #[test]
    fn failure_streak_demotes_at_threshold() {
        let mut monitor = ChurnMonitor::new(3);
        let id = NodeId::random();
        assert_eq!(monitor.record_failure(&id), ChurnVerdict::Suspect(1));
        assert_eq!(monitor.record_failure(&id), ChurnVerdict::Suspect(2));
        assert_eq!(monitor.record_failure(&id), ChurnVerdict::Demote);
        assert_eq!(monitor.failing_count(), 1);
    }

    #[test]
    fn success_resets_streak() {
        let mut monitor = ChurnMonitor::new(2);
        let id = NodeId::random();
        monitor.record_failure(&id);
        monitor.record_success(&id);
        assert_eq!(monitor.failing_count(), 0);
        assert_eq!(monitor.record_failure(&id), ChurnVerdict::Suspect(1));
    }

    #[test]
    fn stale_buckets_yield_targets_in_range() {
        let me = NodeId::random();
        let mut table = RoutingTable::new(me, 20);
        let peer = random_id_for_bucket(&me, 4);
        table.observe(Contact::new(peer, "sim://peer"));
        std::thread::sleep(Duration::from_millis(2));

        let targets = refresh_targets(&table, Duration::ZERO);
        assert_eq!(targets.len(), 1);
        let (idx, target) = targets[0];
        assert_eq!(idx, 4);
        assert_eq!(crate::identity::shared_prefix_len(&me, &target), 4);

        assert!(refresh_targets(&table, Duration::from_secs(3600)).is_empty());
    }
}
