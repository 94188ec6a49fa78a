//! Readiness tracking for mirrored subsystems.
//!
//! How a subsystem counts as synchronized depends on what the remote
//! advertises. Without the `synced_canaries` capability the end of the
//! initial listing is enough. With it, the remote's canary for that
//! subsystem must also have been seen, since the listing can complete
//! before the publisher has written its whole snapshot.

use std::collections::BTreeMap;

use serde::Serialize;

use warpmesh_state::{ClusterCapabilities, Subsystem};

/// Readiness strategy chosen once the remote configuration is known.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPolicy {
    /// Synced when the local listing of the subsystem is complete.
    ListingComplete,
    /// Additionally requires the remote's synced canary.
    SyncedCanary,
}

impl SyncPolicy {
    pub fn for_capabilities(capabilities: &ClusterCapabilities) -> Self {
        if capabilities.synced_canaries {
            SyncPolicy::SyncedCanary
        } else {
            SyncPolicy::ListingComplete
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Progress {
    listed: bool,
    canary: bool,
}

/// Per-subsystem sync progress of one remote cluster session.
#[derive(Debug, Clone)]
pub struct SyncTracker {
    policy: SyncPolicy,
    required: Vec<Subsystem>,
    progress: BTreeMap<Subsystem, Progress>,
}

impl SyncTracker {
    pub fn new(policy: SyncPolicy, required: &[Subsystem]) -> Self {
        Self {
            policy,
            required: required.to_vec(),
            progress: Subsystem::ALL
                .into_iter()
                .map(|s| (s, Progress::default()))
                .collect(),
        }
    }

    pub fn policy(&self) -> SyncPolicy {
        self.policy
    }

    /// The initial listing of `subsystem` has been delivered.
    pub fn listing_done(&mut self, subsystem: Subsystem) {
        self.progress.entry(subsystem).or_default().listed = true;
    }

    /// The remote's canary for `subsystem` has been observed.
    pub fn canary_seen(&mut self, subsystem: Subsystem) {
        self.progress.entry(subsystem).or_default().canary = true;
    }

    pub fn is_synced(&self, subsystem: Subsystem) -> bool {
        let progress = self.progress.get(&subsystem).copied().unwrap_or_default();
        match self.policy {
            SyncPolicy::ListingComplete => progress.listed,
            SyncPolicy::SyncedCanary => progress.listed && progress.canary,
        }
    }

    /// Every subsystem required for readiness is synced.
    pub fn all_synced(&self) -> bool {
        self.required.iter().all(|s| self.is_synced(*s))
    }

    pub fn snapshot(&self) -> BTreeMap<Subsystem, bool> {
        Subsystem::ALL
            .into_iter()
            .map(|s| (s, self.is_synced(s)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_follows_capability() {
        let mut caps = ClusterCapabilities::default();
        assert_eq!(SyncPolicy::for_capabilities(&caps), SyncPolicy::ListingComplete);
        caps.synced_canaries = true;
        assert_eq!(SyncPolicy::for_capabilities(&caps), SyncPolicy::SyncedCanary);
    }

    #[test]
    fn listing_is_enough_without_canaries() {
        let mut tracker = SyncTracker::new(SyncPolicy::ListingComplete, &Subsystem::ALL);
        for s in Subsystem::ALL {
            assert!(!tracker.all_synced());
            tracker.listing_done(s);
        }
        assert!(tracker.all_synced());
    }

    #[test]
    fn canary_capable_cluster_needs_canary() {
        let mut tracker = SyncTracker::new(SyncPolicy::SyncedCanary, &Subsystem::ALL);
        for s in Subsystem::ALL {
            tracker.listing_done(s);
        }
        assert!(!tracker.all_synced());

        for s in Subsystem::ALL {
            tracker.canary_seen(s);
        }
        assert!(tracker.all_synced());
    }

    #[test]
    fn canary_alone_is_not_enough() {
        let mut tracker = SyncTracker::new(SyncPolicy::SyncedCanary, &[Subsystem::Nodes]);
        tracker.canary_seen(Subsystem::Nodes);
        assert!(!tracker.is_synced(Subsystem::Nodes));
        tracker.listing_done(Subsystem::Nodes);
        assert!(tracker.all_synced());
    }

    #[test]
    fn only_required_subsystems_gate_readiness() {
        let mut tracker = SyncTracker::new(SyncPolicy::ListingComplete, &[Subsystem::Nodes]);
        tracker.listing_done(Subsystem::Nodes);
        assert!(tracker.all_synced());
        assert!(!tracker.snapshot()[&Subsystem::Services]);
    }
}
