use std::collections::{BTreeMap, HashMap};

const MAX_LINEAGE_PER_KEY: usize = 64;

/// Last-known authoritative revision per key.
///
/// Besides the revision itself the tracker remembers how this client's own
/// confirmed writes advanced each key (`expected -> returned`), so a commit
/// that was built before an earlier write from the same client landed can be
/// rebased onto it instead of tripping a conflict on its own history.
#[derive(Debug, Default, Clone)]
pub struct RevisionTracker {
    revisions: HashMap<String, u64>,
    lineage: HashMap<String, BTreeMap<u64, u64>>,
}

impl RevisionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> u64 {
        self.revisions.get(key).copied().unwrap_or(0)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.revisions.contains_key(key)
    }

    /// True when `revision` would move the key forward.
    pub fn is_newer(&self, key: &str, revision: u64) -> bool {
        match self.revisions.get(key) {
            Some(current) => revision > *current,
            None => true,
        }
    }

    /// Stores `max(current, revision)` and reports whether the key advanced.
    pub fn observe(&mut self, key: &str, revision: u64) -> bool {
        if !self.is_newer(key, revision) {
            return false;
        }
        self.revisions.insert(key.to_string(), revision);
        true
    }

    pub fn forget(&mut self, key: &str) -> Option<u64> {
        self.lineage.remove(key);
        self.revisions.remove(key)
    }

    pub fn clear(&mut self) {
        self.revisions.clear();
        self.lineage.clear();
    }

    pub fn len(&self) -> usize {
        self.revisions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.revisions.is_empty()
    }

    pub fn record_own_advance(&mut self, key: &str, from: u64, to: u64) {
        if to <= from {
            return;
        }
        let steps = self.lineage.entry(key.to_string()).or_default();
        steps.insert(from, to);
        while steps.len() > MAX_LINEAGE_PER_KEY {
            let Some(oldest) = steps.keys().next().copied() else {
                break;
            };
            steps.remove(&oldest);
        }
    }

    /// Follows this client's own confirmed writes starting at `captured`.
    pub fn rebase(&self, key: &str, captured: u64) -> u64 {
        let Some(steps) = self.lineage.get(key) else {
            return captured;
        };
        let mut current = captured;
        while let Some(next) = steps.get(&current) {
            current = *next;
        }
        current
    }
}

#[cfg(test)]
mod tests {
    use super::RevisionTracker;

    #[test]
    fn unknown_keys_report_zero() {
        let tracker = RevisionTracker::new();
        assert_eq!(tracker.get("missing"), 0);
        assert!(!tracker.contains("missing"));
    }

    #[test]
    fn observe_never_regresses() {
        let mut tracker = RevisionTracker::new();
        assert!(tracker.observe("p1", 3));
        assert!(!tracker.observe("p1", 2));
        assert!(!tracker.observe("p1", 3));
        assert!(tracker.observe("p1", 4));
        assert_eq!(tracker.get("p1"), 4);
    }

    #[test]
    fn revision_zero_is_accepted_once_for_untracked_keys() {
        let mut tracker = RevisionTracker::new();
        assert!(tracker.is_newer("p1", 0));
        assert!(tracker.observe("p1", 0));
        assert!(tracker.contains("p1"));
        assert!(!tracker.is_newer("p1", 0));
        assert!(!tracker.observe("p1", 0));
    }

    #[test]
    fn rebase_follows_own_writes_only() {
        let mut tracker = RevisionTracker::new();
        tracker.record_own_advance("p1", 1, 2);
        tracker.record_own_advance("p1", 2, 3);
        assert_eq!(tracker.rebase("p1", 1), 3);
        assert_eq!(tracker.rebase("p1", 5), 5);
        assert_eq!(tracker.rebase("p2", 1), 1);

        tracker.forget("p1");
        assert_eq!(tracker.rebase("p1", 1), 1);
    }

    #[test]
    fn lineage_is_bounded() {
        let mut tracker = RevisionTracker::new();
        for revision in 0..200u64 {
            tracker.record_own_advance("p1", revision, revision + 1);
        }
        assert_eq!(tracker.rebase("p1", 0), 0);
        assert_eq!(tracker.rebase("p1", 150), 200);
    }
}
