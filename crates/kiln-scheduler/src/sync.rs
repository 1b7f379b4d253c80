//! Worker environment reconciliation.

use std::collections::BTreeSet;

/// What a worker must receive and drop to match the cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncPlan {
    /// Held by the cluster, missing on the worker.
    pub needs: Vec<String>,
    /// Held by the worker, unknown to the cluster.
    pub unwanted: Vec<String>,
}

impl SyncPlan {
    /// `needs = cluster \ worker`, `unwanted = worker \ cluster`.
    pub fn compute(cluster: &BTreeSet<String>, worker: &BTreeSet<String>) -> Self {
        Self {
            needs: cluster.difference(worker).cloned().collect(),
            unwanted: worker.difference(cluster).cloned().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.needs.is_empty() && self.unwanted.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| (*s).to_owned()).collect()
    }

    #[test]
    fn disjoint_partitions() {
        let cluster = set(&["a", "b", "c"]);
        let worker = set(&["b", "c", "d", "e"]);
        let plan = SyncPlan::compute(&cluster, &worker);

        assert_eq!(plan.needs, vec!["a"]);
        assert_eq!(plan.unwanted, vec!["d", "e"]);
    }

    #[test]
    fn in_sync_is_empty() {
        let both = set(&["a", "b"]);
        assert!(SyncPlan::compute(&both, &both).is_empty());
        assert!(SyncPlan::compute(&BTreeSet::new(), &BTreeSet::new()).is_empty());
    }

    #[test]
    fn partitions_cover_symmetric_difference() {
        // Every element lands in exactly one of needs, unwanted, or the
        // intersection, across a spread of overlapping sets.
        for shift in 0..6 {
            let cluster: BTreeSet<String> = (0..8).map(|i| format!("h{i}")).collect();
            let worker: BTreeSet<String> = (shift..shift + 8).map(|i| format!("h{i}")).collect();
            let plan = SyncPlan::compute(&cluster, &worker);

            let needs: BTreeSet<_> = plan.needs.iter().cloned().collect();
            let unwanted: BTreeSet<_> = plan.unwanted.iter().cloned().collect();
            assert!(needs.is_disjoint(&unwanted));
            assert!(needs.iter().all(|h| cluster.contains(h) && !worker.contains(h)));
            assert!(unwanted.iter().all(|h| worker.contains(h) && !cluster.contains(h)));

            let union: BTreeSet<_> = cluster.union(&worker).cloned().collect();
            let common: BTreeSet<_> = cluster.intersection(&worker).cloned().collect();
            assert_eq!(needs.len() + unwanted.len() + common.len(), union.len());
        }
    }
}
