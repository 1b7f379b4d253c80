//! Size-bounded environment cache eviction.

use chrono::{DateTime, Utc};

/// Size and age of one stored archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub hash: String,
    pub size: u64,
    pub created: DateTime<Utc>,
}

/// Keeps the newest archives that fit within a byte budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvictionPolicy {
    max_size: Option<u64>,
}

impl EvictionPolicy {
    #[must_use]
    pub const fn new(max_size: Option<u64>) -> Self {
        Self { max_size }
    }

    /// A policy that never evicts.
    #[must_use]
    pub const fn unbounded() -> Self {
        Self { max_size: None }
    }

    pub const fn max_size(&self) -> Option<u64> {
        self.max_size
    }

    /// Hashes to purge.
    ///
    /// Entries are walked newest first, accumulating sizes. The first entry
    /// that would push the total past the budget is purged along with every
    /// older entry. Equal creation times are ordered by hash.
    pub fn select_victims(&self, entries: &[CacheEntry]) -> Vec<String> {
        let Some(budget) = self.max_size else {
            return Vec::new();
        };

        let mut ordered: Vec<&CacheEntry> = entries.iter().collect();
        ordered.sort_by(|a, b| b.created.cmp(&a.created).then_with(|| a.hash.cmp(&b.hash)));

        let mut total: u64 = 0;
        let cut = ordered.iter().position(|entry| {
            total = total.saturating_add(entry.size);
            total > budget
        });

        match cut {
            Some(index) => ordered[index..].iter().map(|e| e.hash.clone()).collect(),
            None => Vec::new(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn entry(hash: &str, size: u64, created_secs: i64) -> CacheEntry {
        CacheEntry {
            hash: hash.into(),
            size,
            created: Utc.timestamp_opt(created_secs, 0).unwrap(),
        }
    }

    #[test]
    fn unbounded_never_evicts() {
        let entries = vec![entry("a", u64::MAX, 1), entry("b", u64::MAX, 2)];
        assert!(EvictionPolicy::unbounded().select_victims(&entries).is_empty());
    }

    #[test]
    fn within_budget_keeps_everything() {
        let entries = vec![entry("a", 40, 1), entry("b", 60, 2)];
        assert!(EvictionPolicy::new(Some(100)).select_victims(&entries).is_empty());
    }

    #[test]
    fn overflow_purges_cut_off_and_older() {
        // 60 (newest) fits; adding 50 reaches 110, so 50 and the older 10
        // are both purged.
        let entries = vec![entry("oldest", 10, 1), entry("middle", 50, 2), entry("newest", 60, 3)];
        let mut victims = EvictionPolicy::new(Some(100)).select_victims(&entries);
        victims.sort();
        assert_eq!(victims, vec!["middle", "oldest"]);
    }

    #[test]
    fn newest_oversize_purges_everything() {
        let entries = vec![entry("old", 1, 1), entry("huge", 500, 2)];
        let mut victims = EvictionPolicy::new(Some(100)).select_victims(&entries);
        victims.sort();
        assert_eq!(victims, vec!["huge", "old"]);
    }

    #[test]
    fn exact_fit_is_kept() {
        let entries = vec![entry("a", 50, 1), entry("b", 50, 2)];
        assert!(EvictionPolicy::new(Some(100)).select_victims(&entries).is_empty());
    }

    #[test]
    fn input_order_does_not_matter() {
        let entries = vec![entry("newest", 60, 3), entry("oldest", 30, 1), entry("middle", 30, 2)];
        let victims = EvictionPolicy::new(Some(100)).select_victims(&entries);
        assert_eq!(victims, vec!["oldest"]);
    }
}
