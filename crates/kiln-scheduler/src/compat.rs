//! Environment compatibility graph.
//!
//! A symmetric relation over environment hashes: an edge `a <-> b` means a
//! worker holding `b` may run a job that asked for `a`, and vice versa. The
//! whole graph is persisted as one value; concurrent writers are not
//! reconciled and the last write wins.

use kiln_proto::ConfigurationChange;
use kiln_state::{get_json, put_json, KvBackend};
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};

use crate::error::{Result, SchedulerError};

/// Key under which the graph is persisted.
pub const COMPATIBLE_HASHES_KEY: &str = "compatible_hashes";

/// The only configuration field currently writable.
pub const COMPATIBLE_HASH_FIELD: &str = "compatibleHash";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompatibilityGraph {
    edges: BTreeMap<String, BTreeSet<String>>,
}

/// One hash's neighbours as stored. Graphs are written as lists; older
/// documents map each neighbour to `true`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum StoredNeighbours {
    List(BTreeSet<String>),
    Flags(BTreeMap<String, bool>),
}

impl StoredNeighbours {
    fn into_set(self) -> BTreeSet<String> {
        match self {
            Self::List(set) => set,
            Self::Flags(flags) => flags.into_iter().filter(|(_, on)| *on).map(|(hash, _)| hash).collect(),
        }
    }
}

/// A validated graph mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairChange {
    Add(String, String),
    Remove(String, String),
}

impl PairChange {
    /// Validates a change request.
    ///
    /// Exactly one of `add` and `remove` must be present and hold exactly
    /// two hashes.
    pub fn parse(change: &ConfigurationChange) -> Result<Self> {
        if change.field != COMPATIBLE_HASH_FIELD {
            return Err(SchedulerError::validation(format!("unknown field {:?}", change.field)));
        }
        match (&change.add, &change.remove) {
            (Some(pair), None) => {
                let (a, b) = pair_of(pair)?;
                Ok(Self::Add(a, b))
            }
            (None, Some(pair)) => {
                let (a, b) = pair_of(pair)?;
                Ok(Self::Remove(a, b))
            }
            _ => Err(SchedulerError::validation("exactly one of add or remove is required")),
        }
    }
}

fn pair_of(values: &[String]) -> Result<(String, String)> {
    match values {
        [a, b] if !a.is_empty() && !b.is_empty() => Ok((a.clone(), b.clone())),
        _ => Err(SchedulerError::validation("expected a pair of hashes")),
    }
}

impl CompatibilityGraph {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a graph from a stored adjacency map, restoring symmetry.
    pub fn from_edges(edges: BTreeMap<String, BTreeSet<String>>) -> Self {
        let mut graph = Self::new();
        for (a, others) in edges {
            for b in others {
                graph.add_pair(&a, &b);
            }
        }
        graph
    }

    /// Loads the persisted graph. A missing key yields an empty graph.
    pub async fn load(kv: &dyn KvBackend) -> Result<Self> {
        let stored: Option<BTreeMap<String, StoredNeighbours>> = get_json(kv, COMPATIBLE_HASHES_KEY).await?;
        let graph = stored
            .map(|edges| {
                Self::from_edges(
                    edges
                        .into_iter()
                        .map(|(hash, neighbours)| (hash, neighbours.into_set()))
                        .collect(),
                )
            })
            .unwrap_or_default();
        tracing::info!(hashes = graph.edges.len(), "Loaded compatibility graph");
        Ok(graph)
    }

    /// Writes the whole graph.
    pub async fn persist(&self, kv: &dyn KvBackend) -> Result<()> {
        put_json(kv, COMPATIBLE_HASHES_KEY, &self.edges).await?;
        Ok(())
    }

    /// Inserts `a <-> b`.
    pub fn add_pair(&mut self, a: &str, b: &str) {
        self.edges.entry(a.to_owned()).or_default().insert(b.to_owned());
        self.edges.entry(b.to_owned()).or_default().insert(a.to_owned());
    }

    /// Deletes `a <-> b`, pruning emptied adjacency sets.
    pub fn remove_pair(&mut self, a: &str, b: &str) {
        self.unlink(a, b);
        self.unlink(b, a);
    }

    fn unlink(&mut self, from: &str, to: &str) {
        if let Some(set) = self.edges.get_mut(from) {
            set.remove(to);
            if set.is_empty() {
                self.edges.remove(from);
            }
        }
    }

    pub fn apply(&mut self, change: &PairChange) {
        match change {
            PairChange::Add(a, b) => self.add_pair(a, b),
            PairChange::Remove(a, b) => self.remove_pair(a, b),
        }
    }

    /// The hash followed by every hash compatible with it.
    pub fn expand(&self, hash: &str) -> Vec<String> {
        let mut out = vec![hash.to_owned()];
        if let Some(others) = self.edges.get(hash) {
            out.extend(others.iter().filter(|h| h.as_str() != hash).cloned());
        }
        out
    }

    pub fn edges(&self) -> &BTreeMap<String, BTreeSet<String>> {
        &self.edges
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use kiln_state::MemoryKv;

    fn change(add: Option<&[&str]>, remove: Option<&[&str]>) -> ConfigurationChange {
        let owned = |v: &[&str]| v.iter().map(|s| (*s).to_owned()).collect();
        ConfigurationChange {
            field: COMPATIBLE_HASH_FIELD.into(),
            add: add.map(owned),
            remove: remove.map(owned),
        }
    }

    #[test]
    fn add_is_symmetric() {
        let mut graph = CompatibilityGraph::new();
        graph.add_pair("a", "b");
        assert_eq!(graph.expand("a"), vec!["a", "b"]);
        assert_eq!(graph.expand("b"), vec!["b", "a"]);
        assert_eq!(graph.expand("c"), vec!["c"]);
    }

    #[test]
    fn remove_prunes_empty_sets() {
        let mut graph = CompatibilityGraph::new();
        graph.add_pair("a", "b");
        graph.add_pair("a", "c");
        graph.remove_pair("a", "b");

        assert_eq!(graph.expand("a"), vec!["a", "c"]);
        assert!(!graph.edges().contains_key("b"));

        graph.remove_pair("c", "a");
        assert!(graph.edges().is_empty());
    }

    #[test]
    fn parse_rejects_malformed_changes() {
        assert!(PairChange::parse(&change(None, None)).is_err());
        assert!(PairChange::parse(&change(Some(&["a", "b"]), Some(&["a", "b"]))).is_err());
        assert!(PairChange::parse(&change(Some(&["a"]), None)).is_err());
        assert!(PairChange::parse(&change(None, Some(&["a", "b", "c"]))).is_err());

        let mut other = change(Some(&["a", "b"]), None);
        other.field = "somethingElse".into();
        assert!(matches!(
            PairChange::parse(&other),
            Err(SchedulerError::ConfigValidation(_))
        ));
    }

    #[test]
    fn parse_remove_uses_remove_pair() {
        let parsed = PairChange::parse(&change(None, Some(&["x", "y"]))).unwrap();
        assert_eq!(parsed, PairChange::Remove("x".into(), "y".into()));
    }

    #[tokio::test]
    async fn persist_and_reload() {
        let kv = MemoryKv::new();
        let mut graph = CompatibilityGraph::new();
        graph.add_pair("a", "b");
        graph.persist(&kv).await.unwrap();

        let loaded = CompatibilityGraph::load(&kv).await.unwrap();
        assert_eq!(loaded, graph);
    }

    #[tokio::test]
    async fn load_repairs_asymmetric_document() {
        let kv = MemoryKv::new();
        kv.put(COMPATIBLE_HASHES_KEY, serde_json::json!({"a": ["b"]}))
            .await
            .unwrap();

        let graph = CompatibilityGraph::load(&kv).await.unwrap();
        assert_eq!(graph.expand("b"), vec!["b", "a"]);
    }

    #[tokio::test]
    async fn load_accepts_flag_map_document() {
        let kv = MemoryKv::new();
        kv.put(
            COMPATIBLE_HASHES_KEY,
            serde_json::json!({"a": {"b": true, "c": false}, "d": ["e"]}),
        )
        .await
        .unwrap();

        let graph = CompatibilityGraph::load(&kv).await.unwrap();
        assert_eq!(graph.expand("a"), vec!["a", "b"]);
        assert_eq!(graph.expand("c"), vec!["c"]);
        assert_eq!(graph.expand("e"), vec!["e", "d"]);
    }
}
