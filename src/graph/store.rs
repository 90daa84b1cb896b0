//! Accumulating triple store.
//!
//! Producers append concurrently through `&self`; consolidation needs a
//! stable view and takes `&mut self` for [`GraphStore::replace`], so the
//! borrow checker enforces the "all producers quiesced" barrier.

use std::collections::{BTreeSet, HashMap};
use std::sync::RwLock;

use super::{Namespace, NodeId, Triple};

/// Append-only collection of triples with read-side queries.
#[derive(Debug, Default)]
pub struct GraphStore {
    triples: RwLock<Vec<Triple>>,
}

impl GraphStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_triples(triples: Vec<Triple>) -> Self {
        Self {
            triples: RwLock::new(triples),
        }
    }

    pub fn append(&self, triple: Triple) {
        self.triples
            .write()
            .expect("graph store lock poisoned")
            .push(triple);
    }

    pub fn extend(&self, triples: impl IntoIterator<Item = Triple>) {
        self.triples
            .write()
            .expect("graph store lock poisoned")
            .extend(triples);
    }

    pub fn len(&self) -> usize {
        self.triples.read().expect("graph store lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of the current contents.
    pub fn snapshot(&self) -> Vec<Triple> {
        self.triples
            .read()
            .expect("graph store lock poisoned")
            .clone()
    }

    /// Swap in a consolidated triple set, returning the previous contents.
    pub fn replace(&mut self, triples: Vec<Triple>) -> Vec<Triple> {
        let current = self
            .triples
            .get_mut()
            .expect("graph store lock poisoned");
        std::mem::replace(current, triples)
    }

    pub fn into_triples(self) -> Vec<Triple> {
        self.triples
            .into_inner()
            .expect("graph store lock poisoned")
    }

    /// Every node appearing as subject or object, optionally in one namespace.
    pub fn unique_nodes(&self, namespace: Option<Namespace>) -> BTreeSet<NodeId> {
        let triples = self.triples.read().expect("graph store lock poisoned");
        triples
            .iter()
            .flat_map(|t| [&t.subject, &t.object])
            .filter(|n| namespace.is_none_or(|ns| n.namespace() == ns))
            .cloned()
            .collect()
    }

    /// Predicate frequencies, most frequent first, ties by name.
    pub fn predicate_counts(&self) -> Vec<(String, usize)> {
        let triples = self.triples.read().expect("graph store lock poisoned");
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for triple in triples.iter() {
            *counts.entry(triple.predicate.as_str()).or_default() += 1;
        }
        let mut counts: Vec<(String, usize)> = counts
            .into_iter()
            .map(|(p, n)| (p.to_string(), n))
            .collect();
        counts.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        counts
    }

    pub fn top_predicates(&self, n: usize) -> Vec<(String, usize)> {
        let mut counts = self.predicate_counts();
        counts.truncate(n);
        counts
    }

    /// Directed edges whose endpoints are both in `namespace`.
    pub fn same_namespace_edges(&self, namespace: Namespace) -> Vec<(NodeId, NodeId)> {
        let triples = self.triples.read().expect("graph store lock poisoned");
        super::same_namespace_edges(&triples, namespace)
    }

    pub fn inferred_count(&self) -> usize {
        let triples = self.triples.read().expect("graph store lock poisoned");
        triples.iter().filter(|t| t.is_inferred()).count()
    }
}
