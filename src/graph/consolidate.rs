//! Consolidation: standardize labels, merge inferred edges, deduplicate and
//! drop self references.
//!
//! [`ConsolidationPass`] composes the steps in their required order:
//! standardize, infer (over the communities of the standardized graph),
//! merge, deduplicate, filter self references. Each step assumes the
//! normalization done by the ones before it.

use std::collections::HashMap;

use serde_json::Value;

use super::community::{self, Community};
use super::store::GraphStore;
use super::{Namespace, NodeId, Triple, TripleKey};

// ---------------------------------------------------------------------------
// Standardization mapping
// ---------------------------------------------------------------------------

/// Variant label to canonical label, built from `canonical -> [variants]`
/// groups.
///
/// Every canonical label maps to itself. When a label is claimed by more
/// than one group the first group wins, and chains (`a -> b`, `b -> c`) are
/// collapsed so rewriting is idempotent.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StandardizationMapping {
    index: HashMap<String, String>,
    namespace: Option<Namespace>,
}

impl StandardizationMapping {
    pub fn from_groups<I, C, V>(groups: I) -> Self
    where
        I: IntoIterator<Item = (C, Vec<V>)>,
        C: AsRef<str>,
        V: AsRef<str>,
    {
        let mut index: HashMap<String, String> = HashMap::new();
        for (canonical, variants) in groups {
            let Some(canonical) = bare_label(canonical.as_ref()) else {
                continue;
            };
            index
                .entry(canonical.clone())
                .or_insert_with(|| canonical.clone());
            for variant in variants {
                let Some(variant) = bare_label(variant.as_ref()) else {
                    continue;
                };
                if let Some(existing) = index.get(&variant) {
                    if *existing != canonical {
                        tracing::debug!(
                            variant = %variant,
                            kept = %existing,
                            ignored = %canonical,
                            "variant claimed by two canonical labels"
                        );
                    }
                    continue;
                }
                index.insert(variant, canonical.clone());
            }
        }

        let mut mapping = Self {
            index,
            namespace: None,
        };
        mapping.collapse_chains();
        mapping
    }

    /// Build from a JSON object of `canonical -> [variants]`. A bare string
    /// value counts as a single variant; other values are skipped.
    pub fn from_value(value: &Value) -> Self {
        let Some(object) = value.as_object() else {
            tracing::warn!("standardization mapping is not a JSON object, ignoring");
            return Self::default();
        };
        let groups = object.iter().map(|(canonical, variants)| {
            let variants: Vec<&str> = match variants {
                Value::Array(items) => items.iter().filter_map(Value::as_str).collect(),
                Value::String(single) => vec![single.as_str()],
                _ => Vec::new(),
            };
            (canonical.as_str(), variants)
        });
        Self::from_groups(groups)
    }

    /// Only rewrite nodes in `namespace`.
    pub fn restrict_to(mut self, namespace: Namespace) -> Self {
        self.namespace = Some(namespace);
        self
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Canonical form of `label`, if the mapping knows it.
    pub fn canonical(&self, label: &str) -> Option<&str> {
        self.index.get(label.trim()).map(String::as_str)
    }

    /// Canonical node for `node`; unknown labels pass through unchanged.
    pub fn rewrite(&self, node: &NodeId) -> NodeId {
        if self.namespace.is_some_and(|ns| ns != node.namespace()) {
            return node.clone();
        }
        match self.canonical(node.label()) {
            Some(canonical) if canonical != node.label() => node
                .with_label(canonical)
                .unwrap_or_else(|_| node.clone()),
            _ => node.clone(),
        }
    }

    fn collapse_chains(&mut self) {
        let limit = self.index.len();
        let resolved: HashMap<String, String> = self
            .index
            .keys()
            .map(|label| {
                let mut current = label;
                for _ in 0..limit {
                    match self.index.get(current) {
                        Some(next) if next != current => current = next,
                        _ => break,
                    }
                }
                (label.clone(), current.clone())
            })
            .collect();
        self.index = resolved;
    }
}

/// Label without a `NAMESPACE|` tag, or `None` if blank.
fn bare_label(raw: &str) -> Option<String> {
    raw.parse::<NodeId>().ok().map(|n| n.label().to_string())
}

// ---------------------------------------------------------------------------
// Steps
// ---------------------------------------------------------------------------

/// Rewrite subject and object labels through `mapping`.
pub fn standardize(triples: Vec<Triple>, mapping: &StandardizationMapping) -> Vec<Triple> {
    let mut rewritten = 0usize;
    let out: Vec<Triple> = triples
        .into_iter()
        .map(|triple| {
            let subject = mapping.rewrite(&triple.subject);
            let object = mapping.rewrite(&triple.object);
            if subject == triple.subject && object == triple.object {
                triple
            } else {
                rewritten += 1;
                triple.relabeled(subject, object)
            }
        })
        .collect();
    tracing::info!(rewritten, total = out.len(), "standardized node labels");
    out
}

/// Keep one triple per `(subject, predicate, object)`.
///
/// A non-inferred triple always replaces an inferred one with the same key,
/// taking its position. Otherwise the first occurrence wins.
pub fn deduplicate(triples: Vec<Triple>) -> Vec<Triple> {
    let mut positions: HashMap<TripleKey, usize> = HashMap::with_capacity(triples.len());
    let mut out: Vec<Triple> = Vec::with_capacity(triples.len());

    for triple in triples {
        match positions.get(&triple.key()) {
            Some(&pos) => {
                if out[pos].is_inferred() && !triple.is_inferred() {
                    out[pos] = triple;
                }
            }
            None => {
                positions.insert(triple.key(), out.len());
                out.push(triple);
            }
        }
    }
    out
}

/// Drop triples whose subject equals their object. Returns the kept triples
/// and how many were removed.
pub fn filter_self_references(triples: Vec<Triple>) -> (Vec<Triple>, usize) {
    let before = triples.len();
    let kept: Vec<Triple> = triples
        .into_iter()
        .filter(|t| !t.is_self_reference())
        .collect();
    let removed = before - kept.len();
    if removed > 0 {
        tracing::info!(removed, "dropped self-referencing triples");
    }
    (kept, removed)
}

/// Flag `inferred` triples and append them. Returns how many were added.
pub fn merge_inferred(
    triples: &mut Vec<Triple>,
    inferred: impl IntoIterator<Item = Triple>,
) -> usize {
    let before = triples.len();
    triples.extend(inferred.into_iter().map(Triple::mark_inferred));
    triples.len() - before
}

/// Keep at most `max_words` whitespace-separated words. `0` disables the limit.
pub fn limit_predicate_length(predicate: &str, max_words: usize) -> String {
    let words = predicate.split_whitespace();
    if max_words == 0 {
        return words.collect::<Vec<_>>().join(" ");
    }
    words.take(max_words).collect::<Vec<_>>().join(" ")
}

// ---------------------------------------------------------------------------
// Composed pass
// ---------------------------------------------------------------------------

/// Contributes relations between nodes the graph does not link yet.
pub trait RelationInference {
    /// Propose new triples given the standardized graph and its communities.
    /// Returned triples are flagged inferred by the pass.
    fn infer(&self, triples: &[Triple], communities: &[Community]) -> Vec<Triple>;
}

/// Counts from one consolidation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsolidationReport {
    pub input: usize,
    pub communities: usize,
    pub inferred_added: usize,
    pub duplicates_removed: usize,
    pub self_references_removed: usize,
    pub output: usize,
}

/// Standardize, infer, merge, deduplicate and filter, in that order.
pub struct ConsolidationPass<'a> {
    mapping: Option<&'a StandardizationMapping>,
    inference: Option<&'a dyn RelationInference>,
    namespace: Namespace,
}

impl Default for ConsolidationPass<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a> ConsolidationPass<'a> {
    pub fn new() -> Self {
        Self {
            mapping: None,
            inference: None,
            namespace: Namespace::Entity,
        }
    }

    pub fn with_mapping(mut self, mapping: &'a StandardizationMapping) -> Self {
        self.mapping = Some(mapping);
        self
    }

    pub fn with_inference(mut self, inference: &'a dyn RelationInference) -> Self {
        self.inference = Some(inference);
        self
    }

    /// Namespace whose same-namespace edges define the communities handed to
    /// inference (default: entities).
    pub fn community_namespace(mut self, namespace: Namespace) -> Self {
        self.namespace = namespace;
        self
    }

    pub fn run(&self, triples: Vec<Triple>) -> (Vec<Triple>, ConsolidationReport) {
        let mut report = ConsolidationReport {
            input: triples.len(),
            ..ConsolidationReport::default()
        };

        let mut triples = match self.mapping {
            Some(mapping) => standardize(triples, mapping),
            None => triples,
        };

        if let Some(inference) = self.inference {
            let edges = super::same_namespace_edges(&triples, self.namespace);
            let mut communities = community::detect(&edges);
            community::sort_largest_first(&mut communities);
            report.communities = communities.len();

            let proposed = inference.infer(&triples, &communities);
            report.inferred_added = merge_inferred(&mut triples, proposed);
        }

        let before = triples.len();
        let triples = deduplicate(triples);
        report.duplicates_removed = before - triples.len();

        let (triples, removed) = filter_self_references(triples);
        report.self_references_removed = removed;
        report.output = triples.len();

        tracing::info!(
            input = report.input,
            inferred = report.inferred_added,
            duplicates = report.duplicates_removed,
            self_references = report.self_references_removed,
            output = report.output,
            "consolidation pass complete"
        );
        (triples, report)
    }

    /// Run over a store's contents and swap the result in.
    pub fn apply(&self, store: &mut GraphStore) -> ConsolidationReport {
        let (triples, report) = self.run(store.snapshot());
        store.replace(triples);
        report
    }
}
