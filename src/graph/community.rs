//! Weakly-connected components ("communities") and gap discovery.
//!
//! Edges are treated as undirected for reachability. The traversal is an
//! iterative depth-first search over a `petgraph` undirected graph, linear
//! in nodes plus edges.

use std::collections::{BTreeSet, HashMap, HashSet};

use petgraph::graph::{NodeIndex, UnGraph};
use petgraph::visit::Dfs;

use super::store::GraphStore;
use super::{Namespace, NodeId, Triple};

/// One weakly-connected component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Community {
    /// Discovery order; stable for a given edge list.
    pub id: usize,
    pub members: BTreeSet<NodeId>,
}

impl Community {
    pub fn size(&self) -> usize {
        self.members.len()
    }

    pub fn contains(&self, node: &NodeId) -> bool {
        self.members.contains(node)
    }
}

/// Partition the nodes of `edges` into weakly-connected components.
///
/// Every node named by an edge lands in exactly one community. Nodes are
/// discovered in order of first appearance, so ids are reproducible.
pub fn detect(edges: &[(NodeId, NodeId)]) -> Vec<Community> {
    let mut graph: UnGraph<&NodeId, ()> = UnGraph::with_capacity(edges.len(), edges.len());
    let mut index: HashMap<&NodeId, NodeIndex> = HashMap::new();

    for (from, to) in edges {
        let a = *index.entry(from).or_insert_with(|| graph.add_node(from));
        let b = *index.entry(to).or_insert_with(|| graph.add_node(to));
        graph.add_edge(a, b, ());
    }

    let mut communities = Vec::new();
    let mut dfs = Dfs::empty(&graph);
    for start in graph.node_indices() {
        if dfs.discovered.contains(start.index()) {
            continue;
        }
        dfs.move_to(start);
        let mut members = BTreeSet::new();
        while let Some(nx) = dfs.next(&graph) {
            members.insert(graph[nx].clone());
        }
        communities.push(Community {
            id: communities.len(),
            members,
        });
    }

    tracing::debug!(
        nodes = graph.node_count(),
        edges = graph.edge_count(),
        communities = communities.len(),
        "communities detected"
    );
    communities
}

/// Communities of the subgraph induced by same-namespace triples.
pub fn detect_in(store: &GraphStore, namespace: Namespace) -> Vec<Community> {
    detect(&store.same_namespace_edges(namespace))
}

/// Sort by size, largest first. Equal sizes keep discovery order.
pub fn sort_largest_first(communities: &mut [Community]) {
    communities.sort_by(|a, b| b.size().cmp(&a.size()));
}

/// Pairs of distinct communities to bridge by inference, largest first.
///
/// Enumerates `(i, j)` with `i < j` over the communities in size order and
/// stops after `max_pairs`.
pub fn bridge_pairs(communities: &[Community], max_pairs: usize) -> Vec<(&Community, &Community)> {
    let mut ordered: Vec<&Community> = communities.iter().collect();
    ordered.sort_by(|a, b| b.size().cmp(&a.size()));

    let mut pairs = Vec::new();
    for (i, first) in ordered.iter().enumerate() {
        for second in &ordered[i + 1..] {
            if pairs.len() >= max_pairs {
                return pairs;
            }
            pairs.push((*first, *second));
        }
    }
    pairs
}

/// Member pairs of `community` that no edge links directly, in either
/// direction. At most `max_pairs` are returned.
pub fn unconnected_pairs(
    community: &Community,
    edges: &[(NodeId, NodeId)],
    max_pairs: usize,
) -> Vec<(NodeId, NodeId)> {
    let linked: HashSet<(&NodeId, &NodeId)> = edges
        .iter()
        .flat_map(|(a, b)| [(a, b), (b, a)])
        .collect();

    let members: Vec<&NodeId> = community.members.iter().collect();
    let mut pairs = Vec::new();
    for (i, a) in members.iter().enumerate() {
        for b in &members[i + 1..] {
            if pairs.len() >= max_pairs {
                return pairs;
            }
            if !linked.contains(&(*a, *b)) {
                pairs.push(((*a).clone(), (*b).clone()));
            }
        }
    }
    pairs
}

/// Up to `limit` triples with an endpoint in `nodes`, in input order.
pub fn context_triples<'a>(
    triples: &'a [Triple],
    nodes: &BTreeSet<NodeId>,
    limit: usize,
) -> Vec<&'a Triple> {
    triples
        .iter()
        .filter(|t| nodes.contains(&t.subject) || nodes.contains(&t.object))
        .take(limit)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn n(raw: &str) -> NodeId {
        raw.parse().unwrap()
    }

    fn e(a: &str, b: &str) -> (NodeId, NodeId) {
        (n(a), n(b))
    }

    fn labels(c: &Community) -> Vec<String> {
        c.members.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn two_event_chains() {
        let edges = vec![
            e("EVENT|a", "EVENT|b"),
            e("EVENT|b", "EVENT|c"),
            e("EVENT|x", "EVENT|y"),
        ];
        let communities = detect(&edges);
        assert_eq!(communities.len(), 2);
        assert_eq!(labels(&communities[0]), vec!["EVENT|a", "EVENT|b", "EVENT|c"]);
        assert_eq!(labels(&communities[1]), vec!["EVENT|x", "EVENT|y"]);
    }

    #[test]
    fn direction_is_ignored() {
        // b has only incoming edges; it still joins a and c.
        let edges = vec![e("EVENT|a", "EVENT|b"), e("EVENT|c", "EVENT|b")];
        let communities = detect(&edges);
        assert_eq!(communities.len(), 1);
        assert_eq!(communities[0].size(), 3);
    }

    #[test]
    fn partition_is_complete_and_disjoint() {
        let edges = vec![
            e("ENTITY|1", "ENTITY|2"),
            e("ENTITY|3", "ENTITY|4"),
            e("ENTITY|4", "ENTITY|5"),
            e("ENTITY|6", "ENTITY|6"),
            e("ENTITY|2", "ENTITY|7"),
        ];
        let communities = detect(&edges);
        let mut seen = BTreeSet::new();
        for c in &communities {
            for m in &c.members {
                assert!(seen.insert(m.clone()), "{m} in two communities");
            }
        }
        let referenced: BTreeSet<NodeId> =
            edges.iter().flat_map(|(a, b)| [a.clone(), b.clone()]).collect();
        assert_eq!(seen, referenced);
        assert_eq!(communities.len(), 3);
    }

    #[test]
    fn empty_edges_give_no_communities() {
        assert!(detect(&[]).is_empty());
    }

    #[test]
    fn detect_in_uses_only_one_namespace() {
        let store = GraphStore::from_triples(vec![
            Triple::parse("EVENT|a", "causes", "EVENT|b").unwrap(),
            Triple::parse("EVENT|b", "at", "LOCATION|Paris").unwrap(),
            Triple::parse("ENTITY|p", "knows", "ENTITY|q").unwrap(),
        ]);
        let events = detect_in(&store, Namespace::Event);
        assert_eq!(events.len(), 1);
        assert_eq!(labels(&events[0]), vec!["EVENT|a", "EVENT|b"]);
    }

    #[test]
    fn largest_first_sorting() {
        let mut communities = detect(&[
            e("EVENT|x", "EVENT|y"),
            e("EVENT|a", "EVENT|b"),
            e("EVENT|b", "EVENT|c"),
        ]);
        sort_largest_first(&mut communities);
        assert_eq!(communities[0].size(), 3);
        assert_eq!(communities[1].size(), 2);
    }

    #[test]
    fn bridge_pairs_are_capped() {
        let communities = detect(&[
            e("ENTITY|a", "ENTITY|b"),
            e("ENTITY|c", "ENTITY|d"),
            e("ENTITY|d", "ENTITY|e"),
            e("ENTITY|f", "ENTITY|g"),
        ]);
        let all = bridge_pairs(&communities, 10);
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].0.size(), 3);
        assert_eq!(bridge_pairs(&communities, 2).len(), 2);
        assert!(bridge_pairs(&communities[..1], 5).is_empty());
    }

    #[test]
    fn unconnected_pairs_skip_linked_members() {
        let edges = vec![e("EVENT|a", "EVENT|b"), e("EVENT|c", "EVENT|b")];
        let community = &detect(&edges)[0];
        let pairs = unconnected_pairs(community, &edges, 10);
        assert_eq!(pairs, vec![(n("EVENT|a"), n("EVENT|c"))]);
        assert!(unconnected_pairs(community, &edges, 0).is_empty());
    }

    #[test]
    fn context_triples_touch_node_set() {
        let triples = vec![
            Triple::parse("ENTITY|a", "p", "ENTITY|b").unwrap(),
            Triple::parse("ENTITY|c", "p", "ENTITY|d").unwrap(),
            Triple::parse("ENTITY|d", "p", "ENTITY|a").unwrap(),
        ];
        let nodes: BTreeSet<NodeId> = [n("ENTITY|a")].into_iter().collect();
        assert_eq!(context_triples(&triples, &nodes, 10).len(), 2);
        assert_eq!(context_triples(&triples, &nodes, 1).len(), 1);
    }
}
