//! # Graph Model
//!
//! The attributed graph every design is represented as.
//!
//! A `Graph` is a value: rule applications clone it and edit the copy, so a
//! graph that has been handed to the search engine is never mutated again.
//! All containers are `BTreeMap` so iteration order is deterministic.
//!
//! ## Invariants
//!
//! - Node identifiers are unique within a graph.
//! - Every edge's endpoints reference existing nodes.
//!
//! Both are enforced by the constructors below and re-checked when a graph
//! is deserialized.

use crate::canonical::CanonicalGraph;
use crate::{EdgeId, Fingerprint, InvalidEdit, NodeId, PropValue};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// =============================================================================
// NODE & EDGE
// =============================================================================

/// A typed node with a property map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub kind: String,
    #[serde(default)]
    pub props: BTreeMap<String, PropValue>,
}

impl Node {
    #[must_use]
    pub fn new(id: impl Into<NodeId>, kind: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            props: BTreeMap::new(),
        }
    }

    /// Builder-style property setter.
    #[must_use]
    pub fn with_prop(mut self, key: impl Into<String>, value: impl Into<PropValue>) -> Self {
        self.props.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn prop(&self, key: &str) -> Option<&PropValue> {
        self.props.get(key)
    }

    #[must_use]
    pub fn number(&self, key: &str) -> Option<f64> {
        self.props.get(key).and_then(PropValue::as_number)
    }
}

/// A directed, typed edge with a property map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub id: EdgeId,
    pub source: NodeId,
    pub target: NodeId,
    pub kind: String,
    #[serde(default)]
    pub props: BTreeMap<String, PropValue>,
}

// =============================================================================
// GRAPH
// =============================================================================

/// An attributed design graph.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "GraphRepr", into = "GraphRepr")]
pub struct Graph {
    nodes: BTreeMap<NodeId, Node>,
    edges: BTreeMap<EdgeId, Edge>,
    next_edge_id: u64,
}

impl Graph {
    /// Create a new empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style node insertion, for seeds and fixtures.
    pub fn with_node(mut self, node: Node) -> Result<Self, InvalidEdit> {
        self.insert_node(node)?;
        Ok(self)
    }

    /// Builder-style edge insertion, for seeds and fixtures.
    pub fn with_edge(
        mut self,
        source: impl Into<NodeId>,
        target: impl Into<NodeId>,
        kind: impl Into<String>,
    ) -> Result<Self, InvalidEdit> {
        self.add_edge(&source.into(), &target.into(), kind)?;
        Ok(self)
    }

    /// Add an empty node of the given kind.
    pub fn add_node(
        &mut self,
        id: impl Into<NodeId>,
        kind: impl Into<String>,
    ) -> Result<&mut Node, InvalidEdit> {
        self.insert_node(Node::new(id, kind))
    }

    /// Insert a fully built node. Fails if the id is already taken.
    pub fn insert_node(&mut self, node: Node) -> Result<&mut Node, InvalidEdit> {
        use std::collections::btree_map::Entry;
        match self.nodes.entry(node.id.clone()) {
            Entry::Occupied(_) => Err(InvalidEdit::DuplicateNode(node.id)),
            Entry::Vacant(slot) => Ok(slot.insert(node)),
        }
    }

    /// Add a directed edge. Both endpoints must exist.
    pub fn add_edge(
        &mut self,
        source: &NodeId,
        target: &NodeId,
        kind: impl Into<String>,
    ) -> Result<EdgeId, InvalidEdit> {
        if !self.nodes.contains_key(source) {
            return Err(InvalidEdit::NodeNotFound(source.clone()));
        }
        if !self.nodes.contains_key(target) {
            return Err(InvalidEdit::NodeNotFound(target.clone()));
        }
        let id = EdgeId(self.next_edge_id);
        self.next_edge_id = self.next_edge_id.saturating_add(1);
        self.edges.insert(
            id,
            Edge {
                id,
                source: source.clone(),
                target: target.clone(),
                kind: kind.into(),
                props: BTreeMap::new(),
            },
        );
        Ok(id)
    }

    /// Set a node property, returning the previous value.
    pub fn set_prop(
        &mut self,
        node: &NodeId,
        key: impl Into<String>,
        value: impl Into<PropValue>,
    ) -> Result<Option<PropValue>, InvalidEdit> {
        let target = self
            .nodes
            .get_mut(node)
            .ok_or_else(|| InvalidEdit::NodeNotFound(node.clone()))?;
        Ok(target.props.insert(key.into(), value.into()))
    }

    /// Set an edge property, returning the previous value.
    pub fn set_edge_prop(
        &mut self,
        edge: EdgeId,
        key: impl Into<String>,
        value: impl Into<PropValue>,
    ) -> Result<Option<PropValue>, InvalidEdit> {
        let target = self
            .edges
            .get_mut(&edge)
            .ok_or_else(|| InvalidEdit::EdgeNotFound(edge.to_string()))?;
        Ok(target.props.insert(key.into(), value.into()))
    }

    /// Remove a node and every edge incident to it.
    pub fn remove_node(&mut self, id: &NodeId) -> Result<Node, InvalidEdit> {
        let node = self
            .nodes
            .remove(id)
            .ok_or_else(|| InvalidEdit::NodeNotFound(id.clone()))?;
        self.edges
            .retain(|_, edge| edge.source != *id && edge.target != *id);
        Ok(node)
    }

    /// Remove a single edge.
    pub fn remove_edge(&mut self, id: EdgeId) -> Result<Edge, InvalidEdit> {
        self.edges
            .remove(&id)
            .ok_or_else(|| InvalidEdit::EdgeNotFound(id.to_string()))
    }

    #[must_use]
    pub fn node(&self, id: &NodeId) -> Option<&Node> {
        self.nodes.get(id)
    }

    #[must_use]
    pub fn edge(&self, id: EdgeId) -> Option<&Edge> {
        self.edges.get(&id)
    }

    #[must_use]
    pub fn contains_node(&self, id: &NodeId) -> bool {
        self.nodes.contains_key(id)
    }

    /// All nodes in id order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    /// All edges in id order.
    pub fn edges(&self) -> impl Iterator<Item = &Edge> {
        self.edges.values()
    }

    /// Nodes of the given kind, in id order.
    pub fn find<'a>(&'a self, kind: &'a str) -> impl Iterator<Item = &'a Node> + 'a {
        self.nodes.values().filter(move |n| n.kind == kind)
    }

    #[must_use]
    pub fn count_kind(&self, kind: &str) -> usize {
        self.find(kind).count()
    }

    /// Outgoing edges from `source` to `target`, optionally of one kind, in id order.
    pub fn edges_between<'a>(
        &'a self,
        source: &'a NodeId,
        target: &'a NodeId,
        kind: Option<&'a str>,
    ) -> impl Iterator<Item = &'a Edge> + 'a {
        self.edges.values().filter(move |e| {
            e.source == *source && e.target == *target && kind.is_none_or(|k| e.kind == k)
        })
    }

    /// Outbound neighbors of a node, optionally restricted to one edge kind.
    #[must_use]
    pub fn neighbors(&self, id: &NodeId, kind: Option<&str>) -> Vec<&NodeId> {
        self.edges
            .values()
            .filter(|e| e.source == *id && kind.is_none_or(|k| e.kind == k))
            .map(|e| &e.target)
            .collect()
    }

    #[must_use]
    pub fn prop(&self, node: &NodeId, key: &str) -> Option<&PropValue> {
        self.nodes.get(node).and_then(|n| n.props.get(key))
    }

    #[must_use]
    pub fn number(&self, node: &NodeId, key: &str) -> Option<f64> {
        self.prop(node, key).and_then(PropValue::as_number)
    }

    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Deterministically pick an unused node id of the form `{prefix}{n}`.
    ///
    /// Starts at `count(nodes with that prefix) + 1` and walks upward until a
    /// free id is found, so removing and re-adding nodes never collides.
    #[must_use]
    pub fn fresh_node_id(&self, prefix: &str) -> NodeId {
        let existing = self
            .nodes
            .keys()
            .filter(|id| id.as_str().starts_with(prefix))
            .count();
        let mut n = existing.saturating_add(1);
        loop {
            let candidate = NodeId(format!("{prefix}{n}"));
            if !self.nodes.contains_key(&candidate) {
                return candidate;
            }
            n = n.saturating_add(1);
        }
    }

    /// Stable hash over the canonical node and edge sets.
    #[must_use]
    pub fn fingerprint(&self) -> Fingerprint {
        CanonicalGraph::from_graph(self).fingerprint()
    }

    /// Structural equality: same nodes, same edge multiset, ignoring edge ids.
    #[must_use]
    pub fn structurally_eq(&self, other: &Self) -> bool {
        CanonicalGraph::from_graph(self) == CanonicalGraph::from_graph(other)
    }

    /// Check both graph invariants.
    pub fn validate(&self) -> Result<(), InvalidEdit> {
        for (id, node) in &self.nodes {
            if node.id != *id {
                return Err(InvalidEdit::Precondition(format!(
                    "node keyed {id} carries id {}",
                    node.id
                )));
            }
        }
        for edge in self.edges.values() {
            for endpoint in [&edge.source, &edge.target] {
                if !self.nodes.contains_key(endpoint) {
                    return Err(InvalidEdit::NodeNotFound(endpoint.clone()));
                }
            }
        }
        Ok(())
    }
}

// =============================================================================
// SERIALIZED FORM
// =============================================================================

/// On-disk form of a graph: a node list and an edge list without ids.
///
/// Edge ids are reassigned in list order on load.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct GraphRepr {
    #[serde(default)]
    nodes: Vec<Node>,
    #[serde(default)]
    edges: Vec<EdgeRepr>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct EdgeRepr {
    source: NodeId,
    target: NodeId,
    kind: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    props: BTreeMap<String, PropValue>,
}

impl TryFrom<GraphRepr> for Graph {
    type Error = InvalidEdit;

    fn try_from(repr: GraphRepr) -> Result<Self, Self::Error> {
        let mut graph = Graph::new();
        for node in repr.nodes {
            graph.insert_node(node)?;
        }
        for edge in repr.edges {
            let id = graph.add_edge(&edge.source, &edge.target, edge.kind)?;
            for (key, value) in edge.props {
                graph.set_edge_prop(id, key, value)?;
            }
        }
        Ok(graph)
    }
}

impl From<Graph> for GraphRepr {
    fn from(graph: Graph) -> Self {
        Self {
            nodes: graph.nodes.into_values().collect(),
            edges: graph
                .edges
                .into_values()
                .map(|e| EdgeRepr {
                    source: e.source,
                    target: e.target,
                    kind: e.kind,
                    props: e.props,
                })
                .collect(),
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn rod() -> Graph {
        Graph::new()
            .with_node(Node::new("rod", "Assembly"))
            .expect("rod")
            .with_node(Node::new("seg1", "Segment").with_prop("length", 1.0))
            .expect("seg1")
            .with_edge("rod", "seg1", "has")
            .expect("edge")
    }

    #[test]
    fn duplicate_node_rejected() {
        let mut graph = rod();
        let result = graph.add_node("seg1", "Segment");
        assert_eq!(
            result.err(),
            Some(InvalidEdit::DuplicateNode(NodeId::from("seg1")))
        );
    }

    #[test]
    fn edge_requires_existing_endpoints() {
        let mut graph = rod();
        let result = graph.add_edge(&NodeId::from("rod"), &NodeId::from("ghost"), "has");
        assert_eq!(
            result.err(),
            Some(InvalidEdit::NodeNotFound(NodeId::from("ghost")))
        );
    }

    #[test]
    fn remove_node_cascades_edges() {
        let mut graph = rod();
        graph.remove_node(&NodeId::from("seg1")).expect("remove");
        assert_eq!(graph.node_count(), 1);
        assert_eq!(graph.edge_count(), 0);
        assert!(graph.validate().is_ok());
    }

    #[test]
    fn clone_is_independent() {
        let original = rod();
        let mut copy = original.clone();
        copy.set_prop(&NodeId::from("seg1"), "length", 2.0)
            .expect("set");
        assert_eq!(original.number(&NodeId::from("seg1"), "length"), Some(1.0));
        assert_eq!(copy.number(&NodeId::from("seg1"), "length"), Some(2.0));
    }

    #[test]
    fn fresh_node_id_skips_taken_ids() {
        let mut graph = rod();
        graph.add_node("seg2", "Segment").expect("seg2");
        graph.remove_node(&NodeId::from("seg1")).expect("remove");
        // one "seg" node left -> starts at seg2, which is taken
        assert_eq!(graph.fresh_node_id("seg"), NodeId::from("seg3"));
    }

    #[test]
    fn fingerprint_ignores_edge_insertion_order() {
        let base = Graph::new()
            .with_node(Node::new("a", "X"))
            .expect("a")
            .with_node(Node::new("b", "X"))
            .expect("b");

        let g1 = base
            .clone()
            .with_edge("a", "b", "link")
            .expect("e1")
            .with_edge("b", "a", "link")
            .expect("e2");
        let g2 = base
            .with_edge("b", "a", "link")
            .expect("e1")
            .with_edge("a", "b", "link")
            .expect("e2");

        assert_eq!(g1.fingerprint(), g2.fingerprint());
        assert!(g1.structurally_eq(&g2));
    }

    #[test]
    fn fingerprint_sees_property_changes() {
        let g1 = rod();
        let mut g2 = rod();
        g2.set_prop(&NodeId::from("seg1"), "length", 1.5)
            .expect("set");
        assert_ne!(g1.fingerprint(), g2.fingerprint());
    }

    #[test]
    fn neighbors_filter_by_kind() {
        let mut graph = rod();
        graph.add_node("bolt", "Part").expect("bolt");
        graph
            .add_edge(&NodeId::from("rod"), &NodeId::from("bolt"), "uses")
            .expect("edge");

        let all = graph.neighbors(&NodeId::from("rod"), None);
        assert_eq!(all.len(), 2);
        let has = graph.neighbors(&NodeId::from("rod"), Some("has"));
        assert_eq!(has, vec![&NodeId::from("seg1")]);
    }

    #[test]
    fn serialized_form_enforces_invariants() {
        let repr = GraphRepr {
            nodes: vec![Node::new("a", "X")],
            edges: vec![EdgeRepr {
                source: NodeId::from("a"),
                target: NodeId::from("b"),
                kind: "k".to_string(),
                props: BTreeMap::new(),
            }],
        };
        assert_eq!(
            Graph::try_from(repr).err(),
            Some(InvalidEdit::NodeNotFound(NodeId::from("b")))
        );
    }

    #[test]
    fn serialized_form_roundtrip_preserves_structure() {
        let graph = rod();
        let restored = Graph::try_from(GraphRepr::from(graph.clone())).expect("restore");
        assert!(graph.structurally_eq(&restored));
    }
}
