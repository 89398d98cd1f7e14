//! # Trigger Patterns
//!
//! A pattern declares typed variables and edge constraints between them.
//! Matching binds each variable to a distinct node of the declared kind.
//!
//! ## Ordering
//!
//! Variables are bound in declaration order, each iterating candidate
//! nodes in ascending id order, so the produced contexts are in
//! lexicographic order of their bindings. An edge constraint is witnessed
//! by the lowest matching edge id.

use crate::graph::Graph;
use crate::primitives::MAX_MATCHES_PER_APPLICATION;
use crate::{EdgeId, NodeId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A typed pattern variable, e.g. `x: Segment`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternVar {
    pub var: String,
    pub kind: String,
}

/// Requires an edge from one bound variable to another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeConstraint {
    pub source: String,
    pub target: String,
    /// Restrict to one edge kind; any kind when absent.
    #[serde(default)]
    pub kind: Option<String>,
}

/// A trigger pattern. The empty pattern matches once, with no bindings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pattern {
    #[serde(default)]
    pub vars: Vec<PatternVar>,
    #[serde(default)]
    pub edges: Vec<EdgeConstraint>,
}

/// One way a pattern binds to a graph.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchContext {
    /// Variable name -> bound node.
    pub nodes: BTreeMap<String, NodeId>,
    /// Witness edge per constraint, in constraint order.
    pub edges: Vec<EdgeId>,
}

impl MatchContext {
    #[must_use]
    pub fn node(&self, var: &str) -> Option<&NodeId> {
        self.nodes.get(var)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

impl Pattern {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a variable binding a node of `kind`.
    #[must_use]
    pub fn var(mut self, var: impl Into<String>, kind: impl Into<String>) -> Self {
        self.vars.push(PatternVar {
            var: var.into(),
            kind: kind.into(),
        });
        self
    }

    /// Require an edge `source -> target`, optionally of one kind.
    #[must_use]
    pub fn edge(
        mut self,
        source: impl Into<String>,
        target: impl Into<String>,
        kind: Option<&str>,
    ) -> Self {
        self.edges.push(EdgeConstraint {
            source: source.into(),
            target: target.into(),
            kind: kind.map(str::to_string),
        });
        self
    }

    #[must_use]
    pub fn declares(&self, var: &str) -> bool {
        self.vars.iter().any(|v| v.var == var)
    }

    /// All match contexts, in deterministic order.
    ///
    /// At most `MAX_MATCHES_PER_APPLICATION` contexts are produced; the
    /// excess is dropped with a warning.
    #[must_use]
    pub fn matches(&self, graph: &Graph) -> Vec<MatchContext> {
        if self.vars.is_empty() {
            return if self.edges.is_empty() {
                vec![MatchContext::default()]
            } else {
                Vec::new()
            };
        }

        // Position of each variable; a constraint is checked as soon as the
        // later of its two endpoints is bound.
        let position: BTreeMap<&str, usize> = self
            .vars
            .iter()
            .enumerate()
            .map(|(i, v)| (v.var.as_str(), i))
            .collect();
        let mut checks: Vec<Vec<usize>> = vec![Vec::new(); self.vars.len()];
        for (ci, constraint) in self.edges.iter().enumerate() {
            match (
                position.get(constraint.source.as_str()),
                position.get(constraint.target.as_str()),
            ) {
                (Some(&s), Some(&t)) => checks[s.max(t)].push(ci),
                // Undeclared variable: nothing can match.
                _ => return Vec::new(),
            }
        }

        let mut state = MatchState {
            pattern: self,
            graph,
            checks: &checks,
            bound: Vec::with_capacity(self.vars.len()),
            witnesses: vec![None; self.edges.len()],
            out: Vec::new(),
            truncated: false,
        };
        state.extend(0);

        if state.truncated {
            tracing::warn!(
                limit = MAX_MATCHES_PER_APPLICATION,
                "pattern match count truncated"
            );
        }
        state.out
    }
}

struct MatchState<'a> {
    pattern: &'a Pattern,
    graph: &'a Graph,
    checks: &'a [Vec<usize>],
    bound: Vec<&'a NodeId>,
    witnesses: Vec<Option<EdgeId>>,
    out: Vec<MatchContext>,
    truncated: bool,
}

impl<'a> MatchState<'a> {
    fn extend(&mut self, depth: usize) {
        if self.truncated {
            return;
        }
        if depth == self.pattern.vars.len() {
            if self.out.len() >= MAX_MATCHES_PER_APPLICATION {
                self.truncated = true;
                return;
            }
            self.emit();
            return;
        }

        let graph = self.graph;
        let pattern = self.pattern;
        let kind = pattern.vars[depth].kind.as_str();
        for node in graph.find(kind) {
            if self.bound.contains(&&node.id) {
                continue;
            }
            self.bound.push(&node.id);
            if self.constraints_hold(depth) {
                self.extend(depth + 1);
            }
            self.bound.pop();
            if self.truncated {
                return;
            }
        }
    }

    fn constraints_hold(&mut self, depth: usize) -> bool {
        let checks = self.checks;
        let pattern = self.pattern;
        for &ci in &checks[depth] {
            let constraint = &pattern.edges[ci];
            let source = self.bound_node(&constraint.source);
            let target = self.bound_node(&constraint.target);
            let witness = match (source, target) {
                (Some(s), Some(t)) => self
                    .graph
                    .edges_between(s, t, constraint.kind.as_deref())
                    .next()
                    .map(|e| e.id),
                _ => None,
            };
            match witness {
                Some(id) => self.witnesses[ci] = Some(id),
                None => return false,
            }
        }
        true
    }

    fn bound_node(&self, var: &str) -> Option<&'a NodeId> {
        self.pattern
            .vars
            .iter()
            .position(|v| v.var == var)
            .and_then(|i| self.bound.get(i).copied())
    }

    fn emit(&mut self) {
        let nodes = self
            .pattern
            .vars
            .iter()
            .zip(&self.bound)
            .map(|(v, id)| (v.var.clone(), (*id).clone()))
            .collect();
        let edges = self.witnesses.iter().flatten().copied().collect();
        self.out.push(MatchContext { nodes, edges });
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Node;

    fn chain() -> Graph {
        Graph::new()
            .with_node(Node::new("rod", "Assembly"))
            .expect("rod")
            .with_node(Node::new("seg1", "Segment"))
            .expect("seg1")
            .with_node(Node::new("seg2", "Segment"))
            .expect("seg2")
            .with_node(Node::new("seg3", "Segment"))
            .expect("seg3")
            .with_edge("rod", "seg1", "has")
            .expect("e0")
            .with_edge("rod", "seg2", "has")
            .expect("e1")
            .with_edge("seg1", "seg2", "next")
            .expect("e2")
    }

    fn bound(ctx: &MatchContext, var: &str) -> String {
        ctx.node(var).map(|n| n.0.clone()).unwrap_or_default()
    }

    #[test]
    fn empty_pattern_matches_once() {
        let matches = Pattern::new().matches(&chain());
        assert_eq!(matches.len(), 1);
        assert!(matches[0].is_empty());
    }

    #[test]
    fn single_var_binds_in_id_order() {
        let matches = Pattern::new().var("x", "Segment").matches(&chain());
        let ids: Vec<String> = matches.iter().map(|m| bound(m, "x")).collect();
        assert_eq!(ids, vec!["seg1", "seg2", "seg3"]);
    }

    #[test]
    fn distinct_vars_bind_distinct_nodes() {
        let matches = Pattern::new()
            .var("a", "Segment")
            .var("b", "Segment")
            .matches(&chain());
        assert_eq!(matches.len(), 6);
        assert!(matches.iter().all(|m| bound(m, "a") != bound(m, "b")));
        assert_eq!(bound(&matches[0], "a"), "seg1");
        assert_eq!(bound(&matches[0], "b"), "seg2");
    }

    #[test]
    fn edge_constraint_filters_and_witnesses() {
        let matches = Pattern::new()
            .var("r", "Assembly")
            .var("x", "Segment")
            .edge("r", "x", Some("has"))
            .matches(&chain());
        let ids: Vec<String> = matches.iter().map(|m| bound(m, "x")).collect();
        assert_eq!(ids, vec!["seg1", "seg2"]);
        assert_eq!(matches[0].edges, vec![EdgeId(0)]);
        assert_eq!(matches[1].edges, vec![EdgeId(1)]);
    }

    #[test]
    fn lowest_edge_id_is_witness() {
        let mut graph = chain();
        graph
            .add_edge(&NodeId::from("seg1"), &NodeId::from("seg2"), "next")
            .expect("parallel edge");
        let matches = Pattern::new()
            .var("a", "Segment")
            .var("b", "Segment")
            .edge("a", "b", None)
            .matches(&graph);
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].edges, vec![EdgeId(2)]);
    }

    #[test]
    fn no_candidates_is_empty_not_error() {
        let matches = Pattern::new().var("x", "Bolt").matches(&chain());
        assert!(matches.is_empty());
    }

    #[test]
    fn undeclared_edge_var_matches_nothing() {
        let matches = Pattern::new()
            .var("x", "Segment")
            .edge("x", "ghost", None)
            .matches(&chain());
        assert!(matches.is_empty());
    }
}
