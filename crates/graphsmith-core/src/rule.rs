//! # Rule Schema
//!
//! The declarative form of a rule graph: what domains hand to the compiler.
//!
//! Every type here is plain serde data so rule graphs can live in
//! configuration files next to seeds and golden suites.

use crate::graph::Graph;
use crate::guards::GuardSet;
use crate::pattern::{MatchContext, Pattern};
use crate::{PropValue, RuleId};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

// =============================================================================
// GUARDS
// =============================================================================

/// Comparison applied by a guard clause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardOp {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    In,
    NotIn,
    Exists,
    Absent,
}

/// Right-hand side of a guard clause.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardOperand {
    /// No operand (`exists` / `absent`).
    #[default]
    None,
    Value(PropValue),
    Values(Vec<PropValue>),
    /// Named threshold looked up in the active guard set.
    Threshold(String),
}

/// `{var}.{key} {op} {operand}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardClause {
    pub var: String,
    pub key: String,
    pub op: GuardOp,
    #[serde(default)]
    pub operand: GuardOperand,
}

impl GuardClause {
    #[must_use]
    pub fn new(
        var: impl Into<String>,
        key: impl Into<String>,
        op: GuardOp,
        operand: GuardOperand,
    ) -> Self {
        Self {
            var: var.into(),
            key: key.into(),
            op,
            operand,
        }
    }

    /// `{var}.{key} < threshold(name)`: the shape the Builder-Builder tunes.
    #[must_use]
    pub fn below_threshold(
        var: impl Into<String>,
        key: impl Into<String>,
        threshold: impl Into<String>,
    ) -> Self {
        Self::new(var, key, GuardOp::Lt, GuardOperand::Threshold(threshold.into()))
    }

    /// Threshold referenced by this clause, if any.
    #[must_use]
    pub fn threshold(&self) -> Option<&str> {
        match &self.operand {
            GuardOperand::Threshold(name) => Some(name),
            _ => None,
        }
    }

    /// Evaluate against one match context.
    ///
    /// An unbound variable, a missing property, an unknown threshold or a
    /// type mismatch all make the clause false.
    #[must_use]
    pub fn holds(&self, graph: &Graph, ctx: &MatchContext, guards: &GuardSet) -> bool {
        let Some(node) = ctx.node(&self.var) else {
            return false;
        };
        if !graph.contains_node(node) {
            return false;
        }
        let lhs = graph.prop(node, &self.key);

        match self.op {
            GuardOp::Exists => return lhs.is_some(),
            GuardOp::Absent => return lhs.is_none(),
            _ => {}
        }
        let Some(lhs) = lhs else {
            return false;
        };

        let rhs: Vec<PropValue> = match &self.operand {
            GuardOperand::None => return false,
            GuardOperand::Value(v) => vec![v.clone()],
            GuardOperand::Values(vs) => vs.clone(),
            GuardOperand::Threshold(name) => match guards.get(name) {
                Some(t) => vec![PropValue::Number(t)],
                None => return false,
            },
        };

        match self.op {
            GuardOp::In => rhs.iter().any(|v| lhs.compare(v) == Some(Ordering::Equal)),
            GuardOp::NotIn => rhs.iter().all(|v| {
                lhs.compare(v)
                    .is_some_and(|ord| ord != Ordering::Equal)
            }),
            op => {
                let [rhs] = rhs.as_slice() else {
                    return false;
                };
                let Some(ord) = lhs.compare(rhs) else {
                    return false;
                };
                match op {
                    GuardOp::Lt => ord == Ordering::Less,
                    GuardOp::Le => ord != Ordering::Greater,
                    GuardOp::Gt => ord == Ordering::Greater,
                    GuardOp::Ge => ord != Ordering::Less,
                    GuardOp::Eq => ord == Ordering::Equal,
                    GuardOp::Ne => ord != Ordering::Equal,
                    _ => false,
                }
            }
        }
    }
}

// =============================================================================
// ACTIONS
// =============================================================================

/// An edit parameter: a literal, or the node bound to a pattern variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EditArg {
    Value(PropValue),
    Var(String),
}

/// One primitive edit in a rule's action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EditStep {
    pub handler: String,
    #[serde(default)]
    pub params: BTreeMap<String, EditArg>,
}

impl EditStep {
    #[must_use]
    pub fn new(handler: impl Into<String>) -> Self {
        Self {
            handler: handler.into(),
            params: BTreeMap::new(),
        }
    }

    /// Literal parameter.
    #[must_use]
    pub fn value(mut self, key: impl Into<String>, value: impl Into<PropValue>) -> Self {
        self.params.insert(key.into(), EditArg::Value(value.into()));
        self
    }

    /// Parameter bound to a pattern variable.
    #[must_use]
    pub fn var(mut self, key: impl Into<String>, var: impl Into<String>) -> Self {
        self.params.insert(key.into(), EditArg::Var(var.into()));
        self
    }
}

// =============================================================================
// RULES
// =============================================================================

fn default_version() -> u32 {
    1
}

/// A declarative rule: trigger pattern, guard, action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleSpec {
    pub id: RuleId,
    #[serde(default = "default_version")]
    pub version: u32,
    pub name: String,
    #[serde(default)]
    pub trigger: Pattern,
    #[serde(default)]
    pub guard: Vec<GuardClause>,
    #[serde(default)]
    pub action: Vec<EditStep>,
}

impl RuleSpec {
    #[must_use]
    pub fn new(id: impl Into<RuleId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            version: default_version(),
            name: name.into(),
            trigger: Pattern::default(),
            guard: Vec::new(),
            action: Vec::new(),
        }
    }

    #[must_use]
    pub fn version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    #[must_use]
    pub fn trigger(mut self, pattern: Pattern) -> Self {
        self.trigger = pattern;
        self
    }

    #[must_use]
    pub fn guard(mut self, clause: GuardClause) -> Self {
        self.guard.push(clause);
        self
    }

    #[must_use]
    pub fn step(mut self, step: EditStep) -> Self {
        self.action.push(step);
        self
    }
}

/// An ordered rule collection plus default threshold values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleGraph {
    pub name: String,
    #[serde(default)]
    pub rules: Vec<RuleSpec>,
    #[serde(default)]
    pub thresholds: BTreeMap<String, f64>,
}

impl RuleGraph {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rules: Vec::new(),
            thresholds: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn rule(mut self, rule: RuleSpec) -> Self {
        self.rules.push(rule);
        self
    }

    #[must_use]
    pub fn threshold(mut self, name: impl Into<String>, value: f64) -> Self {
        self.thresholds.insert(name.into(), value);
        self
    }

    /// Guard set version 0, built from the declared defaults.
    #[must_use]
    pub fn initial_guard_set(&self) -> GuardSet {
        GuardSet::initial(self.thresholds.clone(), format!("rule graph {}", self.name))
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Node;

    fn fixture() -> (Graph, MatchContext, GuardSet) {
        let graph = Graph::new()
            .with_node(
                Node::new("n1", "Counter")
                    .with_prop("value", 5.0)
                    .with_prop("material", "steel"),
            )
            .expect("n1");
        let ctx = Pattern::new().var("x", "Counter").matches(&graph)[0].clone();
        let mut thresholds = BTreeMap::new();
        thresholds.insert("limit".to_string(), 6.0);
        (graph, ctx, GuardSet::initial(thresholds, "test"))
    }

    fn check(op: GuardOp, key: &str, operand: GuardOperand) -> bool {
        let (graph, ctx, guards) = fixture();
        GuardClause::new("x", key, op, operand).holds(&graph, &ctx, &guards)
    }

    #[test]
    fn numeric_comparisons() {
        let five = || GuardOperand::Value(PropValue::Number(5.0));
        assert!(!check(GuardOp::Lt, "value", five()));
        assert!(check(GuardOp::Le, "value", five()));
        assert!(check(GuardOp::Ge, "value", five()));
        assert!(!check(GuardOp::Gt, "value", five()));
        assert!(check(GuardOp::Eq, "value", five()));
        assert!(!check(GuardOp::Ne, "value", five()));
    }

    #[test]
    fn threshold_resolved_from_guard_set() {
        assert!(check(
            GuardOp::Lt,
            "value",
            GuardOperand::Threshold("limit".to_string())
        ));
        assert!(!check(
            GuardOp::Lt,
            "value",
            GuardOperand::Threshold("missing".to_string())
        ));
    }

    #[test]
    fn membership() {
        let values = GuardOperand::Values(vec![PropValue::from("steel"), PropValue::from("iron")]);
        assert!(check(GuardOp::In, "material", values.clone()));
        assert!(!check(GuardOp::NotIn, "material", values));
    }

    #[test]
    fn existence() {
        assert!(check(GuardOp::Exists, "value", GuardOperand::None));
        assert!(check(GuardOp::Absent, "thickness", GuardOperand::None));
        assert!(!check(GuardOp::Exists, "thickness", GuardOperand::None));
    }

    #[test]
    fn missing_property_or_type_mismatch_is_false() {
        let one = GuardOperand::Value(PropValue::Number(1.0));
        assert!(!check(GuardOp::Gt, "thickness", one.clone()));
        assert!(!check(GuardOp::Gt, "material", one.clone()));
        assert!(!check(GuardOp::Ne, "material", one));
    }

    #[test]
    fn unbound_var_is_false() {
        let (graph, ctx, guards) = fixture();
        let clause = GuardClause::new("y", "value", GuardOp::Exists, GuardOperand::None);
        assert!(!clause.holds(&graph, &ctx, &guards));
    }

    #[test]
    fn initial_guard_set_carries_defaults() {
        let rules = RuleGraph::new("demo").threshold("max_length", 3.0);
        let set = rules.initial_guard_set();
        assert_eq!(set.version, 0);
        assert_eq!(set.parent, None);
        assert_eq!(set.get("max_length"), Some(3.0));
    }
}
