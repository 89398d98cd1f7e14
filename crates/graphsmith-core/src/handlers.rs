//! # Primitive Edits
//!
//! The handler registry: primitive-edit name -> implementation.
//!
//! Handlers are resolved once, when a rule graph is compiled. A handler
//! receives the working graph and its step's parameters and returns a new
//! graph, or `InvalidEdit` when its preconditions do not hold. It must
//! never mutate its input.
//!
//! `StandardEdit` is the closed set of domain-agnostic edits every registry
//! created with [`HandlerRegistry::standard`] starts with. Domains add
//! their own handlers next to it.

use crate::graph::{Graph, Node};
use crate::pattern::MatchContext;
use crate::rule::EditArg;
use crate::{InvalidEdit, NodeId, PropValue, RuleId};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

// =============================================================================
// EDIT INPUT
// =============================================================================

/// Everything a handler may read besides the graph itself.
#[derive(Debug, Clone, Copy)]
pub struct EditInput<'a> {
    pub rule_id: &'a RuleId,
    pub params: &'a BTreeMap<String, EditArg>,
    pub bindings: &'a MatchContext,
}

impl<'a> EditInput<'a> {
    #[must_use]
    pub fn has(&self, name: &str) -> bool {
        self.params.contains_key(name)
    }

    fn arg(&self, name: &str) -> Result<&'a EditArg, InvalidEdit> {
        self.params
            .get(name)
            .ok_or_else(|| InvalidEdit::MissingParam(name.to_string()))
    }

    /// A node reference: a pattern variable, or a literal node id.
    pub fn node(&self, name: &str) -> Result<NodeId, InvalidEdit> {
        match self.arg(name)? {
            EditArg::Var(var) => self
                .bindings
                .node(var)
                .cloned()
                .ok_or_else(|| InvalidEdit::UnboundVar(var.clone())),
            EditArg::Value(PropValue::Category(id)) => Ok(NodeId::new(id.as_str())),
            EditArg::Value(PropValue::Number(_)) => Err(wrong_type(name, "a node reference")),
        }
    }

    /// A literal value.
    pub fn value(&self, name: &str) -> Result<PropValue, InvalidEdit> {
        match self.arg(name)? {
            EditArg::Value(v) => Ok(v.clone()),
            EditArg::Var(_) => Err(wrong_type(name, "a literal value")),
        }
    }

    pub fn number(&self, name: &str) -> Result<f64, InvalidEdit> {
        self.value(name)?
            .as_number()
            .ok_or_else(|| wrong_type(name, "a number"))
    }

    pub fn number_or(&self, name: &str, default: f64) -> Result<f64, InvalidEdit> {
        if self.has(name) {
            self.number(name)
        } else {
            Ok(default)
        }
    }

    pub fn text(&self, name: &str) -> Result<String, InvalidEdit> {
        match self.value(name)? {
            PropValue::Category(s) => Ok(s),
            PropValue::Number(_) => Err(wrong_type(name, "a string")),
        }
    }

    pub fn text_or(&self, name: &str, default: &str) -> Result<String, InvalidEdit> {
        if self.has(name) {
            self.text(name)
        } else {
            Ok(default.to_string())
        }
    }
}

fn wrong_type(param: &str, expected: &'static str) -> InvalidEdit {
    InvalidEdit::WrongParamType {
        param: param.to_string(),
        expected,
    }
}

// =============================================================================
// PRIMITIVE EDIT TRAIT
// =============================================================================

/// A primitive edit: `(Graph, EditInput) -> Graph | InvalidEdit`.
pub trait PrimitiveEdit: Send + Sync {
    fn apply(&self, graph: &Graph, input: &EditInput<'_>) -> Result<Graph, InvalidEdit>;

    /// Parameters the compiler must see on every step using this handler.
    fn required_params(&self) -> &[&str] {
        &[]
    }
}

/// Adapts a closure into a [`PrimitiveEdit`].
pub struct FnEdit<F> {
    f: F,
    required: &'static [&'static str],
}

impl<F> FnEdit<F>
where
    F: Fn(&Graph, &EditInput<'_>) -> Result<Graph, InvalidEdit> + Send + Sync,
{
    pub fn new(required: &'static [&'static str], f: F) -> Self {
        Self { f, required }
    }
}

impl<F> PrimitiveEdit for FnEdit<F>
where
    F: Fn(&Graph, &EditInput<'_>) -> Result<Graph, InvalidEdit> + Send + Sync,
{
    fn apply(&self, graph: &Graph, input: &EditInput<'_>) -> Result<Graph, InvalidEdit> {
        (self.f)(graph, input)
    }

    fn required_params(&self) -> &[&str] {
        self.required
    }
}

// =============================================================================
// STANDARD EDITS
// =============================================================================

/// Domain-agnostic primitive edits.
///
/// | name | params |
/// |---|---|
/// | `add_node` | `kind`, optional `id_prefix`, `parent`, `edge_kind`, `prop.*` |
/// | `add_edge` | `source`, `target`, optional `kind` (default `link`) |
/// | `set_prop` | `node`, `key`, `value` |
/// | `increment_prop` | `node`, `key`, `delta` (missing property starts at 0) |
/// | `remove_node` | `node` (incident edges go too) |
/// | `remove_edge` | `source`, `target`, optional `kind` (lowest edge id) |
/// | `remove_arg_min` | `kind`, `key`, optional `min_keep` (default 0) |
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StandardEdit {
    AddNode,
    AddEdge,
    SetProp,
    IncrementProp,
    RemoveNode,
    RemoveEdge,
    RemoveArgMin,
}

impl StandardEdit {
    pub const ALL: [StandardEdit; 7] = [
        Self::AddNode,
        Self::AddEdge,
        Self::SetProp,
        Self::IncrementProp,
        Self::RemoveNode,
        Self::RemoveEdge,
        Self::RemoveArgMin,
    ];

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::AddNode => "add_node",
            Self::AddEdge => "add_edge",
            Self::SetProp => "set_prop",
            Self::IncrementProp => "increment_prop",
            Self::RemoveNode => "remove_node",
            Self::RemoveEdge => "remove_edge",
            Self::RemoveArgMin => "remove_arg_min",
        }
    }
}

impl fmt::Display for StandardEdit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl PrimitiveEdit for StandardEdit {
    fn apply(&self, graph: &Graph, input: &EditInput<'_>) -> Result<Graph, InvalidEdit> {
        let mut next = graph.clone();
        match self {
            Self::AddNode => {
                let kind = input.text("kind")?;
                let prefix = input.text_or("id_prefix", &kind.to_lowercase())?;
                let id = next.fresh_node_id(&prefix);
                let mut node = Node::new(id.clone(), kind);
                for (key, arg) in input.params {
                    if let Some(prop) = key.strip_prefix("prop.") {
                        match arg {
                            EditArg::Value(v) => {
                                node.props.insert(prop.to_string(), v.clone());
                            }
                            EditArg::Var(_) => return Err(wrong_type(key, "a literal value")),
                        }
                    }
                }
                next.insert_node(node)?;
                if input.has("parent") {
                    let parent = input.node("parent")?;
                    let edge_kind = input.text_or("edge_kind", "has")?;
                    next.add_edge(&parent, &id, edge_kind)?;
                }
            }
            Self::AddEdge => {
                let source = input.node("source")?;
                let target = input.node("target")?;
                let kind = input.text_or("kind", "link")?;
                next.add_edge(&source, &target, kind)?;
            }
            Self::SetProp => {
                let node = input.node("node")?;
                let key = input.text("key")?;
                next.set_prop(&node, key, input.value("value")?)?;
            }
            Self::IncrementProp => {
                let node = input.node("node")?;
                let key = input.text("key")?;
                let delta = input.number("delta")?;
                let current = match next.prop(&node, &key) {
                    None => 0.0,
                    Some(PropValue::Number(n)) => *n,
                    Some(PropValue::Category(_)) => {
                        return Err(InvalidEdit::NotNumeric { node, key });
                    }
                };
                next.set_prop(&node, key, current + delta)?;
            }
            Self::RemoveNode => {
                let node = input.node("node")?;
                next.remove_node(&node)?;
            }
            Self::RemoveEdge => {
                let source = input.node("source")?;
                let target = input.node("target")?;
                let kind = if input.has("kind") {
                    Some(input.text("kind")?)
                } else {
                    None
                };
                let id = graph
                    .edges_between(&source, &target, kind.as_deref())
                    .next()
                    .map(|e| e.id)
                    .ok_or_else(|| InvalidEdit::EdgeNotFound(format!("{source} -> {target}")))?;
                next.remove_edge(id)?;
            }
            Self::RemoveArgMin => {
                let kind = input.text("kind")?;
                let key = input.text("key")?;
                let min_keep = input.number_or("min_keep", 0.0)?;
                let count = graph.count_kind(&kind);
                if (count as f64) <= min_keep {
                    return Err(InvalidEdit::Precondition(format!(
                        "{count} {kind} node(s), keeping at least {min_keep}"
                    )));
                }
                // Ties keep the lowest id; a missing value counts as 0.
                let victim = graph
                    .find(&kind)
                    .map(|n| (n.number(&key).unwrap_or(0.0), &n.id))
                    .min_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.cmp(b.1)))
                    .map(|(_, id)| id.clone())
                    .ok_or_else(|| InvalidEdit::Precondition(format!("no {kind} node")))?;
                next.remove_node(&victim)?;
            }
        }
        Ok(next)
    }

    fn required_params(&self) -> &[&str] {
        match self {
            Self::AddNode => &["kind"],
            Self::AddEdge | Self::RemoveEdge => &["source", "target"],
            Self::SetProp => &["node", "key", "value"],
            Self::IncrementProp => &["node", "key", "delta"],
            Self::RemoveNode => &["node"],
            Self::RemoveArgMin => &["kind", "key"],
        }
    }
}

// =============================================================================
// REGISTRY
// =============================================================================

/// Name -> primitive edit. Consulted only by the compiler.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: BTreeMap<String, Arc<dyn PrimitiveEdit>>,
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl HandlerRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding every [`StandardEdit`].
    #[must_use]
    pub fn standard() -> Self {
        let mut registry = Self::new();
        for edit in StandardEdit::ALL {
            registry.register(edit.name(), edit);
        }
        registry
    }

    /// Register (or replace) a handler.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        handler: impl PrimitiveEdit + 'static,
    ) -> &mut Self {
        self.handlers.insert(name.into(), Arc::new(handler));
        self
    }

    /// Register a closure as a handler.
    pub fn register_fn<F>(
        &mut self,
        name: impl Into<String>,
        required: &'static [&'static str],
        f: F,
    ) -> &mut Self
    where
        F: Fn(&Graph, &EditInput<'_>) -> Result<Graph, InvalidEdit> + Send + Sync + 'static,
    {
        self.register(name, FnEdit::new(required, f))
    }

    #[must_use]
    pub fn resolve(&self, name: &str) -> Option<Arc<dyn PrimitiveEdit>> {
        self.handlers.get(name).cloned()
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }
}

// =============================================================================
// TESTS
// =============================================================================
