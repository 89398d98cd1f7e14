//! # Rule Compiler
//!
//! Turns a declarative [`RuleGraph`] into a [`CompiledRuleSet`].
//!
//! Compilation resolves every action step's handler once and checks every
//! reference a rule makes. The first problem found aborts compilation with
//! a `Compile` error naming the rule: no partially compiled set is ever
//! returned. Compiling the same rule graph twice yields sets with the same
//! digest and the same behavior.

use crate::graph::Graph;
use crate::guards::GuardSet;
use crate::handlers::{EditInput, HandlerRegistry, PrimitiveEdit};
use crate::pattern::{MatchContext, Pattern};
use crate::primitives::MAX_PATTERN_VARS;
use crate::rule::{EditArg, GuardClause, RuleGraph};
use crate::{CompileReason, GraphsmithError, InvalidEdit, NodeId, RuleId};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

// =============================================================================
// CANDIDATES
// =============================================================================

/// What a rule application records about one produced candidate.
#[derive(Debug, Clone, PartialEq)]
pub struct ApplicationMeta {
    pub rule_index: usize,
    pub rule_id: RuleId,
    pub rule_version: u32,
    pub bindings: BTreeMap<String, NodeId>,
    pub description: String,
    /// Numeric properties of bound nodes before the edit, keyed `var.key`.
    pub observations: BTreeMap<String, f64>,
}

/// A graph produced by one rule application.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub graph: Graph,
    pub meta: ApplicationMeta,
}

// =============================================================================
// COMPILED RULES
// =============================================================================

struct CompiledStep {
    handler: Arc<dyn PrimitiveEdit>,
    params: BTreeMap<String, EditArg>,
}

/// A rule with its handlers resolved: a pure `(Graph, GuardSet) -> candidates`.
pub struct CompiledRule {
    index: usize,
    id: RuleId,
    version: u32,
    name: String,
    trigger: Pattern,
    guard: Vec<GuardClause>,
    steps: Vec<CompiledStep>,
}

impl fmt::Debug for CompiledRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledRule")
            .field("index", &self.index)
            .field("id", &self.id)
            .field("version", &self.version)
            .field("steps", &self.steps.len())
            .finish_non_exhaustive()
    }
}

impl CompiledRule {
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    #[must_use]
    pub fn id(&self) -> &RuleId {
        &self.id
    }

    #[must_use]
    pub fn version(&self) -> u32 {
        self.version
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Apply the rule to every guarded match of `graph`, in match order.
    ///
    /// A match whose guard fails is skipped. A match whose edits fail with
    /// `InvalidEdit` produces no candidate. Neither is an error.
    #[must_use]
    pub fn apply(&self, graph: &Graph, guards: &GuardSet) -> Vec<Candidate> {
        let mut out = Vec::new();
        for ctx in self.trigger.matches(graph) {
            if !self.guard.iter().all(|c| c.holds(graph, &ctx, guards)) {
                continue;
            }
            match self.run_steps(graph, &ctx) {
                Ok(next) => out.push(Candidate {
                    graph: next,
                    meta: ApplicationMeta {
                        rule_index: self.index,
                        rule_id: self.id.clone(),
                        rule_version: self.version,
                        description: self.describe(&ctx),
                        observations: observe(graph, &ctx),
                        bindings: ctx.nodes,
                    },
                }),
                Err(err) => {
                    tracing::trace!(rule = %self.id, error = %err, "edit rejected");
                }
            }
        }
        out
    }

    fn run_steps(&self, graph: &Graph, ctx: &MatchContext) -> Result<Graph, InvalidEdit> {
        let mut current: Option<Graph> = None;
        for step in &self.steps {
            let input = EditInput {
                rule_id: &self.id,
                params: &step.params,
                bindings: ctx,
            };
            let next = step.handler.apply(current.as_ref().unwrap_or(graph), &input)?;
            current = Some(next);
        }
        current.ok_or_else(|| InvalidEdit::Precondition("rule has no action".to_string()))
    }

    fn describe(&self, ctx: &MatchContext) -> String {
        if ctx.is_empty() {
            return self.name.clone();
        }
        let bound: Vec<String> = ctx
            .nodes
            .iter()
            .map(|(var, node)| format!("{var}={node}"))
            .collect();
        format!("{}({})", self.name, bound.join(","))
    }
}

fn observe(graph: &Graph, ctx: &MatchContext) -> BTreeMap<String, f64> {
    let mut out = BTreeMap::new();
    for (var, id) in &ctx.nodes {
        if let Some(node) = graph.node(id) {
            for (key, value) in &node.props {
                if let Some(n) = value.as_number() {
                    out.insert(format!("{var}.{key}"), n);
                }
            }
        }
    }
    out
}

/// The compiled form of a whole rule graph.
#[derive(Debug)]
pub struct CompiledRuleSet {
    name: String,
    rules: Vec<CompiledRule>,
    thresholds: BTreeMap<String, f64>,
    digest: [u8; 32],
}

impl CompiledRuleSet {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Rules in registration order.
    #[must_use]
    pub fn rules(&self) -> &[CompiledRule] {
        &self.rules
    }

    #[must_use]
    pub fn get(&self, index: usize) -> Option<&CompiledRule> {
        self.rules.get(index)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Thresholds declared by the source rule graph.
    #[must_use]
    pub fn thresholds(&self) -> &BTreeMap<String, f64> {
        &self.thresholds
    }

    /// BLAKE3 digest of the source rule graph.
    #[must_use]
    pub fn digest(&self) -> [u8; 32] {
        self.digest
    }
}

// =============================================================================
// COMPILER
// =============================================================================

/// Compile a rule graph against a handler registry.
pub fn compile(
    rules: &RuleGraph,
    registry: &HandlerRegistry,
) -> Result<CompiledRuleSet, GraphsmithError> {
    let mut seen = BTreeSet::new();
    let mut compiled = Vec::with_capacity(rules.rules.len());

    for (index, spec) in rules.rules.iter().enumerate() {
        let fail = |reason| Err(GraphsmithError::compile(&spec.id, reason));

        if !seen.insert(&spec.id) {
            return fail(CompileReason::DuplicateRuleId);
        }
        if spec.trigger.vars.len() > MAX_PATTERN_VARS {
            return fail(CompileReason::PatternTooLarge {
                vars: spec.trigger.vars.len(),
                max: MAX_PATTERN_VARS,
            });
        }

        let mut declared = BTreeSet::new();
        for var in &spec.trigger.vars {
            if !declared.insert(var.var.as_str()) {
                return fail(CompileReason::DuplicateVar(var.var.clone()));
            }
        }
        let undeclared = |var: &str, site: String| {
            Err(GraphsmithError::compile(
                &spec.id,
                CompileReason::UndeclaredVar {
                    var: var.to_string(),
                    site,
                },
            ))
        };

        for (i, constraint) in spec.trigger.edges.iter().enumerate() {
            for var in [&constraint.source, &constraint.target] {
                if !declared.contains(var.as_str()) {
                    return undeclared(var, format!("edge constraint {i}"));
                }
            }
        }

        for (i, clause) in spec.guard.iter().enumerate() {
            if !declared.contains(clause.var.as_str()) {
                return undeclared(&clause.var, format!("guard clause {i}"));
            }
            if let Some(name) = clause.threshold()
                && !rules.thresholds.contains_key(name)
            {
                return fail(CompileReason::UnknownThreshold(name.to_string()));
            }
        }

        if spec.action.is_empty() {
            return fail(CompileReason::EmptyAction);
        }
        let mut steps = Vec::with_capacity(spec.action.len());
        for (step_index, step) in spec.action.iter().enumerate() {
            let Some(handler) = registry.resolve(&step.handler) else {
                return fail(CompileReason::UnknownHandler {
                    step: step_index,
                    handler: step.handler.clone(),
                });
            };
            for param in handler.required_params() {
                if !step.params.contains_key(*param) {
                    return fail(CompileReason::MissingParam {
                        step: step_index,
                        handler: step.handler.clone(),
                        param: (*param).to_string(),
                    });
                }
            }
            for (key, arg) in &step.params {
                if let EditArg::Var(var) = arg
                    && !declared.contains(var.as_str())
                {
                    return undeclared(
                        var,
                        format!("action step {step_index} parameter '{key}'"),
                    );
                }
            }
            steps.push(CompiledStep {
                handler,
                params: step.params.clone(),
            });
        }

        compiled.push(CompiledRule {
            index,
            id: spec.id.clone(),
            version: spec.version,
            name: spec.name.clone(),
            trigger: spec.trigger.clone(),
            guard: spec.guard.clone(),
            steps,
        });
    }

    let encoded = postcard::to_allocvec(rules)
        .map_err(|e| GraphsmithError::Serialization(format!("rule graph: {}", e)))?;
    let digest = *blake3::hash(&encoded).as_bytes();

    tracing::debug!(rule_graph = %rules.name, rules = compiled.len(), "rule graph compiled");
    Ok(CompiledRuleSet {
        name: rules.name.clone(),
        rules: compiled,
        thresholds: rules.thresholds.clone(),
        digest,
    })
}

// =============================================================================
// TESTS
// =============================================================================
