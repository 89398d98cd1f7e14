//! # Rod Domain
//!
//! A rod is an `Assembly` node owning `Segment` nodes through `has` edges.
//! Each segment carries `length`, `thickness` and `material`. The cost
//! trades weight against stress under a load, with heavy penalties below
//! the target length or above the stress limit; the score is `-cost`.
//!
//! ## Evaluator Weights
//!
//! | weight | default |
//! |---|---|
//! | `target_length` | 4.0 |
//! | `stress_limit` | 1.0 |
//! | `lam_len` | 30.0 |
//! | `lam_str` | 30.0 |
//! | `load` | 10.0 |

use graphsmith_core::{
    EditInput, EditStep, EvalParams, Evaluator, EvaluatorError, GoldenScenario, GoldenSuite,
    Graph, GuardClause, HandlerRegistry, InvalidEdit, Metrics, Node, NodeId, ObservedThreshold,
    Pattern, PropValue, Reducer, RuleGraph, RuleSpec, SearchConfig,
};

pub const DOMAIN: &str = "rod";
pub const ASSEMBLY: &str = "Assembly";
pub const SEGMENT: &str = "Segment";
pub const ROD_ID: &str = "rod";

/// Guard threshold on `IncreaseLength`.
pub const MAX_LENGTH: &str = "max_length";
pub const DEFAULT_MAX_LENGTH: f64 = 2.0;

// =============================================================================
// MATERIALS
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Material {
    Aluminum,
    Steel,
}

impl Material {
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "aluminum" => Some(Self::Aluminum),
            "steel" => Some(Self::Steel),
            _ => None,
        }
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Aluminum => "aluminum",
            Self::Steel => "steel",
        }
    }

    #[must_use]
    pub const fn density(self) -> f64 {
        match self {
            Self::Aluminum => 1.0,
            Self::Steel => 2.6,
        }
    }

    #[must_use]
    pub const fn strength(self) -> f64 {
        match self {
            Self::Aluminum => 1.0,
            Self::Steel => 2.2,
        }
    }

    #[must_use]
    pub const fn swapped(self) -> Self {
        match self {
            Self::Aluminum => Self::Steel,
            Self::Steel => Self::Aluminum,
        }
    }
}

fn material_of(node: &Node) -> Option<Material> {
    node.prop("material")
        .and_then(PropValue::as_category)
        .and_then(Material::parse)
}

// =============================================================================
// SEEDS
// =============================================================================

/// A rod with a single segment.
pub fn seed_rod(length: f64, thickness: f64, material: Material) -> Result<Graph, InvalidEdit> {
    Graph::new()
        .with_node(Node::new(ROD_ID, ASSEMBLY).with_prop("name", "rod-1"))?
        .with_node(
            Node::new("seg1", SEGMENT)
                .with_prop("length", length)
                .with_prop("thickness", thickness)
                .with_prop("material", material.name()),
        )?
        .with_edge(ROD_ID, "seg1", "has")
}

#[must_use]
pub fn params(load: f64) -> EvalParams {
    EvalParams::new().with_weight("load", load)
}

// =============================================================================
// HANDLERS
// =============================================================================

/// The standard library plus the rod edits.
#[must_use]
pub fn registry() -> HandlerRegistry {
    let mut registry = HandlerRegistry::standard();
    registry
        .register_fn("add_segment", &[], add_segment)
        .register_fn("adaptive_fix", &["mode"], adaptive_fix)
        .register_fn("swap_material", &["node"], swap_material);
    registry
}

/// Append a segment to the rod.
fn add_segment(graph: &Graph, input: &EditInput<'_>) -> Result<Graph, InvalidEdit> {
    let length = input.number_or("length", 0.8)?;
    let thickness = input.number_or("thickness", 0.8)?;
    let material = input.text_or("material", Material::Aluminum.name())?;
    if Material::parse(&material).is_none() {
        return Err(InvalidEdit::Precondition(format!("unknown material {material}")));
    }

    let mut next = graph.clone();
    let id = next.fresh_node_id("seg");
    next.insert_node(
        Node::new(id.clone(), SEGMENT)
            .with_prop("length", length)
            .with_prop("thickness", thickness)
            .with_prop("material", material),
    )?;
    next.add_edge(&NodeId::new(ROD_ID), &id, "has")?;
    Ok(next)
}

/// Lengthen the shortest segment toward the target length, or thicken the
/// thinnest one toward the target strength scale.
fn adaptive_fix(graph: &Graph, input: &EditInput<'_>) -> Result<Graph, InvalidEdit> {
    let mode = input.text("mode")?;
    let segments: Vec<&Node> = graph.find(SEGMENT).collect();
    let value = |node: &Node, key: &str| node.number(key).unwrap_or(0.0);
    let mut next = graph.clone();

    match mode.as_str() {
        "length" => {
            let alpha = input.number_or("alpha", 0.5)?;
            let target = input.number_or("target_length", 4.0)?;
            let total: f64 = segments.iter().map(|n| value(n, "length")).sum();
            let need = target - total;
            if need <= 0.0 {
                return Err(InvalidEdit::Precondition("length target met".to_string()));
            }
            let shortest = pick_min(&segments, |n| value(n, "length"))?;
            let bump = (alpha * need).max(0.4);
            next.set_prop(&shortest, "length", value_at(graph, &shortest, "length") + bump)?;
        }
        "stress" => {
            let alpha = input.number_or("alpha", 0.6)?;
            let target = input.number_or("target_scale", 10.0)?;
            let scale: f64 = segments
                .iter()
                .map(|n| value(n, "thickness") * material_of(n).map_or(0.0, Material::strength))
                .sum();
            if scale >= target {
                return Err(InvalidEdit::Precondition("strength target met".to_string()));
            }
            let thinnest = pick_min(&segments, |n| value(n, "thickness"))?;
            let bump = (alpha * (target - scale) / (segments.len() as f64).max(1.0)).max(0.2);
            next.set_prop(
                &thinnest,
                "thickness",
                value_at(graph, &thinnest, "thickness") + bump,
            )?;
        }
        _ => {
            return Err(InvalidEdit::WrongParamType {
                param: "mode".to_string(),
                expected: "\"length\" or \"stress\"",
            });
        }
    }
    Ok(next)
}

/// Toggle a segment between aluminum and steel.
fn swap_material(graph: &Graph, input: &EditInput<'_>) -> Result<Graph, InvalidEdit> {
    let id = input.node("node")?;
    let node = graph
        .node(&id)
        .ok_or_else(|| InvalidEdit::NodeNotFound(id.clone()))?;
    let material = material_of(node)
        .ok_or_else(|| InvalidEdit::Precondition(format!("{id} has no known material")))?;
    let mut next = graph.clone();
    next.set_prop(&id, "material", material.swapped().name())?;
    Ok(next)
}

/// Lowest value, ties to the lowest id.
fn pick_min(nodes: &[&Node], key: impl Fn(&Node) -> f64) -> Result<NodeId, InvalidEdit> {
    nodes
        .iter()
        .map(|n| (key(n), &n.id))
        .min_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.cmp(b.1)))
        .map(|(_, id)| id.clone())
        .ok_or_else(|| InvalidEdit::Precondition("no segment".to_string()))
}

fn value_at(graph: &Graph, id: &NodeId, key: &str) -> f64 {
    graph.number(id, key).unwrap_or(0.0)
}

// =============================================================================
// EVALUATOR
// =============================================================================

#[derive(Debug, Clone, Copy, Default)]
pub struct RodEvaluator;

impl Evaluator for RodEvaluator {
    fn evaluate(&self, graph: &Graph, params: &EvalParams) -> Result<Metrics, EvaluatorError> {
        let target_length = params.weight("target_length", 4.0);
        let stress_limit = params.weight("stress_limit", 1.0);
        let lam_len = params.weight("lam_len", 30.0);
        let lam_str = params.weight("lam_str", 30.0);
        let load = params.weight("load", 10.0);

        let mut length = 0.0;
        let mut weight = 0.0;
        let mut strength = 0.0;
        let mut count = 0usize;
        for segment in graph.find(SEGMENT) {
            let l = segment.number("length").ok_or_else(|| {
                EvaluatorError::Malformed(format!("{} has no length", segment.id))
            })?;
            let t = segment.number("thickness").ok_or_else(|| {
                EvaluatorError::Malformed(format!("{} has no thickness", segment.id))
            })?;
            let m = material_of(segment).ok_or_else(|| {
                EvaluatorError::Malformed(format!("{} has no known material", segment.id))
            })?;
            length += l;
            weight += l * t * m.density();
            strength += t * m.strength();
            count += 1;
        }

        let stress = load / strength.max(1e-6);
        let feasible = length >= target_length && stress <= stress_limit;
        let penalty = lam_len * (target_length - length).max(0.0)
            + lam_str * (stress - stress_limit).max(0.0);
        let cost = weight + 0.5 * stress + 0.05 * count as f64 + penalty;

        Ok(Metrics::new(-cost)
            .feasible(feasible)
            .with_extra("cost", cost)
            .with_extra("length", length)
            .with_extra("stress", stress)
            .with_extra("weight", weight))
    }
}

// =============================================================================
// RULES & GOLDEN SUITE
// =============================================================================

/// The default rod rule graph.
#[must_use]
pub fn rule_graph() -> RuleGraph {
    let segment = || Pattern::new().var("x", SEGMENT);
    let add = |length: f64, thickness: f64| {
        EditStep::new("add_segment")
            .value("length", length)
            .value("thickness", thickness)
            .value("material", Material::Aluminum.name())
    };
    let bump = |key: &str, delta: f64| {
        EditStep::new("increment_prop")
            .var("node", "x")
            .value("key", key)
            .value("delta", delta)
    };

    RuleGraph::new("rod-default")
        .threshold(MAX_LENGTH, DEFAULT_MAX_LENGTH)
        .rule(RuleSpec::new("R1", "AddSegment").step(add(0.9, 0.8)))
        .rule(RuleSpec::new("R1b", "AddBigSegment").step(add(1.6, 0.9)))
        .rule(
            RuleSpec::new("R2", "IncreaseLength")
                .trigger(segment())
                .guard(GuardClause::below_threshold("x", "length", MAX_LENGTH))
                .step(bump("length", 0.7)),
        )
        .rule(
            RuleSpec::new("R3", "IncreaseThickness")
                .trigger(segment())
                .step(bump("thickness", 0.35)),
        )
        .rule(
            RuleSpec::new("R4", "SwapMaterial")
                .trigger(segment())
                .step(EditStep::new("swap_material").var("node", "x")),
        )
        .rule(
            RuleSpec::new("R5", "RemoveShortest").step(
                EditStep::new("remove_arg_min")
                    .value("kind", SEGMENT)
                    .value("key", "length")
                    .value("min_keep", 1.0),
            ),
        )
        .rule(
            RuleSpec::new("R6", "AdaptiveFixLength").step(
                EditStep::new("adaptive_fix")
                    .value("mode", "length")
                    .value("alpha", 0.5),
            ),
        )
        .rule(
            RuleSpec::new("R7", "AdaptiveFixStress").step(
                EditStep::new("adaptive_fix")
                    .value("mode", "stress")
                    .value("alpha", 0.6),
            ),
        )
}

/// Four reference rods, validated under `config`.
pub fn golden_suite(config: SearchConfig) -> Result<GoldenSuite, InvalidEdit> {
    let rods = [
        ("rod-a", 1.0, 0.8, Material::Aluminum, 10.0),
        ("rod-b", 1.2, 0.7, Material::Aluminum, 9.0),
        ("rod-c", 0.8, 0.9, Material::Steel, 11.0),
        ("rod-d", 1.5, 0.6, Material::Aluminum, 10.0),
    ];
    let mut suite = GoldenSuite::new();
    for (id, length, thickness, material, load) in rods {
        suite = suite.scenario(
            GoldenScenario::new(id, seed_rod(length, thickness, material)?, config)
                .params(params(load)),
        );
    }
    Ok(suite)
}

/// Where `IncreaseLength` helped, derive `max_length`.
#[must_use]
pub fn length_strategy(reducer: Reducer, epsilon: f64) -> ObservedThreshold {
    ObservedThreshold::new("R2", "x.length", MAX_LENGTH)
        .reducer(reducer)
        .epsilon(epsilon)
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use graphsmith_core::{
        EditArg, GuardSet, MatchContext, NullSink, RuleId, RunInfo, SearchEngine, compile,
    };
    use std::collections::BTreeMap;

    fn apply(
        handler: fn(&Graph, &EditInput<'_>) -> Result<Graph, InvalidEdit>,
        graph: &Graph,
        params: &[(&str, EditArg)],
    ) -> Result<Graph, InvalidEdit> {
        let rule_id = RuleId::new("test");
        let params: BTreeMap<String, EditArg> = params
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect();
        let bindings = MatchContext::default();
        handler(
            graph,
            &EditInput {
                rule_id: &rule_id,
                params: &params,
                bindings: &bindings,
            },
        )
    }

    fn text(s: &str) -> EditArg {
        EditArg::Value(PropValue::from(s))
    }

    fn seed() -> Graph {
        seed_rod(1.0, 0.8, Material::Aluminum).expect("seed")
    }

    #[test]
    fn evaluator_matches_hand_computation() {
        let metrics = RodEvaluator.evaluate(&seed(), &params(10.0)).expect("evaluate");
        // weight 0.8, stress 12.5, penalty 30*3 + 30*11.5
        let cost = 0.8 + 0.5 * 12.5 + 0.05 + 90.0 + 345.0;
        assert!((metrics.score + cost).abs() < 1e-9);
        assert!(!metrics.feasible);
        assert_eq!(metrics.extras.get("length"), Some(&1.0));
    }

    #[test]
    fn evaluator_rejects_unknown_material() {
        let graph = Graph::new()
            .with_node(
                Node::new("seg1", SEGMENT)
                    .with_prop("length", 1.0)
                    .with_prop("thickness", 1.0)
                    .with_prop("material", "wood"),
            )
            .expect("graph");
        let result = RodEvaluator.evaluate(&graph, &params(10.0));
        assert!(matches!(result, Err(EvaluatorError::Malformed(_))));
    }

    #[test]
    fn add_segment_links_to_rod() {
        let next = apply(add_segment, &seed(), &[]).expect("add");
        let seg2 = NodeId::new("seg2");
        assert_eq!(next.number(&seg2, "length"), Some(0.8));
        assert_eq!(next.neighbors(&NodeId::new(ROD_ID), Some("has")).len(), 2);
    }

    #[test]
    fn adaptive_fix_lengthens_shortest() {
        let next = apply(
            adaptive_fix,
            &seed(),
            &[("mode", text("length")), ("alpha", EditArg::Value(0.5.into()))],
        )
        .expect("fix");
        assert_eq!(next.number(&NodeId::new("seg1"), "length"), Some(2.5));
    }

    #[test]
    fn adaptive_fix_declines_when_target_met() {
        let long = seed_rod(5.0, 0.8, Material::Aluminum).expect("seed");
        let result = apply(adaptive_fix, &long, &[("mode", text("length"))]);
        assert!(matches!(result, Err(InvalidEdit::Precondition(_))));
    }

    #[test]
    fn swap_material_toggles() {
        let next = apply(swap_material, &seed(), &[("node", text("seg1"))]).expect("swap");
        assert_eq!(
            next.prop(&NodeId::new("seg1"), "material"),
            Some(&PropValue::from("steel"))
        );
    }

    #[test]
    fn rule_graph_compiles_and_improves_seed() {
        let rules = compile(&rule_graph(), &registry()).expect("compile");
        assert_eq!(rules.len(), 8);

        let evaluator = RodEvaluator;
        let engine =
            SearchEngine::new(&rules, &evaluator, SearchConfig::new(4, 4)).expect("engine");
        let seed = seed();
        let before = evaluator.evaluate(&seed, &params(10.0)).expect("seed").score;
        let outcome = engine
            .run(
                &seed,
                &params(10.0),
                &rule_graph().initial_guard_set(),
                &RunInfo::new("test", DOMAIN),
                &NullSink,
            )
            .expect("run");
        assert!(outcome.best.metrics.score > before);
    }

    #[test]
    fn length_guard_blocks_long_segments() {
        let rules = compile(&rule_graph(), &registry()).expect("compile");
        let increase = rules.rules().iter().find(|r| r.name() == "IncreaseLength");
        let increase = increase.expect("IncreaseLength");
        let long = seed_rod(2.5, 0.8, Material::Aluminum).expect("seed");
        let guards = GuardSet::initial(
            BTreeMap::from([(MAX_LENGTH.to_string(), DEFAULT_MAX_LENGTH)]),
            "test",
        );
        assert!(increase.apply(&long, &guards).is_empty());
        assert_eq!(increase.apply(&seed(), &guards).len(), 1);
    }

    #[test]
    fn golden_suite_has_four_rods() {
        let suite = golden_suite(SearchConfig::new(2, 2)).expect("suite");
        assert_eq!(suite.len(), 4);
        assert_eq!(suite.scenarios[2].params.weight("load", 0.0), 11.0);
    }
}
