//! # Property-Based Tests
//!
//! Determinism and safety invariants of rule application and search,
//! checked with proptest over small random designs.

use graphsmith_core::{
    CompiledRuleSet, EditStep, EvalParams, EvaluatorError, FnEvaluator, Graph, GuardClause,
    GuardSet, HandlerRegistry, MemoryStore, Metrics, Node, NodeId, Pattern, ProvenanceFilter,
    ProvenanceRecord, ProvenanceRegistry, RuleGraph, RuleSpec, RunInfo, SearchConfig,
    SearchEngine, SearchOutcome, compile, export_graph, import_graph,
};
use proptest::collection::vec;
use proptest::prelude::*;
use std::collections::BTreeMap;

// =============================================================================
// FIXTURES
// =============================================================================

/// Cells with a numeric `v`; `cap` bounds the `bump` rule.
fn cells(values: &[f64]) -> Graph {
    let mut graph = Graph::new();
    for (i, v) in values.iter().enumerate() {
        graph
            .insert_node(Node::new(format!("c{i}"), "Cell").with_prop("v", *v))
            .expect("insert cell");
    }
    graph
}

fn cell_rules() -> CompiledRuleSet {
    let rules = RuleGraph::new("cells")
        .threshold("cap", 6.0)
        .rule(
            RuleSpec::new("bump", "Bump")
                .trigger(Pattern::new().var("c", "Cell"))
                .guard(GuardClause::below_threshold("c", "v", "cap"))
                .step(
                    EditStep::new("increment_prop")
                        .var("node", "c")
                        .value("key", "v")
                        .value("delta", 1.0),
                ),
        )
        .rule(
            RuleSpec::new("halve", "Halve")
                .trigger(Pattern::new().var("c", "Cell"))
                .step(
                    EditStep::new("increment_prop")
                        .var("node", "c")
                        .value("key", "v")
                        .value("delta", -0.5),
                ),
        )
        .rule(
            RuleSpec::new("prune", "Prune").step(
                EditStep::new("remove_arg_min")
                    .value("kind", "Cell")
                    .value("key", "v")
                    .value("min_keep", 1.0),
            ),
        );
    compile(&rules, &HandlerRegistry::standard()).expect("compile")
}

fn guards() -> GuardSet {
    GuardSet::initial(BTreeMap::from([("cap".to_string(), 6.0)]), "test")
}

fn search(seed: &Graph, config: SearchConfig) -> (SearchOutcome, Vec<ProvenanceRecord>) {
    let rules = cell_rules();
    // Rewards a high total with few cells.
    let evaluator = FnEvaluator::new(|graph: &Graph, _: &EvalParams| {
        let total: f64 = graph.find("Cell").filter_map(|n| n.number("v")).sum();
        Ok::<_, EvaluatorError>(Metrics::new(total - 0.75 * graph.node_count() as f64))
    });
    let engine = SearchEngine::new(&rules, &evaluator, config).expect("engine");
    let registry = ProvenanceRegistry::new(MemoryStore::new()).expect("registry");
    let outcome = engine
        .run(seed, &EvalParams::new(), &guards(), &RunInfo::new("prop", "cells"), &registry)
        .expect("run");
    let records = registry
        .read(ProvenanceFilter::all())
        .collect::<Result<Vec<_>, _>>()
        .expect("read");
    (outcome, records)
}

fn values() -> impl Strategy<Value = Vec<f64>> {
    vec((-8i32..8).prop_map(|v| f64::from(v) / 2.0), 1..4)
}

// =============================================================================
// PROPERTY TESTS
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    /// Applying a rule never changes its input graph.
    #[test]
    fn rule_application_is_pure(vals in values()) {
        let rules = cell_rules();
        let seed = cells(&vals);
        let before = seed.fingerprint();
        for rule in rules.rules() {
            let _ = rule.apply(&seed, &guards());
        }
        prop_assert_eq!(seed.fingerprint(), before);
    }

    /// The guard holds exactly when the bound value is below the threshold.
    #[test]
    fn guard_fires_iff_below_threshold(v in -20i32..20, cap in -20i32..20) {
        let seed = cells(&[f64::from(v)]);
        let guard_set = GuardSet::initial(
            BTreeMap::from([("cap".to_string(), f64::from(cap))]),
            "test",
        );
        let rules = cell_rules();
        let bump = rules.get(0).expect("bump");
        let fired = !bump.apply(&seed, &guard_set).is_empty();
        prop_assert_eq!(fired, v < cap);
    }

    /// Parallel expansion yields the same outcome and provenance as serial.
    #[test]
    fn parallelism_does_not_change_results(
        vals in values(),
        width in 1usize..4,
        depth in 1usize..4,
    ) {
        let seed = cells(&vals);
        let serial = search(&seed, SearchConfig::new(width, depth));
        let parallel = search(&seed, SearchConfig::new(width, depth).with_parallelism(4));

        prop_assert_eq!(serial.0.best.metrics.score, parallel.0.best.metrics.score);
        prop_assert_eq!(
            serial.0.best.graph.fingerprint(),
            parallel.0.best.graph.fingerprint()
        );
        prop_assert_eq!(serial.0.termination, parallel.0.termination);
        prop_assert_eq!(serial.1, parallel.1);
    }

    /// The beam never exceeds its width.
    #[test]
    fn beam_is_bounded(vals in values(), width in 1usize..4, depth in 0usize..4) {
        let (outcome, _) = search(&cells(&vals), SearchConfig::new(width, depth));
        prop_assert!(outcome.beam.len() <= width);
    }

    /// The global best never gets worse from one depth to the next.
    #[test]
    fn best_is_monotone(vals in values(), width in 1usize..4, depth in 0usize..5) {
        let (outcome, _) = search(&cells(&vals), SearchConfig::new(width, depth));
        prop_assert!(outcome.best_history.windows(2).all(|w| w[1] >= w[0]));
        let last = outcome.best_history.last().copied().expect("history");
        prop_assert_eq!(last, outcome.best.metrics.score);
    }

    /// Exactly one record per attempt, with strictly increasing sequences.
    #[test]
    fn provenance_is_complete(vals in values(), width in 1usize..4, depth in 1usize..4) {
        let (outcome, records) = search(&cells(&vals), SearchConfig::new(width, depth));
        prop_assert_eq!(records.len() as u64, outcome.stats.attempts);
        prop_assert!(records.windows(2).all(|w| w[0].sequence < w[1].sequence));
        prop_assert!(records.iter().all(|r| !r.accepted || r.child_fingerprint.is_some()));
    }

    /// Export and import preserve the fingerprint.
    #[test]
    fn export_preserves_fingerprint(vals in values()) {
        let graph = cells(&vals);
        let bytes = export_graph(&graph).expect("export");
        let back = import_graph(&bytes).expect("import");
        prop_assert_eq!(back.fingerprint(), graph.fingerprint());
        prop_assert!(back.node(&NodeId::new("c0")).is_some());
    }
}
