//! # Search Benchmarks
//!
//! Performance benchmarks for graphsmith-core rule application and search.
//!
//! Run with: `cargo bench -p graphsmith-core`

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use graphsmith_core::{
    CompiledRuleSet, EditStep, EvalParams, EvaluatorError, FnEvaluator, Graph, GuardSet,
    HandlerRegistry, Metrics, Node, NullSink, Pattern, RuleGraph, RuleSpec, RunInfo,
    SearchConfig, SearchEngine, compile,
};
use std::collections::BTreeMap;
use std::hint::black_box;

/// A chain of `size` segments linked head to tail.
fn create_chain(size: usize) -> Graph {
    let mut graph = Graph::new();
    for i in 0..size {
        graph
            .insert_node(
                Node::new(format!("s{i}"), "Segment")
                    .with_prop("length", 1.0)
                    .with_prop("thickness", 0.5),
            )
            .expect("insert");
        if i > 0 {
            graph
                .add_edge(&format!("s{}", i - 1).into(), &format!("s{i}").into(), "next")
                .expect("edge");
        }
    }
    graph
}

fn rules() -> CompiledRuleSet {
    let rule_graph = RuleGraph::new("bench")
        .rule(
            RuleSpec::new("thicken", "Thicken")
                .trigger(Pattern::new().var("x", "Segment"))
                .step(
                    EditStep::new("increment_prop")
                        .var("node", "x")
                        .value("key", "thickness")
                        .value("delta", 0.1),
                ),
        )
        .rule(
            RuleSpec::new("extend", "Extend")
                .trigger(
                    Pattern::new()
                        .var("a", "Segment")
                        .var("b", "Segment")
                        .edge("a", "b", Some("next")),
                )
                .step(
                    EditStep::new("increment_prop")
                        .var("node", "b")
                        .value("key", "length")
                        .value("delta", 0.25),
                ),
        );
    compile(&rule_graph, &HandlerRegistry::standard()).expect("compile")
}

// =============================================================================
// BENCHMARKS
// =============================================================================

fn bench_rule_application(c: &mut Criterion) {
    let mut group = c.benchmark_group("rule_application");
    let rules = rules();
    let guards = GuardSet::initial(BTreeMap::new(), "bench");

    for size in [4, 16, 64].iter() {
        let graph = create_chain(*size);
        group.bench_with_input(BenchmarkId::from_parameter(size), &graph, |b, graph| {
            b.iter(|| {
                let total: usize = rules
                    .rules()
                    .iter()
                    .map(|rule| rule.apply(black_box(graph), &guards).len())
                    .sum();
                black_box(total)
            });
        });
    }

    group.finish();
}

fn bench_search(c: &mut Criterion) {
    let mut group = c.benchmark_group("search");
    let rules = rules();
    let guards = GuardSet::initial(BTreeMap::new(), "bench");
    let evaluator = FnEvaluator::new(|graph: &Graph, _: &EvalParams| {
        let score: f64 = graph
            .find("Segment")
            .map(|n| n.number("length").unwrap_or(0.0) - n.number("thickness").unwrap_or(0.0))
            .sum();
        Ok::<_, EvaluatorError>(Metrics::new(score))
    });
    let seed = create_chain(8);

    for parallelism in [1, 4].iter() {
        let config = SearchConfig::new(8, 4).with_parallelism(*parallelism);
        let engine = SearchEngine::new(&rules, &evaluator, config).expect("engine");
        group.bench_with_input(
            BenchmarkId::new("parallelism", parallelism),
            &engine,
            |b, engine| {
                b.iter(|| {
                    let outcome = engine
                        .run(
                            black_box(&seed),
                            &EvalParams::new(),
                            &guards,
                            &RunInfo::new("bench", "bench"),
                            &NullSink,
                        )
                        .expect("run");
                    black_box(outcome.best.metrics.score)
                });
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_rule_application, bench_search);
criterion_main!(benches);
