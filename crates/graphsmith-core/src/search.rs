//! # Beam Search Engine
//!
//! Expands a seed design with compiled rules, one depth at a time.
//!
//! ## Per-Depth Cycle
//!
//! 1. Stop check (`StopWhen` on the global best), then budget check
//!    (expansions generated so far, wall time)
//! 2. Expand every (beam member x rule) attempt
//! 3. Deduplicate candidates by fingerprint, first occurrence wins
//! 4. Score unique candidates, memoised by fingerprint for the whole run
//! 5. Select the top `beam_width` by score, ties broken by `TieBreak`
//! 6. Append one provenance record per attempt, in attempt order
//!
//! Steps 2 and 4 run on a rayon pool when `parallelism > 1`. Results are
//! always re-assembled by index, so the outcome and the provenance stream
//! are identical for every `parallelism`.

use crate::compiler::{Candidate, CompiledRuleSet};
use crate::eval::{EvalParams, Evaluator, Metrics, evaluate_checked};
use crate::graph::Graph;
use crate::guards::GuardSet;
use crate::primitives::{DEFAULT_BEAM_WIDTH, DEFAULT_MAX_DEPTH};
use crate::provenance::{ProvenanceRecord, ProvenanceSink};
use crate::{EvaluatorError, Fingerprint, GraphsmithError};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;

// =============================================================================
// CONFIGURATION
// =============================================================================

/// Secondary ordering among candidates with equal scores.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TieBreak {
    /// Rule registration index, then parent beam index, then fingerprint.
    #[default]
    RuleThenParent,
    /// Parent beam index, then rule registration index, then fingerprint.
    ParentThenRule,
    FingerprintOnly,
}

/// Resource limits, checked at depth boundaries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Budget {
    /// Total candidates generated across the run.
    #[serde(default)]
    pub max_expansions: Option<u64>,
    #[serde(default)]
    pub max_millis: Option<u64>,
}

/// Early-stop predicate on the global best, checked at depth boundaries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopWhen {
    #[default]
    Never,
    /// Stop once the best design is feasible.
    Feasible,
}

impl StopWhen {
    #[must_use]
    pub fn satisfied_by(self, metrics: &Metrics) -> bool {
        match self {
            Self::Never => false,
            Self::Feasible => metrics.feasible,
        }
    }
}

fn default_beam_width() -> usize {
    DEFAULT_BEAM_WIDTH
}

fn default_max_depth() -> usize {
    DEFAULT_MAX_DEPTH
}

fn default_parallelism() -> usize {
    1
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchConfig {
    #[serde(default = "default_beam_width")]
    pub beam_width: usize,
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
    #[serde(default)]
    pub tie_break: TieBreak,
    #[serde(default)]
    pub budget: Budget,
    /// Worker threads for expansion and scoring. 1 runs inline.
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
    #[serde(default)]
    pub stop_when: StopWhen,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            beam_width: DEFAULT_BEAM_WIDTH,
            max_depth: DEFAULT_MAX_DEPTH,
            tie_break: TieBreak::default(),
            budget: Budget::default(),
            parallelism: 1,
            stop_when: StopWhen::default(),
        }
    }
}

impl SearchConfig {
    #[must_use]
    pub fn new(beam_width: usize, max_depth: usize) -> Self {
        Self {
            beam_width,
            max_depth,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_tie_break(mut self, tie_break: TieBreak) -> Self {
        self.tie_break = tie_break;
        self
    }

    #[must_use]
    pub fn with_budget(mut self, budget: Budget) -> Self {
        self.budget = budget;
        self
    }

    #[must_use]
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism;
        self
    }

    #[must_use]
    pub fn with_stop_when(mut self, stop_when: StopWhen) -> Self {
        self.stop_when = stop_when;
        self
    }

    pub fn validate(&self) -> Result<(), GraphsmithError> {
        if self.beam_width == 0 {
            return Err(GraphsmithError::InvalidConfig(
                "beam_width must be at least 1".to_string(),
            ));
        }
        if self.parallelism == 0 {
            return Err(GraphsmithError::InvalidConfig(
                "parallelism must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Labels copied into every provenance record of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunInfo {
    pub run_id: String,
    pub domain: String,
}

impl RunInfo {
    #[must_use]
    pub fn new(run_id: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            domain: domain.into(),
        }
    }
}

// =============================================================================
// OUTCOME
// =============================================================================

/// The best design a run found.
#[derive(Debug, Clone)]
pub struct BestDesign {
    pub graph: Graph,
    pub metrics: Metrics,
    pub guard_set_version: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    /// A depth produced no candidates.
    Exhausted,
    /// The budget was reached at a depth boundary.
    BudgetExhausted,
    /// Every candidate of a depth failed evaluation.
    EvaluationFailed,
    /// The global best met the `StopWhen` predicate.
    Satisfied,
    MaxDepth,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchStats {
    pub attempts: u64,
    pub candidates: u64,
    /// Evaluator invocations, the seed included.
    pub evaluated: u64,
    pub cache_hits: u64,
    pub pruned_errors: u64,
}

#[derive(Debug, Clone)]
pub struct BeamMember {
    pub graph: Graph,
    pub metrics: Metrics,
    pub fingerprint: Fingerprint,
}

#[derive(Debug, Clone)]
pub struct SearchOutcome {
    pub best: BestDesign,
    /// The final beam, best first.
    pub beam: Vec<BeamMember>,
    pub depth_reached: usize,
    pub termination: Termination,
    pub stats: SearchStats,
    /// Global best score after the seed and after every completed depth.
    pub best_history: Vec<f64>,
}

// =============================================================================
// ENGINE
// =============================================================================

/// One unique candidate of a depth.
struct PoolEntry {
    parent: usize,
    rule: usize,
    graph: Graph,
    fingerprint: Fingerprint,
}

/// A generated candidate, before deduplication.
struct Generated {
    attempt: usize,
    candidate: Candidate,
    fingerprint: Fingerprint,
}

type Scored = Result<Metrics, EvaluatorError>;

/// Runs beam searches over one compiled rule set and evaluator.
pub struct SearchEngine<'a> {
    rules: &'a CompiledRuleSet,
    evaluator: &'a dyn Evaluator,
    config: SearchConfig,
    pool: Option<rayon::ThreadPool>,
}

impl std::fmt::Debug for SearchEngine<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchEngine")
            .field("rules", &self.rules.name())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<'a> SearchEngine<'a> {
    pub fn new(
        rules: &'a CompiledRuleSet,
        evaluator: &'a dyn Evaluator,
        config: SearchConfig,
    ) -> Result<Self, GraphsmithError> {
        config.validate()?;
        let pool = if config.parallelism > 1 {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(config.parallelism)
                .thread_name(|i| format!("graphsmith-search-{i}"))
                .build()
                .map_err(|e| GraphsmithError::InvalidConfig(e.to_string()))?;
            Some(pool)
        } else {
            None
        };
        Ok(Self {
            rules,
            evaluator,
            config,
            pool,
        })
    }

    #[must_use]
    pub fn config(&self) -> &SearchConfig {
        &self.config
    }

    /// Map in input order, on the pool when there is one.
    fn map_ordered<T, R, F>(&self, items: &[T], f: F) -> Vec<R>
    where
        T: Sync,
        R: Send,
        F: Fn(&T) -> R + Sync + Send,
    {
        match &self.pool {
            Some(pool) => pool.install(|| items.par_iter().map(&f).collect()),
            None => items.iter().map(f).collect(),
        }
    }

    fn budget_reached(&self, stats: &SearchStats, started: Instant) -> bool {
        let budget = &self.config.budget;
        if budget.max_expansions.is_some_and(|max| stats.candidates >= max) {
            return true;
        }
        budget
            .max_millis
            .is_some_and(|max| started.elapsed().as_millis() >= u128::from(max))
    }

    fn rank(&self, a: &PoolEntry, a_score: f64, b: &PoolEntry, b_score: f64) -> Ordering {
        b_score.total_cmp(&a_score).then_with(|| match self.config.tie_break {
            TieBreak::RuleThenParent => {
                (a.rule, a.parent, a.fingerprint).cmp(&(b.rule, b.parent, b.fingerprint))
            }
            TieBreak::ParentThenRule => {
                (a.parent, a.rule, a.fingerprint).cmp(&(b.parent, b.rule, b.fingerprint))
            }
            TieBreak::FingerprintOnly => a.fingerprint.cmp(&b.fingerprint),
        })
    }

    /// Search from `seed` under a captured guard set.
    ///
    /// Fails only if the seed cannot be evaluated or a provenance append
    /// fails for good. Everything else ends the run with a `Termination`.
    pub fn run(
        &self,
        seed: &Graph,
        params: &EvalParams,
        guards: &GuardSet,
        info: &RunInfo,
        sink: &dyn ProvenanceSink,
    ) -> Result<SearchOutcome, GraphsmithError> {
        let span = tracing::info_span!(
            "search",
            run_id = %info.run_id,
            domain = %info.domain,
            guard_set = guards.version
        );
        let _enter = span.enter();
        let started = Instant::now();

        let seed_metrics = evaluate_checked(self.evaluator, seed, params)?;
        let seed_fingerprint = seed.fingerprint();

        let mut stats = SearchStats {
            evaluated: 1,
            ..SearchStats::default()
        };
        let mut cache: BTreeMap<Fingerprint, Scored> = BTreeMap::new();
        cache.insert(seed_fingerprint, Ok(seed_metrics.clone()));

        let mut best = BestDesign {
            graph: seed.clone(),
            metrics: seed_metrics.clone(),
            guard_set_version: guards.version,
        };
        let mut best_history = vec![seed_metrics.score];
        let mut beam = vec![BeamMember {
            graph: seed.clone(),
            metrics: seed_metrics,
            fingerprint: seed_fingerprint,
        }];
        let mut depth_reached = 0;
        let mut termination = Termination::MaxDepth;

        for depth in 1..=self.config.max_depth {
            if self.config.stop_when.satisfied_by(&best.metrics) {
                tracing::info!(depth, "stop condition met");
                termination = Termination::Satisfied;
                break;
            }
            if self.budget_reached(&stats, started) {
                tracing::info!(depth, "budget reached");
                termination = Termination::BudgetExhausted;
                break;
            }

            // Expansion.
            let attempts: Vec<(usize, usize)> = (0..beam.len())
                .flat_map(|p| (0..self.rules.len()).map(move |r| (p, r)))
                .collect();
            let expansions: Vec<Vec<Candidate>> = self.map_ordered(&attempts, |&(p, r)| {
                self.rules
                    .get(r)
                    .map(|rule| rule.apply(&beam[p].graph, guards))
                    .unwrap_or_default()
            });
            stats.attempts += attempts.len() as u64;

            let flat: Vec<(usize, Candidate)> = expansions
                .into_iter()
                .enumerate()
                .flat_map(|(a, cands)| cands.into_iter().map(move |c| (a, c)))
                .collect();
            stats.candidates += flat.len() as u64;
            let fingerprints = self.map_ordered(&flat, |(_, c)| c.graph.fingerprint());
            let generated: Vec<Generated> = flat
                .into_iter()
                .zip(fingerprints)
                .map(|((attempt, candidate), fingerprint)| Generated {
                    attempt,
                    candidate,
                    fingerprint,
                })
                .collect();

            // Deduplication.
            let mut seen = BTreeSet::new();
            let mut pool: Vec<PoolEntry> = Vec::new();
            for g in &generated {
                if seen.insert(g.fingerprint) {
                    let (parent, rule) = attempts[g.attempt];
                    pool.push(PoolEntry {
                        parent,
                        rule,
                        graph: g.candidate.graph.clone(),
                        fingerprint: g.fingerprint,
                    });
                }
            }

            // Scoring.
            let fresh: Vec<usize> = (0..pool.len())
                .filter(|&i| !cache.contains_key(&pool[i].fingerprint))
                .collect();
            let scores = self.map_ordered(&fresh, |&i| {
                evaluate_checked(self.evaluator, &pool[i].graph, params)
            });
            stats.evaluated += fresh.len() as u64;
            stats.cache_hits += (pool.len() - fresh.len()) as u64;
            for (&i, scored) in fresh.iter().zip(scores) {
                if let Err(e) = &scored {
                    tracing::warn!(
                        depth,
                        fingerprint = %pool[i].fingerprint,
                        error = %e,
                        "candidate pruned"
                    );
                }
                cache.insert(pool[i].fingerprint, scored);
            }

            // Selection.
            let mut ranked: Vec<(usize, f64)> = Vec::with_capacity(pool.len());
            for (i, entry) in pool.iter().enumerate() {
                match cache.get(&entry.fingerprint) {
                    Some(Ok(m)) => ranked.push((i, m.score)),
                    _ => stats.pruned_errors += 1,
                }
            }
            ranked.sort_by(|&(a, sa), &(b, sb)| self.rank(&pool[a], sa, &pool[b], sb));
            ranked.truncate(self.config.beam_width);

            let selected: BTreeSet<Fingerprint> =
                ranked.iter().map(|&(i, _)| pool[i].fingerprint).collect();

            let outcome = if pool.is_empty() {
                Some(Termination::Exhausted)
            } else if ranked.is_empty() {
                Some(Termination::EvaluationFailed)
            } else {
                None
            };

            let next_beam: Vec<BeamMember> = ranked
                .iter()
                .filter_map(|&(i, _)| {
                    let entry = &pool[i];
                    match cache.get(&entry.fingerprint) {
                        Some(Ok(metrics)) => Some(BeamMember {
                            graph: entry.graph.clone(),
                            metrics: metrics.clone(),
                            fingerprint: entry.fingerprint,
                        }),
                        _ => None,
                    }
                })
                .collect();

            self.write_records(
                sink,
                info,
                guards,
                depth,
                &beam,
                &attempts,
                &generated,
                &cache,
                &selected,
            )?;

            if let Some(stop) = outcome {
                tracing::info!(depth, termination = ?stop, "search stopped");
                termination = stop;
                break;
            }

            if let Some(leader) = next_beam.first()
                && leader.metrics.score > best.metrics.score
            {
                best = BestDesign {
                    graph: leader.graph.clone(),
                    metrics: leader.metrics.clone(),
                    guard_set_version: guards.version,
                };
            }
            best_history.push(best.metrics.score);
            beam = next_beam;
            depth_reached = depth;

            tracing::debug!(
                depth,
                beam = beam.len(),
                pool = pool.len(),
                best = best.metrics.score,
                "depth complete"
            );
        }
        if termination == Termination::MaxDepth && self.config.stop_when.satisfied_by(&best.metrics)
        {
            termination = Termination::Satisfied;
        }

        tracing::info!(
            depth_reached,
            termination = ?termination,
            best = best.metrics.score,
            evaluated = stats.evaluated,
            "search finished"
        );

        Ok(SearchOutcome {
            best,
            beam,
            depth_reached,
            termination,
            stats,
            best_history,
        })
    }

    /// One record per attempt, in attempt order.
    fn write_records(
        &self,
        sink: &dyn ProvenanceSink,
        info: &RunInfo,
        guards: &GuardSet,
        depth: usize,
        beam: &[BeamMember],
        attempts: &[(usize, usize)],
        generated: &[Generated],
        cache: &BTreeMap<Fingerprint, Scored>,
        selected: &BTreeSet<Fingerprint>,
    ) -> Result<(), GraphsmithError> {
        let mut by_attempt: Vec<Vec<&Generated>> = vec![Vec::new(); attempts.len()];
        for g in generated {
            by_attempt[g.attempt].push(g);
        }

        for (attempt, &(parent, rule_index)) in attempts.iter().enumerate() {
            let Some(rule) = self.rules.get(rule_index) else {
                continue;
            };
            let member = &beam[parent];
            let own = &by_attempt[attempt];

            // Best scored candidate of the attempt, preferring one that entered
            // the next beam; ties to the lowest fingerprint. Duplicates count
            // as the attempt's own candidates.
            let mut chosen: Option<(&Generated, &Metrics)> = None;
            let mut first_error: Option<String> = None;
            for &g in own {
                match cache.get(&g.fingerprint) {
                    Some(Ok(m)) => {
                        let in_beam = selected.contains(&g.fingerprint);
                        let better = chosen.is_none_or(|(c, cm)| {
                            let c_in_beam = selected.contains(&c.fingerprint);
                            (in_beam, m.score) > (c_in_beam, cm.score)
                                || (in_beam == c_in_beam
                                    && m.score == cm.score
                                    && g.fingerprint < c.fingerprint)
                        });
                        if better {
                            chosen = Some((g, m));
                        }
                    }
                    Some(Err(e)) => {
                        if first_error.is_none() {
                            first_error = Some(e.to_string());
                        }
                    }
                    None => {}
                }
            }

            let (child, metrics_after, error) = match chosen {
                Some((g, m)) => (Some(g), Some(m.clone()), None),
                None => (own.first().copied(), None, first_error),
            };
            let observations = child
                .map(|g| g.candidate.meta.observations.clone())
                .unwrap_or_default();

            let record = ProvenanceRecord {
                sequence: 0,
                run_id: info.run_id.clone(),
                domain: info.domain.clone(),
                depth,
                rule_index,
                rule_id: rule.id().clone(),
                rule_version: rule.version(),
                guard_set_version: guards.version,
                parent_fingerprint: member.fingerprint,
                child_fingerprint: child.map(|g| g.fingerprint),
                metrics_before: member.metrics.clone(),
                metrics_after,
                accepted: child.is_some_and(|g| selected.contains(&g.fingerprint)),
                error,
                candidates: own.len(),
                observations,
            };
            sink.append(record)?;
        }
        Ok(())
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::compile;
    use crate::eval::FnEvaluator;
    use crate::graph::Node;
    use crate::handlers::HandlerRegistry;
    use crate::pattern::Pattern;
    use crate::provenance::{NullSink, ProvenanceFilter, ProvenanceRegistry};
    use crate::rule::{EditStep, RuleGraph, RuleSpec};
    use crate::storage::MemoryStore;
    use crate::NodeId;

    /// One counter node; `Inc` adds 1 to `n`, `Dec` subtracts 1.
    fn counter_rules() -> CompiledRuleSet {
        let pattern = Pattern::new().var("c", "Counter");
        let rules = RuleGraph::new("counter")
            .rule(
                RuleSpec::new("inc", "Inc")
                    .trigger(pattern.clone())
                    .step(
                        EditStep::new("increment_prop")
                            .var("node", "c")
                            .value("key", "n")
                            .value("delta", 1.0),
                    ),
            )
            .rule(
                RuleSpec::new("dec", "Dec").trigger(pattern).step(
                    EditStep::new("increment_prop")
                        .var("node", "c")
                        .value("key", "n")
                        .value("delta", -1.0),
                ),
            );
        compile(&rules, &HandlerRegistry::standard()).expect("compile")
    }

    fn seed() -> Graph {
        Graph::new()
            .with_node(Node::new("c", "Counter").with_prop("n", 0.0))
            .expect("seed")
    }

    fn by_n() -> FnEvaluator<impl Fn(&Graph, &EvalParams) -> Result<Metrics, EvaluatorError>> {
        FnEvaluator::new(|g: &Graph, _: &EvalParams| {
            let n = g.number(&NodeId::new("c"), "n").unwrap_or(0.0);
            Ok(Metrics::new(n))
        })
    }

    fn guards() -> GuardSet {
        GuardSet::initial(BTreeMap::new(), "test")
    }

    #[test]
    fn climbs_to_max_depth() {
        let rules = counter_rules();
        let evaluator = by_n();
        let engine =
            SearchEngine::new(&rules, &evaluator, SearchConfig::new(2, 3)).expect("engine");
        let outcome = engine
            .run(&seed(), &EvalParams::new(), &guards(), &RunInfo::new("r", "t"), &NullSink)
            .expect("run");
        assert_eq!(outcome.termination, Termination::MaxDepth);
        assert_eq!(outcome.depth_reached, 3);
        assert_eq!(outcome.best.metrics.score, 3.0);
        assert_eq!(outcome.best_history, vec![0.0, 1.0, 2.0, 3.0]);
        assert!(outcome.beam.len() <= 2);
    }

    #[test]
    fn zero_depth_returns_seed() {
        let rules = counter_rules();
        let evaluator = by_n();
        let engine =
            SearchEngine::new(&rules, &evaluator, SearchConfig::new(2, 0)).expect("engine");
        let outcome = engine
            .run(&seed(), &EvalParams::new(), &guards(), &RunInfo::new("r", "t"), &NullSink)
            .expect("run");
        assert_eq!(outcome.depth_reached, 0);
        assert_eq!(outcome.termination, Termination::MaxDepth);
        assert!(outcome.best.graph.structurally_eq(&seed()));
    }

    #[test]
    fn budget_stops_at_depth_boundary() {
        let rules = counter_rules();
        let evaluator = by_n();
        let config = SearchConfig::new(2, 10).with_budget(Budget {
            max_expansions: Some(3),
            max_millis: None,
        });
        let engine = SearchEngine::new(&rules, &evaluator, config).expect("engine");
        let outcome = engine
            .run(&seed(), &EvalParams::new(), &guards(), &RunInfo::new("r", "t"), &NullSink)
            .expect("run");
        assert_eq!(outcome.termination, Termination::BudgetExhausted);
        // Depth 1 generates 2 candidates, depth 2 generates 4.
        assert_eq!(outcome.depth_reached, 2);
        assert_eq!(outcome.stats.candidates, 6);
    }

    #[test]
    fn seed_evaluation_failure_is_fatal_and_unrecorded() {
        let rules = counter_rules();
        let evaluator = FnEvaluator::new(|_: &Graph, _: &EvalParams| {
            Err(EvaluatorError::Malformed("no".to_string()))
        });
        let engine =
            SearchEngine::new(&rules, &evaluator, SearchConfig::new(2, 2)).expect("engine");
        let registry = ProvenanceRegistry::new(MemoryStore::new()).expect("registry");
        let result = engine.run(
            &seed(),
            &EvalParams::new(),
            &guards(),
            &RunInfo::new("r", "t"),
            &registry,
        );
        assert!(matches!(result, Err(GraphsmithError::Evaluator(_))));
        assert_eq!(registry.read(ProvenanceFilter::all()).count(), 0);
    }

    #[test]
    fn all_candidates_failing_keeps_previous_best() {
        let rules = counter_rules();
        let evaluator = FnEvaluator::new(|g: &Graph, _: &EvalParams| {
            let n = g.number(&NodeId::new("c"), "n").unwrap_or(0.0);
            if n == 0.0 {
                Ok(Metrics::new(0.0))
            } else {
                Err(EvaluatorError::Malformed("off seed".to_string()))
            }
        });
        let engine =
            SearchEngine::new(&rules, &evaluator, SearchConfig::new(2, 3)).expect("engine");
        let registry = ProvenanceRegistry::new(MemoryStore::new()).expect("registry");
        let outcome = engine
            .run(&seed(), &EvalParams::new(), &guards(), &RunInfo::new("r", "t"), &registry)
            .expect("run");
        assert_eq!(outcome.termination, Termination::EvaluationFailed);
        assert_eq!(outcome.best.metrics.score, 0.0);
        assert_eq!(outcome.stats.pruned_errors, 2);

        let records: Vec<_> = registry
            .read(ProvenanceFilter::all())
            .collect::<Result<_, _>>()
            .expect("read");
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| !r.accepted && r.error.is_some()));
    }

    #[test]
    fn one_record_per_attempt() {
        let rules = counter_rules();
        let evaluator = by_n();
        let engine =
            SearchEngine::new(&rules, &evaluator, SearchConfig::new(2, 2)).expect("engine");
        let registry = ProvenanceRegistry::new(MemoryStore::new()).expect("registry");
        let outcome = engine
            .run(&seed(), &EvalParams::new(), &guards(), &RunInfo::new("r", "t"), &registry)
            .expect("run");
        let records: Vec<_> = registry
            .read(ProvenanceFilter::all())
            .collect::<Result<_, _>>()
            .expect("read");
        assert_eq!(records.len() as u64, outcome.stats.attempts);
        // Depth 1: seed x {inc, dec}; depth 2: two members x {inc, dec}.
        assert_eq!(records.len(), 6);
        let inc = &records[0];
        assert_eq!(inc.rule_id.as_str(), "inc");
        assert!(inc.accepted);
        assert_eq!(inc.delta(), Some(1.0));
        assert_eq!(inc.observations.get("c.n"), Some(&0.0));
    }

    #[test]
    fn duplicates_are_scored_once() {
        let rules = counter_rules();
        let evaluator = by_n();
        let engine =
            SearchEngine::new(&rules, &evaluator, SearchConfig::new(2, 2)).expect("engine");
        let outcome = engine
            .run(&seed(), &EvalParams::new(), &guards(), &RunInfo::new("r", "t"), &NullSink)
            .expect("run");
        // Depth 2 regenerates the seed twice (inc then dec, dec then inc).
        assert!(outcome.stats.cache_hits >= 1);
        assert_eq!(outcome.stats.evaluated, 1 + 2 + 2);
    }

    #[test]
    fn stops_once_best_is_feasible() {
        let rules = counter_rules();
        let evaluator = FnEvaluator::new(|g: &Graph, _: &EvalParams| {
            let n = g.number(&NodeId::new("c"), "n").unwrap_or(0.0);
            Ok(Metrics::new(n).feasible(n >= 2.0))
        });
        let config = SearchConfig::new(2, 10).with_stop_when(StopWhen::Feasible);
        let engine = SearchEngine::new(&rules, &evaluator, config).expect("engine");
        let outcome = engine
            .run(&seed(), &EvalParams::new(), &guards(), &RunInfo::new("r", "t"), &NullSink)
            .expect("run");
        assert_eq!(outcome.termination, Termination::Satisfied);
        assert_eq!(outcome.depth_reached, 2);
        assert_eq!(outcome.best.metrics.score, 2.0);
        assert_eq!(outcome.best_history, vec![0.0, 1.0, 2.0]);
    }

    #[test]
    fn feasible_seed_is_not_expanded() {
        let rules = counter_rules();
        let evaluator = by_n();
        let config = SearchConfig::new(2, 5).with_stop_when(StopWhen::Feasible);
        let engine = SearchEngine::new(&rules, &evaluator, config).expect("engine");
        let outcome = engine
            .run(&seed(), &EvalParams::new(), &guards(), &RunInfo::new("r", "t"), &NullSink)
            .expect("run");
        assert_eq!(outcome.termination, Termination::Satisfied);
        assert_eq!(outcome.depth_reached, 0);
        assert_eq!(outcome.stats.attempts, 0);
    }

    #[test]
    fn stop_when_defaults_to_never() {
        assert_eq!(SearchConfig::default().stop_when, StopWhen::Never);
        let config: SearchConfig = serde_json::from_str(r#"{"stop_when":"feasible"}"#)
            .expect("parse");
        assert_eq!(config.stop_when, StopWhen::Feasible);
    }

    #[test]
    fn duplicate_child_in_beam_is_accepted() {
        let rules = counter_rules();
        let evaluator = by_n();
        let engine =
            SearchEngine::new(&rules, &evaluator, SearchConfig::new(2, 2)).expect("engine");
        let registry = ProvenanceRegistry::new(MemoryStore::new()).expect("registry");
        let outcome = engine
            .run(&seed(), &EvalParams::new(), &guards(), &RunInfo::new("r", "t"), &registry)
            .expect("run");
        let records: Vec<_> = registry
            .read(ProvenanceFilter::all())
            .collect::<Result<_, _>>()
            .expect("read");

        // Depth 2 beam is [n=1, n=-1]; (n=1, dec) and (n=-1, inc) both yield n=0.
        let up_then_down = &records[3];
        let down_then_up = &records[4];
        assert_eq!(down_then_up.child_fingerprint, up_then_down.child_fingerprint);
        assert!(up_then_down.accepted);
        assert!(down_then_up.accepted);
        assert!(!records[5].accepted);

        let beam: BTreeSet<Fingerprint> = outcome.beam.iter().map(|m| m.fingerprint).collect();
        for record in records.iter().filter(|r| r.depth == 2) {
            let in_beam = record
                .child_fingerprint
                .is_some_and(|f| beam.contains(&f));
            assert_eq!(record.accepted, in_beam);
        }
    }

    #[test]
    fn zero_beam_width_is_rejected() {
        let rules = counter_rules();
        let evaluator = by_n();
        let result = SearchEngine::new(&rules, &evaluator, SearchConfig::new(0, 2));
        assert!(matches!(result, Err(GraphsmithError::InvalidConfig(_))));
    }
}
