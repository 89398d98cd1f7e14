//! # Builder-Builder
//!
//! The meta loop that tunes guard thresholds from provenance.
//!
//! ## Cycle
//!
//! 1. `UsageStats::collect` summarizes recorded rule applications
//! 2. Every `ProposalStrategy` turns the statistics into candidate guard sets
//! 3. Each proposal is validated against the golden suite
//! 4. The best passing proposal is published; every verdict is recorded
//!
//! A proposal passes only if the suite aggregate strictly improves, no
//! scenario drops by more than the tolerance and no scenario exhausts its
//! budget. Validation runs write no provenance.

use crate::compiler::CompiledRuleSet;
use crate::eval::{EvalParams, Evaluator};
use crate::graph::Graph;
use crate::guards::{ActiveGuards, GuardSet};
use crate::primitives::DEFAULT_REGRESSION_TOLERANCE;
use crate::provenance::{
    DecisionKind, MetaDecision, NullSink, ProvenanceRecord, ProvenanceSink, ScenarioRegression,
};
use crate::search::{RunInfo, SearchConfig, SearchEngine, Termination};
use crate::{Fingerprint, GraphsmithError, RuleId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

// =============================================================================
// USAGE STATISTICS
// =============================================================================

/// Streaming mean and variance (Welford).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RunningStats {
    count: u64,
    mean: f64,
    m2: f64,
}

impl RunningStats {
    pub fn push(&mut self, x: f64) {
        self.count += 1;
        let delta = x - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (x - self.mean);
    }

    #[must_use]
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Zero when empty.
    #[must_use]
    pub fn mean(&self) -> f64 {
        self.mean
    }

    /// Sample variance; zero below two samples.
    #[must_use]
    pub fn variance(&self) -> f64 {
        if self.count < 2 {
            0.0
        } else {
            self.m2 / (self.count - 1) as f64
        }
    }
}

/// How one rule fared across the recorded attempts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleUsage {
    pub attempts: u64,
    /// Attempts that produced at least one candidate.
    pub fired: u64,
    pub accepted: u64,
    /// Score delta parent -> child, over scored attempts.
    pub delta: RunningStats,
    /// Delta minus the mean delta of sibling attempts on the same parent.
    pub advantage: RunningStats,
    /// Observations of attempts with a positive delta, by `var.key`.
    pub improving: BTreeMap<String, Vec<f64>>,
}

impl RuleUsage {
    #[must_use]
    pub fn fire_rate(&self) -> f64 {
        if self.attempts == 0 {
            0.0
        } else {
            self.fired as f64 / self.attempts as f64
        }
    }

    #[must_use]
    pub fn acceptance_rate(&self) -> f64 {
        if self.fired == 0 {
            0.0
        } else {
            self.accepted as f64 / self.fired as f64
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageStats {
    pub records: u64,
    pub rules: BTreeMap<RuleId, RuleUsage>,
}

impl UsageStats {
    pub fn collect<'r>(records: impl IntoIterator<Item = &'r ProvenanceRecord>) -> Self {
        let mut stats = Self::default();
        // Siblings: attempts of one run, at one depth, on one parent.
        let mut siblings: BTreeMap<(&str, usize, Fingerprint), Vec<(&RuleId, f64)>> =
            BTreeMap::new();

        for record in records {
            stats.records += 1;
            let usage = stats.rules.entry(record.rule_id.clone()).or_default();
            usage.attempts += 1;
            if record.candidates > 0 {
                usage.fired += 1;
            }
            if record.accepted {
                usage.accepted += 1;
            }
            let Some(delta) = record.delta() else {
                continue;
            };
            usage.delta.push(delta);
            if delta > 0.0 {
                for (key, value) in &record.observations {
                    usage.improving.entry(key.clone()).or_default().push(*value);
                }
            }
            siblings
                .entry((
                    record.run_id.as_str(),
                    record.depth,
                    record.parent_fingerprint,
                ))
                .or_default()
                .push((&record.rule_id, delta));
        }

        for group in siblings.values() {
            if group.len() < 2 {
                continue;
            }
            let total: f64 = group.iter().map(|(_, d)| d).sum();
            let others = (group.len() - 1) as f64;
            for (rule_id, delta) in group {
                let mean_others = (total - delta) / others;
                if let Some(usage) = stats.rules.get_mut(*rule_id) {
                    usage.advantage.push(delta - mean_others);
                }
            }
        }
        stats
    }

    #[must_use]
    pub fn get(&self, rule_id: &RuleId) -> Option<&RuleUsage> {
        self.rules.get(rule_id)
    }
}

// =============================================================================
// PROPOSALS
// =============================================================================

/// A complete candidate threshold map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proposal {
    pub strategy: String,
    pub thresholds: BTreeMap<String, f64>,
    pub rationale: String,
}

/// Turns usage statistics into guard-set proposals.
pub trait ProposalStrategy: Send + Sync {
    fn name(&self) -> &str;

    /// Proposals derived from `stats`; each carries the full threshold map.
    fn propose(&self, stats: &UsageStats, active: &GuardSet) -> Vec<Proposal>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reducer {
    #[default]
    Median,
    Mean,
}

impl Reducer {
    fn reduce(self, samples: &[f64]) -> Option<f64> {
        if samples.is_empty() {
            return None;
        }
        match self {
            Self::Mean => Some(samples.iter().sum::<f64>() / samples.len() as f64),
            Self::Median => {
                let mut sorted = samples.to_vec();
                sorted.sort_by(f64::total_cmp);
                let mid = sorted.len() / 2;
                if sorted.len() % 2 == 0 {
                    Some((sorted[mid - 1] + sorted[mid]) / 2.0)
                } else {
                    Some(sorted[mid])
                }
            }
        }
    }
}

impl fmt::Display for Reducer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Median => f.write_str("median"),
            Self::Mean => f.write_str("mean"),
        }
    }
}

/// Sets a threshold from where a rule's improving applications happened.
///
/// Reduces the `key` observations of `rule`'s improving attempts and adds
/// `epsilon`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservedThreshold {
    pub rule: RuleId,
    pub key: String,
    pub threshold: String,
    #[serde(default)]
    pub reducer: Reducer,
    #[serde(default)]
    pub epsilon: f64,
}

impl ObservedThreshold {
    #[must_use]
    pub fn new(
        rule: impl Into<RuleId>,
        key: impl Into<String>,
        threshold: impl Into<String>,
    ) -> Self {
        Self {
            rule: rule.into(),
            key: key.into(),
            threshold: threshold.into(),
            reducer: Reducer::Median,
            epsilon: 0.0,
        }
    }

    #[must_use]
    pub fn reducer(mut self, reducer: Reducer) -> Self {
        self.reducer = reducer;
        self
    }

    #[must_use]
    pub fn epsilon(mut self, epsilon: f64) -> Self {
        self.epsilon = epsilon;
        self
    }
}

impl ProposalStrategy for ObservedThreshold {
    fn name(&self) -> &str {
        "observed_threshold"
    }

    fn propose(&self, stats: &UsageStats, active: &GuardSet) -> Vec<Proposal> {
        let Some(samples) = stats
            .get(&self.rule)
            .and_then(|usage| usage.improving.get(&self.key))
        else {
            return Vec::new();
        };
        let Some(reduced) = self.reducer.reduce(samples) else {
            return Vec::new();
        };
        let value = reduced + self.epsilon;
        if !value.is_finite() || active.get(&self.threshold) == Some(value) {
            return Vec::new();
        }
        let mut thresholds = active.thresholds.clone();
        thresholds.insert(self.threshold.clone(), value);
        vec![Proposal {
            strategy: self.name().to_string(),
            thresholds,
            rationale: format!(
                "{} of {} improving {} observations for {} is {:.4}; {} = {:.4}",
                self.reducer,
                samples.len(),
                self.key,
                self.rule,
                reduced,
                self.threshold,
                value
            ),
        }]
    }
}

/// Multiplies named thresholds by fixed factors, one proposal per factor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScaleSweep {
    pub thresholds: Vec<String>,
    pub factors: Vec<f64>,
}

impl ScaleSweep {
    #[must_use]
    pub fn new(thresholds: Vec<String>, factors: Vec<f64>) -> Self {
        Self {
            thresholds,
            factors,
        }
    }
}

impl ProposalStrategy for ScaleSweep {
    fn name(&self) -> &str {
        "scale_sweep"
    }

    fn propose(&self, _stats: &UsageStats, active: &GuardSet) -> Vec<Proposal> {
        self.factors
            .iter()
            .filter(|f| f.is_finite() && **f != 1.0)
            .filter_map(|&factor| {
                let mut thresholds = active.thresholds.clone();
                let mut scaled = Vec::new();
                for name in &self.thresholds {
                    if let Some(value) = thresholds.get_mut(name) {
                        *value *= factor;
                        scaled.push(name.as_str());
                    }
                }
                (!scaled.is_empty()).then(|| Proposal {
                    strategy: self.name().to_string(),
                    thresholds,
                    rationale: format!("scale {} by {factor}", scaled.join(", ")),
                })
            })
            .collect()
    }
}

// =============================================================================
// GOLDEN SUITE
// =============================================================================

/// A fixed seed with the search settings it is validated under.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GoldenScenario {
    pub id: String,
    pub seed: Graph,
    #[serde(default)]
    pub config: SearchConfig,
    #[serde(default)]
    pub params: EvalParams,
    /// Recorded best score; validation may not fall below it by more than the tolerance.
    #[serde(default)]
    pub baseline: Option<f64>,
}

impl GoldenScenario {
    #[must_use]
    pub fn new(id: impl Into<String>, seed: Graph, config: SearchConfig) -> Self {
        Self {
            id: id.into(),
            seed,
            config,
            params: EvalParams::default(),
            baseline: None,
        }
    }

    #[must_use]
    pub fn params(mut self, params: EvalParams) -> Self {
        self.params = params;
        self
    }

    #[must_use]
    pub fn baseline(mut self, baseline: f64) -> Self {
        self.baseline = Some(baseline);
        self
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GoldenSuite {
    pub scenarios: Vec<GoldenScenario>,
}

impl GoldenSuite {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn scenario(mut self, scenario: GoldenScenario) -> Self {
        self.scenarios.push(scenario);
        self
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.scenarios.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.scenarios.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioScore {
    pub id: String,
    pub score: f64,
    pub baseline: Option<f64>,
    pub budget_exhausted: bool,
}

/// Best score per scenario, in suite order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SuiteResult {
    pub scores: Vec<ScenarioScore>,
    pub aggregate: f64,
}

impl SuiteResult {
    /// Build from per-scenario scores; the aggregate is their sum.
    #[must_use]
    pub fn from_scores(scores: Vec<ScenarioScore>) -> Self {
        let aggregate = scores.iter().map(|s| s.score).sum();
        Self { scores, aggregate }
    }
}

/// Search every scenario under `guards`, recording nothing.
pub fn evaluate_suite(
    suite: &GoldenSuite,
    rules: &CompiledRuleSet,
    evaluator: &dyn Evaluator,
    guards: &GuardSet,
    domain: &str,
) -> Result<SuiteResult, GraphsmithError> {
    let mut scores = Vec::with_capacity(suite.len());
    for scenario in &suite.scenarios {
        let engine = SearchEngine::new(rules, evaluator, scenario.config)?;
        let info = RunInfo::new(format!("golden:{}", scenario.id), domain);
        let outcome = engine.run(&scenario.seed, &scenario.params, guards, &info, &NullSink)?;
        scores.push(ScenarioScore {
            id: scenario.id.clone(),
            score: outcome.best.metrics.score,
            baseline: scenario.baseline,
            budget_exhausted: outcome.termination == Termination::BudgetExhausted,
        });
    }
    Ok(SuiteResult::from_scores(scores))
}

/// Outcome of comparing a candidate suite result to the current one.
#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub accepted: bool,
    pub regressions: Vec<ScenarioRegression>,
    pub reason: String,
}

/// The regression gate.
///
/// `current` and `candidate` must list the same scenarios in the same order.
#[must_use]
pub fn judge(current: &SuiteResult, candidate: &SuiteResult, tolerance: f64) -> Verdict {
    let mut regressions = Vec::new();
    for (before, after) in current.scores.iter().zip(&candidate.scores) {
        let dropped = before.score - after.score > tolerance
            || after.baseline.is_some_and(|b| b - after.score > tolerance);
        if dropped || after.budget_exhausted {
            regressions.push(ScenarioRegression {
                scenario: after.id.clone(),
                before: before.score,
                after: after.score,
                budget_exhausted: after.budget_exhausted,
            });
        }
    }

    let improved = candidate.aggregate > current.aggregate;
    let reason = if !regressions.is_empty() {
        let ids: Vec<&str> = regressions.iter().map(|r| r.scenario.as_str()).collect();
        format!("regression in {}", ids.join(", "))
    } else if !improved {
        format!(
            "aggregate {:.4} does not improve on {:.4}",
            candidate.aggregate, current.aggregate
        )
    } else {
        "accepted".to_string()
    };
    Verdict {
        accepted: improved && regressions.is_empty(),
        regressions,
        reason,
    }
}

// =============================================================================
// BUILDER-BUILDER
// =============================================================================

/// Result of one proposal cycle.
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub active_before: u64,
    pub usage: UsageStats,
    pub baseline: SuiteResult,
    /// One decision per proposal, sequences filled in.
    pub decisions: Vec<MetaDecision>,
    pub published: Option<Arc<GuardSet>>,
}

/// Result of re-validating the active guard set.
#[derive(Debug, Clone)]
pub struct AuditReport {
    pub active_version: u64,
    pub parent_version: Option<u64>,
    pub rolled_back: bool,
    pub decision: Option<MetaDecision>,
}

/// Proposes, validates and publishes guard sets for one domain.
pub struct BuilderBuilder<'a> {
    rules: &'a CompiledRuleSet,
    evaluator: &'a dyn Evaluator,
    suite: &'a GoldenSuite,
    guards: &'a ActiveGuards,
    strategies: Vec<Box<dyn ProposalStrategy>>,
    tolerance: f64,
    domain: String,
}

impl fmt::Debug for BuilderBuilder<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.strategies.iter().map(|s| s.name()).collect();
        f.debug_struct("BuilderBuilder")
            .field("domain", &self.domain)
            .field("strategies", &names)
            .field("tolerance", &self.tolerance)
            .finish_non_exhaustive()
    }
}

impl<'a> BuilderBuilder<'a> {
    #[must_use]
    pub fn new(
        rules: &'a CompiledRuleSet,
        evaluator: &'a dyn Evaluator,
        suite: &'a GoldenSuite,
        guards: &'a ActiveGuards,
    ) -> Self {
        Self {
            rules,
            evaluator,
            suite,
            guards,
            strategies: Vec::new(),
            tolerance: DEFAULT_REGRESSION_TOLERANCE,
            domain: rules.name().to_string(),
        }
    }

    #[must_use]
    pub fn strategy(mut self, strategy: impl ProposalStrategy + 'static) -> Self {
        self.strategies.push(Box::new(strategy));
        self
    }

    /// Largest per-scenario score drop a proposal may cause.
    #[must_use]
    pub fn tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }

    #[must_use]
    pub fn domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = domain.into();
        self
    }

    fn suite_under(&self, guards: &GuardSet) -> Result<SuiteResult, GraphsmithError> {
        evaluate_suite(self.suite, self.rules, self.evaluator, guards, &self.domain)
    }

    /// Collect, propose, validate and publish at most one proposal.
    pub fn run_cycle<'r>(
        &self,
        records: impl IntoIterator<Item = &'r ProvenanceRecord>,
        sink: &dyn ProvenanceSink,
    ) -> Result<CycleReport, GraphsmithError> {
        let span = tracing::info_span!("builder_builder", domain = %self.domain);
        let _enter = span.enter();

        let active = self.guards.snapshot();
        let usage = UsageStats::collect(records);
        let proposals: Vec<Proposal> = self
            .strategies
            .iter()
            .flat_map(|s| s.propose(&usage, &active))
            .collect();
        let baseline = self.suite_under(&active)?;
        tracing::info!(
            active = active.version,
            records = usage.records,
            proposals = proposals.len(),
            aggregate = baseline.aggregate,
            "meta cycle started"
        );

        let mut judged = Vec::with_capacity(proposals.len());
        for proposal in proposals {
            let draft = GuardSet::draft(&active, proposal.thresholds.clone());
            let result = self.suite_under(&draft)?;
            let verdict = judge(&baseline, &result, self.tolerance);
            if !verdict.accepted {
                tracing::info!(
                    strategy = %proposal.strategy,
                    reason = %verdict.reason,
                    "proposal rejected"
                );
            }
            judged.push((proposal, result, verdict));
        }

        // First proposal with the best aggregate among the passing ones.
        let winner = judged
            .iter()
            .enumerate()
            .filter(|(_, (_, _, v))| v.accepted)
            .fold(None::<(usize, f64)>, |best, (i, (_, r, _))| match best {
                Some((_, agg)) if agg >= r.aggregate => best,
                _ => Some((i, r.aggregate)),
            })
            .map(|(i, _)| i);

        let published = winner.and_then(|i| {
            let proposal = &judged[i].0;
            let set = self.guards.publish_on(
                active.version,
                proposal.thresholds.clone(),
                format!("builder-builder:{}", proposal.strategy),
            );
            if set.is_none() {
                tracing::warn!(
                    expected = active.version,
                    found = self.guards.active_version(),
                    "active guard set changed during validation; nothing published"
                );
            }
            set
        });

        // Until the winning decision is stored, a failed append withdraws
        // the publication so no active set is left without its record.
        let mut winner_recorded = published.is_none();
        let mut decisions = Vec::with_capacity(judged.len());
        for (i, (proposal, result, verdict)) in judged.into_iter().enumerate() {
            let won = winner == Some(i) && published.is_some();
            let reason = if won {
                verdict.reason
            } else if verdict.accepted && winner == Some(i) {
                "active guard set changed".to_string()
            } else if verdict.accepted {
                "superseded".to_string()
            } else {
                verdict.reason
            };
            let mut decision = MetaDecision {
                sequence: 0,
                kind: DecisionKind::Proposal,
                domain: self.domain.clone(),
                strategy: proposal.strategy,
                active_version: active.version,
                proposed: proposal.thresholds,
                rationale: proposal.rationale,
                aggregate_before: baseline.aggregate,
                aggregate_after: result.aggregate,
                accepted: won,
                published_version: if won {
                    published.as_ref().map(|p| p.version)
                } else {
                    None
                },
                regressions: verdict.regressions,
                reason,
            };
            decision.sequence = match sink.append_decision(decision.clone()) {
                Ok(sequence) => sequence,
                Err(e) => {
                    if !winner_recorded && let Some(set) = &published {
                        self.withdraw(set.version);
                    }
                    return Err(e);
                }
            };
            winner_recorded |= won;
            decisions.push(decision);
        }

        Ok(CycleReport {
            active_before: active.version,
            usage,
            baseline,
            decisions,
            published,
        })
    }

    /// Undo a publication whose decision could not be recorded.
    fn withdraw(&self, version: u64) {
        match self.guards.rollback_from(version) {
            Ok(Some(restored)) => tracing::warn!(
                withdrawn = version,
                active = restored.version,
                "decision not recorded; publication withdrawn"
            ),
            Ok(None) => tracing::warn!(
                version,
                "decision not recorded; guard set already superseded"
            ),
            Err(e) => tracing::error!(version, error = %e, "publication withdrawal failed"),
        }
    }

    /// Re-validate the active set against its parent; roll back if disputed.
    pub fn audit(&self, sink: &dyn ProvenanceSink) -> Result<AuditReport, GraphsmithError> {
        let active = self.guards.snapshot();
        let Some(parent_version) = active.parent else {
            tracing::debug!(version = active.version, "no parent to audit against");
            return Ok(AuditReport {
                active_version: active.version,
                parent_version: None,
                rolled_back: false,
                decision: None,
            });
        };
        let parent = self
            .guards
            .get(parent_version)
            .ok_or(GraphsmithError::GuardSetNotFound(parent_version))?;

        let parent_result = self.suite_under(&parent)?;
        let active_result = self.suite_under(&active)?;
        let verdict = judge(&parent_result, &active_result, self.tolerance);
        let disputed =
            parent_result.aggregate > active_result.aggregate || !verdict.regressions.is_empty();

        let rolled_back = disputed && self.guards.rollback_from(active.version)?.is_some();
        let reason = if rolled_back {
            tracing::warn!(
                from = active.version,
                to = parent_version,
                reason = %verdict.reason,
                "active guard set disputed, rolled back"
            );
            format!("rolled back: {}", verdict.reason)
        } else if disputed {
            tracing::warn!(
                expected = active.version,
                found = self.guards.active_version(),
                "active guard set changed during audit; nothing rolled back"
            );
            format!("disputed, not rolled back (active guard set changed): {}", verdict.reason)
        } else {
            "upheld".to_string()
        };

        let mut decision = MetaDecision {
            sequence: 0,
            kind: DecisionKind::Audit,
            domain: self.domain.clone(),
            strategy: "audit".to_string(),
            active_version: active.version,
            proposed: parent.thresholds.clone(),
            rationale: format!(
                "version {} against parent {parent_version}",
                active.version
            ),
            aggregate_before: parent_result.aggregate,
            aggregate_after: active_result.aggregate,
            accepted: !disputed,
            published_version: rolled_back.then_some(parent_version),
            regressions: verdict.regressions,
            reason,
        };
        decision.sequence = sink.append_decision(decision.clone())?;

        Ok(AuditReport {
            active_version: active.version,
            parent_version: Some(parent_version),
            rolled_back,
            decision: Some(decision),
        })
    }
}

// =============================================================================
// TESTS
// =============================================================================
