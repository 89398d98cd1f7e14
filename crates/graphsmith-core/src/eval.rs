//! # Evaluator Contract
//!
//! Domains score designs through the [`Evaluator`] trait. Evaluation must
//! be deterministic: the same graph and parameters always yield the same
//! metrics. Higher scores are better.

use crate::graph::Graph;
use crate::EvaluatorError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Parameters of one evaluator invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvalParams {
    #[serde(default)]
    pub weights: BTreeMap<String, f64>,
    #[serde(default)]
    pub flags: BTreeMap<String, bool>,
    #[serde(default)]
    pub mode: Option<String>,
}

impl EvalParams {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_weight(mut self, name: impl Into<String>, value: f64) -> Self {
        self.weights.insert(name.into(), value);
        self
    }

    #[must_use]
    pub fn with_flag(mut self, name: impl Into<String>, value: bool) -> Self {
        self.flags.insert(name.into(), value);
        self
    }

    #[must_use]
    pub fn with_mode(mut self, mode: impl Into<String>) -> Self {
        self.mode = Some(mode.into());
        self
    }

    /// Named weight, or `default` when unset.
    #[must_use]
    pub fn weight(&self, name: &str, default: f64) -> f64 {
        self.weights.get(name).copied().unwrap_or(default)
    }

    #[must_use]
    pub fn flag(&self, name: &str) -> bool {
        self.flags.get(name).copied().unwrap_or(false)
    }
}

/// Evaluator output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    /// Primary score. Higher is better; always finite.
    pub score: f64,
    #[serde(default)]
    pub feasible: bool,
    /// Auxiliary diagnostics.
    #[serde(default)]
    pub extras: BTreeMap<String, f64>,
}

impl Metrics {
    #[must_use]
    pub fn new(score: f64) -> Self {
        Self {
            score,
            feasible: true,
            extras: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn feasible(mut self, feasible: bool) -> Self {
        self.feasible = feasible;
        self
    }

    #[must_use]
    pub fn with_extra(mut self, name: impl Into<String>, value: f64) -> Self {
        self.extras.insert(name.into(), value);
        self
    }
}

/// Scores a design graph.
pub trait Evaluator: Send + Sync {
    fn evaluate(&self, graph: &Graph, params: &EvalParams) -> Result<Metrics, EvaluatorError>;
}

/// Adapts a closure into an [`Evaluator`].
pub struct FnEvaluator<F>(F);

impl<F> FnEvaluator<F>
where
    F: Fn(&Graph, &EvalParams) -> Result<Metrics, EvaluatorError> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> Evaluator for FnEvaluator<F>
where
    F: Fn(&Graph, &EvalParams) -> Result<Metrics, EvaluatorError> + Send + Sync,
{
    fn evaluate(&self, graph: &Graph, params: &EvalParams) -> Result<Metrics, EvaluatorError> {
        (self.0)(graph, params)
    }
}

/// Run an evaluator and reject non-finite scores.
pub fn evaluate_checked(
    evaluator: &dyn Evaluator,
    graph: &Graph,
    params: &EvalParams,
) -> Result<Metrics, EvaluatorError> {
    let metrics = evaluator.evaluate(graph, params)?;
    if metrics.score.is_finite() {
        Ok(metrics)
    } else {
        Err(EvaluatorError::NonFiniteScore(metrics.score))
    }
}
