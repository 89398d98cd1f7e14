//! # graphsmith-core
//!
//! The deterministic design-search engine for Graphsmith - THE LOGIC.
//!
//! Designs are attributed graphs. Declarative rules are compiled into pure
//! graph-to-candidates functions, a beam search explores their
//! applications under a versioned guard set, and every application attempt
//! lands in an append-only provenance log. The Builder-Builder mines that
//! log to propose new guard thresholds and publishes them only when a
//! golden suite shows no regression.
//!
//! ## Architectural Constraints
//!
//! - Graphs are values: edits return new graphs, inputs are never mutated
//! - Determinism: `BTreeMap` containers, ordering by keys never by arrival
//! - Closed dispatch: rule handlers are resolved once, at compile time
//! - No async, no network dependencies (pure Rust)
//! - The library logs through `tracing` and never installs a subscriber

// =============================================================================
// MODULES
// =============================================================================

pub mod canonical;
pub mod compiler;
pub mod eval;
pub mod graph;
pub mod guards;
pub mod handlers;
pub mod meta;
pub mod pattern;
pub mod primitives;
pub mod provenance;
pub mod rule;
pub mod search;
pub mod storage;
pub mod types;

// =============================================================================
// RE-EXPORTS: Core Types (from types module)
// =============================================================================

pub use types::{
    CompileReason, EdgeId, EvaluatorError, Fingerprint, GraphsmithError, InvalidEdit, NodeId,
    PropValue, RuleId,
};

// =============================================================================
// RE-EXPORTS: Design Model
// =============================================================================

pub use canonical::{CanonicalGraph, export_graph, import_graph};
pub use graph::{Edge, Graph, Node};
pub use pattern::{MatchContext, Pattern};

// =============================================================================
// RE-EXPORTS: Rules
// =============================================================================

pub use compiler::{ApplicationMeta, Candidate, CompiledRule, CompiledRuleSet, compile};
pub use handlers::{EditInput, FnEdit, HandlerRegistry, PrimitiveEdit, StandardEdit};
pub use rule::{EditArg, EditStep, GuardClause, GuardOp, GuardOperand, RuleGraph, RuleSpec};

// =============================================================================
// RE-EXPORTS: Search
// =============================================================================

pub use eval::{EvalParams, Evaluator, FnEvaluator, Metrics, evaluate_checked};
pub use search::{
    BeamMember, BestDesign, Budget, RunInfo, SearchConfig, SearchEngine, SearchOutcome,
    SearchStats, StopWhen, Termination, TieBreak,
};

// =============================================================================
// RE-EXPORTS: Provenance & Guards
// =============================================================================

pub use guards::{ActiveGuards, DRAFT_VERSION, GuardHistory, GuardSet};
pub use provenance::{
    DecisionKind, MetaDecision, NullSink, ProvenanceAppender, ProvenanceFilter, ProvenanceHub,
    ProvenanceRecord, ProvenanceRegistry, ProvenanceSink, RetryPolicy, ScenarioRegression,
};
pub use storage::{MemoryStore, ProvenanceStore, RedbStore};

// =============================================================================
// RE-EXPORTS: Builder-Builder
// =============================================================================

pub use meta::{
    AuditReport, BuilderBuilder, CycleReport, GoldenScenario, GoldenSuite, ObservedThreshold,
    Proposal, ProposalStrategy, Reducer, RuleUsage, RunningStats, ScaleSweep, ScenarioScore,
    SuiteResult, UsageStats, Verdict, evaluate_suite, judge,
};
