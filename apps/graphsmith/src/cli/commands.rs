//! # CLI Command Implementations
//!
//! Every command opens the redb database named by `--db`. The guard-set
//! history lives beside it as `<db>.guards.json`, rewritten atomically
//! after each change.

use super::Context;
use crate::domains::rod::{self, Material, RodEvaluator};
use graphsmith_core::{
    ActiveGuards, AuditReport, BuilderBuilder, CompiledRuleSet, CycleReport, GraphsmithError,
    GuardHistory, ProvenanceFilter, ProvenanceHub, ProvenanceRecord, ProvenanceRegistry,
    RedbStore, RuleGraph, RunInfo, ScaleSweep, SearchConfig, SearchEngine, UsageStats, compile,
};
use std::path::{Path, PathBuf};

fn json_err(e: serde_json::Error) -> GraphsmithError {
    GraphsmithError::Serialization(e.to_string())
}

fn print_json(value: &serde_json::Value) -> Result<(), GraphsmithError> {
    println!("{}", serde_json::to_string_pretty(value).map_err(json_err)?);
    Ok(())
}

// =============================================================================
// GUARD HISTORY PERSISTENCE
// =============================================================================

/// Where the guard history of `db` is kept.
#[must_use]
pub fn guards_path(db: &Path) -> PathBuf {
    db.with_extension("guards.json")
}

/// The persisted history, or a fresh one holding the rule graph's
/// initial set.
pub fn load_guards(db: &Path, rule_graph: &RuleGraph) -> Result<ActiveGuards, GraphsmithError> {
    let path = guards_path(db);
    if !path.exists() {
        return Ok(ActiveGuards::new(rule_graph.initial_guard_set()));
    }
    let text = std::fs::read_to_string(&path).map_err(|e| {
        GraphsmithError::Io(format!("cannot read '{}': {}", path.display(), e))
    })?;
    let history: GuardHistory = serde_json::from_str(&text).map_err(json_err)?;
    ActiveGuards::restore(history)
}

/// Write the history to a temporary file, then rename it into place.
pub fn save_guards(db: &Path, guards: &ActiveGuards) -> Result<(), GraphsmithError> {
    let path = guards_path(db);
    let tmp = path.with_extension("json.tmp");
    let text = serde_json::to_string_pretty(&guards.export()).map_err(json_err)?;
    std::fs::write(&tmp, text).map_err(|e| GraphsmithError::Io(e.to_string()))?;
    std::fs::rename(&tmp, &path).map_err(|e| GraphsmithError::Io(e.to_string()))?;
    Ok(())
}

fn open_registry(ctx: &Context) -> Result<ProvenanceRegistry<RedbStore>, GraphsmithError> {
    Ok(ProvenanceRegistry::new(RedbStore::open(&ctx.db)?)?.with_retry(ctx.config.provenance))
}

fn rod_rules() -> Result<(RuleGraph, CompiledRuleSet), GraphsmithError> {
    let rule_graph = rod::rule_graph();
    let rules = compile(&rule_graph, &rod::registry())?;
    Ok((rule_graph, rules))
}

fn read_records(
    registry: &ProvenanceRegistry<RedbStore>,
    filter: ProvenanceFilter,
) -> Result<Vec<ProvenanceRecord>, GraphsmithError> {
    registry.read(filter).collect()
}

// =============================================================================
// RUN COMMAND
// =============================================================================

/// Arguments of `graphsmith run`, after config overrides.
#[derive(Debug, Clone)]
pub struct RunArgs {
    pub length: f64,
    pub thickness: f64,
    pub material: String,
    pub load: f64,
    pub run_id: Option<String>,
    pub search: SearchConfig,
}

/// Search from a seed rod and store the best design. Returns the run id.
pub fn cmd_run(ctx: &Context, args: &RunArgs) -> Result<String, GraphsmithError> {
    let material = Material::parse(&args.material).ok_or_else(|| {
        GraphsmithError::InvalidConfig(format!("unknown material '{}'", args.material))
    })?;
    let seed = rod::seed_rod(args.length, args.thickness, material)?;
    let (rule_graph, rules) = rod_rules()?;
    let guards = load_guards(&ctx.db, &rule_graph)?;
    let snapshot = guards.snapshot();

    let evaluator = RodEvaluator;
    let engine = SearchEngine::new(&rules, &evaluator, args.search)?;

    let registry = open_registry(ctx)?;
    let run_id = args
        .run_id
        .clone()
        .unwrap_or_else(|| format!("run-{}", registry.next_sequence()));
    let hub = ProvenanceHub::start(registry)?;
    let appender = hub.appender();
    let result = engine.run(
        &seed,
        &rod::params(args.load),
        &snapshot,
        &RunInfo::new(run_id.clone(), rod::DOMAIN),
        &appender,
    );
    drop(appender);
    let registry = hub.shutdown()?;
    let outcome = result?;

    let mut store = registry.into_store();
    store.save_design(&run_id, &outcome.best)?;
    save_guards(&ctx.db, &guards)?;

    let best = &outcome.best;
    if ctx.json {
        print_json(&serde_json::json!({
            "run_id": run_id,
            "score": best.metrics.score,
            "feasible": best.metrics.feasible,
            "extras": best.metrics.extras,
            "guard_set_version": best.guard_set_version,
            "fingerprint": best.graph.fingerprint().to_hex(),
            "segments": best.graph.count_kind(rod::SEGMENT),
            "depth_reached": outcome.depth_reached,
            "termination": outcome.termination,
            "stats": outcome.stats,
        }))?;
    } else if !ctx.quiet {
        println!("Graphsmith Run {run_id}");
        println!("==================");
        println!("Termination:  {:?}", outcome.termination);
        println!("Depth:        {}", outcome.depth_reached);
        println!("Attempts:     {}", outcome.stats.attempts);
        println!("Evaluated:    {}", outcome.stats.evaluated);
        println!("Guard set:    v{}", best.guard_set_version);
        println!();
        println!("Best score:   {:.4}", best.metrics.score);
        println!("Feasible:     {}", best.metrics.feasible);
        for (name, value) in &best.metrics.extras {
            println!("  {name:<10} {value:.4}");
        }
        print_segments(&best.graph);
    }
    Ok(run_id)
}

fn print_segments(graph: &graphsmith_core::Graph) {
    println!();
    println!("{:<8} {:>8} {:>10}  material", "segment", "length", "thickness");
    for node in graph.find(rod::SEGMENT) {
        let material = node
            .prop("material")
            .map(ToString::to_string)
            .unwrap_or_default();
        println!(
            "{:<8} {:>8.3} {:>10.3}  {}",
            node.id.as_str(),
            node.number("length").unwrap_or(0.0),
            node.number("thickness").unwrap_or(0.0),
            material
        );
    }
}

// =============================================================================
// META COMMAND
// =============================================================================

#[derive(Debug)]
pub struct MetaOutcome {
    pub cycle: CycleReport,
    pub audit: Option<AuditReport>,
}

/// One Builder-Builder cycle over every recorded rod attempt.
pub fn cmd_meta(ctx: &Context, audit: bool) -> Result<MetaOutcome, GraphsmithError> {
    let (rule_graph, rules) = rod_rules()?;
    let guards = load_guards(&ctx.db, &rule_graph)?;
    let registry = open_registry(ctx)?;
    let records = read_records(&registry, ProvenanceFilter::all().domain(rod::DOMAIN))?;

    let meta = &ctx.config.meta;
    let suite = rod::golden_suite(meta.golden)?;
    let evaluator = RodEvaluator;
    let mut builder = BuilderBuilder::new(&rules, &evaluator, &suite, &guards)
        .domain(rod::DOMAIN)
        .tolerance(meta.tolerance)
        .strategy(rod::length_strategy(meta.reducer, meta.epsilon));
    if !meta.scale_factors.is_empty() {
        let names = rule_graph.thresholds.keys().cloned().collect();
        builder = builder.strategy(ScaleSweep::new(names, meta.scale_factors.clone()));
    }

    let cycle = builder.run_cycle(&records, &registry)?;
    let audit = if audit {
        Some(builder.audit(&registry)?)
    } else {
        None
    };
    save_guards(&ctx.db, &guards)?;

    if ctx.json {
        print_json(&serde_json::json!({
            "active_before": cycle.active_before,
            "active_after": guards.active_version(),
            "records": cycle.usage.records,
            "baseline_aggregate": cycle.baseline.aggregate,
            "decisions": cycle.decisions,
            "published": cycle.published.as_ref().map(|set| set.version),
            "rolled_back": audit.as_ref().is_some_and(|a| a.rolled_back),
        }))?;
    } else if !ctx.quiet {
        println!("Builder-Builder Cycle");
        println!("=====================");
        println!("Records:      {}", cycle.usage.records);
        println!("Active:       v{}", cycle.active_before);
        println!("Baseline:     {:.4}", cycle.baseline.aggregate);
        println!();
        if cycle.decisions.is_empty() {
            println!("No proposals.");
        }
        for decision in &cycle.decisions {
            let verdict = if decision.accepted { "ACCEPT" } else { "REJECT" };
            println!("[{verdict}] {} {:?}", decision.strategy, decision.proposed);
            println!("         {}", decision.reason);
        }
        if let Some(published) = &cycle.published {
            println!();
            println!("Published:    v{} {:?}", published.version, published.thresholds);
        }
        if let Some(audit) = &audit {
            println!();
            if audit.rolled_back {
                println!("Audit:        rolled back to v{}", guards.active_version());
            } else {
                println!("Audit:        v{} kept", audit.active_version);
            }
        }
    }
    Ok(MetaOutcome { cycle, audit })
}

// =============================================================================
// STATS COMMAND
// =============================================================================

/// Per-rule usage over the recorded rod attempts.
pub fn cmd_stats(ctx: &Context, run_id: Option<&str>) -> Result<(), GraphsmithError> {
    let registry = open_registry(ctx)?;
    let mut filter = ProvenanceFilter::all().domain(rod::DOMAIN);
    if let Some(run_id) = run_id {
        filter = filter.run_id(run_id);
    }
    let records = read_records(&registry, filter)?;
    let stats = UsageStats::collect(&records);

    if ctx.json {
        let rules: serde_json::Map<String, serde_json::Value> = stats
            .rules
            .iter()
            .map(|(id, usage)| {
                (
                    id.to_string(),
                    serde_json::json!({
                        "attempts": usage.attempts,
                        "fired": usage.fired,
                        "accepted": usage.accepted,
                        "fire_rate": usage.fire_rate(),
                        "acceptance_rate": usage.acceptance_rate(),
                        "mean_delta": usage.delta.mean(),
                        "mean_advantage": usage.advantage.mean(),
                    }),
                )
            })
            .collect();
        return print_json(&serde_json::json!({
            "records": stats.records,
            "rules": rules,
        }));
    }

    println!("Rule Usage ({} records)", stats.records);
    println!(
        "{:<6} {:>8} {:>6} {:>8} {:>7} {:>10} {:>10}",
        "rule", "attempts", "fired", "accepted", "fire%", "mean_d", "adv"
    );
    for (id, usage) in &stats.rules {
        println!(
            "{:<6} {:>8} {:>6} {:>8} {:>6.1}% {:>10.3} {:>10.3}",
            id.as_str(),
            usage.attempts,
            usage.fired,
            usage.accepted,
            usage.fire_rate() * 100.0,
            usage.delta.mean(),
            usage.advantage.mean()
        );
    }
    Ok(())
}

// =============================================================================
// RECORDS COMMAND
// =============================================================================

/// Dump matching records, one JSON object per line, in sequence order.
pub fn cmd_records(
    ctx: &Context,
    run_id: Option<String>,
    rule: Option<String>,
    guard_version: Option<u64>,
) -> Result<(), GraphsmithError> {
    let registry = open_registry(ctx)?;
    let mut filter = ProvenanceFilter::all();
    if let Some(run_id) = run_id {
        filter = filter.run_id(run_id);
    }
    if let Some(rule) = rule {
        filter = filter.rule_id(rule);
    }
    if let Some(version) = guard_version {
        filter = filter.guard_set_version(version);
    }
    for record in registry.read(filter) {
        let record = record?;
        println!("{}", record_json(&record)?);
    }
    Ok(())
}

/// A record as JSON, with fingerprints in hex.
pub fn record_json(record: &ProvenanceRecord) -> Result<serde_json::Value, GraphsmithError> {
    let mut value = serde_json::to_value(record).map_err(json_err)?;
    if let Some(object) = value.as_object_mut() {
        object.insert(
            "parent_fingerprint".to_string(),
            record.parent_fingerprint.to_hex().into(),
        );
        object.insert(
            "child_fingerprint".to_string(),
            record.child_fingerprint.map(|f| f.to_hex()).into(),
        );
    }
    Ok(value)
}

// =============================================================================
// GUARDS & ROLLBACK COMMANDS
// =============================================================================

/// Show the active guard set and every retained version.
pub fn cmd_guards(ctx: &Context) -> Result<(), GraphsmithError> {
    let guards = load_guards(&ctx.db, &rod::rule_graph())?;
    if ctx.json {
        let history = serde_json::to_value(guards.export()).map_err(json_err)?;
        return print_json(&history);
    }

    let active = guards.active_version();
    println!("Guard Sets (active v{active})");
    for set in guards.history() {
        let marker = if set.version == active { '*' } else { ' ' };
        let parent = set
            .parent
            .map_or_else(|| "-".to_string(), |p| format!("v{p}"));
        println!(
            "{marker} v{:<4} parent {:<5} {:<24} {:?}",
            set.version, parent, set.origin, set.thresholds
        );
    }
    Ok(())
}

/// Reactivate the parent of the active guard set.
pub fn cmd_rollback(ctx: &Context) -> Result<(), GraphsmithError> {
    let guards = load_guards(&ctx.db, &rod::rule_graph())?;
    let from = guards.active_version();
    let restored = guards.rollback()?;
    save_guards(&ctx.db, &guards)?;
    tracing::info!(from, to = restored.version, "guard set rolled back");

    if ctx.json {
        print_json(&serde_json::json!({
            "from": from,
            "active": restored.version,
            "thresholds": restored.thresholds,
        }))?;
    } else if !ctx.quiet {
        println!("Rolled back v{from} -> v{}", restored.version);
    }
    Ok(())
}

// =============================================================================
// DESIGN COMMAND
// =============================================================================

/// Show the best design of a run, or list the runs that have one.
pub fn cmd_design(ctx: &Context, run_id: Option<&str>) -> Result<(), GraphsmithError> {
    let store = RedbStore::open(&ctx.db)?;
    let Some(run_id) = run_id else {
        let runs = store.design_runs()?;
        if ctx.json {
            return print_json(&serde_json::json!({ "runs": runs }));
        }
        for run in runs {
            println!("{run}");
        }
        return Ok(());
    };

    let design = store
        .load_design(run_id)?
        .ok_or_else(|| GraphsmithError::Io(format!("no design stored for run '{run_id}'")))?;

    if ctx.json {
        return print_json(&serde_json::json!({
            "run_id": run_id,
            "graph": design.graph,
            "metrics": design.metrics,
            "guard_set_version": design.guard_set_version,
            "fingerprint": design.graph.fingerprint().to_hex(),
        }));
    }
    println!("Design {run_id} (guard set v{})", design.guard_set_version);
    println!("Score:    {:.4}", design.metrics.score);
    println!("Feasible: {}", design.metrics.feasible);
    print_segments(&design.graph);
    Ok(())
}
