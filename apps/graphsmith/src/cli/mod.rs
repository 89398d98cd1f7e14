//! # Graphsmith CLI Module
//!
//! ## Available Commands
//!
//! - `run` - Search from a seed rod, recording provenance
//! - `meta` - Run one Builder-Builder cycle over recorded provenance
//! - `stats` - Show per-rule usage statistics
//! - `records` - Dump provenance records as JSON lines
//! - `guards` - Show the active guard set and its history
//! - `rollback` - Reactivate the parent of the active guard set
//! - `design` - Show a stored best design

mod commands;

use crate::config::AppConfig;
use clap::{Parser, Subcommand};
use graphsmith_core::GraphsmithError;
use std::path::PathBuf;

pub use commands::*;

// =============================================================================
// CLI STRUCTURE
// =============================================================================

/// Graphsmith - rule-driven design search
///
/// Searches the space of designs reachable by rule application, records
/// every attempt, and tunes rule guards from what the record shows.
#[derive(Parser, Debug)]
#[command(name = "graphsmith")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to the provenance database
    #[arg(short = 'D', long, global = true, default_value = "graphsmith.redb")]
    pub db: PathBuf,

    /// Path to a TOML configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Output in JSON format (for programmatic access)
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress human-readable summaries
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Search for a better rod, starting from a single segment
    Run {
        /// Length of the seed segment
        #[arg(long, default_value_t = 1.0)]
        length: f64,

        /// Thickness of the seed segment
        #[arg(long, default_value_t = 0.8)]
        thickness: f64,

        /// Material of the seed segment (aluminum, steel)
        #[arg(long, default_value = "aluminum")]
        material: String,

        /// Load the rod must carry
        #[arg(long, default_value_t = 10.0)]
        load: f64,

        /// Run identifier (default: derived from the next sequence number)
        #[arg(long)]
        run_id: Option<String>,

        /// Override the configured beam width
        #[arg(short = 'w', long)]
        beam_width: Option<usize>,

        /// Override the configured maximum depth
        #[arg(short = 'd', long)]
        max_depth: Option<usize>,

        /// Override the configured worker count
        #[arg(short = 'j', long)]
        parallelism: Option<usize>,
    },

    /// Propose, validate and publish a new guard set
    Meta {
        /// Also audit the active set against its parent
        #[arg(long)]
        audit: bool,
    },

    /// Show per-rule usage statistics
    Stats {
        /// Restrict to one run
        #[arg(long)]
        run_id: Option<String>,
    },

    /// Dump provenance records as JSON lines
    Records {
        #[arg(long)]
        run_id: Option<String>,

        #[arg(long)]
        rule: Option<String>,

        #[arg(long)]
        guard_version: Option<u64>,
    },

    /// Show the active guard set and its history
    Guards,

    /// Reactivate the parent of the active guard set
    Rollback,

    /// Show a stored best design (lists runs when no id is given)
    Design { run_id: Option<String> },
}

// =============================================================================
// COMMAND EXECUTION
// =============================================================================

/// Shared state every command receives.
#[derive(Debug, Clone)]
pub struct Context {
    pub db: PathBuf,
    pub config: AppConfig,
    pub json: bool,
    pub quiet: bool,
}

/// Execute the CLI with parsed arguments.
pub fn execute(cli: Cli) -> Result<(), GraphsmithError> {
    let config = AppConfig::load(cli.config.as_deref())?;
    let ctx = Context {
        db: cli.db,
        config,
        json: cli.json,
        quiet: cli.quiet,
    };

    match cli.command {
        Commands::Run {
            length,
            thickness,
            material,
            load,
            run_id,
            beam_width,
            max_depth,
            parallelism,
        } => {
            let mut search = ctx.config.search;
            if let Some(w) = beam_width {
                search.beam_width = w;
            }
            if let Some(d) = max_depth {
                search.max_depth = d;
            }
            if let Some(p) = parallelism {
                search = search.with_parallelism(p);
            }
            let args = RunArgs {
                length,
                thickness,
                material,
                load,
                run_id,
                search,
            };
            cmd_run(&ctx, &args).map(|_| ())
        }
        Commands::Meta { audit } => cmd_meta(&ctx, audit).map(|_| ()),
        Commands::Stats { run_id } => cmd_stats(&ctx, run_id.as_deref()),
        Commands::Records {
            run_id,
            rule,
            guard_version,
        } => cmd_records(&ctx, run_id, rule, guard_version),
        Commands::Guards => cmd_guards(&ctx),
        Commands::Rollback => cmd_rollback(&ctx),
        Commands::Design { run_id } => cmd_design(&ctx, run_id.as_deref()),
    }
}
