//! # Graphsmith - Design Search CLI
//!
//! The main binary for the Graphsmith design-search engine.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────┐
//! │               apps/graphsmith (THE BINARY)            │
//! │                                                       │
//! │  ┌─────────────┐   ┌─────────────┐   ┌─────────────┐  │
//! │  │    CLI      │   │   Config    │   │ rod domain  │  │
//! │  │   (clap)    │   │   (toml)    │   │             │  │
//! │  └──────┬──────┘   └──────┬──────┘   └──────┬──────┘  │
//! │         └─────────────────┼─────────────────┘         │
//! │                           ▼                           │
//! │                 ┌──────────────────┐                  │
//! │                 │ graphsmith-core  │                  │
//! │                 │   (THE LOGIC)    │                  │
//! │                 └──────────────────┘                  │
//! └───────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```bash
//! graphsmith run --length 1.0 --thickness 0.8 --run-id r1
//! graphsmith meta --audit
//! graphsmith records --rule R2
//! graphsmith guards
//! ```

use clap::Parser;
use graphsmith::cli;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

// =============================================================================
// APPLICATION ENTRY POINT
// =============================================================================

fn main() {
    // GRAPHSMITH_LOG_FORMAT=json switches to machine-parseable output.
    let log_format =
        std::env::var("GRAPHSMITH_LOG_FORMAT").unwrap_or_else(|_| "text".to_string());

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "graphsmith=info,graphsmith_core=info".into());

    // Logs go to stderr; stdout carries command output.
    match log_format.as_str() {
        "json" => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }

    let cli = cli::Cli::parse();

    if let Err(e) = cli::execute(cli) {
        tracing::error!("Error: {}", e);
        std::process::exit(1);
    }
}
