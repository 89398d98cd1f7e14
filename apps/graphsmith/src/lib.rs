//! # graphsmith
//!
//! Library half of the `graphsmith` binary: configuration, the reference
//! domains and the CLI commands. `main.rs` only installs logging and
//! dispatches.

pub mod cli;
pub mod config;
pub mod domains;
