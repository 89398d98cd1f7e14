//! # Domains
//!
//! A domain bundles what the engine needs to search one kind of design:
//! domain handlers, an evaluator, a rule graph and a golden suite. Only
//! the `rod` domain ships with the binary.

pub mod rod;
