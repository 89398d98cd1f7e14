//! # Engine Primitives
//!
//! Hardcoded defaults and limits for the Graphsmith core.
//!
//! Configuration structs fall back to these values; the limits bound the
//! work any single rule application or read may perform.

/// Default number of candidates retained per depth.
pub const DEFAULT_BEAM_WIDTH: usize = 8;

/// Default maximum search depth.
pub const DEFAULT_MAX_DEPTH: usize = 12;

/// Maximum number of variables a trigger pattern may declare.
///
/// Matching is a cartesian product over variables; this keeps a single
/// rule application computationally bounded.
pub const MAX_PATTERN_VARS: usize = 6;

/// Maximum number of match contexts produced for one rule application.
///
/// Matches beyond this limit are dropped (deterministically: the first
/// matches in node-id order are kept).
pub const MAX_MATCHES_PER_APPLICATION: usize = 4096;

/// Default number of attempts for a durable provenance append.
pub const DEFAULT_WRITE_ATTEMPTS: u32 = 3;

/// Default backoff between provenance append attempts, in milliseconds.
pub const DEFAULT_WRITE_BACKOFF_MS: u64 = 10;

/// Number of records fetched per page by provenance readers.
pub const READ_PAGE_SIZE: usize = 512;

/// Default per-scenario regression tolerance (ε) for the Builder-Builder.
pub const DEFAULT_REGRESSION_TOLERANCE: f64 = 1.0;

/// Bound on the writer queue between search workers and the provenance thread.
pub const WRITER_QUEUE_CAPACITY: usize = 1024;

/// Magic bytes for the canonical graph export format.
pub const GRAPH_MAGIC: &[u8; 4] = b"GSMG";

/// Current canonical graph format version.
pub const GRAPH_FORMAT_VERSION: u8 = 1;
