//! # Core Type Definitions
//!
//! This module contains the identifiers, values and errors shared by every
//! other module:
//! - Graph identifiers (`NodeId`, `EdgeId`, `RuleId`)
//! - Property values (`PropValue`)
//! - Structural fingerprints (`Fingerprint`)
//! - Error types (`GraphsmithError`, `InvalidEdit`, `EvaluatorError`, `CompileReason`)
//!
//! ## Determinism Guarantees
//!
//! Identifiers implement `Ord` so they can key `BTreeMap`/`BTreeSet`.
//! Floating-point values never take part in ordering except through
//! `f64::total_cmp` or their normalised bit pattern.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use thiserror::Error;

// =============================================================================
// IDENTIFIERS
// =============================================================================

/// Unique identifier of a node within one graph.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub String);

impl NodeId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Identifier of an edge within one graph.
///
/// Edge ids are assigned in insertion order and are NOT part of a graph's
/// fingerprint: two graphs holding the same edges are structurally equal
/// regardless of the order the edges were added in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EdgeId(pub u64);

impl fmt::Display for EdgeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "e{}", self.0)
    }
}

/// Identifier of a rule, used for provenance attribution.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RuleId(pub String);

impl RuleId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RuleId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for RuleId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// =============================================================================
// PROPERTY VALUES
// =============================================================================

/// A node or edge property: numeric or categorical.
///
/// Serialized untagged so configuration files can write `length = 1.0`
/// or `material = "steel"` directly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropValue {
    Number(f64),
    Category(String),
}

impl PropValue {
    #[must_use]
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            Self::Category(_) => None,
        }
    }

    #[must_use]
    pub fn as_category(&self) -> Option<&str> {
        match self {
            Self::Category(s) => Some(s),
            Self::Number(_) => None,
        }
    }

    /// Compare two values of the same variant.
    ///
    /// Mixed variants and NaN are incomparable (`None`).
    #[must_use]
    pub fn compare(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Self::Number(a), Self::Number(b)) => a.partial_cmp(b),
            (Self::Category(a), Self::Category(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

impl fmt::Display for PropValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::Category(s) => write!(f, "{s:?}"),
        }
    }
}

impl From<f64> for PropValue {
    fn from(n: f64) -> Self {
        Self::Number(n)
    }
}

impl From<&str> for PropValue {
    fn from(s: &str) -> Self {
        Self::Category(s.to_string())
    }
}

impl From<String> for PropValue {
    fn from(s: String) -> Self {
        Self::Category(s)
    }
}

// =============================================================================
// FINGERPRINT
// =============================================================================

/// A stable 256-bit hash of a graph's canonical structure.
///
/// Used for candidate deduplication, beam tie-breaking and for linking
/// provenance records to the graphs they describe.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Fingerprint(pub [u8; 32]);

impl Fingerprint {
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Full 64-character lowercase hex form.
    #[must_use]
    pub fn to_hex(&self) -> String {
        let mut out = String::with_capacity(64);
        for byte in &self.0 {
            out.push_str(&format!("{byte:02x}"));
        }
        out
    }

    /// Parse the 64-character hex form produced by [`Fingerprint::to_hex`].
    pub fn from_hex(hex: &str) -> Result<Self, GraphsmithError> {
        if hex.len() != 64 || !hex.is_ascii() {
            return Err(GraphsmithError::Serialization(format!(
                "fingerprint must be 64 hex characters, got {}",
                hex.len()
            )));
        }
        let mut bytes = [0u8; 32];
        for (i, byte) in bytes.iter_mut().enumerate() {
            let pair = &hex[i * 2..i * 2 + 2];
            *byte = u8::from_str_radix(pair, 16).map_err(|e| {
                GraphsmithError::Serialization(format!("invalid fingerprint hex: {e}"))
            })?;
        }
        Ok(Self(bytes))
    }
}

impl fmt::Display for Fingerprint {
    /// Short form: the first 8 bytes in hex.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0[..8] {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({self})")
    }
}

// =============================================================================
// ERROR TYPES
// =============================================================================

/// A primitive edit's preconditions failed at application time.
///
/// Rule application treats this as "no candidate produced"; it is never
/// propagated out of a search run.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum InvalidEdit {
    #[error("node not found: {0}")]
    NodeNotFound(NodeId),

    #[error("edge not found: {0}")]
    EdgeNotFound(String),

    #[error("node already exists: {0}")]
    DuplicateNode(NodeId),

    #[error("missing parameter '{0}'")]
    MissingParam(String),

    #[error("parameter '{param}' must be {expected}")]
    WrongParamType { param: String, expected: &'static str },

    #[error("pattern variable '{0}' is not bound")]
    UnboundVar(String),

    #[error("property '{key}' on {node} is not numeric")]
    NotNumeric { node: NodeId, key: String },

    #[error("precondition failed: {0}")]
    Precondition(String),
}

/// The evaluator could not produce valid metrics for a graph.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EvaluatorError {
    #[error("malformed design: {0}")]
    Malformed(String),

    #[error("non-finite score {0}")]
    NonFiniteScore(f64),
}

/// Why a rule failed to compile.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompileReason {
    #[error("action step {step} references unknown handler '{handler}'")]
    UnknownHandler { step: usize, handler: String },

    #[error("action step {step} ('{handler}') is missing required parameter '{param}'")]
    MissingParam {
        step: usize,
        handler: String,
        param: String,
    },

    #[error("duplicate rule id")]
    DuplicateRuleId,

    #[error("rule has no action steps")]
    EmptyAction,

    #[error("pattern variable '{0}' is declared twice")]
    DuplicateVar(String),

    #[error("{site} references undeclared pattern variable '{var}'")]
    UndeclaredVar { var: String, site: String },

    #[error("guard references unknown threshold '{0}'")]
    UnknownThreshold(String),

    #[error("pattern declares {vars} variables (maximum {max})")]
    PatternTooLarge { vars: usize, max: usize },
}

/// Errors that can occur in the Graphsmith core.
///
/// - No silent failures
/// - Use `Result<T, GraphsmithError>` for fallible operations
/// - The core never panics; run-time per-candidate problems are absorbed
///   by the search engine and surface only in provenance
#[derive(Debug, Error)]
pub enum GraphsmithError {
    /// A rule graph could not be compiled. Fatal: no search may run.
    #[error("compile error in rule '{rule_id}': {reason}")]
    Compile { rule_id: RuleId, reason: CompileReason },

    /// A primitive edit failed outside of rule application (e.g. building a seed).
    #[error("invalid edit: {0}")]
    InvalidEdit(#[from] InvalidEdit),

    /// The evaluator could not score a graph that had to be scored (the seed).
    #[error("evaluator error: {0}")]
    Evaluator(#[from] EvaluatorError),

    /// A durable provenance append failed after exhausting its retries.
    #[error("provenance write failed for sequence {sequence} after {attempts} attempt(s): {reason}")]
    ProvenanceWrite {
        sequence: u64,
        attempts: u32,
        reason: String,
    },

    /// The provenance writer thread is no longer accepting records.
    #[error("provenance writer is closed")]
    WriterClosed,

    /// The requested guard set version is not retained.
    #[error("guard set version {0} not found")]
    GuardSetNotFound(u64),

    /// Rollback was requested for a guard set without a parent.
    #[error("guard set version {0} has no previous version")]
    NoPreviousGuardSet(u64),

    /// A configuration value is out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A serialization or deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(String),
}

impl GraphsmithError {
    /// Shorthand for a compile error.
    #[must_use]
    pub fn compile(rule_id: &RuleId, reason: CompileReason) -> Self {
        Self::Compile {
            rule_id: rule_id.clone(),
            reason,
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
