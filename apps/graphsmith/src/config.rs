//! # Application Configuration
//!
//! Loaded from an optional TOML file. Every section and field has a
//! default, so an empty file (or no file) is a valid configuration.
//!
//! ```toml
//! [search]
//! beam_width = 8
//! max_depth = 12
//! parallelism = 4
//!
//! [search.budget]
//! max_expansions = 20000
//!
//! [meta]
//! tolerance = 1.0
//! epsilon = 0.05
//! reducer = "median"
//! scale_factors = [0.9, 1.1]
//!
//! [provenance]
//! max_attempts = 3
//! backoff_ms = 10
//! ```

use graphsmith_core::primitives::DEFAULT_REGRESSION_TOLERANCE;
use graphsmith_core::{GraphsmithError, Reducer, RetryPolicy, SearchConfig};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default search settings for golden-suite validation runs.
const GOLDEN_BEAM_WIDTH: usize = 4;
const GOLDEN_MAX_DEPTH: usize = 6;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AppConfig {
    pub search: SearchConfig,
    pub meta: MetaConfig,
    pub provenance: RetryPolicy,
}

/// Builder-Builder settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MetaConfig {
    /// Largest per-scenario score drop a proposal may cause.
    pub tolerance: f64,
    /// Margin added to an observed threshold.
    pub epsilon: f64,
    pub reducer: Reducer,
    /// Search settings for each golden scenario.
    pub golden: SearchConfig,
    /// When non-empty, also sweep every threshold by these factors.
    pub scale_factors: Vec<f64>,
}

impl Default for MetaConfig {
    fn default() -> Self {
        Self {
            tolerance: DEFAULT_REGRESSION_TOLERANCE,
            epsilon: 0.05,
            reducer: Reducer::default(),
            golden: SearchConfig::new(GOLDEN_BEAM_WIDTH, GOLDEN_MAX_DEPTH),
            scale_factors: Vec::new(),
        }
    }
}

impl AppConfig {
    /// Load from `path`, or defaults when `None`.
    pub fn load(path: Option<&Path>) -> Result<Self, GraphsmithError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = std::fs::read_to_string(path).map_err(|e| {
            GraphsmithError::Io(format!("cannot read config '{}': {}", path.display(), e))
        })?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self, GraphsmithError> {
        let config: Self =
            toml::from_str(text).map_err(|e| GraphsmithError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), GraphsmithError> {
        self.search.validate()?;
        self.meta.golden.validate()?;
        if !(self.meta.tolerance.is_finite() && self.meta.tolerance >= 0.0) {
            return Err(GraphsmithError::InvalidConfig(
                "meta.tolerance must be a non-negative number".to_string(),
            ));
        }
        if !self.meta.epsilon.is_finite() {
            return Err(GraphsmithError::InvalidConfig(
                "meta.epsilon must be finite".to_string(),
            ));
        }
        if self
            .meta
            .scale_factors
            .iter()
            .any(|f| !f.is_finite() || *f <= 0.0)
        {
            return Err(GraphsmithError::InvalidConfig(
                "meta.scale_factors must be positive".to_string(),
            ));
        }
        if self.provenance.max_attempts == 0 {
            return Err(GraphsmithError::InvalidConfig(
                "provenance.max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
