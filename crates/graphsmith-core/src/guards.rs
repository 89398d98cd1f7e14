//! # Guard Sets
//!
//! Versioned threshold snapshots and the single active pointer.
//!
//! A `GuardSet` is immutable once built. `ActiveGuards` holds every
//! published version and swaps the active one atomically: readers take an
//! `Arc` snapshot and never observe a half-built set. Publishing, rollback
//! and activation serialize through one writer lock.

use crate::GraphsmithError;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Version carried by unpublished drafts. Never assigned by `publish`.
pub const DRAFT_VERSION: u64 = u64::MAX;

/// A versioned map of threshold name to value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardSet {
    pub version: u64,
    #[serde(default)]
    pub parent: Option<u64>,
    #[serde(default)]
    pub thresholds: BTreeMap<String, f64>,
    #[serde(default)]
    pub origin: String,
}

impl GuardSet {
    /// Version 0: the defaults a rule graph declares.
    #[must_use]
    pub fn initial(thresholds: BTreeMap<String, f64>, origin: impl Into<String>) -> Self {
        Self {
            version: 0,
            parent: None,
            thresholds,
            origin: origin.into(),
        }
    }

    /// An unpublished candidate derived from `base`, used for validation runs.
    ///
    /// Drafts carry [`DRAFT_VERSION`] so their runs never pass for runs of
    /// the base set.
    #[must_use]
    pub fn draft(base: &GuardSet, thresholds: BTreeMap<String, f64>) -> Self {
        Self {
            version: DRAFT_VERSION,
            parent: Some(base.version),
            thresholds,
            origin: "draft".to_string(),
        }
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<f64> {
        self.thresholds.get(name).copied()
    }

    #[must_use]
    pub fn is_draft(&self) -> bool {
        self.version == DRAFT_VERSION
    }
}

/// Serializable form of an `ActiveGuards` history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardHistory {
    pub active: u64,
    pub sets: Vec<GuardSet>,
}

/// The active guard set plus every retained version.
#[derive(Debug)]
pub struct ActiveGuards {
    active: RwLock<Arc<GuardSet>>,
    history: RwLock<BTreeMap<u64, Arc<GuardSet>>>,
    writer: Mutex<()>,
}

impl ActiveGuards {
    #[must_use]
    pub fn new(initial: GuardSet) -> Self {
        let initial = Arc::new(initial);
        let mut history = BTreeMap::new();
        history.insert(initial.version, Arc::clone(&initial));
        Self {
            active: RwLock::new(initial),
            history: RwLock::new(history),
            writer: Mutex::new(()),
        }
    }

    /// Rebuild from a persisted history.
    pub fn restore(saved: GuardHistory) -> Result<Self, GraphsmithError> {
        let history: BTreeMap<u64, Arc<GuardSet>> = saved
            .sets
            .into_iter()
            .map(|set| (set.version, Arc::new(set)))
            .collect();
        let active = history
            .get(&saved.active)
            .cloned()
            .ok_or(GraphsmithError::GuardSetNotFound(saved.active))?;
        Ok(Self {
            active: RwLock::new(active),
            history: RwLock::new(history),
            writer: Mutex::new(()),
        })
    }

    #[must_use]
    pub fn export(&self) -> GuardHistory {
        let _writer = self.writer.lock();
        GuardHistory {
            active: self.active.read().version,
            sets: self
                .history
                .read()
                .values()
                .map(|set| GuardSet::clone(set))
                .collect(),
        }
    }

    /// The snapshot a run captures at start.
    #[must_use]
    pub fn snapshot(&self) -> Arc<GuardSet> {
        Arc::clone(&self.active.read())
    }

    #[must_use]
    pub fn active_version(&self) -> u64 {
        self.active.read().version
    }

    /// Publish a new version derived from the active one and activate it.
    pub fn publish(
        &self,
        thresholds: BTreeMap<String, f64>,
        origin: impl Into<String>,
    ) -> Arc<GuardSet> {
        let _writer = self.writer.lock();
        self.publish_locked(thresholds, origin.into())
    }

    /// Publish only if `expected_parent` is still active.
    ///
    /// Returns `None`, leaving everything untouched, when another version
    /// became active in the meantime.
    pub fn publish_on(
        &self,
        expected_parent: u64,
        thresholds: BTreeMap<String, f64>,
        origin: impl Into<String>,
    ) -> Option<Arc<GuardSet>> {
        let _writer = self.writer.lock();
        if self.active.read().version != expected_parent {
            return None;
        }
        Some(self.publish_locked(thresholds, origin.into()))
    }

    /// Caller holds `writer`.
    fn publish_locked(&self, thresholds: BTreeMap<String, f64>, origin: String) -> Arc<GuardSet> {
        let parent = self.active.read().version;
        let mut history = self.history.write();
        let version = history
            .keys()
            .next_back()
            .map_or(0, |v| v.saturating_add(1));
        let set = Arc::new(GuardSet {
            version,
            parent: Some(parent),
            thresholds,
            origin,
        });
        history.insert(version, Arc::clone(&set));
        drop(history);
        *self.active.write() = Arc::clone(&set);
        tracing::info!(version, parent, "guard set published");
        set
    }

    /// Re-activate the active set's parent.
    pub fn rollback(&self) -> Result<Arc<GuardSet>, GraphsmithError> {
        let _writer = self.writer.lock();
        let current = self.snapshot();
        self.rollback_locked(&current)
    }

    /// Roll back only if `expected` is still the active version.
    ///
    /// `Ok(None)` means another version became active and nothing changed.
    pub fn rollback_from(&self, expected: u64) -> Result<Option<Arc<GuardSet>>, GraphsmithError> {
        let _writer = self.writer.lock();
        let current = self.snapshot();
        if current.version != expected {
            return Ok(None);
        }
        self.rollback_locked(&current).map(Some)
    }

    /// Caller holds `writer`.
    fn rollback_locked(&self, current: &GuardSet) -> Result<Arc<GuardSet>, GraphsmithError> {
        let parent = current
            .parent
            .ok_or(GraphsmithError::NoPreviousGuardSet(current.version))?;
        let target = self
            .history
            .read()
            .get(&parent)
            .cloned()
            .ok_or(GraphsmithError::GuardSetNotFound(parent))?;
        *self.active.write() = Arc::clone(&target);
        tracing::info!(from = current.version, to = parent, "guard set rolled back");
        Ok(target)
    }

    /// Re-activate any retained version.
    pub fn activate(&self, version: u64) -> Result<Arc<GuardSet>, GraphsmithError> {
        let _writer = self.writer.lock();
        let target = self.get(version).ok_or(GraphsmithError::GuardSetNotFound(version))?;
        *self.active.write() = Arc::clone(&target);
        Ok(target)
    }

    #[must_use]
    pub fn get(&self, version: u64) -> Option<Arc<GuardSet>> {
        self.history.read().get(&version).cloned()
    }

    /// Every retained version, oldest first.
    #[must_use]
    pub fn history(&self) -> Vec<Arc<GuardSet>> {
        self.history.read().values().cloned().collect()
    }
}
