//! # Provenance Storage
//!
//! Backends for the append-only provenance log.
//!
//! - `MemoryStore`: a vector, for tests and validation runs
//! - `RedbStore`: redb tables, ACID and crash safe
//!
//! Stores never assign sequence numbers; the registry does. A store only
//! has to make re-appending a sequence harmless.

pub mod memory;
pub mod redb_store;

pub use memory::MemoryStore;
pub use redb_store::RedbStore;

use crate::GraphsmithError;
use crate::provenance::{MetaDecision, ProvenanceRecord};

/// Durable home of provenance records and meta decisions.
pub trait ProvenanceStore: Send {
    /// Persist a record. Re-putting an existing sequence is not an error.
    fn put_record(&mut self, record: &ProvenanceRecord) -> Result<(), GraphsmithError>;

    /// Persist a meta decision. Same idempotence as `put_record`.
    fn put_decision(&mut self, decision: &MetaDecision) -> Result<(), GraphsmithError>;

    /// Highest sequence used by any record or decision.
    fn last_sequence(&self) -> Result<Option<u64>, GraphsmithError>;

    /// Up to `limit` records with sequence greater than `after`, ascending.
    ///
    /// May contain repeated sequences; readers discard them.
    fn scan(&self, after: Option<u64>, limit: usize)
    -> Result<Vec<ProvenanceRecord>, GraphsmithError>;

    /// Every meta decision, ascending by sequence.
    fn decisions(&self) -> Result<Vec<MetaDecision>, GraphsmithError>;
}
