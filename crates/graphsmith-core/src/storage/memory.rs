//! In-memory provenance store.

use super::ProvenanceStore;
use crate::GraphsmithError;
use crate::provenance::{MetaDecision, ProvenanceRecord};

/// Append-only vectors. Duplicates are kept and filtered on read.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    records: Vec<ProvenanceRecord>,
    decisions: Vec<MetaDecision>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw entries, duplicates included.
    #[must_use]
    pub fn raw_len(&self) -> usize {
        self.records.len()
    }
}

impl ProvenanceStore for MemoryStore {
    fn put_record(&mut self, record: &ProvenanceRecord) -> Result<(), GraphsmithError> {
        self.records.push(record.clone());
        Ok(())
    }

    fn put_decision(&mut self, decision: &MetaDecision) -> Result<(), GraphsmithError> {
        self.decisions.push(decision.clone());
        Ok(())
    }

    fn last_sequence(&self) -> Result<Option<u64>, GraphsmithError> {
        let records = self.records.iter().map(|r| r.sequence);
        let decisions = self.decisions.iter().map(|d| d.sequence);
        Ok(records.chain(decisions).max())
    }

    fn scan(
        &self,
        after: Option<u64>,
        limit: usize,
    ) -> Result<Vec<ProvenanceRecord>, GraphsmithError> {
        let mut page: Vec<ProvenanceRecord> = self
            .records
            .iter()
            .filter(|r| after.is_none_or(|a| r.sequence > a))
            .cloned()
            .collect();
        // Stable: among equal sequences the first appended stays first.
        page.sort_by_key(|r| r.sequence);
        page.truncate(limit);
        Ok(page)
    }

    fn decisions(&self) -> Result<Vec<MetaDecision>, GraphsmithError> {
        let mut out = self.decisions.clone();
        out.sort_by_key(|d| d.sequence);
        out.dedup_by_key(|d| d.sequence);
        Ok(out)
    }
}
