//! # redb-backed Provenance Store
//!
//! Records and decisions live in their own tables keyed by sequence number,
//! encoded with postcard. A put for a sequence that already exists is
//! skipped inside the same write transaction, so a retried append can
//! never produce a second copy.
//!
//! Best designs are kept in a third table keyed by run id, in the
//! canonical graph export format.

use super::ProvenanceStore;
use crate::canonical::{export_graph, import_graph};
use crate::eval::Metrics;
use crate::provenance::{MetaDecision, ProvenanceRecord};
use crate::search::BestDesign;
use crate::GraphsmithError;
use redb::{Database, ReadableDatabase, ReadableTable, ReadableTableMetadata, TableDefinition};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Table for records: sequence(u64) -> postcard ProvenanceRecord
const RECORDS: TableDefinition<u64, &[u8]> = TableDefinition::new("records");

/// Table for meta decisions: sequence(u64) -> postcard MetaDecision
const DECISIONS: TableDefinition<u64, &[u8]> = TableDefinition::new("decisions");

/// Table for best designs: run id -> postcard StoredDesign
const DESIGNS: TableDefinition<&str, &[u8]> = TableDefinition::new("designs");

/// Table for metadata: key string -> value u64
const METADATA: TableDefinition<&str, u64> = TableDefinition::new("metadata");

fn io(e: impl std::fmt::Display) -> GraphsmithError {
    GraphsmithError::Io(e.to_string())
}

/// A best design as stored on disk.
#[derive(Debug, Serialize, Deserialize)]
struct StoredDesign {
    graph: Vec<u8>,
    metrics: Metrics,
    guard_set_version: u64,
}

/// A disk-backed provenance store using redb.
pub struct RedbStore {
    db: Database,
}

impl std::fmt::Debug for RedbStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbStore").finish_non_exhaustive()
    }
}

impl RedbStore {
    /// Open or create a provenance database at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, GraphsmithError> {
        let db = Database::create(path.as_ref()).map_err(io)?;

        // Initialize tables if they don't exist
        {
            let write_txn = db.begin_write().map_err(io)?;
            let _ = write_txn.open_table(RECORDS).map_err(io)?;
            let _ = write_txn.open_table(DECISIONS).map_err(io)?;
            let _ = write_txn.open_table(DESIGNS).map_err(io)?;
            let _ = write_txn.open_table(METADATA).map_err(io)?;
            write_txn.commit().map_err(io)?;
        }

        Ok(Self { db })
    }

    /// Number of stored records.
    pub fn record_count(&self) -> Result<u64, GraphsmithError> {
        let read_txn = self.db.begin_read().map_err(io)?;
        let table = read_txn.open_table(RECORDS).map_err(io)?;
        table.len().map_err(io)
    }

    /// Store the best design of a run, replacing any previous one.
    pub fn save_design(&mut self, run_id: &str, design: &BestDesign) -> Result<(), GraphsmithError> {
        let stored = StoredDesign {
            graph: export_graph(&design.graph)?,
            metrics: design.metrics.clone(),
            guard_set_version: design.guard_set_version,
        };
        let bytes = postcard::to_allocvec(&stored)
            .map_err(|e| GraphsmithError::Serialization(e.to_string()))?;

        let write_txn = self.db.begin_write().map_err(io)?;
        {
            let mut table = write_txn.open_table(DESIGNS).map_err(io)?;
            table.insert(run_id, bytes.as_slice()).map_err(io)?;
        }
        write_txn.commit().map_err(io)?;
        Ok(())
    }

    /// Load the best design stored for a run.
    pub fn load_design(&self, run_id: &str) -> Result<Option<BestDesign>, GraphsmithError> {
        let read_txn = self.db.begin_read().map_err(io)?;
        let table = read_txn.open_table(DESIGNS).map_err(io)?;
        let Some(data) = table.get(run_id).map_err(io)? else {
            return Ok(None);
        };
        let stored: StoredDesign = postcard::from_bytes(data.value())
            .map_err(|e| GraphsmithError::Serialization(e.to_string()))?;
        Ok(Some(BestDesign {
            graph: import_graph(&stored.graph)?,
            metrics: stored.metrics,
            guard_set_version: stored.guard_set_version,
        }))
    }

    /// Run ids with a stored design, ascending.
    pub fn design_runs(&self) -> Result<Vec<String>, GraphsmithError> {
        let read_txn = self.db.begin_read().map_err(io)?;
        let table = read_txn.open_table(DESIGNS).map_err(io)?;
        let mut out = Vec::new();
        for entry in table.iter().map_err(io)? {
            let (key, _) = entry.map_err(io)?;
            out.push(key.value().to_string());
        }
        Ok(out)
    }

    fn put_sequenced(
        &mut self,
        definition: TableDefinition<'static, u64, &'static [u8]>,
        sequence: u64,
        bytes: &[u8],
    ) -> Result<(), GraphsmithError> {
        let write_txn = self.db.begin_write().map_err(io)?;
        {
            let mut table = write_txn.open_table(definition).map_err(io)?;
            if table.get(sequence).map_err(io)?.is_some() {
                tracing::debug!(sequence, "sequence already stored, skipping");
                return Ok(());
            }
            table.insert(sequence, bytes).map_err(io)?;

            let mut meta = write_txn.open_table(METADATA).map_err(io)?;
            let last = meta
                .get("last_sequence")
                .map_err(io)?
                .map(|v| v.value());
            if last.is_none_or(|l| sequence > l) {
                meta.insert("last_sequence", sequence).map_err(io)?;
            }
        }
        write_txn.commit().map_err(io)?;
        Ok(())
    }
}

impl ProvenanceStore for RedbStore {
    fn put_record(&mut self, record: &ProvenanceRecord) -> Result<(), GraphsmithError> {
        let bytes = postcard::to_allocvec(record)
            .map_err(|e| GraphsmithError::Serialization(e.to_string()))?;
        self.put_sequenced(RECORDS, record.sequence, &bytes)
    }

    fn put_decision(&mut self, decision: &MetaDecision) -> Result<(), GraphsmithError> {
        let bytes = postcard::to_allocvec(decision)
            .map_err(|e| GraphsmithError::Serialization(e.to_string()))?;
        self.put_sequenced(DECISIONS, decision.sequence, &bytes)
    }

    fn last_sequence(&self) -> Result<Option<u64>, GraphsmithError> {
        let read_txn = self.db.begin_read().map_err(io)?;
        let table = read_txn.open_table(METADATA).map_err(io)?;
        Ok(table.get("last_sequence").map_err(io)?.map(|v| v.value()))
    }

    fn scan(
        &self,
        after: Option<u64>,
        limit: usize,
    ) -> Result<Vec<ProvenanceRecord>, GraphsmithError> {
        let start = match after {
            None => 0,
            Some(u64::MAX) => return Ok(Vec::new()),
            Some(a) => a + 1,
        };
        let read_txn = self.db.begin_read().map_err(io)?;
        let table = read_txn.open_table(RECORDS).map_err(io)?;
        let mut out = Vec::new();
        for entry in table.range(start..).map_err(io)? {
            if out.len() >= limit {
                break;
            }
            let (_, value) = entry.map_err(io)?;
            let record: ProvenanceRecord = postcard::from_bytes(value.value())
                .map_err(|e| GraphsmithError::Serialization(e.to_string()))?;
            out.push(record);
        }
        Ok(out)
    }

    fn decisions(&self) -> Result<Vec<MetaDecision>, GraphsmithError> {
        let read_txn = self.db.begin_read().map_err(io)?;
        let table = read_txn.open_table(DECISIONS).map_err(io)?;
        let mut out = Vec::new();
        for entry in table.iter().map_err(io)? {
            let (_, value) = entry.map_err(io)?;
            let decision: MetaDecision = postcard::from_bytes(value.value())
                .map_err(|e| GraphsmithError::Serialization(e.to_string()))?;
            out.push(decision);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Graph, Node};
    use crate::{Fingerprint, RuleId};
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    fn record(sequence: u64) -> ProvenanceRecord {
        ProvenanceRecord {
            sequence,
            run_id: "run-1".to_string(),
            domain: "rod".to_string(),
            depth: 1,
            rule_index: 0,
            rule_id: RuleId::new("R1"),
            rule_version: 1,
            guard_set_version: 0,
            parent_fingerprint: Fingerprint([1; 32]),
            child_fingerprint: Some(Fingerprint([2; 32])),
            metrics_before: Metrics::new(-3.0),
            metrics_after: Some(Metrics::new(-2.0).with_extra("length", 1.5)),
            accepted: true,
            error: None,
            candidates: 1,
            observations: BTreeMap::from([("x.length".to_string(), 1.0)]),
        }
    }

    #[test]
    fn records_persist_across_reopen() {
        let temp = tempdir().expect("temp dir");
        let db_path = temp.path().join("prov.redb");
        {
            let mut store = RedbStore::open(&db_path).expect("open db");
            store.put_record(&record(0)).expect("put");
            store.put_record(&record(1)).expect("put");
        }
        let store = RedbStore::open(&db_path).expect("reopen db");
        assert_eq!(store.last_sequence().expect("last"), Some(1));
        let page = store.scan(None, 10).expect("scan");
        assert_eq!(page.len(), 2);
        assert_eq!(page[1], record(1));
    }

    #[test]
    fn duplicate_sequence_is_skipped() {
        let temp = tempdir().expect("temp dir");
        let mut store = RedbStore::open(temp.path().join("prov.redb")).expect("open db");
        store.put_record(&record(5)).expect("put");
        let mut altered = record(5);
        altered.accepted = false;
        store.put_record(&altered).expect("re-put");
        assert_eq!(store.record_count().expect("count"), 1);
        assert!(store.scan(None, 10).expect("scan")[0].accepted);
    }

    #[test]
    fn scan_pages_after_cursor() {
        let temp = tempdir().expect("temp dir");
        let mut store = RedbStore::open(temp.path().join("prov.redb")).expect("open db");
        for seq in 0..5 {
            store.put_record(&record(seq)).expect("put");
        }
        let page = store.scan(Some(1), 2).expect("scan");
        let seqs: Vec<u64> = page.iter().map(|r| r.sequence).collect();
        assert_eq!(seqs, vec![2, 3]);
    }

    #[test]
    fn design_roundtrip() {
        let temp = tempdir().expect("temp dir");
        let mut store = RedbStore::open(temp.path().join("prov.redb")).expect("open db");
        let graph = Graph::new()
            .with_node(Node::new("seg1", "Segment").with_prop("material", "steel"))
            .expect("seg1");
        let design = BestDesign {
            graph: graph.clone(),
            metrics: Metrics::new(-1.25),
            guard_set_version: 3,
        };
        store.save_design("run-1", &design).expect("save");
        let loaded = store.load_design("run-1").expect("load").expect("present");
        assert_eq!(loaded.graph.fingerprint(), graph.fingerprint());
        assert_eq!(loaded.metrics, design.metrics);
        assert_eq!(loaded.guard_set_version, 3);
        assert!(store.load_design("run-2").expect("load").is_none());
        assert_eq!(store.design_runs().expect("runs"), vec!["run-1".to_string()]);
    }
}
