//! # Provenance Registry
//!
//! The append-only, sequenced log of every rule application attempt.
//!
//! ## Write Path
//!
//! `ProvenanceRegistry::append` assigns the next sequence number once, then
//! writes through the store, retrying the *same* sequence on failure. A
//! retried write can therefore never create a second logical record; the
//! reader discards any physical duplicates. After the retry policy is
//! exhausted the append fails with `ProvenanceWrite`.
//!
//! Concurrent producers go through a `ProvenanceHub`: one writer thread
//! that owns the registry and receives appends over a bounded channel.
//!
//! ## Read Path
//!
//! `ProvenanceRegistry::read` returns a lazy iterator that pages through the
//! store in sequence order, applying a `ProvenanceFilter`.

use crate::eval::Metrics;
use crate::primitives::{
    DEFAULT_WRITE_ATTEMPTS, DEFAULT_WRITE_BACKOFF_MS, READ_PAGE_SIZE, WRITER_QUEUE_CAPACITY,
};
use crate::storage::ProvenanceStore;
use crate::{Fingerprint, GraphsmithError, RuleId};
use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

// =============================================================================
// RECORDS
// =============================================================================

/// One rule application attempt: (beam member × rule) at one depth.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvenanceRecord {
    /// Assigned by the registry; producers leave it at 0.
    pub sequence: u64,
    pub run_id: String,
    pub domain: String,
    pub depth: usize,
    pub rule_index: usize,
    pub rule_id: RuleId,
    pub rule_version: u32,
    pub guard_set_version: u64,
    pub parent_fingerprint: Fingerprint,
    /// Absent when the attempt produced no candidate.
    pub child_fingerprint: Option<Fingerprint>,
    pub metrics_before: Metrics,
    pub metrics_after: Option<Metrics>,
    /// True iff one of the attempt's candidates entered the next beam.
    pub accepted: bool,
    pub error: Option<String>,
    /// Number of candidates the attempt produced.
    pub candidates: usize,
    /// Pre-edit numeric properties of the child's bound nodes.
    pub observations: BTreeMap<String, f64>,
}

impl ProvenanceRecord {
    /// Score change parent -> child, when the child was scored.
    #[must_use]
    pub fn delta(&self) -> Option<f64> {
        self.metrics_after
            .as_ref()
            .map(|after| after.score - self.metrics_before.score)
    }
}

/// Which Builder-Builder step produced a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DecisionKind {
    Proposal,
    Audit,
}

/// A golden scenario that regressed under a proposal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioRegression {
    pub scenario: String,
    pub before: f64,
    pub after: f64,
    pub budget_exhausted: bool,
}

/// One Builder-Builder verdict, kept next to the provenance records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetaDecision {
    pub sequence: u64,
    pub kind: DecisionKind,
    pub domain: String,
    pub strategy: String,
    pub active_version: u64,
    pub proposed: BTreeMap<String, f64>,
    pub rationale: String,
    pub aggregate_before: f64,
    pub aggregate_after: f64,
    pub accepted: bool,
    pub published_version: Option<u64>,
    pub regressions: Vec<ScenarioRegression>,
    pub reason: String,
}

/// Read-side selection of records.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProvenanceFilter {
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub guard_set_version: Option<u64>,
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default)]
    pub rule_id: Option<RuleId>,
}

impl ProvenanceFilter {
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    #[must_use]
    pub fn guard_set_version(mut self, version: u64) -> Self {
        self.guard_set_version = Some(version);
        self
    }

    #[must_use]
    pub fn run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    #[must_use]
    pub fn rule_id(mut self, rule_id: impl Into<RuleId>) -> Self {
        self.rule_id = Some(rule_id.into());
        self
    }

    #[must_use]
    pub fn matches(&self, record: &ProvenanceRecord) -> bool {
        self.domain.as_ref().is_none_or(|d| *d == record.domain)
            && self
                .guard_set_version
                .is_none_or(|v| v == record.guard_set_version)
            && self.run_id.as_ref().is_none_or(|r| *r == record.run_id)
            && self.rule_id.as_ref().is_none_or(|r| *r == record.rule_id)
    }
}

// =============================================================================
// SINKS
// =============================================================================

/// Anything the search engine and the Builder-Builder can append to.
pub trait ProvenanceSink: Send + Sync {
    fn append(&self, record: ProvenanceRecord) -> Result<u64, GraphsmithError>;

    fn append_decision(&self, decision: MetaDecision) -> Result<u64, GraphsmithError>;
}

/// Discards everything. Used for golden-suite validation runs.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl ProvenanceSink for NullSink {
    fn append(&self, _record: ProvenanceRecord) -> Result<u64, GraphsmithError> {
        Ok(0)
    }

    fn append_decision(&self, _decision: MetaDecision) -> Result<u64, GraphsmithError> {
        Ok(0)
    }
}

// =============================================================================
// REGISTRY
// =============================================================================

/// Retry schedule for durable appends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_WRITE_ATTEMPTS,
            backoff_ms: DEFAULT_WRITE_BACKOFF_MS,
        }
    }
}

/// A store plus the monotonic sequencer.
#[derive(Debug)]
pub struct ProvenanceRegistry<S> {
    store: Mutex<S>,
    next: AtomicU64,
    retry: RetryPolicy,
}

impl<S: ProvenanceStore> ProvenanceRegistry<S> {
    /// Wrap a store, continuing after its highest stored sequence.
    pub fn new(store: S) -> Result<Self, GraphsmithError> {
        let next = store.last_sequence()?.map_or(0, |s| s.saturating_add(1));
        Ok(Self {
            store: Mutex::new(store),
            next: AtomicU64::new(next),
            retry: RetryPolicy::default(),
        })
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// The sequence the next append will receive.
    #[must_use]
    pub fn next_sequence(&self) -> u64 {
        self.next.load(Ordering::SeqCst)
    }

    fn write_with_retry(
        &self,
        sequence: u64,
        mut write: impl FnMut(&mut S) -> Result<(), GraphsmithError>,
    ) -> Result<u64, GraphsmithError> {
        let attempts = self.retry.max_attempts.max(1);
        let mut last_error = String::new();
        for attempt in 1..=attempts {
            match write(&mut self.store.lock()) {
                Ok(()) => return Ok(sequence),
                Err(e) => {
                    tracing::warn!(sequence, attempt, error = %e, "provenance write failed");
                    last_error = e.to_string();
                    if attempt < attempts && self.retry.backoff_ms > 0 {
                        std::thread::sleep(Duration::from_millis(self.retry.backoff_ms));
                    }
                }
            }
        }
        Err(GraphsmithError::ProvenanceWrite {
            sequence,
            attempts,
            reason: last_error,
        })
    }

    /// Append a record, returning its sequence number.
    pub fn append(&self, mut record: ProvenanceRecord) -> Result<u64, GraphsmithError> {
        record.sequence = self.next.fetch_add(1, Ordering::SeqCst);
        self.write_with_retry(record.sequence, |store| store.put_record(&record))
    }

    /// Append a meta decision. Shares the record sequence space.
    pub fn append_decision(&self, mut decision: MetaDecision) -> Result<u64, GraphsmithError> {
        decision.sequence = self.next.fetch_add(1, Ordering::SeqCst);
        self.write_with_retry(decision.sequence, |store| store.put_decision(&decision))
    }

    /// Lazily read matching records in sequence order.
    #[must_use]
    pub fn read(&self, filter: ProvenanceFilter) -> ProvenanceIter<'_, S> {
        ProvenanceIter {
            registry: self,
            filter,
            cursor: None,
            buffer: VecDeque::new(),
            done: false,
        }
    }

    pub fn decisions(&self) -> Result<Vec<MetaDecision>, GraphsmithError> {
        self.store.lock().decisions()
    }

    /// Run a closure against the underlying store.
    pub fn with_store<T>(&self, f: impl FnOnce(&mut S) -> T) -> T {
        f(&mut self.store.lock())
    }

    #[must_use]
    pub fn into_store(self) -> S {
        self.store.into_inner()
    }
}

impl<S: ProvenanceStore> ProvenanceSink for ProvenanceRegistry<S> {
    fn append(&self, record: ProvenanceRecord) -> Result<u64, GraphsmithError> {
        ProvenanceRegistry::append(self, record)
    }

    fn append_decision(&self, decision: MetaDecision) -> Result<u64, GraphsmithError> {
        ProvenanceRegistry::append_decision(self, decision)
    }
}

/// Lazy, paged, de-duplicating reader.
pub struct ProvenanceIter<'a, S> {
    registry: &'a ProvenanceRegistry<S>,
    filter: ProvenanceFilter,
    /// Highest sequence already yielded or skipped.
    cursor: Option<u64>,
    buffer: VecDeque<ProvenanceRecord>,
    done: bool,
}

impl<S: ProvenanceStore> Iterator for ProvenanceIter<'_, S> {
    type Item = Result<ProvenanceRecord, GraphsmithError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(record) = self.buffer.pop_front() {
                if self.cursor.is_some_and(|c| record.sequence <= c) {
                    continue;
                }
                self.cursor = Some(record.sequence);
                if self.filter.matches(&record) {
                    return Some(Ok(record));
                }
                continue;
            }
            if self.done {
                return None;
            }
            let page = match self
                .registry
                .store
                .lock()
                .scan(self.cursor, READ_PAGE_SIZE)
            {
                Ok(page) => page,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            };
            if page.len() < READ_PAGE_SIZE {
                self.done = true;
            }
            if page.is_empty() {
                return None;
            }
            self.buffer.extend(page);
        }
    }
}

// =============================================================================
// HUB (single writer thread)
// =============================================================================

enum Command {
    Record(ProvenanceRecord, Sender<Result<u64, GraphsmithError>>),
    Decision(MetaDecision, Sender<Result<u64, GraphsmithError>>),
    Shutdown,
}

/// Owns a registry on a dedicated writer thread.
///
/// Created with [`ProvenanceHub::start`]; stopped with
/// [`ProvenanceHub::shutdown`], which hands the registry back.
pub struct ProvenanceHub<S> {
    sender: Sender<Command>,
    handle: Option<JoinHandle<ProvenanceRegistry<S>>>,
}

impl<S: ProvenanceStore + 'static> ProvenanceHub<S> {
    pub fn start(registry: ProvenanceRegistry<S>) -> Result<Self, GraphsmithError> {
        let (sender, receiver) = crossbeam_channel::bounded(WRITER_QUEUE_CAPACITY);
        let handle = std::thread::Builder::new()
            .name("graphsmith-provenance".to_string())
            .spawn(move || {
                writer_loop(&registry, &receiver);
                registry
            })
            .map_err(|e| GraphsmithError::Io(e.to_string()))?;
        tracing::debug!("provenance writer started");
        Ok(Self {
            sender,
            handle: Some(handle),
        })
    }

    /// A cloneable handle producers append through.
    #[must_use]
    pub fn appender(&self) -> ProvenanceAppender {
        ProvenanceAppender {
            sender: self.sender.clone(),
        }
    }

    /// Drain the queue, stop the writer and return the registry.
    pub fn shutdown(mut self) -> Result<ProvenanceRegistry<S>, GraphsmithError> {
        self.stop()
            .ok_or(GraphsmithError::WriterClosed)?
            .map_err(|_| GraphsmithError::Io("provenance writer panicked".to_string()))
    }

    fn stop(&mut self) -> Option<std::thread::Result<ProvenanceRegistry<S>>> {
        let handle = self.handle.take()?;
        // A send error means the writer is already gone; join reports why.
        let _ = self.sender.send(Command::Shutdown);
        let joined = handle.join();
        tracing::debug!("provenance writer stopped");
        Some(joined)
    }
}

impl<S> Drop for ProvenanceHub<S> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = self.sender.send(Command::Shutdown);
            let _ = handle.join();
        }
    }
}

fn writer_loop<S: ProvenanceStore>(
    registry: &ProvenanceRegistry<S>,
    receiver: &Receiver<Command>,
) {
    for command in receiver {
        match command {
            Command::Record(record, reply) => {
                let _ = reply.send(registry.append(record));
            }
            Command::Decision(decision, reply) => {
                let _ = reply.send(registry.append_decision(decision));
            }
            Command::Shutdown => return,
        }
    }
}

/// Producer side of a [`ProvenanceHub`].
#[derive(Debug, Clone)]
pub struct ProvenanceAppender {
    sender: Sender<Command>,
}

impl ProvenanceAppender {
    fn request(
        &self,
        make: impl FnOnce(Sender<Result<u64, GraphsmithError>>) -> Command,
    ) -> Result<u64, GraphsmithError> {
        let (reply, response) = crossbeam_channel::bounded(1);
        self.sender
            .send(make(reply))
            .map_err(|_| GraphsmithError::WriterClosed)?;
        response.recv().map_err(|_| GraphsmithError::WriterClosed)?
    }
}

impl ProvenanceSink for ProvenanceAppender {
    fn append(&self, record: ProvenanceRecord) -> Result<u64, GraphsmithError> {
        self.request(|reply| Command::Record(record, reply))
    }

    fn append_decision(&self, decision: MetaDecision) -> Result<u64, GraphsmithError> {
        self.request(|reply| Command::Decision(decision, reply))
    }
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Record(r, _) => write!(f, "Record(run={}, rule={})", r.run_id, r.rule_id),
            Self::Decision(d, _) => write!(f, "Decision(strategy={})", d.strategy),
            Self::Shutdown => f.write_str("Shutdown"),
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    pub(crate) fn sample(run_id: &str, domain: &str, guard_set_version: u64) -> ProvenanceRecord {
        ProvenanceRecord {
            sequence: 0,
            run_id: run_id.to_string(),
            domain: domain.to_string(),
            depth: 1,
            rule_index: 0,
            rule_id: RuleId::new("R1"),
            rule_version: 1,
            guard_set_version,
            parent_fingerprint: Fingerprint([0; 32]),
            child_fingerprint: None,
            metrics_before: Metrics::new(0.0),
            metrics_after: None,
            accepted: false,
            error: None,
            candidates: 0,
            observations: BTreeMap::new(),
        }
    }

    /// Fails the first `failures` writes, then delegates.
    struct FlakyStore {
        inner: MemoryStore,
        failures: u32,
    }

    impl ProvenanceStore for FlakyStore {
        fn put_record(&mut self, record: &ProvenanceRecord) -> Result<(), GraphsmithError> {
            // Simulates a write that landed but whose commit was not acknowledged.
            self.inner.put_record(record)?;
            if self.failures > 0 {
                self.failures -= 1;
                return Err(GraphsmithError::Io("disk hiccup".to_string()));
            }
            Ok(())
        }

        fn put_decision(&mut self, decision: &MetaDecision) -> Result<(), GraphsmithError> {
            self.inner.put_decision(decision)
        }

        fn last_sequence(&self) -> Result<Option<u64>, GraphsmithError> {
            self.inner.last_sequence()
        }

        fn scan(
            &self,
            after: Option<u64>,
            limit: usize,
        ) -> Result<Vec<ProvenanceRecord>, GraphsmithError> {
            self.inner.scan(after, limit)
        }

        fn decisions(&self) -> Result<Vec<MetaDecision>, GraphsmithError> {
            self.inner.decisions()
        }
    }

    fn no_backoff(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            backoff_ms: 0,
        }
    }

    #[test]
    fn sequences_are_monotonic() {
        let registry = ProvenanceRegistry::new(MemoryStore::new()).expect("registry");
        let a = registry.append(sample("r", "d", 0)).expect("a");
        let b = registry.append(sample("r", "d", 0)).expect("b");
        assert_eq!((a, b), (0, 1));
        assert_eq!(registry.next_sequence(), 2);
    }

    #[test]
    fn retried_append_is_read_once() {
        let store = FlakyStore {
            inner: MemoryStore::new(),
            failures: 2,
        };
        let registry = ProvenanceRegistry::new(store)
            .expect("registry")
            .with_retry(no_backoff(3));
        let seq = registry.append(sample("r", "d", 0)).expect("append");
        assert_eq!(seq, 0);
        assert_eq!(registry.with_store(|s| s.inner.raw_len()), 3);

        let read: Vec<_> = registry
            .read(ProvenanceFilter::all())
            .collect::<Result<_, _>>()
            .expect("read");
        assert_eq!(read.len(), 1);
    }

    #[test]
    fn exhausted_retries_fail_loudly() {
        let store = FlakyStore {
            inner: MemoryStore::new(),
            failures: 5,
        };
        let registry = ProvenanceRegistry::new(store)
            .expect("registry")
            .with_retry(no_backoff(2));
        let err = registry.append(sample("r", "d", 0));
        assert!(matches!(
            err,
            Err(GraphsmithError::ProvenanceWrite {
                sequence: 0,
                attempts: 2,
                ..
            })
        ));
    }

    #[test]
    fn filter_by_domain_and_version() {
        let registry = ProvenanceRegistry::new(MemoryStore::new()).expect("registry");
        registry.append(sample("r1", "rod", 0)).expect("append");
        registry.append(sample("r1", "beam", 0)).expect("append");
        registry.append(sample("r2", "rod", 1)).expect("append");

        let rod: Vec<_> = registry
            .read(ProvenanceFilter::all().domain("rod"))
            .collect::<Result<_, _>>()
            .expect("read");
        assert_eq!(rod.len(), 2);

        let v1: Vec<_> = registry
            .read(ProvenanceFilter::all().domain("rod").guard_set_version(1))
            .collect::<Result<_, _>>()
            .expect("read");
        assert_eq!(v1.len(), 1);
        assert_eq!(v1[0].run_id, "r2");
    }

    #[test]
    fn reader_pages_past_page_size() {
        let registry = ProvenanceRegistry::new(MemoryStore::new()).expect("registry");
        let total = READ_PAGE_SIZE + 7;
        for _ in 0..total {
            registry.append(sample("r", "d", 0)).expect("append");
        }
        let sequences: Vec<u64> = registry
            .read(ProvenanceFilter::all())
            .map(|r| r.expect("record").sequence)
            .collect();
        assert_eq!(sequences.len(), total);
        assert!(sequences.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn registry_resumes_after_stored_sequence() {
        let registry = ProvenanceRegistry::new(MemoryStore::new()).expect("registry");
        registry.append(sample("r", "d", 0)).expect("append");
        registry.append(sample("r", "d", 0)).expect("append");
        let reopened = ProvenanceRegistry::new(registry.into_store()).expect("reopen");
        assert_eq!(reopened.next_sequence(), 2);
    }

    #[test]
    fn hub_serializes_concurrent_appends() {
        let registry = ProvenanceRegistry::new(MemoryStore::new()).expect("registry");
        let hub = ProvenanceHub::start(registry).expect("start");

        std::thread::scope(|scope| {
            for t in 0..4 {
                let appender = hub.appender();
                scope.spawn(move || {
                    for _ in 0..25 {
                        appender
                            .append(sample(&format!("run-{t}"), "d", 0))
                            .expect("append");
                    }
                });
            }
        });

        let registry = hub.shutdown().expect("shutdown");
        let sequences: Vec<u64> = registry
            .read(ProvenanceFilter::all())
            .map(|r| r.expect("record").sequence)
            .collect();
        assert_eq!(sequences, (0..100).collect::<Vec<u64>>());
    }

    #[test]
    fn appender_fails_after_shutdown() {
        let registry = ProvenanceRegistry::new(MemoryStore::new()).expect("registry");
        let hub = ProvenanceHub::start(registry).expect("start");
        let appender = hub.appender();
        hub.shutdown().expect("shutdown");
        assert!(matches!(
            appender.append(sample("r", "d", 0)),
            Err(GraphsmithError::WriterClosed)
        ));
    }
}
