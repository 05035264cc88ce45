//! Keyed change-data-capture merge.
//!
//! [`CurrentStateTable`] holds one row per key, the logically latest version
//! as ordered by the configured sequence field, independent of arrival
//! order. [`CurrentStateTable::apply_changes`] merges a change batch in two
//! phases: candidate selection per key outside the lock, then a single
//! write-locked commit section so downstream readers only ever observe a
//! batch fully applied or not at all. The commit section takes no await
//! points and never blocks on I/O.
//!
//! Ties on the sequence value resolve to the later occurrence in batch
//! order; batch order is stable input order, the only deterministic ordering
//! the source supplies. Against existing state a candidate replaces when its
//! sequence is greater *or equal*, so redelivered rows are idempotent
//! overwrites. Stale candidates are discarded and counted, never errors.

use crate::record::SharedRecord;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use std::cmp::Ordering;
use std::sync::RwLock;
use tidemill_core::Value;
use tracing::{debug, warn};

/// Hashable canonical form of one key field value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum KeyAtom {
    Bool(bool),
    Int(i64),
    /// Float bit pattern, stable for hashing.
    Bits(u64),
    Str(String),
    Timestamp(i64),
}

impl KeyAtom {
    /// Null values produce no atom: rows with null keys are anomalies.
    fn from_value(v: &Value) -> Option<Self> {
        match v {
            Value::Null => None,
            Value::Bool(b) => Some(KeyAtom::Bool(*b)),
            Value::Int(i) => Some(KeyAtom::Int(*i)),
            Value::Float(f) => Some(KeyAtom::Bits(f.to_bits())),
            Value::Str(s) => Some(KeyAtom::Str(s.clone())),
            Value::Timestamp(ns) => Some(KeyAtom::Timestamp(*ns)),
        }
    }
}

/// Composite merge key over the configured key fields.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MergeKey(SmallVec<[KeyAtom; 2]>);

impl MergeKey {
    fn from_record(record: &SharedRecord, key_fields: &[String]) -> Option<Self> {
        let mut atoms = SmallVec::new();
        for field in key_fields {
            atoms.push(KeyAtom::from_value(record.get(field)?)?);
        }
        Some(MergeKey(atoms))
    }

    fn from_values(values: &[Value]) -> Option<Self> {
        let mut atoms = SmallVec::new();
        for v in values {
            atoms.push(KeyAtom::from_value(v)?);
        }
        Some(MergeKey(atoms))
    }
}

struct StoredRow {
    seq: Value,
    record: SharedRecord,
}

struct TableInner {
    rows: FxHashMap<MergeKey, StoredRow>,
    /// Bumps once per mutating commit.
    version: u64,
}

/// Outcome of one merge commit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    /// Rows in the incoming batch.
    pub batch_rows: usize,
    /// New keys inserted.
    pub inserted: usize,
    /// Existing keys replaced by a newer-or-equal sequence.
    pub replaced: usize,
    /// Idempotent redeliveries: equal sequence, identical content.
    pub unchanged: usize,
    /// Candidates older than the stored row, discarded.
    pub discarded_late: usize,
    /// Rows with a null/missing key or sequence, or an incomparable
    /// sequence type.
    pub anomalies: usize,
    /// Within-batch rows superseded by a newer candidate for their key.
    pub superseded_in_batch: usize,
    /// Table version after the commit.
    pub version: u64,
    /// Table size after the commit.
    pub state_rows: usize,
}

impl MergeReport {
    /// True when the commit mutated the table.
    pub fn changed(&self) -> bool {
        self.inserted > 0 || self.replaced > 0
    }
}

/// Consistent point-in-time view of the table.
#[derive(Debug, Clone)]
pub struct StateSnapshot {
    pub rows: Vec<SharedRecord>,
    pub version: u64,
}

/// The keyed current-state table.
pub struct CurrentStateTable {
    key_fields: Vec<String>,
    sequence_field: String,
    inner: RwLock<TableInner>,
}

impl CurrentStateTable {
    pub fn new(key_fields: Vec<String>, sequence_field: impl Into<String>) -> Self {
        Self {
            key_fields,
            sequence_field: sequence_field.into(),
            inner: RwLock::new(TableInner {
                rows: FxHashMap::default(),
                version: 0,
            }),
        }
    }

    pub fn key_fields(&self) -> &[String] {
        &self.key_fields
    }

    pub fn sequence_field(&self) -> &str {
        &self.sequence_field
    }

    /// Merge a change batch into the table.
    ///
    /// Phase 1 selects, per key, the batch row with the maximum sequence
    /// value (later batch position wins ties). Phase 2 compares candidates
    /// against stored rows and commits every replacement under one write
    /// lock, so readers see all of the batch's effects or none.
    pub fn apply_changes(&self, batch: &[SharedRecord]) -> MergeReport {
        let mut report = MergeReport {
            batch_rows: batch.len(),
            ..MergeReport::default()
        };

        // Phase 1: per-key candidate selection, outside the lock.
        let mut candidates: FxHashMap<MergeKey, (Value, SharedRecord)> = FxHashMap::default();
        for record in batch {
            let Some(key) = MergeKey::from_record(record, &self.key_fields) else {
                warn!(record = %record, "change event missing or null key field, discarding");
                report.anomalies += 1;
                continue;
            };
            let seq = match record.get(&self.sequence_field) {
                Some(v) if !v.is_null() => v.clone(),
                _ => {
                    warn!(
                        field = %self.sequence_field,
                        record = %record,
                        "change event missing or null sequence value, discarding"
                    );
                    report.anomalies += 1;
                    continue;
                }
            };
            match candidates.entry(key) {
                std::collections::hash_map::Entry::Occupied(mut entry) => {
                    match seq.compare(&entry.get().0) {
                        // Equal keeps the later batch position: last wins ties
                        Some(Ordering::Greater) | Some(Ordering::Equal) => {
                            entry.insert((seq, record.clone()));
                        }
                        Some(Ordering::Less) => {}
                        None => {
                            warn!(
                                field = %self.sequence_field,
                                "incomparable sequence values within batch, discarding candidate"
                            );
                            report.anomalies += 1;
                        }
                    }
                }
                std::collections::hash_map::Entry::Vacant(entry) => {
                    entry.insert((seq, record.clone()));
                }
            }
        }
        report.superseded_in_batch = report
            .batch_rows
            .saturating_sub(report.anomalies + candidates.len());

        // Phase 2: commit under one write lock. No I/O, no awaits.
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        for (key, (seq, record)) in candidates {
            match inner.rows.get(&key) {
                None => {
                    inner.rows.insert(key, StoredRow { seq, record });
                    report.inserted += 1;
                }
                Some(existing) => match seq.compare(&existing.seq) {
                    Some(Ordering::Greater) => {
                        inner.rows.insert(key, StoredRow { seq, record });
                        report.replaced += 1;
                    }
                    Some(Ordering::Equal) => {
                        if existing.record == record {
                            report.unchanged += 1;
                        } else {
                            inner.rows.insert(key, StoredRow { seq, record });
                            report.replaced += 1;
                        }
                    }
                    Some(Ordering::Less) => {
                        debug!(sequence = %seq, stored = %existing.seq, "late change event discarded");
                        report.discarded_late += 1;
                    }
                    None => {
                        warn!(
                            candidate = %seq.type_name(),
                            stored = %existing.seq.type_name(),
                            "sequence type incomparable with stored row, discarding"
                        );
                        report.anomalies += 1;
                    }
                },
            }
        }
        if report.changed() {
            inner.version += 1;
        }
        report.version = inner.version;
        report.state_rows = inner.rows.len();
        report
    }

    /// Consistent snapshot of every stored row.
    pub fn snapshot(&self) -> StateSnapshot {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        StateSnapshot {
            rows: inner.rows.values().map(|r| r.record.clone()).collect(),
            version: inner.version,
        }
    }

    /// Fetch the stored row for a concrete key, if present.
    pub fn lookup(&self, key_values: &[Value]) -> Option<SharedRecord> {
        let key = MergeKey::from_values(key_values)?;
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.rows.get(&key).map(|r| r.record.clone())
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn version(&self) -> u64 {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).version
    }
}
