//! In-memory store for tests and embedding.
//!
//! Reads and inserts take the lock separately, so concurrent writers race
//! exactly as they would against a real database.

use super::{InsertOutcome, RecordStore, UsageSink};
use crate::error::StoreError;
use crate::model::{AnalysisRecord, GroupKey, NewRecord, UsageEvent, UsageTotals, Version, VersionSummary};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Default)]
struct Tables {
    records: HashMap<GroupKey, BTreeMap<Version, AnalysisRecord>>,
    usage: Vec<UsageEvent>,
    next_id: i64,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every usage entry recorded so far, in insertion order.
    pub fn usage_events(&self) -> Vec<UsageEvent> {
        self.lock().usage.clone()
    }

    pub fn record_count(&self) -> usize {
        self.lock().records.values().map(BTreeMap::len).sum()
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn max_version(&self, group: &GroupKey) -> Result<Version, StoreError> {
        Ok(self
            .lock()
            .records
            .get(group)
            .and_then(|versions| versions.keys().next_back().copied())
            .unwrap_or(0))
    }

    async fn insert_version(&self, record: NewRecord) -> Result<InsertOutcome, StoreError> {
        let mut tables = self.lock();
        tables.next_id += 1;
        let id = tables.next_id;

        let versions = tables.records.entry(record.group.clone()).or_default();
        if versions.contains_key(&record.version) {
            return Ok(InsertOutcome::Conflict);
        }

        let committed = AnalysisRecord {
            id,
            group: record.group,
            version: record.version,
            payload: record.payload,
            created_at: record.created_at,
        };
        versions.insert(committed.version, committed.clone());
        Ok(InsertOutcome::Committed(committed))
    }

    async fn list_versions(&self, group: &GroupKey) -> Result<Vec<VersionSummary>, StoreError> {
        Ok(self
            .lock()
            .records
            .get(group)
            .map(|versions| {
                versions
                    .values()
                    .rev()
                    .map(|r| VersionSummary {
                        version: r.version,
                        created_at: r.created_at,
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn get_version(
        &self,
        group: &GroupKey,
        version: Option<Version>,
    ) -> Result<Option<AnalysisRecord>, StoreError> {
        let tables = self.lock();
        let Some(versions) = tables.records.get(group) else {
            return Ok(None);
        };
        Ok(match version {
            Some(v) => versions.get(&v).cloned(),
            None => versions.values().next_back().cloned(),
        })
    }
}

#[async_trait]
impl UsageSink for MemoryStore {
    async fn record_usage(&self, event: &UsageEvent) -> Result<(), StoreError> {
        self.lock().usage.push(event.clone());
        Ok(())
    }

    async fn usage_totals(&self, subject_id: &str) -> Result<UsageTotals, StoreError> {
        let tables = self.lock();
        Ok(tables
            .usage
            .iter()
            .filter(|e| e.subject_id == subject_id)
            .fold(UsageTotals::default(), |mut totals, e| {
                totals.runs += 1;
                totals.input_units += e.usage.input_units;
                totals.output_units += e.usage.output_units;
                totals.total_units += e.usage.total_units;
                totals
            }))
    }
}
