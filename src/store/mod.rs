//! Persistence boundary for analysis records and usage entries.
//!
//! The only cross-writer synchronization relied upon is the uniqueness of
//! `(group key, version)`: [`RecordStore::insert_version`] reports a lost race
//! as [`InsertOutcome::Conflict`] instead of an error.

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::error::StoreError;
use crate::model::{AnalysisRecord, GroupKey, NewRecord, UsageEvent, UsageTotals, Version, VersionSummary};
use async_trait::async_trait;

/// Outcome of a conditional insert.
#[derive(Debug, Clone, PartialEq)]
pub enum InsertOutcome {
    Committed(AnalysisRecord),
    /// Another writer already holds this version.
    Conflict,
}

#[async_trait]
pub trait RecordStore: Send + Sync + 'static {
    /// Highest committed version for `group`, 0 if none exist.
    async fn max_version(&self, group: &GroupKey) -> Result<Version, StoreError>;

    /// Insert unless `(group, version)` already exists.
    async fn insert_version(&self, record: NewRecord) -> Result<InsertOutcome, StoreError>;

    /// All versions of `group`, newest first.
    async fn list_versions(&self, group: &GroupKey) -> Result<Vec<VersionSummary>, StoreError>;

    /// A specific version, or the current one when `version` is `None`.
    async fn get_version(
        &self,
        group: &GroupKey,
        version: Option<Version>,
    ) -> Result<Option<AnalysisRecord>, StoreError>;
}

#[async_trait]
pub trait UsageSink: Send + Sync + 'static {
    async fn record_usage(&self, event: &UsageEvent) -> Result<(), StoreError>;

    async fn usage_totals(&self, subject_id: &str) -> Result<UsageTotals, StoreError>;
}
