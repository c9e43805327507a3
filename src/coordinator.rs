//! Versioned persistence with optimistic retry.
//!
//! A job's output becomes the next version of its group key. There is no lock:
//! each attempt re-reads the current maximum and inserts `max + 1`, and the
//! store's uniqueness constraint decides which concurrent writer owns a given
//! number. Losers move on to the next slot instead of failing.

use crate::error::{JobError, Result};
use crate::model::{AnalysisRecord, CredentialSource, GroupKey, NewRecord, ProducerOutput, Usage, Version};
use crate::store::{InsertOutcome, RecordStore};
use crate::usage::UsageMeter;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;

/// Default number of insert attempts per job.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// A committed run and what it cost.
#[derive(Debug, Clone, PartialEq)]
pub struct Committed {
    pub record: AnalysisRecord,
    pub usage: Usage,
    /// Insert attempts it took, 1 when uncontended.
    pub attempts: u32,
}

pub struct VersionedPersistenceCoordinator {
    store: Arc<dyn RecordStore>,
    meter: UsageMeter,
    max_attempts: u32,
}

impl VersionedPersistenceCoordinator {
    pub fn new(store: Arc<dyn RecordStore>, meter: UsageMeter) -> Self {
        Self {
            store,
            meter,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    /// Run `produce` once and commit its output as the next version of `group`.
    ///
    /// The producer is never retried. Usage is metered exactly once, after the
    /// commit, and a metering failure does not affect the result.
    pub async fn execute<F, Fut, B>(
        &self,
        group: &GroupKey,
        credentials: CredentialSource,
        produce: F,
        build_row: B,
    ) -> Result<Committed>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<ProducerOutput>>,
        B: Fn(&Value, Version) -> NewRecord,
    {
        let output = produce()
            .await
            .map_err(|e| JobError::GenerationFailed(format!("{:#}", e)))?;

        let (record, attempts) = self.commit(group, &output.data, &build_row).await?;

        tracing::info!(
            %group,
            version = record.version,
            attempts,
            "committed analysis version"
        );

        self.meter.record(&record, output.usage, credentials).await;

        Ok(Committed {
            record,
            usage: output.usage,
            attempts,
        })
    }

    async fn commit<B>(&self, group: &GroupKey, data: &Value, build_row: &B) -> Result<(AnalysisRecord, u32)>
    where
        B: Fn(&Value, Version) -> NewRecord,
    {
        for attempt in 1..=self.max_attempts {
            let current = self.store.max_version(group).await?;
            let next = current + 1;

            match self.store.insert_version(build_row(data, next)).await? {
                InsertOutcome::Committed(record) => return Ok((record, attempt)),
                InsertOutcome::Conflict => {
                    tracing::warn!(%group, version = next, attempt, "version taken by a concurrent writer");
                }
            }
        }

        Err(JobError::PersistenceExhausted {
            attempts: self.max_attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::model::{SubjectRef, UsageEvent, UsageTotals, VersionSummary};
    use crate::store::{MemoryStore, UsageSink};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn group() -> GroupKey {
        GroupKey::new("42", SubjectRef::new("acme", "widgets", "main"), "scorecard")
    }

    fn coordinator(store: Arc<MemoryStore>) -> VersionedPersistenceCoordinator {
        VersionedPersistenceCoordinator::new(store.clone(), UsageMeter::new(store))
    }

    fn output() -> anyhow::Result<ProducerOutput> {
        Ok(ProducerOutput {
            data: json!({"score": 8}),
            usage: Usage::new(100, 25),
        })
    }

    fn row(group: GroupKey) -> impl Fn(&Value, Version) -> NewRecord {
        move |data, version| NewRecord::new(group.clone(), version, data.clone())
    }

    /// Every insert loses the race.
    struct AlwaysTaken {
        inserts: AtomicUsize,
    }

    #[async_trait]
    impl RecordStore for AlwaysTaken {
        async fn max_version(&self, _group: &GroupKey) -> Result<Version, StoreError> {
            Ok(self.inserts.load(Ordering::SeqCst) as Version)
        }

        async fn insert_version(&self, _record: NewRecord) -> Result<InsertOutcome, StoreError> {
            self.inserts.fetch_add(1, Ordering::SeqCst);
            Ok(InsertOutcome::Conflict)
        }

        async fn list_versions(&self, _group: &GroupKey) -> Result<Vec<VersionSummary>, StoreError> {
            Ok(vec![])
        }

        async fn get_version(
            &self,
            _group: &GroupKey,
            _version: Option<Version>,
        ) -> Result<Option<AnalysisRecord>, StoreError> {
            Ok(None)
        }
    }

    #[derive(Default)]
    struct CountingSink {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl UsageSink for CountingSink {
        async fn record_usage(&self, _event: &UsageEvent) -> Result<(), StoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn usage_totals(&self, _subject_id: &str) -> Result<UsageTotals, StoreError> {
            Ok(UsageTotals::default())
        }
    }

    #[tokio::test]
    async fn test_first_version_is_one() {
        let store = Arc::new(MemoryStore::new());
        let committed = coordinator(store.clone())
            .execute(&group(), CredentialSource::Pooled, || async { output() }, row(group()))
            .await
            .unwrap();

        assert_eq!(committed.record.version, 1);
        assert_eq!(committed.attempts, 1);
        assert_eq!(committed.record.payload, json!({"score": 8}));
        assert_eq!(store.usage_events().len(), 1);
    }

    #[tokio::test]
    async fn test_sequential_versions_increase() {
        let store = Arc::new(MemoryStore::new());
        let coordinator = coordinator(store.clone());

        let mut versions = Vec::new();
        for _ in 0..3 {
            let c = coordinator
                .execute(&group(), CredentialSource::Pooled, || async { output() }, row(group()))
                .await
                .unwrap();
            versions.push(c.record.version);
        }
        assert_eq!(versions, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_generation_failure_is_not_retried() {
        let store = Arc::new(MemoryStore::new());
        let calls = AtomicUsize::new(0);

        let err = coordinator(store.clone())
            .execute(
                &group(),
                CredentialSource::Pooled,
                || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(anyhow::anyhow!("model returned invalid JSON"))
                },
                row(group()),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, JobError::GenerationFailed(ref m) if m.contains("invalid JSON")));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.record_count(), 0);
        assert!(store.usage_events().is_empty());
    }

    #[tokio::test]
    async fn test_exhaustion_records_no_usage() {
        let taken = Arc::new(AlwaysTaken {
            inserts: AtomicUsize::new(0),
        });
        let sink = Arc::new(CountingSink::default());
        let coordinator =
            VersionedPersistenceCoordinator::new(taken.clone(), UsageMeter::new(sink.clone()));

        let err = coordinator
            .execute(&group(), CredentialSource::Pooled, || async { output() }, row(group()))
            .await
            .unwrap_err();

        assert!(matches!(err, JobError::PersistenceExhausted { attempts: 5 }));
        assert_eq!(taken.inserts.load(Ordering::SeqCst), 5);
        assert_eq!(sink.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_max_attempts_is_configurable() {
        let taken = Arc::new(AlwaysTaken {
            inserts: AtomicUsize::new(0),
        });
        let sink = Arc::new(CountingSink::default());
        let coordinator = VersionedPersistenceCoordinator::new(taken.clone(), UsageMeter::new(sink))
            .with_max_attempts(2);

        let err = coordinator
            .execute(&group(), CredentialSource::Pooled, || async { output() }, row(group()))
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::PersistenceExhausted { attempts: 2 }));
        assert_eq!(taken.inserts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_build_row_sees_assigned_version() {
        let store = Arc::new(MemoryStore::new());
        let g = group();
        let committed = coordinator(store)
            .execute(&g, CredentialSource::Pooled, || async { output() }, |data, version| {
                let mut payload = data.clone();
                payload["version"] = json!(version);
                NewRecord::new(g.clone(), version, payload)
            })
            .await
            .unwrap();

        assert_eq!(committed.record.payload["version"], json!(1));
    }
}
