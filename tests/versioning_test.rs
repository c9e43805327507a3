use proptest::prelude::*;
use scorekeep::coordinator::VersionedPersistenceCoordinator;
use scorekeep::model::{CredentialSource, GroupKey, NewRecord, ProducerOutput, SubjectRef, Usage};
use scorekeep::store::{MemoryStore, RecordStore, SqliteStore, UsageSink};
use scorekeep::usage::UsageMeter;
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::Arc;
use tempfile::TempDir;

fn scorecard_group() -> GroupKey {
    GroupKey::new("42", SubjectRef::new("acme", "widgets", "main"), "scorecard")
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .enable_all()
        .build()
        .unwrap()
}

/// Launch `writers` concurrent jobs against one group and return the versions they got.
async fn race(coordinator: Arc<VersionedPersistenceCoordinator>, writers: usize) -> Vec<u32> {
    let mut handles = Vec::new();
    for i in 0..writers {
        let coordinator = coordinator.clone();
        handles.push(tokio::spawn(async move {
            let group = scorecard_group();
            let row_group = group.clone();
            coordinator
                .execute(
                    &group,
                    CredentialSource::Pooled,
                    move || async move {
                        tokio::task::yield_now().await;
                        Ok(ProducerOutput {
                            data: json!({ "writer": i }),
                            usage: Usage::new(10, 1),
                        })
                    },
                    move |data, version| NewRecord::new(row_group.clone(), version, data.clone()),
                )
                .await
                .map(|c| c.record.version)
        }));
    }

    let mut versions = Vec::new();
    for handle in handles {
        versions.push(handle.await.unwrap().unwrap());
    }
    versions
}

fn assert_dense(versions: &[u32], writers: usize) {
    let unique: BTreeSet<u32> = versions.iter().copied().collect();
    assert_eq!(unique.len(), writers, "duplicate versions: {:?}", versions);
    assert_eq!(unique, (1..=writers as u32).collect::<BTreeSet<_>>());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    #[test]
    fn prop_versions_unique_and_dense_in_memory(writers in prop::sample::select(vec![1usize, 5, 20])) {
        let store = Arc::new(MemoryStore::new());
        let coordinator = Arc::new(
            VersionedPersistenceCoordinator::new(store.clone(), UsageMeter::new(store.clone()))
                .with_max_attempts(writers as u32 + 1),
        );

        let versions = runtime().block_on(race(coordinator, writers));

        assert_dense(&versions, writers);
        prop_assert_eq!(store.usage_events().len(), writers);
    }

    #[test]
    fn prop_versions_unique_and_dense_in_sqlite(writers in prop::sample::select(vec![1usize, 5, 20])) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(SqliteStore::open(&dir.path().join("race.db")).unwrap());
        let coordinator = Arc::new(
            VersionedPersistenceCoordinator::new(store.clone(), UsageMeter::new(store.clone()))
                .with_max_attempts(writers as u32 + 1),
        );

        let rt = runtime();
        let versions = rt.block_on(race(coordinator, writers));
        assert_dense(&versions, writers);

        let totals = rt.block_on(store.usage_totals("acme/widgets")).unwrap();
        prop_assert_eq!(totals.runs, writers as u64);
        prop_assert_eq!(totals.total_units, 11 * writers as u64);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 3)]
async fn test_three_concurrent_scorecards() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(SqliteStore::open(&dir.path().join("scorekeep.db")).unwrap());
    let coordinator = Arc::new(VersionedPersistenceCoordinator::new(
        store.clone(),
        UsageMeter::new(store.clone()),
    ));

    let versions = race(coordinator, 3).await;
    assert_dense(&versions, 3);

    let listed: Vec<u32> = store
        .list_versions(&scorecard_group())
        .await
        .unwrap()
        .into_iter()
        .map(|s| s.version)
        .collect();
    assert_eq!(listed, vec![3, 2, 1]);

    let latest = store.get_version(&scorecard_group(), None).await.unwrap().unwrap();
    assert_eq!(latest.version, 3);

    let totals = store.usage_totals("acme/widgets").await.unwrap();
    assert_eq!(totals.runs, 3);
}

#[tokio::test]
async fn test_groups_are_versioned_independently() {
    let store = Arc::new(MemoryStore::new());
    let coordinator = VersionedPersistenceCoordinator::new(store.clone(), UsageMeter::new(store.clone()));

    let groups = [
        scorecard_group(),
        GroupKey::new("42", SubjectRef::new("acme", "widgets", "dev"), "scorecard"),
        GroupKey::new("42", SubjectRef::new("acme", "widgets", "main"), "summary"),
        GroupKey::new("7", SubjectRef::new("acme", "widgets", "main"), "scorecard"),
    ];

    for group in &groups {
        let committed = coordinator
            .execute(
                group,
                CredentialSource::CallerSupplied,
                || async {
                    Ok(ProducerOutput {
                        data: json!({}),
                        usage: Usage::default(),
                    })
                },
                |data, version| NewRecord::new(group.clone(), version, data.clone()),
            )
            .await
            .unwrap();
        assert_eq!(committed.record.version, 1, "{}", group);
    }

    let events = store.usage_events();
    assert_eq!(events.len(), groups.len());
    assert!(events.iter().all(|e| e.credentials == CredentialSource::CallerSupplied));
}
