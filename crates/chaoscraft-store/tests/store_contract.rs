//! ---
//! cc_section: "03-persistence-logging"
//! cc_subsection: "tests"
//! cc_type: "source"
//! cc_scope: "code"
//! cc_description: "Behavioural contract shared by every experiment store backend."
//! cc_version: "v0.1.0"
//! cc_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use chaoscraft_store::{
    ExperimentSpec, ExperimentState, ExperimentStore, FaultKind, LastError, ListFilter,
    MemoryStore, NewExperiment, Operation, SqliteStore, StoreError, TargetSelector,
};
use uuid::Uuid;

fn spec(name: &str) -> ExperimentSpec {
    let mut target = TargetSelector::default();
    target.labels.insert("app".into(), "checkout".into());
    ExperimentSpec {
        name: name.into(),
        description: None,
        fault: FaultKind::CpuStress {
            cores: 2,
            load_percent: 80,
        },
        target,
        duration_sec: None,
    }
}

async fn sqlite_store() -> SqliteStore {
    let store = SqliteStore::open_in_memory().unwrap();
    store.migrate().await.unwrap();
    store
}

async fn create_assigns_pending_v1(store: &dyn ExperimentStore) {
    let created = store.create(NewExperiment::new(spec("a"))).await.unwrap();
    assert_eq!(created.state, ExperimentState::Pending);
    assert_eq!(created.version, 1);
    assert!(created.last_error.is_none());
    assert_eq!(created.created_at, created.updated_at);

    let fetched = store.get(created.id).await.unwrap();
    assert_eq!(fetched, created);
}

async fn cas_requires_read_version(store: &dyn ExperimentStore) {
    let created = store.create(NewExperiment::new(spec("cas"))).await.unwrap();

    let starting = store
        .compare_and_swap(created.id, 1, ExperimentState::Starting, None)
        .await
        .unwrap();
    assert_eq!(starting.version, 2);
    assert_eq!(starting.state, ExperimentState::Starting);

    let err = store
        .compare_and_swap(created.id, 1, ExperimentState::Running, None)
        .await
        .unwrap_err();
    match err {
        StoreError::VersionConflict {
            expected, actual, ..
        } => {
            assert_eq!(expected, 1);
            assert_eq!(actual, 2);
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(store.get(created.id).await.unwrap(), starting);

    let missing = store
        .compare_and_swap(Uuid::new_v4(), 1, ExperimentState::Running, None)
        .await
        .unwrap_err();
    assert!(matches!(missing, StoreError::NotFound(_)));
}

async fn cas_persists_last_error(store: &dyn ExperimentStore) {
    let created = store.create(NewExperiment::new(spec("err"))).await.unwrap();
    let error = LastError::new(Operation::Start, "injector refused", true);
    let failed = store
        .compare_and_swap(created.id, 1, ExperimentState::Failed, Some(error.clone()))
        .await
        .unwrap();
    let stored = store.get(created.id).await.unwrap();
    assert_eq!(stored.last_error.as_ref().unwrap().message, "injector refused");
    assert!(stored.last_error.as_ref().unwrap().unknown_effect_state);
    assert_eq!(stored.last_error, failed.last_error);

    let cleared = store
        .compare_and_swap(created.id, 2, ExperimentState::Starting, None)
        .await
        .unwrap();
    assert!(cleared.last_error.is_none());
}

async fn concurrent_cas_admits_one_writer(store: Arc<dyn ExperimentStore>) {
    let created = store.create(NewExperiment::new(spec("race"))).await.unwrap();
    let attempts = (0..8).map(|_| {
        let store = store.clone();
        async move {
            store
                .compare_and_swap(created.id, 1, ExperimentState::Starting, None)
                .await
        }
    });
    let results = futures::future::join_all(attempts).await;
    let winners = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(winners, 1);
    assert!(results
        .iter()
        .filter_map(|r| r.as_ref().err())
        .all(|e| matches!(e, StoreError::VersionConflict { .. })));
    assert_eq!(store.get(created.id).await.unwrap().version, 2);
}

async fn idempotency_keys_outlive_delete(store: &dyn ExperimentStore) {
    let first = store
        .create(NewExperiment::new(spec("keyed")).with_idempotency_key("req-42"))
        .await
        .unwrap();
    assert_eq!(first.idempotency_key.as_deref(), Some("req-42"));

    let dup = store
        .create(NewExperiment::new(spec("keyed")).with_idempotency_key("req-42"))
        .await
        .unwrap_err();
    assert!(
        matches!(dup, StoreError::DuplicateIdempotencyKey { existing, .. } if existing == first.id)
    );

    store.delete(first.id).await.unwrap();
    let after_delete = store
        .create(NewExperiment::new(spec("keyed")).with_idempotency_key("req-42"))
        .await
        .unwrap_err();
    assert!(
        matches!(after_delete, StoreError::DuplicateIdempotencyKey { existing, .. } if existing == first.id)
    );
}

async fn delete_respects_state(store: &dyn ExperimentStore) {
    let created = store.create(NewExperiment::new(spec("del"))).await.unwrap();
    store
        .compare_and_swap(created.id, 1, ExperimentState::Running, None)
        .await
        .unwrap();

    let err = store.delete(created.id).await.unwrap_err();
    assert!(matches!(
        err,
        StoreError::NotDeletable {
            state: ExperimentState::Running,
            ..
        }
    ));
    assert!(store.get(created.id).await.is_ok());

    store
        .compare_and_swap(created.id, 2, ExperimentState::Stopped, None)
        .await
        .unwrap();
    store.delete(created.id).await.unwrap();
    assert!(matches!(
        store.get(created.id).await.unwrap_err(),
        StoreError::NotFound(_)
    ));
    assert!(matches!(
        store.delete(created.id).await.unwrap_err(),
        StoreError::NotFound(_)
    ));
}

async fn list_orders_newest_first_and_filters(store: &dyn ExperimentStore) {
    let a = store.create(NewExperiment::new(spec("one"))).await.unwrap();
    let b = store.create(NewExperiment::new(spec("two"))).await.unwrap();
    let c = store.create(NewExperiment::new(spec("three"))).await.unwrap();
    store
        .compare_and_swap(b.id, 1, ExperimentState::Failed, None)
        .await
        .unwrap();

    let all = store.list(&ListFilter::default()).await.unwrap();
    let ids: Vec<_> = all.iter().map(|e| e.id).collect();
    assert_eq!(ids, vec![c.id, b.id, a.id]);

    let failed = store
        .list(&ListFilter::with_state(ExperimentState::Failed))
        .await
        .unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].id, b.id);

    let limited = store
        .list(&ListFilter {
            state: None,
            limit: Some(2),
        })
        .await
        .unwrap();
    assert_eq!(
        limited.iter().map(|e| e.id).collect::<Vec<_>>(),
        vec![c.id, b.id]
    );
}

async fn count_ignores_page_limit(store: &dyn ExperimentStore) {
    assert_eq!(store.count(None).await.unwrap(), 0);
    let a = store.create(NewExperiment::new(spec("one"))).await.unwrap();
    store.create(NewExperiment::new(spec("two"))).await.unwrap();
    store.create(NewExperiment::new(spec("three"))).await.unwrap();
    store
        .compare_and_swap(a.id, 1, ExperimentState::Failed, None)
        .await
        .unwrap();

    assert_eq!(store.count(None).await.unwrap(), 3);
    assert_eq!(
        store.count(Some(ExperimentState::Pending)).await.unwrap(),
        2
    );
    assert_eq!(store.count(Some(ExperimentState::Failed)).await.unwrap(), 1);
    assert_eq!(
        store.count(Some(ExperimentState::Running)).await.unwrap(),
        0
    );

    store.delete(a.id).await.unwrap();
    assert_eq!(store.count(None).await.unwrap(), 2);
}

#[tokio::test]
async fn memory_create_assigns_pending_v1() {
    create_assigns_pending_v1(&MemoryStore::new()).await;
}

#[tokio::test]
async fn sqlite_create_assigns_pending_v1() {
    create_assigns_pending_v1(&sqlite_store().await).await;
}

#[tokio::test]
async fn memory_cas_requires_read_version() {
    cas_requires_read_version(&MemoryStore::new()).await;
}

#[tokio::test]
async fn sqlite_cas_requires_read_version() {
    cas_requires_read_version(&sqlite_store().await).await;
}

#[tokio::test]
async fn memory_cas_persists_last_error() {
    cas_persists_last_error(&MemoryStore::new()).await;
}

#[tokio::test]
async fn sqlite_cas_persists_last_error() {
    cas_persists_last_error(&sqlite_store().await).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn memory_concurrent_cas_admits_one_writer() {
    concurrent_cas_admits_one_writer(Arc::new(MemoryStore::new())).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sqlite_concurrent_cas_admits_one_writer() {
    concurrent_cas_admits_one_writer(Arc::new(sqlite_store().await)).await;
}

#[tokio::test]
async fn memory_idempotency_keys_outlive_delete() {
    idempotency_keys_outlive_delete(&MemoryStore::new()).await;
}

#[tokio::test]
async fn sqlite_idempotency_keys_outlive_delete() {
    idempotency_keys_outlive_delete(&sqlite_store().await).await;
}

#[tokio::test]
async fn memory_delete_respects_state() {
    delete_respects_state(&MemoryStore::new()).await;
}

#[tokio::test]
async fn sqlite_delete_respects_state() {
    delete_respects_state(&sqlite_store().await).await;
}

#[tokio::test]
async fn memory_list_orders_newest_first_and_filters() {
    list_orders_newest_first_and_filters(&MemoryStore::new()).await;
}

#[tokio::test]
async fn sqlite_list_orders_newest_first_and_filters() {
    list_orders_newest_first_and_filters(&sqlite_store().await).await;
}

#[tokio::test]
async fn memory_count_ignores_page_limit() {
    count_ignores_page_limit(&MemoryStore::new()).await;
}

#[tokio::test]
async fn sqlite_count_ignores_page_limit() {
    count_ignores_page_limit(&sqlite_store().await).await;
}

#[tokio::test]
async fn sqlite_records_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state").join("chaoscraft.db");

    let id = {
        let store = SqliteStore::open(&path, Duration::from_secs(1)).unwrap();
        store.migrate().await.unwrap();
        let created = store
            .create(NewExperiment::new(spec("durable")).with_idempotency_key("boot-1"))
            .await
            .unwrap();
        store
            .compare_and_swap(
                created.id,
                1,
                ExperimentState::Failed,
                Some(LastError::new(Operation::Start, "boom", false)),
            )
            .await
            .unwrap();
        created.id
    };

    let reopened = SqliteStore::open(&path, Duration::from_secs(1)).unwrap();
    reopened.ensure_schema_current().await.unwrap();
    let record = reopened.get(id).await.unwrap();
    assert_eq!(record.state, ExperimentState::Failed);
    assert_eq!(record.version, 2);
    assert_eq!(record.spec.name, "durable");
    assert_eq!(record.last_error.unwrap().message, "boom");
    assert!(matches!(
        reopened
            .create(NewExperiment::new(spec("durable")).with_idempotency_key("boot-1"))
            .await
            .unwrap_err(),
        StoreError::DuplicateIdempotencyKey { .. }
    ));
}

#[tokio::test]
async fn backends_report_their_names() {
    assert_eq!(MemoryStore::new().backend(), "memory");
    assert_eq!(sqlite_store().await.backend(), "sqlite");
    sqlite_store().await.ping().await.unwrap();
}
