//! E2E tests for versioned marker updates

mod common;

use common::TestStore;
use fedistore::cache::Cacheable;
use fedistore::data::{Marker, MarkerName};
use fedistore::{AppError, Ctx};
use tokio_test::{assert_err, assert_ok};

#[tokio::test]
async fn test_updates_bump_version() {
    let t = TestStore::new().await;
    let account = t.create_account("reader").await;

    let mut marker = Marker::new(&account.id, MarkerName::Home, "01ARZ3NDEKTSV4RRFFQ69G5FA1");
    assert_ok!(t.store.update_marker(&Ctx::new(), &mut marker).await);
    assert_eq!(marker.version, 0);

    marker.last_read_id = "01ARZ3NDEKTSV4RRFFQ69G5FA2".to_string();
    assert_ok!(t.store.update_marker(&Ctx::new(), &mut marker).await);
    assert_eq!(marker.version, 1);

    t.store.caches().clear();
    let stored = t
        .store
        .get_marker(&Ctx::new(), &account.id, MarkerName::Home)
        .await
        .unwrap();
    assert_eq!(stored.version, 1);
    assert_eq!(stored.last_read_id, "01ARZ3NDEKTSV4RRFFQ69G5FA2");
}

#[tokio::test]
async fn test_stale_process_gets_conflict_then_recovers() {
    let t = TestStore::new().await;
    let other_process = t.sibling().await;
    let account = t.create_account("reader").await;

    let mut marker = Marker::new(&account.id, MarkerName::Notifications, "a");
    assert_ok!(t.store.update_marker(&Ctx::new(), &mut marker).await);
    // Both processes now hold version 0.
    let seen = other_process
        .get_marker(&Ctx::new(), &account.id, MarkerName::Notifications)
        .await
        .unwrap();
    assert_eq!(seen.version, 0);

    let mut theirs = Marker::new(&account.id, MarkerName::Notifications, "b");
    assert_ok!(other_process.update_marker(&Ctx::new(), &mut theirs).await);
    assert_eq!(theirs.version, 1);

    let mut ours = Marker::new(&account.id, MarkerName::Notifications, "c");
    let result = t.store.update_marker(&Ctx::new(), &mut ours).await;
    assert!(matches!(result, Err(AppError::Conflict(_))));

    // The conflict dropped the stale copy, so a plain retry re-reads it.
    assert_ok!(t.store.update_marker(&Ctx::new(), &mut ours).await);
    assert_eq!(ours.version, 2);

    let cached = t.store.caches().marker.get("AccountID,Name", &ours.primary_key()).unwrap();
    assert_eq!(cached.version, 2);

    let stored = other_process
        .get_markers(&Ctx::new(), &account.id, &[MarkerName::Notifications])
        .await
        .unwrap();
    assert_eq!(stored.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_updates_never_lose_a_version() {
    let t = TestStore::new().await;
    let account = t.create_account("reader").await;

    let mut marker = Marker::new(&account.id, MarkerName::Home, "start");
    assert_ok!(t.store.update_marker(&Ctx::new(), &mut marker).await);

    let mut handles = Vec::new();
    for i in 0..8 {
        let store = t.store.clone();
        let account_id = account.id.clone();
        handles.push(tokio::spawn(async move {
            let mut marker = Marker::new(account_id, MarkerName::Home, format!("writer-{i}"));
            store.update_marker(&Ctx::new(), &mut marker).await
        }));
    }

    let mut successes = 0;
    let mut conflicts = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(()) => successes += 1,
            Err(AppError::Conflict(_)) => conflicts += 1,
            Err(err) => panic!("unexpected error: {err:?}"),
        }
    }
    assert_eq!(successes + conflicts, 8);
    assert!(successes >= 1);

    let stored = t
        .store
        .get_marker(&Ctx::new(), &account.id, MarkerName::Home)
        .await
        .unwrap();
    assert_eq!(stored.version, successes);
}

#[tokio::test]
async fn test_deleted_markers_are_gone() {
    let t = TestStore::new().await;
    let account = t.create_account("reader").await;

    let mut marker = Marker::new(&account.id, MarkerName::Home, "a");
    assert_ok!(t.store.update_marker(&Ctx::new(), &mut marker).await);
    assert_ok!(t.store.delete_markers_by_account_id(&Ctx::new(), &account.id).await);

    assert_err!(
        t.store
            .get_marker(&Ctx::new(), &account.id, MarkerName::Home)
            .await
    );
}
