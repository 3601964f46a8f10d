//! Cancellation and concurrent loading
mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use deltaread_core::logstore::commit_uri_from_version;
use deltaread_core::{DeltaTableBuilder, DeltaTableError, Path};
use object_store::memory::InMemory;
use pretty_assertions::assert_eq;

async fn write_log(store: &GatedStore, last: i64) {
    write_commit(store, 0, &[protocol(1, 2), metadata("events")]).await;
    for version in 1..=last {
        write_commit(store, version, &[add(&format!("part=a/f{version}.parquet"), version)]).await;
    }
}

#[tokio::test]
async fn test_cancelled_first_load_stays_not_loaded() {
    let store = Arc::new(GatedStore::default());
    write_log(&store, 3).await;
    let gated = commit_uri_from_version(2);
    store.close(gated.clone());

    let table = table(store.clone());
    {
        let load = table.load();
        tokio::pin!(load);
        tokio::select! {
            res = &mut load => panic!("load finished behind a closed gate: {res:?}"),
            _ = store.blocked() => {}
        }
        // dropping the future cancels the load
    }
    assert!(matches!(table.version(), Err(DeltaTableError::NotLoaded)));

    store.open(&gated);
    table.load().await.unwrap();
    assert_eq!(table.version().unwrap(), 3);
    assert_eq!(table.get_files_count(), 3);
}

#[tokio::test]
async fn test_cancelled_update_keeps_previous_version() {
    let store = Arc::new(GatedStore::default());
    write_log(&store, 1).await;
    let table = table(store.clone());
    table.load().await.unwrap();

    for version in 2..=4 {
        let removed = format!("part=a/f{}.parquet", version - 1);
        write_commit(store.as_ref(), version, &[remove(&removed)]).await;
    }
    let gated = commit_uri_from_version(3);
    store.close(gated.clone());

    let cancelled = tokio::time::timeout(Duration::from_millis(200), table.update()).await;
    assert!(cancelled.is_err(), "update should be stuck on version 3");
    assert_eq!(table.version().unwrap(), 1);
    assert_eq!(table.get_files().unwrap(), vec![Path::from("part=a/f1.parquet")]);

    store.open(&gated);
    table.update().await.unwrap();
    assert_eq!(table.version().unwrap(), 4);
    assert_eq!(table.get_files_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_commits_apply_in_order_when_fetched_concurrently() {
    let store = Arc::new(GatedStore::default());
    write_commit(store.as_ref(), 0, &[protocol(1, 2), metadata("events")]).await;
    write_commit(store.as_ref(), 1, &[add("part=a/shared.parquet", 10)]).await;
    write_commit(store.as_ref(), 2, &[add("part=a/other.parquet", 20)]).await;
    write_commit(store.as_ref(), 3, &[remove("part=a/shared.parquet")]).await;
    write_commit(store.as_ref(), 4, &[add("part=a/shared.parquet", 40)]).await;
    write_commit(store.as_ref(), 5, &[protocol(2, 5), remove("part=a/other.parquet")]).await;
    write_commit(store.as_ref(), 6, &[protocol(1, 3), metadata("renamed")]).await;

    // later commits arrive first
    for version in 1..=6 {
        store.delay(
            commit_uri_from_version(version),
            Duration::from_millis(20 * (7 - version) as u64),
        );
    }

    let table = DeltaTableBuilder::from_uri("memory:///")
        .unwrap()
        .with_storage_backend(store.clone())
        .with_log_buffer_size(6)
        .unwrap()
        .build()
        .unwrap();
    table.load().await.unwrap();

    assert!(store.max_in_flight() > 1, "commits were fetched one at a time");
    assert_eq!(table.version().unwrap(), 6);
    assert_eq!(table.get_files().unwrap(), vec![Path::from("part=a/shared.parquet")]);
    let snapshot = table.snapshot().unwrap();
    assert_eq!(snapshot.file("part=a/shared.parquet").unwrap().unwrap().size, 40);
    assert_eq!(snapshot.protocol().min_writer_version, 3);
    assert_eq!(snapshot.metadata().name.as_deref(), Some("renamed"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_loads_of_different_tables() {
    let first = Arc::new(InMemory::new());
    write_commit(first.as_ref(), 0, &[protocol(1, 2), metadata("first")]).await;
    write_commit(first.as_ref(), 1, &[add("part=a/a.parquet", 1)]).await;

    let second = Arc::new(InMemory::new());
    write_commit(second.as_ref(), 0, &[protocol(1, 2), metadata("second")]).await;
    for version in 1..=4 {
        let added = add(&format!("part=a/b{version}.parquet"), version);
        write_commit(second.as_ref(), version, &[added]).await;
    }

    let first = table(first);
    let second = table(second);
    let (a, b) = tokio::join!(first.load(), second.load());
    a.unwrap();
    b.unwrap();

    assert_eq!(first.version().unwrap(), 1);
    assert_eq!(first.metadata().unwrap().name.as_deref(), Some("first"));
    assert_eq!(first.get_files_count(), 1);
    assert_eq!(second.version().unwrap(), 4);
    assert_eq!(second.metadata().unwrap().name.as_deref(), Some("second"));
    assert_eq!(second.get_files_count(), 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_readers_see_whole_snapshots_during_load() {
    let store = Arc::new(GatedStore::default());
    write_log(&store, 2).await;
    let table = Arc::new(table(store.clone()));
    table.load_version(1).await.unwrap();

    for version in 3..=5 {
        store.delay(commit_uri_from_version(version), Duration::from_millis(30));
        let added = add(&format!("part=a/f{version}.parquet"), version);
        write_commit(store.as_ref(), version, &[added]).await;
    }

    let loader = tokio::spawn({
        let table = table.clone();
        async move { table.load().await }
    });
    while !loader.is_finished() {
        let snapshot = table.snapshot().unwrap();
        assert_eq!(snapshot.files_count() as i64, snapshot.version());
        tokio::task::yield_now().await;
    }
    loader.await.unwrap().unwrap();
    assert_eq!(table.version().unwrap(), 5);
}
