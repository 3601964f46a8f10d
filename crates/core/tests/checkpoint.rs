//! Loading through a parquet checkpoint yields the same state as replaying every commit
mod common;

use std::sync::Arc;

use common::*;
use deltaread_core::protocol::CheckPoint;
use deltaread_core::DeltaTableError;
use object_store::memory::InMemory;
use object_store::path::Path;
use object_store::ObjectStore;
use pretty_assertions::assert_eq;
use serde_json::Value;

/// Commits 0 through `last`, mixing adds, removes and transactions
fn commit_actions(version: i64) -> Vec<Value> {
    match version {
        0 => vec![protocol(1, 2), metadata("events")],
        v if v % 4 == 3 => vec![
            commit_info("DELETE"),
            remove(&format!("part=a/f{}.parquet", v - 2)),
            add(&format!("part=a/f{v}.parquet"), v * 10),
        ],
        v if v % 5 == 0 => vec![
            commit_info("WRITE"),
            txn("ingest", v),
            add(&format!("part=a/f{v}.parquet"), v * 10),
        ],
        v => vec![commit_info("WRITE"), add(&format!("part=a/f{v}.parquet"), v * 10)],
    }
}

async fn full_log(last: i64) -> Arc<InMemory> {
    let store = Arc::new(InMemory::new());
    for version in 0..=last {
        write_commit(store.as_ref(), version, &commit_actions(version)).await;
    }
    store
}

/// A store holding only a checkpoint at `checkpoint` and the commits after it
async fn checkpointed_log(checkpoint: i64, last: i64) -> Arc<InMemory> {
    let source = table(full_log(checkpoint).await);
    source.load().await.unwrap();
    let actions = checkpoint_actions(&source.snapshot().unwrap());

    let store = Arc::new(InMemory::new());
    put(
        store.as_ref(),
        &format!("_delta_log/{checkpoint:020}.checkpoint.parquet"),
        checkpoint_parquet(&actions),
    )
    .await;
    let hint = CheckPoint::new(checkpoint, actions.len() as i64, None);
    put(
        store.as_ref(),
        "_delta_log/_last_checkpoint",
        serde_json::to_vec(&hint).unwrap(),
    )
    .await;
    for version in checkpoint + 1..=last {
        write_commit(store.as_ref(), version, &commit_actions(version)).await;
    }
    store
}

#[tokio::test]
async fn test_checkpoint_plus_tail_equals_full_replay() {
    let full = table(full_log(12).await);
    full.load().await.unwrap();

    let checkpointed = table(checkpointed_log(10, 12).await);
    checkpointed.load().await.unwrap();

    assert_eq!(checkpointed.version().unwrap(), 12);
    assert_eq!(*full.snapshot().unwrap(), *checkpointed.snapshot().unwrap());
    assert_eq!(
        checkpointed
            .snapshot()
            .unwrap()
            .app_transaction_version("ingest"),
        Some(10)
    );
}

#[tokio::test]
async fn test_checkpoint_version_itself() {
    let full = table(full_log(10).await);
    full.load().await.unwrap();

    let checkpointed = table(checkpointed_log(10, 12).await);
    checkpointed.load_version(10).await.unwrap();
    assert_eq!(*full.snapshot().unwrap(), *checkpointed.snapshot().unwrap());

    // history before the checkpoint is gone
    assert!(matches!(
        checkpointed.load_version(9).await,
        Err(DeltaTableError::MissingLogSegment { .. })
    ));
}

#[tokio::test]
async fn test_listing_finds_checkpoint_without_hint() {
    let store = checkpointed_log(10, 12).await;
    store
        .delete(&Path::from("_delta_log/_last_checkpoint"))
        .await
        .unwrap();

    let full = table(full_log(12).await);
    full.load().await.unwrap();
    let checkpointed = table(store);
    checkpointed.load().await.unwrap();
    assert_eq!(*full.snapshot().unwrap(), *checkpointed.snapshot().unwrap());
}

#[tokio::test]
async fn test_incremental_update_past_checkpoint() {
    let store = checkpointed_log(10, 11).await;
    let table = table(store.clone());
    table.load().await.unwrap();
    assert_eq!(table.version().unwrap(), 11);

    write_commit(store.as_ref(), 12, &commit_actions(12)).await;
    table.update().await.unwrap();

    let full = common::table(full_log(12).await);
    full.load().await.unwrap();
    assert_eq!(*full.snapshot().unwrap(), *table.snapshot().unwrap());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_checkpoint_load_on_spawned_task() {
    let table = Arc::new(table(checkpointed_log(10, 12).await));
    let handle = tokio::spawn({
        let table = table.clone();
        async move {
            table.load().await?;
            table.update().await?;
            table.load_version(11).await
        }
    });
    handle.await.unwrap().unwrap();
    assert_eq!(table.version().unwrap(), 11);
}
