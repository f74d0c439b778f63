//! Integration tests for concurrent writer safety.
//!
//! These verify WAL linearizability under contention: overlapping
//! changegroups admit exactly one winner per revision, disjoint
//! changegroups never conflict.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use capstan_core::kv::KvStore;
use capstan_core::storage::StorageBackend;
use capstan_core::{MemoryBackend, MemoryKv};
use capstan_datamanager::{
    name_group, Action, ChangeGroupsUpdateToken, DataManager, DataType, ReadDb,
};

fn setup() -> (Arc<DataManager>, ReadDb) {
    let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
    let storage: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
    (
        Arc::new(DataManager::new(kv.clone(), storage.clone())),
        ReadDb::new(kv, storage),
    )
}

fn create_secret(name: &str) -> Action {
    Action::put(
        DataType::Secret,
        format!("id-{name}"),
        &serde_json::json!({"name": name}),
    )
    .expect("action")
}

/// Two writers race to create the same secret name - exactly one wins.
#[tokio::test]
async fn same_changegroup_single_winner() {
    let (dm, readdb) = setup();
    readdb.start().await.expect("start");

    let group = name_group(DataType::Secret, "X");
    let token = readdb
        .do_read(|tx| Ok(tx.change_group_tokens(&[group.clone()])))
        .expect("token");

    let successes = Arc::new(AtomicU32::new(0));
    let conflicts = Arc::new(AtomicU32::new(0));

    let handles: Vec<_> = (0..2)
        .map(|i| {
            let dm = dm.clone();
            let token = token.clone();
            let successes = successes.clone();
            let conflicts = conflicts.clone();
            tokio::spawn(async move {
                match dm
                    .write_wal(vec![create_secret(&format!("X-{i}"))], Some(&token))
                    .await
                {
                    Ok(_) => successes.fetch_add(1, Ordering::SeqCst),
                    Err(e) if e.is_conflict() => conflicts.fetch_add(1, Ordering::SeqCst),
                    Err(e) => panic!("unexpected error: {e}"),
                };
            })
        })
        .collect();

    for handle in handles {
        handle.await.expect("join");
    }

    assert_eq!(successes.load(Ordering::SeqCst), 1);
    assert_eq!(conflicts.load(Ordering::SeqCst), 1);
}

/// Writers on disjoint changegroups all succeed despite head contention.
#[tokio::test]
async fn disjoint_changegroups_all_succeed() {
    let (dm, readdb) = setup();
    readdb.start().await.expect("start");

    let num_writers = 8;
    let handles: Vec<_> = (0..num_writers)
        .map(|i| {
            let dm = dm.clone();
            let readdb = readdb.clone();
            tokio::spawn(async move {
                let group = name_group(DataType::Secret, &format!("name-{i}"));
                let token = readdb
                    .do_read(|tx| Ok(tx.change_group_tokens(&[group.clone()])))
                    .expect("token");
                dm.write_wal(vec![create_secret(&format!("name-{i}"))], Some(&token))
                    .await
                    .expect("disjoint write must succeed")
            })
        })
        .collect();

    let mut seqs = Vec::new();
    for handle in handles {
        seqs.push(handle.await.expect("join"));
    }

    // Every write got its own slot in the total order.
    seqs.sort_unstable();
    seqs.dedup();
    assert_eq!(seqs.len(), num_writers);
}

/// A loser can retry with a fresh token and succeed.
#[tokio::test]
async fn loser_retries_with_fresh_token() {
    let (dm, readdb) = setup();
    readdb.start().await.expect("start");

    let group = name_group(DataType::Variable, "V");
    let token = readdb
        .do_read(|tx| Ok(tx.change_group_tokens(&[group.clone()])))
        .expect("token");

    let seq = dm
        .write_wal(
            vec![Action::put(DataType::Variable, "v1", &serde_json::json!({"name": "V"}))
                .expect("action")],
            Some(&token),
        )
        .await
        .expect("winner");

    let err = dm
        .write_wal(
            vec![Action::put(DataType::Variable, "v2", &serde_json::json!({"name": "V"}))
                .expect("action")],
            Some(&token),
        )
        .await
        .unwrap_err();
    assert!(err.is_conflict());

    readdb.wait_for_seq(seq).await.expect("wait");
    let fresh = readdb
        .do_read(|tx| Ok(tx.change_group_tokens(&[group.clone()])))
        .expect("token");
    dm.write_wal(
        vec![Action::put(DataType::Variable, "v2", &serde_json::json!({"name": "V2"}))
            .expect("action")],
        Some(&fresh),
    )
    .await
    .expect("retry succeeds");
}
