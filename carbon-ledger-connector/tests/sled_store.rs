//! Durability and atomicity checks for the sled-backed mirror store.

use carbon_ledger_connector::chain::RoleSnapshot;
use carbon_ledger_connector::events::{
    Address, BlockHash, EventId, Role, RoleSet, TokenType,
};
use carbon_ledger_connector::storage::sled_store::SledMirrorStore;
use carbon_ledger_connector::storage::{
    BalanceDelta, Checkpoint, MirrorBatch, MirrorStore, SyncStatus, TokenRecord,
};
use std::collections::BTreeMap;

fn wallet(byte: u8) -> Address {
    Address([byte; 20])
}

fn token(token_id: u64) -> TokenRecord {
    TokenRecord {
        token_id,
        token_type: TokenType::RenewableEnergyCertificate,
        issuer: wallet(0xaa),
        total_issued: 0,
        total_retired: 0,
        metadata: "scope:2".to_string(),
        description: "rec".to_string(),
        issuance_block: 3,
    }
}

fn event_id(block: u64, log_index: u32, token_id: u64) -> EventId {
    EventId {
        block,
        log_index,
        token_id,
    }
}

#[tokio::test]
async fn batch_commits_deltas_and_checkpoint_together() {
    let dir = tempfile::tempdir().unwrap();
    let db = sled::open(dir.path()).unwrap();
    let store = SledMirrorStore::new(&db).unwrap();

    let w = wallet(1);
    let batch = MirrorBatch {
        new_tokens: vec![token(7)],
        balance_deltas: vec![BalanceDelta {
            wallet: w,
            token_id: 7,
            delta: 100,
        }],
        issued_totals: vec![(7, 100)],
        retired_totals: vec![],
        applied_events: vec![event_id(5, 0, 7), event_id(5, 1, 7)],
        checkpoint: Some(Checkpoint {
            block: 5,
            status: SyncStatus::Backfilling,
        }),
        block_marker: Some((5, BlockHash([0x11; 32]))),
    };
    store.apply_batch(&batch).await.unwrap();

    assert_eq!(store.balance(&w, 7).await.unwrap(), 100);
    let record = store.token(7).await.unwrap().unwrap();
    assert_eq!(record.total_issued, 100);
    let checkpoint = store.checkpoint().await.unwrap().unwrap();
    assert_eq!(checkpoint.block, 5);
    assert_eq!(store.block_marker(5).await.unwrap(), Some(BlockHash([0x11; 32])));
    assert_eq!(
        store.applied_events_in(5, 5).await.unwrap(),
        vec![event_id(5, 0, 7), event_id(5, 1, 7)]
    );
}

#[tokio::test]
async fn aborted_batch_leaves_no_trace() {
    let dir = tempfile::tempdir().unwrap();
    let db = sled::open(dir.path()).unwrap();
    let store = SledMirrorStore::new(&db).unwrap();

    // References a token that was never written: the whole batch must
    // roll back, including the checkpoint.
    let batch = MirrorBatch {
        new_tokens: vec![],
        balance_deltas: vec![BalanceDelta {
            wallet: wallet(1),
            token_id: 9,
            delta: 10,
        }],
        issued_totals: vec![(9, 10)],
        retired_totals: vec![],
        applied_events: vec![event_id(4, 0, 9)],
        checkpoint: Some(Checkpoint {
            block: 4,
            status: SyncStatus::Backfilling,
        }),
        block_marker: None,
    };
    assert!(store.apply_batch(&batch).await.is_err());

    assert_eq!(store.balance(&wallet(1), 9).await.unwrap(), 0);
    assert!(store.checkpoint().await.unwrap().is_none());
    assert!(store.applied_events_in(0, 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn balance_underflow_rolls_the_batch_back() {
    let dir = tempfile::tempdir().unwrap();
    let db = sled::open(dir.path()).unwrap();
    let store = SledMirrorStore::new(&db).unwrap();

    let seed = MirrorBatch {
        new_tokens: vec![token(7)],
        balance_deltas: vec![BalanceDelta {
            wallet: wallet(1),
            token_id: 7,
            delta: 50,
        }],
        issued_totals: vec![(7, 50)],
        retired_totals: vec![],
        applied_events: vec![event_id(1, 0, 7)],
        checkpoint: Some(Checkpoint {
            block: 1,
            status: SyncStatus::Backfilling,
        }),
        block_marker: None,
    };
    store.apply_batch(&seed).await.unwrap();

    let overdraw = MirrorBatch {
        balance_deltas: vec![BalanceDelta {
            wallet: wallet(1),
            token_id: 7,
            delta: -60,
        }],
        checkpoint: Some(Checkpoint {
            block: 2,
            status: SyncStatus::Backfilling,
        }),
        ..Default::default()
    };
    assert!(store.apply_batch(&overdraw).await.is_err());

    assert_eq!(store.balance(&wallet(1), 7).await.unwrap(), 50);
    assert_eq!(store.checkpoint().await.unwrap().unwrap().block, 1);
}

#[tokio::test]
async fn state_survives_a_reopen() {
    let dir = tempfile::tempdir().unwrap();

    {
        let db = sled::open(dir.path()).unwrap();
        let store = SledMirrorStore::new(&db).unwrap();
        let batch = MirrorBatch {
            new_tokens: vec![token(7)],
            balance_deltas: vec![BalanceDelta {
                wallet: wallet(1),
                token_id: 7,
                delta: 42,
            }],
            issued_totals: vec![(7, 42)],
            retired_totals: vec![],
            applied_events: vec![event_id(2, 0, 7)],
            checkpoint: Some(Checkpoint {
                block: 2,
                status: SyncStatus::Live,
            }),
            block_marker: Some((2, BlockHash([0x22; 32]))),
        };
        store.apply_batch(&batch).await.unwrap();
    }

    let db = sled::open(dir.path()).unwrap();
    let store = SledMirrorStore::new(&db).unwrap();
    assert_eq!(store.balance(&wallet(1), 7).await.unwrap(), 42);
    let checkpoint = store.checkpoint().await.unwrap().unwrap();
    assert_eq!(checkpoint.block, 2);
    assert_eq!(checkpoint.status, SyncStatus::Live);
    assert_eq!(
        store.applied_events_in(2, 2).await.unwrap(),
        vec![event_id(2, 0, 7)]
    );
}

#[tokio::test]
async fn role_replacement_is_a_full_overwrite() {
    let dir = tempfile::tempdir().unwrap();
    let db = sled::open(dir.path()).unwrap();
    let store = SledMirrorStore::new(&db).unwrap();

    let mut first = BTreeMap::new();
    first.insert(wallet(1), RoleSet::from([Role::RecDealer, Role::Consumer]));
    first.insert(wallet(2), RoleSet::from([Role::Admin]));
    store
        .replace_wallet_roles(&RoleSnapshot {
            block: 10,
            holders: first,
        })
        .await
        .unwrap();
    assert_eq!(store.all_wallet_roles().await.unwrap().len(), 2);

    let mut second = BTreeMap::new();
    second.insert(wallet(3), RoleSet::from([Role::EmissionsAuditor]));
    store
        .replace_wallet_roles(&RoleSnapshot {
            block: 11,
            holders: second,
        })
        .await
        .unwrap();

    let records = store.all_wallet_roles().await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].wallet, wallet(3));
    assert_eq!(records[0].reconciled_block, 11);
    assert!(store.wallet_roles(&wallet(1)).await.unwrap().is_none());
}

#[tokio::test]
async fn old_block_markers_are_pruned() {
    let dir = tempfile::tempdir().unwrap();
    let db = sled::open(dir.path()).unwrap();
    let store = SledMirrorStore::new(&db).unwrap();

    let early = MirrorBatch {
        checkpoint: Some(Checkpoint {
            block: 10,
            status: SyncStatus::Backfilling,
        }),
        block_marker: Some((10, BlockHash([0x01; 32]))),
        ..Default::default()
    };
    store.apply_batch(&early).await.unwrap();

    let late = MirrorBatch {
        checkpoint: Some(Checkpoint {
            block: 5_000,
            status: SyncStatus::Live,
        }),
        block_marker: Some((5_000, BlockHash([0x02; 32]))),
        ..Default::default()
    };
    store.apply_batch(&late).await.unwrap();

    assert!(store.block_marker(10).await.unwrap().is_none());
    assert_eq!(
        store.block_marker(5_000).await.unwrap(),
        Some(BlockHash([0x02; 32]))
    );
}
