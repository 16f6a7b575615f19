//! `sled`-backed [`MirrorStore`].
//!
//! Tokens, balances, applied-event identities, and sync metadata live in
//! separate trees; a batch commits through a single multi-tree transaction
//! so deltas and the checkpoint land together or not at all.

use super::{
    Checkpoint, MirrorBatch, MirrorStore, TokenRecord, WalletRoleRecord, MARKER_RETENTION_BLOCKS,
};
use crate::chain::RoleSnapshot;
use crate::error::StoreError;
use crate::events::{Address, BlockHash, EventId, TokenId};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sled::transaction::{abort, TransactionError, TransactionalTree};
use sled::{Db, Transactional, Tree};

const CHECKPOINT_KEY: &[u8] = b"sync::checkpoint";
const MARKER_PREFIX: &[u8] = b"marker::";

/// A durable mirror on a shared [`sled::Db`].
#[derive(Clone)]
pub struct SledMirrorStore {
    tokens: Tree,
    balances: Tree,
    roles: Tree,
    applied: Tree,
    meta: Tree,
}

impl SledMirrorStore {
    /// Opens the mirror trees on an existing database handle. The handle
    /// can be shared with other trees owned by the hosting process.
    pub fn new(db: &Db) -> Result<Self, StoreError> {
        Ok(Self {
            tokens: open_tree(db, "mirror::tokens")?,
            balances: open_tree(db, "mirror::balances")?,
            roles: open_tree(db, "mirror::roles")?,
            applied: open_tree(db, "mirror::applied")?,
            meta: open_tree(db, "mirror::meta")?,
        })
    }

    /// Drops markers older than the retention window. Metadata-only
    /// cleanup, so it runs outside the batch transaction.
    fn prune_markers(&self, newest_block: u64) -> Result<(), StoreError> {
        let cutoff = newest_block.saturating_sub(MARKER_RETENTION_BLOCKS);
        for entry in self.meta.range(marker_key(0)..marker_key(cutoff)) {
            let (key, _) = entry.map_err(read_error)?;
            self.meta.remove(key).map_err(write_error)?;
        }
        Ok(())
    }
}

fn open_tree(db: &Db, name: &str) -> Result<Tree, StoreError> {
    db.open_tree(name).map_err(write_error)
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| StoreError::Corrupt(format!("encode failed: {e}")))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map(|(value, _)| value)
        .map_err(|e| StoreError::Corrupt(format!("decode failed: {e}")))
}

fn token_key(token_id: TokenId) -> [u8; 8] {
    token_id.to_be_bytes()
}

fn balance_key(wallet: &Address, token_id: TokenId) -> [u8; 28] {
    let mut key = [0u8; 28];
    key[..20].copy_from_slice(&wallet.0);
    key[20..].copy_from_slice(&token_id.to_be_bytes());
    key
}

fn marker_key(block: u64) -> Vec<u8> {
    let mut key = MARKER_PREFIX.to_vec();
    key.extend_from_slice(&block.to_be_bytes());
    key
}

/// Applied-event keys sort by `(block, log_index, token_id)` so a block
/// range is a contiguous key range.
fn applied_key(id: &EventId) -> [u8; 20] {
    let mut key = [0u8; 20];
    key[..8].copy_from_slice(&id.block.to_be_bytes());
    key[8..12].copy_from_slice(&id.log_index.to_be_bytes());
    key[12..].copy_from_slice(&id.token_id.to_be_bytes());
    key
}

fn applied_key_to_id(key: &[u8]) -> Result<EventId, StoreError> {
    if key.len() != 20 {
        return Err(StoreError::Corrupt(format!(
            "applied key has {} bytes, want 20",
            key.len()
        )));
    }
    Ok(EventId {
        block: u64::from_be_bytes(key[..8].try_into().unwrap_or_default()),
        log_index: u32::from_be_bytes(key[8..12].try_into().unwrap_or_default()),
        token_id: u64::from_be_bytes(key[12..].try_into().unwrap_or_default()),
    })
}

fn decode_balance(bytes: &[u8]) -> Result<u128, String> {
    let raw: [u8; 16] = bytes
        .try_into()
        .map_err(|_| format!("balance value has {} bytes, want 16", bytes.len()))?;
    Ok(u128::from_be_bytes(raw))
}

fn read_error(e: sled::Error) -> StoreError {
    StoreError::Read(anyhow::Error::new(e))
}

fn write_error(e: sled::Error) -> StoreError {
    StoreError::Write(anyhow::Error::new(e))
}

#[async_trait]
impl MirrorStore for SledMirrorStore {
    async fn token(&self, token_id: TokenId) -> Result<Option<TokenRecord>, StoreError> {
        self.tokens
            .get(token_key(token_id))
            .map_err(read_error)?
            .map(|bytes| decode(&bytes))
            .transpose()
    }

    async fn balance(&self, wallet: &Address, token_id: TokenId) -> Result<u128, StoreError> {
        match self
            .balances
            .get(balance_key(wallet, token_id))
            .map_err(read_error)?
        {
            Some(bytes) => decode_balance(&bytes).map_err(StoreError::Corrupt),
            None => Ok(0),
        }
    }

    async fn wallet_roles(
        &self,
        wallet: &Address,
    ) -> Result<Option<WalletRoleRecord>, StoreError> {
        self.roles
            .get(wallet.0)
            .map_err(read_error)?
            .map(|bytes| decode(&bytes))
            .transpose()
    }

    async fn all_wallet_roles(&self) -> Result<Vec<WalletRoleRecord>, StoreError> {
        let mut records = Vec::new();
        for entry in self.roles.iter() {
            let (_, bytes) = entry.map_err(read_error)?;
            records.push(decode(&bytes)?);
        }
        Ok(records)
    }

    async fn checkpoint(&self) -> Result<Option<Checkpoint>, StoreError> {
        self.meta
            .get(CHECKPOINT_KEY)
            .map_err(read_error)?
            .map(|bytes| decode(&bytes))
            .transpose()
    }

    async fn put_checkpoint(&self, checkpoint: Checkpoint) -> Result<(), StoreError> {
        let encoded = encode(&checkpoint)?;
        self.meta
            .insert(CHECKPOINT_KEY, encoded)
            .map_err(write_error)?;
        self.meta.flush_async().await.map_err(write_error)?;
        Ok(())
    }

    async fn apply_batch(&self, batch: &MirrorBatch) -> Result<(), StoreError> {
        // Everything encodable up front is encoded once, outside the
        // transaction closure, which may retry on conflict.
        let new_tokens: Vec<(Vec<u8>, Vec<u8>)> = batch
            .new_tokens
            .iter()
            .map(|t| Ok((token_key(t.token_id).to_vec(), encode(t)?)))
            .collect::<Result<_, StoreError>>()?;
        let applied_keys: Vec<[u8; 20]> =
            batch.applied_events.iter().map(applied_key).collect();
        let checkpoint = batch.checkpoint.map(|cp| encode(&cp)).transpose()?;
        let marker = batch
            .block_marker
            .map(|(block, hash)| Ok::<_, StoreError>((marker_key(block), encode(&hash)?)))
            .transpose()?;

        let trees: &[&Tree] = &[&self.tokens, &self.balances, &self.applied, &self.meta];
        let result = trees.transaction(|trees| {
            let (tokens, balances, applied, meta): (
                &TransactionalTree,
                &TransactionalTree,
                &TransactionalTree,
                &TransactionalTree,
            ) = (&trees[0], &trees[1], &trees[2], &trees[3]);

            for (key, value) in &new_tokens {
                tokens.insert(key.as_slice(), value.as_slice())?;
            }

            for (token_id, amount) in &batch.issued_totals {
                let key = token_key(*token_id);
                let bytes = match tokens.get(key)? {
                    Some(bytes) => bytes,
                    None => return abort(format!("issued total for unknown token {token_id}")),
                };
                let mut record: TokenRecord = match decode(&bytes) {
                    Ok(record) => record,
                    Err(e) => return abort(e.to_string()),
                };
                record.total_issued = record.total_issued.saturating_add(*amount);
                match encode(&record) {
                    Ok(encoded) => tokens.insert(&key, encoded)?,
                    Err(e) => return abort(e.to_string()),
                };
            }
            for (token_id, amount) in &batch.retired_totals {
                let key = token_key(*token_id);
                let bytes = match tokens.get(key)? {
                    Some(bytes) => bytes,
                    None => return abort(format!("retired total for unknown token {token_id}")),
                };
                let mut record: TokenRecord = match decode(&bytes) {
                    Ok(record) => record,
                    Err(e) => return abort(e.to_string()),
                };
                record.total_retired = record.total_retired.saturating_add(*amount);
                match encode(&record) {
                    Ok(encoded) => tokens.insert(&key, encoded)?,
                    Err(e) => return abort(e.to_string()),
                };
            }

            for delta in &batch.balance_deltas {
                let key = balance_key(&delta.wallet, delta.token_id);
                let current = match balances.get(key)? {
                    Some(bytes) => match decode_balance(&bytes) {
                        Ok(value) => value,
                        Err(e) => return abort(e),
                    },
                    None => 0,
                };
                let next = match current.checked_add_signed(delta.delta) {
                    Some(next) => next,
                    None => {
                        return abort(format!(
                            "balance underflow for {} token {}",
                            delta.wallet, delta.token_id
                        ))
                    }
                };
                balances.insert(&key, next.to_be_bytes().to_vec())?;
            }

            for key in &applied_keys {
                applied.insert(key, Vec::<u8>::new())?;
            }

            if let Some(encoded) = &checkpoint {
                meta.insert(CHECKPOINT_KEY, encoded.as_slice())?;
            }
            if let Some((key, value)) = &marker {
                meta.insert(key.as_slice(), value.as_slice())?;
            }

            Ok(())
        });

        match result {
            Ok(()) => {}
            Err(TransactionError::Abort(reason)) => return Err(StoreError::Corrupt(reason)),
            Err(TransactionError::Storage(e)) => return Err(write_error(e)),
        }

        if let Some((block, _)) = batch.block_marker {
            self.prune_markers(block)?;
        }

        self.meta.flush_async().await.map_err(write_error)?;
        Ok(())
    }

    async fn replace_wallet_roles(&self, snapshot: &RoleSnapshot) -> Result<(), StoreError> {
        let mut batch = sled::Batch::default();
        for entry in self.roles.iter() {
            let (key, _) = entry.map_err(read_error)?;
            batch.remove(key);
        }
        for (wallet, roles) in &snapshot.holders {
            let record = WalletRoleRecord {
                wallet: *wallet,
                roles: roles.clone(),
                reconciled_block: snapshot.block,
            };
            batch.insert(wallet.0.to_vec(), encode(&record)?);
        }
        self.roles.apply_batch(batch).map_err(write_error)?;
        self.roles.flush_async().await.map_err(write_error)?;
        Ok(())
    }

    async fn block_marker(&self, block: u64) -> Result<Option<BlockHash>, StoreError> {
        self.meta
            .get(marker_key(block))
            .map_err(read_error)?
            .map(|bytes| decode(&bytes))
            .transpose()
    }

    async fn applied_events_in(
        &self,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<EventId>, StoreError> {
        let low = applied_key(&EventId {
            block: from_block,
            log_index: 0,
            token_id: 0,
        });
        let high = applied_key(&EventId {
            block: to_block.saturating_add(1),
            log_index: 0,
            token_id: 0,
        });
        let mut ids = Vec::new();
        for entry in self.applied.range(low..high) {
            let (key, _) = entry.map_err(read_error)?;
            ids.push(applied_key_to_id(&key)?);
        }
        Ok(ids)
    }
}
