//! In-memory [`MirrorStore`] used as a test double and for embedded runs
//! that do not need durability.

use super::{
    Checkpoint, MirrorBatch, MirrorStore, TokenRecord, WalletRoleRecord, MARKER_RETENTION_BLOCKS,
};
use crate::chain::RoleSnapshot;
use crate::error::StoreError;
use crate::events::{Address, BlockHash, EventId, TokenId};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

#[derive(Debug, Default)]
struct Inner {
    tokens: BTreeMap<TokenId, TokenRecord>,
    balances: BTreeMap<(Address, TokenId), u128>,
    roles: BTreeMap<Address, WalletRoleRecord>,
    checkpoint: Option<Checkpoint>,
    markers: BTreeMap<u64, BlockHash>,
    applied: BTreeSet<EventId>,
}

/// A mutex-guarded mirror. Batch application holds the lock for the whole
/// batch, which gives readers the required pre-or-post-state view.
#[derive(Debug, Default)]
pub struct MemoryMirrorStore {
    inner: Mutex<Inner>,
    fail_next_writes: AtomicU32,
}

impl MemoryMirrorStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `n` write operations fail, for exercising the
    /// bounded store-retry paths.
    pub fn inject_write_failures(&self, n: u32) {
        self.fail_next_writes.store(n, Ordering::SeqCst);
    }

    fn check_write_failure(&self) -> Result<(), StoreError> {
        let remaining = self.fail_next_writes.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_next_writes.store(remaining - 1, Ordering::SeqCst);
            return Err(StoreError::Write(anyhow::anyhow!(
                "injected write failure ({} more pending)",
                remaining - 1
            )));
        }
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl MirrorStore for MemoryMirrorStore {
    async fn token(&self, token_id: TokenId) -> Result<Option<TokenRecord>, StoreError> {
        Ok(self.lock().tokens.get(&token_id).cloned())
    }

    async fn balance(&self, wallet: &Address, token_id: TokenId) -> Result<u128, StoreError> {
        Ok(self
            .lock()
            .balances
            .get(&(*wallet, token_id))
            .copied()
            .unwrap_or(0))
    }

    async fn wallet_roles(
        &self,
        wallet: &Address,
    ) -> Result<Option<WalletRoleRecord>, StoreError> {
        Ok(self.lock().roles.get(wallet).cloned())
    }

    async fn all_wallet_roles(&self) -> Result<Vec<WalletRoleRecord>, StoreError> {
        Ok(self.lock().roles.values().cloned().collect())
    }

    async fn checkpoint(&self) -> Result<Option<Checkpoint>, StoreError> {
        Ok(self.lock().checkpoint)
    }

    async fn put_checkpoint(&self, checkpoint: Checkpoint) -> Result<(), StoreError> {
        self.check_write_failure()?;
        self.lock().checkpoint = Some(checkpoint);
        Ok(())
    }

    async fn apply_batch(&self, batch: &MirrorBatch) -> Result<(), StoreError> {
        self.check_write_failure()?;
        let mut inner = self.lock();

        // Stage against copies so a mid-batch error leaves nothing applied.
        let mut tokens = inner.tokens.clone();
        let mut balances = inner.balances.clone();

        for token in &batch.new_tokens {
            tokens.insert(token.token_id, token.clone());
        }
        for (token_id, amount) in &batch.issued_totals {
            let record = tokens.get_mut(token_id).ok_or_else(|| {
                StoreError::Corrupt(format!("issued total for unknown token {token_id}"))
            })?;
            record.total_issued = record.total_issued.saturating_add(*amount);
        }
        for (token_id, amount) in &batch.retired_totals {
            let record = tokens.get_mut(token_id).ok_or_else(|| {
                StoreError::Corrupt(format!("retired total for unknown token {token_id}"))
            })?;
            record.total_retired = record.total_retired.saturating_add(*amount);
        }
        for delta in &batch.balance_deltas {
            let key = (delta.wallet, delta.token_id);
            let current = balances.get(&key).copied().unwrap_or(0);
            let next = current.checked_add_signed(delta.delta).ok_or_else(|| {
                StoreError::Corrupt(format!(
                    "balance underflow for {} token {}",
                    delta.wallet, delta.token_id
                ))
            })?;
            balances.insert(key, next);
        }

        inner.tokens = tokens;
        inner.balances = balances;
        inner.applied.extend(batch.applied_events.iter().copied());
        if let Some(checkpoint) = batch.checkpoint {
            inner.checkpoint = Some(checkpoint);
        }
        if let Some((block, hash)) = batch.block_marker {
            inner.markers.insert(block, hash);
            let cutoff = block.saturating_sub(MARKER_RETENTION_BLOCKS);
            inner.markers = inner.markers.split_off(&cutoff);
        }
        Ok(())
    }

    async fn replace_wallet_roles(&self, snapshot: &RoleSnapshot) -> Result<(), StoreError> {
        self.check_write_failure()?;
        let mut inner = self.lock();
        inner.roles = snapshot
            .holders
            .iter()
            .map(|(wallet, roles)| {
                (
                    *wallet,
                    WalletRoleRecord {
                        wallet: *wallet,
                        roles: roles.clone(),
                        reconciled_block: snapshot.block,
                    },
                )
            })
            .collect();
        Ok(())
    }

    async fn block_marker(&self, block: u64) -> Result<Option<BlockHash>, StoreError> {
        Ok(self.lock().markers.get(&block).copied())
    }

    async fn applied_events_in(
        &self,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<EventId>, StoreError> {
        let low = EventId {
            block: from_block,
            log_index: 0,
            token_id: 0,
        };
        Ok(self
            .lock()
            .applied
            .range(low..)
            .take_while(|id| id.block <= to_block)
            .copied()
            .collect())
    }
}
