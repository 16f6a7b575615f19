//! The Mirror Store: durable tables for tokens, balances, and wallet roles,
//! plus the sync checkpoint.
//!
//! The store is an injected capability (`Arc<dyn MirrorStore>`). The
//! synchronizer is its only writer; external consumers read the same tables
//! through whatever query surface the hosting process provides.

pub mod memory;
pub mod sled_store;

use crate::chain::RoleSnapshot;
use crate::error::StoreError;
use crate::events::{Address, BlockHash, EventId, RoleSet, TokenId, TokenType};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// A mirrored token row. Immutable once written except for the issued and
/// retired totals, which advance only through derived balance events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRecord {
    pub token_id: TokenId,
    pub token_type: TokenType,
    pub issuer: Address,
    pub total_issued: u128,
    pub total_retired: u128,
    pub metadata: String,
    pub description: String,
    pub issuance_block: u64,
}

/// A mirrored wallet/role row. Derived entirely from chain access-control
/// state; never locally authored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletRoleRecord {
    pub wallet: Address,
    pub roles: RoleSet,
    /// Head block of the snapshot this row was last reconciled against.
    pub reconciled_block: u64,
}

/// Sync lifecycle status carried by the checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncStatus {
    Backfilling,
    Live,
    Stalled,
}

/// The last block whose effects are fully and durably reflected in the
/// mirror. Advanced only after a batch commits; moved backward only by an
/// explicit re-sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub block: u64,
    pub status: SyncStatus,
}

/// One signed balance change for a `(wallet, token)` key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BalanceDelta {
    pub wallet: Address,
    pub token_id: TokenId,
    pub delta: i128,
}

/// One atomic unit of derived writes: either everything here lands, or
/// nothing does. Partial application must never be observable.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MirrorBatch {
    pub new_tokens: Vec<TokenRecord>,
    pub balance_deltas: Vec<BalanceDelta>,
    /// Per-token increments to `total_issued`.
    pub issued_totals: Vec<(TokenId, u128)>,
    /// Per-token increments to `total_retired`.
    pub retired_totals: Vec<(TokenId, u128)>,
    /// Identities applied by this batch. Persisted so any later replay —
    /// including an explicit re-sync that moves the checkpoint backward —
    /// treats them as no-ops.
    pub applied_events: Vec<EventId>,
    pub checkpoint: Option<Checkpoint>,
    /// Hash of the batch's final block, recorded for reorg detection.
    pub block_marker: Option<(u64, BlockHash)>,
}

impl MirrorBatch {
    pub fn is_empty(&self) -> bool {
        self.new_tokens.is_empty()
            && self.balance_deltas.is_empty()
            && self.issued_totals.is_empty()
            && self.retired_totals.is_empty()
            && self.applied_events.is_empty()
            && self.checkpoint.is_none()
            && self.block_marker.is_none()
    }
}

/// How many recent block markers each store retains for reorg checks.
pub const MARKER_RETENTION_BLOCKS: u64 = 1_024;

/// Durable mirror state. Implementations must make [`apply_batch`] a single
/// transactional unit and keep reads consistent with either the pre- or
/// post-state of an in-flight batch, never a mix.
///
/// [`apply_batch`]: MirrorStore::apply_batch
#[async_trait]
pub trait MirrorStore: Send + Sync {
    async fn token(&self, token_id: TokenId) -> Result<Option<TokenRecord>, StoreError>;

    /// Current balance for a `(wallet, token)` key; zero when absent.
    async fn balance(&self, wallet: &Address, token_id: TokenId) -> Result<u128, StoreError>;

    async fn wallet_roles(&self, wallet: &Address)
        -> Result<Option<WalletRoleRecord>, StoreError>;

    async fn all_wallet_roles(&self) -> Result<Vec<WalletRoleRecord>, StoreError>;

    async fn checkpoint(&self) -> Result<Option<Checkpoint>, StoreError>;

    /// Writes the checkpoint alone. Used for status transitions and for the
    /// explicit re-sync reset; batch commits go through [`apply_batch`]
    /// instead.
    ///
    /// [`apply_batch`]: MirrorStore::apply_batch
    async fn put_checkpoint(&self, checkpoint: Checkpoint) -> Result<(), StoreError>;

    /// Atomically applies token rows, balance deltas, totals, checkpoint,
    /// and block marker.
    async fn apply_batch(&self, batch: &MirrorBatch) -> Result<(), StoreError>;

    /// Overwrites the wallet/role table to match the snapshot exactly.
    async fn replace_wallet_roles(&self, snapshot: &RoleSnapshot) -> Result<(), StoreError>;

    /// Recorded hash for a committed block, if still retained.
    async fn block_marker(&self, block: u64) -> Result<Option<BlockHash>, StoreError>;

    /// Identities already applied within the inclusive block range. Replays
    /// seed their duplicate tracking from this before deriving.
    async fn applied_events_in(
        &self,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<EventId>, StoreError>;
}
