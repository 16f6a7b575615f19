//! Error taxonomy for the synchronizer.
//!
//! Transient conditions (`ChainError::Unavailable`, dropped subscriptions)
//! are retried locally; anything implying the mirror and the chain disagree
//! surfaces as [`SyncError::ChainInconsistent`] and halts the affected phase.
//! Fatal conditions are returned to the caller — the core never decides
//! process shutdown policy itself.

use crate::events::{EventId, TokenId};

/// Failures reported by a [`ChainReader`](crate::chain::ChainReader).
#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    /// The node could not be reached or answered with a transport error.
    /// Retried with exponential backoff up to a bounded attempt count.
    #[error("chain node unavailable: {0}")]
    Unavailable(#[source] anyhow::Error),

    /// The node answered, but the payload could not be decoded.
    #[error("malformed chain response: {0}")]
    Decode(String),

    /// The node answered with a JSON-RPC level error.
    #[error("chain rpc error {code}: {message}")]
    Rpc { code: i64, message: String },
}

/// Failures reported by a [`MirrorStore`](crate::storage::MirrorStore).
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The underlying database rejected or failed the write.
    #[error("mirror store write failed: {0}")]
    Write(#[source] anyhow::Error),

    /// A read against the mirror failed.
    #[error("mirror store read failed: {0}")]
    Read(#[source] anyhow::Error),

    /// A stored record could not be decoded.
    #[error("mirror store record corrupt: {0}")]
    Corrupt(String),
}

/// Fatal and phase-level outcomes surfaced to the orchestrator.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// Chain retries were exhausted; the mirror cannot reach a
    /// known-consistent state and must not be served as current.
    #[error("chain unavailable after {attempts} attempts: {source}")]
    ChainUnavailable {
        attempts: u32,
        #[source]
        source: ChainError,
    },

    /// Observed chain data contradicts a mirror invariant. Never silently
    /// corrected; the affected batch halts and the synchronizer stalls.
    #[error("chain inconsistent: {reason}")]
    ChainInconsistent { reason: InconsistencyReason },

    /// Local persistence failed after bounded retries.
    #[error("mirror store write failure after {attempts} attempts: {source}")]
    StoreWriteFailure {
        attempts: u32,
        #[source]
        source: StoreError,
    },

    /// The live feed disconnected. Not fatal: the listener resubscribes
    /// from the last durable checkpoint.
    #[error("live subscription dropped")]
    SubscriptionDropped,

    /// A mirror read failed while deriving a batch.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The requested backfill range is malformed.
    #[error("invalid block range: from={from} to={to}")]
    InvalidRange { from: u64, to: u64 },
}

/// The specific invariant a [`SyncError::ChainInconsistent`] violated.
#[derive(Debug, thiserror::Error)]
pub enum InconsistencyReason {
    /// Applying an event would drive a wallet balance below zero.
    #[error("negative balance for wallet {wallet} token {token_id} applying event {event:?}")]
    NegativeBalance {
        wallet: crate::events::Address,
        token_id: TokenId,
        event: EventId,
    },

    /// A balance event referenced a token the mirror has never seen issued.
    #[error("event {event:?} references unknown token {token_id}")]
    UnknownToken { token_id: TokenId, event: EventId },

    /// The chain's hash for a committed block no longer matches the
    /// mirror's recorded marker — a reorg crossed the checkpoint.
    #[error("block {block} hash mismatch: mirror has {mirror}, chain reports {chain}")]
    BlockHashMismatch {
        block: u64,
        mirror: crate::events::BlockHash,
        chain: crate::events::BlockHash,
    },
}

impl SyncError {
    /// Whether the condition requires operator intervention (`Stalled`)
    /// rather than local recovery.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SyncError::ChainUnavailable { .. }
                | SyncError::ChainInconsistent { .. }
                | SyncError::StoreWriteFailure { .. }
        )
    }
}
