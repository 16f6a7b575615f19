//! The chain-access capability consumed by every sync phase.
//!
//! The trait is the seam for test doubles and alternative transports; the
//! production implementation lives in [`crate::rpc`].

use crate::error::ChainError;
use crate::events::{Address, BlockHash, NormalizedEvent, RoleSet};
use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio::sync::mpsc;

/// A point-in-time snapshot of every role holder known to the
/// access-control contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleSnapshot {
    /// Head block the snapshot was taken at.
    pub block: u64,
    pub holders: BTreeMap<Address, RoleSet>,
}

/// A live event feed established by [`ChainReader::subscribe`].
///
/// The feed is non-restartable: once the channel closes the subscription is
/// gone, and the caller resumes by subscribing again from its own
/// last-confirmed block. The channel is bounded, so a slow consumer
/// backpressures the producer instead of buffering without limit.
#[derive(Debug)]
pub struct EventSubscription {
    receiver: mpsc::Receiver<NormalizedEvent>,
}

impl EventSubscription {
    pub fn new(receiver: mpsc::Receiver<NormalizedEvent>) -> Self {
        Self { receiver }
    }

    /// Receives the next event. `None` means the subscription dropped.
    pub async fn recv(&mut self) -> Option<NormalizedEvent> {
        self.receiver.recv().await
    }
}

/// Read access to a remote chain node.
///
/// All methods are fallible with [`ChainError`]; retry policy belongs to the
/// callers, not the implementation.
#[async_trait]
pub trait ChainReader: Send + Sync {
    /// Current chain head block number.
    async fn head_block(&self) -> Result<u64, ChainError>;

    /// Hash of the given block, for reorg markers.
    async fn block_hash(&self, block: u64) -> Result<BlockHash, ChainError>;

    /// All ledger events in the inclusive block range, in chain order.
    async fn events_in_range(
        &self,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<NormalizedEvent>, ChainError>;

    /// Complete current role-holder set from the access-control contract
    /// state. Read from state, not event history, so gaps in the event
    /// feed cannot corrupt role data.
    async fn role_holders(&self) -> Result<RoleSnapshot, ChainError>;

    /// Opens a live event feed starting at `from_block`. Events below
    /// `from_block` may still be delivered by an at-least-once node and
    /// are the consumer's to discard.
    async fn subscribe(&self, from_block: u64) -> Result<EventSubscription, ChainError>;
}
