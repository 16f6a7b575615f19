//! Live ingestion: consumes the chain subscription after backfill catches
//! up, applying the same derivation path as historical replay.
//!
//! The feed is at-least-once and may reorder slightly near the live edge,
//! so events buffer per block and a block commits either when a later block
//! shows up or after a quiescence interval. Everything at or below the
//! checkpoint, and every already-applied identity, is skipped. On
//! disconnect the worker resubscribes from the durable checkpoint, never
//! from an in-memory cursor.

use crate::calculator::BalanceCalculator;
use crate::chain::EventSubscription;
use crate::error::{InconsistencyReason, SyncError};
use crate::events::NormalizedEvent;
use crate::storage::{Checkpoint, MirrorBatch, SyncStatus};
use crate::workers::{assemble_base_state, with_chain_retries, with_store_retries, WorkerContext};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::timeout;

pub struct LiveWorker {
    ctx: WorkerContext,
    calculator: BalanceCalculator,
    /// Last block durably committed. Mirrors the stored checkpoint; kept
    /// here to avoid a store read per event.
    committed: u64,
}

impl LiveWorker {
    pub(crate) fn new(ctx: WorkerContext, calculator: BalanceCalculator) -> Self {
        Self {
            ctx,
            calculator,
            committed: 0,
        }
    }

    /// Runs until a fatal error. Dropped subscriptions are handled here by
    /// resubscribing; they never surface to the orchestrator.
    pub async fn run(mut self) -> Result<(), SyncError> {
        loop {
            let resume_from = match self.ctx.store.checkpoint().await? {
                Some(checkpoint) => {
                    self.verify_block_marker(checkpoint).await?;
                    self.committed = checkpoint.block;
                    checkpoint.block.saturating_add(1)
                }
                None => self.ctx.config.chain.start_block.unwrap_or(0),
            };

            let mut subscription =
                with_chain_retries(&self.ctx.config.synchronizer, "subscribe", || {
                    self.ctx.chain.subscribe(resume_from)
                })
                .await?;
            tracing::info!(resume_from, "live subscription established");

            match self.pump(&mut subscription).await {
                Err(SyncError::SubscriptionDropped) => {
                    let delay =
                        Duration::from_millis(self.ctx.config.synchronizer.resubscribe_delay_ms);
                    tracing::warn!(
                        ?delay,
                        "live subscription dropped, resubscribing from checkpoint"
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
                other => return other,
            }
        }
    }

    /// Consumes one subscription until it drops or a fatal error occurs.
    async fn pump(&mut self, subscription: &mut EventSubscription) -> Result<(), SyncError> {
        let flush_after =
            Duration::from_millis(self.ctx.config.synchronizer.live_flush_interval_ms.max(1));
        let mut pending: BTreeMap<u64, Vec<NormalizedEvent>> = BTreeMap::new();

        loop {
            match timeout(flush_after, subscription.recv()).await {
                Ok(Some(event)) => {
                    if event.block <= self.committed || self.calculator.is_applied(&event.id()) {
                        tracing::trace!(
                            block = event.block,
                            log_index = event.log_index,
                            "skipping redelivered event"
                        );
                        continue;
                    }
                    pending.entry(event.block).or_default().push(event);

                    // Blocks strictly below the newest seen block are
                    // complete as far as the feed can tell; commit them.
                    if let Some(newest) = pending.keys().next_back().copied() {
                        let ready: Vec<u64> =
                            pending.keys().copied().filter(|b| *b < newest).collect();
                        for block in ready {
                            let events = pending.remove(&block).unwrap_or_default();
                            self.commit_block(block, events).await?;
                        }
                    }
                }
                Ok(None) => return Err(SyncError::SubscriptionDropped),
                Err(_) => {
                    // Quiescence: nothing newer is coming soon, flush what
                    // is buffered.
                    let blocks: Vec<u64> = pending.keys().copied().collect();
                    for block in blocks {
                        let events = pending.remove(&block).unwrap_or_default();
                        self.commit_block(block, events).await?;
                    }
                }
            }
        }
    }

    /// Derives and durably commits one block's events as a single batch.
    async fn commit_block(
        &mut self,
        block: u64,
        events: Vec<NormalizedEvent>,
    ) -> Result<(), SyncError> {
        let prior_applied = self.ctx.store.applied_events_in(block, block).await?;
        self.calculator.mark_applied(prior_applied);

        let base = assemble_base_state(&self.ctx, &events).await?;
        let application = self
            .calculator
            .apply(&events, &base)
            .map_err(|reason| SyncError::ChainInconsistent { reason })?;

        let marker = events
            .iter()
            .find_map(|event| event.block_hash)
            .map(|hash| (block, hash));

        let batch = MirrorBatch {
            new_tokens: application.new_tokens.clone(),
            balance_deltas: application.deltas(),
            issued_totals: application.issued_totals.iter().map(|(k, v)| (*k, *v)).collect(),
            retired_totals: application
                .retired_totals
                .iter()
                .map(|(k, v)| (*k, *v))
                .collect(),
            applied_events: application.applied.clone(),
            checkpoint: Some(Checkpoint {
                block,
                status: SyncStatus::Live,
            }),
            block_marker: marker,
        };

        with_store_retries(&self.ctx.config.synchronizer, "apply live batch", || {
            self.ctx.store.apply_batch(&batch)
        })
        .await?;

        self.committed = block;
        self.calculator.prune_applied(block);
        tracing::debug!(
            block,
            events = application.applied.len(),
            duplicates = application.duplicates,
            "live batch committed"
        );
        Ok(())
    }

    /// Conservative reorg check: the chain's hash for the checkpoint block
    /// must still match the marker recorded when it was committed. A
    /// mismatch means a reorg crossed committed history; that is surfaced,
    /// never silently repaired.
    async fn verify_block_marker(&self, checkpoint: Checkpoint) -> Result<(), SyncError> {
        let Some(mirror_hash) = self.ctx.store.block_marker(checkpoint.block).await? else {
            return Ok(());
        };
        let chain_hash = with_chain_retries(&self.ctx.config.synchronizer, "block_hash", || {
            self.ctx.chain.block_hash(checkpoint.block)
        })
        .await?;
        if chain_hash != mirror_hash {
            return Err(SyncError::ChainInconsistent {
                reason: InconsistencyReason::BlockHashMismatch {
                    block: checkpoint.block,
                    mirror: mirror_hash,
                    chain: chain_hash,
                },
            });
        }
        Ok(())
    }
}
