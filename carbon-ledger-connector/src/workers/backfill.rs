//! Historical replay: paginates block ranges through the chain reader,
//! derives deltas, and commits each batch atomically with its checkpoint.

use crate::calculator::BalanceCalculator;
use crate::error::SyncError;
use crate::storage::{Checkpoint, MirrorBatch, SyncStatus};
use crate::workers::{assemble_base_state, with_chain_retries, with_store_retries, WorkerContext};

/// Counters reported by a completed backfill pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackfillResult {
    /// Last block whose effects are durably in the mirror.
    pub final_block: u64,
    pub tokens_written: u64,
    pub balance_updates: u64,
    pub events_applied: u64,
    pub duplicates_skipped: u64,
    pub batches_committed: u64,
}

pub struct BackfillEngine {
    ctx: WorkerContext,
}

impl BackfillEngine {
    pub(crate) fn new(ctx: WorkerContext) -> Self {
        Self { ctx }
    }

    /// Replays the inclusive range `[from_block, to_block]` in batches.
    ///
    /// `to_block` must not exceed the chain head at call time. If the head
    /// advances while the range is being processed, the range is extended
    /// to the newly observed head rather than truncated — the pass returns
    /// only once it has caught up with everything it saw.
    pub async fn backfill(
        &self,
        calculator: &mut BalanceCalculator,
        from_block: u64,
        to_block: u64,
    ) -> Result<BackfillResult, SyncError> {
        if from_block > to_block {
            return Err(SyncError::InvalidRange {
                from: from_block,
                to: to_block,
            });
        }
        let head = self.read_head().await?;
        if to_block > head {
            return Err(SyncError::InvalidRange {
                from: from_block,
                to: to_block,
            });
        }

        let batch_size = self.ctx.config.synchronizer.batch_size.max(1);
        let mut result = BackfillResult::default();
        let mut next = from_block;
        let mut target = to_block;

        tracing::info!(from_block, to_block, batch_size, "backfill started");

        loop {
            while next <= target {
                let batch_end = next
                    .saturating_add(batch_size - 1)
                    .min(target);
                self.process_batch(calculator, next, batch_end, &mut result)
                    .await?;
                next = batch_end + 1;
            }

            let head = self.read_head().await?;
            if head > target {
                tracing::debug!(
                    old_target = target,
                    new_target = head,
                    "head advanced during backfill, extending range"
                );
                target = head;
            } else {
                break;
            }
        }

        result.final_block = target;
        Ok(result)
    }

    async fn process_batch(
        &self,
        calculator: &mut BalanceCalculator,
        from_block: u64,
        to_block: u64,
        result: &mut BackfillResult,
    ) -> Result<(), SyncError> {
        let sync_cfg = &self.ctx.config.synchronizer;
        let events = with_chain_retries(sync_cfg, "events_in_range", || {
            self.ctx.chain.events_in_range(from_block, to_block)
        })
        .await?;

        // A replay over committed blocks (an explicit re-sync, a restart
        // mid-range) must not double-apply; the durable applied set fences
        // every event this range has already contributed.
        let prior_applied = self
            .ctx
            .store
            .applied_events_in(from_block, to_block)
            .await?;
        calculator.mark_applied(prior_applied);

        let base = assemble_base_state(&self.ctx, &events).await?;
        let application = calculator
            .apply(&events, &base)
            .map_err(|reason| SyncError::ChainInconsistent { reason })?;

        let marker_hash = with_chain_retries(sync_cfg, "block_hash", || {
            self.ctx.chain.block_hash(to_block)
        })
        .await?;

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
                block: to_block,
                status: SyncStatus::Backfilling,
            }),
            block_marker: Some((to_block, marker_hash)),
        };

        with_store_retries(sync_cfg, "apply backfill batch", || {
            self.ctx.store.apply_batch(&batch)
        })
        .await?;

        calculator.prune_applied(to_block);

        result.tokens_written += application.new_tokens.len() as u64;
        result.balance_updates += batch.balance_deltas.len() as u64;
        result.events_applied += application.applied.len() as u64;
        result.duplicates_skipped += application.duplicates;
        result.batches_committed += 1;

        tracing::debug!(
            from_block,
            to_block,
            events = application.applied.len(),
            "backfill batch committed"
        );
        Ok(())
    }

    async fn read_head(&self) -> Result<u64, SyncError> {
        with_chain_retries(&self.ctx.config.synchronizer, "head_block", || {
            self.ctx.chain.head_block()
        })
        .await
    }
}
