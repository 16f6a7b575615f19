//! # Synchronizer & Background Workers
//!
//! This module defines the [`Synchronizer`], which orchestrates the sync
//! phases against the mirror store.
//!
//! ## Core Components
//!
//! - [`Synchronizer`]: owns the phase sequence. It is consumed when its
//!   `run` method is called.
//! - [`SyncHandle`]: a clonable handle carrying the watch-published
//!   [`SyncState`] and the command channel (shutdown, forced re-sync).
//! - **Workers**:
//!   - `BackfillEngine`: replays historical block ranges in atomic batches.
//!   - `LiveWorker`: ingests the live event subscription after backfill
//!     catches up.
//!   - `WalletRoleSynchronizer`: reconciles the wallet/role table against
//!     contract state.
//!
//! Startup sequence: read-or-initialize the checkpoint, backfill to the
//! chain head (repeating while the head advances), then hand off to the
//! live worker with a one-shot role reconciliation. Fatal errors surface as
//! a typed [`SyncError`] and leave the state machine in
//! [`SyncState::Stalled`]; the hosting process owns shutdown policy.

mod backfill;
mod live;
mod roles;

pub use backfill::BackfillResult;
pub use roles::ReconciliationResult;

use backfill::BackfillEngine;
use live::LiveWorker;
use roles::WalletRoleSynchronizer;

use crate::calculator::BalanceCalculator;
use crate::chain::ChainReader;
use crate::config::{MirrorConfig, SynchronizerConfig};
use crate::error::{ChainError, StoreError, SyncError};
use crate::storage::{Checkpoint, MirrorStore, SyncStatus};
use backoff::ExponentialBackoffBuilder;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

/// A shared context containing all dependencies required by the workers.
#[derive(Clone)]
pub(crate) struct WorkerContext {
    pub config: Arc<MirrorConfig>,
    pub chain: Arc<dyn ChainReader>,
    pub store: Arc<dyn MirrorStore>,
}

/// Externally observable synchronizer lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Uninitialized,
    Backfilling,
    Live,
    /// A fatal condition was hit; operator intervention (restart or
    /// `force_resync`) is required. Deliberately not retried forever —
    /// an infinite retry loop would mask persistent outages.
    Stalled,
    ShuttingDown,
}

/// Commands accepted by a running [`Synchronizer`].
#[derive(Debug)]
enum SyncCommand {
    Shutdown,
    ForceResync { from_block: u64 },
}

/// A clonable, thread-safe handle for a running [`Synchronizer`].
#[derive(Debug, Clone)]
pub struct SyncHandle {
    command_tx: mpsc::Sender<SyncCommand>,
    state_rx: watch::Receiver<SyncState>,
}

impl SyncHandle {
    /// Current state machine position.
    pub fn state(&self) -> SyncState {
        *self.state_rx.borrow()
    }

    /// Waits until the synchronizer reaches `target`. Returns `false` if
    /// the synchronizer exited first.
    pub async fn wait_for(&mut self, target: SyncState) -> bool {
        if *self.state_rx.borrow() == target {
            return true;
        }
        while self.state_rx.changed().await.is_ok() {
            if *self.state_rx.borrow() == target {
                return true;
            }
        }
        false
    }

    /// Requests a graceful shutdown: the in-flight batch completes or is
    /// abandoned atomically, then `run` returns.
    pub async fn stop(&self) {
        if self.command_tx.send(SyncCommand::Shutdown).await.is_err() {
            tracing::warn!("synchronizer already stopped");
        }
    }

    /// Resets the checkpoint to `from_block` and re-enters backfill. The
    /// only path that moves the checkpoint backward; used to recover from
    /// detected divergence.
    pub async fn force_resync(&self, from_block: u64) {
        let command = SyncCommand::ForceResync { from_block };
        if self.command_tx.send(command).await.is_err() {
            tracing::warn!("synchronizer already stopped; force_resync ignored");
        }
    }
}

/// Orchestrates the backfill, live, and role workers over one mirror.
pub struct Synchronizer {
    ctx: WorkerContext,
    command_rx: mpsc::Receiver<SyncCommand>,
    state_tx: watch::Sender<SyncState>,
}

impl Synchronizer {
    /// Creates a new `Synchronizer` and its [`SyncHandle`].
    ///
    /// The workers are prepared but nothing runs until [`run`] is awaited.
    ///
    /// [`run`]: Synchronizer::run
    pub fn new(
        config: Arc<MirrorConfig>,
        chain: Arc<dyn ChainReader>,
        store: Arc<dyn MirrorStore>,
    ) -> (Self, SyncHandle) {
        let (command_tx, command_rx) = mpsc::channel(8);
        let (state_tx, state_rx) = watch::channel(SyncState::Uninitialized);

        let synchronizer = Self {
            ctx: WorkerContext {
                config,
                chain,
                store,
            },
            command_rx,
            state_tx,
        };
        let handle = SyncHandle {
            command_tx,
            state_rx,
        };
        (synchronizer, handle)
    }

    /// Runs the full phase sequence. Returns `Ok(())` after a requested
    /// shutdown, or the fatal [`SyncError`] that stalled the mirror.
    pub async fn run(mut self) -> Result<(), SyncError> {
        let result = self.drive().await;
        match &result {
            Ok(()) => {
                self.set_state(SyncState::ShuttingDown);
                tracing::info!("synchronizer shut down");
            }
            Err(error) => {
                tracing::error!(%error, "synchronizer stalled");
                self.set_state(SyncState::Stalled);
                self.mark_stalled().await;
            }
        }
        result
    }

    async fn drive(&mut self) -> Result<(), SyncError> {
        loop {
            match self.sync_cycle().await? {
                CycleOutcome::Shutdown => return Ok(()),
                CycleOutcome::Resync => continue,
            }
        }
    }

    /// One pass of the state machine: backfill to head, then live. Returns
    /// when a command interrupts the phase.
    async fn sync_cycle(&mut self) -> Result<CycleOutcome, SyncError> {
        let mut calculator = BalanceCalculator::new();

        self.enter_status(SyncState::Backfilling, SyncStatus::Backfilling)
            .await?;

        let engine = BackfillEngine::new(self.ctx.clone());
        let start_block = self.ctx.config.chain.start_block.unwrap_or(0);
        loop {
            let resume_from = match self.ctx.store.checkpoint().await? {
                Some(checkpoint) => checkpoint.block.saturating_add(1),
                None => start_block,
            };
            let head = with_chain_retries(&self.ctx.config.synchronizer, "head_block", || {
                self.ctx.chain.head_block()
            })
            .await?;
            if head < resume_from {
                break;
            }

            let backfill = engine.backfill(&mut calculator, resume_from, head);
            tokio::pin!(backfill);
            let result = tokio::select! {
                result = &mut backfill => result?,
                command = self.command_rx.recv() => {
                    return self.handle_command(command).await;
                }
            };
            tracing::info!(
                final_block = result.final_block,
                tokens = result.tokens_written,
                balance_updates = result.balance_updates,
                events = result.events_applied,
                "backfill pass complete"
            );
            // The engine already extended through any head advance it
            // observed; one more head read closes the race, and a second
            // pass runs only if the chain outpaced the batch margin.
        }

        self.enter_status(SyncState::Live, SyncStatus::Live).await?;

        let live = LiveWorker::new(self.ctx.clone(), calculator);
        let roles = WalletRoleSynchronizer::new(self.ctx.clone());

        // Both workers run until a fatal error or a command interrupts
        // them; neither returns Ok under normal operation.
        tokio::select! {
            result = live.run() => {
                result?;
                Err(SyncError::SubscriptionDropped)
            }
            result = roles.run() => {
                result?;
                Err(SyncError::SubscriptionDropped)
            }
            command = self.command_rx.recv() => self.handle_command(command).await,
        }
    }

    async fn handle_command(
        &mut self,
        command: Option<SyncCommand>,
    ) -> Result<CycleOutcome, SyncError> {
        match command {
            Some(SyncCommand::Shutdown) | None => {
                tracing::info!("shutdown requested");
                Ok(CycleOutcome::Shutdown)
            }
            Some(SyncCommand::ForceResync { from_block }) => {
                tracing::warn!(from_block, "forced re-sync: moving checkpoint backward");
                let checkpoint = Checkpoint {
                    block: from_block.saturating_sub(1),
                    status: SyncStatus::Backfilling,
                };
                with_store_retries(&self.ctx.config.synchronizer, "reset checkpoint", || {
                    self.ctx.store.put_checkpoint(checkpoint)
                })
                .await?;
                Ok(CycleOutcome::Resync)
            }
        }
    }

    /// Durably records the status change before publishing it, so an
    /// observer that sees the new state never reads a stale checkpoint.
    async fn enter_status(&self, state: SyncState, status: SyncStatus) -> Result<(), SyncError> {
        if let Some(checkpoint) = self.ctx.store.checkpoint().await? {
            if checkpoint.status != status {
                with_store_retries(&self.ctx.config.synchronizer, "status transition", || {
                    self.ctx.store.put_checkpoint(Checkpoint {
                        block: checkpoint.block,
                        status,
                    })
                })
                .await?;
            }
        }
        self.set_state(state);
        Ok(())
    }

    fn set_state(&self, state: SyncState) {
        self.state_tx.send_replace(state);
    }

    /// Best-effort: record the stall in the durable checkpoint so readers
    /// can tell the mirror is behind.
    async fn mark_stalled(&self) {
        if let Ok(Some(checkpoint)) = self.ctx.store.checkpoint().await {
            let stalled = Checkpoint {
                block: checkpoint.block,
                status: SyncStatus::Stalled,
            };
            if let Err(error) = self.ctx.store.put_checkpoint(stalled).await {
                tracing::error!(%error, "failed to record stalled status");
            }
        }
    }
}

enum CycleOutcome {
    Shutdown,
    Resync,
}

/// Assembles the slice of mirror state a batch derivation starts from:
/// balances for every touched key, existence for every referenced token.
pub(crate) async fn assemble_base_state(
    ctx: &WorkerContext,
    events: &[crate::events::NormalizedEvent],
) -> Result<crate::calculator::BaseState, SyncError> {
    let (keys, token_ids) = crate::calculator::touched_state(events);
    let mut base = crate::calculator::BaseState::default();
    for (wallet, token_id) in keys {
        let balance = ctx.store.balance(&wallet, token_id).await?;
        base.balances.insert((wallet, token_id), balance);
    }
    for token_id in token_ids {
        if ctx.store.token(token_id).await?.is_some() {
            base.known_tokens.insert(token_id);
        }
    }
    Ok(base)
}

/// Runs a chain call with exponential backoff and a bounded attempt count.
/// Exhaustion is fatal: the mirror must not be served against if it cannot
/// reach a known-consistent state.
pub(crate) async fn with_chain_retries<T, Op, Fut>(
    config: &SynchronizerConfig,
    label: &'static str,
    mut op: Op,
) -> Result<T, SyncError>
where
    Op: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ChainError>>,
{
    let policy = ExponentialBackoffBuilder::new()
        .with_initial_interval(Duration::from_millis(config.retry_initial_interval_ms))
        .with_max_interval(Duration::from_millis(config.retry_max_interval_ms))
        .with_max_elapsed_time(None)
        .build();
    let max_attempts = config.chain_retry_max_attempts.max(1);
    let attempts = AtomicU32::new(0u32);

    let result = backoff::future::retry_notify(
        policy,
        || {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            let call = op();
            async move {
                match call.await {
                    Ok(value) => Ok(value),
                    Err(error) => {
                        let transient = matches!(
                            error,
                            ChainError::Unavailable(_) | ChainError::Rpc { .. }
                        );
                        if transient && attempt < max_attempts {
                            Err(backoff::Error::transient(error))
                        } else {
                            Err(backoff::Error::permanent(error))
                        }
                    }
                }
            }
        },
        |error: ChainError, delay| {
            tracing::warn!(label, %error, ?delay, "chain call failed, backing off");
        },
    )
    .await;

    result.map_err(|source| SyncError::ChainUnavailable {
        attempts: attempts.load(Ordering::SeqCst),
        source,
    })
}

/// Runs a mirror write with a small bounded retry count. An unpersisted
/// checkpoint risks reprocessing or loss, so exhaustion is fatal.
pub(crate) async fn with_store_retries<T, Op, Fut>(
    config: &SynchronizerConfig,
    label: &'static str,
    mut op: Op,
) -> Result<T, SyncError>
where
    Op: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let max_attempts = config.store_retry_max_attempts.max(1);
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(error) => {
                let retriable = matches!(error, StoreError::Write(_));
                if retriable && attempt < max_attempts {
                    tracing::warn!(label, %error, attempt, "mirror write failed, retrying");
                    tokio::time::sleep(Duration::from_millis(50 * u64::from(attempt))).await;
                    continue;
                }
                return Err(SyncError::StoreWriteFailure {
                    attempts: attempt,
                    source: error,
                });
            }
        }
    }
}
