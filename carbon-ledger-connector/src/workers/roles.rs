//! Wallet role reconciliation.
//!
//! Role state is small and the access-control contract is authoritative, so
//! the mirror takes full snapshots instead of replaying grant/revoke events
//! that may have gaps. Each reconcile overwrites the wallet/role table to
//! match the snapshot exactly.

use crate::error::SyncError;
use crate::events::Address;
use crate::workers::{with_chain_retries, with_store_retries, WorkerContext};
use std::collections::BTreeMap;
use std::time::Duration;

/// Explicit outcome of one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconciliationResult {
    /// Head block the authoritative snapshot was taken at.
    pub snapshot_block: u64,
    /// Wallets that gained their first role.
    pub added: Vec<Address>,
    /// Wallets that lost all roles.
    pub removed: Vec<Address>,
    /// Wallets whose role set changed.
    pub changed: Vec<Address>,
    /// Wallets whose role set matched already.
    pub unchanged: u64,
}

pub struct WalletRoleSynchronizer {
    ctx: WorkerContext,
}

impl WalletRoleSynchronizer {
    pub(crate) fn new(ctx: WorkerContext) -> Self {
        Self { ctx }
    }

    /// Reads the complete current role-holder set from contract state and
    /// overwrites the mirror's wallet/role table to match.
    pub async fn reconcile(&self) -> Result<ReconciliationResult, SyncError> {
        let snapshot = with_chain_retries(&self.ctx.config.synchronizer, "role_holders", || {
            self.ctx.chain.role_holders()
        })
        .await?;

        let mirrored: BTreeMap<Address, _> = self
            .ctx
            .store
            .all_wallet_roles()
            .await?
            .into_iter()
            .map(|record| (record.wallet, record.roles))
            .collect();

        let mut result = ReconciliationResult {
            snapshot_block: snapshot.block,
            ..Default::default()
        };
        for (wallet, roles) in &snapshot.holders {
            match mirrored.get(wallet) {
                None => result.added.push(*wallet),
                Some(existing) if existing != roles => result.changed.push(*wallet),
                Some(_) => result.unchanged += 1,
            }
        }
        for wallet in mirrored.keys() {
            if !snapshot.holders.contains_key(wallet) {
                result.removed.push(*wallet);
            }
        }

        with_store_retries(&self.ctx.config.synchronizer, "replace wallet roles", || {
            self.ctx.store.replace_wallet_roles(&snapshot)
        })
        .await?;

        tracing::info!(
            snapshot_block = result.snapshot_block,
            added = result.added.len(),
            removed = result.removed.len(),
            changed = result.changed.len(),
            unchanged = result.unchanged,
            "wallet roles reconciled"
        );
        Ok(result)
    }

    /// One-shot reconcile, then either an idle wait or a periodic loop,
    /// depending on configuration. Never returns under normal operation so
    /// the orchestrator's select keeps the live worker running.
    pub(crate) async fn run(self) -> Result<(), SyncError> {
        self.reconcile().await?;
        match self.ctx.config.synchronizer.role_poll_interval_secs {
            Some(secs) => {
                let interval = Duration::from_secs(secs.max(1));
                loop {
                    tokio::time::sleep(interval).await;
                    self.reconcile().await?;
                }
            }
            None => {
                futures::future::pending::<()>().await;
                unreachable!("pending future resolved")
            }
        }
    }
}
