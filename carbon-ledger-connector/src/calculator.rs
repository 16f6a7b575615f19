//! Pure balance derivation.
//!
//! Both sync paths — historical backfill and the live subscription — push
//! their events through one [`BalanceCalculator`], so the two can never
//! disagree on semantics. The calculator owns the applied-event identity
//! set that makes replay idempotent across the backfill/live seam.

use crate::error::InconsistencyReason;
use crate::events::{Address, EventId, LedgerEventPayload, NormalizedEvent, TokenId};
use crate::storage::{BalanceDelta, TokenRecord};
use std::collections::{BTreeMap, BTreeSet};

/// The slice of mirror state a derivation starts from: current balances for
/// every key the events touch, and the set of tokens known to exist.
#[derive(Debug, Clone, Default)]
pub struct BaseState {
    pub balances: BTreeMap<(Address, TokenId), u128>,
    pub known_tokens: BTreeSet<TokenId>,
}

/// The outcome of applying a batch of events against a [`BaseState`].
#[derive(Debug, Clone, Default)]
pub struct EventApplication {
    pub new_tokens: Vec<TokenRecord>,
    pub balance_deltas: BTreeMap<(Address, TokenId), i128>,
    pub issued_totals: BTreeMap<TokenId, u128>,
    pub retired_totals: BTreeMap<TokenId, u128>,
    /// Identities applied by this batch, in application order.
    pub applied: Vec<EventId>,
    /// Events skipped because their identity was already applied.
    pub duplicates: u64,
}

impl EventApplication {
    pub fn is_empty(&self) -> bool {
        self.applied.is_empty()
    }

    /// Deltas in store form, consolidated per `(wallet, token)` key.
    pub fn deltas(&self) -> Vec<BalanceDelta> {
        self.balance_deltas
            .iter()
            .filter(|(_, delta)| **delta != 0)
            .map(|((wallet, token_id), delta)| BalanceDelta {
                wallet: *wallet,
                token_id: *token_id,
                delta: *delta,
            })
            .collect()
    }
}

/// Returns the `(wallet, token)` keys and token ids a batch of events will
/// touch, so the caller can assemble the [`BaseState`] with targeted reads.
pub fn touched_state(
    events: &[NormalizedEvent],
) -> (BTreeSet<(Address, TokenId)>, BTreeSet<TokenId>) {
    let mut keys = BTreeSet::new();
    let mut tokens = BTreeSet::new();
    for event in events {
        tokens.insert(event.token_id);
        match &event.payload {
            LedgerEventPayload::Issued { .. } => {}
            LedgerEventPayload::Mint { to, .. } => {
                keys.insert((*to, event.token_id));
            }
            LedgerEventPayload::Transfer { from, to, .. } => {
                keys.insert((*from, event.token_id));
                keys.insert((*to, event.token_id));
            }
            LedgerEventPayload::Retire { from, .. } => {
                keys.insert((*from, event.token_id));
            }
        }
    }
    (keys, tokens)
}

/// Derives balance deltas from ordered ledger events.
///
/// Given the same starting balances and the same events, the output is
/// always the same; the only state carried between calls is the
/// applied-identity set.
#[derive(Debug, Default)]
pub struct BalanceCalculator {
    applied: BTreeSet<EventId>,
}

impl BalanceCalculator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies `events` in `(block, log index)` order on top of `base`.
    ///
    /// Events whose identity was already applied are skipped. An event that
    /// would drive a balance negative, or that references a token neither
    /// `base` nor this batch knows, aborts the whole application — the
    /// caller must not commit any part of it.
    pub fn apply(
        &mut self,
        events: &[NormalizedEvent],
        base: &BaseState,
    ) -> Result<EventApplication, InconsistencyReason> {
        let mut ordered: Vec<&NormalizedEvent> = events.iter().collect();
        ordered.sort_by_key(|event| (event.block, event.log_index));

        let mut out = EventApplication::default();
        let mut balances = base.balances.clone();
        let mut known_tokens = base.known_tokens.clone();
        let mut applied_in_batch: BTreeSet<EventId> = BTreeSet::new();

        for event in ordered {
            let id = event.id();
            if self.applied.contains(&id) || !applied_in_batch.insert(id) {
                out.duplicates += 1;
                continue;
            }

            match &event.payload {
                LedgerEventPayload::Issued {
                    token_type,
                    issuer,
                    metadata,
                    description,
                } => {
                    known_tokens.insert(event.token_id);
                    out.new_tokens.push(TokenRecord {
                        token_id: event.token_id,
                        token_type: *token_type,
                        issuer: *issuer,
                        total_issued: 0,
                        total_retired: 0,
                        metadata: metadata.clone(),
                        description: description.clone(),
                        issuance_block: event.block,
                    });
                }
                LedgerEventPayload::Mint { to, quantity } => {
                    if !known_tokens.contains(&event.token_id) {
                        return Err(InconsistencyReason::UnknownToken {
                            token_id: event.token_id,
                            event: id,
                        });
                    }
                    credit(&mut balances, &mut out.balance_deltas, *to, event.token_id, *quantity);
                    *out.issued_totals.entry(event.token_id).or_insert(0) += quantity;
                }
                LedgerEventPayload::Transfer { from, to, quantity } => {
                    if !known_tokens.contains(&event.token_id) {
                        return Err(InconsistencyReason::UnknownToken {
                            token_id: event.token_id,
                            event: id,
                        });
                    }
                    debit(&mut balances, &mut out.balance_deltas, *from, event.token_id, *quantity)
                        .map_err(|_| InconsistencyReason::NegativeBalance {
                            wallet: *from,
                            token_id: event.token_id,
                            event: id,
                        })?;
                    credit(&mut balances, &mut out.balance_deltas, *to, event.token_id, *quantity);
                }
                LedgerEventPayload::Retire { from, quantity } => {
                    if !known_tokens.contains(&event.token_id) {
                        return Err(InconsistencyReason::UnknownToken {
                            token_id: event.token_id,
                            event: id,
                        });
                    }
                    debit(&mut balances, &mut out.balance_deltas, *from, event.token_id, *quantity)
                        .map_err(|_| InconsistencyReason::NegativeBalance {
                            wallet: *from,
                            token_id: event.token_id,
                            event: id,
                        })?;
                    *out.retired_totals.entry(event.token_id).or_insert(0) += quantity;
                }
            }

            out.applied.push(id);
        }

        self.applied.extend(out.applied.iter().copied());
        Ok(out)
    }

    /// Seeds the duplicate-tracking set with identities that are already
    /// durably applied, so a replay over their blocks is a no-op.
    pub fn mark_applied<I: IntoIterator<Item = EventId>>(&mut self, ids: I) {
        self.applied.extend(ids);
    }

    /// Forgets identities at or below `through_block`. Once the checkpoint
    /// has passed a block, redelivery of its events is fenced by the
    /// checkpoint comparison instead.
    pub fn prune_applied(&mut self, through_block: u64) {
        self.applied = self.applied.split_off(&EventId {
            block: through_block.saturating_add(1),
            log_index: 0,
            token_id: 0,
        });
    }

    /// Whether an identity has been applied and not yet pruned.
    pub fn is_applied(&self, id: &EventId) -> bool {
        self.applied.contains(id)
    }
}

fn credit(
    balances: &mut BTreeMap<(Address, TokenId), u128>,
    deltas: &mut BTreeMap<(Address, TokenId), i128>,
    wallet: Address,
    token_id: TokenId,
    quantity: u128,
) {
    *balances.entry((wallet, token_id)).or_insert(0) += quantity;
    *deltas.entry((wallet, token_id)).or_insert(0) += quantity as i128;
}

fn debit(
    balances: &mut BTreeMap<(Address, TokenId), u128>,
    deltas: &mut BTreeMap<(Address, TokenId), i128>,
    wallet: Address,
    token_id: TokenId,
    quantity: u128,
) -> Result<(), ()> {
    let entry = balances.entry((wallet, token_id)).or_insert(0);
    if *entry < quantity {
        return Err(());
    }
    *entry -= quantity;
    *deltas.entry((wallet, token_id)).or_insert(0) -= quantity as i128;
    Ok(())
}
