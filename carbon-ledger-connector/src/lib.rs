//! A core Rust library for mirroring an on-chain emissions-token ledger
//! into a locally queryable store.
//!
//! The mirror is kept current through an initial historical backfill
//! followed by continuous live event ingestion; consumers read only the
//! mirror, never the chain. This crate provides the synchronizer and its
//! capabilities; hosting concerns (config files, logging setup, query
//! surfaces) belong to the embedding process.
//!
//! # Key Components
//!
//! *   [`workers::Synchronizer`]: the main entry point. Sequences backfill,
//!     live ingestion, and role reconciliation, and owns failure
//!     escalation via its [`workers::SyncHandle`].
//! *   [`chain::ChainReader`]: the injected chain-access capability, with a
//!     JSON-RPC implementation in [`rpc`].
//! *   [`storage::MirrorStore`]: the injected mirror-store capability, with
//!     durable (`sled`) and in-memory implementations.
//! *   [`calculator::BalanceCalculator`]: the single derivation path both
//!     sync phases share.
pub mod calculator;
/// The chain-access capability trait and subscription type.
pub mod chain;
/// Configuration structures for the connector.
pub mod config;
/// Typed error taxonomy for sync phases.
pub mod error;
/// Normalized ledger events and chain primitives.
pub mod events;
/// The JSON-RPC/WebSocket [`chain::ChainReader`] implementation.
pub mod rpc;
/// Mirror-store trait, records, and the sled/in-memory implementations.
pub mod storage;
/// The background workers and the orchestrating synchronizer.
pub mod workers;
