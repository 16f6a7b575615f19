//! Configuration structures for the mirror synchronizer.
//!
//! The core consumes this as a plain, already-loaded record. File parsing and
//! environment overlays belong to the hosting binary.

use serde::{Deserialize, Serialize};

/// The top-level configuration for the synchronizer library.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct MirrorConfig {
    #[serde(default)]
    pub chain: ChainConfig,
    #[serde(default)]
    pub synchronizer: SynchronizerConfig,
    #[serde(default)]
    pub channels: ChannelConfig,
}

/// Connection settings for the chain node and the ledger contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ChainConfig {
    /// JSON-RPC endpoint for historical reads and contract state.
    pub rpc_url: String,
    /// WebSocket endpoint for the live log subscription.
    pub ws_url: String,
    /// Address of the token ledger contract, `0x`-prefixed hex.
    pub contract_address: String,
    /// Human-readable network identifier, used only for logging.
    pub network: String,
    /// First block the mirror cares about. `None` starts at genesis.
    pub start_block: Option<u64>,
}

/// Behavior of the backfill engine and live worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SynchronizerConfig {
    /// Blocks per backfill batch. Smaller batches trade throughput for
    /// finer crash-recovery granularity.
    pub batch_size: u64,
    /// Bounded attempt count for chain calls before the phase goes fatal.
    pub chain_retry_max_attempts: u32,
    /// Initial backoff delay for chain retries, in milliseconds.
    pub retry_initial_interval_ms: u64,
    /// Backoff delay ceiling, in milliseconds.
    pub retry_max_interval_ms: u64,
    /// Bounded attempt count for mirror writes before the phase goes fatal.
    pub store_retry_max_attempts: u32,
    /// How long the live worker lets a block's events sit before flushing
    /// them when no later block has arrived, in milliseconds.
    pub live_flush_interval_ms: u64,
    /// Pause before re-establishing a dropped subscription, in milliseconds.
    pub resubscribe_delay_ms: u64,
    /// Interval between periodic role reconciliations. `None` keeps only
    /// the one-shot reconcile at startup.
    pub role_poll_interval_secs: Option<u64>,
}

/// Capacities for the bounded channels inside the connector.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ChannelConfig {
    /// Buffer capacity of the live subscription channel. A slow mirror
    /// write backpressures the feed at this depth.
    pub live_event_buffer: usize,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            rpc_url: "http://127.0.0.1:8545".to_string(),
            ws_url: "ws://127.0.0.1:8546".to_string(),
            contract_address: "0x0000000000000000000000000000000000000000".to_string(),
            network: "localhost".to_string(),
            start_block: None,
        }
    }
}

impl Default for SynchronizerConfig {
    fn default() -> Self {
        Self {
            batch_size: 2_000,
            chain_retry_max_attempts: 5,
            retry_initial_interval_ms: 250,
            retry_max_interval_ms: 8_000,
            store_retry_max_attempts: 3,
            live_flush_interval_ms: 500,
            resubscribe_delay_ms: 1_000,
            role_poll_interval_secs: None,
        }
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            live_event_buffer: 256,
        }
    }
}
