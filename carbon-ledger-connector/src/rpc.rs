//! Production [`ChainReader`] over JSON-RPC.
//!
//! Historical reads and contract state go over HTTP (`eth_getLogs`,
//! `eth_blockNumber`, `eth_getBlockByNumber`, `eth_call`); the live feed is
//! an `eth_subscribe("logs")` WebSocket. The transport is an implementation
//! detail below the core: everything is normalized into
//! [`NormalizedEvent`]s before a worker sees it.

use crate::chain::{ChainReader, EventSubscription, RoleSnapshot};
use crate::config::MirrorConfig;
use crate::error::ChainError;
use crate::events::{
    Address, BlockHash, LedgerEventPayload, NormalizedEvent, Role, RoleSet, TokenType,
};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

/// `TokenIssued(uint256 indexed tokenId, address indexed issuedBy, uint8 tokenTypeId, string metadata, string description)`
const TOPIC_TOKEN_ISSUED: &str =
    "0x5c2b4a8b12b8a6e3c1efcb2dbbbabeba28b8e7d8eb8fa2f8d10c4b1f9ac1e774";
/// ERC-1155 `TransferSingle(address indexed operator, address indexed from, address indexed to, uint256 id, uint256 value)`
const TOPIC_TRANSFER_SINGLE: &str =
    "0xc3d58168c5ae7397731d063d5bbf3d657854427343f4c083240f7aacaa2d0f62";
/// `TokenRetired(address indexed account, uint256 indexed tokenId, uint256 amount)`
const TOPIC_TOKEN_RETIRED: &str =
    "0x9e4bd8b1c16b59d5e0c8f1f5b3a0a8b92d0a7dbd23e1a1d9e3e7c6b58432fa19";

/// `getRoleMemberCount(bytes32)`
const SEL_ROLE_MEMBER_COUNT: &str = "ca15c873";
/// `getRoleMember(bytes32,uint256)`
const SEL_ROLE_MEMBER: &str = "9010d07c";

/// Role identifiers as the access-control contract hashes them. The admin
/// role is the all-zero default; the rest are the contract's named roles.
const ROLE_IDS: [(Role, &str); 5] = [
    (
        Role::Admin,
        "0000000000000000000000000000000000000000000000000000000000000000",
    ),
    (
        Role::RecDealer,
        "6d3b2f9e541b1a6f2c41e41c2a7d9c1b4a8f0e3d5c6b7a8291e0f1d2c3b4a596",
    ),
    (
        Role::OffsetDealer,
        "1f4e8d2c3b5a69788796a5b4c3d2e1f00f1e2d3c4b5a69788796a5b4c3d2e1f0",
    ),
    (
        Role::EmissionsAuditor,
        "a1b2c3d4e5f60718293a4b5c6d7e8f90019f8e7d6c5b4a392817f6e5d4c3b2a1",
    ),
    (
        Role::Consumer,
        "7e6d5c4b3a2918f0e1d2c3b4a5968778695a4b3c2d1e0f978695a4b3c2d1e0f9",
    ),
];

/// A [`ChainReader`] speaking JSON-RPC to a single node.
pub struct JsonRpcChainReader {
    http: reqwest::Client,
    rpc_url: String,
    ws_url: String,
    contract: Address,
    live_event_buffer: usize,
    request_id: AtomicU64,
}

impl JsonRpcChainReader {
    /// Validates the configured contract address and prepares the HTTP
    /// client. No connection is made until the first call.
    pub fn new(config: &MirrorConfig) -> Result<Self, ChainError> {
        let contract: Address = config
            .chain
            .contract_address
            .parse()
            .map_err(|e| ChainError::Decode(format!("contract address: {e}")))?;
        Ok(Self {
            http: reqwest::Client::new(),
            rpc_url: config.chain.rpc_url.clone(),
            ws_url: config.chain.ws_url.clone(),
            contract,
            live_event_buffer: config.channels.live_event_buffer.max(1),
            request_id: AtomicU64::new(1),
        })
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, ChainError> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": self.request_id.fetch_add(1, Ordering::Relaxed),
            "method": method,
            "params": params,
        });
        let response = self
            .http
            .post(&self.rpc_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| ChainError::Unavailable(anyhow::Error::new(e)))?;
        let payload: Value = response
            .json()
            .await
            .map_err(|e| ChainError::Unavailable(anyhow::Error::new(e)))?;

        if let Some(error) = payload.get("error") {
            return Err(ChainError::Rpc {
                code: error.get("code").and_then(Value::as_i64).unwrap_or(0),
                message: error
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown")
                    .to_string(),
            });
        }
        payload
            .get("result")
            .cloned()
            .ok_or_else(|| ChainError::Decode(format!("{method}: response has no result")))
    }

    async fn eth_call(&self, data: String) -> Result<Vec<u8>, ChainError> {
        let result = self
            .call(
                "eth_call",
                json!([{ "to": self.contract.to_string(), "data": data }, "latest"]),
            )
            .await?;
        let hex = result
            .as_str()
            .ok_or_else(|| ChainError::Decode("eth_call: non-string result".into()))?;
        hex_bytes(hex)
    }

    fn log_filter(&self, from_block: u64, to_block: Option<u64>) -> Value {
        let topics = json!([[TOPIC_TOKEN_ISSUED, TOPIC_TRANSFER_SINGLE, TOPIC_TOKEN_RETIRED]]);
        let mut filter = json!({
            "address": self.contract.to_string(),
            "fromBlock": hex_u64(from_block),
            "topics": topics,
        });
        if let Some(to_block) = to_block {
            filter["toBlock"] = Value::String(hex_u64(to_block));
        }
        filter
    }
}

#[async_trait]
impl ChainReader for JsonRpcChainReader {
    async fn head_block(&self) -> Result<u64, ChainError> {
        let result = self.call("eth_blockNumber", json!([])).await?;
        quantity_u64(&result)
    }

    async fn block_hash(&self, block: u64) -> Result<BlockHash, ChainError> {
        let result = self
            .call("eth_getBlockByNumber", json!([hex_u64(block), false]))
            .await?;
        let hash = result
            .get("hash")
            .and_then(Value::as_str)
            .ok_or_else(|| ChainError::Decode(format!("block {block} has no hash")))?;
        parse_block_hash(hash)
    }

    async fn events_in_range(
        &self,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<NormalizedEvent>, ChainError> {
        let result = self
            .call("eth_getLogs", json!([self.log_filter(from_block, Some(to_block))]))
            .await?;
        let logs = result
            .as_array()
            .ok_or_else(|| ChainError::Decode("eth_getLogs: non-array result".into()))?;

        let mut events = Vec::with_capacity(logs.len());
        for log in logs {
            if let Some(event) = decode_log(log)? {
                events.push(event);
            }
        }
        Ok(events)
    }

    async fn role_holders(&self) -> Result<RoleSnapshot, ChainError> {
        let block = self.head_block().await?;
        let mut holders: BTreeMap<Address, RoleSet> = BTreeMap::new();

        for (role, role_id) in ROLE_IDS {
            let count_data = format!("0x{SEL_ROLE_MEMBER_COUNT}{role_id}");
            let count = word_u64(&self.eth_call(count_data).await?)?;
            for index in 0..count {
                let member_data =
                    format!("0x{SEL_ROLE_MEMBER}{role_id}{:064x}", index);
                let word = self.eth_call(member_data).await?;
                let wallet = word_address(&word)?;
                holders.entry(wallet).or_default().insert(role);
            }
        }
        Ok(RoleSnapshot { block, holders })
    }

    async fn subscribe(&self, from_block: u64) -> Result<EventSubscription, ChainError> {
        let (stream, _) = tokio_tungstenite::connect_async(self.ws_url.as_str())
            .await
            .map_err(|e| ChainError::Unavailable(anyhow::Error::new(e)))?;
        let (mut sink, mut source) = stream.split();

        let request = json!({
            "jsonrpc": "2.0",
            "id": self.request_id.fetch_add(1, Ordering::Relaxed),
            "method": "eth_subscribe",
            "params": ["logs", self.log_filter(from_block, None)],
        });
        sink.send(Message::Text(request.to_string()))
            .await
            .map_err(|e| ChainError::Unavailable(anyhow::Error::new(e)))?;

        // The node acks with a subscription id before notifications start.
        let ack = source
            .next()
            .await
            .ok_or_else(|| ChainError::Unavailable(anyhow::anyhow!("ws closed before ack")))?
            .map_err(|e| ChainError::Unavailable(anyhow::Error::new(e)))?;
        let ack: Value = match ack {
            Message::Text(text) => serde_json::from_str(&text)
                .map_err(|e| ChainError::Decode(format!("subscribe ack: {e}")))?,
            other => {
                return Err(ChainError::Decode(format!(
                    "unexpected subscribe ack frame: {other:?}"
                )))
            }
        };
        if ack.get("result").and_then(Value::as_str).is_none() {
            return Err(ChainError::Decode(format!("subscribe rejected: {ack}")));
        }

        let (tx, rx) = mpsc::channel(self.live_event_buffer);

        // Close the gap between the caller's resume point and the moment
        // the subscription opened; overlap with the feed is fine, the
        // consumer's idempotence discipline drops duplicates.
        let head = self.head_block().await?;
        let backlog = if head >= from_block {
            self.events_in_range(from_block, head).await?
        } else {
            Vec::new()
        };
        let feed = async move {
            for event in backlog {
                if tx.send(event).await.is_err() {
                    return;
                }
            }
            while let Some(message) = source.next().await {
                let text = match message {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => continue,
                };
                let notification: Value = match serde_json::from_str(&text) {
                    Ok(value) => value,
                    Err(error) => {
                        tracing::warn!(%error, "dropping malformed ws frame");
                        continue;
                    }
                };
                let Some(log) = notification
                    .get("params")
                    .and_then(|params| params.get("result"))
                else {
                    continue;
                };
                match decode_log(log) {
                    Ok(Some(event)) => {
                        if event.block < from_block {
                            continue;
                        }
                        // A full buffer blocks here, backpressuring the
                        // socket instead of growing memory.
                        if tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => {}
                    Err(error) => {
                        tracing::warn!(%error, "dropping undecodable log");
                    }
                }
            }
        };
        tokio::spawn(feed);

        Ok(EventSubscription::new(rx))
    }
}

fn hex_u64(value: u64) -> String {
    format!("0x{value:x}")
}

fn hex_bytes(hex: &str) -> Result<Vec<u8>, ChainError> {
    let hex = hex.strip_prefix("0x").unwrap_or(hex);
    if hex.len() % 2 != 0 {
        return Err(ChainError::Decode(format!("odd-length hex: {hex}")));
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&hex[i..i + 2], 16)
                .map_err(|_| ChainError::Decode(format!("invalid hex: {hex}")))
        })
        .collect()
}

fn quantity_u64(value: &Value) -> Result<u64, ChainError> {
    let hex = value
        .as_str()
        .ok_or_else(|| ChainError::Decode(format!("expected hex quantity, got {value}")))?;
    let hex = hex.strip_prefix("0x").unwrap_or(hex);
    u64::from_str_radix(hex, 16)
        .map_err(|_| ChainError::Decode(format!("invalid quantity: {hex}")))
}

fn parse_block_hash(hex: &str) -> Result<BlockHash, ChainError> {
    let bytes = hex_bytes(hex)?;
    let raw: [u8; 32] = bytes
        .try_into()
        .map_err(|_| ChainError::Decode(format!("block hash is not 32 bytes: {hex}")))?;
    Ok(BlockHash(raw))
}

/// Interprets a 32-byte ABI word as a u64, rejecting overflow.
fn word_u64(word: &[u8]) -> Result<u64, ChainError> {
    if word.len() < 32 || word[..24].iter().any(|b| *b != 0) {
        return Err(ChainError::Decode("word out of u64 range".into()));
    }
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&word[24..32]);
    Ok(u64::from_be_bytes(raw))
}

/// Interprets a 32-byte ABI word as a u128, rejecting overflow.
fn word_u128(word: &[u8]) -> Result<u128, ChainError> {
    if word.len() < 32 || word[..16].iter().any(|b| *b != 0) {
        return Err(ChainError::Decode("word out of u128 range".into()));
    }
    let mut raw = [0u8; 16];
    raw.copy_from_slice(&word[16..32]);
    Ok(u128::from_be_bytes(raw))
}

/// Interprets a 32-byte ABI word as an address (last 20 bytes).
fn word_address(word: &[u8]) -> Result<Address, ChainError> {
    if word.len() < 32 {
        return Err(ChainError::Decode("short address word".into()));
    }
    let mut raw = [0u8; 20];
    raw.copy_from_slice(&word[12..32]);
    Ok(Address(raw))
}

fn topic_word(log: &Value, index: usize) -> Result<Vec<u8>, ChainError> {
    log.get("topics")
        .and_then(Value::as_array)
        .and_then(|topics| topics.get(index))
        .and_then(Value::as_str)
        .ok_or_else(|| ChainError::Decode(format!("log missing topic {index}")))
        .and_then(hex_bytes)
}

/// Reads a dynamic ABI string whose offset word sits at `offset_index`.
fn abi_string(data: &[u8], offset_index: usize) -> Result<String, ChainError> {
    let offset_word = data
        .get(offset_index * 32..offset_index * 32 + 32)
        .ok_or_else(|| ChainError::Decode("truncated abi data".into()))?;
    let offset = word_u64(offset_word)? as usize;
    let length_word = data
        .get(offset..offset + 32)
        .ok_or_else(|| ChainError::Decode("string offset out of bounds".into()))?;
    let length = word_u64(length_word)? as usize;
    let bytes = data
        .get(offset + 32..offset + 32 + length)
        .ok_or_else(|| ChainError::Decode("string length out of bounds".into()))?;
    String::from_utf8(bytes.to_vec())
        .map_err(|_| ChainError::Decode("string is not utf-8".into()))
}

/// Decodes one raw log into a [`NormalizedEvent`]. Logs with an unknown
/// topic return `Ok(None)` — the filter may be wider than the decoder.
fn decode_log(log: &Value) -> Result<Option<NormalizedEvent>, ChainError> {
    let topic0 = log
        .get("topics")
        .and_then(Value::as_array)
        .and_then(|topics| topics.first())
        .and_then(Value::as_str)
        .ok_or_else(|| ChainError::Decode("log has no topics".into()))?
        .to_ascii_lowercase();

    let block = quantity_u64(
        log.get("blockNumber")
            .ok_or_else(|| ChainError::Decode("log has no blockNumber".into()))?,
    )?;
    let log_index = quantity_u64(
        log.get("logIndex")
            .ok_or_else(|| ChainError::Decode("log has no logIndex".into()))?,
    )? as u32;
    let block_hash = log
        .get("blockHash")
        .and_then(Value::as_str)
        .map(parse_block_hash)
        .transpose()?;
    let data = hex_bytes(
        log.get("data")
            .and_then(Value::as_str)
            .unwrap_or("0x"),
    )?;

    match topic0.as_str() {
        TOPIC_TOKEN_ISSUED => {
            let token_id = word_u64(&topic_word(log, 1)?)?;
            let issuer = word_address(&topic_word(log, 2)?)?;
            let type_id = word_u64(
                data.get(0..32)
                    .ok_or_else(|| ChainError::Decode("issued event has no data".into()))?,
            )? as u8;
            let token_type = TokenType::from_type_id(type_id).ok_or_else(|| {
                ChainError::Decode(format!("unknown token type id {type_id}"))
            })?;
            let metadata = abi_string(&data, 1)?;
            let description = abi_string(&data, 2)?;
            return Ok(Some(NormalizedEvent {
                block,
                log_index,
                token_id,
                block_hash,
                payload: LedgerEventPayload::Issued {
                    token_type,
                    issuer,
                    metadata,
                    description,
                },
            }));
        }
        TOPIC_TRANSFER_SINGLE => {
            let from = word_address(&topic_word(log, 2)?)?;
            let to = word_address(&topic_word(log, 3)?)?;
            let token_id = word_u64(
                data.get(0..32)
                    .ok_or_else(|| ChainError::Decode("transfer event has no id".into()))?,
            )?;
            let quantity = word_u128(
                data.get(32..64)
                    .ok_or_else(|| ChainError::Decode("transfer event has no value".into()))?,
            )?;
            let payload = if from == Address::ZERO {
                LedgerEventPayload::Mint { to, quantity }
            } else if to == Address::ZERO {
                LedgerEventPayload::Retire { from, quantity }
            } else {
                LedgerEventPayload::Transfer { from, to, quantity }
            };
            return Ok(Some(NormalizedEvent {
                block,
                log_index,
                token_id,
                block_hash,
                payload,
            }));
        }
        TOPIC_TOKEN_RETIRED => {
            let from = word_address(&topic_word(log, 1)?)?;
            let token_id = word_u64(&topic_word(log, 2)?)?;
            let quantity = word_u128(
                data.get(0..32)
                    .ok_or_else(|| ChainError::Decode("retire event has no amount".into()))?,
            )?;
            return Ok(Some(NormalizedEvent {
                block,
                log_index,
                token_id,
                block_hash,
                payload: LedgerEventPayload::Retire { from, quantity },
            }));
        }
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn word_hex(bytes: &[u8]) -> String {
        let mut word = [0u8; 32];
        word[32 - bytes.len()..].copy_from_slice(bytes);
        word.iter().map(|b| format!("{b:02x}")).collect()
    }

    fn address_topic(addr: &Address) -> String {
        format!("0x{}", word_hex(&addr.0))
    }

    #[test]
    fn decodes_transfer_single_as_transfer() {
        let from = Address([1u8; 20]);
        let to = Address([2u8; 20]);
        let data = format!(
            "0x{}{}",
            word_hex(&7u64.to_be_bytes()),
            word_hex(&40u128.to_be_bytes())
        );
        let log = json!({
            "topics": [
                TOPIC_TRANSFER_SINGLE,
                address_topic(&Address([9u8; 20])),
                address_topic(&from),
                address_topic(&to),
            ],
            "data": data,
            "blockNumber": "0xb",
            "logIndex": "0x0",
            "blockHash": format!("0x{}", "11".repeat(32)),
        });

        let event = decode_log(&log).unwrap().unwrap();
        assert_eq!(event.block, 11);
        assert_eq!(event.token_id, 7);
        assert_eq!(
            event.payload,
            LedgerEventPayload::Transfer {
                from,
                to,
                quantity: 40
            }
        );
    }

    #[test]
    fn transfer_from_zero_is_a_mint() {
        let to = Address([2u8; 20]);
        let data = format!(
            "0x{}{}",
            word_hex(&7u64.to_be_bytes()),
            word_hex(&100u128.to_be_bytes())
        );
        let log = json!({
            "topics": [
                TOPIC_TRANSFER_SINGLE,
                address_topic(&Address([9u8; 20])),
                address_topic(&Address::ZERO),
                address_topic(&to),
            ],
            "data": data,
            "blockNumber": "0x5",
            "logIndex": "0x1",
        });

        let event = decode_log(&log).unwrap().unwrap();
        assert_eq!(
            event.payload,
            LedgerEventPayload::Mint { to, quantity: 100 }
        );
        assert_eq!(event.block_hash, None);
    }

    #[test]
    fn decodes_token_issued_with_dynamic_strings() {
        let issuer = Address([3u8; 20]);
        let metadata = "scope:1";
        let description = "wind farm";
        // (uint8, string, string): type word, two offset words, then each
        // string as length + padded bytes.
        let mut data = Vec::new();
        data.extend_from_slice(&{
            let mut w = [0u8; 32];
            w[31] = 2;
            w
        });
        let meta_offset = 96u64;
        let desc_offset = meta_offset + 32 + 32;
        data.extend_from_slice(&{
            let mut w = [0u8; 32];
            w[24..].copy_from_slice(&meta_offset.to_be_bytes());
            w
        });
        data.extend_from_slice(&{
            let mut w = [0u8; 32];
            w[24..].copy_from_slice(&desc_offset.to_be_bytes());
            w
        });
        for s in [metadata, description] {
            let mut len = [0u8; 32];
            len[24..].copy_from_slice(&(s.len() as u64).to_be_bytes());
            data.extend_from_slice(&len);
            let mut padded = s.as_bytes().to_vec();
            padded.resize(32, 0);
            data.extend_from_slice(&padded);
        }
        let data_hex = format!(
            "0x{}",
            data.iter().map(|b| format!("{b:02x}")).collect::<String>()
        );

        let log = json!({
            "topics": [
                TOPIC_TOKEN_ISSUED,
                format!("0x{}", word_hex(&42u64.to_be_bytes())),
                address_topic(&issuer),
            ],
            "data": data_hex,
            "blockNumber": "0x3",
            "logIndex": "0x2",
        });

        let event = decode_log(&log).unwrap().unwrap();
        assert_eq!(event.token_id, 42);
        assert_eq!(
            event.payload,
            LedgerEventPayload::Issued {
                token_type: TokenType::CarbonOffset,
                issuer,
                metadata: metadata.to_string(),
                description: description.to_string(),
            }
        );
    }

    #[test]
    fn unknown_topics_are_skipped() {
        let log = json!({
            "topics": [format!("0x{}", "ab".repeat(32))],
            "data": "0x",
            "blockNumber": "0x1",
            "logIndex": "0x0",
        });
        assert!(decode_log(&log).unwrap().is_none());
    }

    #[test]
    fn oversized_quantity_is_a_decode_error() {
        let mut value = [0xffu8; 32];
        value[20] = 0xff;
        let data = format!("0x{}{}", word_hex(&7u64.to_be_bytes()), word_hex(&value));
        let log = json!({
            "topics": [
                TOPIC_TRANSFER_SINGLE,
                address_topic(&Address([9u8; 20])),
                address_topic(&Address([1u8; 20])),
                address_topic(&Address([2u8; 20])),
            ],
            "data": data,
            "blockNumber": "0x1",
            "logIndex": "0x0",
        });
        assert!(decode_log(&log).is_err());
    }
}
