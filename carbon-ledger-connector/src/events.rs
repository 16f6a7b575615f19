//! Chain-facing data model: addresses, token classes, wallet roles, and the
//! normalized ledger events every sync path (backfill and live) flows through.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// A 20-byte wallet or contract address, rendered as `0x`-prefixed hex.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Address(pub [u8; 20]);

impl Address {
    /// The zero address. Mints originate from it on the wire.
    pub const ZERO: Address = Address([0u8; 20]);
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x")?;
        for byte in self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl FromStr for Address {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hex = s.strip_prefix("0x").unwrap_or(s);
        if hex.len() != 40 {
            return Err(AddressParseError(s.to_string()));
        }
        let mut out = [0u8; 20];
        for (i, chunk) in out.iter_mut().enumerate() {
            *chunk = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16)
                .map_err(|_| AddressParseError(s.to_string()))?;
        }
        Ok(Address(out))
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("invalid address: {0}")]
pub struct AddressParseError(String);

/// A 32-byte block hash, used for reorg markers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockHash(pub [u8; 32]);

impl fmt::Display for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x")?;
        for byte in self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

/// Chain-assigned token identifier.
pub type TokenId = u64;

/// The token classes issued by the ledger contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TokenType {
    RenewableEnergyCertificate,
    CarbonOffset,
    AuditedEmissions,
}

impl TokenType {
    /// Maps the contract's numeric `tokenTypeId` to a token class.
    pub fn from_type_id(id: u8) -> Option<Self> {
        match id {
            1 => Some(Self::RenewableEnergyCertificate),
            2 => Some(Self::CarbonOffset),
            3 => Some(Self::AuditedEmissions),
            _ => None,
        }
    }
}

/// Roles granted by the ledger's access-control contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Role {
    Admin,
    RecDealer,
    OffsetDealer,
    EmissionsAuditor,
    Consumer,
}

impl Role {
    /// All roles the contract can grant, in a stable order.
    pub const ALL: [Role; 5] = [
        Role::Admin,
        Role::RecDealer,
        Role::OffsetDealer,
        Role::EmissionsAuditor,
        Role::Consumer,
    ];
}

/// The set of roles held by a single wallet.
pub type RoleSet = BTreeSet<Role>;

/// Identity of a ledger event: `(block, intra-block log index, token id)`.
///
/// Re-applying an event with an already-applied identity is a no-op, which is
/// what lets historical replay and live redelivery overlap at the seam block.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct EventId {
    pub block: u64,
    pub log_index: u32,
    pub token_id: TokenId,
}

/// Indicates which sync path produced a [`NormalizedEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventSource {
    /// Fetched by the backfill engine from a historical block range.
    Backfill,
    /// Delivered by the live subscription.
    Live,
}

/// The balance-affecting operations the ledger contract emits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LedgerEventPayload {
    /// A new token was issued. Creates the token row; quantities arrive
    /// through the accompanying `Mint`.
    Issued {
        token_type: TokenType,
        issuer: Address,
        metadata: String,
        description: String,
    },
    /// Units credited to a wallet out of thin air (transfer from zero).
    Mint { to: Address, quantity: u128 },
    /// Units moved between two wallets.
    Transfer {
        from: Address,
        to: Address,
        quantity: u128,
    },
    /// Units permanently retired from a wallet's balance.
    Retire { from: Address, quantity: u128 },
}

/// A chain event normalized into the single shape both sync paths share.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedEvent {
    pub block: u64,
    pub log_index: u32,
    pub token_id: TokenId,
    /// Hash of the containing block, when the transport reports it.
    /// Feeds the reorg markers; absent in unit-test fixtures.
    pub block_hash: Option<BlockHash>,
    pub payload: LedgerEventPayload,
}

impl NormalizedEvent {
    pub fn id(&self) -> EventId {
        EventId {
            block: self.block,
            log_index: self.log_index,
            token_id: self.token_id,
        }
    }

    /// Ordering key: `(block number, intra-block log index)`.
    pub fn ordering_key(&self) -> (u64, u32) {
        (self.block, self.log_index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_round_trips_through_hex() {
        let addr: Address = "0x00112233445566778899aabbccddeeff00112233"
            .parse()
            .unwrap();
        assert_eq!(
            addr.to_string(),
            "0x00112233445566778899aabbccddeeff00112233"
        );
    }

    #[test]
    fn address_rejects_bad_input() {
        assert!("0x1234".parse::<Address>().is_err());
        assert!("zz112233445566778899aabbccddeeff00112233"
            .parse::<Address>()
            .is_err());
    }

    #[test]
    fn token_type_ids_map_to_classes() {
        assert_eq!(
            TokenType::from_type_id(1),
            Some(TokenType::RenewableEnergyCertificate)
        );
        assert_eq!(TokenType::from_type_id(3), Some(TokenType::AuditedEmissions));
        assert_eq!(TokenType::from_type_id(9), None);
    }
}
