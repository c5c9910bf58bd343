use alloy::primitives::{Address, Bytes, B256, U256};
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::{collections::BTreeMap, fmt};

use crate::types::ToHexString;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexedBlock {
    pub number: u64,
    pub hash: B256,
    pub parent_hash: B256,
    pub timestamp: DateTime<Utc>,
    pub miner: Address,
    pub difficulty: U256,
    pub gas_limit: u64,
    pub gas_used: u64,
    pub transaction_count: usize,
    pub size: u64,
    pub extra_data: Bytes,
    pub uncles: Vec<B256>,
    pub indexed_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxStatus {
    Success,
    Failed,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodArgument {
    pub name: String,
    pub value: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodCall {
    pub selector: String,
    pub name: Option<String>,
    pub arguments: Vec<MethodArgument>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenStandard {
    Erc20,
    Erc721,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenTransfer {
    pub token_address: Address,
    pub from: Address,
    pub to: Address,
    pub value: U256,
    pub token_id: Option<U256>,
    pub standard: TokenStandard,
    pub log_index: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexedTransaction {
    pub hash: B256,
    pub block_number: u64,
    pub block_hash: B256,
    pub transaction_index: u64,
    pub timestamp: DateTime<Utc>,
    pub from: Address,
    pub to: Option<Address>,
    pub value: U256,
    pub gas_limit: u64,
    pub gas_price: u128,
    pub gas_used: u64,
    pub status: TxStatus,
    pub nonce: u64,
    pub input: Bytes,
    pub method: Option<MethodCall>,
    pub contract_created: Option<Address>,
    pub token_transfers: Vec<TokenTransfer>,
    pub events: Vec<IndexedEvent>,
    pub indexed_at: DateTime<Utc>,
}

impl IndexedTransaction {
    /// Fee actually paid by the sender, in wei.
    pub fn fee(&self) -> U256 {
        U256::from(self.gas_used) * U256::from(self.gas_price)
    }

    /// Sender followed by recipient, without duplicates.
    pub fn touched_addresses(&self) -> Vec<Address> {
        let mut touched = vec![self.from];
        if let Some(to) = self.to.or(self.contract_created) {
            if to != self.from {
                touched.push(to);
            }
        }
        touched
    }
}

/// Position of a transaction in the chain. Incremental entities remember the
/// newest one they applied so that re-indexing a block does not count twice.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TxPosition {
    pub block_number: u64,
    pub transaction_index: u64,
}

impl IndexedTransaction {
    pub fn position(&self) -> TxPosition {
        TxPosition {
            block_number: self.block_number,
            transaction_index: self.transaction_index,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressKind {
    ExternallyOwned,
    Contract,
    Multisig,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenHolding {
    pub token_address: Address,
    pub balance: U256,
    pub last_updated: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NftHolding {
    pub contract_address: Address,
    pub token_id: U256,
    pub last_updated: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexedAddress {
    pub address: Address,
    pub kind: AddressKind,
    /// Best-effort running balance. Not a source of truth.
    pub balance: U256,
    pub nonce: u64,
    pub transaction_count: u64,
    pub first_seen: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub token_holdings: Vec<TokenHolding>,
    pub nft_holdings: Vec<NftHolding>,
    pub tags: Vec<String>,
    pub last_tx_position: Option<TxPosition>,
    pub indexed_at: DateTime<Utc>,
}

impl IndexedAddress {
    pub fn new(address: Address, seen_at: DateTime<Utc>) -> Self {
        Self {
            address,
            kind: AddressKind::ExternallyOwned,
            balance: U256::ZERO,
            nonce: 0,
            transaction_count: 0,
            first_seen: seen_at,
            last_activity: seen_at,
            token_holdings: Vec::new(),
            nft_holdings: Vec::new(),
            tags: Vec::new(),
            last_tx_position: None,
            indexed_at: Utc::now(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContractKind {
    Erc20,
    Erc721,
    Multisig,
    Unknown,
}

impl ContractKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContractKind::Erc20 => "erc20",
            ContractKind::Erc721 => "erc721",
            ContractKind::Multisig => "multisig",
            ContractKind::Unknown => "unknown",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexedContract {
    pub address: Address,
    pub creator: Address,
    pub creation_tx_hash: B256,
    pub creation_block: u64,
    pub creation_timestamp: DateTime<Utc>,
    pub kind: ContractKind,
    pub name: Option<String>,
    pub symbol: Option<String>,
    pub abi: Option<String>,
    pub source_code: Option<String>,
    pub is_verified: bool,
    pub interaction_count: u64,
    pub last_tx_position: Option<TxPosition>,
    pub indexed_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexedEvent {
    pub block_number: u64,
    pub block_hash: B256,
    pub transaction_hash: B256,
    pub transaction_index: u64,
    pub log_index: u64,
    pub timestamp: DateTime<Utc>,
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Bytes,
    pub name: Option<String>,
    pub decoded: BTreeMap<String, String>,
    pub indexed_at: DateTime<Utc>,
}

/// Ingestion cursor persisted alongside the indexed data.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: String,
    pub block_number: u64,
    pub block_hash: B256,
    pub updated_at: DateTime<Utc>,
}

pub const INGESTION_CHECKPOINT: &str = "ingestion";

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Block,
    Transaction,
    Address,
    Contract,
    Event,
    Checkpoint,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Block => "block",
            EntityKind::Transaction => "transaction",
            EntityKind::Address => "address",
            EntityKind::Contract => "contract",
            EntityKind::Event => "event",
            EntityKind::Checkpoint => "checkpoint",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Natural chain identifier of an indexed entity.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum EntityKey {
    Block(u64),
    Transaction(B256),
    Address(Address),
    Contract(Address),
    Event {
        block_number: u64,
        transaction_hash: B256,
        log_index: u64,
    },
    Checkpoint(String),
}

impl EntityKey {
    pub fn kind(&self) -> EntityKind {
        match self {
            EntityKey::Block(_) => EntityKind::Block,
            EntityKey::Transaction(_) => EntityKind::Transaction,
            EntityKey::Address(_) => EntityKind::Address,
            EntityKey::Contract(_) => EntityKind::Contract,
            EntityKey::Event { .. } => EntityKind::Event,
            EntityKey::Checkpoint(_) => EntityKind::Checkpoint,
        }
    }

    /// Key within its kind, as persisted by storage backends.
    pub fn id(&self) -> String {
        match self {
            EntityKey::Block(number) => number.to_string(),
            EntityKey::Transaction(hash) => hash.to_hex_string(),
            EntityKey::Address(address) | EntityKey::Contract(address) => {
                address.to_hex_string()
            }
            EntityKey::Event {
                block_number,
                transaction_hash,
                log_index,
            } => format!(
                "{}:{}:{}",
                block_number,
                transaction_hash.to_hex_string(),
                log_index
            ),
            EntityKey::Checkpoint(id) => id.clone(),
        }
    }

    pub fn cache_key(&self) -> String {
        match self {
            EntityKey::Block(number) => format!("block:{}", number),
            EntityKey::Transaction(hash) => format!("tx:{}", hash.to_hex_string()),
            _ => format!("{}:{}", self.kind(), self.id()),
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind(), self.id())
    }
}

/// Secondary columns every backend indexes so that queries behave the same
/// regardless of where entities live.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IndexColumns {
    pub block_number: Option<u64>,
    pub block_hash: Option<B256>,
    pub position: Option<u64>,
    pub timestamp: Option<DateTime<Utc>>,
    pub from_address: Option<Address>,
    pub to_address: Option<Address>,
    pub contract_address: Option<Address>,
    pub topic0: Option<B256>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum Entity {
    Block(IndexedBlock),
    Transaction(IndexedTransaction),
    Address(IndexedAddress),
    Contract(IndexedContract),
    Event(IndexedEvent),
    Checkpoint(Checkpoint),
}

impl Entity {
    pub fn kind(&self) -> EntityKind {
        match self {
            Entity::Block(_) => EntityKind::Block,
            Entity::Transaction(_) => EntityKind::Transaction,
            Entity::Address(_) => EntityKind::Address,
            Entity::Contract(_) => EntityKind::Contract,
            Entity::Event(_) => EntityKind::Event,
            Entity::Checkpoint(_) => EntityKind::Checkpoint,
        }
    }

    pub fn key(&self) -> EntityKey {
        match self {
            Entity::Block(b) => b.key(),
            Entity::Transaction(t) => t.key(),
            Entity::Address(a) => a.key(),
            Entity::Contract(c) => c.key(),
            Entity::Event(e) => e.key(),
            Entity::Checkpoint(c) => c.key(),
        }
    }

    pub fn columns(&self) -> IndexColumns {
        match self {
            Entity::Block(b) => IndexColumns {
                block_number: Some(b.number),
                block_hash: Some(b.hash),
                timestamp: Some(b.timestamp),
                from_address: Some(b.miner),
                ..Default::default()
            },
            Entity::Transaction(t) => IndexColumns {
                block_number: Some(t.block_number),
                block_hash: Some(t.block_hash),
                position: Some(t.transaction_index),
                timestamp: Some(t.timestamp),
                from_address: Some(t.from),
                to_address: t.to.or(t.contract_created),
                ..Default::default()
            },
            Entity::Address(a) => IndexColumns {
                timestamp: Some(a.last_activity),
                from_address: Some(a.address),
                ..Default::default()
            },
            Entity::Contract(c) => IndexColumns {
                block_number: Some(c.creation_block),
                timestamp: Some(c.creation_timestamp),
                from_address: Some(c.creator),
                contract_address: Some(c.address),
                ..Default::default()
            },
            Entity::Event(e) => IndexColumns {
                block_number: Some(e.block_number),
                block_hash: Some(e.block_hash),
                position: Some(e.log_index),
                timestamp: Some(e.timestamp),
                contract_address: Some(e.address),
                topic0: e.topics.first().copied(),
                ..Default::default()
            },
            Entity::Checkpoint(c) => IndexColumns {
                block_number: Some(c.block_number),
                block_hash: Some(c.block_hash),
                timestamp: Some(c.updated_at),
                ..Default::default()
            },
        }
    }

    /// JSON of the inner entity, without the kind tag. This is what caches
    /// and document payload columns hold.
    pub fn payload(&self) -> serde_json::Result<serde_json::Value> {
        match self {
            Entity::Block(b) => serde_json::to_value(b),
            Entity::Transaction(t) => serde_json::to_value(t),
            Entity::Address(a) => serde_json::to_value(a),
            Entity::Contract(c) => serde_json::to_value(c),
            Entity::Event(e) => serde_json::to_value(e),
            Entity::Checkpoint(c) => serde_json::to_value(c),
        }
    }

    pub fn from_payload(kind: EntityKind, payload: serde_json::Value) -> serde_json::Result<Self> {
        Ok(match kind {
            EntityKind::Block => Entity::Block(serde_json::from_value(payload)?),
            EntityKind::Transaction => Entity::Transaction(serde_json::from_value(payload)?),
            EntityKind::Address => Entity::Address(serde_json::from_value(payload)?),
            EntityKind::Contract => Entity::Contract(serde_json::from_value(payload)?),
            EntityKind::Event => Entity::Event(serde_json::from_value(payload)?),
            EntityKind::Checkpoint => Entity::Checkpoint(serde_json::from_value(payload)?),
        })
    }
}

/// Typed view over one `Entity` variant.
pub trait IndexedEntity: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const KIND: EntityKind;

    fn key(&self) -> EntityKey;
    fn into_entity(self) -> Entity;
    fn from_entity(entity: Entity) -> Option<Self>;
}

macro_rules! indexed_entity {
    ($ty:ty, $variant:ident, |$this:ident| $key:expr) => {
        impl IndexedEntity for $ty {
            const KIND: EntityKind = EntityKind::$variant;

            fn key(&self) -> EntityKey {
                let $this = self;
                $key
            }

            fn into_entity(self) -> Entity {
                Entity::$variant(self)
            }

            fn from_entity(entity: Entity) -> Option<Self> {
                match entity {
                    Entity::$variant(inner) => Some(inner),
                    _ => None,
                }
            }
        }

        impl From<$ty> for Entity {
            fn from(value: $ty) -> Self {
                Entity::$variant(value)
            }
        }
    };
}

indexed_entity!(IndexedBlock, Block, |b| EntityKey::Block(b.number));
indexed_entity!(IndexedTransaction, Transaction, |t| EntityKey::Transaction(t.hash));
indexed_entity!(IndexedAddress, Address, |a| EntityKey::Address(a.address));
indexed_entity!(IndexedContract, Contract, |c| EntityKey::Contract(c.address));
indexed_entity!(IndexedEvent, Event, |e| EntityKey::Event {
    block_number: e.block_number,
    transaction_hash: e.transaction_hash,
    log_index: e.log_index,
});
indexed_entity!(Checkpoint, Checkpoint, |c| EntityKey::Checkpoint(c.id.clone()));

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::unix_to_utc;
    use pretty_assertions::assert_eq;

    fn block() -> IndexedBlock {
        IndexedBlock {
            number: 7,
            hash: B256::repeat_byte(7),
            parent_hash: B256::repeat_byte(6),
            timestamp: unix_to_utc(1_700_000_000),
            miner: Address::repeat_byte(1),
            difficulty: U256::from(1_000_000u64),
            gas_limit: 30_000_000,
            gas_used: 21_000,
            transaction_count: 1,
            size: 512,
            extra_data: Bytes::new(),
            uncles: vec![],
            indexed_at: unix_to_utc(1_700_000_100),
        }
    }

    #[test]
    fn payload_round_trips_through_kind() {
        let entity = Entity::Block(block());
        let payload = entity.payload().unwrap();
        let back = Entity::from_payload(EntityKind::Block, payload).unwrap();
        assert_eq!(entity, back);
    }

    #[test]
    fn event_key_is_composite() {
        let key = EntityKey::Event {
            block_number: 12,
            transaction_hash: B256::repeat_byte(0x11),
            log_index: 3,
        };
        assert_eq!(key.kind(), EntityKind::Event);
        assert!(key.id().starts_with("12:0x1111"));
        assert!(key.id().ends_with(":3"));
    }

    #[test]
    fn cache_keys_are_namespaced() {
        assert_eq!(EntityKey::Block(100).cache_key(), "block:100");
        let addr = Address::repeat_byte(0xaa);
        assert_eq!(
            EntityKey::Address(addr).cache_key(),
            format!("address:{}", addr.to_hex_string())
        );
    }

    #[test]
    fn self_transfer_touches_one_address() {
        let a = Address::repeat_byte(2);
        let tx = IndexedTransaction {
            hash: B256::repeat_byte(9),
            block_number: 7,
            block_hash: B256::repeat_byte(7),
            transaction_index: 0,
            timestamp: unix_to_utc(1_700_000_000),
            from: a,
            to: Some(a),
            value: U256::from(1u64),
            gas_limit: 21_000,
            gas_price: 1,
            gas_used: 21_000,
            status: TxStatus::Success,
            nonce: 0,
            input: Bytes::new(),
            method: None,
            contract_created: None,
            token_transfers: vec![],
            events: vec![],
            indexed_at: unix_to_utc(1_700_000_000),
        };
        assert_eq!(tx.touched_addresses(), vec![a]);
        assert_eq!(tx.fee(), U256::from(21_000u64));
    }
}
