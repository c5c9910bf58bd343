use alloy::primitives::{Address, Bytes, B256, U256};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, sync::RwLock};

use crate::error::SourceError;

/// Gas charged for a plain value transfer.
pub const TRANSFER_GAS: u64 = 21_000;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawLog {
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Bytes,
    pub log_index: u64,
    pub transaction_hash: B256,
    pub transaction_index: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawReceipt {
    pub transaction_hash: B256,
    pub status: bool,
    pub gas_used: u64,
    pub effective_gas_price: Option<u128>,
    pub contract_address: Option<Address>,
    pub logs: Vec<RawLog>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawTransaction {
    pub hash: B256,
    pub transaction_index: u64,
    pub nonce: u64,
    pub from: Address,
    pub to: Option<Address>,
    pub value: U256,
    pub gas_limit: u64,
    pub gas_price: u128,
    pub input: Bytes,
    pub receipt: Option<RawReceipt>,
}

impl RawTransaction {
    pub fn is_value_transfer(&self) -> bool {
        self.input.is_empty() && self.to.is_some()
    }

    /// The supplied receipt, or one derived from the block when the source
    /// did not provide it.
    pub fn receipt_or_derived(&self, block: &RawBlock) -> RawReceipt {
        match &self.receipt {
            Some(receipt) => receipt.clone(),
            None => derive_receipt(self, block),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawBlock {
    pub number: u64,
    pub hash: B256,
    pub parent_hash: B256,
    /// Seconds since the unix epoch.
    pub timestamp: u64,
    pub miner: Address,
    pub difficulty: U256,
    pub gas_limit: u64,
    pub gas_used: u64,
    pub size: u64,
    pub extra_data: Bytes,
    pub uncles: Vec<B256>,
    pub transactions: Vec<RawTransaction>,
    /// Logs of the whole block, used when a transaction carries no receipt.
    pub logs: Vec<RawLog>,
}

/// Successful receipt for a transaction the source did not supply one for.
/// Value transfers cost the fixed transfer gas, anything else the full limit.
pub fn derive_receipt(tx: &RawTransaction, block: &RawBlock) -> RawReceipt {
    let gas_used = if tx.is_value_transfer() {
        TRANSFER_GAS
    } else {
        tx.gas_limit
    };

    RawReceipt {
        transaction_hash: tx.hash,
        status: true,
        gas_used,
        effective_gas_price: None,
        contract_address: None,
        logs: block
            .logs
            .iter()
            .filter(|log| log.transaction_hash == tx.hash)
            .cloned()
            .collect(),
    }
}

/// Pull-based supplier of fully materialized blocks.
#[async_trait]
pub trait BlockSource: Send + Sync {
    /// `Ok(None)` when the block is not available yet.
    async fn block(&self, number: u64) -> Result<Option<RawBlock>, SourceError>;

    async fn latest_block_number(&self) -> Result<u64, SourceError>;
}

/// Replays blocks that are already in memory.
#[derive(Default)]
pub struct MemoryBlockSource {
    blocks: RwLock<BTreeMap<u64, RawBlock>>,
}

impl MemoryBlockSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_blocks(blocks: impl IntoIterator<Item = RawBlock>) -> Self {
        let source = Self::new();
        for block in blocks {
            source.push(block);
        }
        source
    }

    pub fn push(&self, block: RawBlock) {
        if let Ok(mut blocks) = self.blocks.write() {
            blocks.insert(block.number, block);
        }
    }
}

#[async_trait]
impl BlockSource for MemoryBlockSource {
    async fn block(&self, number: u64) -> Result<Option<RawBlock>, SourceError> {
        let blocks = self
            .blocks
            .read()
            .map_err(|_| SourceError::Transport("block store lock poisoned".into()))?;
        Ok(blocks.get(&number).cloned())
    }

    async fn latest_block_number(&self) -> Result<u64, SourceError> {
        let blocks = self
            .blocks
            .read()
            .map_err(|_| SourceError::Transport("block store lock poisoned".into()))?;
        Ok(blocks.keys().next_back().copied().unwrap_or_default())
    }
}
