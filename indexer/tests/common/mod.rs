#![allow(dead_code)]

use alloy::primitives::{Address, Bytes, B256, U256};
use async_trait::async_trait;
use db::{
    Entity, EntityKey, EvictionPolicy, MemoryCache, MemoryStorage, Query, StorageEngine,
    StorageError,
};
use indexer::{
    Indexer, IndexerConfig, MemoryBlockSource, RawBlock, RawLog, RawReceipt, RawTransaction,
};
use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
};

pub fn block_hash(number: u64) -> B256 {
    B256::left_padding_from(&(number + 1).to_be_bytes())
}

pub fn tx_hash(number: u64, index: u64) -> B256 {
    let mut bytes = [0u8; 32];
    bytes[0] = 0xee;
    bytes[8..16].copy_from_slice(&number.to_be_bytes());
    bytes[24..32].copy_from_slice(&index.to_be_bytes());
    B256::from(bytes)
}

pub fn block(number: u64) -> RawBlock {
    RawBlock {
        number,
        hash: block_hash(number),
        parent_hash: block_hash(number.saturating_sub(1)),
        timestamp: 1_700_000_000 + number * 12,
        miner: Address::repeat_byte(0xcb),
        difficulty: U256::ZERO,
        gas_limit: 30_000_000,
        gas_used: 0,
        size: 540,
        extra_data: Bytes::new(),
        uncles: Vec::new(),
        transactions: Vec::new(),
        logs: Vec::new(),
    }
}

/// Linked blocks `first..=last`.
pub fn chain(first: u64, last: u64) -> Vec<RawBlock> {
    (first..=last).map(block).collect()
}

pub fn transfer(number: u64, index: u64, from: Address, to: Address, value: u64) -> RawTransaction {
    RawTransaction {
        hash: tx_hash(number, index),
        transaction_index: index,
        nonce: index,
        from,
        to: Some(to),
        value: U256::from(value),
        gas_limit: 50_000,
        gas_price: 10,
        input: Bytes::new(),
        receipt: None,
    }
}

pub fn receipt(tx: &RawTransaction, gas_used: u64, logs: Vec<RawLog>) -> RawReceipt {
    RawReceipt {
        transaction_hash: tx.hash,
        status: true,
        gas_used,
        effective_gas_price: None,
        contract_address: None,
        logs,
    }
}

pub fn with_transactions(mut block: RawBlock, txs: Vec<RawTransaction>) -> RawBlock {
    block.gas_used = txs
        .iter()
        .map(|tx| tx.receipt.as_ref().map_or(21_000, |r| r.gas_used))
        .sum();
    block.transactions = txs;
    block
}

pub fn config(start_block: u64, batch_size: u64) -> IndexerConfig {
    IndexerConfig {
        start_block,
        batch_size,
        indexing_interval_ms: 1_000,
        ..Default::default()
    }
}

pub struct Harness {
    pub indexer: Indexer,
    pub source: Arc<MemoryBlockSource>,
    pub storage: Arc<FailingStorage>,
    pub cache: Arc<MemoryCache>,
}

pub fn harness(config: IndexerConfig, blocks: Vec<RawBlock>) -> Harness {
    let source = Arc::new(MemoryBlockSource::from_blocks(blocks));
    let storage = Arc::new(FailingStorage::new());
    let cache = Arc::new(MemoryCache::new(1_000, EvictionPolicy::Lru));
    let indexer = Indexer::new(config, source.clone(), storage.clone(), cache.clone())
        .expect("valid config");
    Harness {
        indexer,
        source,
        storage,
        cache,
    }
}

/// In-memory storage that rejects writes, or reads, of selected keys.
#[derive(Default)]
pub struct FailingStorage {
    inner: MemoryStorage,
    failing: Mutex<HashSet<EntityKey>>,
    unreadable: Mutex<HashSet<EntityKey>>,
}

impl FailingStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_on(&self, key: EntityKey) {
        self.failing.lock().unwrap().insert(key);
    }

    pub fn fail_reads_on(&self, key: EntityKey) {
        self.unreadable.lock().unwrap().insert(key);
    }

    pub fn heal(&self) {
        self.failing.lock().unwrap().clear();
        self.unreadable.lock().unwrap().clear();
    }
}

#[async_trait]
impl StorageEngine for FailingStorage {
    async fn store(&self, entity: &Entity) -> Result<(), StorageError> {
        if self.failing.lock().unwrap().contains(&entity.key()) {
            return Err(StorageError::BackendUnavailable("injected failure".into()));
        }
        self.inner.store(entity).await
    }

    async fn retrieve(&self, key: &EntityKey) -> Result<Entity, StorageError> {
        if self.unreadable.lock().unwrap().contains(key) {
            return Err(StorageError::BackendUnavailable("injected read failure".into()));
        }
        self.inner.retrieve(key).await
    }

    async fn query(&self, query: &Query) -> Result<Vec<Entity>, StorageError> {
        self.inner.query(query).await
    }

    async fn delete(&self, key: &EntityKey) -> Result<(), StorageError> {
        self.inner.delete(key).await
    }

    async fn size_bytes(&self) -> Result<u64, StorageError> {
        self.inner.size_bytes().await
    }

    fn backend(&self) -> &'static str {
        "failing-memory"
    }
}
