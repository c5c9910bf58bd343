//! Entity indexers turn one raw chain object into one indexed entity and read
//! entities of their kind back from storage. They never write: persisting and
//! caching is left to the orchestrator so that every write has one outcome.

mod address;
mod block;
mod contract;
mod event;
mod transaction;

use alloy::primitives::{Address, B256, U256};
use async_trait::async_trait;
use db::{
    ContractKind, IndexedAddress, IndexedBlock, IndexedContract, IndexedEvent, IndexedTransaction,
    StorageEngine,
};
use std::sync::Arc;

use crate::{
    config::{EventFilter, IndexerConfig},
    error::IndexError,
    source::{RawBlock, RawLog, RawReceipt, RawTransaction},
};

pub use address::StorageAddressIndexer;
pub use block::StorageBlockIndexer;
pub use contract::StorageContractIndexer;
pub use event::{build_event, StorageEventIndexer};
pub use transaction::StorageTransactionIndexer;

#[async_trait]
pub trait BlockIndexer: Send + Sync {
    async fn index_block(&self, block: &RawBlock) -> Result<IndexedBlock, IndexError>;

    async fn get_block(&self, number: u64) -> Result<IndexedBlock, IndexError>;

    async fn get_block_by_hash(&self, hash: B256) -> Result<IndexedBlock, IndexError>;
}

#[async_trait]
pub trait TransactionIndexer: Send + Sync {
    async fn index_transaction(
        &self,
        tx: &RawTransaction,
        receipt: &RawReceipt,
        block: &RawBlock,
    ) -> Result<IndexedTransaction, IndexError>;

    async fn get_transaction(&self, hash: B256) -> Result<IndexedTransaction, IndexError>;

    /// Newest first.
    async fn get_transactions_by_address(
        &self,
        address: Address,
        limit: usize,
    ) -> Result<Vec<IndexedTransaction>, IndexError>;
}

/// A transaction touching an address, plus what is known about the address
/// as a contract.
#[derive(Clone, Copy, Debug)]
pub struct AddressActivity<'a> {
    pub transaction: &'a IndexedTransaction,
    pub contract_kind: Option<ContractKind>,
}

#[async_trait]
pub trait AddressIndexer: Send + Sync {
    /// Upserts the address, applying `activity` on top of what is stored.
    async fn index_address(
        &self,
        address: Address,
        activity: Option<AddressActivity<'_>>,
    ) -> Result<IndexedAddress, IndexError>;

    async fn update_balance(
        &self,
        address: Address,
        balance: U256,
    ) -> Result<IndexedAddress, IndexError>;

    async fn get_address(&self, address: Address) -> Result<IndexedAddress, IndexError>;
}

#[async_trait]
pub trait ContractIndexer: Send + Sync {
    /// `None` when the transaction created no contract or the contract type
    /// is not indexed.
    async fn index_contract(
        &self,
        tx: &IndexedTransaction,
    ) -> Result<Option<IndexedContract>, IndexError>;

    /// `None` when the recipient is not an indexed contract or this
    /// transaction was already counted.
    async fn record_interaction(
        &self,
        tx: &IndexedTransaction,
    ) -> Result<Option<IndexedContract>, IndexError>;

    async fn verify_contract(
        &self,
        address: Address,
        source_code: &str,
    ) -> Result<IndexedContract, IndexError>;

    async fn get_contract(&self, address: Address) -> Result<IndexedContract, IndexError>;
}

#[async_trait]
pub trait EventIndexer: Send + Sync {
    /// `None` when no configured filter selects the log.
    async fn index_event(
        &self,
        log: &RawLog,
        tx: &IndexedTransaction,
    ) -> Result<Option<IndexedEvent>, IndexError>;

    async fn get_events(
        &self,
        filter: &EventFilter,
        limit: usize,
    ) -> Result<Vec<IndexedEvent>, IndexError>;

    async fn get_events_by_contract(
        &self,
        address: Address,
        limit: usize,
    ) -> Result<Vec<IndexedEvent>, IndexError>;
}

/// The five indexers the orchestrator drives.
#[derive(Clone)]
pub struct EntityIndexers {
    pub blocks: Arc<dyn BlockIndexer>,
    pub transactions: Arc<dyn TransactionIndexer>,
    pub addresses: Arc<dyn AddressIndexer>,
    pub contracts: Arc<dyn ContractIndexer>,
    pub events: Arc<dyn EventIndexer>,
}

impl EntityIndexers {
    pub fn new(config: &IndexerConfig, storage: Arc<dyn StorageEngine>) -> Self {
        Self {
            blocks: Arc::new(StorageBlockIndexer::new(config.block.clone(), storage.clone())),
            transactions: Arc::new(StorageTransactionIndexer::new(
                config.transaction.clone(),
                config.event.decode_events,
                storage.clone(),
            )),
            addresses: Arc::new(StorageAddressIndexer::new(config.address.clone(), storage.clone())),
            contracts: Arc::new(StorageContractIndexer::new(config.contract.clone(), storage.clone())),
            events: Arc::new(StorageEventIndexer::new(config.event.clone(), storage)),
        }
    }
}
