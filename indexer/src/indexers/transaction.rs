use alloy::primitives::{Address, B256};
use async_trait::async_trait;
use chrono::Utc;
use db::{
    unix_to_utc, EntityKey, EntityKind, IndexedTransaction, Query, StorageEngine, StorageEngineExt,
    TxStatus,
};
use std::sync::Arc;

use super::{event::build_event, TransactionIndexer};
use crate::{
    config::TransactionIndexerConfig,
    decode::{decode_method, token_transfer},
    error::{IndexError, ValidationError},
    source::{RawBlock, RawReceipt, RawTransaction},
};

/// Topics a log may carry: the signature plus three indexed parameters.
pub(crate) const MAX_TOPICS: usize = 4;

pub struct StorageTransactionIndexer {
    config: TransactionIndexerConfig,
    decode_events: bool,
    storage: Arc<dyn StorageEngine>,
}

impl StorageTransactionIndexer {
    pub fn new(
        config: TransactionIndexerConfig,
        decode_events: bool,
        storage: Arc<dyn StorageEngine>,
    ) -> Self {
        Self {
            config,
            decode_events,
            storage,
        }
    }
}

fn validate(tx: &RawTransaction, receipt: &RawReceipt) -> Result<(), ValidationError> {
    if tx.hash.is_zero() {
        return Err(ValidationError::ZeroHash(EntityKind::Transaction));
    }
    if receipt.transaction_hash != tx.hash {
        return Err(ValidationError::ReceiptMismatch {
            transaction: tx.hash,
            receipt: receipt.transaction_hash,
        });
    }
    if receipt.gas_used > tx.gas_limit {
        return Err(ValidationError::GasUsedAboveLimit {
            kind: EntityKind::Transaction,
            gas_used: receipt.gas_used,
            gas_limit: tx.gas_limit,
        });
    }
    if receipt.contract_address.is_some() && tx.to.is_some() {
        return Err(ValidationError::CreationWithRecipient(tx.hash));
    }
    if let Some(log) = receipt.logs.iter().find(|log| log.topics.len() > MAX_TOPICS) {
        return Err(ValidationError::MalformedLog {
            log_index: log.log_index,
            reason: format!("{} topics", log.topics.len()),
        });
    }
    Ok(())
}

#[async_trait]
impl TransactionIndexer for StorageTransactionIndexer {
    async fn index_transaction(
        &self,
        tx: &RawTransaction,
        receipt: &RawReceipt,
        block: &RawBlock,
    ) -> Result<IndexedTransaction, IndexError> {
        if !self.config.enabled {
            return Err(IndexError::Disabled("transaction indexer"));
        }
        validate(tx, receipt)?;

        let method = if self.config.index_method_calls {
            decode_method(&tx.input)
        } else {
            None
        };
        let token_transfers = if self.config.index_token_transfers {
            receipt.logs.iter().filter_map(token_transfer).collect()
        } else {
            Vec::new()
        };

        let mut indexed = IndexedTransaction {
            hash: tx.hash,
            block_number: block.number,
            block_hash: block.hash,
            transaction_index: tx.transaction_index,
            timestamp: unix_to_utc(block.timestamp),
            from: tx.from,
            to: tx.to,
            value: tx.value,
            gas_limit: tx.gas_limit,
            gas_price: receipt.effective_gas_price.unwrap_or(tx.gas_price),
            gas_used: receipt.gas_used,
            status: if receipt.status {
                TxStatus::Success
            } else {
                TxStatus::Failed
            },
            nonce: tx.nonce,
            input: tx.input.clone(),
            method,
            contract_created: receipt.contract_address,
            token_transfers,
            events: Vec::new(),
            indexed_at: Utc::now(),
        };
        indexed.events = receipt
            .logs
            .iter()
            .map(|log| build_event(log, &indexed, self.decode_events))
            .collect();

        Ok(indexed)
    }

    async fn get_transaction(&self, hash: B256) -> Result<IndexedTransaction, IndexError> {
        Ok(self
            .storage
            .retrieve_as::<IndexedTransaction>(&EntityKey::Transaction(hash))
            .await?)
    }

    async fn get_transactions_by_address(
        &self,
        address: Address,
        limit: usize,
    ) -> Result<Vec<IndexedTransaction>, IndexError> {
        let query = Query::new(EntityKind::Transaction)
            .with_address(address)
            .limit(limit);
        Ok(self.storage.query_as::<IndexedTransaction>(&query).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        decode::{event_topic, selector, TRANSFER_EVENT},
        source::{fixtures, RawLog},
    };
    use alloy::primitives::{Bytes, U256};
    use db::{IndexedEntity, MemoryStorage, TokenStandard};
    use pretty_assertions::assert_eq;

    fn indexer() -> (StorageTransactionIndexer, Arc<MemoryStorage>) {
        let storage = Arc::new(MemoryStorage::new());
        (
            StorageTransactionIndexer::new(TransactionIndexerConfig::default(), true, storage.clone()),
            storage,
        )
    }

    fn address_topic(address: Address) -> B256 {
        B256::left_padding_from(address.as_slice())
    }

    #[tokio::test]
    async fn plain_transfer_with_derived_receipt() {
        let (indexer, _) = indexer();
        let a = Address::repeat_byte(0xa);
        let b = Address::repeat_byte(0xb);
        let block = fixtures::with_transactions(
            fixtures::block(50),
            vec![fixtures::transfer(50, 0, a, b, 1_000)],
        );
        let raw = &block.transactions[0];

        let tx = indexer
            .index_transaction(raw, &raw.receipt_or_derived(&block), &block)
            .await
            .unwrap();

        assert_eq!(tx.block_number, 50);
        assert_eq!(tx.block_hash, block.hash);
        assert_eq!(tx.status, TxStatus::Success);
        assert_eq!(tx.gas_used, 21_000);
        assert_eq!(tx.method, None);
        assert_eq!(tx.touched_addresses(), vec![a, b]);
    }

    #[tokio::test]
    async fn token_call_is_decoded_with_transfers() {
        let (indexer, _) = indexer();
        let sender = Address::repeat_byte(0xa);
        let recipient = Address::repeat_byte(0xb);
        let token = Address::repeat_byte(0x70);

        let mut raw = fixtures::transfer(60, 0, sender, token, 0);
        let mut input = selector("transfer(address,uint256)").to_vec();
        input.extend_from_slice(address_topic(recipient).as_slice());
        input.extend_from_slice(&U256::from(250u64).to_be_bytes::<32>());
        raw.input = Bytes::from(input);

        let mut block = fixtures::with_transactions(fixtures::block(60), vec![raw.clone()]);
        block.logs.push(RawLog {
            address: token,
            topics: vec![
                event_topic(TRANSFER_EVENT),
                address_topic(sender),
                address_topic(recipient),
            ],
            data: Bytes::from(U256::from(250u64).to_be_bytes::<32>().to_vec()),
            log_index: 0,
            transaction_hash: raw.hash,
            transaction_index: 0,
        });

        let tx = indexer
            .index_transaction(&raw, &raw.receipt_or_derived(&block), &block)
            .await
            .unwrap();

        assert_eq!(tx.method.as_ref().and_then(|m| m.name.as_deref()), Some("transfer"));
        assert_eq!(tx.token_transfers.len(), 1);
        assert_eq!(tx.token_transfers[0].standard, TokenStandard::Erc20);
        assert_eq!(tx.token_transfers[0].to, recipient);
        assert_eq!(tx.events.len(), 1);
        assert_eq!(tx.events[0].name.as_deref(), Some("Transfer"));
    }

    #[tokio::test]
    async fn rejects_inconsistent_receipts() {
        let (indexer, _) = indexer();
        let block = fixtures::block(70);
        let raw = fixtures::transfer(70, 0, Address::repeat_byte(1), Address::repeat_byte(2), 1);

        let mut receipt = raw.receipt_or_derived(&block);
        receipt.contract_address = Some(Address::repeat_byte(3));
        assert!(matches!(
            indexer.index_transaction(&raw, &receipt, &block).await,
            Err(IndexError::Validation(ValidationError::CreationWithRecipient(_)))
        ));

        let mut receipt = raw.receipt_or_derived(&block);
        receipt.gas_used = raw.gas_limit + 1;
        assert!(matches!(
            indexer.index_transaction(&raw, &receipt, &block).await,
            Err(IndexError::Validation(ValidationError::GasUsedAboveLimit { .. }))
        ));

        let mut receipt = raw.receipt_or_derived(&block);
        receipt.transaction_hash = B256::repeat_byte(0x42);
        assert!(matches!(
            indexer.index_transaction(&raw, &receipt, &block).await,
            Err(IndexError::Validation(ValidationError::ReceiptMismatch { .. }))
        ));
    }

    #[tokio::test]
    async fn transactions_by_address_newest_first() {
        let (indexer, storage) = indexer();
        let a = Address::repeat_byte(0xa);
        let b = Address::repeat_byte(0xb);
        for number in 1..=3 {
            let block = fixtures::with_transactions(
                fixtures::block(number),
                vec![fixtures::transfer(number, 0, a, b, number)],
            );
            let raw = &block.transactions[0];
            let tx = indexer
                .index_transaction(raw, &raw.receipt_or_derived(&block), &block)
                .await
                .unwrap();
            storage.store(&tx.into_entity()).await.unwrap();
        }

        let found = indexer.get_transactions_by_address(b, 2).await.unwrap();
        let numbers: Vec<u64> = found.iter().map(|tx| tx.block_number).collect();
        assert_eq!(numbers, vec![3, 2]);
        assert!(indexer
            .get_transactions_by_address(Address::repeat_byte(0xc), 10)
            .await
            .unwrap()
            .is_empty());
    }
}
