use alloy::primitives::Address;
use async_trait::async_trait;
use db::{EntityKind, IndexedEvent, IndexedTransaction, Query, StorageEngine, StorageEngineExt};
use std::{collections::BTreeMap, sync::Arc};

use super::{transaction::MAX_TOPICS, EventIndexer};
use crate::{
    config::{EventFilter, EventIndexerConfig},
    decode::decode_event,
    error::{IndexError, ValidationError},
    source::RawLog,
};

/// Builds the event for a log emitted by `tx`. Undecodable logs keep their
/// raw topics and data.
pub fn build_event(log: &RawLog, tx: &IndexedTransaction, decode: bool) -> IndexedEvent {
    let (name, decoded) = if decode {
        decode_event(log)
            .map(|(name, fields)| (Some(name), fields))
            .unwrap_or_default()
    } else {
        (None, BTreeMap::new())
    };

    IndexedEvent {
        block_number: tx.block_number,
        block_hash: tx.block_hash,
        transaction_hash: tx.hash,
        transaction_index: tx.transaction_index,
        log_index: log.log_index,
        timestamp: tx.timestamp,
        address: log.address,
        topics: log.topics.clone(),
        data: log.data.clone(),
        name,
        decoded,
        indexed_at: tx.indexed_at,
    }
}

fn matches_filter(filter: &EventFilter, event: &IndexedEvent) -> bool {
    filter
        .contract_address
        .map_or(true, |address| event.address == address)
        && filter
            .topic0
            .map_or(true, |topic| event.topics.first() == Some(&topic))
        && filter
            .event_name
            .as_ref()
            .map_or(true, |name| event.name.as_ref() == Some(name))
}

pub struct StorageEventIndexer {
    config: EventIndexerConfig,
    storage: Arc<dyn StorageEngine>,
}

impl StorageEventIndexer {
    pub fn new(config: EventIndexerConfig, storage: Arc<dyn StorageEngine>) -> Self {
        Self { config, storage }
    }

    fn selected(&self, event: &IndexedEvent) -> bool {
        self.config.index_all_events
            || self
                .config
                .filters
                .iter()
                .any(|filter| filter.enabled && matches_filter(filter, event))
    }
}

#[async_trait]
impl EventIndexer for StorageEventIndexer {
    async fn index_event(
        &self,
        log: &RawLog,
        tx: &IndexedTransaction,
    ) -> Result<Option<IndexedEvent>, IndexError> {
        if !self.config.enabled {
            return Err(IndexError::Disabled("event indexer"));
        }
        if log.topics.len() > MAX_TOPICS {
            return Err(ValidationError::MalformedLog {
                log_index: log.log_index,
                reason: format!("{} topics", log.topics.len()),
            }
            .into());
        }

        let event = build_event(log, tx, self.config.decode_events);
        Ok(self.selected(&event).then_some(event))
    }

    async fn get_events(
        &self,
        filter: &EventFilter,
        limit: usize,
    ) -> Result<Vec<IndexedEvent>, IndexError> {
        let mut query = Query::new(EntityKind::Event);
        if let Some(address) = filter.contract_address {
            query = query.with_contract(address);
        }
        if let Some(topic) = filter.topic0 {
            query = query.with_topic0(topic);
        }
        // names are not an indexed column, so they are filtered after the read
        if filter.event_name.is_none() {
            query = query.limit(limit);
        }

        Ok(self
            .storage
            .query_as::<IndexedEvent>(&query)
            .await?
            .into_iter()
            .filter(|event| matches_filter(filter, event))
            .take(limit)
            .collect())
    }

    async fn get_events_by_contract(
        &self,
        address: Address,
        limit: usize,
    ) -> Result<Vec<IndexedEvent>, IndexError> {
        let query = Query::new(EntityKind::Event)
            .with_contract(address)
            .limit(limit);
        Ok(self.storage.query_as::<IndexedEvent>(&query).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        decode::{event_topic, APPROVAL_EVENT, TRANSFER_EVENT},
        config::TransactionIndexerConfig,
        indexers::{StorageTransactionIndexer, TransactionIndexer},
        source::fixtures,
    };
    use alloy::primitives::{Bytes, B256, U256};
    use db::{IndexedEntity, MemoryStorage};
    use pretty_assertions::assert_eq;

    fn token() -> Address {
        Address::repeat_byte(0x70)
    }

    fn other() -> Address {
        Address::repeat_byte(0x71)
    }

    fn log(address: Address, signature: &str, log_index: u64) -> RawLog {
        RawLog {
            address,
            topics: vec![
                event_topic(signature),
                B256::left_padding_from(Address::repeat_byte(1).as_slice()),
                B256::left_padding_from(Address::repeat_byte(2).as_slice()),
            ],
            data: Bytes::from(U256::from(9u64).to_be_bytes::<32>().to_vec()),
            log_index,
            transaction_hash: fixtures::tx_hash(80, 0),
            transaction_index: 0,
        }
    }

    async fn transaction(storage: Arc<MemoryStorage>) -> IndexedTransaction {
        let block = fixtures::with_transactions(
            fixtures::block(80),
            vec![fixtures::transfer(80, 0, Address::repeat_byte(1), token(), 0)],
        );
        let raw = &block.transactions[0];
        StorageTransactionIndexer::new(TransactionIndexerConfig::default(), true, storage)
            .index_transaction(raw, &raw.receipt_or_derived(&block), &block)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn filters_select_events_unless_indexing_all() {
        let storage = Arc::new(MemoryStorage::new());
        let tx = transaction(storage.clone()).await;
        let config = EventIndexerConfig {
            index_all_events: false,
            filters: vec![
                EventFilter {
                    contract_address: Some(token()),
                    event_name: Some("Transfer".into()),
                    enabled: true,
                    ..Default::default()
                },
                EventFilter {
                    contract_address: Some(other()),
                    enabled: false,
                    ..Default::default()
                },
            ],
            ..Default::default()
        };
        let indexer = StorageEventIndexer::new(config, storage.clone());

        let kept = indexer.index_event(&log(token(), TRANSFER_EVENT, 0), &tx).await.unwrap();
        assert_eq!(kept.unwrap().decoded["value"], "9");
        assert!(indexer
            .index_event(&log(token(), APPROVAL_EVENT, 1), &tx)
            .await
            .unwrap()
            .is_none());
        assert!(indexer
            .index_event(&log(other(), TRANSFER_EVENT, 2), &tx)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn malformed_log_is_rejected() {
        let storage = Arc::new(MemoryStorage::new());
        let tx = transaction(storage.clone()).await;
        let indexer = StorageEventIndexer::new(EventIndexerConfig::default(), storage);
        let mut bad = log(token(), TRANSFER_EVENT, 0);
        bad.topics.extend([B256::ZERO, B256::ZERO]);
        assert!(matches!(
            indexer.index_event(&bad, &tx).await,
            Err(IndexError::Validation(ValidationError::MalformedLog { log_index: 0, .. }))
        ));
    }

    #[tokio::test]
    async fn queries_by_contract_and_name() {
        let storage = Arc::new(MemoryStorage::new());
        let tx = transaction(storage.clone()).await;
        let indexer = StorageEventIndexer::new(EventIndexerConfig::default(), storage.clone());

        for (i, (address, signature)) in [
            (token(), TRANSFER_EVENT),
            (token(), APPROVAL_EVENT),
            (other(), TRANSFER_EVENT),
        ]
        .into_iter()
        .enumerate()
        {
            let event = indexer
                .index_event(&log(address, signature, i as u64), &tx)
                .await
                .unwrap()
                .unwrap();
            storage.store(&event.into_entity()).await.unwrap();
        }

        let by_contract = indexer.get_events_by_contract(token(), 10).await.unwrap();
        assert_eq!(by_contract.len(), 2);
        // newest first within the transaction
        assert_eq!(by_contract[0].log_index, 1);

        let transfers = indexer
            .get_events(
                &EventFilter {
                    event_name: Some("Transfer".into()),
                    ..Default::default()
                },
                10,
            )
            .await
            .unwrap();
        assert_eq!(transfers.len(), 2);
        assert!(transfers.iter().all(|e| e.name.as_deref() == Some("Transfer")));

        let limited = indexer
            .get_events(
                &EventFilter {
                    topic0: Some(event_topic(TRANSFER_EVENT)),
                    ..Default::default()
                },
                1,
            )
            .await
            .unwrap();
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].address, other());
    }
}
