use alloy::primitives::B256;
use async_trait::async_trait;
use chrono::Utc;
use db::{unix_to_utc, EntityKey, EntityKind, IndexedBlock, Query, StorageEngine, StorageEngineExt};
use std::sync::Arc;
use tracing::debug;

use super::BlockIndexer;
use crate::{
    config::BlockIndexerConfig,
    error::{IndexError, ValidationError},
    source::RawBlock,
};

pub struct StorageBlockIndexer {
    config: BlockIndexerConfig,
    storage: Arc<dyn StorageEngine>,
}

impl StorageBlockIndexer {
    pub fn new(config: BlockIndexerConfig, storage: Arc<dyn StorageEngine>) -> Self {
        Self { config, storage }
    }
}

fn validate(block: &RawBlock) -> Result<(), ValidationError> {
    if block.hash.is_zero() {
        return Err(ValidationError::ZeroHash(EntityKind::Block));
    }
    if block.gas_used > block.gas_limit {
        return Err(ValidationError::GasUsedAboveLimit {
            kind: EntityKind::Block,
            gas_used: block.gas_used,
            gas_limit: block.gas_limit,
        });
    }
    Ok(())
}

#[async_trait]
impl BlockIndexer for StorageBlockIndexer {
    async fn index_block(&self, block: &RawBlock) -> Result<IndexedBlock, IndexError> {
        if !self.config.enabled {
            return Err(IndexError::Disabled("block indexer"));
        }
        validate(block)?;

        let uncles = if self.config.index_uncles {
            block.uncles.clone()
        } else {
            Vec::new()
        };
        debug!(number = block.number, uncles = uncles.len(), "indexed block header");

        Ok(IndexedBlock {
            number: block.number,
            hash: block.hash,
            parent_hash: block.parent_hash,
            timestamp: unix_to_utc(block.timestamp),
            miner: block.miner,
            difficulty: block.difficulty,
            gas_limit: block.gas_limit,
            gas_used: block.gas_used,
            transaction_count: block.transactions.len(),
            size: block.size,
            extra_data: block.extra_data.clone(),
            uncles,
            indexed_at: Utc::now(),
        })
    }

    async fn get_block(&self, number: u64) -> Result<IndexedBlock, IndexError> {
        Ok(self
            .storage
            .retrieve_as::<IndexedBlock>(&EntityKey::Block(number))
            .await?)
    }

    async fn get_block_by_hash(&self, hash: B256) -> Result<IndexedBlock, IndexError> {
        let query = Query::new(EntityKind::Block).with_block_hash(hash).limit(1);
        self.storage
            .query_as::<IndexedBlock>(&query)
            .await?
            .into_iter()
            .next()
            .ok_or(IndexError::UnknownBlockHash(hash))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::fixtures;
    use db::{IndexedEntity, MemoryStorage};
    use pretty_assertions::assert_eq;

    fn indexer(config: BlockIndexerConfig) -> (StorageBlockIndexer, Arc<MemoryStorage>) {
        let storage = Arc::new(MemoryStorage::new());
        (StorageBlockIndexer::new(config, storage.clone()), storage)
    }

    #[tokio::test]
    async fn reindexing_is_equal_except_indexed_at() {
        let (indexer, _) = indexer(BlockIndexerConfig::default());
        let raw = fixtures::block(100);
        let first = indexer.index_block(&raw).await.unwrap();
        let mut second = indexer.index_block(&raw).await.unwrap();
        second.indexed_at = first.indexed_at;
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn uncles_only_when_configured() {
        let mut raw = fixtures::block(5);
        raw.uncles = vec![B256::repeat_byte(0x55)];

        let (plain, _) = indexer(BlockIndexerConfig::default());
        assert!(plain.index_block(&raw).await.unwrap().uncles.is_empty());

        let (with_uncles, _) = indexer(BlockIndexerConfig {
            index_uncles: true,
            ..Default::default()
        });
        assert_eq!(with_uncles.index_block(&raw).await.unwrap().uncles.len(), 1);
    }

    #[tokio::test]
    async fn rejects_malformed_headers() {
        let (indexer, _) = indexer(BlockIndexerConfig::default());

        let mut raw = fixtures::block(5);
        raw.gas_used = raw.gas_limit + 1;
        assert!(matches!(
            indexer.index_block(&raw).await,
            Err(IndexError::Validation(ValidationError::GasUsedAboveLimit { .. }))
        ));

        let mut raw = fixtures::block(5);
        raw.hash = B256::ZERO;
        assert!(matches!(
            indexer.index_block(&raw).await,
            Err(IndexError::Validation(ValidationError::ZeroHash(EntityKind::Block)))
        ));
    }

    #[tokio::test]
    async fn lookups_hit_storage() {
        let (indexer, storage) = indexer(BlockIndexerConfig::default());
        let block = indexer.index_block(&fixtures::block(9)).await.unwrap();
        storage.store(&block.clone().into_entity()).await.unwrap();

        assert_eq!(indexer.get_block(9).await.unwrap(), block);
        assert_eq!(indexer.get_block_by_hash(block.hash).await.unwrap(), block);
        assert!(matches!(
            indexer.get_block(10).await,
            Err(IndexError::NotFound(EntityKey::Block(10)))
        ));
        assert!(matches!(
            indexer.get_block_by_hash(B256::repeat_byte(1)).await,
            Err(IndexError::UnknownBlockHash(_))
        ));
    }
}
