use async_trait::async_trait;
use std::{
    collections::HashMap,
    sync::{RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use super::{Query, StorageEngine};
use crate::{
    entities::{Entity, EntityKey, EntityKind, IndexColumns},
    error::StorageError,
};

struct StoredEntity {
    entity: Entity,
    columns: IndexColumns,
    payload_len: u64,
}

/// Process-local storage backend. Useful for tests and short-lived replays;
/// nothing survives a restart.
#[derive(Default)]
pub struct MemoryStorage {
    rows: RwLock<HashMap<(EntityKind, String), StoredEntity>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.read().map(|rows| rows.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(
        &self,
    ) -> Result<RwLockReadGuard<'_, HashMap<(EntityKind, String), StoredEntity>>, StorageError>
    {
        self.rows
            .read()
            .map_err(|_| StorageError::BackendUnavailable("memory storage lock poisoned".into()))
    }

    fn write(
        &self,
    ) -> Result<RwLockWriteGuard<'_, HashMap<(EntityKind, String), StoredEntity>>, StorageError>
    {
        self.rows
            .write()
            .map_err(|_| StorageError::BackendUnavailable("memory storage lock poisoned".into()))
    }
}

#[async_trait]
impl StorageEngine for MemoryStorage {
    async fn store(&self, entity: &Entity) -> Result<(), StorageError> {
        let key = entity.key();
        let payload_len = serde_json::to_vec(&entity.payload()?)?.len() as u64;
        let row = StoredEntity {
            entity: entity.clone(),
            columns: entity.columns(),
            payload_len,
        };
        self.write()?.insert((key.kind(), key.id()), row);
        Ok(())
    }

    async fn retrieve(&self, key: &EntityKey) -> Result<Entity, StorageError> {
        self.read()?
            .get(&(key.kind(), key.id()))
            .map(|row| row.entity.clone())
            .ok_or_else(|| StorageError::NotFound(key.clone()))
    }

    async fn exists(&self, key: &EntityKey) -> Result<bool, StorageError> {
        Ok(self.read()?.contains_key(&(key.kind(), key.id())))
    }

    async fn query(&self, query: &Query) -> Result<Vec<Entity>, StorageError> {
        let rows = self.read()?;
        let mut matched: Vec<(&String, &StoredEntity)> = rows
            .iter()
            .filter(|((kind, _), row)| query.matches(*kind, &row.columns))
            .map(|((_, id), row)| (id, row))
            .collect();

        matched.sort_by(|(id_a, a), (id_b, b)| {
            query.compare((&a.columns, id_a.as_str()), (&b.columns, id_b.as_str()))
        });

        let limit = query.limit.unwrap_or(usize::MAX);
        Ok(matched
            .into_iter()
            .take(limit)
            .map(|(_, row)| row.entity.clone())
            .collect())
    }

    async fn delete(&self, key: &EntityKey) -> Result<(), StorageError> {
        self.write()?.remove(&(key.kind(), key.id()));
        Ok(())
    }

    async fn size_bytes(&self) -> Result<u64, StorageError> {
        Ok(self.read()?.values().map(|row| row.payload_len).sum())
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        entities::{Checkpoint, IndexedEntity, IndexedEvent},
        storage::StorageEngineExt,
        types::unix_to_utc,
    };
    use alloy::primitives::{Address, Bytes, B256};
    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap;

    fn event(block_number: u64, log_index: u64, contract: Address) -> IndexedEvent {
        IndexedEvent {
            block_number,
            block_hash: B256::repeat_byte(block_number as u8),
            transaction_hash: B256::repeat_byte(0x42),
            transaction_index: 0,
            log_index,
            timestamp: unix_to_utc(1_700_000_000 + block_number),
            address: contract,
            topics: vec![B256::repeat_byte(0xdd)],
            data: Bytes::new(),
            name: None,
            decoded: BTreeMap::new(),
            indexed_at: unix_to_utc(1_700_000_000),
        }
    }

    #[tokio::test]
    async fn store_retrieve_delete() {
        let storage = MemoryStorage::new();
        let checkpoint = Checkpoint {
            id: "ingestion".into(),
            block_number: 10,
            block_hash: B256::repeat_byte(1),
            updated_at: unix_to_utc(1_700_000_000),
        };
        let key = EntityKey::Checkpoint("ingestion".into());

        storage.store(&checkpoint.clone().into()).await.unwrap();
        let back: Checkpoint = storage.retrieve_as(&key).await.unwrap();
        assert_eq!(back, checkpoint);
        assert!(storage.size_bytes().await.unwrap() > 0);

        storage.delete(&key).await.unwrap();
        assert!(storage.retrieve(&key).await.unwrap_err().is_not_found());
        storage.delete(&key).await.unwrap();
    }

    #[tokio::test]
    async fn store_replaces_same_key() {
        let storage = MemoryStorage::new();
        let contract = Address::repeat_byte(5);
        let mut e = event(3, 0, contract);
        storage.store(&e.clone().into()).await.unwrap();
        e.name = Some("Transfer".into());
        storage.store(&e.clone().into()).await.unwrap();
        assert_eq!(storage.len(), 1);
    }

    #[tokio::test]
    async fn query_orders_newest_first_and_limits() {
        let storage = MemoryStorage::new();
        let contract = Address::repeat_byte(5);
        for (block, log) in [(1, 0), (2, 1), (2, 0), (3, 0)] {
            storage.store(&event(block, log, contract).into()).await.unwrap();
        }
        storage
            .store(&event(4, 0, Address::repeat_byte(6)).into())
            .await
            .unwrap();

        let query = Query::new(EntityKind::Event).with_contract(contract).limit(3);
        let found: Vec<IndexedEvent> = storage.query_as(&query).await.unwrap();
        let positions: Vec<(u64, u64)> = found.iter().map(|e| (e.block_number, e.log_index)).collect();
        assert_eq!(positions, vec![(3, 0), (2, 1), (2, 0)]);

        let found: Vec<IndexedEvent> = storage
            .query_as(&Query::new(EntityKind::Event).with_contract(contract).ascending())
            .await
            .unwrap();
        assert_eq!(found.first().map(|e| e.block_number), Some(1));
    }

    #[tokio::test]
    async fn retrieve_as_wrong_kind_fails() {
        let storage = MemoryStorage::new();
        let e = event(1, 0, Address::ZERO);
        let key = e.key();
        storage.store(&e.into()).await.unwrap();
        let err = storage.retrieve_as::<Checkpoint>(&key).await.unwrap_err();
        assert!(matches!(err, StorageError::KindMismatch { .. }));
    }
}
