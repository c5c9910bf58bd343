pub mod memory;
pub mod postgres;

use alloy::primitives::{Address, B256};
use async_trait::async_trait;
use std::cmp::Ordering;

use crate::{
    entities::{Entity, EntityKey, EntityKind, IndexColumns, IndexedEntity},
    error::StorageError,
    types::TimeRange,
};

pub use memory::MemoryStorage;
pub use postgres::PostgresStorage;

/// Durable, authoritative home of indexed entities.
///
/// Implementations synchronize internally and are shared between the
/// entity indexers and both orchestrator loops.
#[async_trait]
pub trait StorageEngine: Send + Sync {
    /// Inserts or replaces the entity under its natural key.
    async fn store(&self, entity: &Entity) -> Result<(), StorageError>;

    async fn retrieve(&self, key: &EntityKey) -> Result<Entity, StorageError>;

    async fn exists(&self, key: &EntityKey) -> Result<bool, StorageError> {
        match self.retrieve(key).await {
            Ok(_) => Ok(true),
            Err(StorageError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn query(&self, query: &Query) -> Result<Vec<Entity>, StorageError>;

    /// Deleting a missing key is not an error.
    async fn delete(&self, key: &EntityKey) -> Result<(), StorageError>;

    /// Approximate bytes used by stored entities.
    async fn size_bytes(&self) -> Result<u64, StorageError>;

    fn backend(&self) -> &'static str;
}

#[async_trait]
pub trait StorageEngineExt: StorageEngine {
    async fn retrieve_as<T: IndexedEntity>(&self, key: &EntityKey) -> Result<T, StorageError> {
        let entity = self.retrieve(key).await?;
        let found = entity.kind();
        T::from_entity(entity).ok_or(StorageError::KindMismatch {
            expected: T::KIND,
            found,
        })
    }

    async fn query_as<T: IndexedEntity>(&self, query: &Query) -> Result<Vec<T>, StorageError> {
        Ok(self
            .query(query)
            .await?
            .into_iter()
            .filter_map(T::from_entity)
            .collect())
    }
}

impl<S: StorageEngine + ?Sized> StorageEngineExt for S {}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SortOrder {
    Ascending,
    #[default]
    Descending,
}

/// Backend-agnostic filter over one entity kind. All set fields must match.
#[derive(Clone, Debug, PartialEq)]
pub struct Query {
    pub kind: EntityKind,
    pub block_hash: Option<B256>,
    /// Matches either the sender or the recipient column.
    pub address: Option<Address>,
    pub contract: Option<Address>,
    pub topic0: Option<B256>,
    pub time_range: Option<TimeRange>,
    pub order: SortOrder,
    pub limit: Option<usize>,
}

impl Query {
    pub fn new(kind: EntityKind) -> Self {
        Self {
            kind,
            block_hash: None,
            address: None,
            contract: None,
            topic0: None,
            time_range: None,
            order: SortOrder::default(),
            limit: None,
        }
    }

    pub fn with_block_hash(mut self, hash: B256) -> Self {
        self.block_hash = Some(hash);
        self
    }

    pub fn with_address(mut self, address: Address) -> Self {
        self.address = Some(address);
        self
    }

    pub fn with_contract(mut self, contract: Address) -> Self {
        self.contract = Some(contract);
        self
    }

    pub fn with_topic0(mut self, topic: B256) -> Self {
        self.topic0 = Some(topic);
        self
    }

    pub fn within(mut self, range: TimeRange) -> Self {
        self.time_range = Some(range);
        self
    }

    pub fn ascending(mut self) -> Self {
        self.order = SortOrder::Ascending;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, kind: EntityKind, columns: &IndexColumns) -> bool {
        if kind != self.kind {
            return false;
        }
        if let Some(hash) = self.block_hash {
            if columns.block_hash != Some(hash) {
                return false;
            }
        }
        if let Some(address) = self.address {
            if columns.from_address != Some(address) && columns.to_address != Some(address) {
                return false;
            }
        }
        if let Some(contract) = self.contract {
            if columns.contract_address != Some(contract) {
                return false;
            }
        }
        if let Some(topic) = self.topic0 {
            if columns.topic0 != Some(topic) {
                return false;
            }
        }
        if let Some(range) = self.time_range {
            match columns.timestamp {
                Some(ts) if range.contains(&ts) => {}
                _ => return false,
            }
        }
        true
    }

    /// Ordering by (block number, position, key) in the requested direction.
    pub fn compare(&self, a: (&IndexColumns, &str), b: (&IndexColumns, &str)) -> Ordering {
        let ord = a
            .0
            .block_number
            .cmp(&b.0.block_number)
            .then(a.0.position.cmp(&b.0.position))
            .then(a.1.cmp(b.1));
        match self.order {
            SortOrder::Ascending => ord,
            SortOrder::Descending => ord.reverse(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::unix_to_utc;

    #[test]
    fn address_matches_either_side() {
        let a = Address::repeat_byte(1);
        let b = Address::repeat_byte(2);
        let columns = IndexColumns {
            from_address: Some(a),
            to_address: Some(b),
            ..Default::default()
        };
        let q = Query::new(EntityKind::Transaction);
        assert!(q.clone().with_address(a).matches(EntityKind::Transaction, &columns));
        assert!(q.clone().with_address(b).matches(EntityKind::Transaction, &columns));
        assert!(!q
            .clone()
            .with_address(Address::repeat_byte(3))
            .matches(EntityKind::Transaction, &columns));
        assert!(!q.with_address(a).matches(EntityKind::Block, &columns));
    }

    #[test]
    fn time_range_requires_timestamp() {
        let range = TimeRange::new(unix_to_utc(10), unix_to_utc(20));
        let q = Query::new(EntityKind::Block).within(range);
        assert!(!q.matches(EntityKind::Block, &IndexColumns::default()));
        let columns = IndexColumns {
            timestamp: Some(unix_to_utc(15)),
            ..Default::default()
        };
        assert!(q.matches(EntityKind::Block, &columns));
    }
}
