use redis::RedisError;
use serde_json::Error as SerdeError;
use thiserror::Error;

use crate::entities::{EntityKey, EntityKind};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("entity not found: {0}")]
    NotFound(EntityKey),

    #[error("expected {expected} entity, found {found}")]
    KindMismatch {
        expected: EntityKind,
        found: EntityKind,
    },

    #[error("storage backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Serialization Error: {0}")]
    Serialization(#[from] SerdeError),

    #[error("Database Error: {0}")]
    Database(#[from] diesel::result::Error),

    #[error("Connection Pool Error: {0}")]
    Pool(String),

    #[error("Migration Error: {0}")]
    Migration(String),
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound(_))
    }

    /// Whether the same call may succeed later without any change of input.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            StorageError::BackendUnavailable(_) | StorageError::Pool(_) | StorageError::Database(_)
        )
    }
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Serialization Error: {0}")]
    Serialization(#[from] SerdeError),

    #[error("cache is full and eviction is disabled")]
    Full,

    #[error("Redis Error: {0}")]
    Redis(#[from] RedisError),
}

impl CacheError {
    pub fn is_retriable(&self) -> bool {
        !matches!(self, CacheError::Serialization(_))
    }
}
