use alloy::primitives::{Address, B256};
use db::{EntityKey, EntityKind, StorageError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("indexing interval must be greater than zero")]
    InvalidInterval,

    #[error("batch size must be greater than zero")]
    InvalidBatchSize,

    #[error("max concurrent workers must be greater than zero")]
    InvalidWorkerCount,

    #[error("retry.max_block_attempts must be greater than zero")]
    InvalidRetryPolicy,

    #[error("unsupported storage backend: {0}")]
    UnsupportedStorageBackend(String),

    #[error("unsupported cache backend: {0}")]
    UnsupportedCacheBackend(String),

    #[error("unsupported eviction policy: {0}")]
    UnsupportedEvictionPolicy(String),

    #[error("in-memory cache max size must be greater than zero")]
    InvalidCacheSize,

    #[error("storage max connections must be greater than zero")]
    InvalidPoolSize,

    #[error("{0} backend requires a connection string")]
    MissingConnectionString(&'static str),

    #[error("unknown processing stage: {0}")]
    UnknownProcessingStage(String),

    #[error("analytics aggregation interval must be greater than zero")]
    InvalidAggregationInterval,

    #[error("unknown metric group: {0}")]
    UnknownMetricGroup(String),

    #[error("Config Parse Error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Config IO Error: {0}")]
    Io(#[from] std::io::Error),
}

/// Malformed chain data. Fatal to the entity it was raised for, never to the
/// batch.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("block {number} parent hash {found} does not match indexed block hash {expected}")]
    BrokenParentChain {
        number: u64,
        expected: B256,
        found: B256,
    },

    #[error("{kind} gas used {gas_used} exceeds gas limit {gas_limit}")]
    GasUsedAboveLimit {
        kind: EntityKind,
        gas_used: u64,
        gas_limit: u64,
    },

    #[error("{0} hash is zero")]
    ZeroHash(EntityKind),

    #[error("receipt for {receipt} was supplied with transaction {transaction}")]
    ReceiptMismatch { transaction: B256, receipt: B256 },

    #[error("transaction {0} both creates a contract and has a recipient")]
    CreationWithRecipient(B256),

    #[error("log {log_index} is malformed: {reason}")]
    MalformedLog { log_index: u64, reason: String },

    #[error("address {0} was last active before it was first seen")]
    ActivityBeforeFirstSeen(Address),

    #[error("contract verification requires source code")]
    EmptyVerificationSource,
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("block source transport error: {0}")]
    Transport(String),

    #[error("block source returned malformed data: {0}")]
    Malformed(String),

    #[error("invalid block source url: {0}")]
    InvalidUrl(String),
}

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("Validation Error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Backend Error: {0}")]
    BackendUnavailable(StorageError),

    #[error("entity not found: {0}")]
    NotFound(EntityKey),

    #[error("no indexed block with hash {0}")]
    UnknownBlockHash(B256),

    #[error("Source Error: {0}")]
    Source(#[from] SourceError),

    #[error("{0} is disabled by configuration")]
    Disabled(&'static str),
}

impl From<StorageError> for IndexError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(key) => IndexError::NotFound(key),
            other => IndexError::BackendUnavailable(other),
        }
    }
}

impl IndexError {
    /// Retriable failures keep the block in front of the cursor so the next
    /// tick tries it again.
    pub fn is_retriable(&self) -> bool {
        match self {
            IndexError::BackendUnavailable(err) => err.is_retriable(),
            IndexError::Source(_) => true,
            IndexError::Validation(_)
            | IndexError::NotFound(_)
            | IndexError::UnknownBlockHash(_)
            | IndexError::Disabled(_) => false,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("indexer is already running")]
    AlreadyRunning,
}

#[derive(Debug, Error)]
pub enum AnalyticsError {
    #[error("Storage Error: {0}")]
    Storage(#[from] StorageError),

    #[error("unknown report type: {0}")]
    UnknownReportType(String),
}

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("entity not found: {0}")]
    NotFound(EntityKey),

    #[error("no indexed block with hash {0}")]
    UnknownBlockHash(B256),

    #[error("Backend Error: {0}")]
    Backend(StorageError),

    #[error("analytics is disabled")]
    AnalyticsDisabled,

    #[error("Analytics Error: {0}")]
    Analytics(#[from] AnalyticsError),
}

impl QueryError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, QueryError::NotFound(_) | QueryError::UnknownBlockHash(_))
    }
}

impl From<StorageError> for QueryError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(key) => QueryError::NotFound(key),
            other => QueryError::Backend(other),
        }
    }
}

impl From<IndexError> for QueryError {
    fn from(err: IndexError) -> Self {
        match err {
            IndexError::NotFound(key) => QueryError::NotFound(key),
            IndexError::UnknownBlockHash(hash) => QueryError::UnknownBlockHash(hash),
            IndexError::BackendUnavailable(err) => QueryError::Backend(err),
            other => QueryError::Backend(StorageError::BackendUnavailable(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_not_found_stays_typed() {
        let err: QueryError = StorageError::NotFound(EntityKey::Block(5)).into();
        assert!(err.is_not_found());

        let err: IndexError = StorageError::NotFound(EntityKey::Block(5)).into();
        assert!(matches!(err, IndexError::NotFound(EntityKey::Block(5))));
        assert!(!err.is_retriable());
    }

    #[test]
    fn backend_and_source_errors_are_retriable() {
        let err: IndexError = StorageError::BackendUnavailable("down".into()).into();
        assert!(err.is_retriable());
        assert!(IndexError::Source(SourceError::Transport("timeout".into())).is_retriable());
        assert!(!IndexError::Validation(ValidationError::ZeroHash(EntityKind::Block)).is_retriable());
    }
}
