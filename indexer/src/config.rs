use alloy::primitives::{Address, B256};
use clap::Parser;
use db::EvictionPolicy;
use serde::{Deserialize, Serialize};
use std::{env, fs, io::ErrorKind, time::Duration};
use tracing::info;

use crate::error::ConfigError;

pub const STORAGE_BACKENDS: &[&str] = &["memory", "postgres"];
pub const CACHE_BACKENDS: &[&str] = &["in-memory", "redis", "none"];
pub const PROCESSING_STAGES: &[&str] = &["validate", "enrich", "normalize"];
pub const METRIC_GROUPS: &[&str] = &["blocks", "transactions", "addresses", "contracts"];

#[derive(Parser, Debug)]
pub struct CLIArguments {
    #[clap(long, value_parser)]
    pub config_path: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct IndexerConfig {
    pub enabled: bool,
    pub indexing_interval_ms: u64,
    pub batch_size: u64,
    pub max_concurrent_workers: usize,
    /// Last block considered indexed before the first batch; ingestion starts
    /// at `start_block + 1`.
    pub start_block: u64,
    pub rpc_endpoint: String,
    pub fetch_receipts: bool,
    pub retry: RetryConfig,
    pub block: BlockIndexerConfig,
    pub transaction: TransactionIndexerConfig,
    pub address: AddressIndexerConfig,
    pub contract: ContractIndexerConfig,
    pub event: EventIndexerConfig,
    pub storage: StorageConfig,
    pub cache: CacheConfig,
    pub processor: ProcessorConfig,
    pub analytics: AnalyticsConfig,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempts per block for retriable failures before the block is skipped.
    pub max_block_attempts: u32,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct BlockIndexerConfig {
    pub enabled: bool,
    pub index_transactions: bool,
    pub index_uncles: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct TransactionIndexerConfig {
    pub enabled: bool,
    pub index_method_calls: bool,
    pub index_token_transfers: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct AddressIndexerConfig {
    pub enabled: bool,
    pub index_balances: bool,
    pub index_token_holdings: bool,
    pub index_nfts: bool,
    pub tracking_addresses: Vec<Address>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ContractIndexerConfig {
    pub enabled: bool,
    pub index_creation: bool,
    pub index_interactions: bool,
    /// Empty means every detected contract type is indexed.
    pub contract_types: Vec<String>,
    pub verification_enabled: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(default)]
pub struct EventFilter {
    pub contract_address: Option<Address>,
    pub topic0: Option<B256>,
    pub event_name: Option<String>,
    pub enabled: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct EventIndexerConfig {
    pub enabled: bool,
    pub index_all_events: bool,
    pub decode_events: bool,
    pub filters: Vec<EventFilter>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct StorageConfig {
    #[serde(rename = "type")]
    pub backend: String,
    pub connection_string: String,
    pub max_connections: usize,
    pub compression_enabled: bool,
    pub partitioning_enabled: bool,
    pub backup_enabled: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    #[serde(rename = "type")]
    pub backend: String,
    pub connection_string: String,
    pub ttl_secs: u64,
    pub max_size: usize,
    pub eviction_policy: String,
    /// Populate the cache with entities read from storage on a miss.
    pub backfill_on_miss: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ProcessorConfig {
    pub enabled: bool,
    pub stages: Vec<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct AnalyticsConfig {
    pub enabled: bool,
    pub aggregation_interval_ms: u64,
    pub metrics_collection: Vec<String>,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        IndexerConfig {
            enabled: true,
            indexing_interval_ms: 5_000,
            batch_size: 10,
            max_concurrent_workers: 4,
            start_block: 0,
            rpc_endpoint: "http://127.0.0.1:8545".to_string(),
            fetch_receipts: true,
            retry: RetryConfig::default(),
            block: BlockIndexerConfig::default(),
            transaction: TransactionIndexerConfig::default(),
            address: AddressIndexerConfig::default(),
            contract: ContractIndexerConfig::default(),
            event: EventIndexerConfig::default(),
            storage: StorageConfig::default(),
            cache: CacheConfig::default(),
            processor: ProcessorConfig::default(),
            analytics: AnalyticsConfig::default(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            max_block_attempts: 3,
        }
    }
}

impl Default for BlockIndexerConfig {
    fn default() -> Self {
        BlockIndexerConfig {
            enabled: true,
            index_transactions: true,
            index_uncles: false,
        }
    }
}

impl Default for TransactionIndexerConfig {
    fn default() -> Self {
        TransactionIndexerConfig {
            enabled: true,
            index_method_calls: true,
            index_token_transfers: true,
        }
    }
}

impl Default for AddressIndexerConfig {
    fn default() -> Self {
        AddressIndexerConfig {
            enabled: true,
            index_balances: true,
            index_token_holdings: true,
            index_nfts: true,
            tracking_addresses: Vec::new(),
        }
    }
}

impl Default for ContractIndexerConfig {
    fn default() -> Self {
        ContractIndexerConfig {
            enabled: true,
            index_creation: true,
            index_interactions: true,
            contract_types: Vec::new(),
            verification_enabled: false,
        }
    }
}

impl Default for EventIndexerConfig {
    fn default() -> Self {
        EventIndexerConfig {
            enabled: true,
            index_all_events: true,
            decode_events: true,
            filters: Vec::new(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            backend: "memory".to_string(),
            connection_string: String::new(),
            max_connections: 8,
            compression_enabled: false,
            partitioning_enabled: false,
            backup_enabled: false,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            backend: "in-memory".to_string(),
            connection_string: String::new(),
            ttl_secs: 300,
            max_size: 10_000,
            eviction_policy: "lru".to_string(),
            backfill_on_miss: false,
        }
    }
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        ProcessorConfig {
            enabled: true,
            stages: vec![
                "validate".to_string(),
                "enrich".to_string(),
                "normalize".to_string(),
            ],
        }
    }
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        AnalyticsConfig {
            enabled: true,
            aggregation_interval_ms: 60_000,
            metrics_collection: METRIC_GROUPS.iter().map(|g| g.to_string()).collect(),
        }
    }
}

impl IndexerConfig {
    pub fn indexing_interval(&self) -> Duration {
        Duration::from_millis(self.indexing_interval_ms)
    }

    pub fn aggregation_interval(&self) -> Duration {
        Duration::from_millis(self.analytics.aggregation_interval_ms)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache.ttl_secs)
    }

    /// Checks every option without touching any backend.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.indexing_interval_ms == 0 {
            return Err(ConfigError::InvalidInterval);
        }
        if self.batch_size == 0 {
            return Err(ConfigError::InvalidBatchSize);
        }
        if self.max_concurrent_workers == 0 {
            return Err(ConfigError::InvalidWorkerCount);
        }
        if self.retry.max_block_attempts == 0 {
            return Err(ConfigError::InvalidRetryPolicy);
        }

        if !STORAGE_BACKENDS.contains(&self.storage.backend.as_str()) {
            return Err(ConfigError::UnsupportedStorageBackend(
                self.storage.backend.clone(),
            ));
        }
        if self.storage.backend == "postgres" {
            if self.storage.connection_string.is_empty() {
                return Err(ConfigError::MissingConnectionString("storage"));
            }
            if self.storage.max_connections == 0 {
                return Err(ConfigError::InvalidPoolSize);
            }
        }

        if !CACHE_BACKENDS.contains(&self.cache.backend.as_str()) {
            return Err(ConfigError::UnsupportedCacheBackend(self.cache.backend.clone()));
        }
        if EvictionPolicy::parse(&self.cache.eviction_policy).is_none() {
            return Err(ConfigError::UnsupportedEvictionPolicy(
                self.cache.eviction_policy.clone(),
            ));
        }
        if self.cache.backend == "in-memory" && self.cache.max_size == 0 {
            return Err(ConfigError::InvalidCacheSize);
        }
        if self.cache.backend == "redis" && self.cache.connection_string.is_empty() {
            return Err(ConfigError::MissingConnectionString("cache"));
        }

        if let Some(stage) = self
            .processor
            .stages
            .iter()
            .find(|s| !PROCESSING_STAGES.contains(&s.as_str()))
        {
            return Err(ConfigError::UnknownProcessingStage(stage.clone()));
        }

        if self.analytics.enabled && self.analytics.aggregation_interval_ms == 0 {
            return Err(ConfigError::InvalidAggregationInterval);
        }
        if let Some(group) = self
            .analytics
            .metrics_collection
            .iter()
            .find(|g| !METRIC_GROUPS.contains(&g.as_str()))
        {
            return Err(ConfigError::UnknownMetricGroup(group.clone()));
        }

        Ok(())
    }

    /// Connection strings and the RPC endpoint may come from the environment.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(url) = env::var("DATABASE_URL") {
            self.storage.connection_string = url;
        }
        if let Ok(url) = env::var("REDIS_URL") {
            self.cache.connection_string = url;
        }
        if let Ok(url) = env::var("RPC_URL") {
            self.rpc_endpoint = url;
        }
    }
}

pub fn load_config(config_path: &str) -> Result<IndexerConfig, ConfigError> {
    match fs::read_to_string(config_path) {
        Ok(file_str) => Ok(toml::from_str(&file_str)?),
        Err(e) if e.kind() == ErrorKind::NotFound || config_path.is_empty() => {
            info!(config_path, "config file not found, using defaults");
            Ok(IndexerConfig::default())
        }
        Err(e) => Err(ConfigError::Io(e)),
    }
}
