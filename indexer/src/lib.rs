pub mod analytics;
pub mod config;
pub mod decode;
pub mod error;
pub mod indexer;
pub mod indexers;
pub mod processor;
pub mod rpc;
pub mod source;

pub use analytics::{AnalyticsEngine, MetricsResult, Report, ReportType, StorageAnalyticsEngine};
pub use config::{load_config, CLIArguments, IndexerConfig};
pub use error::{
    AnalyticsError, ConfigError, IndexError, LifecycleError, QueryError, SourceError,
    ValidationError,
};
pub use indexer::{
    AnalyticsHealth, BatchReport, BlockFailure, BlockReport, EntityOutcome, Indexer,
    IndexingProgress, IndexingStatistics, TransactionReport,
};
pub use indexers::EntityIndexers;
pub use processor::{DataProcessor, PipelineProcessor};
pub use rpc::RpcBlockSource;
pub use source::{BlockSource, MemoryBlockSource, RawBlock, RawLog, RawReceipt, RawTransaction};
