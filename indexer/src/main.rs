use anyhow::Context;
use clap::Parser;
use db::{
    CacheEngine, EvictionPolicy, MemoryCache, MemoryStorage, NoopCache, PostgresStorage,
    RedisCache, StorageEngine,
};
use dotenvy::dotenv;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use indexer::{load_config, CLIArguments, Indexer, IndexerConfig, RpcBlockSource};

async fn storage_backend(config: &IndexerConfig) -> anyhow::Result<Arc<dyn StorageEngine>> {
    let storage = &config.storage;
    Ok(match storage.backend.as_str() {
        "postgres" => Arc::new(
            PostgresStorage::connect(
                &storage.connection_string,
                storage.max_connections,
                storage.compression_enabled,
                storage.partitioning_enabled,
                storage.backup_enabled,
            )
            .await
            .context("failed to connect to postgres")?,
        ),
        _ => Arc::new(MemoryStorage::new()),
    })
}

async fn cache_backend(config: &IndexerConfig) -> anyhow::Result<Arc<dyn CacheEngine>> {
    let cache = &config.cache;
    Ok(match cache.backend.as_str() {
        "redis" => Arc::new(
            RedisCache::connect(&cache.connection_string, &cache.eviction_policy)
                .await
                .context("failed to connect to redis")?,
        ),
        "none" => Arc::new(NoopCache),
        _ => Arc::new(MemoryCache::new(
            cache.max_size,
            EvictionPolicy::parse(&cache.eviction_policy).unwrap_or(EvictionPolicy::Lru),
        )),
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli_args = CLIArguments::parse();
    let config_path = cli_args.config_path.unwrap_or_default();
    let mut config = load_config(&config_path).context("failed to load config")?;
    config.apply_env_overrides();
    config.validate()?;

    let source = Arc::new(RpcBlockSource::new(
        &config.rpc_endpoint,
        config.fetch_receipts,
    )?);
    let storage = storage_backend(&config).await?;
    let cache = cache_backend(&config).await?;
    info!(
        storage = storage.backend(),
        cache = cache.backend(),
        rpc = %config.rpc_endpoint,
        "backends ready"
    );

    let indexer = Indexer::new(config, source, storage, cache)?;
    let shutdown = CancellationToken::new();
    indexer.start(shutdown.clone()).await?;

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    shutdown.cancel();
    indexer.stop().await;

    let stats = indexer.get_indexing_statistics();
    info!(
        blocks = stats.total_blocks,
        transactions = stats.total_transactions,
        errors = stats.error_count,
        "indexer exited"
    );
    Ok(())
}
