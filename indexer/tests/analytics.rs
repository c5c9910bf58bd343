mod common;

use alloy::primitives::Address;
use async_trait::async_trait;
use common::*;
use db::{unix_to_utc, Entity, EvictionPolicy, MemoryCache, TimeRange};
use indexer::{
    analytics::AnalysisResult, AnalyticsEngine, AnalyticsError, AnalyticsHealth, ConfigError,
    EntityIndexers, Indexer, IndexerConfig, MetricsResult, QueryError, Report, ReportType,
};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::{sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;

struct PanickingEngine;

#[async_trait]
impl AnalyticsEngine for PanickingEngine {
    async fn analyze(&self, _data: &[Entity]) -> Result<AnalysisResult, AnalyticsError> {
        Ok(AnalysisResult::default())
    }

    async fn get_metrics(&self, _range: TimeRange) -> Result<MetricsResult, AnalyticsError> {
        panic!("boom")
    }

    async fn generate_report(&self, _report_type: ReportType) -> Result<Report, AnalyticsError> {
        panic!("boom")
    }
}

fn build(config: IndexerConfig) -> Result<Indexer, ConfigError> {
    let storage = Arc::new(FailingStorage::new());
    Indexer::new(
        config,
        Arc::new(indexer::MemoryBlockSource::new()),
        storage,
        Arc::new(MemoryCache::new(10, EvictionPolicy::Lru)),
    )
}

#[test]
fn invalid_configs_are_rejected() {
    let mut zero_batch = config(0, 1);
    zero_batch.batch_size = 0;
    assert!(matches!(build(zero_batch), Err(ConfigError::InvalidBatchSize)));

    let mut zero_interval = config(0, 1);
    zero_interval.indexing_interval_ms = 0;
    assert!(matches!(build(zero_interval), Err(ConfigError::InvalidInterval)));

    let mut bad_storage = config(0, 1);
    bad_storage.storage.backend = "mongodb".into();
    assert!(matches!(
        build(bad_storage),
        Err(ConfigError::UnsupportedStorageBackend(backend)) if backend == "mongodb"
    ));

    let mut bad_stage = config(0, 1);
    bad_stage.processor.stages.push("compress".into());
    assert!(matches!(
        build(bad_stage),
        Err(ConfigError::UnknownProcessingStage(stage)) if stage == "compress"
    ));

    assert!(build(config(0, 1)).is_ok());
}

#[tokio::test]
async fn disabled_analytics_is_a_typed_error() {
    let mut cfg = config(0, 5);
    cfg.analytics.enabled = false;
    let h = harness(cfg, chain(1, 3));
    h.indexer.index_next_batch().await;

    assert!(matches!(
        h.indexer.get_analytics(TimeRange::trailing(chrono::Utc::now(), chrono::Duration::days(1))).await,
        Err(QueryError::AnalyticsDisabled)
    ));
    assert!(matches!(
        h.indexer.generate_report(ReportType::Summary).await,
        Err(QueryError::AnalyticsDisabled)
    ));
    assert_eq!(h.indexer.get_metrics()["analytics_enabled"], json!(false));
}

#[tokio::test]
async fn summary_report_covers_every_indexed_block() {
    let blocks = (1..=5)
        .map(|n| {
            with_transactions(
                block(n),
                vec![transfer(n, 0, Address::repeat_byte(0xa), Address::repeat_byte(n as u8), 10)],
            )
        })
        .collect();
    let h = harness(config(0, 5), blocks);
    h.indexer.index_next_batch().await;

    let report = h.indexer.generate_report(ReportType::Summary).await.unwrap();
    assert_eq!(report.report_type, ReportType::Summary);
    let blocks = report.metrics.blocks.as_ref().unwrap();
    assert_eq!(blocks.count, 5);
    assert_eq!(blocks.average_block_time_secs, 12.0);
    assert_eq!(blocks.total_gas_used, 5 * 21_000);

    let txs = report.metrics.transactions.as_ref().unwrap();
    assert_eq!(txs.count, 5);
    assert_eq!(txs.success_rate, 1.0);
    assert_eq!(report.metrics.addresses.as_ref().unwrap().total, 6);

    // same window, same numbers
    let again = h.indexer.get_analytics(report.metrics.time_range).await.unwrap();
    assert_eq!(again, report.metrics);
}

#[tokio::test]
async fn past_window_is_stable_while_ingestion_continues() {
    let sender = Address::repeat_byte(0xa);
    let blocks = (1..=6)
        .map(|n| {
            // later blocks revisit the recipients of earlier ones
            let to = Address::repeat_byte(((n - 1) % 3 + 1) as u8);
            with_transactions(block(n), vec![transfer(n, 0, sender, to, 10)])
        })
        .collect();
    let h = harness(config(0, 3), blocks);
    let window = TimeRange::new(unix_to_utc(1_700_000_012), unix_to_utc(1_700_000_036));

    assert_eq!(h.indexer.index_next_batch().await.cursor, 3);
    let before = h.indexer.get_analytics(window).await.unwrap();
    let addresses = before.addresses.clone().unwrap();
    assert_eq!(addresses.total, 4);
    assert_eq!(addresses.active, 4);

    assert_eq!(h.indexer.index_next_batch().await.cursor, 6);
    let after = h.indexer.get_analytics(window).await.unwrap();
    assert_eq!(after, before);
}

#[tokio::test(start_paused = true)]
async fn analytics_panic_is_reported_and_ingestion_continues() {
    let cfg = config(0, 2);
    let source = Arc::new(indexer::MemoryBlockSource::from_blocks(chain(1, 10)));
    let storage = Arc::new(FailingStorage::new());
    let indexers = EntityIndexers::new(&cfg, storage.clone());
    let indexer = Indexer::from_parts(
        cfg,
        source,
        storage,
        Arc::new(MemoryCache::new(100, EvictionPolicy::Lru)),
        indexers,
        Some(Arc::new(PanickingEngine)),
    )
    .unwrap();

    assert_eq!(indexer.analytics_health(), AnalyticsHealth::Idle);
    indexer.start(CancellationToken::new()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(
        indexer.analytics_health(),
        AnalyticsHealth::Failed("boom".to_string())
    );
    let metrics = indexer.get_metrics();
    assert_eq!(metrics["analytics_health"], json!("failed: boom"));
    assert_eq!(metrics["is_running"], json!(true));
    assert_eq!(indexer.get_indexing_statistics().error_count, 1);

    tokio::time::sleep(Duration::from_millis(1_000)).await;
    assert_eq!(indexer.get_indexing_progress().current_block, 4);
    indexer.stop().await;
}
