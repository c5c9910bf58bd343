use alloy::primitives::{Address, U256};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use db::{
    unix_to_utc, Entity, EntityKind, IndexedAddress, IndexedBlock, IndexedContract,
    IndexedTransaction, Query, StorageEngine, StorageEngineExt, TimeRange, ToHexString, TxStatus,
};
use itertools::Itertools;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, HashSet},
    fmt,
    str::FromStr,
    sync::Arc,
};
use tracing::debug;

use crate::{config::AnalyticsConfig, error::AnalyticsError};

const POPULAR_CONTRACTS: usize = 10;
const LOW_SUCCESS_RATE: f64 = 0.9;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BlockMetrics {
    pub count: u64,
    pub average_block_time_secs: f64,
    pub total_gas_used: u128,
    pub average_gas_used: f64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TransactionMetrics {
    pub count: u64,
    pub successful: u64,
    pub success_rate: f64,
    pub average_gas_price: f64,
    pub total_value: U256,
    pub average_value: U256,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressMetrics {
    pub total: u64,
    pub active: u64,
    pub new: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PopularContract {
    pub address: Address,
    pub interaction_count: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractMetrics {
    pub total: u64,
    pub new: u64,
    pub verified: u64,
    pub popular: Vec<PopularContract>,
}

/// Aggregates over one time range. Groups that are not collected are `None`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MetricsResult {
    pub time_range: TimeRange,
    pub blocks: Option<BlockMetrics>,
    pub transactions: Option<TransactionMetrics>,
    pub addresses: Option<AddressMetrics>,
    pub contracts: Option<ContractMetrics>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportType {
    Summary,
    Daily,
    Weekly,
}

impl ReportType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReportType::Summary => "summary",
            ReportType::Daily => "daily",
            ReportType::Weekly => "weekly",
        }
    }
}

impl fmt::Display for ReportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReportType {
    type Err = AnalyticsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "summary" => Ok(ReportType::Summary),
            "daily" => Ok(ReportType::Daily),
            "weekly" => Ok(ReportType::Weekly),
            other => Err(AnalyticsError::UnknownReportType(other.to_string())),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub report_type: ReportType,
    pub metrics: MetricsResult,
    pub insights: Vec<String>,
    pub generated_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub entity_counts: BTreeMap<String, usize>,
    pub metrics: BTreeMap<String, f64>,
    pub insights: Vec<String>,
}

#[async_trait]
pub trait AnalyticsEngine: Send + Sync {
    async fn analyze(&self, data: &[Entity]) -> Result<AnalysisResult, AnalyticsError>;

    /// Deterministic for a fully indexed range.
    async fn get_metrics(&self, range: TimeRange) -> Result<MetricsResult, AnalyticsError>;

    async fn generate_report(&self, report_type: ReportType) -> Result<Report, AnalyticsError>;
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct MetricGroups {
    blocks: bool,
    transactions: bool,
    addresses: bool,
    contracts: bool,
}

impl MetricGroups {
    fn from_names(names: &[String]) -> Self {
        let has = |group: &str| names.iter().any(|n| n == group);
        Self {
            blocks: has("blocks"),
            transactions: has("transactions"),
            addresses: has("addresses"),
            contracts: has("contracts"),
        }
    }
}

/// Reads indexed entities back from storage and aggregates them.
pub struct StorageAnalyticsEngine {
    storage: Arc<dyn StorageEngine>,
    groups: MetricGroups,
}

impl StorageAnalyticsEngine {
    pub fn new(config: &AnalyticsConfig, storage: Arc<dyn StorageEngine>) -> Self {
        Self {
            storage,
            groups: MetricGroups::from_names(&config.metrics_collection),
        }
    }

    async fn newest_and_oldest_block(
        &self,
    ) -> Result<Option<(IndexedBlock, IndexedBlock)>, AnalyticsError> {
        let newest = self
            .storage
            .query_as::<IndexedBlock>(&Query::new(EntityKind::Block).limit(1))
            .await?;
        let oldest = self
            .storage
            .query_as::<IndexedBlock>(&Query::new(EntityKind::Block).ascending().limit(1))
            .await?;
        Ok(newest.into_iter().next().zip(oldest.into_iter().next()))
    }
}

fn u256_to_f64(value: U256) -> f64 {
    value
        .as_limbs()
        .iter()
        .rev()
        .fold(0.0, |acc, limb| acc * 18_446_744_073_709_551_616.0 + *limb as f64)
}

fn block_metrics(blocks: &[IndexedBlock]) -> BlockMetrics {
    let count = blocks.len() as u64;
    let total_gas_used: u128 = blocks.par_iter().map(|b| b.gas_used as u128).sum();
    let gaps: Vec<i64> = blocks
        .iter()
        .sorted_by_key(|b| b.number)
        .tuple_windows()
        .map(|(a, b)| (b.timestamp - a.timestamp).num_seconds())
        .collect();

    BlockMetrics {
        count,
        average_block_time_secs: if gaps.is_empty() {
            0.0
        } else {
            gaps.iter().sum::<i64>() as f64 / gaps.len() as f64
        },
        total_gas_used,
        average_gas_used: if count == 0 {
            0.0
        } else {
            total_gas_used as f64 / count as f64
        },
    }
}

fn transaction_metrics(txs: &[IndexedTransaction]) -> TransactionMetrics {
    let count = txs.len() as u64;
    let successful = txs
        .par_iter()
        .filter(|tx| tx.status == TxStatus::Success)
        .count() as u64;
    let total_gas_price: u128 = txs.par_iter().map(|tx| tx.gas_price).sum();
    let total_value = txs
        .par_iter()
        .map(|tx| tx.value)
        .reduce(|| U256::ZERO, |a, b| a.saturating_add(b));

    if count == 0 {
        return TransactionMetrics::default();
    }
    TransactionMetrics {
        count,
        successful,
        success_rate: successful as f64 / count as f64,
        average_gas_price: total_gas_price as f64 / count as f64,
        total_value,
        average_value: total_value / U256::from(count),
    }
}

/// Everything is read against the window: known means first seen by its
/// end, active means touched by one of its transactions.
fn address_metrics(
    addresses: &[IndexedAddress],
    txs: &[IndexedTransaction],
    range: &TimeRange,
) -> AddressMetrics {
    AddressMetrics {
        total: addresses
            .par_iter()
            .filter(|a| a.first_seen <= range.end)
            .count() as u64,
        active: txs
            .iter()
            .flat_map(|tx| tx.touched_addresses())
            .unique()
            .count() as u64,
        new: addresses
            .par_iter()
            .filter(|a| range.contains(&a.first_seen))
            .count() as u64,
    }
}

/// Popularity counts calls made inside the window, not the lifetime
/// interaction counter.
fn contract_metrics(
    contracts: &[IndexedContract],
    txs: &[IndexedTransaction],
    range: &TimeRange,
) -> ContractMetrics {
    let deployed: Vec<&IndexedContract> = contracts
        .iter()
        .filter(|c| c.creation_timestamp <= range.end)
        .collect();
    let known: HashSet<Address> = deployed.iter().map(|c| c.address).collect();

    ContractMetrics {
        total: deployed.len() as u64,
        new: deployed
            .iter()
            .filter(|c| range.contains(&c.creation_timestamp))
            .count() as u64,
        verified: deployed.iter().filter(|c| c.is_verified).count() as u64,
        popular: txs
            .iter()
            .filter_map(|tx| tx.to.filter(|to| known.contains(to)))
            .counts()
            .into_iter()
            .sorted_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)))
            .take(POPULAR_CONTRACTS)
            .map(|(address, calls)| PopularContract {
                address,
                interaction_count: calls as u64,
            })
            .collect(),
    }
}

fn insights(metrics: &MetricsResult) -> Vec<String> {
    let mut insights = Vec::new();
    if let Some(blocks) = &metrics.blocks {
        if blocks.count == 0 {
            insights.push("no blocks indexed in this window".to_string());
        } else if blocks.count > 1 {
            insights.push(format!(
                "average block time {:.1}s over {} blocks",
                blocks.average_block_time_secs, blocks.count
            ));
        }
    }
    if let Some(txs) = &metrics.transactions {
        if txs.count > 0 && txs.success_rate < LOW_SUCCESS_RATE {
            insights.push(format!(
                "transaction success rate is low: {:.1}%",
                txs.success_rate * 100.0
            ));
        }
    }
    if let Some(addresses) = &metrics.addresses {
        if addresses.new > 0 {
            insights.push(format!("{} new addresses", addresses.new));
        }
    }
    if let Some(contracts) = &metrics.contracts {
        if contracts.new > 0 {
            insights.push(format!("{} contracts deployed", contracts.new));
        }
        if let Some(top) = contracts.popular.first() {
            insights.push(format!(
                "most used contract {} with {} interactions",
                top.address.to_hex_string(),
                top.interaction_count
            ));
        }
    }
    insights
}

#[async_trait]
impl AnalyticsEngine for StorageAnalyticsEngine {
    async fn analyze(&self, data: &[Entity]) -> Result<AnalysisResult, AnalyticsError> {
        let entity_counts: BTreeMap<String, usize> = data
            .iter()
            .counts_by(|e| e.kind().to_string())
            .into_iter()
            .collect();

        let txs: Vec<&IndexedTransaction> = data
            .iter()
            .filter_map(|e| match e {
                Entity::Transaction(tx) => Some(tx),
                _ => None,
            })
            .collect();

        let mut metrics = BTreeMap::new();
        let mut insights = Vec::new();
        if !txs.is_empty() {
            let failed = txs.iter().filter(|tx| tx.status == TxStatus::Failed).count();
            let total_value = txs
                .iter()
                .fold(U256::ZERO, |acc, tx| acc.saturating_add(tx.value));
            let total_gas: u128 = txs.iter().map(|tx| tx.gas_used as u128).sum();
            let unique_addresses = txs
                .iter()
                .flat_map(|tx| tx.touched_addresses())
                .unique()
                .count();

            let failure_rate = failed as f64 / txs.len() as f64;
            metrics.insert("failure_rate".to_string(), failure_rate);
            metrics.insert("total_value_wei".to_string(), u256_to_f64(total_value));
            metrics.insert(
                "average_gas_used".to_string(),
                total_gas as f64 / txs.len() as f64,
            );
            metrics.insert("unique_addresses".to_string(), unique_addresses as f64);

            if failure_rate > 1.0 - LOW_SUCCESS_RATE {
                insights.push(format!("{:.1}% of transactions failed", failure_rate * 100.0));
            }
            if let Some((address, calls)) = txs
                .iter()
                .filter_map(|tx| tx.to)
                .counts()
                .into_iter()
                .max_by(|a, b| a.1.cmp(&b.1).then(b.0.cmp(&a.0)))
            {
                insights.push(format!(
                    "most called address {} ({} transactions)",
                    address.to_hex_string(),
                    calls
                ));
            }
        }

        Ok(AnalysisResult {
            entity_counts,
            metrics,
            insights,
        })
    }

    async fn get_metrics(&self, range: TimeRange) -> Result<MetricsResult, AnalyticsError> {
        let mut result = MetricsResult {
            time_range: range,
            blocks: None,
            transactions: None,
            addresses: None,
            contracts: None,
        };

        if self.groups.blocks {
            let blocks = self
                .storage
                .query_as::<IndexedBlock>(&Query::new(EntityKind::Block).within(range).ascending())
                .await?;
            result.blocks = Some(block_metrics(&blocks));
        }
        let needs_txs =
            self.groups.transactions || self.groups.addresses || self.groups.contracts;
        let txs = if needs_txs {
            self.storage
                .query_as::<IndexedTransaction>(
                    &Query::new(EntityKind::Transaction).within(range).ascending(),
                )
                .await?
        } else {
            Vec::new()
        };
        if self.groups.transactions {
            result.transactions = Some(transaction_metrics(&txs));
        }
        if self.groups.addresses {
            let addresses = self
                .storage
                .query_as::<IndexedAddress>(&Query::new(EntityKind::Address))
                .await?;
            result.addresses = Some(address_metrics(&addresses, &txs, &range));
        }
        if self.groups.contracts {
            let contracts = self
                .storage
                .query_as::<IndexedContract>(&Query::new(EntityKind::Contract))
                .await?;
            result.contracts = Some(contract_metrics(&contracts, &txs, &range));
        }

        debug!(start = %range.start, end = %range.end, "aggregated metrics");
        Ok(result)
    }

    async fn generate_report(&self, report_type: ReportType) -> Result<Report, AnalyticsError> {
        let bounds = self.newest_and_oldest_block().await?;
        let range = match (report_type, bounds) {
            (_, None) => TimeRange::new(unix_to_utc(0), unix_to_utc(0)),
            (ReportType::Summary, Some((newest, oldest))) => {
                TimeRange::new(oldest.timestamp, newest.timestamp)
            }
            (ReportType::Daily, Some((newest, _))) => {
                TimeRange::trailing(newest.timestamp, Duration::days(1))
            }
            (ReportType::Weekly, Some((newest, _))) => {
                TimeRange::trailing(newest.timestamp, Duration::weeks(1))
            }
        };

        let metrics = self.get_metrics(range).await?;
        Ok(Report {
            report_type,
            insights: insights(&metrics),
            metrics,
            generated_at: Utc::now(),
        })
    }
}
