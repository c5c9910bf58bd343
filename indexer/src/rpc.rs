use alloy::eips::BlockNumberOrTag;
use alloy::primitives::B256;
use alloy::providers::{Provider, ProviderBuilder, RootProvider};
use alloy::rpc::types::{Block, Filter, Log, Transaction, TransactionReceipt};
use alloy::transports::http::Http;
use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use reqwest::Client;
use std::{collections::HashMap, future::Future};
use tokio::task;
use tracing::{debug, warn};

use crate::error::SourceError;
use crate::source::{BlockSource, RawBlock, RawLog, RawReceipt, RawTransaction};

pub type ExternalProvider = RootProvider<Http<Client>>;

/// Pulls blocks from a JSON-RPC node over HTTP.
pub struct RpcBlockSource {
    provider: ExternalProvider,
    fetch_receipts: bool,
}

impl RpcBlockSource {
    pub fn new(endpoint: &str, fetch_receipts: bool) -> Result<Self, SourceError> {
        let url = endpoint
            .parse::<reqwest::Url>()
            .map_err(|e| SourceError::InvalidUrl(format!("{}: {}", endpoint, e)))?;
        Ok(Self {
            provider: ProviderBuilder::new().on_http(url),
            fetch_receipts,
        })
    }

    async fn receipts(&self, block: &Block) -> Result<HashMap<B256, RawReceipt>, SourceError> {
        let hashes = block.transactions.txns().map(|tx| tx.hash).collect();
        let provider = self.provider.clone();
        collect_receipts(hashes, move |hash| {
            let provider = provider.clone();
            async move {
                match provider.get_transaction_receipt(hash).await {
                    Ok(Some(receipt)) => raw_receipt(&receipt).map(Some),
                    Ok(None) => Ok(None),
                    Err(e) => Err(SourceError::Transport(format!("receipt for {}: {}", hash, e))),
                }
            }
        })
        .await
    }

    async fn block_logs(&self, number: u64) -> Result<Vec<RawLog>, SourceError> {
        let filter = Filter::new().from_block(number).to_block(number);
        let logs = self
            .provider
            .get_logs(&filter)
            .await
            .map_err(|e| SourceError::Transport(e.to_string()))?;
        Ok(logs.iter().map(raw_log).collect())
    }
}

/// Fetches receipts concurrently. Any failed or missing receipt fails the
/// whole block so that it is retried instead of indexed without outcomes.
async fn collect_receipts<F, Fut>(
    hashes: Vec<B256>,
    fetch: F,
) -> Result<HashMap<B256, RawReceipt>, SourceError>
where
    F: Fn(B256) -> Fut,
    Fut: Future<Output = Result<Option<RawReceipt>, SourceError>> + Send + 'static,
{
    let tasks: FuturesUnordered<_> = hashes
        .into_iter()
        .map(|hash| {
            let fetched = fetch(hash);
            task::spawn(async move { (hash, fetched.await) })
        })
        .collect();

    let mut receipts = HashMap::new();
    for result in tasks.collect::<Vec<_>>().await {
        let (hash, fetched) =
            result.map_err(|e| SourceError::Transport(format!("receipt task failed: {}", e)))?;
        match fetched {
            Ok(Some(receipt)) => {
                receipts.insert(hash, receipt);
            }
            Ok(None) => {
                return Err(SourceError::Transport(format!(
                    "receipt for {} not available",
                    hash
                )))
            }
            Err(e) => {
                warn!(tx = %hash, error = %e, "failed to fetch receipt");
                return Err(e);
            }
        }
    }
    debug!(receipts = receipts.len(), "fetched receipts");
    Ok(receipts)
}

fn to_u64<T: TryInto<u64>>(value: T, field: &str) -> Result<u64, SourceError> {
    value
        .try_into()
        .map_err(|_| SourceError::Malformed(format!("{} does not fit in 64 bits", field)))
}

fn raw_log(log: &Log) -> RawLog {
    RawLog {
        address: log.address(),
        topics: log.topics().to_vec(),
        data: log.data().data.clone(),
        log_index: log.log_index.unwrap_or_default(),
        transaction_hash: log.transaction_hash.unwrap_or_default(),
        transaction_index: log.transaction_index.unwrap_or_default(),
    }
}

fn raw_receipt(receipt: &TransactionReceipt) -> Result<RawReceipt, SourceError> {
    Ok(RawReceipt {
        transaction_hash: receipt.transaction_hash,
        status: receipt.status(),
        gas_used: to_u64(receipt.gas_used, "receipt gas used")?,
        effective_gas_price: Some(receipt.effective_gas_price),
        contract_address: receipt.contract_address,
        logs: receipt.inner.logs().iter().map(raw_log).collect(),
    })
}

fn raw_transaction(
    tx: &Transaction,
    position: usize,
    receipt: Option<RawReceipt>,
) -> Result<RawTransaction, SourceError> {
    Ok(RawTransaction {
        hash: tx.hash,
        transaction_index: tx.transaction_index.unwrap_or(position as u64),
        nonce: tx.nonce,
        from: tx.from,
        to: tx.to,
        value: tx.value,
        gas_limit: to_u64(tx.gas, "transaction gas")?,
        gas_price: tx.gas_price.or(tx.max_fee_per_gas).unwrap_or_default(),
        input: tx.input.clone(),
        receipt,
    })
}

#[async_trait]
impl BlockSource for RpcBlockSource {
    async fn block(&self, number: u64) -> Result<Option<RawBlock>, SourceError> {
        let Some(block) = self
            .provider
            .get_block_by_number(BlockNumberOrTag::Number(number), true)
            .await
            .map_err(|e| SourceError::Transport(e.to_string()))?
        else {
            return Ok(None);
        };

        let (mut receipts, logs) = if self.fetch_receipts {
            (self.receipts(&block).await?, Vec::new())
        } else {
            (HashMap::new(), self.block_logs(number).await?)
        };
        let transactions = block
            .transactions
            .txns()
            .enumerate()
            .map(|(position, tx)| raw_transaction(tx, position, receipts.remove(&tx.hash)))
            .collect::<Result<Vec<_>, _>>()?;

        let header = &block.header;
        Ok(Some(RawBlock {
            number: header.number,
            hash: header.hash,
            parent_hash: header.parent_hash,
            timestamp: header.timestamp,
            miner: header.miner,
            difficulty: header.difficulty,
            gas_limit: to_u64(header.gas_limit, "block gas limit")?,
            gas_used: to_u64(header.gas_used, "block gas used")?,
            size: block.size.map(|s| s.saturating_to::<u64>()).unwrap_or_default(),
            extra_data: header.extra_data.clone(),
            uncles: block.uncles.clone(),
            transactions,
            logs,
        }))
    }

    async fn latest_block_number(&self) -> Result<u64, SourceError> {
        self.provider
            .get_block_number()
            .await
            .map_err(|e| SourceError::Transport(e.to_string()))
    }
}
