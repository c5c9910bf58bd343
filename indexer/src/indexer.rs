use alloy::primitives::{Address, B256, U256};
use chrono::{DateTime, Utc};
use db::{
    CacheEngine, CacheEngineExt, CacheError, Checkpoint, ContractKind, Entity, EntityKey,
    EntityKind, IndexedAddress, IndexedBlock, IndexedContract, IndexedEntity, IndexedEvent,
    IndexedTransaction, StorageEngine, StorageEngineExt, TimeRange, INGESTION_CHECKPOINT,
};
use futures::{stream, FutureExt, StreamExt};
use serde::Serialize;
use serde_json::{json, Value};
use std::{
    any::Any,
    collections::{BTreeMap, HashMap},
    fmt,
    future::Future,
    panic::AssertUnwindSafe,
    sync::{Arc, RwLock},
    time::Duration,
};
use tokio::{
    sync::Mutex,
    task::JoinHandle,
    time::{interval, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    analytics::{AnalyticsEngine, MetricsResult, Report, ReportType, StorageAnalyticsEngine},
    config::{EventFilter, IndexerConfig},
    error::{ConfigError, IndexError, LifecycleError, QueryError, ValidationError},
    indexers::{AddressActivity, EntityIndexers},
    processor::{DataProcessor, PipelineProcessor},
    source::{BlockSource, RawBlock, RawTransaction},
};

/// Result of persisting one entity. Storage and cache failures are recorded
/// here instead of failing the surrounding operation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct EntityOutcome {
    pub key: String,
    pub kind: EntityKind,
    pub indexed: bool,
    pub storage_error: Option<String>,
    pub cache_error: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct BlockReport {
    pub number: u64,
    pub hash: B256,
    /// `None` when the block indexer is disabled.
    pub header: Option<EntityOutcome>,
    pub outcomes: Vec<EntityOutcome>,
    /// Entities that were rejected or could not be built.
    pub errors: Vec<String>,
}

impl BlockReport {
    fn new(block: &RawBlock) -> Self {
        Self {
            number: block.number,
            hash: block.hash,
            header: None,
            outcomes: Vec::new(),
            errors: Vec::new(),
        }
    }

    /// A block counts as indexed once its header is in storage.
    pub fn header_stored(&self) -> bool {
        self.header.as_ref().map_or(true, |header| header.indexed)
    }

    pub fn failed_outcomes(&self) -> impl Iterator<Item = &EntityOutcome> {
        self.header
            .iter()
            .chain(self.outcomes.iter())
            .filter(|o| o.storage_error.is_some() || o.cache_error.is_some())
    }
}

/// Outcome of indexing one transaction outside a block.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TransactionReport {
    pub hash: B256,
    pub outcomes: Vec<EntityOutcome>,
    /// Events, contracts or addresses that could not be built.
    pub errors: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct BlockFailure {
    pub number: u64,
    pub error: String,
    pub retriable: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    /// First block of the requested range.
    pub start: u64,
    /// Last block of the requested range.
    pub end: u64,
    pub indexed: Vec<BlockReport>,
    pub failures: Vec<BlockFailure>,
    /// Cursor after the batch.
    pub cursor: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct IndexingProgress {
    pub start_block: u64,
    pub current_block: u64,
    pub latest_block: u64,
    pub blocks_processed: u64,
    pub blocks_remaining: u64,
    pub progress_percent: f64,
    pub eta_secs: Option<f64>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_update: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct IndexingStatistics {
    pub total_blocks: u64,
    pub total_transactions: u64,
    pub total_addresses: u64,
    pub total_contracts: u64,
    pub total_events: u64,
    pub error_count: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_hit_rate: f64,
    /// Blocks per second of processing time.
    pub indexing_rate: f64,
    pub storage_size: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub enum AnalyticsHealth {
    #[default]
    Idle,
    Healthy,
    Failed(String),
}

impl fmt::Display for AnalyticsHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnalyticsHealth::Idle => f.write_str("idle"),
            AnalyticsHealth::Healthy => f.write_str("healthy"),
            AnalyticsHealth::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

#[derive(Default)]
struct Counters {
    blocks: u64,
    transactions: u64,
    addresses: u64,
    contracts: u64,
    events: u64,
    errors: u64,
    cache_hits: u64,
    cache_misses: u64,
    storage_size: u64,
}

struct IndexerState {
    running: bool,
    start_block: u64,
    cursor: u64,
    /// Number and hash of the newest block stored in sequence.
    last_indexed: Option<(u64, B256)>,
    latest_block: u64,
    /// Block in front of the cursor and how many times it failed.
    retry: Option<(u64, u32)>,
    counters: Counters,
    processing_time: Duration,
    started_at: Option<DateTime<Utc>>,
    last_update: Option<DateTime<Utc>>,
    analytics_health: AnalyticsHealth,
    last_metrics: Option<MetricsResult>,
}

impl IndexerState {
    fn new(start_block: u64) -> Self {
        Self {
            running: false,
            start_block,
            cursor: start_block,
            last_indexed: None,
            latest_block: start_block,
            retry: None,
            counters: Counters::default(),
            processing_time: Duration::ZERO,
            started_at: None,
            last_update: None,
            analytics_health: AnalyticsHealth::Idle,
            last_metrics: None,
        }
    }

    fn indexing_rate(&self) -> f64 {
        let secs = self.processing_time.as_secs_f64();
        if secs > 0.0 {
            self.counters.blocks as f64 / secs
        } else {
            0.0
        }
    }

    fn cache_hit_rate(&self) -> f64 {
        let lookups = self.counters.cache_hits + self.counters.cache_misses;
        if lookups > 0 {
            self.counters.cache_hits as f64 / lookups as f64
        } else {
            0.0
        }
    }

    fn count_stored(&mut self, kind: EntityKind) {
        let counter = match kind {
            EntityKind::Block => &mut self.counters.blocks,
            EntityKind::Transaction => &mut self.counters.transactions,
            EntityKind::Address => &mut self.counters.addresses,
            EntityKind::Contract => &mut self.counters.contracts,
            EntityKind::Event => &mut self.counters.events,
            EntityKind::Checkpoint => return,
        };
        *counter += 1;
    }
}

struct RunningTasks {
    cancel: CancellationToken,
    ingestion: JoinHandle<()>,
    analytics: Option<JoinHandle<()>>,
}

struct Inner {
    config: IndexerConfig,
    source: Arc<dyn BlockSource>,
    storage: Arc<dyn StorageEngine>,
    cache: Arc<dyn CacheEngine>,
    indexers: EntityIndexers,
    processor: Option<Box<dyn DataProcessor>>,
    analytics: Option<Arc<dyn AnalyticsEngine>>,
    state: RwLock<IndexerState>,
    tasks: Mutex<Option<RunningTasks>>,
    batch: Mutex<()>,
}

/// Drives ingestion and analytics and serves the query surface.
///
/// Cloning is cheap and every clone refers to the same indexer.
#[derive(Clone)]
pub struct Indexer {
    inner: Arc<Inner>,
}

/// Transaction and its events, persisted before address and contract
/// effects are applied.
struct StoredTransaction {
    tx: IndexedTransaction,
    outcomes: Vec<EntityOutcome>,
    errors: Vec<String>,
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "analytics task panicked".to_string())
}

impl Indexer {
    /// Builds an indexer with the storage-backed indexers and analytics
    /// engine. The configuration is validated before anything else.
    pub fn new(
        config: IndexerConfig,
        source: Arc<dyn BlockSource>,
        storage: Arc<dyn StorageEngine>,
        cache: Arc<dyn CacheEngine>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let indexers = EntityIndexers::new(&config, storage.clone());
        let analytics = config.analytics.enabled.then(|| {
            Arc::new(StorageAnalyticsEngine::new(&config.analytics, storage.clone()))
                as Arc<dyn AnalyticsEngine>
        });
        Self::from_parts(config, source, storage, cache, indexers, analytics)
    }

    /// Like [`Indexer::new`] with caller supplied indexers and analytics
    /// engine. `analytics` is ignored when analytics is disabled.
    pub fn from_parts(
        config: IndexerConfig,
        source: Arc<dyn BlockSource>,
        storage: Arc<dyn StorageEngine>,
        cache: Arc<dyn CacheEngine>,
        indexers: EntityIndexers,
        analytics: Option<Arc<dyn AnalyticsEngine>>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let processor = config.processor.enabled.then(|| {
            Box::new(PipelineProcessor::from_names(&config.processor.stages))
                as Box<dyn DataProcessor>
        });
        let analytics = analytics.filter(|_| config.analytics.enabled);

        Ok(Self {
            inner: Arc::new(Inner {
                state: RwLock::new(IndexerState::new(config.start_block)),
                config,
                source,
                storage,
                cache,
                indexers,
                processor,
                analytics,
                tasks: Mutex::new(None),
                batch: Mutex::new(()),
            }),
        })
    }

    pub fn config(&self) -> &IndexerConfig {
        &self.inner.config
    }

    fn read_state<R>(&self, f: impl FnOnce(&IndexerState) -> R) -> R {
        let state = self
            .inner
            .state
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&state)
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut IndexerState) -> R) -> R {
        let mut state = self
            .inner
            .state
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut state)
    }

    fn record_error(&self) {
        self.with_state(|s| s.counters.errors += 1);
    }

    // lifecycle

    /// Launches the ingestion loop and, when enabled, the analytics loop.
    /// Returns immediately. A disabled indexer stays stopped.
    pub async fn start(&self, shutdown: CancellationToken) -> Result<(), LifecycleError> {
        let mut tasks = self.inner.tasks.lock().await;
        if let Some(running) = tasks.as_ref() {
            if !running.cancel.is_cancelled() {
                return Err(LifecycleError::AlreadyRunning);
            }
        }
        if let Some(finished) = tasks.take() {
            self.join(finished).await;
        }
        if !self.inner.config.enabled {
            info!("indexing disabled by configuration");
            return Ok(());
        }

        self.load_checkpoint().await;
        let cancel = shutdown.child_token();
        self.with_state(|s| {
            s.running = true;
            s.started_at = Some(Utc::now());
        });

        let ingestion = tokio::spawn(self.clone().ingestion_loop(cancel.clone()));
        let analytics = self
            .inner
            .analytics
            .clone()
            .map(|engine| tokio::spawn(self.clone().analytics_loop(engine, cancel.clone())));
        *tasks = Some(RunningTasks {
            cancel,
            ingestion,
            analytics,
        });

        info!(
            cursor = self.read_state(|s| s.cursor),
            batch_size = self.inner.config.batch_size,
            interval_ms = self.inner.config.indexing_interval_ms,
            "indexer started"
        );
        Ok(())
    }

    /// Signals both loops and waits for them to exit. Stopping a stopped
    /// indexer does nothing.
    pub async fn stop(&self) {
        let Some(tasks) = self.inner.tasks.lock().await.take() else {
            return;
        };
        tasks.cancel.cancel();
        self.join(tasks).await;
        self.with_state(|s| s.running = false);
        info!("indexer stopped");
    }

    async fn join(&self, tasks: RunningTasks) {
        if let Err(e) = tasks.ingestion.await {
            error!(error = %e, "ingestion task ended abnormally");
        }
        if let Some(analytics) = tasks.analytics {
            if let Err(e) = analytics.await {
                error!(error = %e, "analytics task ended abnormally");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.read_state(|s| s.running)
    }

    async fn load_checkpoint(&self) {
        let key = EntityKey::Checkpoint(INGESTION_CHECKPOINT.to_string());
        match self.inner.storage.retrieve_as::<Checkpoint>(&key).await {
            Ok(checkpoint) => {
                let resumed = self.with_state(|s| {
                    if checkpoint.block_number > s.cursor {
                        s.cursor = checkpoint.block_number;
                        s.last_indexed = Some((checkpoint.block_number, checkpoint.block_hash));
                    }
                    s.cursor
                });
                info!(cursor = resumed, "resuming from checkpoint");
            }
            Err(e) if e.is_not_found() => debug!("no checkpoint stored"),
            Err(e) => warn!(error = %e, "failed to load checkpoint"),
        }
    }

    async fn ingestion_loop(self, cancel: CancellationToken) {
        let mut ticker = interval(self.inner.config.indexing_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let report = self.run_batch(&cancel).await;
                    if !report.failures.is_empty() {
                        error!(
                            start = report.start,
                            failures = report.failures.len(),
                            cursor = report.cursor,
                            "batch finished with errors"
                        );
                    }
                }
            }
        }
        self.with_state(|s| s.running = false);
        debug!("ingestion loop exited");
    }

    async fn analytics_loop(self, engine: Arc<dyn AnalyticsEngine>, cancel: CancellationToken) {
        let period = self.inner.config.aggregation_interval();
        let window =
            chrono::Duration::milliseconds(self.inner.config.analytics.aggregation_interval_ms as i64);
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let range = TimeRange::trailing(Utc::now(), window);
                    match AssertUnwindSafe(engine.get_metrics(range)).catch_unwind().await {
                        Ok(Ok(metrics)) => self.with_state(|s| {
                            s.analytics_health = AnalyticsHealth::Healthy;
                            s.last_metrics = Some(metrics);
                        }),
                        Ok(Err(e)) => {
                            warn!(error = %e, "analytics aggregation failed");
                            self.record_error();
                        }
                        Err(panic) => {
                            let reason = panic_message(panic.as_ref());
                            error!(reason = %reason, "analytics task panicked");
                            self.with_state(|s| {
                                s.analytics_health = AnalyticsHealth::Failed(reason);
                                s.counters.errors += 1;
                            });
                            break;
                        }
                    }
                }
            }
        }
        debug!("analytics loop exited");
    }

    // ingestion

    /// Runs one ingestion tick: up to `batch_size` blocks after the cursor.
    pub async fn index_next_batch(&self) -> BatchReport {
        self.run_batch(&CancellationToken::new()).await
    }

    async fn run_batch(&self, cancel: &CancellationToken) -> BatchReport {
        let _batch = self.inner.batch.lock().await;
        let started = Instant::now();
        self.refresh_latest_block().await;

        let cursor = self.read_state(|s| s.cursor);
        let mut report = BatchReport {
            start: cursor + 1,
            end: cursor + self.inner.config.batch_size,
            indexed: Vec::new(),
            failures: Vec::new(),
            cursor,
        };
        // set once a block in front of the cursor has to be retried
        let mut frozen = false;
        // newest block fetched and accepted in this batch, stored or not
        let mut previous = self.read_state(|s| s.last_indexed);

        for number in report.start..=report.end {
            if cancel.is_cancelled() {
                debug!(number, "batch cancelled");
                break;
            }
            let block = match self.inner.source.block(number).await {
                Ok(Some(block)) => block,
                Ok(None) => {
                    debug!(number, "block not available yet");
                    break;
                }
                Err(e) => {
                    warn!(number, error = %e, "failed to fetch block");
                    self.record_error();
                    report.failures.push(BlockFailure {
                        number,
                        error: e.to_string(),
                        retriable: true,
                    });
                    break;
                }
            };

            let result = self.process_block(&block, previous).await;
            if result.is_ok() {
                previous = Some((block.number, block.hash));
            }
            match result {
                Ok(block_report) if block_report.header_stored() => {
                    if !frozen {
                        self.advance_cursor(block.number, block.hash).await;
                    }
                    debug!(
                        number,
                        hash = %block.hash,
                        entities = block_report.outcomes.len(),
                        "indexed block"
                    );
                    report.indexed.push(block_report);
                }
                Ok(block_report) => {
                    let error = block_report
                        .header
                        .as_ref()
                        .and_then(|h| h.storage_error.clone())
                        .unwrap_or_default();
                    frozen = self.settle_failure(number, true, frozen);
                    report.failures.push(BlockFailure {
                        number,
                        error,
                        retriable: true,
                    });
                }
                Err(e) => {
                    warn!(number, error = %e, "failed to index block");
                    self.record_error();
                    frozen = self.settle_failure(number, e.is_retriable(), frozen);
                    report.failures.push(BlockFailure {
                        number,
                        error: e.to_string(),
                        retriable: e.is_retriable(),
                    });
                }
            }
        }

        self.refresh_storage_size().await;
        let elapsed = started.elapsed();
        report.cursor = self.with_state(|s| {
            s.processing_time += elapsed;
            s.last_update = Some(Utc::now());
            s.cursor
        });
        report
    }

    /// Decides what a failed block in front of the cursor does to the
    /// cursor. Returns whether the cursor stays frozen.
    fn settle_failure(&self, number: u64, retriable: bool, frozen: bool) -> bool {
        if frozen {
            return true;
        }
        let max_attempts = self.inner.config.retry.max_block_attempts;
        self.with_state(|s| {
            if !retriable {
                s.cursor = s.cursor.max(number);
                s.retry = None;
                return false;
            }
            let attempts = match s.retry {
                Some((pending, attempts)) if pending == number => attempts + 1,
                _ => 1,
            };
            if attempts >= max_attempts {
                warn!(number, attempts, "giving up on block");
                s.cursor = s.cursor.max(number);
                s.retry = None;
                false
            } else {
                s.retry = Some((number, attempts));
                true
            }
        })
    }

    async fn advance_cursor(&self, number: u64, hash: B256) {
        let checkpoint = self.with_state(|s| {
            if number < s.cursor {
                return None;
            }
            s.cursor = number;
            s.last_indexed = Some((number, hash));
            s.last_update = Some(Utc::now());
            if s.retry.map_or(false, |(pending, _)| pending <= number) {
                s.retry = None;
            }
            Some(Checkpoint {
                id: INGESTION_CHECKPOINT.to_string(),
                block_number: number,
                block_hash: hash,
                updated_at: Utc::now(),
            })
        });

        if let Some(checkpoint) = checkpoint {
            if let Err(e) = self.inner.storage.store(&checkpoint.into_entity()).await {
                warn!(number, error = %e, "failed to persist checkpoint");
                self.record_error();
            }
        }
    }

    async fn refresh_latest_block(&self) {
        match self.inner.source.latest_block_number().await {
            Ok(latest) => self.with_state(|s| s.latest_block = s.latest_block.max(latest)),
            Err(e) => {
                warn!(error = %e, "failed to read latest block number");
                self.record_error();
            }
        }
    }

    async fn refresh_storage_size(&self) {
        match self.inner.storage.size_bytes().await {
            Ok(size) => self.with_state(|s| s.counters.storage_size = size),
            Err(e) => warn!(error = %e, "failed to read storage size"),
        }
    }

    /// Indexes one block with its transactions and the entities they touch.
    /// Only validation failures of the block itself are returned; storage
    /// and cache failures are reported in the outcomes.
    pub async fn index_block(&self, block: &RawBlock) -> Result<BlockReport, IndexError> {
        let started = Instant::now();
        let parent = self.read_state(|s| s.last_indexed);
        let result = self.process_block(block, parent).await;
        self.with_state(|s| s.processing_time += started.elapsed());

        let report = result.map_err(|e| {
            warn!(number = block.number, error = %e, "failed to index block");
            self.record_error();
            e
        })?;
        if report.header_stored() {
            self.advance_cursor(block.number, block.hash).await;
        }
        Ok(report)
    }

    /// `parent` is the number and hash of the block this one must extend
    /// when it directly follows it.
    async fn process_block(
        &self,
        block: &RawBlock,
        parent: Option<(u64, B256)>,
    ) -> Result<BlockReport, IndexError> {
        if let Some((number, hash)) = parent {
            if block.number == number + 1 && block.parent_hash != hash {
                return Err(ValidationError::BrokenParentChain {
                    number: block.number,
                    expected: hash,
                    found: block.parent_hash,
                }
                .into());
            }
        }

        let mut report = BlockReport::new(block);
        match self.inner.indexers.blocks.index_block(block).await {
            Ok(indexed) => {
                let indexed = self.process_entity(indexed)?;
                report.header = Some(self.persist(indexed.into_entity()).await);
            }
            Err(IndexError::Disabled(_)) => {}
            Err(e) => return Err(e),
        }

        let config = &self.inner.config;
        if !(config.block.index_transactions && config.transaction.enabled) {
            return Ok(report);
        }

        let pending: Vec<_> = block
            .transactions
            .iter()
            .map(|raw| self.store_transaction(raw, block))
            .collect();
        let stored: Vec<_> = stream::iter(pending)
            .buffered(config.max_concurrent_workers)
            .collect()
            .await;

        // contract and address effects read back what earlier transactions
        // wrote, so they are applied in block order
        for (raw, result) in block.transactions.iter().zip(stored) {
            match result {
                Ok(stored) => {
                    report.outcomes.extend(stored.outcomes);
                    report.errors.extend(stored.errors);
                    let (outcomes, errors) = self.apply_effects(&stored.tx).await;
                    report.outcomes.extend(outcomes);
                    report.errors.extend(errors);
                }
                Err(e) => {
                    warn!(number = block.number, tx = %raw.hash, error = %e, "transaction skipped");
                    self.record_error();
                    report.errors.push(format!("transaction {}: {}", raw.hash, e));
                }
            }
        }
        Ok(report)
    }

    /// Indexes one transaction with the addresses and contracts it touches.
    /// A receipt is derived from the block when the transaction has none.
    pub async fn index_transaction(
        &self,
        tx: &RawTransaction,
        block: &RawBlock,
    ) -> Result<TransactionReport, IndexError> {
        let stored = self.store_transaction(tx, block).await?;
        let mut report = TransactionReport {
            hash: tx.hash,
            outcomes: stored.outcomes,
            errors: stored.errors,
        };
        let (outcomes, errors) = self.apply_effects(&stored.tx).await;
        report.outcomes.extend(outcomes);
        report.errors.extend(errors);
        Ok(report)
    }

    async fn store_transaction(
        &self,
        raw: &RawTransaction,
        block: &RawBlock,
    ) -> Result<StoredTransaction, IndexError> {
        let receipt = raw.receipt_or_derived(block);
        let tx = self
            .inner
            .indexers
            .transactions
            .index_transaction(raw, &receipt, block)
            .await?;
        let tx = self.process_entity(tx)?;

        let mut stored = StoredTransaction {
            outcomes: vec![self.persist(tx.clone().into_entity()).await],
            errors: Vec::new(),
            tx,
        };
        if !self.inner.config.event.enabled {
            return Ok(stored);
        }

        for log in &receipt.logs {
            let event = match self.inner.indexers.events.index_event(log, &stored.tx).await {
                Ok(Some(event)) => self.process_entity(event).map_err(IndexError::from),
                Ok(None) => continue,
                Err(e) => Err(e),
            };
            match event {
                Ok(event) => stored.outcomes.push(self.persist(event.into_entity()).await),
                Err(e) => {
                    warn!(tx = %raw.hash, log_index = log.log_index, error = %e, "event skipped");
                    self.record_error();
                    stored.errors.push(format!("event {}: {}", log.log_index, e));
                }
            }
        }
        Ok(stored)
    }

    /// Contract creation and interaction, then sender and recipient.
    async fn apply_effects(&self, tx: &IndexedTransaction) -> (Vec<EntityOutcome>, Vec<String>) {
        let mut outcomes = Vec::new();
        let mut errors = Vec::new();
        let mut contract_kinds: HashMap<Address, ContractKind> = HashMap::new();

        if self.inner.config.contract.enabled {
            let contracts = &self.inner.indexers.contracts;
            for result in [
                contracts.index_contract(tx).await,
                contracts.record_interaction(tx).await,
            ] {
                let result = result.and_then(|contract| {
                    contract
                        .map(|c| self.process_entity(c))
                        .transpose()
                        .map_err(IndexError::from)
                });
                match result {
                    Ok(Some(contract)) => {
                        contract_kinds.insert(contract.address, contract.kind);
                        outcomes.push(self.persist(contract.into_entity()).await);
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!(tx = %tx.hash, error = %e, "contract skipped");
                        self.record_error();
                        errors.push(format!("contract: {}", e));
                    }
                }
            }
        }

        if self.inner.config.address.enabled {
            for address in tx.touched_addresses() {
                let activity = AddressActivity {
                    transaction: tx,
                    contract_kind: contract_kinds.get(&address).copied(),
                };
                let result = self
                    .inner
                    .indexers
                    .addresses
                    .index_address(address, Some(activity))
                    .await
                    .and_then(|a| self.process_entity(a).map_err(IndexError::from));
                match result {
                    Ok(entity) => outcomes.push(self.persist(entity.into_entity()).await),
                    Err(e) => {
                        warn!(tx = %tx.hash, %address, error = %e, "address skipped");
                        self.record_error();
                        errors.push(format!("address {}: {}", address, e));
                    }
                }
            }
        }
        (outcomes, errors)
    }

    /// Upserts one address without applying any activity.
    pub async fn index_address(&self, address: Address) -> Result<EntityOutcome, IndexError> {
        let entity = self.inner.indexers.addresses.index_address(address, None).await?;
        let entity = self.process_entity(entity)?;
        Ok(self.persist(entity.into_entity()).await)
    }

    pub async fn update_balance(
        &self,
        address: Address,
        balance: U256,
    ) -> Result<EntityOutcome, IndexError> {
        let entity = self
            .inner
            .indexers
            .addresses
            .update_balance(address, balance)
            .await?;
        let entity = self.process_entity(entity)?;
        Ok(self.persist(entity.into_entity()).await)
    }

    /// Attaches verified source code to an indexed contract.
    pub async fn verify_contract(
        &self,
        address: Address,
        source_code: &str,
    ) -> Result<IndexedContract, IndexError> {
        let contract = self
            .inner
            .indexers
            .contracts
            .verify_contract(address, source_code)
            .await?;
        let contract = self.process_entity(contract)?;
        let entity = contract.clone().into_entity();
        self.inner.storage.store(&entity).await?;
        if let Err(e) = self.cache_entity(&entity).await {
            warn!(%address, error = %e, "failed to cache verified contract");
            self.record_error();
        }
        Ok(contract)
    }

    fn process_entity<T: IndexedEntity>(&self, value: T) -> Result<T, ValidationError> {
        let Some(processor) = &self.inner.processor else {
            return Ok(value);
        };
        let processed = processor.process(value.clone().into_entity())?;
        Ok(T::from_entity(processed).unwrap_or(value))
    }

    async fn cache_entity(&self, entity: &Entity) -> Result<(), CacheError> {
        let bytes = serde_json::to_vec(&entity.payload()?)?;
        self.inner
            .cache
            .set(&entity.key().cache_key(), bytes, self.inner.config.cache_ttl())
            .await
    }

    /// Stores the entity, then caches it. Failures are logged, counted and
    /// reported in the outcome. Only the first store of a key is counted
    /// in the statistics.
    async fn persist(&self, entity: Entity) -> EntityOutcome {
        let key = entity.key();
        let kind = entity.kind();
        let mut outcome = EntityOutcome {
            key: key.to_string(),
            kind,
            indexed: false,
            storage_error: None,
            cache_error: None,
        };

        // statistics count entities, not writes
        let fresh = match self.inner.storage.exists(&key).await {
            Ok(found) => !found,
            Err(e) => {
                debug!(%key, error = %e, "existence check failed, entity left uncounted");
                false
            }
        };

        if let Err(e) = self.inner.storage.store(&entity).await {
            warn!(%key, error = %e, "failed to store entity");
            self.record_error();
            outcome.storage_error = Some(e.to_string());
            return outcome;
        }
        outcome.indexed = true;
        if fresh {
            self.with_state(|s| s.count_stored(kind));
        }

        if let Err(e) = self.cache_entity(&entity).await {
            warn!(%key, error = %e, "failed to cache entity");
            self.record_error();
            outcome.cache_error = Some(e.to_string());
        }
        outcome
    }

    // queries

    /// Cache-first read. Misses and cache failures fall back to `load`.
    async fn cached<T, F>(&self, key: EntityKey, load: F) -> Result<T, QueryError>
    where
        T: IndexedEntity,
        F: Future<Output = Result<T, IndexError>>,
    {
        let cache_key = key.cache_key();
        match self.inner.cache.get_json::<T>(&cache_key).await {
            Ok(Some(value)) => {
                self.with_state(|s| s.counters.cache_hits += 1);
                return Ok(value);
            }
            Ok(None) => self.with_state(|s| s.counters.cache_misses += 1),
            Err(e) => {
                warn!(key = %cache_key, error = %e, "cache read failed");
                self.with_state(|s| {
                    s.counters.cache_misses += 1;
                    s.counters.errors += 1;
                });
            }
        }

        let value = load.await?;
        if self.inner.config.cache.backfill_on_miss {
            if let Err(e) = self
                .inner
                .cache
                .set_json(&cache_key, &value, self.inner.config.cache_ttl())
                .await
            {
                warn!(key = %cache_key, error = %e, "cache backfill failed");
                self.record_error();
            }
        }
        Ok(value)
    }

    pub async fn get_block(&self, number: u64) -> Result<IndexedBlock, QueryError> {
        self.cached(
            EntityKey::Block(number),
            self.inner.indexers.blocks.get_block(number),
        )
        .await
    }

    pub async fn get_block_by_hash(&self, hash: B256) -> Result<IndexedBlock, QueryError> {
        Ok(self.inner.indexers.blocks.get_block_by_hash(hash).await?)
    }

    pub async fn get_transaction(&self, hash: B256) -> Result<IndexedTransaction, QueryError> {
        self.cached(
            EntityKey::Transaction(hash),
            self.inner.indexers.transactions.get_transaction(hash),
        )
        .await
    }

    /// Newest first, read from storage.
    pub async fn get_transactions_by_address(
        &self,
        address: Address,
        limit: usize,
    ) -> Result<Vec<IndexedTransaction>, QueryError> {
        Ok(self
            .inner
            .indexers
            .transactions
            .get_transactions_by_address(address, limit)
            .await?)
    }

    pub async fn get_address(&self, address: Address) -> Result<IndexedAddress, QueryError> {
        self.cached(
            EntityKey::Address(address),
            self.inner.indexers.addresses.get_address(address),
        )
        .await
    }

    pub async fn get_contract(&self, address: Address) -> Result<IndexedContract, QueryError> {
        self.cached(
            EntityKey::Contract(address),
            self.inner.indexers.contracts.get_contract(address),
        )
        .await
    }

    pub async fn get_events(
        &self,
        filter: &EventFilter,
        limit: usize,
    ) -> Result<Vec<IndexedEvent>, QueryError> {
        Ok(self.inner.indexers.events.get_events(filter, limit).await?)
    }

    pub async fn get_events_by_contract(
        &self,
        address: Address,
        limit: usize,
    ) -> Result<Vec<IndexedEvent>, QueryError> {
        Ok(self
            .inner
            .indexers
            .events
            .get_events_by_contract(address, limit)
            .await?)
    }

    pub async fn get_analytics(&self, range: TimeRange) -> Result<MetricsResult, QueryError> {
        let engine = self
            .inner
            .analytics
            .as_ref()
            .ok_or(QueryError::AnalyticsDisabled)?;
        Ok(engine.get_metrics(range).await?)
    }

    pub async fn generate_report(&self, report_type: ReportType) -> Result<Report, QueryError> {
        let engine = self
            .inner
            .analytics
            .as_ref()
            .ok_or(QueryError::AnalyticsDisabled)?;
        Ok(engine.generate_report(report_type).await?)
    }

    // snapshots

    pub fn get_indexing_progress(&self) -> IndexingProgress {
        self.read_state(|s| {
            let latest_block = s.latest_block.max(s.cursor);
            let blocks_processed = s.cursor - s.start_block;
            let blocks_remaining = latest_block - s.cursor;
            let span = latest_block - s.start_block;
            let progress_percent = if span > 0 {
                blocks_processed as f64 / span as f64 * 100.0
            } else {
                0.0
            };
            let rate = s.indexing_rate();

            IndexingProgress {
                start_block: s.start_block,
                current_block: s.cursor,
                latest_block,
                blocks_processed,
                blocks_remaining,
                progress_percent,
                eta_secs: (rate > 0.0).then(|| blocks_remaining as f64 / rate),
                started_at: s.started_at,
                last_update: s.last_update,
            }
        })
    }

    pub fn get_indexing_statistics(&self) -> IndexingStatistics {
        self.read_state(|s| IndexingStatistics {
            total_blocks: s.counters.blocks,
            total_transactions: s.counters.transactions,
            total_addresses: s.counters.addresses,
            total_contracts: s.counters.contracts,
            total_events: s.counters.events,
            error_count: s.counters.errors,
            cache_hits: s.counters.cache_hits,
            cache_misses: s.counters.cache_misses,
            cache_hit_rate: s.cache_hit_rate(),
            indexing_rate: s.indexing_rate(),
            storage_size: s.counters.storage_size,
        })
    }

    pub fn analytics_health(&self) -> AnalyticsHealth {
        self.read_state(|s| s.analytics_health.clone())
    }

    /// Metrics from the most recent analytics tick.
    pub fn last_metrics(&self) -> Option<MetricsResult> {
        self.read_state(|s| s.last_metrics.clone())
    }

    /// Flattened counters and flags for dashboards.
    pub fn get_metrics(&self) -> BTreeMap<String, Value> {
        let progress = self.get_indexing_progress();
        let stats = self.get_indexing_statistics();
        let config = &self.inner.config;
        let (running, health) = self.read_state(|s| (s.running, s.analytics_health.to_string()));

        let metrics = [
            ("is_running", json!(running)),
            ("current_block", json!(progress.current_block)),
            ("latest_block", json!(progress.latest_block)),
            ("blocks_processed", json!(progress.blocks_processed)),
            ("progress_percent", json!(progress.progress_percent)),
            ("last_update", json!(progress.last_update)),
            ("indexing_rate", json!(stats.indexing_rate)),
            ("total_blocks", json!(stats.total_blocks)),
            ("total_transactions", json!(stats.total_transactions)),
            ("total_addresses", json!(stats.total_addresses)),
            ("total_contracts", json!(stats.total_contracts)),
            ("total_events", json!(stats.total_events)),
            ("error_count", json!(stats.error_count)),
            ("cache_hit_rate", json!(stats.cache_hit_rate)),
            ("storage_size", json!(stats.storage_size)),
            ("storage_backend", json!(self.inner.storage.backend())),
            ("cache_backend", json!(self.inner.cache.backend())),
            ("block_indexer_enabled", json!(config.block.enabled)),
            ("transaction_indexer_enabled", json!(config.transaction.enabled)),
            ("address_indexer_enabled", json!(config.address.enabled)),
            ("contract_indexer_enabled", json!(config.contract.enabled)),
            ("event_indexer_enabled", json!(config.event.enabled)),
            ("analytics_enabled", json!(self.inner.analytics.is_some())),
            ("analytics_health", json!(health)),
        ];
        metrics
            .into_iter()
            .map(|(name, value)| (name.to_string(), value))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{fixtures, MemoryBlockSource};
    use db::{EvictionPolicy, MemoryCache, MemoryStorage, NoopCache};
    use pretty_assertions::assert_eq;

    fn indexer_with(config: IndexerConfig, blocks: Vec<RawBlock>) -> Indexer {
        Indexer::new(
            config,
            Arc::new(MemoryBlockSource::from_blocks(blocks)),
            Arc::new(MemoryStorage::new()),
            Arc::new(MemoryCache::new(100, EvictionPolicy::Lru)),
        )
        .unwrap()
    }

    fn config(start_block: u64, batch_size: u64) -> IndexerConfig {
        IndexerConfig {
            start_block,
            batch_size,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn invalid_config_is_rejected_before_construction() {
        let result = Indexer::new(
            IndexerConfig {
                batch_size: 0,
                ..Default::default()
            },
            Arc::new(MemoryBlockSource::new()),
            Arc::new(MemoryStorage::new()),
            Arc::new(NoopCache),
        );
        assert!(matches!(result, Err(ConfigError::InvalidBatchSize)));
    }

    #[tokio::test]
    async fn retriable_failures_freeze_then_skip() {
        let indexer = indexer_with(config(0, 3), vec![]);
        assert!(indexer.settle_failure(1, true, false));
        assert!(indexer.settle_failure(1, true, false));
        assert_eq!(indexer.read_state(|s| s.cursor), 0);
        // third attempt exhausts the default budget
        assert!(!indexer.settle_failure(1, true, false));
        assert_eq!(indexer.read_state(|s| s.cursor), 1);

        assert!(!indexer.settle_failure(2, false, false));
        assert_eq!(indexer.read_state(|s| s.cursor), 2);
        assert!(indexer.settle_failure(9, false, true));
        assert_eq!(indexer.read_state(|s| s.cursor), 2);
    }

    #[tokio::test]
    async fn batch_stops_at_missing_block() {
        let blocks = (1..=3).map(fixtures::block).collect();
        let indexer = indexer_with(config(0, 10), blocks);
        let report = indexer.index_next_batch().await;
        assert_eq!(report.start, 1);
        assert_eq!(report.end, 10);
        assert_eq!(report.indexed.len(), 3);
        assert!(report.failures.is_empty());
        assert_eq!(report.cursor, 3);

        let progress = indexer.get_indexing_progress();
        assert_eq!(progress.blocks_processed, 3);
        assert_eq!(progress.latest_block, 3);
        assert_eq!(progress.progress_percent, 100.0);
    }

    #[tokio::test]
    async fn checkpoint_is_persisted_and_resumed() {
        let blocks: Vec<_> = (1..=4).map(fixtures::block).collect();
        let storage = Arc::new(MemoryStorage::new());
        let source = Arc::new(MemoryBlockSource::from_blocks(blocks));
        let first = Indexer::new(
            config(0, 2),
            source.clone(),
            storage.clone(),
            Arc::new(NoopCache),
        )
        .unwrap();
        first.index_next_batch().await;

        let checkpoint = storage
            .retrieve_as::<Checkpoint>(&EntityKey::Checkpoint(INGESTION_CHECKPOINT.to_string()))
            .await
            .unwrap();
        assert_eq!(checkpoint.block_number, 2);
        assert_eq!(checkpoint.block_hash, fixtures::block_hash(2));

        let second = Indexer::new(
            IndexerConfig {
                indexing_interval_ms: 60_000,
                ..config(0, 2)
            },
            source,
            storage,
            Arc::new(NoopCache),
        )
        .unwrap();
        second.start(CancellationToken::new()).await.unwrap();
        assert_eq!(second.get_indexing_progress().current_block, 2);
        second.stop().await;
    }

    #[tokio::test]
    async fn metrics_carry_flags_and_counters() {
        let indexer = indexer_with(config(0, 1), vec![fixtures::block(1)]);
        indexer.index_next_batch().await;
        let metrics = indexer.get_metrics();
        assert_eq!(metrics["is_running"], json!(false));
        assert_eq!(metrics["current_block"], json!(1));
        assert_eq!(metrics["total_blocks"], json!(1));
        assert_eq!(metrics["analytics_enabled"], json!(true));
        assert_eq!(metrics["analytics_health"], json!("idle"));
        assert_eq!(metrics["cache_backend"], json!("in-memory"));
    }
}
