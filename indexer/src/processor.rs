use alloy::primitives::U256;
use db::{AddressKind, Entity, EntityKind, IndexedEvent, ToHexString};
use thiserror::Error;
use tracing::warn;

use crate::{
    decode::{decode_event, decode_method},
    error::ValidationError,
    source::RawLog,
};

/// Addresses holding at least this much wei are tagged `whale`.
const WHALE_BALANCE_WEI: u128 = 1_000 * 10u128.pow(18);
/// Addresses with at least this many transactions are tagged `active`.
const ACTIVE_TRANSACTION_COUNT: u64 = 1_000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnrichmentError {
    #[error("{kind} {key}: {reason}")]
    Unresolvable {
        kind: EntityKind,
        key: String,
        reason: &'static str,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    Validate,
    Enrich,
    Normalize,
}

impl Stage {
    pub fn parse(stage: &str) -> Option<Self> {
        match stage {
            "validate" => Some(Stage::Validate),
            "enrich" => Some(Stage::Enrich),
            "normalize" => Some(Stage::Normalize),
            _ => None,
        }
    }
}

/// Side-effect free checks and rewrites applied to entities before they are
/// stored.
pub trait DataProcessor: Send + Sync {
    /// Runs the configured stages. Only validation failures are returned;
    /// enrichment failures are logged and the entity passes unenriched.
    fn process(&self, entity: Entity) -> Result<Entity, ValidationError>;

    fn enrich(&self, entity: &Entity) -> Result<Entity, EnrichmentError>;

    fn validate(&self, entity: &Entity) -> Result<(), ValidationError>;
}

pub struct PipelineProcessor {
    stages: Vec<Stage>,
}

impl PipelineProcessor {
    pub fn new(stages: Vec<Stage>) -> Self {
        Self { stages }
    }

    /// Unknown names are skipped; configuration validation rejects them
    /// before this is reached.
    pub fn from_names(names: &[String]) -> Self {
        Self::new(names.iter().filter_map(|name| Stage::parse(name)).collect())
    }
}

fn as_log(event: &IndexedEvent) -> RawLog {
    RawLog {
        address: event.address,
        topics: event.topics.clone(),
        data: event.data.clone(),
        log_index: event.log_index,
        transaction_hash: event.transaction_hash,
        transaction_index: event.transaction_index,
    }
}

fn normalize(mut entity: Entity) -> Entity {
    match &mut entity {
        Entity::Address(address) => {
            address.tags.sort();
            address.tags.dedup();
            address.token_holdings.sort_by_key(|h| h.token_address);
            address
                .nft_holdings
                .sort_by_key(|h| (h.contract_address, h.token_id));
        }
        Entity::Contract(contract) => {
            contract.name = contract
                .name
                .take()
                .map(|n| n.trim().to_string())
                .filter(|n| !n.is_empty());
            contract.symbol = contract
                .symbol
                .take()
                .map(|s| s.trim().to_uppercase())
                .filter(|s| !s.is_empty());
        }
        Entity::Transaction(tx) => {
            tx.token_transfers.sort_by_key(|t| t.log_index);
            tx.events.sort_by_key(|e| e.log_index);
        }
        Entity::Block(_) | Entity::Event(_) | Entity::Checkpoint(_) => {}
    }
    entity
}

impl DataProcessor for PipelineProcessor {
    fn process(&self, entity: Entity) -> Result<Entity, ValidationError> {
        let mut entity = entity;
        for stage in &self.stages {
            entity = match stage {
                Stage::Validate => {
                    self.validate(&entity)?;
                    entity
                }
                Stage::Enrich => match self.enrich(&entity) {
                    Ok(enriched) => enriched,
                    Err(e) => {
                        warn!(error = %e, "enrichment failed, keeping entity as is");
                        entity
                    }
                },
                Stage::Normalize => normalize(entity),
            };
        }
        Ok(entity)
    }

    fn enrich(&self, entity: &Entity) -> Result<Entity, EnrichmentError> {
        let mut enriched = entity.clone();
        match &mut enriched {
            Entity::Transaction(tx) => {
                if tx.method.is_none() && !tx.input.is_empty() {
                    tx.method = decode_method(&tx.input);
                    if tx.method.is_none() && tx.to.is_some() {
                        return Err(EnrichmentError::Unresolvable {
                            kind: EntityKind::Transaction,
                            key: tx.hash.to_hex_string(),
                            reason: "call data shorter than a selector",
                        });
                    }
                }
                for event in tx.events.iter_mut().filter(|e| e.name.is_none()) {
                    if let Some((name, fields)) = decode_event(&as_log(event)) {
                        event.name = Some(name);
                        event.decoded = fields;
                    }
                }
            }
            Entity::Event(event) => {
                if event.name.is_none() {
                    if let Some((name, fields)) = decode_event(&as_log(event)) {
                        event.name = Some(name);
                        event.decoded = fields;
                    }
                }
            }
            Entity::Address(address) => {
                let mut tags = Vec::new();
                match address.kind {
                    AddressKind::Contract => tags.push("contract"),
                    AddressKind::Multisig => tags.push("multisig"),
                    AddressKind::ExternallyOwned => {}
                }
                if address.balance >= U256::from(WHALE_BALANCE_WEI) {
                    tags.push("whale");
                }
                if address.transaction_count >= ACTIVE_TRANSACTION_COUNT {
                    tags.push("active");
                }
                for tag in tags {
                    if !address.tags.iter().any(|t| t == tag) {
                        address.tags.push(tag.to_string());
                    }
                }
            }
            Entity::Block(_) | Entity::Contract(_) | Entity::Checkpoint(_) => {}
        }
        Ok(enriched)
    }

    fn validate(&self, entity: &Entity) -> Result<(), ValidationError> {
        match entity {
            Entity::Block(block) => {
                if block.hash.is_zero() {
                    return Err(ValidationError::ZeroHash(EntityKind::Block));
                }
                if block.gas_used > block.gas_limit {
                    return Err(ValidationError::GasUsedAboveLimit {
                        kind: EntityKind::Block,
                        gas_used: block.gas_used,
                        gas_limit: block.gas_limit,
                    });
                }
            }
            Entity::Transaction(tx) => {
                if tx.hash.is_zero() {
                    return Err(ValidationError::ZeroHash(EntityKind::Transaction));
                }
                if tx.gas_used > tx.gas_limit {
                    return Err(ValidationError::GasUsedAboveLimit {
                        kind: EntityKind::Transaction,
                        gas_used: tx.gas_used,
                        gas_limit: tx.gas_limit,
                    });
                }
                if tx.contract_created.is_some() && tx.to.is_some() {
                    return Err(ValidationError::CreationWithRecipient(tx.hash));
                }
            }
            Entity::Address(address) => {
                if address.last_activity < address.first_seen {
                    return Err(ValidationError::ActivityBeforeFirstSeen(address.address));
                }
            }
            Entity::Contract(contract) => {
                if contract.creation_tx_hash.is_zero() {
                    return Err(ValidationError::ZeroHash(EntityKind::Contract));
                }
            }
            Entity::Event(event) => {
                if event.transaction_hash.is_zero() {
                    return Err(ValidationError::ZeroHash(EntityKind::Event));
                }
                if event.topics.len() > 4 {
                    return Err(ValidationError::MalformedLog {
                        log_index: event.log_index,
                        reason: format!("{} topics", event.topics.len()),
                    });
                }
            }
            Entity::Checkpoint(_) => {}
        }
        Ok(())
    }
}
