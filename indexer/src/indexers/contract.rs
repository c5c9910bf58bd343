use alloy::primitives::Address;
use async_trait::async_trait;
use chrono::Utc;
use db::{EntityKey, IndexedContract, IndexedTransaction, StorageEngine, StorageEngineExt};
use std::sync::Arc;
use tracing::debug;

use super::ContractIndexer;
use crate::{
    config::ContractIndexerConfig,
    decode::{contract_name_from_source, detect_contract_kind},
    error::{IndexError, ValidationError},
};

pub struct StorageContractIndexer {
    config: ContractIndexerConfig,
    storage: Arc<dyn StorageEngine>,
}

impl StorageContractIndexer {
    pub fn new(config: ContractIndexerConfig, storage: Arc<dyn StorageEngine>) -> Self {
        Self { config, storage }
    }

    async fn find(&self, address: Address) -> Result<Option<IndexedContract>, IndexError> {
        match self.get_contract(address).await {
            Ok(contract) => Ok(Some(contract)),
            Err(IndexError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn allowed(&self, kind: &str) -> bool {
        self.config.contract_types.is_empty()
            || self.config.contract_types.iter().any(|t| t == kind)
    }
}

#[async_trait]
impl ContractIndexer for StorageContractIndexer {
    async fn index_contract(
        &self,
        tx: &IndexedTransaction,
    ) -> Result<Option<IndexedContract>, IndexError> {
        if !self.config.enabled || !self.config.index_creation {
            return Ok(None);
        }
        let Some(address) = tx.contract_created else {
            return Ok(None);
        };

        let kind = detect_contract_kind(&tx.input);
        if !self.allowed(kind.as_str()) {
            debug!(%address, kind = kind.as_str(), "contract type not indexed");
            return Ok(None);
        }

        // re-indexing a creation keeps what was learned since
        let existing = self.find(address).await?;
        let (name, source_code, is_verified, interaction_count, last_tx_position) = match existing {
            Some(c) => (c.name, c.source_code, c.is_verified, c.interaction_count, c.last_tx_position),
            None => (None, None, false, 0, None),
        };

        Ok(Some(IndexedContract {
            address,
            creator: tx.from,
            creation_tx_hash: tx.hash,
            creation_block: tx.block_number,
            creation_timestamp: tx.timestamp,
            kind,
            name,
            symbol: None,
            abi: None,
            source_code,
            is_verified,
            interaction_count,
            last_tx_position,
            indexed_at: Utc::now(),
        }))
    }

    async fn record_interaction(
        &self,
        tx: &IndexedTransaction,
    ) -> Result<Option<IndexedContract>, IndexError> {
        if !self.config.enabled || !self.config.index_interactions {
            return Ok(None);
        }
        let Some(to) = tx.to else {
            return Ok(None);
        };
        let Some(mut contract) = self.find(to).await? else {
            return Ok(None);
        };

        let position = tx.position();
        if contract.last_tx_position.map_or(false, |seen| seen >= position) {
            return Ok(None);
        }
        contract.interaction_count += 1;
        contract.last_tx_position = Some(position);
        contract.indexed_at = Utc::now();
        Ok(Some(contract))
    }

    async fn verify_contract(
        &self,
        address: Address,
        source_code: &str,
    ) -> Result<IndexedContract, IndexError> {
        if !self.config.verification_enabled {
            return Err(IndexError::Disabled("contract verification"));
        }
        if source_code.trim().is_empty() {
            return Err(ValidationError::EmptyVerificationSource.into());
        }

        let mut contract = self.get_contract(address).await?;
        if contract.name.is_none() {
            contract.name = contract_name_from_source(source_code);
        }
        contract.source_code = Some(source_code.to_string());
        contract.is_verified = true;
        contract.indexed_at = Utc::now();
        Ok(contract)
    }

    async fn get_contract(&self, address: Address) -> Result<IndexedContract, IndexError> {
        Ok(self
            .storage
            .retrieve_as::<IndexedContract>(&EntityKey::Contract(address))
            .await?)
    }
}
