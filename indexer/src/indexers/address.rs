use alloy::primitives::{Address, U256};
use async_trait::async_trait;
use chrono::Utc;
use db::{
    AddressKind, ContractKind, EntityKey, IndexedAddress, NftHolding, StorageEngine,
    StorageEngineExt, TokenHolding, TokenStandard, TxStatus,
};
use std::sync::Arc;

use super::{AddressActivity, AddressIndexer};
use crate::{config::AddressIndexerConfig, error::IndexError};

pub const TRACKED_TAG: &str = "tracked";

pub struct StorageAddressIndexer {
    config: AddressIndexerConfig,
    storage: Arc<dyn StorageEngine>,
}

impl StorageAddressIndexer {
    pub fn new(config: AddressIndexerConfig, storage: Arc<dyn StorageEngine>) -> Self {
        Self { config, storage }
    }

    async fn load_or_new(
        &self,
        address: Address,
        seen_at: chrono::DateTime<Utc>,
    ) -> Result<IndexedAddress, IndexError> {
        match self.get_address(address).await {
            Ok(existing) => Ok(existing),
            Err(IndexError::NotFound(_)) => Ok(IndexedAddress::new(address, seen_at)),
            Err(e) => Err(e),
        }
    }

    fn tag(&self, entity: &mut IndexedAddress) {
        if self.config.tracking_addresses.contains(&entity.address)
            && !entity.tags.iter().any(|t| t == TRACKED_TAG)
        {
            entity.tags.push(TRACKED_TAG.to_string());
        }
    }

    fn apply(&self, entity: &mut IndexedAddress, activity: AddressActivity<'_>) {
        let tx = activity.transaction;
        let address = entity.address;
        let position = tx.position();
        if entity.last_tx_position.map_or(false, |seen| seen >= position) {
            return;
        }

        entity.transaction_count += 1;
        entity.first_seen = entity.first_seen.min(tx.timestamp);
        entity.last_activity = entity.last_activity.max(tx.timestamp);
        entity.last_tx_position = Some(position);
        if tx.from == address {
            entity.nonce = entity.nonce.max(tx.nonce + 1);
        }

        match activity.contract_kind {
            Some(ContractKind::Multisig) => entity.kind = AddressKind::Multisig,
            Some(_) => entity.kind = AddressKind::Contract,
            None => {}
        }

        let succeeded = tx.status == TxStatus::Success;
        if self.config.index_balances {
            if tx.from == address {
                let spent = if succeeded {
                    tx.value.saturating_add(tx.fee())
                } else {
                    tx.fee()
                };
                entity.balance = entity.balance.saturating_sub(spent);
            }
            if succeeded && tx.to == Some(address) {
                entity.balance = entity.balance.saturating_add(tx.value);
            }
        }
        if !succeeded {
            return;
        }

        for transfer in &tx.token_transfers {
            match transfer.standard {
                TokenStandard::Erc20 if self.config.index_token_holdings => {
                    let delta_in = if transfer.to == address { transfer.value } else { U256::ZERO };
                    let delta_out = if transfer.from == address { transfer.value } else { U256::ZERO };
                    if delta_in.is_zero() && delta_out.is_zero() {
                        continue;
                    }
                    let index = match entity
                        .token_holdings
                        .iter()
                        .position(|h| h.token_address == transfer.token_address)
                    {
                        Some(index) => index,
                        None => {
                            entity.token_holdings.push(TokenHolding {
                                token_address: transfer.token_address,
                                balance: U256::ZERO,
                                last_updated: tx.timestamp,
                            });
                            entity.token_holdings.len() - 1
                        }
                    };
                    let holding = &mut entity.token_holdings[index];
                    holding.balance = holding
                        .balance
                        .saturating_add(delta_in)
                        .saturating_sub(delta_out);
                    holding.last_updated = tx.timestamp;
                }
                TokenStandard::Erc721 if self.config.index_nfts => {
                    let Some(token_id) = transfer.token_id else {
                        continue;
                    };
                    let held = |h: &NftHolding| {
                        h.contract_address == transfer.token_address && h.token_id == token_id
                    };
                    if transfer.from == address {
                        entity.nft_holdings.retain(|h| !held(h));
                    }
                    if transfer.to == address && !entity.nft_holdings.iter().any(held) {
                        entity.nft_holdings.push(NftHolding {
                            contract_address: transfer.token_address,
                            token_id,
                            last_updated: tx.timestamp,
                        });
                    }
                }
                _ => {}
            }
        }
    }
}

#[async_trait]
impl AddressIndexer for StorageAddressIndexer {
    async fn index_address(
        &self,
        address: Address,
        activity: Option<AddressActivity<'_>>,
    ) -> Result<IndexedAddress, IndexError> {
        if !self.config.enabled {
            return Err(IndexError::Disabled("address indexer"));
        }
        let seen_at = activity
            .map(|a| a.transaction.timestamp)
            .unwrap_or_else(Utc::now);
        let mut entity = self.load_or_new(address, seen_at).await?;

        if let Some(activity) = activity {
            self.apply(&mut entity, activity);
        }
        self.tag(&mut entity);
        entity.indexed_at = Utc::now();
        Ok(entity)
    }

    async fn update_balance(
        &self,
        address: Address,
        balance: U256,
    ) -> Result<IndexedAddress, IndexError> {
        if !self.config.enabled {
            return Err(IndexError::Disabled("address indexer"));
        }
        let mut entity = self.load_or_new(address, Utc::now()).await?;
        entity.balance = balance;
        self.tag(&mut entity);
        entity.indexed_at = Utc::now();
        Ok(entity)
    }

    async fn get_address(&self, address: Address) -> Result<IndexedAddress, IndexError> {
        Ok(self
            .storage
            .retrieve_as::<IndexedAddress>(&EntityKey::Address(address))
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::TransactionIndexerConfig,
        decode::{event_topic, TRANSFER_EVENT},
        indexers::{StorageTransactionIndexer, TransactionIndexer},
        source::{fixtures, RawLog},
    };
    use alloy::primitives::{Bytes, B256};
    use db::{IndexedEntity, IndexedTransaction, MemoryStorage};
    use pretty_assertions::assert_eq;

    fn a() -> Address {
        Address::repeat_byte(0xa)
    }

    fn b() -> Address {
        Address::repeat_byte(0xb)
    }

    async fn transfer_tx(number: u64, from: Address, to: Address, value: u64) -> IndexedTransaction {
        let storage = Arc::new(MemoryStorage::new());
        let block = fixtures::with_transactions(
            fixtures::block(number),
            vec![fixtures::transfer(number, 0, from, to, value)],
        );
        let raw = &block.transactions[0];
        StorageTransactionIndexer::new(TransactionIndexerConfig::default(), true, storage)
            .index_transaction(raw, &raw.receipt_or_derived(&block), &block)
            .await
            .unwrap()
    }

    async fn index_and_store(
        indexer: &StorageAddressIndexer,
        storage: &MemoryStorage,
        address: Address,
        tx: &IndexedTransaction,
    ) -> IndexedAddress {
        let entity = indexer
            .index_address(
                address,
                Some(AddressActivity {
                    transaction: tx,
                    contract_kind: None,
                }),
            )
            .await
            .unwrap();
        storage.store(&entity.clone().into_entity()).await.unwrap();
        entity
    }

    #[tokio::test]
    async fn activity_accumulates_across_blocks() {
        let storage = Arc::new(MemoryStorage::new());
        let indexer = StorageAddressIndexer::new(AddressIndexerConfig::default(), storage.clone());

        let first = transfer_tx(1, a(), b(), 1_000_000).await;
        let second = transfer_tx(2, b(), a(), 30).await;

        index_and_store(&indexer, &storage, b(), &first).await;
        let entity = index_and_store(&indexer, &storage, b(), &second).await;

        assert_eq!(entity.transaction_count, 2);
        assert_eq!(entity.first_seen, first.timestamp);
        assert_eq!(entity.last_activity, second.timestamp);
        assert_eq!(entity.nonce, 1);
        // received, then sent 30 and paid the fee
        assert_eq!(entity.balance, U256::from(999_970u64) - second.fee());
    }

    #[tokio::test]
    async fn reapplying_the_same_transaction_is_a_no_op() {
        let storage = Arc::new(MemoryStorage::new());
        let indexer = StorageAddressIndexer::new(AddressIndexerConfig::default(), storage.clone());
        let tx = transfer_tx(1, a(), b(), 100).await;

        let once = index_and_store(&indexer, &storage, b(), &tx).await;
        let twice = index_and_store(&indexer, &storage, b(), &tx).await;
        assert_eq!(once.transaction_count, twice.transaction_count);
        assert_eq!(once.balance, twice.balance);
    }

    #[tokio::test]
    async fn token_and_nft_holdings_follow_transfers() {
        let storage = Arc::new(MemoryStorage::new());
        let indexer = StorageAddressIndexer::new(AddressIndexerConfig::default(), storage.clone());
        let token = Address::repeat_byte(0x70);
        let nft = Address::repeat_byte(0x71);
        let topic = |addr: Address| B256::left_padding_from(addr.as_slice());

        let raw = fixtures::transfer(3, 0, a(), token, 0);
        let mut block = fixtures::with_transactions(fixtures::block(3), vec![raw.clone()]);
        block.logs = vec![
            RawLog {
                address: token,
                topics: vec![event_topic(TRANSFER_EVENT), topic(a()), topic(b())],
                data: Bytes::from(U256::from(40u64).to_be_bytes::<32>().to_vec()),
                log_index: 0,
                transaction_hash: raw.hash,
                transaction_index: 0,
            },
            RawLog {
                address: nft,
                topics: vec![
                    event_topic(TRANSFER_EVENT),
                    topic(a()),
                    topic(b()),
                    B256::from(U256::from(7u64).to_be_bytes::<32>()),
                ],
                data: Bytes::new(),
                log_index: 1,
                transaction_hash: raw.hash,
                transaction_index: 0,
            },
        ];
        let tx = StorageTransactionIndexer::new(TransactionIndexerConfig::default(), true, storage.clone())
            .index_transaction(&raw, &raw.receipt_or_derived(&block), &block)
            .await
            .unwrap();

        let receiver = index_and_store(&indexer, &storage, b(), &tx).await;
        assert_eq!(receiver.token_holdings.len(), 1);
        assert_eq!(receiver.token_holdings[0].balance, U256::from(40u64));
        assert_eq!(receiver.nft_holdings.len(), 1);
        assert_eq!(receiver.nft_holdings[0].token_id, U256::from(7u64));

        let sender = index_and_store(&indexer, &storage, a(), &tx).await;
        assert_eq!(sender.token_holdings[0].balance, U256::ZERO);
        assert!(sender.nft_holdings.is_empty());
    }

    #[tokio::test]
    async fn tracked_tag_and_balance_update() {
        let storage = Arc::new(MemoryStorage::new());
        let config = AddressIndexerConfig {
            tracking_addresses: vec![a()],
            ..Default::default()
        };
        let indexer = StorageAddressIndexer::new(config, storage.clone());

        let entity = indexer.update_balance(a(), U256::from(5u64)).await.unwrap();
        assert_eq!(entity.balance, U256::from(5u64));
        assert_eq!(entity.tags, vec![TRACKED_TAG.to_string()]);

        let plain = indexer.index_address(b(), None).await.unwrap();
        assert!(plain.tags.is_empty());
        assert_eq!(plain.transaction_count, 0);
    }

    #[tokio::test]
    async fn contract_kind_upgrades_address() {
        let storage = Arc::new(MemoryStorage::new());
        let indexer = StorageAddressIndexer::new(AddressIndexerConfig::default(), storage.clone());
        let tx = transfer_tx(4, a(), b(), 1).await;
        let entity = indexer
            .index_address(
                b(),
                Some(AddressActivity {
                    transaction: &tx,
                    contract_kind: Some(ContractKind::Multisig),
                }),
            )
            .await
            .unwrap();
        assert_eq!(entity.kind, AddressKind::Multisig);
    }
}
