use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use crate::{
    entities::{Entity, EntityKind},
    error::StorageError,
    types::ToHexString,
};

/// One persisted entity. Secondary columns mirror `Entity::columns` and the
/// full entity lives in `payload`.
#[derive(
    Clone,
    Debug,
    Queryable,
    Selectable,
    Insertable,
    Identifiable,
    Serialize,
    Deserialize,
    PartialEq,
)]
#[diesel(primary_key(kind, entity_key))]
#[diesel(table_name = crate::schema::indexed_entities)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct EntityRow {
    pub kind: String,
    pub entity_key: String,
    pub block_number: Option<i64>,
    pub block_hash: Option<String>,
    pub position: Option<i64>,
    pub timestamp: Option<DateTime<Utc>>,
    pub from_address: Option<String>,
    pub to_address: Option<String>,
    pub contract_address: Option<String>,
    pub topic0: Option<String>,
    pub payload: serde_json::Value,
    pub updated_at: DateTime<Utc>,
}

impl EntityRow {
    pub fn from(value: &Entity) -> Result<Self, StorageError> {
        let key = value.key();
        let columns = value.columns();
        Ok(Self {
            kind: key.kind().as_str().to_string(),
            entity_key: key.id(),
            block_number: columns.block_number.map(|n| n as i64),
            block_hash: columns.block_hash.map(|h| h.to_hex_string()),
            position: columns.position.map(|p| p as i64),
            timestamp: columns.timestamp,
            from_address: columns.from_address.map(|a| a.to_hex_string()),
            to_address: columns.to_address.map(|a| a.to_hex_string()),
            contract_address: columns.contract_address.map(|a| a.to_hex_string()),
            topic0: columns.topic0.map(|t| t.to_hex_string()),
            payload: value.payload()?,
            updated_at: Utc::now(),
        })
    }

    pub fn into_entity(self) -> Result<Entity, StorageError> {
        let kind = parse_kind(&self.kind)?;
        Ok(Entity::from_payload(kind, self.payload)?)
    }
}

pub fn parse_kind(kind: &str) -> Result<EntityKind, StorageError> {
    Ok(match kind {
        "block" => EntityKind::Block,
        "transaction" => EntityKind::Transaction,
        "address" => EntityKind::Address,
        "contract" => EntityKind::Contract,
        "event" => EntityKind::Event,
        "checkpoint" => EntityKind::Checkpoint,
        other => {
            return Err(StorageError::BackendUnavailable(format!(
                "unknown entity kind in storage: {}",
                other
            )))
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        entities::{IndexedAddress, IndexedEntity},
        types::unix_to_utc,
    };
    use alloy::primitives::Address;
    use pretty_assertions::assert_eq;

    #[test]
    fn row_columns_follow_entity() {
        let address = IndexedAddress::new(Address::repeat_byte(0x0f), unix_to_utc(1_700_000_000));
        let entity = address.clone().into_entity();
        let row = EntityRow::from(&entity).unwrap();

        assert_eq!(row.kind, "address");
        assert_eq!(row.entity_key, address.key().id());
        assert_eq!(row.from_address, Some(Address::repeat_byte(0x0f).to_hex_string()));
        assert_eq!(row.block_number, None);
        assert_eq!(row.into_entity().unwrap(), entity);
    }

    #[test]
    fn every_kind_parses_back() {
        for kind in [
            EntityKind::Block,
            EntityKind::Transaction,
            EntityKind::Address,
            EntityKind::Contract,
            EntityKind::Event,
            EntityKind::Checkpoint,
        ] {
            assert_eq!(parse_kind(kind.as_str()).unwrap(), kind);
        }
        assert!(parse_kind("uncle").is_err());
    }
}
