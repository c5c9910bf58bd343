use async_trait::async_trait;
use diesel::{prelude::*, sql_types::BigInt, upsert::excluded};
use diesel_async::{
    pooled_connection::deadpool::{Object, Pool},
    AsyncPgConnection, RunQueryDsl,
};
use tracing::{debug, warn};

use super::{Query, SortOrder, StorageEngine};
use crate::{
    connections::DatabaseConnections,
    entities::{Entity, EntityKey},
    error::StorageError,
    models::EntityRow,
    schema::indexed_entities::dsl::{self as columns, indexed_entities},
    types::ToHexString,
};

#[derive(QueryableByName)]
struct RelationSize {
    #[diesel(sql_type = BigInt)]
    size: i64,
}

/// Relational backend. All entity kinds share one table keyed by
/// (kind, natural key) with the typed entity kept as JSONB.
#[derive(Clone)]
pub struct PostgresStorage {
    pool: Pool<AsyncPgConnection>,
}

impl PostgresStorage {
    pub fn new(pool: Pool<AsyncPgConnection>) -> Self {
        Self { pool }
    }

    pub async fn connect(
        db_url: &str,
        max_connections: usize,
        compression_enabled: bool,
        partitioning_enabled: bool,
        backup_enabled: bool,
    ) -> Result<Self, StorageError> {
        // JSONB payloads are already TOAST-compressed by postgres; partitioning
        // and backups are owned by the database deployment.
        if compression_enabled {
            debug!("payload compression delegated to postgres TOAST");
        }
        if partitioning_enabled || backup_enabled {
            warn!(
                partitioning_enabled,
                backup_enabled, "partitioning and backups must be configured on the database"
            );
        }

        let pool = DatabaseConnections::init_postgres(db_url, max_connections).await?;
        Ok(Self::new(pool))
    }

    async fn conn(&self) -> Result<Object<AsyncPgConnection>, StorageError> {
        self.pool
            .get()
            .await
            .map_err(|e| StorageError::BackendUnavailable(e.to_string()))
    }
}

#[async_trait]
impl StorageEngine for PostgresStorage {
    async fn store(&self, entity: &Entity) -> Result<(), StorageError> {
        let row = EntityRow::from(entity)?;
        let mut conn = self.conn().await?;

        diesel::insert_into(indexed_entities)
            .values(&row)
            .on_conflict((columns::kind, columns::entity_key))
            .do_update()
            .set((
                columns::block_number.eq(excluded(columns::block_number)),
                columns::block_hash.eq(excluded(columns::block_hash)),
                columns::position.eq(excluded(columns::position)),
                columns::timestamp.eq(excluded(columns::timestamp)),
                columns::from_address.eq(excluded(columns::from_address)),
                columns::to_address.eq(excluded(columns::to_address)),
                columns::contract_address.eq(excluded(columns::contract_address)),
                columns::topic0.eq(excluded(columns::topic0)),
                columns::payload.eq(excluded(columns::payload)),
                columns::updated_at.eq(excluded(columns::updated_at)),
            ))
            .execute(&mut conn)
            .await?;

        Ok(())
    }

    async fn retrieve(&self, key: &EntityKey) -> Result<Entity, StorageError> {
        let mut conn = self.conn().await?;

        let row: Option<EntityRow> = indexed_entities
            .filter(columns::kind.eq(key.kind().as_str()))
            .filter(columns::entity_key.eq(key.id()))
            .select(EntityRow::as_select())
            .first(&mut conn)
            .await
            .optional()?;

        match row {
            Some(row) => row.into_entity(),
            None => Err(StorageError::NotFound(key.clone())),
        }
    }

    async fn exists(&self, key: &EntityKey) -> Result<bool, StorageError> {
        let mut conn = self.conn().await?;

        let found = diesel::select(diesel::dsl::exists(
            indexed_entities
                .filter(columns::kind.eq(key.kind().as_str()))
                .filter(columns::entity_key.eq(key.id())),
        ))
        .get_result::<bool>(&mut conn)
        .await?;

        Ok(found)
    }

    async fn query(&self, query: &Query) -> Result<Vec<Entity>, StorageError> {
        let mut conn = self.conn().await?;

        let mut q = indexed_entities.into_boxed();
        q = q.filter(columns::kind.eq(query.kind.as_str()));
        if let Some(hash) = query.block_hash {
            q = q.filter(columns::block_hash.eq(hash.to_hex_string()));
        }
        if let Some(address) = query.address {
            let address = address.to_hex_string();
            q = q.filter(
                columns::from_address
                    .eq(address.clone())
                    .or(columns::to_address.eq(address)),
            );
        }
        if let Some(contract) = query.contract {
            q = q.filter(columns::contract_address.eq(contract.to_hex_string()));
        }
        if let Some(topic) = query.topic0 {
            q = q.filter(columns::topic0.eq(topic.to_hex_string()));
        }
        if let Some(range) = query.time_range {
            q = q
                .filter(columns::timestamp.ge(range.start))
                .filter(columns::timestamp.le(range.end));
        }
        q = match query.order {
            SortOrder::Ascending => q.order((
                columns::block_number.asc(),
                columns::position.asc(),
                columns::entity_key.asc(),
            )),
            SortOrder::Descending => q.order((
                columns::block_number.desc(),
                columns::position.desc(),
                columns::entity_key.desc(),
            )),
        };
        if let Some(limit) = query.limit {
            q = q.limit(limit as i64);
        }

        let rows: Vec<EntityRow> = q
            .select(EntityRow::as_select())
            .load(&mut conn)
            .await?;

        rows.into_iter().map(EntityRow::into_entity).collect()
    }

    async fn delete(&self, key: &EntityKey) -> Result<(), StorageError> {
        let mut conn = self.conn().await?;

        diesel::delete(
            indexed_entities
                .filter(columns::kind.eq(key.kind().as_str()))
                .filter(columns::entity_key.eq(key.id())),
        )
        .execute(&mut conn)
        .await?;

        Ok(())
    }

    async fn size_bytes(&self) -> Result<u64, StorageError> {
        let mut conn = self.conn().await?;

        let size: RelationSize =
            diesel::sql_query("SELECT pg_total_relation_size('indexed_entities') AS size")
                .get_result(&mut conn)
                .await?;

        Ok(size.size.max(0) as u64)
    }

    fn backend(&self) -> &'static str {
        "postgres"
    }
}
