use diesel::{Connection, PgConnection};
use diesel_async::{
    pooled_connection::{deadpool::Pool, AsyncDieselConnectionManager},
    AsyncPgConnection,
};
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

use crate::error::{CacheError, StorageError};

const MIGRATIONS: EmbeddedMigrations = embed_migrations!("./migrations");

pub struct DatabaseConnections;

impl DatabaseConnections {
    fn run_migrations(db_url: &str) -> Result<(), StorageError> {
        let mut conn = PgConnection::establish(db_url)
            .map_err(|e| StorageError::BackendUnavailable(e.to_string()))?;
        conn.run_pending_migrations(MIGRATIONS)
            .map_err(|e| StorageError::Migration(e.to_string()))?;
        Ok(())
    }

    pub fn postgres_pool(
        db_url: String,
        max_pool_size: usize,
    ) -> Result<Pool<AsyncPgConnection>, StorageError> {
        let config = AsyncDieselConnectionManager::new(db_url);
        Pool::builder(config)
            .max_size(max_pool_size)
            .build()
            .map_err(|e| StorageError::Pool(e.to_string()))
    }

    /// Applies pending migrations and builds the connection pool.
    pub async fn init_postgres(
        db_url: &str,
        max_pool_size: usize,
    ) -> Result<Pool<AsyncPgConnection>, StorageError> {
        let migrate_url = db_url.to_string();
        tokio::task::spawn_blocking(move || Self::run_migrations(&migrate_url))
            .await
            .map_err(|e| StorageError::Migration(e.to_string()))??;
        info!(max_pool_size, "postgres migrations applied");

        Self::postgres_pool(db_url.to_string(), max_pool_size)
    }

    pub fn init_redis(redis_conn_url: &str) -> Result<Arc<Mutex<redis::Connection>>, CacheError> {
        let conn = redis::Client::open(redis_conn_url)?.get_connection()?;
        Ok(Arc::new(Mutex::new(conn)))
    }

    /// Asks the server to evict with the given policy. Managed deployments
    /// commonly forbid `CONFIG`, so failure is only logged.
    pub fn configure_redis_eviction(conn: &mut redis::Connection, policy: &str) {
        let result = redis::cmd("CONFIG")
            .arg("SET")
            .arg("maxmemory-policy")
            .arg(policy)
            .query::<()>(conn);
        if let Err(e) = result {
            warn!(policy, error = %e, "could not set redis eviction policy");
        }
    }
}
