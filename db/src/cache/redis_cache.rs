use async_trait::async_trait;
use redis::Commands;
use std::{
    sync::{Arc, Mutex},
    time::Duration,
};
use tracing::info;

use super::CacheEngine;
use crate::{connections::DatabaseConnections, error::CacheError};

const KEY_PREFIX: &str = "indexer:";

/// Shared key-value cache backed by a Redis server. Keys are namespaced so
/// that `clear` only drops entries written by the indexer.
#[derive(Clone)]
pub struct RedisCache {
    conn: Arc<Mutex<redis::Connection>>,
}

impl RedisCache {
    pub fn new(conn: Arc<Mutex<redis::Connection>>) -> Self {
        Self { conn }
    }

    /// `eviction_policy` is handed to the server as `maxmemory-policy`.
    pub async fn connect(redis_conn_url: &str, eviction_policy: &str) -> Result<Self, CacheError> {
        let url = redis_conn_url.to_string();
        let policy = match eviction_policy {
            "lru" => "allkeys-lru",
            other => other,
        }
        .to_string();

        let conn = tokio::task::spawn_blocking(move || {
            let conn = DatabaseConnections::init_redis(&url)?;
            if let Ok(mut guard) = conn.lock() {
                DatabaseConnections::configure_redis_eviction(&mut *guard, &policy);
            }
            Ok::<_, CacheError>(conn)
        })
        .await
        .map_err(|e| CacheError::BackendUnavailable(e.to_string()))??;

        info!(eviction_policy, "connected to redis cache");
        Ok(Self::new(conn))
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, CacheError>
    where
        T: Send + 'static,
        F: FnOnce(&mut redis::Connection) -> redis::RedisResult<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| CacheError::BackendUnavailable("redis connection lock poisoned".into()))?;
            f(&mut *guard).map_err(CacheError::from)
        })
        .await
        .map_err(|e| CacheError::BackendUnavailable(e.to_string()))?
    }
}

fn namespaced(key: &str) -> String {
    format!("{}{}", KEY_PREFIX, key)
}

#[async_trait]
impl CacheEngine for RedisCache {
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), CacheError> {
        let key = namespaced(key);
        let ttl_ms = ttl.as_millis() as u64;
        self.with_conn(move |conn| {
            let mut cmd = redis::cmd("SET");
            cmd.arg(&key).arg(value);
            if ttl_ms > 0 {
                cmd.arg("PX").arg(ttl_ms);
            }
            cmd.query::<()>(conn)
        })
        .await
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let key = namespaced(key);
        self.with_conn(move |conn| redis::cmd("GET").arg(&key).query::<Option<Vec<u8>>>(conn))
            .await
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let key = namespaced(key);
        self.with_conn(move |conn| redis::cmd("DEL").arg(&key).query::<()>(conn))
            .await
    }

    async fn clear(&self) -> Result<(), CacheError> {
        self.with_conn(|conn| {
            let pattern = format!("{}*", KEY_PREFIX);
            let keys: Vec<String> = conn.scan_match::<_, String>(pattern)?.collect();
            for chunk in keys.chunks(500) {
                redis::cmd("DEL").arg(chunk).query::<()>(conn)?;
            }
            Ok(())
        })
        .await
    }

    fn backend(&self) -> &'static str {
        "redis"
    }
}
