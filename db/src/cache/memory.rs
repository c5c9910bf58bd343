use async_trait::async_trait;
use lru::LruCache;
use std::{
    num::NonZeroUsize,
    sync::{Mutex, MutexGuard},
    time::Duration,
};
use tokio::time::Instant;

use super::CacheEngine;
use crate::error::CacheError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EvictionPolicy {
    /// Drop the least recently used entry when full.
    Lru,
    /// Refuse new keys when full.
    NoEviction,
}

impl EvictionPolicy {
    pub fn parse(policy: &str) -> Option<Self> {
        match policy {
            "lru" => Some(EvictionPolicy::Lru),
            "noeviction" => Some(EvictionPolicy::NoEviction),
            _ => None,
        }
    }
}

struct CachedValue {
    bytes: Vec<u8>,
    expires_at: Option<Instant>,
}

impl CachedValue {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.map_or(false, |at| at <= now)
    }
}

/// In-process cache bounded by entry count.
pub struct MemoryCache {
    entries: Mutex<LruCache<String, CachedValue>>,
    policy: EvictionPolicy,
}

impl MemoryCache {
    pub fn new(max_entries: usize, policy: EvictionPolicy) -> Self {
        let capacity = NonZeroUsize::new(max_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            policy,
        }
    }

    pub fn len(&self) -> usize {
        self.lock().map(|entries| entries.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Result<MutexGuard<'_, LruCache<String, CachedValue>>, CacheError> {
        self.entries
            .lock()
            .map_err(|_| CacheError::BackendUnavailable("memory cache lock poisoned".into()))
    }
}

fn purge_expired(entries: &mut LruCache<String, CachedValue>, now: Instant) {
    let expired: Vec<String> = entries
        .iter()
        .filter(|(_, value)| value.is_expired(now))
        .map(|(key, _)| key.clone())
        .collect();
    for key in expired {
        entries.pop(&key);
    }
}

#[async_trait]
impl CacheEngine for MemoryCache {
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), CacheError> {
        let now = Instant::now();
        let expires_at = (!ttl.is_zero()).then(|| now + ttl);
        let mut entries = self.lock()?;

        if !entries.contains(key) && entries.len() >= entries.cap().get() {
            purge_expired(&mut entries, now);
            if self.policy == EvictionPolicy::NoEviction && entries.len() >= entries.cap().get() {
                return Err(CacheError::Full);
            }
        }

        entries.put(
            key.to_string(),
            CachedValue {
                bytes: value,
                expires_at,
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let now = Instant::now();
        let mut entries = self.lock()?;

        let expired = match entries.get(key) {
            Some(value) if !value.is_expired(now) => return Ok(Some(value.bytes.clone())),
            Some(_) => true,
            None => false,
        };
        if expired {
            entries.pop(key);
        }
        Ok(None)
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.lock()?.pop(key);
        Ok(())
    }

    async fn clear(&self) -> Result<(), CacheError> {
        self.lock()?.clear();
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "in-memory"
    }
}
