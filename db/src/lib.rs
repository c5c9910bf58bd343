pub mod cache;
pub mod connections;
pub mod entities;
pub mod error;
pub mod models;
pub mod schema;
pub mod storage;
pub mod types;

pub use cache::{memory::EvictionPolicy, CacheEngine, CacheEngineExt, MemoryCache, NoopCache, RedisCache};
pub use connections::*;
pub use entities::*;
pub use error::*;
pub use models::*;
pub use storage::{
    MemoryStorage, PostgresStorage, Query, SortOrder, StorageEngine, StorageEngineExt,
};
pub use types::*;

pub use redis::RedisError;
