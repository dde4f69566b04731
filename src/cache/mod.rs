pub mod keys;

mod memory;
mod redis_cache;

pub use memory::MemoryCache;
pub use redis_cache::RedisCache;

use async_trait::async_trait;
use thiserror::Error;

/// Shared working copy of the roster. Every worker reads it before a mutation
/// and overwrites it afterwards; there is no compare-and-swap.
#[async_trait]
pub trait RosterCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;

    async fn set(&self, key: &str, value: &[u8]) -> Result<(), CacheError>;

    async fn is_connected(&self) -> bool {
        true
    }
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
}
