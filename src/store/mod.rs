//! Key/sorted-set storage backing the registry.
//!
//! The registry only needs a handful of primitives; each of them is atomic
//! on the server side, so several supervisors and selectors can share one
//! store without further coordination.

mod memory;
mod redis;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use crate::error::{Result, SpmError};

#[async_trait]
pub trait RegistryStore: Send + Sync {
    /// SET key value EX ttl
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /// Renew a key's TTL. Returns false if the key does not exist.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;

    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn del(&self, key: &str) -> Result<()>;

    /// ZADD key GT score member: inserts, or raises an existing score
    async fn zadd_gt(&self, key: &str, member: &str, score: f64) -> Result<()>;

    /// ZADD key XX INCR delta member: new score, or None if absent
    async fn zincr_existing(&self, key: &str, member: &str, delta: f64) -> Result<Option<f64>>;

    /// Lowest-scored member (ZRANGE key 0 0)
    async fn zfirst(&self, key: &str) -> Result<Option<String>>;

    async fn zrem(&self, key: &str, member: &str) -> Result<()>;

    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>>;
}

/// Open the store named by `url` (`redis://...` or `memory://`).
pub async fn connect(url: &str) -> Result<Arc<dyn RegistryStore>> {
    let parsed = Url::parse(url)
        .map_err(|e| SpmError::InvalidConfig(format!("invalid registry URL '{}': {}", url, e)))?;

    match parsed.scheme() {
        "redis" => Ok(Arc::new(RedisStore::connect(url).await?)),
        "memory" => Ok(Arc::new(MemoryStore::new())),
        other => Err(SpmError::InvalidConfig(format!(
            "unsupported registry scheme: {}",
            other
        ))),
    }
}

/// TTLs are sent with second precision; never round down to zero.
pub(crate) fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}
