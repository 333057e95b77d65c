//! Shared key-value store used for credential caching, lock leases and
//! webhook reply de-duplication.
//!
//! Every backend offers the same atomic primitives. Values are UTF-8
//! strings; structured values are stored as JSON.

pub mod memory;
#[cfg(feature = "store-redis")]
pub mod redis;

use crate::config::{StoreBackend, StoreConfig};
use crate::error::RelayResult;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

pub use memory::MemoryStore;

#[async_trait]
pub trait SharedStore: Send + Sync {
    /// Backend name for logs.
    fn name(&self) -> &str;

    async fn get(&self, key: &str) -> RelayResult<Option<String>>;

    /// Stores `value` only when `key` is absent. Returns whether it was stored.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> RelayResult<bool>;

    /// Reads `key` and resets its expiry to `ttl` in one step.
    async fn get_and_refresh_ttl(&self, key: &str, ttl: Duration) -> RelayResult<Option<String>>;

    async fn delete(&self, key: &str) -> RelayResult<()>;

    /// Deletes `key` only while it still holds `expected`, in one step.
    /// Returns whether it was deleted.
    async fn delete_if_equals(&self, key: &str, expected: &str) -> RelayResult<bool>;
}

/// Key layout for everything the relay keeps in the shared store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpace {
    prefix: String,
}

impl KeySpace {
    pub fn new(prefix: &str) -> Self {
        let prefix = prefix.trim().trim_end_matches(':');
        Self {
            prefix: if prefix.is_empty() {
                "wxrelay".to_string()
            } else {
                prefix.to_string()
            },
        }
    }

    pub fn credential(&self, tenant: &str) -> String {
        format!("{}:credential:{tenant}", self.prefix)
    }

    pub fn credential_lock(&self, tenant: &str) -> String {
        format!("{}:lock:credential:{tenant}", self.prefix)
    }

    pub fn reply(&self, message_key: &str) -> String {
        format!("{}:reply:{message_key}", self.prefix)
    }
}

impl Default for KeySpace {
    fn default() -> Self {
        Self::new("wxrelay")
    }
}

/// Builds the configured store. `Memory` is process-local and only safe for
/// single-instance deployments.
pub async fn create_store(cfg: &StoreConfig) -> Result<Arc<dyn SharedStore>> {
    match cfg.backend {
        StoreBackend::Memory => {
            let memory = MemoryStore::new();
            memory.spawn_sweeper(Duration::from_secs(cfg.sweep_interval_secs));
            let store: Arc<dyn SharedStore> = memory;
            Ok(store)
        }
        StoreBackend::Redis => connect_redis(cfg).await,
    }
}

#[cfg(feature = "store-redis")]
async fn connect_redis(cfg: &StoreConfig) -> Result<Arc<dyn SharedStore>> {
    let url = cfg
        .url
        .as_deref()
        .map(str::trim)
        .filter(|url| !url.is_empty())
        .context("store.url is required for the redis backend")?;
    let store = self::redis::RedisStore::connect(url)
        .await
        .with_context(|| format!("failed to connect shared store at {url}"))?;
    Ok(Arc::new(store))
}

#[cfg(not(feature = "store-redis"))]
async fn connect_redis(_cfg: &StoreConfig) -> Result<Arc<dyn SharedStore>> {
    Err(anyhow::anyhow!("redis backend requested"))
        .context("wxrelay was built without the `store-redis` feature")
}
