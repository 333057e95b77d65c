//! Per-tenant bearer credential cache with coordinated refresh.
//!
//! Readers never wait on the refresh lock: a cache hit returns immediately,
//! and a caller that loses the lock race retries from the top (bounded), by
//! which time the winner has usually populated the cache. The upstream keeps
//! accepting the previous credential for a grace window after rotation, so a
//! caller holding a token issued moments earlier by another instance is fine.

use crate::error::{ErrorKind, RelayError, RelayResult};
use crate::lock::DistributedMutex;
use crate::observability::RelayMetrics;
use crate::store::{KeySpace, SharedStore};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

/// Shortest declared lifetime that leaves room for a whole-second TTL
/// below it.
pub const MIN_CACHEABLE_LIFETIME_SECS: u64 = 2;

/// Short-lived bearer credential issued by the upstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub token: String,
    /// Lifetime declared by the upstream, in seconds.
    pub issued_capacity_seconds: u64,
}

impl Credential {
    pub fn new(token: impl Into<String>, issued_capacity_seconds: u64) -> Self {
        Self {
            token: token.into(),
            issued_capacity_seconds,
        }
    }

    /// Cache lifetime, always strictly shorter than the declared lifetime.
    /// When the lifetime does not exceed the margin, half of it is used.
    /// A lifetime under two seconds has no such TTL and is not cached.
    pub fn cache_ttl(&self, safety_margin: Duration) -> Option<Duration> {
        let declared = self.issued_capacity_seconds;
        if declared < MIN_CACHEABLE_LIFETIME_SECS {
            return None;
        }
        let margin = safety_margin.as_secs();
        let secs = if declared > margin {
            declared - margin
        } else {
            declared / 2
        };
        Some(Duration::from_secs(secs))
    }
}

/// Where fresh credentials come from.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    /// Transport failures should be `Retryable`; a non-zero upstream error
    /// code is `Upstream`.
    async fn fetch(&self, tenant: &str) -> RelayResult<Credential>;
}

#[derive(Debug, Clone)]
pub struct CredentialPolicy {
    pub safety_margin: Duration,
    pub lock_timeout: Duration,
    pub max_attempts: u32,
}

impl Default for CredentialPolicy {
    fn default() -> Self {
        Self {
            safety_margin: Duration::from_secs(300),
            lock_timeout: Duration::from_millis(300),
            max_attempts: 3,
        }
    }
}

impl From<&crate::config::CredentialConfig> for CredentialPolicy {
    fn from(cfg: &crate::config::CredentialConfig) -> Self {
        Self {
            safety_margin: Duration::from_secs(cfg.safety_margin_secs),
            lock_timeout: Duration::from_millis(cfg.lock_timeout_ms),
            max_attempts: cfg.max_attempts.max(1),
        }
    }
}

type AttemptFuture<'a> = Pin<Box<dyn Future<Output = RelayResult<Credential>> + Send + 'a>>;

pub struct CredentialCache {
    store: Arc<dyn SharedStore>,
    mutex: Arc<DistributedMutex>,
    source: Arc<dyn CredentialSource>,
    keys: KeySpace,
    policy: CredentialPolicy,
    metrics: Option<Arc<RelayMetrics>>,
}

impl CredentialCache {
    pub fn new(
        store: Arc<dyn SharedStore>,
        mutex: Arc<DistributedMutex>,
        source: Arc<dyn CredentialSource>,
        policy: CredentialPolicy,
    ) -> Self {
        Self {
            store,
            mutex,
            source,
            keys: KeySpace::default(),
            policy,
            metrics: None,
        }
    }

    pub fn with_key_space(mut self, keys: KeySpace) -> Self {
        self.keys = keys;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<RelayMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn policy(&self) -> &CredentialPolicy {
        &self.policy
    }

    /// Returns a cached credential, refreshing it under the tenant's lock on
    /// a miss. Fails with `UpstreamUnavailable` once attempts run out.
    pub async fn get_or_refresh(&self, tenant: &str) -> RelayResult<Credential> {
        self.attempt_from(tenant, self.policy.max_attempts, None)
            .await
    }

    /// Cached credential, if any. Never refreshes.
    pub async fn peek(&self, tenant: &str) -> RelayResult<Option<Credential>> {
        self.lookup(tenant).await
    }

    /// Drops the cached credential, e.g. after the upstream rejected it.
    pub async fn invalidate(&self, tenant: &str) -> RelayResult<()> {
        tracing::info!("invalidating cached credential for {}", crate::config::id_hint(tenant));
        self.store.delete(&self.keys.credential(tenant)).await
    }

    fn attempt_from<'a>(
        &'a self,
        tenant: &'a str,
        remaining: u32,
        last_failure: Option<String>,
    ) -> AttemptFuture<'a> {
        Box::pin(async move {
            if remaining == 0 {
                let reason = last_failure.unwrap_or_else(|| "no attempts allowed".to_string());
                tracing::warn!(
                    "credential refresh for {} gave up after {} attempts: {reason}",
                    crate::config::id_hint(tenant),
                    self.policy.max_attempts
                );
                return Err(RelayError::unavailable(
                    tenant,
                    format!(
                        "credential not obtained after {} attempts: {reason}",
                        self.policy.max_attempts
                    ),
                ));
            }

            match self.attempt(tenant).await {
                Ok(credential) => Ok(credential),
                Err(err) if err.is_retryable() => {
                    if err.kind() == ErrorKind::LockContention {
                        tracing::debug!("{err}; {} attempts left", remaining - 1);
                    } else {
                        tracing::warn!("credential attempt failed: {err}; {} attempts left", remaining - 1);
                    }
                    self.attempt_from(tenant, remaining - 1, Some(err.to_string()))
                        .await
                }
                Err(err) => Err(err),
            }
        })
    }

    async fn attempt(&self, tenant: &str) -> RelayResult<Credential> {
        if let Some(credential) = self.lookup(tenant).await? {
            self.count(|m| m.credential_cache_hits.inc());
            return Ok(credential);
        }

        let lock_name = self.keys.credential_lock(tenant);
        let Some(guard) = self
            .mutex
            .try_lock_guarded(&lock_name, self.policy.lock_timeout)
            .await
        else {
            self.count(|m| m.lock_contention.inc());
            return Err(RelayError::LockContention { name: lock_name });
        };

        // If this future is dropped mid-refresh the guard still releases.
        let refreshed = self.refresh_locked(tenant).await;
        guard.release().await;
        refreshed
    }

    /// Runs with the tenant's lock held.
    async fn refresh_locked(&self, tenant: &str) -> RelayResult<Credential> {
        // Another holder may have finished between our miss and the lock.
        if let Some(credential) = self.lookup(tenant).await? {
            self.count(|m| m.credential_cache_hits.inc());
            return Ok(credential);
        }

        let credential = self.source.fetch(tenant).await?;
        self.count(|m| m.credential_refreshes.inc());
        let Some(ttl) = credential.cache_ttl(self.policy.safety_margin) else {
            tracing::warn!(
                "credential for {} declares a {}s lifetime, too short to cache",
                crate::config::id_hint(tenant),
                credential.issued_capacity_seconds
            );
            return Ok(credential);
        };
        tracing::info!(
            "credential refreshed for {} (lifetime {}s, cached {}s)",
            crate::config::id_hint(tenant),
            credential.issued_capacity_seconds,
            ttl.as_secs()
        );

        if let Err(err) = self.store_credential(tenant, &credential, ttl).await {
            tracing::warn!("credential for {} not cached: {err}", crate::config::id_hint(tenant));
        }
        Ok(credential)
    }

    async fn store_credential(
        &self,
        tenant: &str,
        credential: &Credential,
        ttl: Duration,
    ) -> RelayResult<()> {
        let key = self.keys.credential(tenant);
        let encoded = serde_json::to_string(credential)
            .map_err(|err| RelayError::store("encode", &key, err))?;
        self.store.delete(&key).await?;
        if !self.store.set_if_absent(&key, &encoded, ttl).await? {
            tracing::debug!("credential `{key}` was written concurrently, keeping theirs");
        }
        Ok(())
    }

    async fn lookup(&self, tenant: &str) -> RelayResult<Option<Credential>> {
        let key = self.keys.credential(tenant);
        let Some(raw) = self.store.get(&key).await? else {
            return Ok(None);
        };
        match serde_json::from_str::<Credential>(&raw) {
            Ok(credential) if !credential.token.is_empty() => Ok(Some(credential)),
            Ok(_) | Err(_) => {
                tracing::warn!("discarding unreadable credential entry `{key}`");
                Ok(None)
            }
        }
    }

    fn count(&self, record: impl FnOnce(&RelayMetrics)) {
        if let Some(metrics) = &self.metrics {
            record(metrics);
        }
    }
}
