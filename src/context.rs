//! The relay's shared handles, built once from config and passed around by
//! `Arc`.

use crate::config::{Config, MessageEncoding, StoreBackend};
use crate::credential::{CredentialCache, CredentialPolicy, CredentialSource};
use crate::lock::DistributedMutex;
use crate::observability::RelayMetrics;
use crate::reply::ReplyDeduplicationCache;
use crate::store::{create_store, KeySpace, SharedStore};
use crate::upstream::{build_http_client, HttpCredentialSource, OfficialAccountClient};
use crate::webhook::{MessageVerifier, SignatureVerifier};
use anyhow::Result;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

pub struct RelayContext {
    config: Config,
    store: Arc<dyn SharedStore>,
    mutex: Arc<DistributedMutex>,
    credentials: Arc<CredentialCache>,
    replies: Arc<ReplyDeduplicationCache>,
    client: Arc<OfficialAccountClient>,
    metrics: Arc<RelayMetrics>,
    verifiers: HashMap<String, Arc<dyn MessageVerifier>>,
}

impl RelayContext {
    /// Connects the configured store and wires the HTTP credential source.
    pub async fn from_config(config: Config) -> Result<Self> {
        let store = create_store(&config.store).await?;
        let http = build_http_client(&config.upstream)?;
        let source = Arc::new(HttpCredentialSource::from_config(http.clone(), &config));
        Ok(Self::from_parts(config, store, source, http))
    }

    pub fn from_parts(
        config: Config,
        store: Arc<dyn SharedStore>,
        source: Arc<dyn CredentialSource>,
        http: reqwest::Client,
    ) -> Self {
        let metrics = Arc::new(RelayMetrics::new());
        let keys = KeySpace::new(&config.store.key_prefix);
        let lease = Duration::from_secs(config.credential.lock_lease_secs);

        // A memory store is per process, so its leases stay in process too.
        let mutex = match config.store.backend {
            StoreBackend::Memory => DistributedMutex::local(lease),
            StoreBackend::Redis => DistributedMutex::shared(Arc::clone(&store), lease),
        }
        .with_poll_interval(Duration::from_millis(config.credential.lock_poll_interval_ms));
        let mutex = Arc::new(mutex);

        let credentials = Arc::new(
            CredentialCache::new(
                Arc::clone(&store),
                Arc::clone(&mutex),
                source,
                CredentialPolicy::from(&config.credential),
            )
            .with_key_space(keys.clone())
            .with_metrics(Arc::clone(&metrics)),
        );
        let replies = Arc::new(
            ReplyDeduplicationCache::new(
                Arc::clone(&store),
                Duration::from_secs(config.reply_cache.ttl_secs),
            )
            .with_key_space(keys)
            .with_metrics(Arc::clone(&metrics)),
        );
        let client = Arc::new(
            OfficialAccountClient::new(http, &config.upstream.api_base, Arc::clone(&credentials))
                .with_metrics(Arc::clone(&metrics)),
        );

        let mut verifiers: HashMap<String, Arc<dyn MessageVerifier>> = HashMap::new();
        for tenant in &config.tenants {
            let verifier: Arc<dyn MessageVerifier> = match tenant.encoding {
                MessageEncoding::Plaintext => Arc::new(SignatureVerifier::new(&tenant.token)),
                MessageEncoding::Compatible => {
                    Arc::new(SignatureVerifier::compatible(&tenant.token))
                }
                MessageEncoding::Safe => {
                    tracing::warn!(
                        "tenant {} uses safe mode; register a verifier for it before serving webhooks",
                        crate::config::id_hint(&tenant.app_id)
                    );
                    continue;
                }
            };
            verifiers.insert(tenant.app_id.clone(), verifier);
        }

        tracing::info!(
            "relay context ready: store={}, lock={}, tenants={}",
            store.name(),
            if mutex.is_distributed() { "shared" } else { "local" },
            config.tenants.len()
        );

        Self {
            config,
            store,
            mutex,
            credentials,
            replies,
            client,
            metrics,
            verifiers,
        }
    }

    /// Installs a verifier for a tenant, e.g. one that decrypts safe-mode
    /// deliveries.
    pub fn with_verifier(mut self, tenant: &str, verifier: Arc<dyn MessageVerifier>) -> Self {
        self.verifiers.insert(tenant.to_string(), verifier);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn SharedStore> {
        &self.store
    }

    pub fn mutex(&self) -> &Arc<DistributedMutex> {
        &self.mutex
    }

    pub fn credentials(&self) -> &Arc<CredentialCache> {
        &self.credentials
    }

    pub fn replies(&self) -> &Arc<ReplyDeduplicationCache> {
        &self.replies
    }

    pub fn client(&self) -> &Arc<OfficialAccountClient> {
        &self.client
    }

    pub fn metrics(&self) -> &Arc<RelayMetrics> {
        &self.metrics
    }

    pub fn is_tenant(&self, tenant: &str) -> bool {
        self.config.tenant(tenant).is_some()
    }

    pub fn verifier(&self, tenant: &str) -> Option<Arc<dyn MessageVerifier>> {
        self.verifiers.get(tenant).cloned()
    }
}
