use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

// ── Top-level ────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct Config {
    pub gateway: GatewayConfig,
    pub store: StoreConfig,
    pub credential: CredentialConfig,
    pub reply_cache: ReplyCacheConfig,
    pub upstream: UpstreamConfig,
    pub tenants: Vec<TenantConfig>,
}

impl Config {
    pub fn tenant(&self, app_id: &str) -> Option<&TenantConfig> {
        self.tenants.iter().find(|tenant| tenant.app_id == app_id)
    }
}

// ── Gateway ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    /// Maximum inbound webhook body in bytes.
    pub max_body_bytes: usize,
    /// Hard deadline for a single webhook request.
    pub request_timeout_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8080,
            max_body_bytes: 65_536,
            request_timeout_secs: 30,
        }
    }
}

// ── Shared store ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// In-process map; single-instance deployments only.
    #[default]
    Memory,
    /// Redis shared by every instance (needs the `store-redis` feature).
    Redis,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    /// Connection URL for remote backends, e.g. `redis://127.0.0.1:6379/0`.
    pub url: Option<String>,
    pub key_prefix: String,
    /// How often the memory backend drops expired entries.
    pub sweep_interval_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            url: None,
            key_prefix: "wxrelay".into(),
            sweep_interval_secs: 60,
        }
    }
}

// ── Credential refresh ───────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct CredentialConfig {
    /// Cached credentials expire this long before the upstream says they do.
    pub safety_margin_secs: u64,
    pub lock_timeout_ms: u64,
    /// Lease on the refresh lock. Must outlast `upstream.timeout_secs` so a
    /// hung token call ends before another instance can take the lock.
    pub lock_lease_secs: u64,
    pub lock_poll_interval_ms: u64,
    pub max_attempts: u32,
}

impl Default for CredentialConfig {
    fn default() -> Self {
        Self {
            safety_margin_secs: 300,
            lock_timeout_ms: 300,
            lock_lease_secs: 40,
            lock_poll_interval_ms: 25,
            max_attempts: 3,
        }
    }
}

// ── Reply de-duplication ─────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct ReplyCacheConfig {
    /// Sliding TTL; three 5s delivery retries fit inside the default.
    pub ttl_secs: u64,
}

impl Default for ReplyCacheConfig {
    fn default() -> Self {
        Self { ttl_secs: 15 }
    }
}

// ── Upstream ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct UpstreamConfig {
    pub api_base: String,
    pub timeout_secs: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            api_base: "https://api.weixin.qq.com".into(),
            timeout_secs: 30,
        }
    }
}

// ── Tenants ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum MessageEncoding {
    /// Signed plaintext pushes.
    #[default]
    Plaintext,
    /// Plaintext and ciphertext side by side.
    Compatible,
    /// Ciphertext only.
    Safe,
}

/// One Official Account served by the gateway.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TenantConfig {
    pub app_id: String,
    pub app_secret: String,
    /// Webhook signing token configured on the platform.
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub encoding: MessageEncoding,
    #[serde(default)]
    pub encoding_aes_key: Option<String>,
}
