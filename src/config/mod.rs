pub mod schema;

pub use schema::{
    Config, CredentialConfig, GatewayConfig, MessageEncoding, ReplyCacheConfig, StoreBackend,
    StoreConfig, TenantConfig, UpstreamConfig,
};

use anyhow::{bail, Context, Result};
use directories::ProjectDirs;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

pub const CONFIG_ENV_VAR: &str = "WXRELAY_CONFIG";

/// `~/.config/wxrelay/config.toml` on Linux, platform equivalents elsewhere.
pub fn default_config_path() -> Option<PathBuf> {
    ProjectDirs::from("", "", "wxrelay").map(|dirs| dirs.config_dir().join("config.toml"))
}

/// Resolution order: explicit path, `WXRELAY_CONFIG`, platform default.
pub fn resolve_config_path(explicit: Option<&str>) -> Option<PathBuf> {
    let from_env = std::env::var(CONFIG_ENV_VAR).ok();
    explicit
        .map(str::to_string)
        .or(from_env)
        .map(|raw| raw.trim().to_string())
        .filter(|raw| !raw.is_empty())
        .map(|raw| PathBuf::from(shellexpand::tilde(&raw).into_owned()))
        .or_else(default_config_path)
}

impl Config {
    /// Loads and validates the config. A missing file at the default
    /// location yields defaults; a missing explicit file is an error.
    pub fn load(explicit: Option<&str>) -> Result<Self> {
        let Some(path) = resolve_config_path(explicit) else {
            tracing::warn!("no config directory available, using defaults");
            return Ok(Self::default());
        };

        if !path.exists() && explicit.is_none() && std::env::var(CONFIG_ENV_VAR).is_err() {
            tracing::info!("config not found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config = Self::from_toml(&raw)
            .with_context(|| format!("invalid config {}", path.display()))?;
        tracing::debug!(
            "loaded config {} ({} tenants, store={:?})",
            path.display(),
            config.tenants.len(),
            config.store.backend
        );
        Ok(config)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw).context("failed to parse TOML")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for tenant in &self.tenants {
            let app_id = tenant.app_id.trim();
            if app_id.is_empty() {
                bail!("tenants[].app_id must not be empty");
            }
            if tenant.app_secret.trim().is_empty() {
                bail!("tenant `{app_id}` has an empty app_secret");
            }
            if !seen.insert(app_id) {
                bail!("tenant `{app_id}` is configured more than once");
            }
        }
        if self.credential.max_attempts == 0 {
            bail!("credential.max_attempts must be at least 1");
        }
        if self.credential.lock_lease_secs <= self.upstream.timeout_secs.max(1) {
            bail!(
                "credential.lock_lease_secs ({}) must exceed upstream.timeout_secs ({})",
                self.credential.lock_lease_secs,
                self.upstream.timeout_secs.max(1)
            );
        }
        if self.reply_cache.ttl_secs == 0 {
            bail!("reply_cache.ttl_secs must be at least 1");
        }
        if self.store.backend == StoreBackend::Redis
            && self.store.url.as_deref().is_none_or(|url| url.trim().is_empty())
        {
            bail!("store.url is required when store.backend = \"redis\"");
        }
        Ok(())
    }
}

/// Masks an identifier for logs: `wx12***ab`.
pub fn id_hint(id: &str) -> String {
    let chars: Vec<char> = id.chars().collect();
    if chars.len() <= 4 {
        return format!("{id}***");
    }
    let head: String = chars[..2].iter().collect();
    let tail: String = chars[chars.len() - 2..].iter().collect();
    format!("{head}***{tail}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
[gateway]
port = 9000

[store]
backend = "memory"
key_prefix = "gw"

[credential]
max_attempts = 5

[[tenants]]
app_id = "wx0000000000000001"
app_secret = "s3cret"
token = "hook-token"
"#;

    #[test]
    fn parses_sections_and_keeps_defaults() {
        let config = Config::from_toml(SAMPLE).unwrap();
        assert_eq!(config.gateway.port, 9000);
        assert_eq!(config.gateway.host, "127.0.0.1");
        assert_eq!(config.store.key_prefix, "gw");
        assert_eq!(config.credential.max_attempts, 5);
        assert_eq!(config.credential.lock_timeout_ms, 300);
        assert_eq!(config.reply_cache.ttl_secs, 15);

        let tenant = config.tenant("wx0000000000000001").unwrap();
        assert_eq!(tenant.token, "hook-token");
        assert_eq!(tenant.encoding, MessageEncoding::Plaintext);
    }

    #[test]
    fn rejects_duplicate_tenants() {
        let raw = r#"
[[tenants]]
app_id = "wx1"
app_secret = "a"

[[tenants]]
app_id = "wx1"
app_secret = "b"
"#;
        let err = Config::from_toml(raw).unwrap_err();
        assert!(format!("{err:#}").contains("more than once"));
    }

    #[test]
    fn rejects_zero_attempts_and_redis_without_url() {
        let err = Config::from_toml("[credential]\nmax_attempts = 0\n").unwrap_err();
        assert!(format!("{err:#}").contains("max_attempts"));

        let err = Config::from_toml("[store]\nbackend = \"redis\"\n").unwrap_err();
        assert!(format!("{err:#}").contains("store.url"));
    }

    #[test]
    fn lock_lease_must_outlast_the_upstream_timeout() {
        let defaults = Config::default();
        assert!(defaults.credential.lock_lease_secs > defaults.upstream.timeout_secs);
        defaults.validate().unwrap();

        let err = Config::from_toml("[credential]\nlock_lease_secs = 10\n").unwrap_err();
        assert!(format!("{err:#}").contains("must exceed upstream.timeout_secs"));

        let err = Config::from_toml("[credential]\nlock_lease_secs = 30\n").unwrap_err();
        assert!(format!("{err:#}").contains("lock_lease_secs (30)"));

        let raw = "[credential]\nlock_lease_secs = 10\n\n[upstream]\ntimeout_secs = 5\n";
        let config = Config::from_toml(raw).unwrap();
        assert_eq!(config.credential.lock_lease_secs, 10);
    }

    #[test]
    fn load_from_reads_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let config = Config::load_from(file.path()).unwrap();
        assert_eq!(config.tenants.len(), 1);
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        let err = Config::load(Some(missing.to_str().unwrap())).unwrap_err();
        assert!(format!("{err:#}").contains("failed to read config"));
    }

    #[test]
    fn id_hint_masks_the_middle() {
        assert_eq!(id_hint("wx0000000000000001"), "wx***01");
        assert_eq!(id_hint("wx1"), "wx1***");
    }
}
