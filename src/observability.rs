//! Prometheus counters for the relay core, registered on a per-context
//! registry rather than the process-global default.

use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

pub struct RelayMetrics {
    registry: Registry,
    pub credential_refreshes: IntCounter,
    pub credential_cache_hits: IntCounter,
    pub lock_contention: IntCounter,
    pub reply_cache_hits: IntCounter,
    pub reply_computations: IntCounter,
    /// Labelled by media type.
    pub uploads: IntCounterVec,
}

impl RelayMetrics {
    pub fn new() -> Self {
        let registry = Registry::new_custom(Some("wxrelay".into()), None)
            .unwrap_or_else(|_| Registry::new());

        let credential_refreshes = counter(
            &registry,
            "credential_refreshes_total",
            "Credentials fetched from the upstream",
        );
        let credential_cache_hits = counter(
            &registry,
            "credential_cache_hits_total",
            "Credential lookups served from the shared store",
        );
        let lock_contention = counter(
            &registry,
            "lock_contention_total",
            "Refresh lock attempts that found the lease busy",
        );
        let reply_cache_hits = counter(
            &registry,
            "reply_cache_hits_total",
            "Webhook deliveries answered from the reply cache",
        );
        let reply_computations = counter(
            &registry,
            "reply_computations_total",
            "Webhook replies computed by the business handler",
        );
        let uploads = IntCounterVec::new(
            Opts::new("uploads_total", "Multipart uploads sent upstream"),
            &["media_type"],
        )
        .expect("static metric definition");
        register(&registry, Box::new(uploads.clone()));

        Self {
            registry,
            credential_refreshes,
            credential_cache_hits,
            lock_contention,
            reply_cache_hits,
            reply_computations,
            uploads,
        }
    }

    /// Text exposition format for `/metrics`.
    pub fn render(&self) -> String {
        let mut buffer = Vec::new();
        if let Err(err) = TextEncoder::new().encode(&self.registry.gather(), &mut buffer) {
            tracing::warn!("metrics encode failed: {err}");
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for RelayMetrics {
    fn default() -> Self {
        Self::new()
    }
}

fn counter(registry: &Registry, name: &str, help: &str) -> IntCounter {
    let counter = IntCounter::new(name, help).expect("static metric definition");
    register(registry, Box::new(counter.clone()));
    counter
}

fn register(registry: &Registry, collector: Box<dyn prometheus::core::Collector>) {
    if let Err(err) = registry.register(collector) {
        tracing::warn!("metric registration failed: {err}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_includes_prefixed_counters() {
        let metrics = RelayMetrics::new();
        metrics.credential_refreshes.inc();
        metrics.uploads.with_label_values(&["image"]).inc();

        let text = metrics.render();
        assert!(text.contains("wxrelay_credential_refreshes_total 1"));
        assert!(text.contains("wxrelay_uploads_total{media_type=\"image\"} 1"));
    }

    #[test]
    fn registries_are_independent() {
        let a = RelayMetrics::new();
        let b = RelayMetrics::new();
        a.lock_contention.inc();
        assert_eq!(a.lock_contention.get(), 1);
        assert_eq!(b.lock_contention.get(), 0);
    }
}
