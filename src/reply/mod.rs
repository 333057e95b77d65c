//! Idempotent passive replies for retried webhook deliveries.
//!
//! The platform redelivers a push up to three times, five seconds apart,
//! when it does not get a reply in time. Every delivery of one message must
//! see the same reply and the business handler must run once, so replies
//! are kept in the shared store under the message identity with a sliding
//! TTL.

use crate::error::{RelayError, RelayResult};
use crate::observability::RelayMetrics;
use crate::store::{KeySpace, SharedStore};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

pub const DEFAULT_REPLY_TTL: Duration = Duration::from_secs(15);

/// Identity of an inbound message. Messages carry an id; events do not, so
/// they are keyed by sender and creation time.
pub fn message_key(tenant: &str, msg_id: Option<&str>, sender: &str, create_time: i64) -> String {
    match msg_id.map(str::trim).filter(|id| !id.is_empty()) {
        Some(id) => format!("{tenant}:msg:{id}"),
        None => format!("{tenant}:evt:{sender}:{create_time}"),
    }
}

/// A computation running on its own task. Deliveries that arrive while it
/// runs wait on `done`; dropping a waiter never cancels the computation.
struct InFlight {
    done: watch::Receiver<Option<RelayResult<String>>>,
}

type InFlightMap = Arc<Mutex<HashMap<String, Arc<InFlight>>>>;

/// Store access shared with detached computations.
#[derive(Clone)]
struct ReplyEntries {
    store: Arc<dyn SharedStore>,
    ttl: Duration,
    metrics: Option<Arc<RelayMetrics>>,
}

pub struct ReplyDeduplicationCache {
    entries: ReplyEntries,
    keys: KeySpace,
    in_flight: InFlightMap,
}

impl ReplyDeduplicationCache {
    pub fn new(store: Arc<dyn SharedStore>, ttl: Duration) -> Self {
        Self {
            entries: ReplyEntries {
                store,
                ttl,
                metrics: None,
            },
            keys: KeySpace::default(),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn with_key_space(mut self, keys: KeySpace) -> Self {
        self.keys = keys;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<RelayMetrics>) -> Self {
        self.entries.metrics = Some(metrics);
        self
    }

    pub fn ttl(&self) -> Duration {
        self.entries.ttl
    }

    /// Returns the reply stored for `message_key`, or runs `compute` once and
    /// stores its result. Concurrent callers in this process wait for the
    /// running computation. A failed `compute` stores nothing.
    ///
    /// `compute` runs on a spawned task, so a caller dropped mid-way (for
    /// example a delivery the platform gave up on) leaves it running and the
    /// next delivery joins it instead of starting over.
    pub async fn get_or_compute<R, F, Fut>(&self, message_key: &str, compute: F) -> RelayResult<R>
    where
        R: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = RelayResult<R>> + Send + 'static,
    {
        let key = self.keys.reply(message_key);

        if let Some(raw) = self.entries.read_with_retry(&key).await? {
            self.entries.count(|m| m.reply_cache_hits.inc());
            tracing::debug!("reply for `{message_key}` served from cache");
            return decode(&key, &raw);
        }

        let flight = self.join_or_start(&key, compute);
        let raw = self.wait(&key, &flight).await?;
        decode(&key, &raw)
    }

    /// Drops a stored reply.
    pub async fn forget(&self, message_key: &str) -> RelayResult<()> {
        self.entries.store.delete(&self.keys.reply(message_key)).await
    }

    fn join_or_start<R, F, Fut>(&self, key: &str, compute: F) -> Arc<InFlight>
    where
        R: Serialize + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = RelayResult<R>> + Send + 'static,
    {
        let mut in_flight = self.in_flight.lock();
        if let Some(flight) = in_flight.get(key) {
            return Arc::clone(flight);
        }

        let (done, receiver) = watch::channel(None);
        let flight = Arc::new(InFlight { done: receiver });
        in_flight.insert(key.to_string(), Arc::clone(&flight));
        drop(in_flight);

        let entries = self.entries.clone();
        let in_flight = Arc::clone(&self.in_flight);
        let registered = Arc::clone(&flight);
        let key = key.to_string();
        tokio::spawn(async move {
            let outcome = entries.compute_and_store(&key, compute).await;
            done.send_replace(Some(outcome));
            leave_in_flight(&in_flight, &key, &registered);
        });
        flight
    }

    async fn wait(&self, key: &str, flight: &Arc<InFlight>) -> RelayResult<String> {
        let mut done = flight.done.clone();
        let outcome = match done.wait_for(|outcome| outcome.is_some()).await {
            Ok(outcome) => (*outcome).clone(),
            Err(_) => None,
        };

        match outcome {
            Some(outcome) => outcome,
            None => {
                // The computing task panicked before reporting.
                leave_in_flight(&self.in_flight, key, flight);
                Err(RelayError::Retryable(format!(
                    "reply computation for `{key}` was aborted"
                )))
            }
        }
    }
}

impl ReplyEntries {
    async fn compute_and_store<R, F, Fut>(&self, key: &str, compute: F) -> RelayResult<String>
    where
        R: Serialize,
        F: FnOnce() -> Fut,
        Fut: Future<Output = RelayResult<R>>,
    {
        // A computation started right after another one finished lands here.
        if let Some(raw) = self.read_with_retry(key).await? {
            self.count(|m| m.reply_cache_hits.inc());
            return Ok(raw);
        }

        let reply = compute().await?;
        self.count(|m| m.reply_computations.inc());
        let encoded =
            serde_json::to_string(&reply).map_err(|err| RelayError::store("encode", key, err))?;

        if self.store.set_if_absent(key, &encoded, self.ttl).await? {
            return Ok(encoded);
        }

        // Another instance stored first; every delivery must see one reply.
        match self.store.get(key).await? {
            Some(winner) if !is_tombstone(&winner) => {
                tracing::debug!("reply `{key}` was stored concurrently, returning the stored one");
                Ok(winner)
            }
            _ => Ok(encoded),
        }
    }

    async fn read_with_retry(&self, key: &str) -> RelayResult<Option<String>> {
        match self.read(key).await {
            Err(err) if err.is_retryable() => {
                tracing::debug!("retrying reply read: {err}");
                self.read(key).await
            }
            other => other,
        }
    }

    async fn read(&self, key: &str) -> RelayResult<Option<String>> {
        match self.store.get_and_refresh_ttl(key, self.ttl).await? {
            Some(raw) if is_tombstone(&raw) => Err(RelayError::Retryable(format!(
                "reply entry `{key}` holds no value"
            ))),
            found => Ok(found),
        }
    }

    fn count(&self, record: impl FnOnce(&RelayMetrics)) {
        if let Some(metrics) = &self.metrics {
            record(metrics);
        }
    }
}

fn leave_in_flight(
    in_flight: &Mutex<HashMap<String, Arc<InFlight>>>,
    key: &str,
    flight: &Arc<InFlight>,
) {
    let mut in_flight = in_flight.lock();
    if in_flight
        .get(key)
        .is_some_and(|current| Arc::ptr_eq(current, flight))
    {
        in_flight.remove(key);
    }
}

fn is_tombstone(raw: &str) -> bool {
    let raw = raw.trim();
    raw.is_empty() || raw == "null"
}

fn decode<R: DeserializeOwned>(key: &str, raw: &str) -> RelayResult<R> {
    serde_json::from_str(raw)
        .map_err(|err| RelayError::Retryable(format!("reply entry `{key}` is unreadable: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time;

    type BoxedReply = Pin<Box<dyn Future<Output = RelayResult<String>> + Send>>;

    fn cache(store: Arc<MemoryStore>) -> ReplyDeduplicationCache {
        ReplyDeduplicationCache::new(store, DEFAULT_REPLY_TTL)
    }

    /// Replies `reply-{n}` where `n` counts calls, after `delay`.
    fn numbered(
        calls: &Arc<AtomicUsize>,
        delay: Duration,
    ) -> impl FnOnce() -> BoxedReply + Send + 'static {
        let calls = Arc::clone(calls);
        move || {
            Box::pin(async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                time::sleep(delay).await;
                Ok(format!("reply-{n}"))
            })
        }
    }

    #[test]
    fn message_key_prefers_msg_id() {
        assert_eq!(message_key("wx1", Some("6188"), "oUser", 1700), "wx1:msg:6188");
        assert_eq!(message_key("wx1", None, "oUser", 1700), "wx1:evt:oUser:1700");
        assert_eq!(message_key("wx1", Some(" "), "oUser", 1700), "wx1:evt:oUser:1700");
    }

    #[tokio::test(start_paused = true)]
    async fn three_deliveries_compute_once() {
        let cache = cache(MemoryStore::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut replies = Vec::new();
        for _ in 0..3 {
            let reply: String = cache
                .get_or_compute("wx1:msg:1", numbered(&calls, Duration::ZERO))
                .await
                .unwrap();
            replies.push(reply);
            time::advance(Duration::from_secs(5)).await;
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(replies, vec!["reply-1"; 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_reply_is_computed_again() {
        let cache = cache(MemoryStore::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let first: String = cache
            .get_or_compute("wx1:msg:1", numbered(&calls, Duration::ZERO))
            .await
            .unwrap();
        time::advance(DEFAULT_REPLY_TTL).await;
        let second: String = cache
            .get_or_compute("wx1:msg:1", numbered(&calls, Duration::ZERO))
            .await
            .unwrap();

        assert_eq!(first, "reply-1");
        assert_eq!(second, "reply-2");
    }

    #[tokio::test(start_paused = true)]
    async fn reads_slide_the_ttl() {
        let cache = cache(MemoryStore::new());
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..4 {
            let _: String = cache
                .get_or_compute("wx1:msg:1", numbered(&calls, Duration::ZERO))
                .await
                .unwrap();
            time::advance(Duration::from_secs(10)).await;
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_deliveries_share_one_computation() {
        let cache = cache(MemoryStore::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let slow = Duration::from_millis(200);

        let (a, b) = tokio::join!(
            cache.get_or_compute::<String, _, _>("wx1:msg:9", numbered(&calls, slow)),
            cache.get_or_compute::<String, _, _>("wx1:msg:9", numbered(&calls, slow)),
        );

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(a.unwrap(), b.unwrap());
        assert!(cache.in_flight.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_deliveries_do_not_restart_the_computation() {
        let cache = cache(MemoryStore::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let handler_time = Duration::from_secs(12);

        // The platform gives up on each delivery after 5s and redelivers.
        for _ in 0..2 {
            let delivery = cache.get_or_compute::<String, _, _>(
                "wx1:msg:42",
                numbered(&calls, handler_time),
            );
            assert!(time::timeout(Duration::from_secs(5), delivery).await.is_err());
        }

        let third: String = cache
            .get_or_compute("wx1:msg:42", numbered(&calls, handler_time))
            .await
            .unwrap();
        assert_eq!(third, "reply-1");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(cache.in_flight.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_delivery_still_stores_its_reply() {
        let store = MemoryStore::new();
        let cache = cache(store.clone());
        let calls = Arc::new(AtomicUsize::new(0));

        let delivery = cache.get_or_compute::<String, _, _>(
            "wx1:msg:43",
            numbered(&calls, Duration::from_secs(8)),
        );
        assert!(time::timeout(Duration::from_secs(5), delivery).await.is_err());
        time::sleep(Duration::from_secs(4)).await;

        let stored = store
            .get(&KeySpace::default().reply("wx1:msg:43"))
            .await
            .unwrap();
        assert_eq!(stored.as_deref(), Some("\"reply-1\""));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_computation_stores_nothing() {
        let store = MemoryStore::new();
        let cache = cache(store.clone());

        let err = cache
            .get_or_compute::<String, _, _>("wx1:msg:2", || async {
                Err(RelayError::Upstream {
                    code: 45047,
                    message: "out of response count limit".into(),
                })
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Upstream);
        assert!(store.is_empty());

        let reply: String = cache
            .get_or_compute("wx1:msg:2", || async { Ok("second try".to_string()) })
            .await
            .unwrap();
        assert_eq!(reply, "second try");
    }

    #[tokio::test(start_paused = true)]
    async fn losing_the_store_race_returns_the_winner() {
        let store = MemoryStore::new();
        let cache = cache(store.clone());
        let key = KeySpace::default().reply("wx1:msg:3");

        let elsewhere = store.clone();
        let reply: String = cache
            .get_or_compute("wx1:msg:3", move || async move {
                // Another instance finishes first.
                elsewhere
                    .set_if_absent(&key, "\"from elsewhere\"", DEFAULT_REPLY_TTL)
                    .await
                    .unwrap();
                Ok("ours".to_string())
            })
            .await
            .unwrap();

        assert_eq!(reply, "from elsewhere");
    }

    #[tokio::test(start_paused = true)]
    async fn tombstone_is_retryable_and_never_an_empty_reply() {
        let store = MemoryStore::new();
        let cache = cache(store.clone());
        store
            .set_if_absent(&KeySpace::default().reply("wx1:msg:4"), "null", DEFAULT_REPLY_TTL)
            .await
            .unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let err = cache
            .get_or_compute::<String, _, _>("wx1:msg:4", numbered(&calls, Duration::ZERO))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Retryable);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    /// Hands out one tombstone, then behaves like the wrapped store.
    struct TombstoneOnce {
        inner: Arc<MemoryStore>,
        served: AtomicUsize,
    }

    #[async_trait]
    impl SharedStore for TombstoneOnce {
        fn name(&self) -> &str {
            "tombstone-once"
        }

        async fn get(&self, key: &str) -> RelayResult<Option<String>> {
            self.inner.get(key).await
        }

        async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> RelayResult<bool> {
            self.inner.set_if_absent(key, value, ttl).await
        }

        async fn get_and_refresh_ttl(&self, key: &str, ttl: Duration) -> RelayResult<Option<String>> {
            if self.served.fetch_add(1, Ordering::SeqCst) == 0 {
                return Ok(Some(String::new()));
            }
            self.inner.get_and_refresh_ttl(key, ttl).await
        }

        async fn delete(&self, key: &str) -> RelayResult<()> {
            self.inner.delete(key).await
        }

        async fn delete_if_equals(&self, key: &str, expected: &str) -> RelayResult<bool> {
            self.inner.delete_if_equals(key, expected).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn single_tombstone_read_is_retried() {
        let inner = MemoryStore::new();
        inner
            .set_if_absent(
                &KeySpace::default().reply("wx1:msg:5"),
                "\"stored\"",
                DEFAULT_REPLY_TTL,
            )
            .await
            .unwrap();
        let store = Arc::new(TombstoneOnce {
            inner,
            served: AtomicUsize::new(0),
        });
        let cache = ReplyDeduplicationCache::new(store, DEFAULT_REPLY_TTL);

        let reply: String = cache
            .get_or_compute("wx1:msg:5", || async { Ok("recomputed".to_string()) })
            .await
            .unwrap();
        assert_eq!(reply, "stored");
    }

    #[tokio::test(start_paused = true)]
    async fn forget_drops_the_stored_reply() {
        let cache = cache(MemoryStore::new());
        let _: String = cache
            .get_or_compute("wx1:msg:6", || async { Ok("first".to_string()) })
            .await
            .unwrap();
        cache.forget("wx1:msg:6").await.unwrap();
        let again: String = cache
            .get_or_compute("wx1:msg:6", || async { Ok("second".to_string()) })
            .await
            .unwrap();
        assert_eq!(again, "second");
    }
}
