//! Lease locks serializing work across gateway instances.
//!
//! A lock is a store entry written with `set_if_absent` and an expiry, so a
//! holder that crashes mid-operation only blocks others until the lease runs
//! out. Without a shared store the mutex falls back to a process-local lease
//! table with the same semantics, which is only safe for one instance.

use crate::error::RelayError;
use crate::store::SharedStore;
use parking_lot::Mutex;
use rand::RngExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{self, Instant};

const HOLDER_TOKEN_LEN: usize = 12;

/// Result of a `try_lock` call. `Busy` is the normal outcome under
/// contention, not an error.
#[derive(Debug)]
pub enum LockAttempt {
    Acquired(LockHandle),
    Busy,
}

impl LockAttempt {
    pub fn is_acquired(&self) -> bool {
        matches!(self, Self::Acquired(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnlockOutcome {
    Released,
    /// The lease had already run out.
    Expired,
    /// Someone else holds the lease now; it was left untouched.
    NotOwner,
    /// The store could not be reached; the lease will expire on its own.
    Abandoned,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHandle {
    name: String,
    holder: String,
    expires_at: Instant,
}

impl LockHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// `{acquisition-token}@{instance-id}`.
    pub fn holder(&self) -> &str {
        &self.holder
    }

    pub fn expires_at(&self) -> Instant {
        self.expires_at
    }
}

/// Releases its lease when dropped, so a cancelled holder does not keep the
/// lock until the lease runs out. Prefer [`LeaseGuard::release`], which
/// waits for the release and reports its outcome.
#[must_use = "dropping the guard releases the lock"]
pub struct LeaseGuard {
    mutex: Arc<DistributedMutex>,
    handle: Option<LockHandle>,
}

impl LeaseGuard {
    pub fn new(mutex: Arc<DistributedMutex>, handle: LockHandle) -> Self {
        Self {
            mutex,
            handle: Some(handle),
        }
    }

    pub fn handle(&self) -> Option<&LockHandle> {
        self.handle.as_ref()
    }

    pub async fn release(mut self) -> UnlockOutcome {
        let Some(handle) = &self.handle else {
            return UnlockOutcome::Expired;
        };
        let outcome = self.mutex.unlock(handle).await;
        self.handle = None;
        outcome
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                tracing::debug!("lock `{}` dropped while held, releasing", handle.name);
                let mutex = Arc::clone(&self.mutex);
                runtime.spawn(async move {
                    mutex.unlock(&handle).await;
                });
            }
            Err(_) => tracing::warn!(
                "lock `{}` dropped outside a runtime, lease left to expire",
                handle.name
            ),
        }
    }
}

#[derive(Debug, Clone)]
struct LocalLease {
    holder: String,
    expires_at: Instant,
}

enum LockBackend {
    Shared(Arc<dyn SharedStore>),
    Local(Mutex<HashMap<String, LocalLease>>),
}

pub struct DistributedMutex {
    backend: LockBackend,
    instance_id: String,
    lease: Duration,
    poll_interval: Duration,
}

impl DistributedMutex {
    pub fn shared(store: Arc<dyn SharedStore>, lease: Duration) -> Self {
        Self::with_backend(LockBackend::Shared(store), lease)
    }

    pub fn local(lease: Duration) -> Self {
        Self::with_backend(LockBackend::Local(Mutex::new(HashMap::new())), lease)
    }

    fn with_backend(backend: LockBackend, lease: Duration) -> Self {
        Self {
            backend,
            instance_id: uuid::Uuid::new_v4().simple().to_string(),
            lease: lease.max(Duration::from_millis(1)),
            poll_interval: Duration::from_millis(25),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval.max(Duration::from_millis(1));
        self
    }

    pub fn with_instance_id(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = instance_id.into();
        self
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn is_distributed(&self) -> bool {
        matches!(self.backend, LockBackend::Shared(_))
    }

    /// [`try_lock`](Self::try_lock) returning a guard that releases the
    /// lease even if the holder is dropped before finishing.
    pub async fn try_lock_guarded(
        self: &Arc<Self>,
        name: &str,
        timeout: Duration,
    ) -> Option<LeaseGuard> {
        match self.try_lock(name, timeout).await {
            LockAttempt::Acquired(handle) => Some(LeaseGuard::new(Arc::clone(self), handle)),
            LockAttempt::Busy => None,
        }
    }

    /// Tries to take the lease on `name`, polling until `timeout` elapses.
    /// A zero timeout makes exactly one attempt.
    pub async fn try_lock(&self, name: &str, timeout: Duration) -> LockAttempt {
        let holder = self.next_holder();
        let deadline = Instant::now() + timeout;

        loop {
            if let Some(handle) = self.acquire_once(name, &holder).await {
                tracing::debug!("lock `{name}` acquired by {holder}");
                return LockAttempt::Acquired(handle);
            }

            let now = Instant::now();
            if now >= deadline {
                tracing::debug!("lock `{name}` busy after {}ms", timeout.as_millis());
                return LockAttempt::Busy;
            }
            time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    /// Releases the lease if `handle` still owns it. Never fails; anomalies
    /// are logged and reported through the outcome.
    pub async fn unlock(&self, handle: &LockHandle) -> UnlockOutcome {
        let outcome = match &self.backend {
            LockBackend::Shared(store) => Self::unlock_shared(store.as_ref(), handle).await,
            LockBackend::Local(leases) => Self::unlock_local(leases, handle),
        };

        match outcome {
            UnlockOutcome::Released => {
                tracing::debug!("lock `{}` released by {}", handle.name, handle.holder);
            }
            UnlockOutcome::Expired => {
                tracing::info!(
                    "lock `{}` had already expired before release by {}",
                    handle.name,
                    handle.holder
                );
            }
            UnlockOutcome::NotOwner | UnlockOutcome::Abandoned => {}
        }
        outcome
    }

    /// Whether any live lease exists on `name`.
    pub async fn is_locked(&self, name: &str) -> bool {
        match &self.backend {
            LockBackend::Shared(store) => store.get(name).await.ok().flatten().is_some(),
            LockBackend::Local(leases) => {
                let now = Instant::now();
                leases
                    .lock()
                    .get(name)
                    .is_some_and(|lease| lease.expires_at > now)
            }
        }
    }

    fn next_holder(&self) -> String {
        format!("{}@{}", random_holder_token(), self.instance_id)
    }

    async fn acquire_once(&self, name: &str, holder: &str) -> Option<LockHandle> {
        let expires_at = Instant::now() + self.lease;
        let acquired = match &self.backend {
            LockBackend::Shared(store) => {
                match store.set_if_absent(name, holder, self.lease).await {
                    Ok(acquired) => acquired,
                    Err(err) => {
                        tracing::warn!("lock `{name}` acquisition failed, treating as busy: {err}");
                        false
                    }
                }
            }
            LockBackend::Local(leases) => {
                let now = Instant::now();
                let mut leases = leases.lock();
                leases.retain(|_, lease| lease.expires_at > now);
                if leases.contains_key(name) {
                    false
                } else {
                    leases.insert(
                        name.to_string(),
                        LocalLease {
                            holder: holder.to_string(),
                            expires_at,
                        },
                    );
                    true
                }
            }
        };

        acquired.then(|| LockHandle {
            name: name.to_string(),
            holder: holder.to_string(),
            expires_at,
        })
    }

    async fn unlock_shared(store: &dyn SharedStore, handle: &LockHandle) -> UnlockOutcome {
        match store.delete_if_equals(&handle.name, &handle.holder).await {
            Ok(true) => return UnlockOutcome::Released,
            Ok(false) => {}
            Err(err) => {
                tracing::warn!(
                    "lock `{}` release skipped, lease left to expire: {err}",
                    handle.name
                );
                return UnlockOutcome::Abandoned;
            }
        }

        // Nothing was deleted; the read only tells why.
        match store.get(&handle.name).await {
            Ok(None) | Err(_) => UnlockOutcome::Expired,
            Ok(Some(owner)) => {
                warn_ownership_violation(handle, owner);
                UnlockOutcome::NotOwner
            }
        }
    }

    fn unlock_local(
        leases: &Mutex<HashMap<String, LocalLease>>,
        handle: &LockHandle,
    ) -> UnlockOutcome {
        let now = Instant::now();
        let mut leases = leases.lock();
        let Some(lease) = leases.get(&handle.name) else {
            return UnlockOutcome::Expired;
        };
        if lease.expires_at <= now {
            leases.remove(&handle.name);
            return UnlockOutcome::Expired;
        }
        if lease.holder != handle.holder {
            warn_ownership_violation(handle, lease.holder.clone());
            return UnlockOutcome::NotOwner;
        }
        leases.remove(&handle.name);
        UnlockOutcome::Released
    }
}

fn warn_ownership_violation(handle: &LockHandle, owner: String) {
    let violation = RelayError::OwnershipViolation {
        name: handle.name.clone(),
        owner,
        caller: handle.holder.clone(),
    };
    tracing::warn!("{violation}");
}

fn random_holder_token() -> String {
    const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::rng();
    (0..HOLDER_TOKEN_LEN)
        .map(|_| CHARSET[rng.random_range(0..CHARSET.len())] as char)
        .collect()
}
