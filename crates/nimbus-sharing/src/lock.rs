//! Named advisory locks.
//!
//! `lock` is exclusive, `rlock` admits concurrent readers but excludes
//! writers. The in-process backend serializes workers of a single process;
//! the distributed backend coordinates several processes through a shared
//! key/value cache: a random token per acquisition, a TTL extended while
//! the lock is held, release as compare-and-delete against the token, and
//! jittered polling while waiting. Acquisition failure past the wait
//! budget is a distinct `LockTimeout` error.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::RwLock;
use tokio::time::{interval, sleep, timeout, Instant};
use tracing::{debug, warn};

use nimbus_core::config::LockConfig;
use nimbus_core::{random_hex, Error, Result};

/// Poll interval while waiting for a distributed lock.
const POLL_BASE: Duration = Duration::from_millis(50);

/// A held lock. Dropping the lease releases an in-process lock
/// immediately; a distributed hold stops being extended and expires with
/// its TTL. Prefer [`Locker::unlock`] for a prompt release.
pub struct Lease {
    name: String,
    inner: Option<LeaseInner>,
}

enum LeaseInner {
    LocalRead(#[allow(dead_code)] tokio::sync::OwnedRwLockReadGuard<()>),
    LocalWrite(#[allow(dead_code)] tokio::sync::OwnedRwLockWriteGuard<()>),
    Remote {
        token: String,
        refresher: tokio::task::JoinHandle<()>,
    },
}

impl Lease {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if let Some(LeaseInner::Remote { refresher, .. }) = &self.inner {
            refresher.abort();
        }
    }
}

/// Named read/write advisory locks.
#[async_trait]
pub trait Locker: Send + Sync {
    /// Acquire the exclusive lock, waiting up to the configured budget.
    async fn lock(&self, name: &str) -> Result<Lease>;

    /// Acquire a shared lock, waiting up to the configured budget.
    async fn rlock(&self, name: &str) -> Result<Lease>;

    /// Release a held lock.
    async fn unlock(&self, lease: Lease);
}

// === In-process backend ===

/// Locks scoped to this process.
pub struct InProcessLocker {
    locks: DashMap<String, Arc<RwLock<()>>>,
    wait: Duration,
}

impl InProcessLocker {
    pub fn new(wait: Duration) -> Self {
        Self {
            locks: DashMap::new(),
            wait,
        }
    }

    fn slot(&self, name: &str) -> Arc<RwLock<()>> {
        self.locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }
}

#[async_trait]
impl Locker for InProcessLocker {
    async fn lock(&self, name: &str) -> Result<Lease> {
        let slot = self.slot(name);
        let guard = timeout(self.wait, slot.write_owned())
            .await
            .map_err(|_| Error::LockTimeout)?;
        debug!("Lock acquired: name={}", name);
        Ok(Lease {
            name: name.to_string(),
            inner: Some(LeaseInner::LocalWrite(guard)),
        })
    }

    async fn rlock(&self, name: &str) -> Result<Lease> {
        let slot = self.slot(name);
        let guard = timeout(self.wait, slot.read_owned())
            .await
            .map_err(|_| Error::LockTimeout)?;
        Ok(Lease {
            name: name.to_string(),
            inner: Some(LeaseInner::LocalRead(guard)),
        })
    }

    async fn unlock(&self, lease: Lease) {
        debug!("Lock released: name={}", lease.name);
        drop(lease);
    }
}

// === Distributed backend ===

/// The shared key/value cache the distributed backend runs on.
///
/// Each operation must be atomic on the backend (scripts, transactions, or
/// a single-threaded server). [`MemoryKv`] is the reference implementation.
#[async_trait]
pub trait KvCache: Send + Sync {
    /// Take the exclusive slot if free. Re-asserting the same token while
    /// held succeeds.
    async fn try_exclusive(&self, key: &str, token: &str, ttl: Duration) -> Result<bool>;

    /// Join the shared holders if no writer is present.
    async fn try_shared(&self, key: &str, token: &str, ttl: Duration) -> Result<bool>;

    /// Push the expiry of a held token.
    async fn extend(&self, key: &str, token: &str, ttl: Duration) -> Result<bool>;

    /// Compare-and-delete: release only the holder's own token.
    async fn release(&self, key: &str, token: &str) -> Result<bool>;
}

/// Locks coordinated through a shared key/value cache.
pub struct DistributedLocker {
    kv: Arc<dyn KvCache>,
    ttl: Duration,
    wait: Duration,
}

impl DistributedLocker {
    pub fn new(kv: Arc<dyn KvCache>, config: &LockConfig) -> Self {
        Self {
            kv,
            ttl: Duration::from_secs(config.ttl_secs),
            wait: Duration::from_secs(config.wait_timeout_secs),
        }
    }

    async fn acquire(&self, name: &str, exclusive: bool) -> Result<Lease> {
        let token = random_hex(16);
        let deadline = Instant::now() + self.wait;
        loop {
            let granted = if exclusive {
                self.kv.try_exclusive(name, &token, self.ttl).await?
            } else {
                self.kv.try_shared(name, &token, self.ttl).await?
            };
            if granted {
                break;
            }
            if Instant::now() >= deadline {
                return Err(Error::LockTimeout);
            }
            sleep(POLL_BASE + jitter()).await;
        }

        // Keep the hold alive until the lease is dropped or unlocked.
        let kv = self.kv.clone();
        let key = name.to_string();
        let held = token.clone();
        let ttl = self.ttl;
        let refresher = tokio::spawn(async move {
            let mut tick = interval(ttl / 3);
            tick.tick().await;
            loop {
                tick.tick().await;
                match kv.extend(&key, &held, ttl).await {
                    Ok(true) => {}
                    Ok(false) => {
                        warn!("Lock extension lost its hold: name={}", key);
                        break;
                    }
                    Err(e) => {
                        warn!("Lock extension failed: name={}, error={}", key, e);
                        break;
                    }
                }
            }
        });

        debug!("Distributed lock acquired: name={}, exclusive={}", name, exclusive);
        Ok(Lease {
            name: name.to_string(),
            inner: Some(LeaseInner::Remote { token, refresher }),
        })
    }
}

#[async_trait]
impl Locker for DistributedLocker {
    async fn lock(&self, name: &str) -> Result<Lease> {
        self.acquire(name, true).await
    }

    async fn rlock(&self, name: &str) -> Result<Lease> {
        self.acquire(name, false).await
    }

    async fn unlock(&self, mut lease: Lease) {
        if let Some(LeaseInner::Remote { token, refresher }) = lease.inner.take() {
            refresher.abort();
            match self.kv.release(&lease.name, &token).await {
                Ok(true) => debug!("Distributed lock released: name={}", lease.name),
                Ok(false) => warn!("Lock was not held at release: name={}", lease.name),
                Err(e) => warn!("Lock release failed: name={}, error={}", lease.name, e),
            }
        }
    }
}

fn jitter() -> Duration {
    let mut byte = [0u8; 1];
    let _ = getrandom::getrandom(&mut byte);
    Duration::from_millis((byte[0] % 50) as u64)
}

// === Reference key/value cache ===

enum Slot {
    Exclusive { token: String, expires: Instant },
    Shared { holders: HashMap<String, Instant> },
}

/// In-memory [`KvCache`], also used to test the distributed semantics.
#[derive(Default)]
pub struct MemoryKv {
    slots: Mutex<HashMap<String, Slot>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

fn purge(slots: &mut HashMap<String, Slot>, key: &str) {
    let now = Instant::now();
    let empty = match slots.get_mut(key) {
        Some(Slot::Exclusive { expires, .. }) => *expires <= now,
        Some(Slot::Shared { holders }) => {
            holders.retain(|_, expires| *expires > now);
            holders.is_empty()
        }
        None => false,
    };
    if empty {
        slots.remove(key);
    }
}

#[async_trait]
impl KvCache for MemoryKv {
    async fn try_exclusive(&self, key: &str, token: &str, ttl: Duration) -> Result<bool> {
        let mut slots = self.slots.lock();
        purge(&mut slots, key);
        match slots.get(key) {
            None => {
                slots.insert(
                    key.to_string(),
                    Slot::Exclusive {
                        token: token.to_string(),
                        expires: Instant::now() + ttl,
                    },
                );
                Ok(true)
            }
            Some(Slot::Exclusive { token: held, .. }) if held == token => {
                slots.insert(
                    key.to_string(),
                    Slot::Exclusive {
                        token: token.to_string(),
                        expires: Instant::now() + ttl,
                    },
                );
                Ok(true)
            }
            Some(_) => Ok(false),
        }
    }

    async fn try_shared(&self, key: &str, token: &str, ttl: Duration) -> Result<bool> {
        let mut slots = self.slots.lock();
        purge(&mut slots, key);
        match slots.get_mut(key) {
            None => {
                let mut holders = HashMap::new();
                holders.insert(token.to_string(), Instant::now() + ttl);
                slots.insert(key.to_string(), Slot::Shared { holders });
                Ok(true)
            }
            Some(Slot::Shared { holders }) => {
                holders.insert(token.to_string(), Instant::now() + ttl);
                Ok(true)
            }
            Some(Slot::Exclusive { .. }) => Ok(false),
        }
    }

    async fn extend(&self, key: &str, token: &str, ttl: Duration) -> Result<bool> {
        let mut slots = self.slots.lock();
        match slots.get_mut(key) {
            Some(Slot::Exclusive { token: held, expires }) if held == token => {
                *expires = Instant::now() + ttl;
                Ok(true)
            }
            Some(Slot::Shared { holders }) => match holders.get_mut(token) {
                Some(expires) => {
                    *expires = Instant::now() + ttl;
                    Ok(true)
                }
                None => Ok(false),
            },
            _ => Ok(false),
        }
    }

    async fn release(&self, key: &str, token: &str) -> Result<bool> {
        let mut slots = self.slots.lock();
        let released = match slots.get_mut(key) {
            Some(Slot::Exclusive { token: held, .. }) => {
                if held == token {
                    slots.remove(key);
                    true
                } else {
                    false
                }
            }
            Some(Slot::Shared { holders }) => {
                let hit = holders.remove(token).is_some();
                if holders.is_empty() {
                    slots.remove(key);
                }
                hit
            }
            None => false,
        };
        Ok(released)
    }
}

/// Pick the lock backend the configuration asks for.
///
/// `lock.url` selects the distributed backend; the cache client itself is
/// provided by the hosting process.
pub fn build_locker(config: &LockConfig, kv: Option<Arc<dyn KvCache>>) -> Arc<dyn Locker> {
    match (&config.url, kv) {
        (Some(_), Some(kv)) => Arc::new(DistributedLocker::new(kv, config)),
        _ => Arc::new(InProcessLocker::new(Duration::from_secs(
            config.wait_timeout_secs,
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local(wait_ms: u64) -> InProcessLocker {
        InProcessLocker::new(Duration::from_millis(wait_ms))
    }

    fn distributed(kv: Arc<MemoryKv>, wait_secs: u64) -> DistributedLocker {
        let config = LockConfig {
            url: Some("redis://test".to_string()),
            wait_timeout_secs: wait_secs,
            ttl_secs: 20,
        };
        DistributedLocker::new(kv, &config)
    }

    #[tokio::test]
    async fn test_in_process_exclusive() {
        let locker = local(10);
        let lease = locker.lock("a").await.unwrap();

        // A second writer times out while the first holds the lock.
        assert!(matches!(locker.lock("a").await, Err(Error::LockTimeout)));

        locker.unlock(lease).await;
        let again = locker.lock("a").await.unwrap();
        locker.unlock(again).await;
    }

    #[tokio::test]
    async fn test_in_process_readers_share() {
        let locker = local(10);
        let r1 = locker.rlock("a").await.unwrap();
        let r2 = locker.rlock("a").await.unwrap();

        // Readers exclude the writer.
        assert!(matches!(locker.lock("a").await, Err(Error::LockTimeout)));

        locker.unlock(r1).await;
        locker.unlock(r2).await;
        let w = locker.lock("a").await.unwrap();
        locker.unlock(w).await;
    }

    #[tokio::test]
    async fn test_in_process_names_are_independent() {
        let locker = local(10);
        let a = locker.lock("a").await.unwrap();
        let b = locker.lock("b").await.unwrap();
        locker.unlock(a).await;
        locker.unlock(b).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_distributed_exclusive_and_timeout() {
        let kv = Arc::new(MemoryKv::new());
        let locker = distributed(kv.clone(), 1);
        let lease = locker.lock("a").await.unwrap();

        assert!(matches!(locker.lock("a").await, Err(Error::LockTimeout)));

        locker.unlock(lease).await;
        let again = locker.lock("a").await.unwrap();
        locker.unlock(again).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_distributed_shared_holders() {
        let kv = Arc::new(MemoryKv::new());
        let locker = distributed(kv.clone(), 1);
        let r1 = locker.rlock("a").await.unwrap();
        let r2 = locker.rlock("a").await.unwrap();
        assert!(matches!(locker.lock("a").await, Err(Error::LockTimeout)));
        locker.unlock(r1).await;
        locker.unlock(r2).await;
        let w = locker.lock("a").await.unwrap();
        locker.unlock(w).await;
    }

    #[tokio::test]
    async fn test_release_requires_matching_token() {
        let kv = MemoryKv::new();
        let ttl = Duration::from_secs(10);
        assert!(kv.try_exclusive("a", "tok1", ttl).await.unwrap());
        // A stranger's compare-and-delete does nothing.
        assert!(!kv.release("a", "tok2").await.unwrap());
        assert!(!kv.try_exclusive("a", "tok3", ttl).await.unwrap());
        // The holder's does.
        assert!(kv.release("a", "tok1").await.unwrap());
        assert!(kv.try_exclusive("a", "tok3", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_hold_can_be_taken_over() {
        let kv = MemoryKv::new();
        assert!(kv
            .try_exclusive("a", "tok1", Duration::from_millis(0))
            .await
            .unwrap());
        // The TTL elapsed; the slot is free again.
        assert!(kv
            .try_exclusive("a", "tok2", Duration::from_secs(10))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_extend_keeps_hold() {
        let kv = MemoryKv::new();
        let ttl = Duration::from_secs(10);
        assert!(kv.try_exclusive("a", "tok1", ttl).await.unwrap());
        assert!(kv.extend("a", "tok1", ttl).await.unwrap());
        assert!(!kv.extend("a", "tok2", ttl).await.unwrap());
        assert!(!kv.extend("missing", "tok1", ttl).await.unwrap());
    }
}
