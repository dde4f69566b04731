#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use roster_sync::cache::{CacheError, MemoryCache, RosterCache};
use roster_sync::catalog::StaticCatalog;
use roster_sync::config::SyncConfig;
use roster_sync::predictor::{BktParams, BktPredictor, Predictor};
use roster_sync::store::{DurableStore, MemoryStore};
use roster_sync::sync::lease::{Lease, LeaseError, LeaseProvider, LocalLease};
use roster_sync::RosterCoordinator;

pub const TOPICS: [&str; 3] = ["ohms-law", "kirchhoff", "thevenin"];

/// Everything a worker shares with its peers.
#[derive(Clone)]
pub struct Shared {
    pub cache: MemoryCache,
    pub store: MemoryStore,
    pub lease: LocalLease,
}

impl Shared {
    pub fn new() -> Self {
        Self {
            cache: MemoryCache::new(),
            store: MemoryStore::new(),
            lease: LocalLease::new(),
        }
    }

    pub fn worker(&self) -> RosterCoordinator {
        self.worker_with(test_config(), bkt())
    }

    pub fn worker_with(&self, config: SyncConfig, predictor: Arc<dyn Predictor>) -> RosterCoordinator {
        coordinator(
            config,
            Arc::new(self.cache.clone()),
            Arc::new(self.store.clone()),
            Arc::new(self.lease.clone()),
            predictor,
        )
    }
}

pub fn test_config() -> SyncConfig {
    SyncConfig {
        operation_timeout: Duration::from_secs(5),
        max_convergence_attempts: 3,
        ..SyncConfig::default()
    }
}

pub fn bkt() -> Arc<dyn Predictor> {
    Arc::new(BktPredictor::with_default(BktParams::default()))
}

pub fn coordinator(
    config: SyncConfig,
    cache: Arc<dyn RosterCache>,
    store: Arc<dyn DurableStore>,
    lease: Arc<dyn LeaseProvider>,
    predictor: Arc<dyn Predictor>,
) -> RosterCoordinator {
    RosterCoordinator::new(
        config,
        cache,
        store,
        lease,
        Arc::new(StaticCatalog::new(TOPICS)),
        predictor,
    )
}

/// Seeded single worker on fresh in-memory backends.
pub async fn ready_worker() -> (Shared, RosterCoordinator) {
    let shared = Shared::new();
    let worker = shared.worker();
    worker.bootstrap().await.unwrap();
    (shared, worker)
}

/// Cache that accepts writes but never stores them after the first
/// `accepted` calls.
pub struct DroppingCache {
    inner: MemoryCache,
    accepted: parking_lot::Mutex<usize>,
}

impl DroppingCache {
    pub fn new(inner: MemoryCache, accepted: usize) -> Self {
        Self {
            inner,
            accepted: parking_lot::Mutex::new(accepted),
        }
    }
}

#[async_trait]
impl RosterCache for DroppingCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<(), CacheError> {
        let pass = {
            let mut accepted = self.accepted.lock();
            if *accepted > 0 {
                *accepted -= 1;
                true
            } else {
                false
            }
        };
        if pass {
            self.inner.set(key, value).await?;
        }
        Ok(())
    }
}

/// Cache whose reads are slower than any sane deadline.
pub struct SlowCache {
    pub inner: MemoryCache,
    pub delay: Duration,
}

#[async_trait]
impl RosterCache for SlowCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        tokio::time::sleep(self.delay).await;
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<(), CacheError> {
        self.inner.set(key, value).await
    }
}

/// Lock that is only granted after the caller's deadline has passed, the
/// way a remote lock can be won on the last poll before timing out.
#[derive(Default)]
pub struct LateLease {
    pub granted: AtomicUsize,
    pub released: AtomicUsize,
}

#[async_trait]
impl LeaseProvider for LateLease {
    async fn acquire(&self, deadline: tokio::time::Instant) -> Result<Lease, LeaseError> {
        tokio::time::sleep_until(deadline + Duration::from_millis(20)).await;
        let fencing_token = self.granted.fetch_add(1, Ordering::SeqCst) as u64 + 1;
        Ok(Lease::new(format!("late-{fencing_token}"), fencing_token))
    }

    async fn release(&self, _lease: Lease) -> Result<(), LeaseError> {
        self.released.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
