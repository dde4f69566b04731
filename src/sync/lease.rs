//! Roster-wide mutual exclusion.
//!
//! `LocalLease` serializes every holder that shares the same instance, which
//! covers one process (or several coordinators in one test). `RedisLease`
//! extends the same guarantee to worker processes that share a Redis server:
//! the lock key is taken with `SET NX PX`, every successful acquisition bumps
//! a fencing counter, and release only deletes the key if it still carries
//! our token.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use rand::Rng;
use redis::AsyncCommands;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

use crate::cache::keys::fencing_token_key;
use crate::config::LeaseConfig;

const POLL_JITTER_RATIO: f64 = 0.2;

const RELEASE_SCRIPT: &str = r#"
  if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("del", KEYS[1])
  else
    return 0
  end
"#;

#[derive(Debug)]
pub struct Lease {
    token: String,
    fencing_token: u64,
    _permit: Option<OwnedSemaphorePermit>,
}

impl Lease {
    /// Lease held through an external lock, identified by `token`.
    pub fn new(token: impl Into<String>, fencing_token: u64) -> Self {
        Self {
            token: token.into(),
            fencing_token,
            _permit: None,
        }
    }

    pub fn fencing_token(&self) -> u64 {
        self.fencing_token
    }
}

#[async_trait]
pub trait LeaseProvider: Send + Sync {
    /// Waits until the lease is free or `deadline` passes.
    ///
    /// Callers never cancel this future, so an implementation that has taken
    /// its lock must return the lease even when the deadline has passed.
    async fn acquire(&self, deadline: Instant) -> Result<Lease, LeaseError>;

    async fn release(&self, lease: Lease) -> Result<(), LeaseError>;
}

#[derive(Debug, Error)]
pub enum LeaseError {
    #[error("lease not acquired before deadline")]
    Timeout,
    #[error("lease {0} expired before release")]
    Lost(String),
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// In-process lease. Dropping a `Lease` returns the permit, so a cancelled
/// holder cannot wedge the roster.
#[derive(Clone)]
pub struct LocalLease {
    permits: Arc<Semaphore>,
    fencing_token: Arc<AtomicU64>,
}

impl LocalLease {
    pub fn new() -> Self {
        Self {
            permits: Arc::new(Semaphore::new(1)),
            fencing_token: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn is_held(&self) -> bool {
        self.permits.available_permits() == 0
    }
}

impl Default for LocalLease {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LeaseProvider for LocalLease {
    async fn acquire(&self, deadline: Instant) -> Result<Lease, LeaseError> {
        let permit = tokio::time::timeout_at(deadline, Arc::clone(&self.permits).acquire_owned())
            .await
            .map_err(|_| LeaseError::Timeout)?
            .map_err(|_| LeaseError::Timeout)?;

        let fencing_token = self.fencing_token.fetch_add(1, Ordering::Relaxed) + 1;
        Ok(Lease {
            token: format!("local-{fencing_token}"),
            fencing_token,
            _permit: Some(permit),
        })
    }

    async fn release(&self, lease: Lease) -> Result<(), LeaseError> {
        drop(lease);
        Ok(())
    }
}

#[derive(Clone)]
pub struct RedisLease {
    client: redis::Client,
    config: LeaseConfig,
    instance_id: String,
}

impl RedisLease {
    pub fn new(client: redis::Client, config: LeaseConfig) -> Self {
        Self {
            client,
            config,
            instance_id: generate_instance_id(),
        }
    }

    pub fn open(redis_url: &str, config: LeaseConfig) -> Result<Self, LeaseError> {
        Ok(Self::new(redis::Client::open(redis_url)?, config))
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }
}

#[async_trait]
impl LeaseProvider for RedisLease {
    async fn acquire(&self, deadline: Instant) -> Result<Lease, LeaseError> {
        let mut conn =
            tokio::time::timeout_at(deadline, self.client.get_multiplexed_tokio_connection())
                .await
                .map_err(|_| LeaseError::Timeout)??;
        let token = format!("{}-{}", self.instance_id, uuid::Uuid::new_v4());
        let ttl_ms = duration_ms(self.config.ttl);

        loop {
            let acquired: Option<String> = redis::cmd("SET")
                .arg(&self.config.key)
                .arg(&token)
                .arg("NX")
                .arg("PX")
                .arg(ttl_ms)
                .query_async(&mut conn)
                .await?;

            if acquired.is_some() {
                let incremented: Result<u64, redis::RedisError> =
                    conn.incr(fencing_token_key(&self.config.key), 1u64).await;
                return match incremented {
                    Ok(fencing_token) => Ok(Lease::new(token, fencing_token)),
                    Err(err) => {
                        let lease = Lease::new(token, 0);
                        if let Err(release_err) = self.release(lease).await {
                            tracing::warn!(error = %release_err, "failed to give back lock after fencing error");
                        }
                        Err(err.into())
                    }
                };
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(LeaseError::Timeout);
            }
            let wake = (now + jittered(self.config.poll_interval)).min(deadline);
            tokio::time::sleep_until(wake).await;
        }
    }

    async fn release(&self, lease: Lease) -> Result<(), LeaseError> {
        let mut conn = self.client.get_multiplexed_tokio_connection().await?;
        let deleted: i64 = redis::Script::new(RELEASE_SCRIPT)
            .key(&self.config.key)
            .arg(&lease.token)
            .invoke_async(&mut conn)
            .await?;

        if deleted == 0 {
            return Err(LeaseError::Lost(lease.token));
        }
        Ok(())
    }
}

fn jittered(interval: Duration) -> Duration {
    let base_ms = interval.as_millis() as f64;
    let factor = rand::rng().random_range(1.0 - POLL_JITTER_RATIO..=1.0 + POLL_JITTER_RATIO);
    Duration::from_millis((base_ms * factor).round().max(1.0) as u64)
}

fn duration_ms(value: Duration) -> u64 {
    value.as_millis() as u64
}

fn generate_instance_id() -> String {
    let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
    let pid = std::process::id();
    let now_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    format!("{hostname}-{pid}-{now_ms}")
}
