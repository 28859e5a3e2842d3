//! Distributed mutual exclusion for scarce shared resources (test devices,
//! the gradle build slot).
//!
//! Workers may run as several processes on one host or spread over multiple
//! hosts sharing a device rack, so exclusivity has to come from a shared
//! coordination store, not an in-process mutex. Callers depend only on the
//! `LockProvider` trait; the Redis implementation is the production one,
//! the in-memory implementation serves tests and single-process setups.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::time::{sleep, Instant};
use uuid::Uuid;

const LOCK_KEY_PREFIX: &str = "droidgrade:lock";
const ACQUIRE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Leases expire on their own well after any sane check duration, so a
/// crashed worker cannot strand a device forever.
const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock backend failure: {0}")]
    Backend(String),
}

impl From<redis::RedisError> for LockError {
    fn from(err: redis::RedisError) -> Self {
        LockError::Backend(err.to_string())
    }
}

/// An exclusive claim on a named lock. Release it exactly once by value;
/// dropping an unreleased lease frees it on a best-effort detached task.
#[async_trait]
pub trait Lease: Send + Sync {
    async fn release(self: Box<Self>) -> Result<(), LockError>;
}

#[async_trait]
pub trait LockProvider: Send + Sync {
    /// Try to acquire the named exclusive lock, polling until `timeout`
    /// elapses. `None` means the lock stayed held elsewhere; a zero timeout
    /// makes this a single non-blocking attempt.
    async fn try_acquire(
        &self,
        name: &str,
        timeout: Duration,
    ) -> Result<Option<Box<dyn Lease>>, LockError>;
}

pub fn lock_key(name: &str) -> String {
    format!("{LOCK_KEY_PREFIX}:{name}")
}

/// Redis-backed lock: `SET NX PX` with a per-lease token, released by a
/// compare-and-delete script so an expired lease can never delete a lock
/// that has since been granted to someone else.
#[derive(Clone)]
pub struct RedisLockProvider {
    conn: redis::aio::ConnectionManager,
    lease_ttl: Duration,
}

impl RedisLockProvider {
    pub fn new(conn: redis::aio::ConnectionManager) -> Self {
        Self::with_lease_ttl(conn, DEFAULT_LEASE_TTL)
    }

    pub fn with_lease_ttl(conn: redis::aio::ConnectionManager, lease_ttl: Duration) -> Self {
        Self { conn, lease_ttl }
    }

    async fn try_acquire_once(&self, key: &str, token: &str) -> Result<bool, LockError> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(self.lease_ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }
}

#[async_trait]
impl LockProvider for RedisLockProvider {
    async fn try_acquire(
        &self,
        name: &str,
        timeout: Duration,
    ) -> Result<Option<Box<dyn Lease>>, LockError> {
        let key = lock_key(name);
        let token = Uuid::new_v4().to_string();
        let deadline = Instant::now() + timeout;

        loop {
            if self.try_acquire_once(&key, &token).await? {
                return Ok(Some(Box::new(RedisLease {
                    conn: self.conn.clone(),
                    key,
                    token,
                    released: false,
                })));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            sleep(ACQUIRE_POLL_INTERVAL).await;
        }
    }
}

const RELEASE_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("del", KEYS[1])
else
    return 0
end
"#;

async fn delete_if_owned(
    conn: redis::aio::ConnectionManager,
    key: &str,
    token: &str,
) -> Result<bool, LockError> {
    let mut conn = conn;
    let deleted: i32 = redis::Script::new(RELEASE_SCRIPT)
        .key(key)
        .arg(token)
        .invoke_async(&mut conn)
        .await?;
    Ok(deleted == 1)
}

struct RedisLease {
    conn: redis::aio::ConnectionManager,
    key: String,
    token: String,
    released: bool,
}

#[async_trait]
impl Lease for RedisLease {
    async fn release(mut self: Box<Self>) -> Result<(), LockError> {
        self.released = true;
        let owned = delete_if_owned(self.conn.clone(), &self.key, &self.token).await?;
        if !owned {
            tracing::warn!(key = %self.key, "lease had already expired before release");
        }
        Ok(())
    }
}

impl Drop for RedisLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        // Cannot be async in Drop; free the lock on a detached task. If the
        // runtime is already gone the TTL reclaims the lock instead.
        let conn = self.conn.clone();
        let key = std::mem::take(&mut self.key);
        let token = std::mem::take(&mut self.token);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(err) = delete_if_owned(conn, &key, &token).await {
                    tracing::warn!(key = %key, error = %err, "failed to release abandoned lease");
                }
            });
        }
    }
}

/// Process-local provider with the same semantics, for tests and
/// single-process deployments.
#[derive(Clone, Default)]
pub struct MemoryLockProvider {
    held: Arc<Mutex<HashSet<String>>>,
}

impl MemoryLockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    fn grab(&self, name: &str) -> bool {
        self.held
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(name.to_string())
    }
}

#[async_trait]
impl LockProvider for MemoryLockProvider {
    async fn try_acquire(
        &self,
        name: &str,
        timeout: Duration,
    ) -> Result<Option<Box<dyn Lease>>, LockError> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.grab(name) {
                return Ok(Some(Box::new(MemoryLease {
                    held: self.held.clone(),
                    name: name.to_string(),
                    released: false,
                })));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            sleep(ACQUIRE_POLL_INTERVAL).await;
        }
    }
}

struct MemoryLease {
    held: Arc<Mutex<HashSet<String>>>,
    name: String,
    released: bool,
}

impl MemoryLease {
    fn free(&self) {
        self.held
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&self.name);
    }
}

#[async_trait]
impl Lease for MemoryLease {
    async fn release(mut self: Box<Self>) -> Result<(), LockError> {
        self.released = true;
        self.free();
        Ok(())
    }
}

impl Drop for MemoryLease {
    fn drop(&mut self) {
        if !self.released {
            self.free();
        }
    }
}
