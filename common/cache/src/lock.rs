//! Key-scoped distributed mutex on top of Redis.
//!
//! A lock is a plain string key set with `SET NX PX` to a random token. While
//! held, a watchdog task re-arms the lease every third of its length using a
//! compare-and-pexpire, so a slow holder keeps the lock and a crashed one loses
//! it once the lease runs out. Release is a compare-and-delete on the token, so
//! a holder can never delete a lock that has since passed to someone else.

use common_redis::{Client as RedisClient, CustomRedisError};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::ttl::as_px;

#[derive(Debug, Clone)]
pub struct LockConfig {
    /// Prepended to the locked name, e.g. `lock:` + `article:7`
    pub key_prefix: String,
    /// How long `acquire` keeps trying before giving up
    pub wait: Duration,
    /// Lease length; the watchdog extends it while the guard is alive
    pub lease: Duration,
    /// Delay between acquisition attempts
    pub poll_interval: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            key_prefix: "lock:".to_string(),
            wait: Duration::from_secs(5),
            lease: Duration::from_secs(30),
            poll_interval: Duration::from_millis(50),
        }
    }
}

#[derive(Clone)]
pub struct RedisMutex {
    redis: Arc<dyn RedisClient + Send + Sync>,
    config: LockConfig,
}

impl RedisMutex {
    pub fn new(redis: Arc<dyn RedisClient + Send + Sync>, config: LockConfig) -> Self {
        Self { redis, config }
    }

    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    /// Single acquisition attempt.
    pub async fn try_acquire(&self, name: &str) -> Result<Option<LockGuard>, CustomRedisError> {
        let key = format!("{}{}", self.config.key_prefix, name);
        let token = Uuid::new_v4().to_string();

        let acquired = self
            .redis
            .set_nx_px(key.clone(), token.clone(), as_px(self.config.lease))
            .await?;
        if !acquired {
            return Ok(None);
        }

        debug!(lock = %key, "acquired lock");
        Ok(Some(LockGuard::start(
            self.redis.clone(),
            key,
            token,
            self.config.lease,
        )))
    }

    /// Poll for the lock until `wait` elapses. `Ok(None)` means the wait timed out.
    pub async fn acquire(&self, name: &str) -> Result<Option<LockGuard>, CustomRedisError> {
        let deadline = Instant::now() + self.config.wait;
        loop {
            if let Some(guard) = self.try_acquire(name).await? {
                return Ok(Some(guard));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(self.config.poll_interval.min(deadline - now)).await;
        }
    }
}

/// A held lock. Call [`LockGuard::release`] when done; dropping the guard only
/// stops the watchdog and leaves the key to expire with its lease.
pub struct LockGuard {
    redis: Arc<dyn RedisClient + Send + Sync>,
    key: String,
    token: String,
    stop: CancellationToken,
    watchdog: Option<JoinHandle<()>>,
}

impl LockGuard {
    fn start(
        redis: Arc<dyn RedisClient + Send + Sync>,
        key: String,
        token: String,
        lease: Duration,
    ) -> Self {
        let stop = CancellationToken::new();
        let watchdog = tokio::spawn(run_watchdog(
            redis.clone(),
            key.clone(),
            token.clone(),
            lease,
            stop.clone(),
        ));

        Self {
            redis,
            key,
            token,
            stop,
            watchdog: Some(watchdog),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Stop the watchdog and delete the lock if it is still ours.
    /// Returns false when the lock had already expired or changed hands.
    pub async fn release(mut self) -> Result<bool, CustomRedisError> {
        self.stop.cancel();
        if let Some(handle) = self.watchdog.take() {
            if let Err(e) = handle.await {
                warn!(lock = %self.key, error = ?e, "lock watchdog ended abnormally");
            }
        }

        let released = self
            .redis
            .del_if_eq(self.key.clone(), self.token.clone())
            .await?;
        if !released {
            warn!(lock = %self.key, "lock was no longer held at release");
        }
        Ok(released)
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.stop.cancel();
        if let Some(handle) = self.watchdog.take() {
            handle.abort();
        }
    }
}

async fn run_watchdog(
    redis: Arc<dyn RedisClient + Send + Sync>,
    key: String,
    token: String,
    lease: Duration,
    stop: CancellationToken,
) {
    let period = (lease / 3).max(Duration::from_millis(1));
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);

    loop {
        tokio::select! {
            _ = stop.cancelled() => return,
            _ = ticker.tick() => {
                match redis.pexpire_if_eq(key.clone(), token.clone(), as_px(lease)).await {
                    Ok(true) => debug!(lock = %key, "extended lock lease"),
                    Ok(false) => {
                        warn!(lock = %key, "lock lost before lease could be extended");
                        return;
                    }
                    Err(e) => warn!(lock = %key, error = %e, "failed to extend lock lease"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common_redis::MockRedisClient;

    fn mutex(redis: &MockRedisClient, wait_ms: u64, lease_ms: u64) -> RedisMutex {
        RedisMutex::new(
            Arc::new(redis.clone()),
            LockConfig {
                key_prefix: "lock:".to_string(),
                wait: Duration::from_millis(wait_ms),
                lease: Duration::from_millis(lease_ms),
                poll_interval: Duration::from_millis(10),
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_lock_is_exclusive_until_released() {
        let redis = MockRedisClient::new();
        let mutex = mutex(&redis, 100, 30_000);

        let guard = mutex.try_acquire("article:7").await.unwrap().unwrap();
        assert_eq!(guard.key(), "lock:article:7");
        assert!(mutex.try_acquire("article:7").await.unwrap().is_none());

        // other names are independent
        let other = mutex.try_acquire("article:8").await.unwrap();
        assert!(other.is_some());

        assert!(guard.release().await.unwrap());
        assert!(mutex.try_acquire("article:7").await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_times_out_after_wait() {
        let redis = MockRedisClient::new();
        let mutex = mutex(&redis, 100, 30_000);
        let _held = mutex.try_acquire("k").await.unwrap().unwrap();

        let started = Instant::now();
        let second = mutex.acquire("k").await.unwrap();
        assert!(second.is_none());
        assert!(started.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_succeeds_once_holder_releases() {
        let redis = MockRedisClient::new();
        let mutex = mutex(&redis, 1_000, 30_000);
        let held = mutex.try_acquire("k").await.unwrap().unwrap();

        let waiter = {
            let mutex = mutex.clone();
            tokio::spawn(async move { mutex.acquire("k").await })
        };
        tokio::time::sleep(Duration::from_millis(200)).await;
        held.release().await.unwrap();

        let acquired = waiter.await.unwrap().unwrap();
        assert!(acquired.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_keeps_lease_alive_while_held() {
        let redis = MockRedisClient::new();
        let mutex = mutex(&redis, 100, 300);
        let guard = mutex.try_acquire("slow").await.unwrap().unwrap();

        tokio::time::sleep(Duration::from_millis(1_000)).await;
        assert!(redis.contains_key("lock:slow"));
        assert!(redis.count_calls("pexpire_if_eq") >= 3);

        assert!(guard.release().await.unwrap());
        assert!(!redis.contains_key("lock:slow"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_guard_lets_lease_expire() {
        let redis = MockRedisClient::new();
        let mutex = mutex(&redis, 100, 300);
        let guard = mutex.try_acquire("crashed").await.unwrap().unwrap();
        drop(guard);

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(!redis.contains_key("lock:crashed"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_does_not_delete_foreign_lock() {
        let redis = MockRedisClient::new();
        let mutex = mutex(&redis, 100, 300);
        let guard = mutex.try_acquire("k").await.unwrap().unwrap();
        drop(guard);

        tokio::time::sleep(Duration::from_millis(400)).await;
        let second = mutex.try_acquire("k").await.unwrap().unwrap();

        // A stale guard for the same key must not remove the new holder's lock.
        let stale = LockGuard::start(
            Arc::new(redis.clone()),
            "lock:k".to_string(),
            "stale-token".to_string(),
            Duration::from_millis(300),
        );
        assert!(!stale.release().await.unwrap());
        assert!(redis.contains_key("lock:k"));
        assert!(second.release().await.unwrap());
    }
}
