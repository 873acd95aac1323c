use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use fleet_core::config::SchedulerConfig;
use fleet_core::traits::SharedStore;
use fleet_core::{FleetError, FleetResult};
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

/// 基于共享存储的互斥锁
///
/// `SET NX` 加持有者令牌获取，按令牌条件删除释放，TTL 兜底持有者崩溃的情况。
/// 获取是阻塞式的：按固定间隔重试，直到超过等待上限。
#[derive(Clone)]
pub struct DistributedLock {
    store: Arc<dyn SharedStore>,
    ttl: Duration,
    wait_timeout: Duration,
    retry_interval: Duration,
}

impl DistributedLock {
    pub fn new(
        store: Arc<dyn SharedStore>,
        ttl: Duration,
        wait_timeout: Duration,
        retry_interval: Duration,
    ) -> Self {
        Self {
            store,
            ttl,
            wait_timeout,
            retry_interval,
        }
    }

    pub fn from_config(store: Arc<dyn SharedStore>, config: &SchedulerConfig) -> Self {
        Self::new(
            store,
            Duration::from_secs(config.lock_ttl_seconds),
            Duration::from_millis(config.lock_wait_timeout_ms),
            Duration::from_millis(config.lock_retry_interval_ms),
        )
    }

    pub async fn try_acquire(&self, key: &str) -> FleetResult<Option<LockGuard>> {
        let token = Uuid::new_v4().to_string();
        if self.store.set_nx_ex(key, &token, self.ttl).await? {
            Ok(Some(LockGuard {
                store: self.store.clone(),
                key: key.to_string(),
                token,
                released: false,
            }))
        } else {
            Ok(None)
        }
    }

    pub async fn acquire(&self, key: &str) -> FleetResult<LockGuard> {
        let deadline = Instant::now() + self.wait_timeout;
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            if let Some(guard) = self.try_acquire(key).await? {
                if attempts > 1 {
                    debug!("第 {} 次尝试获得锁 {}", attempts, key);
                }
                return Ok(guard);
            }

            if Instant::now() >= deadline {
                warn!("等待锁 {} 超时，共尝试 {} 次", key, attempts);
                return Err(FleetError::LockTimeout {
                    key: key.to_string(),
                });
            }
            tokio::time::sleep(self.retry_interval).await;
        }
    }

    /// 持有锁执行 `f`，结束后释放；释放失败只记录日志，以 `f` 的结果为准
    pub async fn with_lock<F, Fut, T>(&self, key: &str, f: F) -> FleetResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = FleetResult<T>>,
    {
        let guard = self.acquire(key).await?;
        let result = f().await;
        if let Err(e) = guard.release().await {
            warn!("释放锁失败: {}", e);
        }
        result
    }
}

pub struct LockGuard {
    store: Arc<dyn SharedStore>,
    key: String,
    token: String,
    released: bool,
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("key", &self.key)
            .field("released", &self.released)
            .finish()
    }
}

impl LockGuard {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// 释放锁；锁已过期并被他人获得时不会误删
    pub async fn release(mut self) -> FleetResult<()> {
        self.released = true;
        let removed = self.store.delete_if_equals(&self.key, &self.token).await?;
        if !removed {
            warn!("锁 {} 在释放前已过期", self.key);
        }
        Ok(())
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        // 没有运行时就交给 TTL 清理
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };

        let store = self.store.clone();
        let key = std::mem::take(&mut self.key);
        let token = std::mem::take(&mut self.token);
        handle.spawn(async move {
            if let Err(e) = store.delete_if_equals(&key, &token).await {
                warn!("释放锁 {} 失败: {}", key, e);
            }
        });
    }
}
