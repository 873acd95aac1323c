//! Test doubles for the shared store

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use fleet_core::traits::{MessageStream, SharedStore};
use fleet_core::{FleetError, FleetResult};
use fleet_infrastructure::InMemoryStore;

/// 包装内存存储，对指定键的列表写入返回错误，用来模拟单台设备投递失败
pub struct FlakyStore {
    inner: Arc<dyn SharedStore>,
    failing_keys: Mutex<HashSet<String>>,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::wrap(Arc::new(InMemoryStore::new()))
    }

    pub fn wrap(inner: Arc<dyn SharedStore>) -> Self {
        Self {
            inner,
            failing_keys: Mutex::new(HashSet::new()),
        }
    }

    pub fn fail_writes_to(&self, key: &str) {
        self.failing_keys.lock().unwrap().insert(key.to_string());
    }

    pub fn heal(&self) {
        self.failing_keys.lock().unwrap().clear();
    }

    fn check(&self, key: &str) -> FleetResult<()> {
        if self.failing_keys.lock().unwrap().contains(key) {
            return Err(FleetError::Store(format!("injected write failure for {key}")));
        }
        Ok(())
    }
}

impl Default for FlakyStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SharedStore for FlakyStore {
    async fn push_tail(&self, key: &str, value: &str) -> FleetResult<u64> {
        self.check(key)?;
        self.inner.push_tail(key, value).await
    }

    async fn push_head(&self, key: &str, value: &str) -> FleetResult<u64> {
        self.check(key)?;
        self.inner.push_head(key, value).await
    }

    async fn pop_head(&self, key: &str) -> FleetResult<Option<String>> {
        self.inner.pop_head(key).await
    }

    async fn range(&self, key: &str, start: usize, count: usize) -> FleetResult<Vec<String>> {
        self.inner.range(key, start, count).await
    }

    async fn len(&self, key: &str) -> FleetResult<u64> {
        self.inner.len(key).await
    }

    async fn remove_value(&self, key: &str, value: &str, count: usize) -> FleetResult<u64> {
        self.inner.remove_value(key, value, count).await
    }

    async fn set(&self, key: &str, value: &str) -> FleetResult<()> {
        self.inner.set(key, value).await
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> FleetResult<()> {
        self.inner.set_ex(key, value, ttl).await
    }

    async fn get(&self, key: &str) -> FleetResult<Option<String>> {
        self.inner.get(key).await
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> FleetResult<bool> {
        self.inner.set_nx_ex(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> FleetResult<bool> {
        self.inner.delete(key).await
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> FleetResult<bool> {
        self.inner.delete_if_equals(key, expected).await
    }

    async fn exists(&self, key: &str) -> FleetResult<bool> {
        self.inner.exists(key).await
    }

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> FleetResult<()> {
        self.inner.hash_set(key, field, value).await
    }

    async fn hash_set_all(&self, key: &str, entries: &[(String, String)]) -> FleetResult<()> {
        self.inner.hash_set_all(key, entries).await
    }

    async fn hash_get_all(&self, key: &str) -> FleetResult<HashMap<String, String>> {
        self.inner.hash_get_all(key).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> FleetResult<bool> {
        self.inner.expire(key, ttl).await
    }

    async fn scan_prefix(&self, prefix: &str) -> FleetResult<Vec<String>> {
        self.inner.scan_prefix(prefix).await
    }

    async fn publish(&self, channel: &str, message: &str) -> FleetResult<u64> {
        self.inner.publish(channel, message).await
    }

    async fn subscribe(&self, channel: &str) -> FleetResult<MessageStream> {
        self.inner.subscribe(channel).await
    }
}
