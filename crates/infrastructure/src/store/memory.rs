use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use fleet_core::traits::{MessageStream, SharedStore};
use fleet_core::{FleetError, FleetResult};
use tokio::sync::{broadcast, RwLock};
use tokio::time::Instant;
use tracing::debug;

const CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
enum Value {
    Scalar(String),
    List(VecDeque<String>),
    Hash(HashMap<String, String>),
}

impl Value {
    fn type_name(&self) -> &'static str {
        match self {
            Value::Scalar(_) => "string",
            Value::List(_) => "list",
            Value::Hash(_) => "hash",
        }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(value: Value) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|deadline| now >= deadline)
    }
}

/// 进程内共享存储
///
/// 语义与 Redis 后端保持一致：过期键在访问时惰性清除，列表和哈希清空后键随之消失，
/// 对错误类型的键操作返回 `WRONGTYPE` 错误。发布订阅基于 `broadcast` 通道，
/// 只投递给发布时已经订阅的接收者。
#[derive(Debug, Default)]
pub struct InMemoryStore {
    data: RwLock<HashMap<String, Entry>>,
    channels: RwLock<HashMap<String, broadcast::Sender<String>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 当前未过期的键数量
    pub async fn key_count(&self) -> usize {
        let now = Instant::now();
        let data = self.data.read().await;
        data.values().filter(|entry| !entry.is_expired(now)).count()
    }

    fn wrong_type(key: &str, expected: &str, actual: &Value) -> FleetError {
        FleetError::Store(format!(
            "WRONGTYPE 键 {key} 的类型为 {}，期望 {expected}",
            actual.type_name()
        ))
    }

    fn purge_expired(data: &mut HashMap<String, Entry>, key: &str) {
        let now = Instant::now();
        if data.get(key).is_some_and(|entry| entry.is_expired(now)) {
            data.remove(key);
        }
    }

    async fn push(&self, key: &str, value: &str, front: bool) -> FleetResult<u64> {
        let mut data = self.data.write().await;
        Self::purge_expired(&mut data, key);

        let entry = data
            .entry(key.to_string())
            .or_insert_with(|| Entry::new(Value::List(VecDeque::new())));

        match &mut entry.value {
            Value::List(list) => {
                if front {
                    list.push_front(value.to_string());
                } else {
                    list.push_back(value.to_string());
                }
                Ok(list.len() as u64)
            }
            other => Err(Self::wrong_type(key, "list", other)),
        }
    }

    async fn read_list<T>(
        &self,
        key: &str,
        read: impl FnOnce(&VecDeque<String>) -> T,
        empty: T,
    ) -> FleetResult<T> {
        let now = Instant::now();
        let data = self.data.read().await;
        match data.get(key) {
            Some(entry) if !entry.is_expired(now) => match &entry.value {
                Value::List(list) => Ok(read(list)),
                other => Err(Self::wrong_type(key, "list", other)),
            },
            _ => Ok(empty),
        }
    }
}

#[async_trait]
impl SharedStore for InMemoryStore {
    async fn push_tail(&self, key: &str, value: &str) -> FleetResult<u64> {
        self.push(key, value, false).await
    }

    async fn push_head(&self, key: &str, value: &str) -> FleetResult<u64> {
        self.push(key, value, true).await
    }

    async fn pop_head(&self, key: &str) -> FleetResult<Option<String>> {
        let mut data = self.data.write().await;
        Self::purge_expired(&mut data, key);

        let Some(entry) = data.get_mut(key) else {
            return Ok(None);
        };

        let (popped, now_empty) = match &mut entry.value {
            Value::List(list) => {
                let popped = list.pop_front();
                (popped, list.is_empty())
            }
            other => return Err(Self::wrong_type(key, "list", other)),
        };

        if now_empty {
            data.remove(key);
        }
        Ok(popped)
    }

    async fn range(&self, key: &str, start: usize, count: usize) -> FleetResult<Vec<String>> {
        self.read_list(
            key,
            |list| list.iter().skip(start).take(count).cloned().collect(),
            Vec::new(),
        )
        .await
    }

    async fn len(&self, key: &str) -> FleetResult<u64> {
        self.read_list(key, |list| list.len() as u64, 0).await
    }

    async fn remove_value(&self, key: &str, value: &str, count: usize) -> FleetResult<u64> {
        let mut data = self.data.write().await;
        Self::purge_expired(&mut data, key);

        let Some(entry) = data.get_mut(key) else {
            return Ok(0);
        };

        let (removed, now_empty) = match &mut entry.value {
            Value::List(list) => {
                let mut removed = 0usize;
                list.retain(|item| {
                    if removed < count && item == value {
                        removed += 1;
                        false
                    } else {
                        true
                    }
                });
                (removed as u64, list.is_empty())
            }
            other => return Err(Self::wrong_type(key, "list", other)),
        };

        if now_empty {
            data.remove(key);
        }
        Ok(removed)
    }

    async fn set(&self, key: &str, value: &str) -> FleetResult<()> {
        let mut data = self.data.write().await;
        data.insert(key.to_string(), Entry::new(Value::Scalar(value.to_string())));
        Ok(())
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> FleetResult<()> {
        let mut data = self.data.write().await;
        data.insert(
            key.to_string(),
            Entry {
                value: Value::Scalar(value.to_string()),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> FleetResult<Option<String>> {
        let now = Instant::now();
        let data = self.data.read().await;
        match data.get(key) {
            Some(entry) if !entry.is_expired(now) => match &entry.value {
                Value::Scalar(value) => Ok(Some(value.clone())),
                other => Err(Self::wrong_type(key, "string", other)),
            },
            _ => Ok(None),
        }
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> FleetResult<bool> {
        let mut data = self.data.write().await;
        Self::purge_expired(&mut data, key);

        if data.contains_key(key) {
            return Ok(false);
        }
        data.insert(
            key.to_string(),
            Entry {
                value: Value::Scalar(value.to_string()),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(true)
    }

    async fn delete(&self, key: &str) -> FleetResult<bool> {
        let mut data = self.data.write().await;
        Self::purge_expired(&mut data, key);
        Ok(data.remove(key).is_some())
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> FleetResult<bool> {
        let mut data = self.data.write().await;
        Self::purge_expired(&mut data, key);

        let matches = matches!(
            data.get(key).map(|entry| &entry.value),
            Some(Value::Scalar(current)) if current == expected
        );
        if matches {
            data.remove(key);
        }
        Ok(matches)
    }

    async fn exists(&self, key: &str) -> FleetResult<bool> {
        let now = Instant::now();
        let data = self.data.read().await;
        Ok(data.get(key).is_some_and(|entry| !entry.is_expired(now)))
    }

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> FleetResult<()> {
        self.hash_set_all(key, &[(field.to_string(), value.to_string())])
            .await
    }

    async fn hash_set_all(&self, key: &str, entries: &[(String, String)]) -> FleetResult<()> {
        let mut data = self.data.write().await;
        Self::purge_expired(&mut data, key);

        let entry = data
            .entry(key.to_string())
            .or_insert_with(|| Entry::new(Value::Hash(HashMap::new())));

        match &mut entry.value {
            Value::Hash(hash) => {
                for (field, value) in entries {
                    hash.insert(field.clone(), value.clone());
                }
                Ok(())
            }
            other => Err(Self::wrong_type(key, "hash", other)),
        }
    }

    async fn hash_get_all(&self, key: &str) -> FleetResult<HashMap<String, String>> {
        let now = Instant::now();
        let data = self.data.read().await;
        match data.get(key) {
            Some(entry) if !entry.is_expired(now) => match &entry.value {
                Value::Hash(hash) => Ok(hash.clone()),
                other => Err(Self::wrong_type(key, "hash", other)),
            },
            _ => Ok(HashMap::new()),
        }
    }

    async fn expire(&self, key: &str, ttl: Duration) -> FleetResult<bool> {
        let mut data = self.data.write().await;
        Self::purge_expired(&mut data, key);

        match data.get_mut(key) {
            Some(entry) => {
                entry.expires_at = Some(Instant::now() + ttl);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn scan_prefix(&self, prefix: &str) -> FleetResult<Vec<String>> {
        let now = Instant::now();
        let data = self.data.read().await;
        let mut keys: Vec<String> = data
            .iter()
            .filter(|(key, entry)| key.starts_with(prefix) && !entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn publish(&self, channel: &str, message: &str) -> FleetResult<u64> {
        let mut channels = self.channels.write().await;
        let Some(sender) = channels.get(channel) else {
            return Ok(0);
        };

        match sender.send(message.to_string()) {
            Ok(receivers) => Ok(receivers as u64),
            Err(_) => {
                // 所有订阅者都已断开
                channels.remove(channel);
                debug!("频道 {} 已无订阅者，移除", channel);
                Ok(0)
            }
        }
    }

    async fn subscribe(&self, channel: &str) -> FleetResult<MessageStream> {
        let receiver = {
            let mut channels = self.channels.write().await;
            channels
                .entry(channel.to_string())
                .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
                .subscribe()
        };

        let stream = futures::stream::unfold(receiver, |mut receiver| async move {
            loop {
                match receiver.recv().await {
                    Ok(message) => return Some((message, receiver)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!("订阅者落后 {} 条消息", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });

        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_list_head_and_tail() {
        let store = InMemoryStore::new();
        store.push_tail("q", "a").await.unwrap();
        store.push_tail("q", "b").await.unwrap();
        store.push_head("q", "urgent").await.unwrap();

        assert_eq!(store.range("q", 0, 10).await.unwrap(), vec!["urgent", "a", "b"]);
        assert_eq!(store.pop_head("q").await.unwrap().as_deref(), Some("urgent"));
        assert_eq!(store.len("q").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_empty_list_key_disappears() {
        let store = InMemoryStore::new();
        store.push_tail("q", "a").await.unwrap();
        store.pop_head("q").await.unwrap();

        assert!(!store.exists("q").await.unwrap());
        assert!(store.scan_prefix("q").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_remove_value_respects_count() {
        let store = InMemoryStore::new();
        for value in ["x", "y", "x", "x"] {
            store.push_tail("q", value).await.unwrap();
        }

        assert_eq!(store.remove_value("q", "x", 1).await.unwrap(), 1);
        assert_eq!(store.range("q", 0, 10).await.unwrap(), vec!["y", "x", "x"]);
    }

    #[tokio::test]
    async fn test_wrong_type_is_error() {
        let store = InMemoryStore::new();
        store.set("k", "v").await.unwrap();
        assert!(store.push_tail("k", "a").await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry() {
        let store = InMemoryStore::new();
        store
            .set_ex("k", "v", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
        assert!(store.set_nx_ex("k", "w", Duration::from_secs(5)).await.unwrap());
    }

    #[tokio::test]
    async fn test_set_nx_and_compare_delete() {
        let store = InMemoryStore::new();
        let ttl = Duration::from_secs(30);
        assert!(store.set_nx_ex("lock", "a", ttl).await.unwrap());
        assert!(!store.set_nx_ex("lock", "b", ttl).await.unwrap());

        assert!(!store.delete_if_equals("lock", "b").await.unwrap());
        assert!(store.delete_if_equals("lock", "a").await.unwrap());
        assert!(!store.exists("lock").await.unwrap());
    }

    #[tokio::test]
    async fn test_publish_reaches_existing_subscriber_only() {
        let store = InMemoryStore::new();
        assert_eq!(store.publish("ch", "early").await.unwrap(), 0);

        let mut stream = store.subscribe("ch").await.unwrap();
        assert_eq!(store.publish("ch", "hello").await.unwrap(), 1);
        assert_eq!(stream.next().await.as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn test_hash_operations() {
        let store = InMemoryStore::new();
        store
            .hash_set_all("h", &[("a".into(), "1".into()), ("b".into(), "2".into())])
            .await
            .unwrap();
        store.hash_set("h", "a", "3").await.unwrap();

        let all = store.hash_get_all("h").await.unwrap();
        assert_eq!(all.get("a").map(String::as_str), Some("3"));
        assert_eq!(all.len(), 2);
        assert!(store.expire("h", Duration::from_secs(10)).await.unwrap());
        assert!(!store.expire("missing", Duration::from_secs(10)).await.unwrap());
    }
}
