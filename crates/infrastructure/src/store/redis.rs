use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::time::Duration;

use async_trait::async_trait;
use fleet_core::config::StoreConfig;
use fleet_core::traits::{MessageStream, SharedStore};
use fleet_core::{FleetError, FleetResult};
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, RedisError, Script};
use tokio::time::sleep;
use tracing::{debug, error, warn};

const COMPARE_AND_DELETE: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
else
    return 0
end
"#;

const SCAN_BATCH: usize = 200;

fn store_error(context: &str, e: RedisError) -> FleetError {
    FleetError::Store(format!("{context}: {e}"))
}

/// Redis 作为跨进程的共享存储
///
/// 命令通过自动重连的 [`ConnectionManager`] 发送；每个订阅使用独立的
/// pub/sub 连接，订阅确认后才返回消息流。
pub struct RedisStore {
    client: Client,
    connection: ConnectionManager,
    compare_and_delete: Script,
}

impl RedisStore {
    pub async fn connect(config: &StoreConfig) -> FleetResult<Self> {
        let client = Client::open(config.redis_url.as_str())
            .map_err(|e| store_error("创建Redis客户端失败", e))?;

        let connection = Self::connect_with_retry(&client, config).await?;
        let store = Self {
            client,
            connection,
            compare_and_delete: Script::new(COMPARE_AND_DELETE),
        };
        store.ping().await?;
        debug!("已连接Redis共享存储: {}", config.redis_url);

        Ok(store)
    }

    async fn connect_with_retry(
        client: &Client,
        config: &StoreConfig,
    ) -> FleetResult<ConnectionManager> {
        let timeout = Duration::from_secs(config.connection_timeout_seconds);
        let mut last_error = String::from("unknown");

        for attempt in 0..config.max_retry_attempts {
            match tokio::time::timeout(timeout, ConnectionManager::new(client.clone())).await {
                Ok(Ok(connection)) => {
                    if attempt > 0 {
                        debug!("第 {} 次尝试后连接Redis成功", attempt + 1);
                    }
                    return Ok(connection);
                }
                Ok(Err(e)) => last_error = e.to_string(),
                Err(_) => last_error = format!("连接超时 ({}s)", timeout.as_secs()),
            }

            if attempt + 1 < config.max_retry_attempts {
                warn!(
                    "连接Redis失败 (尝试 {}/{}): {}，{}ms 后重试",
                    attempt + 1,
                    config.max_retry_attempts,
                    last_error,
                    config.retry_delay_ms
                );
                sleep(Duration::from_millis(config.retry_delay_ms)).await;
            }
        }

        let message = format!(
            "连接Redis失败，已尝试 {} 次，最后错误: {}",
            config.max_retry_attempts, last_error
        );
        error!("{}", message);
        Err(FleetError::Store(message))
    }

    async fn ping(&self) -> FleetResult<()> {
        let mut conn = self.connection.clone();
        let response: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| store_error("Redis PING失败", e))?;
        if response != "PONG" {
            return Err(FleetError::Store(format!("意外的PING响应: {response}")));
        }
        Ok(())
    }

    pub async fn health_check(&self) -> bool {
        match self.ping().await {
            Ok(()) => true,
            Err(e) => {
                warn!("Redis健康检查失败: {}", e);
                false
            }
        }
    }

    fn conn(&self) -> ConnectionManager {
        self.connection.clone()
    }
}

/// 转义 glob 元字符，使前缀按字面匹配
fn glob_escape(prefix: &str) -> String {
    let mut escaped = String::with_capacity(prefix.len() + 1);
    for ch in prefix.chars() {
        if matches!(ch, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped.push('*');
    escaped
}

fn ttl_seconds(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

#[async_trait]
impl SharedStore for RedisStore {
    async fn push_tail(&self, key: &str, value: &str) -> FleetResult<u64> {
        self.conn()
            .rpush(key, value)
            .await
            .map_err(|e| store_error("RPUSH失败", e))
    }

    async fn push_head(&self, key: &str, value: &str) -> FleetResult<u64> {
        self.conn()
            .lpush(key, value)
            .await
            .map_err(|e| store_error("LPUSH失败", e))
    }

    async fn pop_head(&self, key: &str) -> FleetResult<Option<String>> {
        self.conn()
            .lpop(key, None::<NonZeroUsize>)
            .await
            .map_err(|e| store_error("LPOP失败", e))
    }

    async fn range(&self, key: &str, start: usize, count: usize) -> FleetResult<Vec<String>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let stop = start.saturating_add(count - 1);
        self.conn()
            .lrange(key, start as isize, stop.min(isize::MAX as usize) as isize)
            .await
            .map_err(|e| store_error("LRANGE失败", e))
    }

    async fn len(&self, key: &str) -> FleetResult<u64> {
        self.conn()
            .llen(key)
            .await
            .map_err(|e| store_error("LLEN失败", e))
    }

    async fn remove_value(&self, key: &str, value: &str, count: usize) -> FleetResult<u64> {
        // LREM 的 count=0 表示全部删除
        if count == 0 {
            return Ok(0);
        }
        self.conn()
            .lrem(key, count.min(isize::MAX as usize) as isize, value)
            .await
            .map_err(|e| store_error("LREM失败", e))
    }

    async fn set(&self, key: &str, value: &str) -> FleetResult<()> {
        self.conn()
            .set(key, value)
            .await
            .map_err(|e| store_error("SET失败", e))
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> FleetResult<()> {
        self.conn()
            .set_ex(key, value, ttl_seconds(ttl))
            .await
            .map_err(|e| store_error("SETEX失败", e))
    }

    async fn get(&self, key: &str) -> FleetResult<Option<String>> {
        self.conn()
            .get(key)
            .await
            .map_err(|e| store_error("GET失败", e))
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> FleetResult<bool> {
        let mut conn = self.conn();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis().max(1) as u64)
            .query_async(&mut conn)
            .await
            .map_err(|e| store_error("SET NX失败", e))?;
        Ok(reply.is_some())
    }

    async fn delete(&self, key: &str) -> FleetResult<bool> {
        let removed: u64 = self
            .conn()
            .del(key)
            .await
            .map_err(|e| store_error("DEL失败", e))?;
        Ok(removed > 0)
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> FleetResult<bool> {
        let mut conn = self.conn();
        let removed: i64 = self
            .compare_and_delete
            .key(key)
            .arg(expected)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| store_error("条件删除失败", e))?;
        Ok(removed > 0)
    }

    async fn exists(&self, key: &str) -> FleetResult<bool> {
        self.conn()
            .exists(key)
            .await
            .map_err(|e| store_error("EXISTS失败", e))
    }

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> FleetResult<()> {
        self.conn()
            .hset(key, field, value)
            .await
            .map_err(|e| store_error("HSET失败", e))
    }

    async fn hash_set_all(&self, key: &str, entries: &[(String, String)]) -> FleetResult<()> {
        if entries.is_empty() {
            return Ok(());
        }
        self.conn()
            .hset_multiple(key, entries)
            .await
            .map_err(|e| store_error("HSET失败", e))
    }

    async fn hash_get_all(&self, key: &str) -> FleetResult<HashMap<String, String>> {
        self.conn()
            .hgetall(key)
            .await
            .map_err(|e| store_error("HGETALL失败", e))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> FleetResult<bool> {
        self.conn()
            .expire(key, ttl_seconds(ttl) as i64)
            .await
            .map_err(|e| store_error("EXPIRE失败", e))
    }

    async fn scan_prefix(&self, prefix: &str) -> FleetResult<Vec<String>> {
        let pattern = glob_escape(prefix);
        let mut conn = self.conn();
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();

        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await
                .map_err(|e| store_error("SCAN失败", e))?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }

        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn publish(&self, channel: &str, message: &str) -> FleetResult<u64> {
        self.conn()
            .publish(channel, message)
            .await
            .map_err(|e| store_error("PUBLISH失败", e))
    }

    async fn subscribe(&self, channel: &str) -> FleetResult<MessageStream> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| store_error("建立订阅连接失败", e))?;
        pubsub
            .subscribe(channel)
            .await
            .map_err(|e| store_error("SUBSCRIBE失败", e))?;

        let stream = pubsub.into_on_message().map(|message| {
            message.get_payload::<String>().unwrap_or_else(|e| {
                warn!("无法解析订阅消息: {}", e);
                String::new()
            })
        });
        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_glob_escape() {
        assert_eq!(glob_escape("fleet:queue:"), "fleet:queue:*");
        assert_eq!(glob_escape("a*b?[c]"), "a\\*b\\?\\[c\\]*");
    }

    #[test]
    fn test_ttl_rounds_up_to_one_second() {
        assert_eq!(ttl_seconds(Duration::from_millis(10)), 1);
        assert_eq!(ttl_seconds(Duration::from_secs(42)), 42);
    }
}
