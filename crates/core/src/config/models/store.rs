use serde::{Deserialize, Serialize};

/// 共享存储后端
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// 进程内存储，仅用于单进程部署和测试
    Memory,
    Redis,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub redis_url: String,
    /// 所有键和频道的命名空间前缀
    pub key_prefix: String,
    pub connection_timeout_seconds: u64,
    pub max_retry_attempts: u32,
    pub retry_delay_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            redis_url: "redis://127.0.0.1:6379/0".to_string(),
            key_prefix: "fleet".to_string(),
            connection_timeout_seconds: 5,
            max_retry_attempts: 3,
            retry_delay_ms: 200,
        }
    }
}

impl StoreConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.key_prefix.trim().is_empty() {
            return Err(anyhow::anyhow!("存储键前缀不能为空"));
        }

        if self.backend == StoreBackend::Redis
            && !(self.redis_url.starts_with("redis://") || self.redis_url.starts_with("rediss://"))
        {
            return Err(anyhow::anyhow!("无效的Redis地址: {}", self.redis_url));
        }

        if self.max_retry_attempts == 0 {
            return Err(anyhow::anyhow!("最大重试次数必须大于0"));
        }

        Ok(())
    }
}
