use std::time::Duration;

use serde::{Deserialize, Serialize};

/// 指令队列与长轮询配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// 指令默认过期时间（秒）
    pub default_instruction_timeout_seconds: u64,
    /// 设备未指定时使用的长轮询时长（秒）
    pub default_poll_timeout_seconds: u64,
    /// 长轮询时长上限（秒）
    pub max_poll_timeout_seconds: u64,
    /// 指令状态记录保留时间（秒）
    pub status_ttl_seconds: u64,
    /// 运维预览队列时的最大条数
    pub preview_limit: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            default_instruction_timeout_seconds: 3600,
            default_poll_timeout_seconds: 30,
            max_poll_timeout_seconds: 60,
            status_ttl_seconds: 7 * 24 * 3600,
            preview_limit: 100,
        }
    }
}

impl QueueConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.default_instruction_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("指令过期时间必须大于0"));
        }

        if self.max_poll_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("长轮询时长上限必须大于0"));
        }

        if self.default_poll_timeout_seconds > self.max_poll_timeout_seconds {
            return Err(anyhow::anyhow!(
                "默认长轮询时长 {} 超过上限 {}",
                self.default_poll_timeout_seconds,
                self.max_poll_timeout_seconds
            ));
        }

        if self.preview_limit == 0 {
            return Err(anyhow::anyhow!("队列预览条数必须大于0"));
        }

        Ok(())
    }

    /// 将设备请求的轮询时长限制在允许范围内
    pub fn clamp_poll_timeout(&self, requested_seconds: Option<u64>) -> Duration {
        let seconds = requested_seconds
            .unwrap_or(self.default_poll_timeout_seconds)
            .min(self.max_poll_timeout_seconds);
        Duration::from_secs(seconds)
    }
}

/// 在线状态配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenceConfig {
    /// 超过该时长没有心跳即视为离线（秒）
    pub online_window_seconds: u64,
    /// 临时指标保留时间（秒）
    pub metrics_ttl_seconds: u64,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            online_window_seconds: 120,
            metrics_ttl_seconds: 600,
        }
    }
}

impl PresenceConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.online_window_seconds == 0 {
            return Err(anyhow::anyhow!("在线窗口必须大于0"));
        }

        if self.metrics_ttl_seconds == 0 {
            return Err(anyhow::anyhow!("指标保留时间必须大于0"));
        }

        Ok(())
    }

    pub fn online_window(&self) -> Duration {
        Duration::from_secs(self.online_window_seconds)
    }

    pub fn metrics_ttl(&self) -> Duration {
        Duration::from_secs(self.metrics_ttl_seconds)
    }
}
