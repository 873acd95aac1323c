use serde::{Deserialize, Serialize};

/// 设备签名认证配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// 请求时间戳与服务器时间允许的最大偏差（秒）
    pub replay_window_seconds: i64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            replay_window_seconds: 300,
        }
    }
}

impl AuthConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.replay_window_seconds <= 0 {
            return Err(anyhow::anyhow!("签名时间窗口必须大于0"));
        }

        Ok(())
    }
}

/// 重试策略配置
///
/// 第 n 次重试的延迟为 `min(max_delay, base_delay * multiplier^n)`，
/// 可选随机抖动。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// 基础重试间隔（秒）
    pub base_delay_seconds: u64,
    /// 最大重试间隔（秒）
    pub max_delay_seconds: u64,
    /// 指数退避倍数
    pub backoff_multiplier: f64,
    /// 重试间隔的随机抖动范围（0.0-1.0），默认关闭
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_seconds: 60,
            max_delay_seconds: 3600,
            backoff_multiplier: 2.0,
            jitter_factor: 0.0,
        }
    }
}

impl RetryConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.base_delay_seconds == 0 {
            return Err(anyhow::anyhow!("基础重试间隔必须大于0"));
        }

        if self.max_delay_seconds < self.base_delay_seconds {
            return Err(anyhow::anyhow!(
                "最大重试间隔 {} 小于基础间隔 {}",
                self.max_delay_seconds,
                self.base_delay_seconds
            ));
        }

        if self.backoff_multiplier < 1.0 {
            return Err(anyhow::anyhow!("退避倍数不能小于1"));
        }

        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(anyhow::anyhow!("抖动系数必须在0到1之间"));
        }

        Ok(())
    }
}
