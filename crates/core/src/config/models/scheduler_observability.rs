use std::time::Duration;

use serde::{Deserialize, Serialize};

/// 任务调度配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// 到期任务扫描间隔（秒）
    pub scan_interval_seconds: u64,
    /// 分发锁和回报锁的持有上限（秒），防止持有者崩溃后死锁
    pub lock_ttl_seconds: u64,
    /// 阻塞获取锁的最长等待（毫秒）
    pub lock_wait_timeout_ms: u64,
    /// 获取锁的重试间隔（毫秒）
    pub lock_retry_interval_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            scan_interval_seconds: 10,
            lock_ttl_seconds: 30,
            lock_wait_timeout_ms: 10_000,
            lock_retry_interval_ms: 50,
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.scan_interval_seconds == 0 {
            return Err(anyhow::anyhow!("扫描间隔必须大于0"));
        }

        if self.lock_ttl_seconds == 0 {
            return Err(anyhow::anyhow!("锁过期时间必须大于0"));
        }

        if self.lock_retry_interval_ms == 0 {
            return Err(anyhow::anyhow!("锁重试间隔必须大于0"));
        }

        Ok(())
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_seconds)
    }
}

/// 可观测性配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub log_level: String,
    /// json 或 pretty
    pub log_format: String,
    pub metrics_enabled: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
            metrics_enabled: true,
        }
    }
}

impl ObservabilityConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log_level.to_lowercase().as_str()) {
            return Err(anyhow::anyhow!(
                "无效的日志级别: {}，支持的级别: {:?}",
                self.log_level,
                valid_levels
            ));
        }

        let valid_formats = ["json", "pretty"];
        if !valid_formats.contains(&self.log_format.as_str()) {
            return Err(anyhow::anyhow!("不支持的日志格式: {}", self.log_format));
        }

        Ok(())
    }
}
