use chrono::{DateTime, Duration, Utc};

use fleet_core::config::RetryConfig;

/// 指数退避重试策略
#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// 第 `retry_count` 次重试前的等待：`min(max_delay, base_delay * multiplier^retry_count)`
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let base = self.config.base_delay_seconds as f64;
        let max = self.config.max_delay_seconds as f64;
        let exponent = i32::try_from(retry_count).unwrap_or(i32::MAX);

        let capped = (base * self.config.backoff_multiplier.powi(exponent)).min(max);

        let jittered = if self.config.jitter_factor > 0.0 {
            let jitter =
                capped * self.config.jitter_factor * (rand::random::<f64>() - 0.5) * 2.0;
            (capped + jitter).clamp(base.min(max), max)
        } else {
            capped
        };

        Duration::seconds(jittered.round() as i64)
    }

    pub fn next_retry_time(&self, retry_count: u32, now: DateTime<Utc>) -> DateTime<Utc> {
        now.checked_add_signed(self.delay_for(retry_count))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}
