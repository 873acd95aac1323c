use chrono::{DateTime, Utc};
use cron::Schedule;
use std::str::FromStr;
use tracing::{debug, warn};

use fleet_core::{FleetError, FleetResult};

/// cron 表达式解析和调度工具
///
/// 支持带秒的6/7段表达式，也接受标准的5段表达式（秒固定为0）。
pub struct CronScheduler {
    schedule: Schedule,
}

impl CronScheduler {
    pub fn new(cron_expr: &str) -> FleetResult<Self> {
        let normalized = normalize_expression(cron_expr);
        let schedule =
            Schedule::from_str(&normalized).map_err(|e| FleetError::InvalidCron {
                expr: cron_expr.to_string(),
                message: e.to_string(),
            })?;

        Ok(Self { schedule })
    }

    /// 自 `last_fire` 之后的第一个触发点是否已经到达
    pub fn should_trigger(&self, last_fire: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        match self.schedule.after(&last_fire).next() {
            Some(next_time) => {
                let due = next_time <= now;
                if due {
                    debug!(
                        "cron 已到期: 上次触发={}, 应触发={}, 当前时间={}",
                        last_fire.format("%Y-%m-%d %H:%M:%S UTC"),
                        next_time.format("%Y-%m-%d %H:%M:%S UTC"),
                        now.format("%Y-%m-%d %H:%M:%S UTC")
                    );
                }
                due
            }
            None => {
                warn!(
                    "无法计算下一次执行时间，上次触发时间: {}",
                    last_fire.format("%Y-%m-%d %H:%M:%S UTC")
                );
                false
            }
        }
    }

    /// `from` 之后（不含）的第一个触发点
    pub fn next_execution_time(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&from).next()
    }

    pub fn validate_cron_expression(cron_expr: &str) -> FleetResult<()> {
        Self::new(cron_expr).map(|_| ())
    }
}

/// 5段表达式补上秒字段
fn normalize_expression(cron_expr: &str) -> String {
    let trimmed = cron_expr.trim();
    if trimmed.split_whitespace().count() == 5 {
        format!("0 {trimmed}")
    } else {
        trimmed.to_string()
    }
}

/// 纯函数：周期任务在 `now` 是否到期
///
/// 无效表达式视为未到期。
pub fn is_due(cron_expr: &str, last_fire: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    match CronScheduler::new(cron_expr) {
        Ok(scheduler) => scheduler.should_trigger(last_fire, now),
        Err(e) => {
            warn!("跳过无效的 cron 表达式: {}", e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_five_field_expression_accepted() {
        assert!(CronScheduler::new("*/5 * * * *").is_ok());
        assert!(CronScheduler::new("0 */5 * * * *").is_ok());
        assert!(CronScheduler::new("not a cron").is_err());
    }

    #[test]
    fn test_is_due_with_fixed_clock() {
        let last = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let before_tick = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 59).unwrap();
        let after_tick = Utc.with_ymd_and_hms(2024, 1, 1, 12, 1, 0).unwrap();

        assert!(!is_due("* * * * *", last, before_tick));
        assert!(is_due("* * * * *", last, after_tick));
    }

    #[test]
    fn test_next_execution_time_skips_current_tick() {
        let scheduler = CronScheduler::new("*/5 * * * *").unwrap();
        let on_tick = Utc.with_ymd_and_hms(2024, 1, 1, 12, 5, 0).unwrap();
        assert_eq!(
            scheduler.next_execution_time(on_tick),
            Some(Utc.with_ymd_and_hms(2024, 1, 1, 12, 10, 0).unwrap())
        );
    }

    #[test]
    fn test_invalid_expression_never_due() {
        let last = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        assert!(!is_due("61 * * * *", last, Utc::now()));
    }
}
