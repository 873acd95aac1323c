use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use fleet_core::config::PresenceConfig;
use fleet_core::models::{MetricMap, PresenceSnapshot};
use fleet_core::traits::SharedStore;
use fleet_core::{FleetResult, StoreKeys};
use serde_json::Value;
use tracing::{debug, warn};

/// 设备在线状态跟踪
///
/// 每次心跳写入一个带 TTL 的时间戳，TTL 等于在线窗口；键不存在或时间戳过旧即视为离线。
/// 指标写入独立的哈希，同样带 TTL，后写覆盖先写。
#[derive(Clone)]
pub struct PresenceTracker {
    store: Arc<dyn SharedStore>,
    keys: StoreKeys,
    config: PresenceConfig,
}

impl PresenceTracker {
    pub fn new(store: Arc<dyn SharedStore>, keys: StoreKeys, config: PresenceConfig) -> Self {
        Self {
            store,
            keys,
            config,
        }
    }

    pub async fn touch(&self, device_code: &str) -> FleetResult<()> {
        self.touch_at(device_code, Utc::now()).await
    }

    pub async fn touch_at(&self, device_code: &str, now: DateTime<Utc>) -> FleetResult<()> {
        self.store
            .set_ex(
                &self.keys.presence(device_code),
                &now.timestamp().to_string(),
                self.config.online_window(),
            )
            .await?;
        debug!("设备 {} 心跳 {}", device_code, now.timestamp());
        Ok(())
    }

    /// 保存设备上报的临时指标
    pub async fn record_metrics(&self, device_code: &str, metrics: &MetricMap) -> FleetResult<()> {
        if metrics.is_empty() {
            return Ok(());
        }

        let entries: Vec<(String, String)> = metrics
            .iter()
            .map(|(name, value)| (name.clone(), encode_metric(value)))
            .collect();

        let key = self.keys.device_metrics(device_code);
        self.store.hash_set_all(&key, &entries).await?;
        self.store.expire(&key, self.config.metrics_ttl()).await?;
        Ok(())
    }

    pub async fn last_seen(&self, device_code: &str) -> FleetResult<Option<DateTime<Utc>>> {
        let Some(raw) = self.store.get(&self.keys.presence(device_code)).await? else {
            return Ok(None);
        };

        match raw.parse::<i64>() {
            Ok(seconds) => Ok(Utc.timestamp_opt(seconds, 0).single()),
            Err(e) => {
                warn!("设备 {} 的在线时间戳无效 '{}': {}", device_code, raw, e);
                Ok(None)
            }
        }
    }

    pub async fn is_online(&self, device_code: &str) -> FleetResult<bool> {
        self.is_online_at(device_code, Utc::now()).await
    }

    pub async fn is_online_at(&self, device_code: &str, now: DateTime<Utc>) -> FleetResult<bool> {
        Ok(self
            .last_seen(device_code)
            .await?
            .is_some_and(|seen| self.within_window(seen, now)))
    }

    pub async fn metrics(&self, device_code: &str) -> FleetResult<MetricMap> {
        let raw = self
            .store
            .hash_get_all(&self.keys.device_metrics(device_code))
            .await?;

        Ok(raw
            .into_iter()
            .map(|(name, value)| (name, decode_metric(&value)))
            .collect())
    }

    pub async fn snapshot(&self, device_code: &str) -> FleetResult<PresenceSnapshot> {
        self.snapshot_at(device_code, Utc::now()).await
    }

    pub async fn snapshot_at(
        &self,
        device_code: &str,
        now: DateTime<Utc>,
    ) -> FleetResult<PresenceSnapshot> {
        let last_seen = self.last_seen(device_code).await?;
        Ok(PresenceSnapshot {
            device_code: device_code.to_string(),
            online: last_seen.is_some_and(|seen| self.within_window(seen, now)),
            last_seen,
            metrics: self.metrics(device_code).await?,
        })
    }

    /// 当前在线的设备编码，按字典序
    pub async fn online_devices(&self) -> FleetResult<Vec<String>> {
        self.online_devices_at(Utc::now()).await
    }

    pub async fn online_devices_at(&self, now: DateTime<Utc>) -> FleetResult<Vec<String>> {
        let keys = self.store.scan_prefix(&self.keys.presence_prefix()).await?;

        let mut online = Vec::new();
        for key in &keys {
            let Some(device_code) = self.keys.device_from_presence_key(key) else {
                continue;
            };
            if self.is_online_at(device_code, now).await? {
                online.push(device_code.to_string());
            }
        }
        online.sort();
        Ok(online)
    }

    fn within_window(&self, seen: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        let window = i64::try_from(self.config.online_window_seconds).unwrap_or(i64::MAX);
        (now - seen).num_seconds() <= window
    }
}

fn encode_metric(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn decode_metric(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use serde_json::json;

    fn tracker() -> PresenceTracker {
        PresenceTracker::new(
            Arc::new(InMemoryStore::new()),
            StoreKeys::default(),
            PresenceConfig {
                online_window_seconds: 120,
                metrics_ttl_seconds: 600,
            },
        )
    }

    #[tokio::test]
    async fn test_unknown_device_is_offline() {
        let tracker = tracker();
        assert!(!tracker.is_online("D1").await.unwrap());
        assert_eq!(tracker.last_seen("D1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_online_window() {
        let tracker = tracker();
        let seen = Utc.with_ymd_and_hms(2025, 3, 1, 8, 0, 0).unwrap();
        tracker.touch_at("D1", seen).await.unwrap();

        let within = seen + chrono::Duration::seconds(119);
        let after = seen + chrono::Duration::seconds(121);
        assert!(tracker.is_online_at("D1", within).await.unwrap());
        assert!(!tracker.is_online_at("D1", after).await.unwrap());
        assert_eq!(tracker.online_devices_at(within).await.unwrap(), vec!["D1"]);
        assert!(tracker.online_devices_at(after).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_metrics_last_write_wins() {
        let tracker = tracker();
        let first = json!({"cpu": 10, "battery": "full"});
        let second = json!({"cpu": 55.5});
        tracker
            .record_metrics("D1", first.as_object().unwrap())
            .await
            .unwrap();
        tracker
            .record_metrics("D1", second.as_object().unwrap())
            .await
            .unwrap();

        let metrics = tracker.metrics("D1").await.unwrap();
        assert_eq!(metrics.get("cpu"), Some(&json!(55.5)));
        assert_eq!(metrics.get("battery"), Some(&json!("full")));
    }

    #[tokio::test]
    async fn test_snapshot() {
        let tracker = tracker();
        let now = Utc::now();
        tracker.touch_at("D1", now).await.unwrap();

        let snapshot = tracker.snapshot_at("D1", now).await.unwrap();
        assert!(snapshot.online);
        assert_eq!(snapshot.last_seen.map(|t| t.timestamp()), Some(now.timestamp()));
        assert!(snapshot.metrics.is_empty());
    }
}
