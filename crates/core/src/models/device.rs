use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::MetricMap;

/// 设备硬件描述，注册时可选上报
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct HardwareInfo {
    pub model: Option<String>,
    pub os_version: Option<String>,
    pub app_version: Option<String>,
    pub resolution: Option<String>,
    #[serde(default)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// 设备档案
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Device {
    pub code: String,
    pub name: String,
    /// 注册时签发的证书，设备请求签名的 HMAC 密钥
    pub certificate: Option<String>,
    pub group_id: Option<String>,
    pub hardware: HardwareInfo,
    pub registered_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Device {
    pub fn new(code: &str, name: &str) -> Self {
        let now = Utc::now();
        Self {
            code: code.to_string(),
            name: name.to_string(),
            certificate: None,
            group_id: None,
            hardware: HardwareInfo::default(),
            registered_at: now,
            updated_at: now,
        }
    }

    pub fn with_group(mut self, group_id: &str) -> Self {
        self.group_id = Some(group_id.to_string());
        self
    }
}

/// 设备分组
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceGroup {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
}

impl DeviceGroup {
    pub fn new(id: &str, name: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            description: None,
        }
    }
}

/// 设备在线状态快照
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PresenceSnapshot {
    pub device_code: String,
    pub online: bool,
    pub last_seen: Option<DateTime<Utc>>,
    pub metrics: MetricMap,
}
