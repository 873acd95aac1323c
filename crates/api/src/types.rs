//! 设备接口与运维接口的请求/响应结构

use chrono::{DateTime, Utc};
use fleet_core::models::{
    Device, ExecutionReport, ExecutionStatus, HardwareInfo, Instruction, MetricMap,
    PresenceSnapshot,
};
use fleet_infrastructure::QueueDepth;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::auth::SignedFields;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub device_code: String,
    pub device_name: String,
    /// 设备生成的证书请求，通常包含随机数
    pub certificate_request: String,
    #[serde(default)]
    pub group_id: Option<String>,
    #[serde(default)]
    pub hardware: HardwareInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RegisterResponse {
    pub device_code: String,
    pub certificate: String,
    pub first_registration: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub device_code: String,
    pub timestamp: i64,
    pub signature: String,
    #[serde(default)]
    pub metrics: MetricMap,
    /// 长轮询时长（秒），缺省时使用配置的默认值
    #[serde(default)]
    pub poll_timeout: Option<u64>,
}

impl HeartbeatRequest {
    pub fn signed_fields(&self) -> SignedFields {
        let mut fields = SignedFields::new();
        if !self.metrics.is_empty() {
            fields.insert("metrics".to_string(), Value::Object(self.metrics.clone()));
        }
        if let Some(poll_timeout) = self.poll_timeout {
            fields.insert("poll_timeout".to_string(), Value::from(poll_timeout));
        }
        fields
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub instructions: Vec<Instruction>,
    pub server_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportRequest {
    pub device_code: String,
    pub timestamp: i64,
    pub signature: String,
    pub instruction_id: String,
    pub status: ExecutionStatus,
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub metrics: MetricMap,
}

impl ReportRequest {
    pub fn new(device_code: &str, instruction_id: &str, status: ExecutionStatus) -> Self {
        Self {
            device_code: device_code.to_string(),
            timestamp: Utc::now().timestamp(),
            signature: String::new(),
            instruction_id: instruction_id.to_string(),
            status,
            task_id: None,
            output: None,
            error: None,
            metrics: MetricMap::new(),
        }
    }

    /// 可选字段只在出现时参与签名
    pub fn signed_fields(&self) -> SignedFields {
        let mut fields = SignedFields::new();
        fields.insert(
            "instruction_id".to_string(),
            Value::String(self.instruction_id.clone()),
        );
        fields.insert(
            "status".to_string(),
            Value::String(self.status.as_str().to_string()),
        );
        if let Some(task_id) = &self.task_id {
            fields.insert("task_id".to_string(), Value::String(task_id.clone()));
        }
        if let Some(output) = &self.output {
            fields.insert("output".to_string(), Value::String(output.clone()));
        }
        if let Some(error) = &self.error {
            fields.insert("error".to_string(), Value::String(error.clone()));
        }
        if !self.metrics.is_empty() {
            fields.insert("metrics".to_string(), Value::Object(self.metrics.clone()));
        }
        fields
    }

    pub fn to_report(&self) -> ExecutionReport {
        ExecutionReport {
            instruction_id: self.instruction_id.clone(),
            status: self.status,
            task_id: self.task_id.clone(),
            output: self.output.clone(),
            error: self.error.clone(),
            metrics: self.metrics.clone(),
            fields: serde_json::Map::new(),
        }
    }
}

/// 队列监控汇总
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueStats {
    /// 按排队深度降序
    pub devices: Vec<QueueDepth>,
    pub total_pending: u64,
    /// 队列非空的设备
    pub busy_devices: Vec<String>,
}

impl QueueStats {
    pub fn from_depths(devices: Vec<QueueDepth>) -> Self {
        let total_pending = devices.iter().map(|d| d.pending).sum();
        let busy_devices = devices
            .iter()
            .filter(|d| d.pending > 0)
            .map(|d| d.device_code.clone())
            .collect();
        Self {
            devices,
            total_pending,
            busy_devices,
        }
    }
}

/// 单台设备的运维视图
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceStatus {
    pub device: Device,
    pub presence: PresenceSnapshot,
    pub queued_instructions: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_report_signed_fields_skip_absent_values() {
        let mut request = ReportRequest::new("D1", "i-1", ExecutionStatus::Success);
        let keys: Vec<String> = request.signed_fields().into_keys().collect();
        assert_eq!(keys, vec!["instruction_id", "status"]);

        request.output = Some("ok".to_string());
        request.metrics.insert("cpu".to_string(), json!(12));
        let keys: Vec<String> = request.signed_fields().into_keys().collect();
        assert_eq!(keys, vec!["instruction_id", "metrics", "output", "status"]);
    }

    #[test]
    fn test_queue_stats_busy_devices() {
        let stats = QueueStats::from_depths(vec![
            QueueDepth {
                device_code: "D1".to_string(),
                pending: 3,
            },
            QueueDepth {
                device_code: "D2".to_string(),
                pending: 1,
            },
        ]);
        assert_eq!(stats.total_pending, 4);
        assert_eq!(stats.busy_devices, vec!["D1", "D2"]);
    }
}
