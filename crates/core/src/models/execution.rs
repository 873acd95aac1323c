use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{DeviceOutcome, MetricMap};
use crate::FleetError;

/// 指令执行状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// 已入队，尚未交付
    Queued,
    /// 设备已收到
    Received,
    Running,
    Success,
    Failed,
    Timeout,
    Cancelled,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Queued => "queued",
            ExecutionStatus::Received => "received",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Success => "success",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Timeout => "timeout",
            ExecutionStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.outcome().is_some()
    }

    /// 终态对应的设备结果，用于推进任务计数
    pub fn outcome(&self) -> Option<DeviceOutcome> {
        match self {
            ExecutionStatus::Success => Some(DeviceOutcome::Success),
            ExecutionStatus::Failed | ExecutionStatus::Timeout | ExecutionStatus::Cancelled => {
                Some(DeviceOutcome::Failed)
            }
            ExecutionStatus::Queued | ExecutionStatus::Received | ExecutionStatus::Running => None,
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = FleetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "queued" | "pending" => Ok(ExecutionStatus::Queued),
            "received" => Ok(ExecutionStatus::Received),
            "running" => Ok(ExecutionStatus::Running),
            "success" | "completed" => Ok(ExecutionStatus::Success),
            "failed" | "error" => Ok(ExecutionStatus::Failed),
            "timeout" => Ok(ExecutionStatus::Timeout),
            "cancelled" | "canceled" => Ok(ExecutionStatus::Cancelled),
            other => Err(FleetError::Validation(format!("未知的执行状态: {other}"))),
        }
    }
}

/// 指令状态记录，按指令ID存放，每次回报整体覆盖，不保留历史
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstructionStatusRecord {
    pub instruction_id: String,
    pub device_code: String,
    pub task_id: Option<String>,
    pub status: ExecutionStatus,
    pub output: Option<String>,
    pub error: Option<String>,
    #[serde(default)]
    pub metrics: MetricMap,
    /// 设备附带的其它任意字段
    #[serde(default)]
    pub fields: serde_json::Map<String, serde_json::Value>,
    pub updated_at: DateTime<Utc>,
}

impl InstructionStatusRecord {
    pub fn queued(instruction_id: &str, device_code: &str, task_id: Option<&str>) -> Self {
        Self {
            instruction_id: instruction_id.to_string(),
            device_code: device_code.to_string(),
            task_id: task_id.map(str::to_string),
            status: ExecutionStatus::Queued,
            output: None,
            error: None,
            metrics: MetricMap::new(),
            fields: serde_json::Map::new(),
            updated_at: Utc::now(),
        }
    }
}

/// 设备回报的执行结果
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionReport {
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
    #[serde(default)]
    pub fields: serde_json::Map<String, serde_json::Value>,
}

impl ExecutionReport {
    pub fn new(instruction_id: &str, status: ExecutionStatus) -> Self {
        Self {
            instruction_id: instruction_id.to_string(),
            status,
            task_id: None,
            output: None,
            error: None,
            metrics: MetricMap::new(),
            fields: serde_json::Map::new(),
        }
    }
}
