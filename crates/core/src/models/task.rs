use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{FleetError, FleetResult};

/// 任务类型
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskType {
    /// 创建后立即分发
    Immediate,
    /// 在 `scheduled_time` 到达后分发
    Scheduled,
    /// 按 cron 表达式周期性分发
    Recurring,
}

/// 任务目标类型
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TargetType {
    Specific,
    Group,
    All,
}

/// 任务状态
///
/// ```text
/// PENDING ──dispatch──▶ RUNNING ──all reported──▶ COMPLETED | PARTIALLY_COMPLETED
///    │                    │
///    └──────pause─────────┴──▶ PAUSED ──resume──▶ RUNNING
/// 任何非终态 ──cancel──▶ CANCELLED；目标为空 ──▶ FAILED
/// ```
///
/// 周期任务的一轮结束后回到 PENDING，本轮结果记在 `last_run_status`。
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    PartiallyCompleted,
    Failed,
    Cancelled,
    Paused,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Running => "RUNNING",
            TaskStatus::Completed => "COMPLETED",
            TaskStatus::PartiallyCompleted => "PARTIALLY_COMPLETED",
            TaskStatus::Failed => "FAILED",
            TaskStatus::Cancelled => "CANCELLED",
            TaskStatus::Paused => "PAUSED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed
                | TaskStatus::PartiallyCompleted
                | TaskStatus::Failed
                | TaskStatus::Cancelled
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 单台设备的执行结果，用于累加任务进度计数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceOutcome {
    Success,
    Failed,
}

/// 编排任务
///
/// 由调度器和分发器独占修改；设备侧组件只能通过执行回报间接推进它。
/// 始终满足 `success_devices + failed_devices <= total_devices`。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: String,
    pub name: String,
    pub script_id: String,
    pub parameters: serde_json::Value,
    pub task_type: TaskType,
    pub target_type: TargetType,
    /// 仅在 `TargetType::Specific` 时使用
    pub target_device_ids: BTreeSet<String>,
    /// 仅在 `TargetType::Group` 时使用
    pub target_group_id: Option<String>,
    pub status: TaskStatus,
    /// 暂停前的状态，恢复时据此回到 PENDING 或 RUNNING
    #[serde(default)]
    pub paused_from: Option<TaskStatus>,
    /// 周期任务最近一轮的结果
    #[serde(default)]
    pub last_run_status: Option<TaskStatus>,
    pub priority: i32,
    pub scheduled_time: Option<DateTime<Utc>>,
    pub cron_expression: Option<String>,
    pub last_execution_time: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub total_devices: u32,
    pub success_devices: u32,
    pub failed_devices: u32,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// 目标解析结果为空时记录的固定失败原因
    pub const NO_TARGET_DEVICES: &'static str = "no available target devices";

    pub fn new(spec: TaskSpec) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            name: spec.name,
            script_id: spec.script_id,
            parameters: spec.parameters,
            task_type: spec.task_type,
            target_type: spec.target_type,
            target_device_ids: spec.target_device_ids,
            target_group_id: spec.target_group_id,
            status: TaskStatus::Pending,
            paused_from: None,
            last_run_status: None,
            priority: spec.priority,
            scheduled_time: spec.scheduled_time,
            cron_expression: spec.cron_expression,
            last_execution_time: None,
            retry_count: 0,
            max_retries: spec.max_retries,
            total_devices: 0,
            success_devices: 0,
            failed_devices: 0,
            start_time: None,
            end_time: None,
            failure_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn reported_devices(&self) -> u32 {
        self.success_devices + self.failed_devices
    }

    /// 所有目标设备都已回报
    pub fn all_reported(&self) -> bool {
        self.total_devices > 0 && self.reported_devices() >= self.total_devices
    }

    /// 根据计数得出的终态；尚有设备未回报时返回 `None`
    pub fn aggregate_status(&self) -> Option<TaskStatus> {
        if !self.all_reported() {
            return None;
        }
        if self.failed_devices == 0 {
            Some(TaskStatus::Completed)
        } else {
            Some(TaskStatus::PartiallyCompleted)
        }
    }

    pub fn progress_percent(&self) -> f64 {
        if self.total_devices == 0 {
            return 0.0;
        }
        f64::from(self.reported_devices()) * 100.0 / f64::from(self.total_devices)
    }

    /// 累加一台设备的执行结果；计数已满时拒绝，保证不超过目标设备数
    pub fn record_outcome(&mut self, outcome: DeviceOutcome) -> FleetResult<()> {
        if self.reported_devices() >= self.total_devices {
            return Err(FleetError::Validation(format!(
                "任务 {} 的设备回报数已达到目标设备数 {}",
                self.id, self.total_devices
            )));
        }
        match outcome {
            DeviceOutcome::Success => self.success_devices += 1,
            DeviceOutcome::Failed => self.failed_devices += 1,
        }
        self.updated_at = Utc::now();
        Ok(())
    }

    /// 进入新一轮分发前清空上一轮的进度
    pub fn reset_progress(&mut self) {
        self.total_devices = 0;
        self.success_devices = 0;
        self.failed_devices = 0;
        self.start_time = None;
        self.end_time = None;
        self.failure_reason = None;
    }

    pub fn mark_terminal(&mut self, status: TaskStatus, now: DateTime<Utc>) {
        self.status = status;
        self.end_time = Some(now);
        self.updated_at = now;
    }

    /// 结束一轮执行：周期任务回到 PENDING 等待下一个触发点，其它任务进入终态
    pub fn finish_run(&mut self, status: TaskStatus, now: DateTime<Utc>) {
        if self.task_type != TaskType::Recurring {
            self.mark_terminal(status, now);
            return;
        }
        self.last_run_status = Some(status);
        self.status = TaskStatus::Pending;
        self.retry_count = 0;
        self.scheduled_time = None;
        self.end_time = Some(now);
        self.updated_at = now;
    }

    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }
}

/// 创建任务时提交的定义
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskSpec {
    pub name: String,
    pub script_id: String,
    #[serde(default)]
    pub parameters: serde_json::Value,
    pub task_type: TaskType,
    pub target_type: TargetType,
    #[serde(default)]
    pub target_device_ids: BTreeSet<String>,
    #[serde(default)]
    pub target_group_id: Option<String>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub scheduled_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub cron_expression: Option<String>,
    #[serde(default)]
    pub max_retries: u32,
}

impl TaskSpec {
    pub fn immediate(name: &str, script_id: &str, target_type: TargetType) -> Self {
        Self {
            name: name.to_string(),
            script_id: script_id.to_string(),
            parameters: serde_json::Value::Object(serde_json::Map::new()),
            task_type: TaskType::Immediate,
            target_type,
            target_device_ids: BTreeSet::new(),
            target_group_id: None,
            priority: 0,
            scheduled_time: None,
            cron_expression: None,
            max_retries: 0,
        }
    }

    /// 校验与任务类型相关的必填字段；目标合法性由目标解析器负责
    pub fn validate(&self) -> FleetResult<()> {
        if self.name.trim().is_empty() {
            return Err(FleetError::Validation("任务名称不能为空".to_string()));
        }
        if self.script_id.trim().is_empty() {
            return Err(FleetError::Validation("脚本ID不能为空".to_string()));
        }
        match self.task_type {
            TaskType::Scheduled if self.scheduled_time.is_none() => Err(FleetError::Validation(
                "定时任务必须指定 scheduled_time".to_string(),
            )),
            TaskType::Recurring
                if self
                    .cron_expression
                    .as_deref()
                    .map_or(true, |expr| expr.trim().is_empty()) =>
            {
                Err(FleetError::Validation(
                    "周期任务必须指定 cron_expression".to_string(),
                ))
            }
            _ => Ok(()),
        }
    }
}

/// 任务过滤器
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub task_type: Option<TaskType>,
    pub limit: Option<usize>,
}

impl TaskFilter {
    pub fn matches(&self, task: &Task) -> bool {
        self.status.map_or(true, |status| task.status == status)
            && self.task_type.map_or(true, |task_type| task.task_type == task_type)
    }
}

/// 面向运维的任务进度快照
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskProgress {
    pub task_id: String,
    pub status: TaskStatus,
    pub total_devices: u32,
    pub success_devices: u32,
    pub failed_devices: u32,
    pub pending_devices: u32,
    pub progress_percent: f64,
    pub retry_count: u32,
    pub failure_reason: Option<String>,
    #[serde(default)]
    pub last_run_status: Option<TaskStatus>,
    /// 下一次分发时间；无法确定时为空
    #[serde(default)]
    pub next_run_at: Option<DateTime<Utc>>,
}

impl From<&Task> for TaskProgress {
    fn from(task: &Task) -> Self {
        Self {
            task_id: task.id.clone(),
            status: task.status,
            total_devices: task.total_devices,
            success_devices: task.success_devices,
            failed_devices: task.failed_devices,
            pending_devices: task.total_devices.saturating_sub(task.reported_devices()),
            progress_percent: task.progress_percent(),
            retry_count: task.retry_count,
            failure_reason: task.failure_reason.clone(),
            last_run_status: task.last_run_status,
            next_run_at: None,
        }
    }
}
