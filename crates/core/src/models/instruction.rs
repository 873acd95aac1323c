use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use super::{Script, Task};

/// 指令类型
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum InstructionType {
    ExecuteTask,
    CancelTask,
    Welcome,
    #[serde(other)]
    Unknown,
}

impl InstructionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstructionType::ExecuteTask => "execute_task",
            InstructionType::CancelTask => "cancel_task",
            InstructionType::Welcome => "welcome",
            InstructionType::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for InstructionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 下发给设备的一条指令
///
/// 指令是不可变的值对象：创建后入队一次，出队至多一次（出队即删除），
/// 超过 `created_at + timeout` 的指令在出队时被丢弃，永远不会交付给设备。
///
/// `priority` 只决定入队时放在队头还是队尾，不会对整个队列重新排序。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Instruction {
    pub id: String,
    #[serde(rename = "type")]
    pub instruction_type: InstructionType,
    pub payload: serde_json::Map<String, Value>,
    /// 过期时间（秒）
    pub timeout: u64,
    pub priority: i32,
    pub created_at: DateTime<Utc>,
}

impl Instruction {
    /// 日常指令
    pub const PRIORITY_NORMAL: i32 = 0;
    /// 任务执行指令，高于日常指令
    pub const PRIORITY_ELEVATED: i32 = 5;
    /// 最高优先级，插入队头抢占已排队的工作
    pub const PRIORITY_URGENT: i32 = 10;

    pub const DEFAULT_TIMEOUT_SECONDS: u64 = 3600;

    pub fn new(instruction_type: InstructionType, payload: serde_json::Map<String, Value>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            instruction_type,
            payload,
            timeout: Self::DEFAULT_TIMEOUT_SECONDS,
            priority: Self::PRIORITY_NORMAL,
            created_at: Utc::now(),
        }
    }

    pub fn with_timeout(mut self, timeout_seconds: u64) -> Self {
        self.timeout = timeout_seconds;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    /// 任务执行指令，携带任务ID、脚本引用和执行参数
    pub fn execute_task(task: &Task, script: &Script, timeout_seconds: u64) -> Self {
        let payload = json!({
            "task_id": task.id,
            "task_name": task.name,
            "script_id": script.id,
            "script_name": script.name,
            "script_version": script.version,
            "script_content": script.content,
            "parameters": task.parameters,
        });

        Self::new(InstructionType::ExecuteTask, into_map(payload))
            .with_timeout(timeout_seconds)
            .with_priority(Self::PRIORITY_ELEVATED)
    }

    /// 取消指令，使用最高优先级插入队头
    pub fn cancel_task(task_id: &str, instruction_id: Option<&str>, reason: &str) -> Self {
        let payload = json!({
            "task_id": task_id,
            "instruction_id": instruction_id,
            "reason": reason,
        });

        Self::new(InstructionType::CancelTask, into_map(payload))
            .with_priority(Self::PRIORITY_URGENT)
    }

    /// 设备首次注册后的欢迎指令
    pub fn welcome(device_code: &str, device_name: &str) -> Self {
        let payload = json!({
            "device_code": device_code,
            "device_name": device_name,
            "message": "registered",
        });

        Self::new(InstructionType::Welcome, into_map(payload))
    }

    pub fn is_high_priority(&self) -> bool {
        self.priority >= Self::PRIORITY_URGENT
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        let timeout = i64::try_from(self.timeout)
            .unwrap_or(i64::MAX)
            .min(i64::MAX / 1000);
        self.created_at
            .checked_add_signed(Duration::seconds(timeout))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at()
    }

    /// 取 payload 中的任务ID（仅任务相关指令携带）
    pub fn task_id(&self) -> Option<&str> {
        self.payload.get("task_id").and_then(Value::as_str)
    }
}

fn into_map(value: Value) -> serde_json::Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => serde_json::Map::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expiry_window() {
        let created = Utc::now() - Duration::seconds(120);
        let instruction = Instruction::new(InstructionType::Welcome, serde_json::Map::new())
            .with_timeout(60)
            .with_created_at(created);

        assert!(instruction.is_expired(Utc::now()));
        assert!(!instruction.is_expired(created + Duration::seconds(59)));
    }

    #[test]
    fn test_cancel_is_high_priority() {
        let cancel = Instruction::cancel_task("task-1", Some("ins-1"), "operator");
        assert!(cancel.is_high_priority());
        assert_eq!(cancel.task_id(), Some("task-1"));
        assert_eq!(cancel.instruction_type, InstructionType::CancelTask);
    }

    #[test]
    fn test_serialized_type_tag() {
        let instruction = Instruction::welcome("D1", "device one");
        let value = serde_json::to_value(&instruction).unwrap();
        assert_eq!(value["type"], "welcome");

        let decoded: Instruction = serde_json::from_value(value).unwrap();
        assert_eq!(decoded, instruction);
    }

    #[test]
    fn test_unknown_type_tolerated() {
        let raw = json!({
            "id": "x",
            "type": "reboot",
            "payload": {},
            "timeout": 10,
            "priority": 0,
            "created_at": "2024-01-01T00:00:00Z"
        });
        let decoded: Instruction = serde_json::from_value(raw).unwrap();
        assert_eq!(decoded.instruction_type, InstructionType::Unknown);
    }
}
