//! Test data builders for fleet entities

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use fleet_core::models::{
    Device, DeviceGroup, ExecutionReport, ExecutionStatus, Script, TargetType, Task, TaskSpec,
    TaskStatus, TaskType,
};

/// Builder for task specs and tasks
pub struct TaskBuilder {
    spec: TaskSpec,
    id: Option<String>,
    status: Option<TaskStatus>,
    created_at: Option<DateTime<Utc>>,
}

impl TaskBuilder {
    pub fn new() -> Self {
        Self {
            spec: TaskSpec::immediate("test_task", "script-1", TargetType::All),
            id: None,
            status: None,
            created_at: None,
        }
    }

    pub fn with_id(mut self, id: &str) -> Self {
        self.id = Some(id.to_string());
        self
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.spec.name = name.to_string();
        self
    }

    pub fn with_script(mut self, script_id: &str) -> Self {
        self.spec.script_id = script_id.to_string();
        self
    }

    pub fn with_parameters(mut self, parameters: serde_json::Value) -> Self {
        self.spec.parameters = parameters;
        self
    }

    pub fn targeting_devices(mut self, codes: &[&str]) -> Self {
        self.spec.target_type = TargetType::Specific;
        self.spec.target_device_ids = codes.iter().map(|code| code.to_string()).collect();
        self
    }

    pub fn targeting_nothing(mut self) -> Self {
        self.spec.target_type = TargetType::Specific;
        self.spec.target_device_ids = BTreeSet::new();
        self
    }

    pub fn targeting_group(mut self, group_id: &str) -> Self {
        self.spec.target_type = TargetType::Group;
        self.spec.target_group_id = Some(group_id.to_string());
        self
    }

    pub fn targeting_all(mut self) -> Self {
        self.spec.target_type = TargetType::All;
        self
    }

    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.spec.task_type = TaskType::Scheduled;
        self.spec.scheduled_time = Some(at);
        self
    }

    pub fn recurring(mut self, cron_expression: &str) -> Self {
        self.spec.task_type = TaskType::Recurring;
        self.spec.cron_expression = Some(cron_expression.to_string());
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.spec.max_retries = max_retries;
        self
    }

    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = Some(created_at);
        self
    }

    pub fn spec(self) -> TaskSpec {
        self.spec
    }

    pub fn build(self) -> Task {
        let mut task = Task::new(self.spec);
        if let Some(id) = self.id {
            task.id = id;
        }
        if let Some(status) = self.status {
            task.status = status;
        }
        if let Some(created_at) = self.created_at {
            task.created_at = created_at;
            task.updated_at = created_at;
        }
        task
    }
}

impl Default for TaskBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for devices
pub struct DeviceBuilder {
    device: Device,
}

impl DeviceBuilder {
    pub fn new(code: &str) -> Self {
        Self {
            device: Device::new(code, &format!("device {code}")),
        }
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.device.name = name.to_string();
        self
    }

    pub fn in_group(mut self, group_id: &str) -> Self {
        self.device.group_id = Some(group_id.to_string());
        self
    }

    pub fn with_certificate(mut self, certificate: &str) -> Self {
        self.device.certificate = Some(certificate.to_string());
        self
    }

    pub fn build(self) -> Device {
        self.device
    }
}

pub fn group(id: &str) -> DeviceGroup {
    DeviceGroup::new(id, &format!("group {id}"))
}

/// Builder for scripts
pub struct ScriptBuilder {
    script: Script,
}

impl ScriptBuilder {
    pub fn new() -> Self {
        let mut script = Script::new("restart_player", "systemctl restart player");
        script.id = "script-1".to_string();
        Self { script }
    }

    pub fn with_id(mut self, id: &str) -> Self {
        self.script.id = id.to_string();
        self
    }

    pub fn with_content(mut self, content: &str) -> Self {
        self.script.content = content.to_string();
        self
    }

    pub fn with_timeout(mut self, timeout_seconds: u64) -> Self {
        self.script.timeout_seconds = Some(timeout_seconds);
        self
    }

    pub fn build(self) -> Script {
        self.script
    }
}

impl Default for ScriptBuilder {
    fn default() -> Self {
        Self::new()
    }
}

pub fn report(instruction_id: &str, status: ExecutionStatus) -> ExecutionReport {
    ExecutionReport::new(instruction_id, status)
}
