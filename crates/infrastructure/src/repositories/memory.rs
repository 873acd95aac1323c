use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use fleet_core::models::{Device, DeviceGroup, Script, Task, TaskFilter};
use fleet_core::traits::{DeviceDirectory, ScriptRepository, TaskMutation, TaskRepository};
use fleet_core::{FleetError, FleetResult};
use tokio::sync::RwLock;

/// 进程内设备目录
///
/// 设备按编码去重，分组在设备档案中以 `group_id` 关联。
#[derive(Debug, Clone, Default)]
pub struct InMemoryDeviceDirectory {
    devices: Arc<RwLock<BTreeMap<String, Device>>>,
    groups: Arc<RwLock<BTreeMap<String, DeviceGroup>>>,
}

impl InMemoryDeviceDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_group(&self, group: DeviceGroup) {
        self.groups.write().await.insert(group.id.clone(), group);
    }

    pub async fn device_count(&self) -> usize {
        self.devices.read().await.len()
    }
}

#[async_trait]
impl DeviceDirectory for InMemoryDeviceDirectory {
    async fn get_device(&self, code: &str) -> FleetResult<Option<Device>> {
        Ok(self.devices.read().await.get(code).cloned())
    }

    async fn upsert_device(&self, device: &Device) -> FleetResult<Device> {
        let mut devices = self.devices.write().await;
        let mut stored = device.clone();
        if let Some(existing) = devices.get(&device.code) {
            stored.registered_at = existing.registered_at;
        }
        stored.updated_at = Utc::now();
        devices.insert(stored.code.clone(), stored.clone());
        Ok(stored)
    }

    async fn list_devices(&self) -> FleetResult<Vec<Device>> {
        Ok(self.devices.read().await.values().cloned().collect())
    }

    async fn get_group(&self, group_id: &str) -> FleetResult<Option<DeviceGroup>> {
        Ok(self.groups.read().await.get(group_id).cloned())
    }

    async fn group_members(&self, group_id: &str) -> FleetResult<Vec<Device>> {
        if !self.groups.read().await.contains_key(group_id) {
            return Err(FleetError::GroupNotFound {
                id: group_id.to_string(),
            });
        }
        Ok(self
            .devices
            .read()
            .await
            .values()
            .filter(|device| device.group_id.as_deref() == Some(group_id))
            .cloned()
            .collect())
    }
}

/// 进程内任务存储
#[derive(Debug, Clone, Default)]
pub struct InMemoryTaskRepository {
    tasks: Arc<RwLock<HashMap<String, Task>>>,
}

impl InMemoryTaskRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn count(&self) -> usize {
        self.tasks.read().await.len()
    }
}

#[async_trait]
impl TaskRepository for InMemoryTaskRepository {
    async fn create(&self, task: &Task) -> FleetResult<Task> {
        let mut tasks = self.tasks.write().await;
        if tasks.contains_key(&task.id) {
            return Err(FleetError::Validation(format!("任务ID已存在: {}", task.id)));
        }
        tasks.insert(task.id.clone(), task.clone());
        Ok(task.clone())
    }

    async fn get(&self, id: &str) -> FleetResult<Option<Task>> {
        Ok(self.tasks.read().await.get(id).cloned())
    }

    async fn list(&self, filter: &TaskFilter) -> FleetResult<Vec<Task>> {
        let tasks = self.tasks.read().await;
        let mut matched: Vec<Task> = tasks
            .values()
            .filter(|task| filter.matches(task))
            .cloned()
            .collect();
        matched.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        if let Some(limit) = filter.limit {
            matched.truncate(limit);
        }
        Ok(matched)
    }

    async fn modify(&self, id: &str, mutation: TaskMutation) -> FleetResult<Task> {
        let mut tasks = self.tasks.write().await;
        let current = tasks
            .get(id)
            .ok_or_else(|| FleetError::TaskNotFound { id: id.to_string() })?;

        // 在副本上修改，失败时原记录保持不变
        let mut updated = current.clone();
        mutation(&mut updated)?;
        tasks.insert(id.to_string(), updated.clone());
        Ok(updated)
    }
}

/// 进程内脚本存储
#[derive(Debug, Clone, Default)]
pub struct InMemoryScriptRepository {
    scripts: Arc<RwLock<HashMap<String, Script>>>,
}

impl InMemoryScriptRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ScriptRepository for InMemoryScriptRepository {
    async fn create(&self, script: &Script) -> FleetResult<Script> {
        self.scripts
            .write()
            .await
            .insert(script.id.clone(), script.clone());
        Ok(script.clone())
    }

    async fn get(&self, id: &str) -> FleetResult<Option<Script>> {
        Ok(self.scripts.read().await.get(id).cloned())
    }

    async fn list(&self) -> FleetResult<Vec<Script>> {
        let mut scripts: Vec<Script> = self.scripts.read().await.values().cloned().collect();
        scripts.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(scripts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_core::models::{DeviceOutcome, TargetType, TaskSpec, TaskStatus};

    fn sample_task() -> Task {
        Task::new(TaskSpec::immediate("reboot", "script-1", TargetType::All))
    }

    #[tokio::test]
    async fn test_modify_failure_leaves_record_untouched() {
        let repo = InMemoryTaskRepository::new();
        let task = repo.create(&sample_task()).await.unwrap();

        let result = repo
            .modify(
                &task.id,
                Box::new(|task| {
                    task.status = TaskStatus::Running;
                    Err(FleetError::Internal("boom".to_string()))
                }),
            )
            .await;
        assert!(result.is_err());

        let stored = repo.get_required(&task.id).await.unwrap();
        assert_eq!(stored.status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn test_record_outcome_never_exceeds_total() {
        let repo = InMemoryTaskRepository::new();
        let mut task = sample_task();
        task.total_devices = 1;
        let task = repo.create(&task).await.unwrap();

        repo.modify(&task.id, Box::new(|task| task.record_outcome(DeviceOutcome::Success)))
            .await
            .unwrap();
        assert!(repo
            .modify(&task.id, Box::new(|task| task.record_outcome(DeviceOutcome::Failed)))
            .await
            .is_err());

        let stored = repo.get_required(&task.id).await.unwrap();
        assert_eq!(stored.success_devices, 1);
        assert_eq!(stored.failed_devices, 0);
    }

    #[tokio::test]
    async fn test_missing_task() {
        let repo = InMemoryTaskRepository::new();
        let err = repo.get_required("nope").await.unwrap_err();
        assert!(matches!(err, FleetError::TaskNotFound { .. }));
    }

    #[tokio::test]
    async fn test_list_with_filter_and_limit() {
        let repo = InMemoryTaskRepository::new();
        for _ in 0..3 {
            repo.create(&sample_task()).await.unwrap();
        }
        let filter = TaskFilter {
            status: Some(TaskStatus::Pending),
            limit: Some(2),
            ..Default::default()
        };
        assert_eq!(repo.list(&filter).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_group_members() {
        let directory = InMemoryDeviceDirectory::new();
        directory.add_group(DeviceGroup::new("g1", "lobby")).await;
        directory
            .upsert_device(&Device::new("D1", "screen").with_group("g1"))
            .await
            .unwrap();
        directory
            .upsert_device(&Device::new("D2", "kiosk"))
            .await
            .unwrap();

        let members = directory.group_members("g1").await.unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].code, "D1");
        assert!(matches!(
            directory.group_members("missing").await,
            Err(FleetError::GroupNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_upsert_keeps_registration_time() {
        let directory = InMemoryDeviceDirectory::new();
        let first = directory
            .upsert_device(&Device::new("D1", "screen"))
            .await
            .unwrap();

        let mut renamed = Device::new("D1", "renamed");
        renamed.registered_at = Utc::now() + chrono::Duration::hours(1);
        let second = directory.upsert_device(&renamed).await.unwrap();

        assert_eq!(second.registered_at, first.registered_at);
        assert_eq!(second.name, "renamed");
        assert_eq!(directory.device_count().await, 1);
    }
}
