use async_trait::async_trait;

use crate::models::{Device, DeviceGroup, Script, Task, TaskFilter};
use crate::{FleetError, FleetResult};

/// 在仓储内部原子执行的任务修改
pub type TaskMutation = Box<dyn FnOnce(&mut Task) -> FleetResult<()> + Send>;

/// 设备目录：设备是否存在、分组成员关系
#[async_trait]
pub trait DeviceDirectory: Send + Sync {
    async fn get_device(&self, code: &str) -> FleetResult<Option<Device>>;

    /// 按设备编码新增或覆盖
    async fn upsert_device(&self, device: &Device) -> FleetResult<Device>;

    async fn list_devices(&self) -> FleetResult<Vec<Device>>;

    async fn get_group(&self, group_id: &str) -> FleetResult<Option<DeviceGroup>>;

    async fn group_members(&self, group_id: &str) -> FleetResult<Vec<Device>>;
}

/// 任务记录存储
#[async_trait]
pub trait TaskRepository: Send + Sync {
    async fn create(&self, task: &Task) -> FleetResult<Task>;

    async fn get(&self, id: &str) -> FleetResult<Option<Task>>;

    async fn list(&self, filter: &TaskFilter) -> FleetResult<Vec<Task>>;

    /// 读取-修改-写回在一次原子操作内完成；修改返回错误时不落盘
    async fn modify(&self, id: &str, mutation: TaskMutation) -> FleetResult<Task>;

    async fn get_required(&self, id: &str) -> FleetResult<Task> {
        self.get(id)
            .await?
            .ok_or_else(|| FleetError::TaskNotFound { id: id.to_string() })
    }
}

/// 脚本记录存储
#[async_trait]
pub trait ScriptRepository: Send + Sync {
    async fn create(&self, script: &Script) -> FleetResult<Script>;

    async fn get(&self, id: &str) -> FleetResult<Option<Script>>;

    async fn list(&self) -> FleetResult<Vec<Script>>;
}
