use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use tracing::{debug, warn};

use fleet_core::models::{TargetType, Task, TaskSpec};
use fleet_core::traits::DeviceDirectory;
use fleet_core::{FleetError, FleetResult};

/// 把任务声明的目标解析为具体的设备编码列表
///
/// 每次分发时重新解析，不缓存在任务上，创建之后的分组成员变化会生效。
#[derive(Clone)]
pub struct TaskTargetResolver {
    directory: Arc<dyn DeviceDirectory>,
}

impl TaskTargetResolver {
    pub fn new(directory: Arc<dyn DeviceDirectory>) -> Self {
        Self { directory }
    }

    /// 创建任务时的目标检查：指定设备列表不能为空，分组必须存在
    pub async fn validate(&self, spec: &TaskSpec) -> FleetResult<()> {
        match spec.target_type {
            TargetType::Specific => {
                Self::specific_ids(&spec.target_device_ids)?;
                Ok(())
            }
            TargetType::Group => {
                let group_id = Self::group_id(spec.target_group_id.as_deref())?;
                if self.directory.get_group(group_id).await?.is_none() {
                    return Err(FleetError::GroupNotFound {
                        id: group_id.to_string(),
                    });
                }
                Ok(())
            }
            TargetType::All => Ok(()),
        }
    }

    /// 解析目标设备，结果去重并按编码排序
    pub async fn resolve(&self, task: &Task) -> FleetResult<Vec<String>> {
        let devices = match task.target_type {
            TargetType::Specific => {
                let requested = Self::specific_ids(&task.target_device_ids)?;
                let mut known = Vec::with_capacity(requested.len());
                for code in requested {
                    if self.directory.get_device(code).await?.is_some() {
                        known.push(code.clone());
                    } else {
                        warn!("任务 {} 的目标设备 {} 不存在，跳过", task.id, code);
                    }
                }
                known
            }
            TargetType::Group => {
                let group_id = Self::group_id(task.target_group_id.as_deref())?;
                self.directory
                    .group_members(group_id)
                    .await?
                    .into_iter()
                    .map(|device| device.code)
                    .collect()
            }
            TargetType::All => self
                .directory
                .list_devices()
                .await?
                .into_iter()
                .map(|device| device.code)
                .collect(),
        };

        let mut seen = HashSet::new();
        let mut devices: Vec<String> = devices
            .into_iter()
            .filter(|code| seen.insert(code.clone()))
            .collect();
        devices.sort();

        debug!(
            "任务 {} 目标类型 {:?} 解析出 {} 台设备",
            task.id,
            task.target_type,
            devices.len()
        );
        Ok(devices)
    }

    fn specific_ids(ids: &BTreeSet<String>) -> FleetResult<Vec<&String>> {
        let ids: Vec<&String> = ids.iter().filter(|id| !id.trim().is_empty()).collect();
        if ids.is_empty() {
            return Err(FleetError::InvalidTarget(
                "指定设备目标必须包含至少一个设备编码".to_string(),
            ));
        }
        Ok(ids)
    }

    fn group_id(group_id: Option<&str>) -> FleetResult<&str> {
        match group_id.map(str::trim) {
            Some(id) if !id.is_empty() => Ok(id),
            _ => Err(FleetError::InvalidTarget(
                "分组目标必须指定分组ID".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_core::models::{Device, DeviceGroup};
    use fleet_infrastructure::InMemoryDeviceDirectory;

    async fn directory() -> Arc<InMemoryDeviceDirectory> {
        let directory = Arc::new(InMemoryDeviceDirectory::new());
        directory.add_group(DeviceGroup::new("lobby", "Lobby")).await;
        for (code, group) in [("D1", Some("lobby")), ("D2", Some("lobby")), ("D3", None)] {
            let mut device = Device::new(code, code);
            device.group_id = group.map(str::to_string);
            directory.upsert_device(&device).await.unwrap();
        }
        directory
    }

    fn task(target_type: TargetType) -> Task {
        Task::new(TaskSpec::immediate("t", "s", target_type))
    }

    #[tokio::test]
    async fn test_specific_requires_ids() {
        let resolver = TaskTargetResolver::new(directory().await);
        let err = resolver.resolve(&task(TargetType::Specific)).await.unwrap_err();
        assert!(matches!(err, FleetError::InvalidTarget(_)));

        let spec = TaskSpec::immediate("t", "s", TargetType::Specific);
        assert!(resolver.validate(&spec).await.is_err());
    }

    #[tokio::test]
    async fn test_specific_drops_unknown_devices() {
        let resolver = TaskTargetResolver::new(directory().await);
        let mut task = task(TargetType::Specific);
        task.target_device_ids = ["D3", "D1", "ghost"].iter().map(|s| s.to_string()).collect();

        assert_eq!(resolver.resolve(&task).await.unwrap(), vec!["D1", "D3"]);
    }

    #[tokio::test]
    async fn test_group_resolution() {
        let resolver = TaskTargetResolver::new(directory().await);
        let mut task = task(TargetType::Group);
        task.target_group_id = Some("lobby".to_string());
        assert_eq!(resolver.resolve(&task).await.unwrap(), vec!["D1", "D2"]);

        task.target_group_id = Some("missing".to_string());
        assert!(matches!(
            resolver.resolve(&task).await,
            Err(FleetError::GroupNotFound { .. })
        ));

        task.target_group_id = None;
        assert!(matches!(
            resolver.resolve(&task).await,
            Err(FleetError::InvalidTarget(_))
        ));
    }

    #[tokio::test]
    async fn test_all_ignores_declared_ids() {
        let resolver = TaskTargetResolver::new(directory().await);
        let mut task = task(TargetType::All);
        task.target_device_ids.insert("ghost".to_string());
        task.target_group_id = Some("missing".to_string());

        assert_eq!(resolver.resolve(&task).await.unwrap(), vec!["D1", "D2", "D3"]);
    }

    #[tokio::test]
    async fn test_membership_changes_are_honored() {
        let directory = directory().await;
        let resolver = TaskTargetResolver::new(directory.clone());
        let mut task = task(TargetType::Group);
        task.target_group_id = Some("lobby".to_string());

        directory
            .upsert_device(&Device::new("D4", "new").with_group("lobby"))
            .await
            .unwrap();
        assert_eq!(resolver.resolve(&task).await.unwrap().len(), 3);
    }
}
