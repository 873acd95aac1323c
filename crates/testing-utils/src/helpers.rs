//! Test environment helpers

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use fleet_core::config::{PresenceConfig, SchedulerConfig};
use fleet_core::models::{Device, DeviceGroup, Script};
use fleet_core::traits::{DeviceDirectory, ScriptRepository, SharedStore};
use fleet_core::StoreKeys;
use fleet_infrastructure::{
    DistributedLock, InMemoryDeviceDirectory, InMemoryScriptRepository, InMemoryStore,
    InMemoryTaskRepository, InstructionQueue, PresenceTracker,
};

/// 固定时刻，便于写确定性的时间断言
pub fn fixed_now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
}

/// 内存后端组合：共享存储、设备目录、任务和脚本存储
#[derive(Clone)]
pub struct TestBackends {
    pub store: Arc<dyn SharedStore>,
    pub keys: StoreKeys,
    pub directory: Arc<InMemoryDeviceDirectory>,
    pub tasks: Arc<InMemoryTaskRepository>,
    pub scripts: Arc<InMemoryScriptRepository>,
}

impl TestBackends {
    pub fn new() -> Self {
        Self::with_store(Arc::new(InMemoryStore::new()))
    }

    pub fn with_store(store: Arc<dyn SharedStore>) -> Self {
        Self {
            store,
            keys: StoreKeys::default(),
            directory: Arc::new(InMemoryDeviceDirectory::new()),
            tasks: Arc::new(InMemoryTaskRepository::new()),
            scripts: Arc::new(InMemoryScriptRepository::new()),
        }
    }

    pub fn queue(&self) -> InstructionQueue {
        InstructionQueue::new(self.store.clone(), self.keys.clone())
    }

    pub fn presence(&self) -> PresenceTracker {
        PresenceTracker::new(self.store.clone(), self.keys.clone(), PresenceConfig::default())
    }

    /// 等待上限很短的锁，测试里的锁竞争会很快失败
    pub fn lock(&self) -> DistributedLock {
        DistributedLock::from_config(
            self.store.clone(),
            &SchedulerConfig {
                lock_wait_timeout_ms: 2_000,
                lock_retry_interval_ms: 5,
                ..SchedulerConfig::default()
            },
        )
    }

    pub async fn add_devices(&self, devices: Vec<Device>) {
        for device in devices {
            self.directory.upsert_device(&device).await.unwrap();
        }
    }

    pub async fn add_group(&self, group: DeviceGroup) {
        self.directory.add_group(group).await;
    }

    pub async fn add_script(&self, script: Script) {
        self.scripts.create(&script).await.unwrap();
    }
}

impl Default for TestBackends {
    fn default() -> Self {
        Self::new()
    }
}
