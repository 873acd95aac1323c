//! 运维侧接口：任务控制、队列检查和设备监控

use std::sync::Arc;

use fleet_core::config::QueueConfig;
use fleet_core::models::{Instruction, Task, TaskFilter, TaskProgress, TaskSpec};
use fleet_core::traits::DeviceDirectory;
use fleet_core::{FleetError, FleetResult};
use fleet_dispatcher::{DispatchOutcome, ScanSummary, TaskCancellation, TaskScheduler};
use fleet_infrastructure::{InstructionQueue, PresenceTracker};
use tracing::info;

use crate::types::{DeviceStatus, QueueStats};

pub struct OperatorService {
    scheduler: Arc<TaskScheduler>,
    directory: Arc<dyn DeviceDirectory>,
    queue: InstructionQueue,
    presence: PresenceTracker,
    queue_config: QueueConfig,
}

impl OperatorService {
    pub fn new(
        scheduler: Arc<TaskScheduler>,
        directory: Arc<dyn DeviceDirectory>,
        queue: InstructionQueue,
        presence: PresenceTracker,
        queue_config: QueueConfig,
    ) -> Self {
        Self {
            scheduler,
            directory,
            queue,
            presence,
            queue_config,
        }
    }

    pub async fn create_task(&self, spec: TaskSpec) -> FleetResult<Task> {
        self.scheduler.create_task(spec).await
    }

    pub async fn get_task(&self, task_id: &str) -> FleetResult<Task> {
        self.scheduler.get_task(task_id).await
    }

    pub async fn list_tasks(&self, filter: &TaskFilter) -> FleetResult<Vec<Task>> {
        self.scheduler.list_tasks(filter).await
    }

    pub async fn task_progress(&self, task_id: &str) -> FleetResult<TaskProgress> {
        self.scheduler.task_progress(task_id).await
    }

    pub async fn pause_task(&self, task_id: &str) -> FleetResult<Task> {
        self.scheduler.pause_task(task_id).await
    }

    pub async fn resume_task(&self, task_id: &str) -> FleetResult<Task> {
        self.scheduler.resume_task(task_id).await
    }

    pub async fn cancel_task(&self, task_id: &str, reason: &str) -> FleetResult<TaskCancellation> {
        self.scheduler.cancel_task(task_id, reason).await
    }

    /// 手动触发一次分发；任务正在执行时返回 Skipped
    pub async fn dispatch_task(&self, task_id: &str) -> FleetResult<DispatchOutcome> {
        self.scheduler.dispatcher().dispatch(task_id).await
    }

    /// 立即执行一次到期扫描
    pub async fn trigger_scan(&self) -> FleetResult<ScanSummary> {
        self.scheduler.scan_due_tasks().await
    }

    /// 预览设备队列，条数不超过配置上限
    pub async fn preview_queue(
        &self,
        device_code: &str,
        limit: Option<usize>,
    ) -> FleetResult<Vec<Instruction>> {
        let limit = limit
            .unwrap_or(self.queue_config.preview_limit)
            .min(self.queue_config.preview_limit);
        self.queue.preview(device_code, limit).await
    }

    pub async fn clear_queue(&self, device_code: &str) -> FleetResult<u64> {
        let removed = self.queue.clear(device_code).await?;
        info!("运维清空了设备 {} 的队列，丢弃 {} 条指令", device_code, removed);
        Ok(removed)
    }

    pub async fn cancel_instruction(
        &self,
        device_code: &str,
        instruction_id: &str,
    ) -> FleetResult<bool> {
        self.queue.cancel(device_code, instruction_id).await
    }

    pub async fn queue_stats(&self) -> FleetResult<QueueStats> {
        Ok(QueueStats::from_depths(self.queue.queue_depths().await?))
    }

    pub async fn online_devices(&self) -> FleetResult<Vec<String>> {
        self.presence.online_devices().await
    }

    pub async fn device_status(&self, device_code: &str) -> FleetResult<DeviceStatus> {
        let device = self
            .directory
            .get_device(device_code)
            .await?
            .ok_or_else(|| FleetError::DeviceNotFound {
                code: device_code.to_string(),
            })?;
        let presence = self.presence.snapshot(device_code).await?;
        let queued_instructions = self.queue.len(device_code).await?;

        Ok(DeviceStatus {
            device,
            presence,
            queued_instructions,
        })
    }
}
