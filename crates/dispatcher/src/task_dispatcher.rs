//! 任务分发与执行回报汇总

use std::sync::Arc;

use chrono::{DateTime, Utc};
use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use fleet_core::config::QueueConfig;
use fleet_core::models::{
    DeviceOutcome, ExecutionReport, ExecutionStatus, Instruction, InstructionStatusRecord, Task,
    TaskProgress, TaskStatus,
};
use fleet_core::traits::{ScriptRepository, TaskRepository};
use fleet_core::{FleetError, FleetResult};
use fleet_infrastructure::{DistributedLock, InstructionQueue};

use crate::retry_policy::RetryPolicy;
use crate::status_store::ExecutionStatusStore;
use crate::target_resolver::TaskTargetResolver;

/// 一次分发的结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DispatchOutcome {
    /// 指令已下发
    Dispatched {
        task_id: String,
        status: TaskStatus,
        total_devices: u32,
        enqueued: u32,
        delivery_failures: u32,
    },
    /// 分发本身失败；配置了重试时任务回到 PENDING 并给出下次时间
    Failed {
        task_id: String,
        status: TaskStatus,
        reason: String,
        next_retry_at: Option<DateTime<Utc>>,
    },
    /// 任务当前状态不允许分发
    Skipped { task_id: String, status: TaskStatus },
}

impl DispatchOutcome {
    pub fn task_id(&self) -> &str {
        match self {
            DispatchOutcome::Dispatched { task_id, .. }
            | DispatchOutcome::Failed { task_id, .. }
            | DispatchOutcome::Skipped { task_id, .. } => task_id,
        }
    }

    pub fn status(&self) -> TaskStatus {
        match self {
            DispatchOutcome::Dispatched { status, .. }
            | DispatchOutcome::Failed { status, .. }
            | DispatchOutcome::Skipped { status, .. } => *status,
        }
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, DispatchOutcome::Skipped { .. })
    }
}

/// 一次执行回报的处理结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportOutcome {
    pub instruction_id: String,
    pub status: ExecutionStatus,
    /// 是否计入了任务进度；重复的终态回报和上一轮遗留的回报不计入
    pub counted: bool,
    pub task: Option<TaskProgress>,
}

impl ReportOutcome {
    fn recorded(report: &ExecutionReport) -> Self {
        Self {
            instruction_id: report.instruction_id.clone(),
            status: report.status,
            counted: false,
            task: None,
        }
    }
}

/// 取消任务时对已下发指令的处理结果
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecallSummary {
    /// 尚未交付、已从队列移除的指令数
    pub removed_from_queue: u32,
    /// 发送了取消指令的设备数
    pub cancel_sent: u32,
}

/// 任务当前是否可以进入新一轮分发
///
/// 只有 PENDING 任务可分发；周期任务每轮结束后会回到 PENDING。
pub fn is_dispatchable(task: &Task) -> bool {
    task.status == TaskStatus::Pending
}

/// 所有设备回报完毕时收尾：全部成功为 COMPLETED，否则为 PARTIALLY_COMPLETED，
/// 有失败且还有重试次数时整体重新排期
fn settle(task: &mut Task, now: DateTime<Utc>, retry: &RetryPolicy) {
    if task.status != TaskStatus::Running {
        return;
    }
    let Some(final_status) = task.aggregate_status() else {
        return;
    };

    if final_status == TaskStatus::PartiallyCompleted && task.can_retry() {
        let reason = format!(
            "{} of {} devices failed",
            task.failed_devices, task.total_devices
        );
        schedule_retry(task, reason, now, retry);
    } else {
        task.finish_run(final_status, now);
    }
}

fn schedule_retry(task: &mut Task, reason: String, now: DateTime<Utc>, retry: &RetryPolicy) {
    task.retry_count += 1;
    task.scheduled_time = Some(retry.next_retry_time(task.retry_count, now));
    task.status = TaskStatus::Pending;
    task.failure_reason = Some(reason);
    task.end_time = None;
    task.updated_at = now;
}

pub struct TaskDispatcher {
    tasks: Arc<dyn TaskRepository>,
    scripts: Arc<dyn ScriptRepository>,
    resolver: TaskTargetResolver,
    queue: InstructionQueue,
    statuses: ExecutionStatusStore,
    lock: DistributedLock,
    retry: RetryPolicy,
    queue_config: QueueConfig,
}

impl TaskDispatcher {
    pub fn new(
        tasks: Arc<dyn TaskRepository>,
        scripts: Arc<dyn ScriptRepository>,
        resolver: TaskTargetResolver,
        queue: InstructionQueue,
        statuses: ExecutionStatusStore,
        lock: DistributedLock,
    ) -> Self {
        Self {
            tasks,
            scripts,
            resolver,
            queue,
            statuses,
            lock,
            retry: RetryPolicy::default(),
            queue_config: QueueConfig::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_queue_config(mut self, queue_config: QueueConfig) -> Self {
        self.queue_config = queue_config;
        self
    }

    pub fn statuses(&self) -> &ExecutionStatusStore {
        &self.statuses
    }

    pub fn lock(&self) -> &DistributedLock {
        &self.lock
    }

    pub async fn dispatch(&self, task_id: &str) -> FleetResult<DispatchOutcome> {
        self.dispatch_at(task_id, Utc::now()).await
    }

    /// 在任务级锁内完成"解析目标 → 置为 RUNNING → 逐台入队"
    #[instrument(skip(self))]
    pub async fn dispatch_at(
        &self,
        task_id: &str,
        now: DateTime<Utc>,
    ) -> FleetResult<DispatchOutcome> {
        let lock_key = self.statuses.keys().dispatch_lock(task_id);
        self.lock
            .with_lock(&lock_key, || self.dispatch_locked(task_id, now))
            .await
    }

    async fn dispatch_locked(
        &self,
        task_id: &str,
        now: DateTime<Utc>,
    ) -> FleetResult<DispatchOutcome> {
        // 拿到锁之后重新读取，另一次分发可能刚刚完成
        let task = self.tasks.get_required(task_id).await?;
        if !is_dispatchable(&task) {
            debug!("任务 {} 当前状态 {} 不可分发，跳过", task.id, task.status);
            return Ok(DispatchOutcome::Skipped {
                task_id: task.id,
                status: task.status,
            });
        }

        let Some(script) = self.scripts.get(&task.script_id).await? else {
            let reason = FleetError::ScriptNotFound {
                id: task.script_id.clone(),
            }
            .to_string();
            return self.fail_dispatch(&task, reason, now).await;
        };

        let devices = match self.resolver.resolve(&task).await {
            Ok(devices) => devices,
            Err(FleetError::InvalidTarget(message)) => {
                warn!("任务 {} 的目标配置无效: {}", task.id, message);
                Vec::new()
            }
            Err(e @ FleetError::GroupNotFound { .. }) => {
                return self.fail_dispatch(&task, e.to_string(), now).await;
            }
            Err(e) => return Err(e),
        };

        if devices.is_empty() {
            return self
                .fail_dispatch(&task, Task::NO_TARGET_DEVICES.to_string(), now)
                .await;
        }

        let total = u32::try_from(devices.len()).unwrap_or(u32::MAX);
        let task = self
            .tasks
            .modify(
                task_id,
                Box::new(move |task| {
                    task.reset_progress();
                    task.status = TaskStatus::Running;
                    task.start_time = Some(now);
                    task.last_execution_time = Some(now);
                    task.total_devices = total;
                    task.updated_at = now;
                    Ok(())
                }),
            )
            .await?;

        self.statuses.reset_task_index(task_id).await?;

        let timeout = script
            .timeout_seconds
            .unwrap_or(self.queue_config.default_instruction_timeout_seconds);
        let mut enqueued = 0u32;
        let mut delivery_failures = 0u32;

        for device_code in &devices {
            let instruction = Instruction::execute_task(&task, &script, timeout);
            match self.deliver(task_id, device_code, &instruction).await {
                Ok(()) => enqueued += 1,
                Err(e) => {
                    // 单台设备写入失败不影响其余设备，记为该设备失败
                    warn!("任务 {} 向设备 {} 下发指令失败: {}", task_id, device_code, e);
                    self.mark_undelivered(task_id, device_code, &instruction, &e, now)
                        .await;
                    delivery_failures += 1;
                }
            }
        }

        let task = if delivery_failures > 0 {
            self.record_outcomes(task_id, DeviceOutcome::Failed, delivery_failures, now)
                .await?
        } else {
            task
        };

        counter!("fleet_tasks_dispatched_total").increment(1);
        info!(
            task_id = %task_id,
            total_devices = total,
            enqueued,
            delivery_failures,
            "任务已分发"
        );

        Ok(DispatchOutcome::Dispatched {
            task_id: task_id.to_string(),
            status: task.status,
            total_devices: total,
            enqueued,
            delivery_failures,
        })
    }

    async fn deliver(
        &self,
        task_id: &str,
        device_code: &str,
        instruction: &Instruction,
    ) -> FleetResult<()> {
        // 先写状态记录和索引，设备即便立刻回报也能找到所属任务
        self.statuses
            .put(&InstructionStatusRecord::queued(
                &instruction.id,
                device_code,
                Some(task_id),
            ))
            .await?;
        self.statuses
            .index_instruction(task_id, device_code, &instruction.id)
            .await?;
        self.queue
            .enqueue(device_code, instruction, instruction.is_high_priority())
            .await?;
        Ok(())
    }

    /// 入队失败的指令从未到达设备，状态记录直接置为 FAILED，撤回时不会再给它发取消
    async fn mark_undelivered(
        &self,
        task_id: &str,
        device_code: &str,
        instruction: &Instruction,
        error: &FleetError,
        now: DateTime<Utc>,
    ) {
        let mut record =
            InstructionStatusRecord::queued(&instruction.id, device_code, Some(task_id));
        record.status = ExecutionStatus::Failed;
        record.error = Some(error.to_string());
        record.updated_at = now;
        if let Err(e) = self.statuses.put(&record).await {
            warn!("记录指令 {} 的下发失败状态时出错: {}", instruction.id, e);
        }
    }

    async fn fail_dispatch(
        &self,
        task: &Task,
        reason: String,
        now: DateTime<Utc>,
    ) -> FleetResult<DispatchOutcome> {
        let retry = self.retry.clone();
        let failure = reason.clone();

        let task = self
            .tasks
            .modify(
                &task.id,
                Box::new(move |task| {
                    task.reset_progress();
                    task.start_time = Some(now);
                    task.last_execution_time = Some(now);
                    if task.can_retry() {
                        schedule_retry(task, failure, now, &retry);
                    } else {
                        task.failure_reason = Some(failure);
                        task.finish_run(TaskStatus::Failed, now);
                    }
                    Ok(())
                }),
            )
            .await?;

        warn!(
            task_id = %task.id,
            status = %task.status,
            retry_count = task.retry_count,
            "任务分发失败: {}",
            reason
        );

        let next_retry_at = (task.status == TaskStatus::Pending)
            .then_some(task.scheduled_time)
            .flatten();
        Ok(DispatchOutcome::Failed {
            task_id: task.id,
            status: task.status,
            reason,
            next_retry_at,
        })
    }

    /// 累加设备结果并在全部回报后收尾；任务不在执行中时拒绝
    async fn record_outcomes(
        &self,
        task_id: &str,
        outcome: DeviceOutcome,
        count: u32,
        now: DateTime<Utc>,
    ) -> FleetResult<Task> {
        let retry = self.retry.clone();
        self.tasks
            .modify(
                task_id,
                Box::new(move |task| {
                    if !matches!(task.status, TaskStatus::Running | TaskStatus::Paused) {
                        return Err(FleetError::Validation(format!(
                            "任务 {} 状态为 {}，不再接受设备回报",
                            task.id, task.status
                        )));
                    }
                    for _ in 0..count {
                        task.record_outcome(outcome)?;
                    }
                    settle(task, now, &retry);
                    Ok(())
                }),
            )
            .await
    }

    /// 所有设备都已回报但任务还未收尾时补做收尾，用于暂停后恢复
    pub async fn settle_task(&self, task_id: &str, now: DateTime<Utc>) -> FleetResult<Task> {
        let retry = self.retry.clone();
        self.tasks
            .modify(
                task_id,
                Box::new(move |task| {
                    settle(task, now, &retry);
                    Ok(())
                }),
            )
            .await
    }

    pub async fn handle_report(
        &self,
        device_code: &str,
        report: &ExecutionReport,
    ) -> FleetResult<ReportOutcome> {
        self.handle_report_at(device_code, report, Utc::now()).await
    }

    /// 处理设备的执行回报，按 (设备, 指令) 加锁串行化
    #[instrument(skip(self, report), fields(instruction_id = %report.instruction_id))]
    pub async fn handle_report_at(
        &self,
        device_code: &str,
        report: &ExecutionReport,
        now: DateTime<Utc>,
    ) -> FleetResult<ReportOutcome> {
        let lock_key = self
            .statuses
            .keys()
            .report_lock(device_code, &report.instruction_id);
        self.lock
            .with_lock(&lock_key, || self.apply_report(device_code, report, now))
            .await
    }

    async fn apply_report(
        &self,
        device_code: &str,
        report: &ExecutionReport,
        now: DateTime<Utc>,
    ) -> FleetResult<ReportOutcome> {
        let previous = self.statuses.get(&report.instruction_id).await?;
        if let Some(previous) = &previous {
            if previous.device_code != device_code {
                return Err(FleetError::Validation(format!(
                    "指令 {} 不属于设备 {}",
                    report.instruction_id, device_code
                )));
            }
        }

        let task_id = previous
            .as_ref()
            .and_then(|record| record.task_id.clone())
            .or_else(|| report.task_id.clone());
        // 终态记录不再改写：回退到非终态后再次回报终态会被重复计数
        if let Some(finished) = previous.as_ref().filter(|record| record.status.is_terminal()) {
            debug!(
                "指令 {} 已是 {}，忽略 {} 回报",
                report.instruction_id, finished.status, report.status
            );
            return Ok(ReportOutcome::recorded(report));
        }

        self.statuses
            .put(&InstructionStatusRecord {
                instruction_id: report.instruction_id.clone(),
                device_code: device_code.to_string(),
                task_id: task_id.clone(),
                status: report.status,
                output: report.output.clone(),
                error: report.error.clone(),
                metrics: report.metrics.clone(),
                fields: report.fields.clone(),
                updated_at: now,
            })
            .await?;
        counter!("fleet_device_reports_total", "status" => report.status.as_str()).increment(1);

        let Some(outcome) = report.status.outcome() else {
            return Ok(ReportOutcome::recorded(report));
        };
        let Some(task_id) = task_id else {
            return Ok(ReportOutcome::recorded(report));
        };

        let current = self.statuses.task_instructions(&task_id).await?;
        if current.get(device_code) != Some(&report.instruction_id) {
            debug!(
                "指令 {} 不属于任务 {} 的当前一轮，不计数",
                report.instruction_id, task_id
            );
            return Ok(ReportOutcome::recorded(report));
        }

        let task = match self.record_outcomes(&task_id, outcome, 1, now).await {
            Ok(task) => task,
            Err(FleetError::Validation(message)) => {
                warn!("回报未计入任务 {}: {}", task_id, message);
                return Ok(ReportOutcome::recorded(report));
            }
            Err(e) => return Err(e),
        };

        if task.status.is_terminal() {
            info!(
                task_id = %task.id,
                status = %task.status,
                success = task.success_devices,
                failed = task.failed_devices,
                "任务执行结束"
            );
        }

        Ok(ReportOutcome {
            instruction_id: report.instruction_id.clone(),
            status: report.status,
            counted: true,
            task: Some(TaskProgress::from(&task)),
        })
    }

    /// 撤回任务本轮的指令：移除尚未交付的，并向未结束的设备插队发送取消指令
    ///
    /// 已交付的指令无法收回，只能靠取消指令通知设备停止。
    pub async fn recall(&self, task_id: &str, reason: &str) -> FleetResult<RecallSummary> {
        let mut index: Vec<(String, String)> = self
            .statuses
            .task_instructions(task_id)
            .await?
            .into_iter()
            .collect();
        index.sort();

        let mut summary = RecallSummary::default();
        for (device_code, instruction_id) in index {
            match self.queue.cancel(&device_code, &instruction_id).await {
                Ok(true) => {
                    // 设备从未收到这条指令，直接记为已取消
                    summary.removed_from_queue += 1;
                    let mut record =
                        InstructionStatusRecord::queued(&instruction_id, &device_code, Some(task_id));
                    record.status = ExecutionStatus::Cancelled;
                    record.error = Some(reason.to_string());
                    self.statuses.put(&record).await?;
                    continue;
                }
                Ok(false) => {}
                Err(e) => warn!("从设备 {} 的队列移除指令失败: {}", device_code, e),
            }

            let finished = self
                .statuses
                .get(&instruction_id)
                .await?
                .is_some_and(|record| record.status.is_terminal());
            if finished {
                continue;
            }

            let cancel = Instruction::cancel_task(task_id, Some(&instruction_id), reason);
            match self
                .queue
                .enqueue(&device_code, &cancel, cancel.is_high_priority())
                .await
            {
                Ok(_) => summary.cancel_sent += 1,
                Err(e) => warn!("向设备 {} 发送取消指令失败: {}", device_code, e),
            }
        }

        info!(
            task_id = %task_id,
            removed = summary.removed_from_queue,
            notified = summary.cancel_sent,
            "任务指令已撤回"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_core::models::{TargetType, TaskSpec, TaskType};

    fn running_task(total: u32, max_retries: u32) -> Task {
        let mut spec = TaskSpec::immediate("t", "s", TargetType::All);
        spec.max_retries = max_retries;
        let mut task = Task::new(spec);
        task.status = TaskStatus::Running;
        task.total_devices = total;
        task
    }

    #[test]
    fn test_settle_waits_for_all_devices() {
        let now = Utc::now();
        let mut task = running_task(2, 0);
        task.record_outcome(DeviceOutcome::Success).unwrap();
        settle(&mut task, now, &RetryPolicy::default());
        assert_eq!(task.status, TaskStatus::Running);

        task.record_outcome(DeviceOutcome::Success).unwrap();
        settle(&mut task, now, &RetryPolicy::default());
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.end_time, Some(now));
    }

    #[test]
    fn test_settle_with_failures_schedules_retry() {
        let now = Utc::now();
        let mut task = running_task(1, 2);
        task.record_outcome(DeviceOutcome::Failed).unwrap();
        settle(&mut task, now, &RetryPolicy::default());

        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.retry_count, 1);
        assert_eq!(
            task.scheduled_time,
            Some(now + chrono::Duration::seconds(120))
        );
    }

    #[test]
    fn test_dispatchable_states() {
        let mut task = running_task(0, 0);
        assert!(!is_dispatchable(&task));
        task.status = TaskStatus::Pending;
        assert!(is_dispatchable(&task));
        task.task_type = TaskType::Recurring;
        for status in [
            TaskStatus::Completed,
            TaskStatus::PartiallyCompleted,
            TaskStatus::Failed,
            TaskStatus::Cancelled,
            TaskStatus::Paused,
        ] {
            task.status = status;
            assert!(!is_dispatchable(&task), "{status} 不应可分发");
        }
    }

    #[test]
    fn test_settle_returns_recurring_task_to_pending() {
        let now = Utc::now();
        let mut task = running_task(2, 0);
        task.task_type = TaskType::Recurring;
        task.record_outcome(DeviceOutcome::Success).unwrap();
        task.record_outcome(DeviceOutcome::Failed).unwrap();
        settle(&mut task, now, &RetryPolicy::default());

        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.last_run_status, Some(TaskStatus::PartiallyCompleted));
        assert!(is_dispatchable(&task));
    }
}
