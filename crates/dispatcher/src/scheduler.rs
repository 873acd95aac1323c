use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument};

use fleet_core::models::{
    Task, TaskFilter, TaskProgress, TaskSpec, TaskStatus, TaskType,
};
use fleet_core::traits::{ScriptRepository, TaskRepository};
use fleet_core::{FleetError, FleetResult};

use crate::cron_utils::{self, CronScheduler};
use crate::target_resolver::TaskTargetResolver;
use crate::task_dispatcher::{is_dispatchable, DispatchOutcome, RecallSummary, TaskDispatcher};

/// 一次到期扫描的结果
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScanSummary {
    /// 参与判断的任务数
    pub examined: usize,
    pub outcomes: Vec<DispatchOutcome>,
    /// 分发出错的任务数，出错不影响其余任务
    pub errors: usize,
}

impl ScanSummary {
    pub fn dispatched(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|outcome| matches!(outcome, DispatchOutcome::Dispatched { .. }))
            .count()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskCancellation {
    pub task: Task,
    pub recall: RecallSummary,
}

/// 任务在 `now` 是否到期
///
/// - 等待重试的任务以 `scheduled_time` 为准
/// - 立即任务和定时任务在 PENDING 且 `scheduled_time` 已过时到期
/// - 周期任务自上次触发（从未触发则自创建）之后 cron 又到了触发点
pub fn is_task_due(task: &Task, now: DateTime<Utc>) -> bool {
    if !is_dispatchable(task) {
        return false;
    }

    let waiting_retry = task.status == TaskStatus::Pending && task.retry_count > 0;
    if waiting_retry || task.task_type != TaskType::Recurring {
        return task.scheduled_time.map_or(true, |at| at <= now);
    }

    match task.cron_expression.as_deref() {
        Some(expr) => {
            let last_fire = task.last_execution_time.unwrap_or(task.created_at);
            cron_utils::is_due(expr, last_fire, now)
        }
        None => false,
    }
}

/// 任务下一次分发的时间；只有 PENDING 任务有下一次
///
/// 已经到期的任务返回 `now`，无效的 cron 表达式返回 `None`。
pub fn next_run_at(task: &Task, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    if task.status != TaskStatus::Pending {
        return None;
    }

    let waiting_retry = task.retry_count > 0;
    let at = if waiting_retry || task.task_type != TaskType::Recurring {
        task.scheduled_time.unwrap_or(now)
    } else {
        let scheduler = CronScheduler::new(task.cron_expression.as_deref()?).ok()?;
        scheduler.next_execution_time(task.last_execution_time.unwrap_or(task.created_at))?
    };
    Some(at.max(now))
}

/// 任务编排入口：创建、到期扫描、暂停/恢复/取消
pub struct TaskScheduler {
    tasks: Arc<dyn TaskRepository>,
    scripts: Arc<dyn ScriptRepository>,
    resolver: TaskTargetResolver,
    dispatcher: Arc<TaskDispatcher>,
}

impl TaskScheduler {
    pub fn new(
        tasks: Arc<dyn TaskRepository>,
        scripts: Arc<dyn ScriptRepository>,
        resolver: TaskTargetResolver,
        dispatcher: Arc<TaskDispatcher>,
    ) -> Self {
        Self {
            tasks,
            scripts,
            resolver,
            dispatcher,
        }
    }

    pub fn dispatcher(&self) -> &Arc<TaskDispatcher> {
        &self.dispatcher
    }

    /// 创建任务；立即任务随即分发
    ///
    /// 目标配置错误在这里同步返回，任务不会被创建。
    #[instrument(skip(self, spec), fields(name = %spec.name))]
    pub async fn create_task(&self, spec: TaskSpec) -> FleetResult<Task> {
        spec.validate()?;

        if self.scripts.get(&spec.script_id).await?.is_none() {
            return Err(FleetError::ScriptNotFound {
                id: spec.script_id.clone(),
            });
        }
        self.resolver.validate(&spec).await?;
        if spec.task_type == TaskType::Recurring {
            if let Some(expr) = spec.cron_expression.as_deref() {
                CronScheduler::validate_cron_expression(expr)?;
            }
        }

        let task = self.tasks.create(&Task::new(spec)).await?;
        info!(
            task_id = %task.id,
            task_type = ?task.task_type,
            target_type = ?task.target_type,
            "任务已创建"
        );

        if task.task_type == TaskType::Immediate {
            self.dispatcher.dispatch(&task.id).await?;
            return self.tasks.get_required(&task.id).await;
        }
        Ok(task)
    }

    pub async fn get_task(&self, task_id: &str) -> FleetResult<Task> {
        self.tasks.get_required(task_id).await
    }

    pub async fn list_tasks(&self, filter: &TaskFilter) -> FleetResult<Vec<Task>> {
        self.tasks.list(filter).await
    }

    pub async fn task_progress(&self, task_id: &str) -> FleetResult<TaskProgress> {
        self.task_progress_at(task_id, Utc::now()).await
    }

    pub async fn task_progress_at(
        &self,
        task_id: &str,
        now: DateTime<Utc>,
    ) -> FleetResult<TaskProgress> {
        let task = self.tasks.get_required(task_id).await?;
        let mut progress = TaskProgress::from(&task);
        progress.next_run_at = next_run_at(&task, now);
        Ok(progress)
    }

    pub async fn scan_due_tasks(&self) -> FleetResult<ScanSummary> {
        self.scan_due_tasks_at(Utc::now()).await
    }

    /// 找出到期的定时、周期和待重试任务并逐个分发
    ///
    /// 每个任务在一次扫描中至多分发一次；单个任务出错只记日志。
    pub async fn scan_due_tasks_at(&self, now: DateTime<Utc>) -> FleetResult<ScanSummary> {
        // 周期任务在两轮之间也处于 PENDING
        let candidates = self
            .tasks
            .list(&TaskFilter {
                status: Some(TaskStatus::Pending),
                ..Default::default()
            })
            .await?;

        let mut summary = ScanSummary {
            examined: candidates.len(),
            ..Default::default()
        };

        for task in candidates.iter().filter(|task| is_task_due(task, now)) {
            debug!("任务 {} 已到期", task.id);
            match self.dispatcher.dispatch_at(&task.id, now).await {
                Ok(outcome) => summary.outcomes.push(outcome),
                Err(e) => {
                    error!("分发到期任务 {} 失败: {}", task.id, e);
                    summary.errors += 1;
                }
            }
        }

        if !summary.outcomes.is_empty() || summary.errors > 0 {
            info!(
                examined = summary.examined,
                dispatched = summary.dispatched(),
                errors = summary.errors,
                "到期任务扫描完成"
            );
        }
        Ok(summary)
    }

    /// PENDING 或 RUNNING 的任务可以暂停
    pub async fn pause_task(&self, task_id: &str) -> FleetResult<Task> {
        let now = Utc::now();
        let task = self
            .with_task_lock(task_id, || {
                self.tasks.modify(
                    task_id,
                    Box::new(move |task| match task.status {
                        TaskStatus::Pending | TaskStatus::Running => {
                            task.paused_from = Some(task.status);
                            task.status = TaskStatus::Paused;
                            task.updated_at = now;
                            Ok(())
                        }
                        other => Err(FleetError::invalid_transition(&task.id, other, "pause")),
                    }),
                )
            })
            .await?;

        info!(task_id = %task_id, "任务已暂停");
        Ok(task)
    }

    pub async fn resume_task(&self, task_id: &str) -> FleetResult<Task> {
        self.resume_task_at(task_id, Utc::now()).await
    }

    /// 恢复到暂停前的状态
    ///
    /// 执行中被暂停的任务回到 RUNNING，暂停期间已回报齐的随即收尾；
    /// 尚未分发过的任务回到 PENDING，已到期则立即分发。
    pub async fn resume_task_at(&self, task_id: &str, now: DateTime<Utc>) -> FleetResult<Task> {
        let task = self
            .with_task_lock(task_id, || {
                self.tasks.modify(
                    task_id,
                    Box::new(move |task| {
                        if task.status != TaskStatus::Paused {
                            return Err(FleetError::invalid_transition(
                                &task.id,
                                task.status,
                                "resume",
                            ));
                        }
                        task.status = match task.paused_from.take() {
                            Some(TaskStatus::Pending) => TaskStatus::Pending,
                            _ if task.start_time.is_none() => TaskStatus::Pending,
                            _ => TaskStatus::Running,
                        };
                        task.updated_at = now;
                        Ok(())
                    }),
                )
            })
            .await?;

        info!(task_id = %task_id, status = %task.status, "任务已恢复");

        match task.status {
            TaskStatus::Running => self.dispatcher.settle_task(task_id, now).await,
            TaskStatus::Pending if is_task_due(&task, now) => {
                self.dispatcher.dispatch_at(task_id, now).await?;
                self.tasks.get_required(task_id).await
            }
            _ => Ok(task),
        }
    }

    /// 取消任务并撤回本轮指令
    ///
    /// 未结束的任务都可以取消，周期任务在两次触发之间处于 PENDING，取消后不再触发。
    /// 已进入终态的任务拒绝取消。
    pub async fn cancel_task(&self, task_id: &str, reason: &str) -> FleetResult<TaskCancellation> {
        let now = Utc::now();
        let cancellation = self
            .with_task_lock(task_id, || async {
                let task = self
                    .tasks
                    .modify(
                        task_id,
                        Box::new(move |task| {
                            if task.status.is_terminal() {
                                return Err(FleetError::invalid_transition(
                                    &task.id,
                                    task.status,
                                    "cancel",
                                ));
                            }
                            task.paused_from = None;
                            task.mark_terminal(TaskStatus::Cancelled, now);
                            Ok(())
                        }),
                    )
                    .await?;

                let recall = self.dispatcher.recall(task_id, reason).await?;
                Ok(TaskCancellation { task, recall })
            })
            .await?;

        info!(task_id = %task_id, reason, "任务已取消");
        Ok(cancellation)
    }

    /// 与分发共用任务级锁，状态切换不会和正在进行的分发交错
    async fn with_task_lock<F, Fut, T>(&self, task_id: &str, f: F) -> FleetResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = FleetResult<T>>,
    {
        let lock_key = self.dispatcher.statuses().keys().dispatch_lock(task_id);
        self.dispatcher.lock().with_lock(&lock_key, f).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use fleet_core::models::TargetType;

    fn task_of(task_type: TaskType) -> Task {
        let mut spec = TaskSpec::immediate("t", "s", TargetType::All);
        spec.task_type = task_type;
        Task::new(spec)
    }

    #[test]
    fn test_scheduled_task_due_after_time() {
        let now = Utc.with_ymd_and_hms(2025, 5, 1, 9, 0, 0).unwrap();
        let mut task = task_of(TaskType::Scheduled);
        task.scheduled_time = Some(now + Duration::minutes(5));
        assert!(!is_task_due(&task, now));
        assert!(is_task_due(&task, now + Duration::minutes(5)));

        task.status = TaskStatus::Paused;
        assert!(!is_task_due(&task, now + Duration::hours(1)));
    }

    #[test]
    fn test_recurring_task_due_from_creation() {
        let created = Utc.with_ymd_and_hms(2025, 5, 1, 9, 0, 30).unwrap();
        let mut task = task_of(TaskType::Recurring);
        task.cron_expression = Some("0 * * * *".to_string());
        task.created_at = created;

        assert!(!is_task_due(&task, created + Duration::minutes(10)));
        assert!(is_task_due(&task, Utc.with_ymd_and_hms(2025, 5, 1, 10, 0, 0).unwrap()));

        task.last_run_status = Some(TaskStatus::Completed);
        task.last_execution_time = Some(Utc.with_ymd_and_hms(2025, 5, 1, 10, 0, 0).unwrap());
        assert!(!is_task_due(&task, Utc.with_ymd_and_hms(2025, 5, 1, 10, 30, 0).unwrap()));
        assert!(is_task_due(&task, Utc.with_ymd_and_hms(2025, 5, 1, 11, 0, 1).unwrap()));

        task.status = TaskStatus::Completed;
        assert!(!is_task_due(&task, Utc.with_ymd_and_hms(2025, 5, 1, 12, 0, 1).unwrap()));
    }

    #[test]
    fn test_next_run_at_follows_cron_and_backoff() {
        let created = Utc.with_ymd_and_hms(2025, 5, 1, 9, 0, 30).unwrap();
        let mut task = task_of(TaskType::Recurring);
        task.cron_expression = Some("0 * * * *".to_string());
        task.created_at = created;

        let hour = Utc.with_ymd_and_hms(2025, 5, 1, 10, 0, 0).unwrap();
        assert_eq!(next_run_at(&task, created), Some(hour));
        // 错过的触发点按当前时间算
        let late = hour + Duration::minutes(20);
        assert_eq!(next_run_at(&task, late), Some(late));

        task.retry_count = 1;
        task.scheduled_time = Some(created + Duration::seconds(120));
        assert_eq!(next_run_at(&task, created), task.scheduled_time);

        task.status = TaskStatus::Running;
        assert_eq!(next_run_at(&task, created), None);

        let mut invalid = task_of(TaskType::Recurring);
        invalid.cron_expression = Some("bogus".to_string());
        assert_eq!(next_run_at(&invalid, created), None);
    }

    #[test]
    fn test_recurring_with_invalid_cron_is_skipped() {
        let mut task = task_of(TaskType::Recurring);
        task.cron_expression = Some("bogus".to_string());
        task.created_at = Utc::now() - Duration::days(3);
        assert!(!is_task_due(&task, Utc::now()));
    }

    #[test]
    fn test_retry_waits_for_backoff() {
        let now = Utc::now();
        let mut task = task_of(TaskType::Recurring);
        task.cron_expression = Some("* * * * *".to_string());
        task.retry_count = 1;
        task.scheduled_time = Some(now + Duration::seconds(120));
        task.created_at = now - Duration::days(1);

        assert!(!is_task_due(&task, now));
        assert!(is_task_due(&task, now + Duration::seconds(121)));
    }
}
