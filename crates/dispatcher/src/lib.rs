//! 任务编排
//!
//! 目标解析、按设备分发指令、汇总执行回报，以及到期扫描和状态切换。

pub mod cron_utils;
pub mod retry_policy;
pub mod scheduler;
pub mod status_store;
pub mod target_resolver;
pub mod task_dispatcher;

pub use cron_utils::{is_due, CronScheduler};
pub use retry_policy::RetryPolicy;
pub use scheduler::{is_task_due, next_run_at, ScanSummary, TaskCancellation, TaskScheduler};
pub use status_store::ExecutionStatusStore;
pub use target_resolver::TaskTargetResolver;
pub use task_dispatcher::{
    is_dispatchable, DispatchOutcome, RecallSummary, ReportOutcome, TaskDispatcher,
};
