use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use fleet_api::{DeviceService, OperatorService, SignatureAuthenticator};
use fleet_core::traits::ScriptRepository;
use fleet_core::{AppConfig, StoreKeys};
use fleet_dispatcher::{
    ExecutionStatusStore, RetryPolicy, ScanSummary, TaskDispatcher, TaskScheduler,
    TaskTargetResolver,
};
use fleet_infrastructure::{
    DistributedLock, InMemoryDeviceDirectory, InMemoryScriptRepository, InMemoryTaskRepository,
    InstructionQueue, PresenceTracker, SharedStoreFactory,
};
use tokio::sync::watch;
use tracing::{error, info};

/// 组装好的服务集合
///
/// 设备、脚本和任务记录使用进程内存储；指令队列、在线状态和锁走配置的共享存储。
pub struct FleetApplication {
    config: AppConfig,
    scheduler: Arc<TaskScheduler>,
    scripts: Arc<InMemoryScriptRepository>,
    devices: Arc<DeviceService>,
    operator: Arc<OperatorService>,
}

impl FleetApplication {
    pub async fn new(config: AppConfig) -> Result<Self> {
        info!("初始化应用，共享存储后端: {:?}", config.store.backend);

        let store = SharedStoreFactory::create(&config.store)
            .await
            .context("创建共享存储失败")?;
        let keys = StoreKeys::new(&config.store.key_prefix);

        let directory = Arc::new(InMemoryDeviceDirectory::new());
        let tasks = Arc::new(InMemoryTaskRepository::new());
        let scripts = Arc::new(InMemoryScriptRepository::new());

        let queue = InstructionQueue::new(store.clone(), keys.clone());
        let presence = PresenceTracker::new(store.clone(), keys.clone(), config.presence.clone());
        let lock = DistributedLock::from_config(store.clone(), &config.scheduler);
        let statuses = ExecutionStatusStore::new(
            store,
            keys,
            Duration::from_secs(config.queue.status_ttl_seconds),
        );

        let resolver = TaskTargetResolver::new(directory.clone());
        let dispatcher = Arc::new(
            TaskDispatcher::new(
                tasks.clone(),
                scripts.clone(),
                resolver.clone(),
                queue.clone(),
                statuses,
                lock,
            )
            .with_retry_policy(RetryPolicy::new(config.retry.clone()))
            .with_queue_config(config.queue.clone()),
        );
        let scheduler = Arc::new(TaskScheduler::new(
            tasks,
            scripts.clone(),
            resolver,
            dispatcher.clone(),
        ));

        let devices = Arc::new(DeviceService::new(
            directory.clone(),
            SignatureAuthenticator::new(&config.auth),
            presence.clone(),
            queue.clone(),
            dispatcher,
            config.queue.clone(),
        ));
        let operator = Arc::new(OperatorService::new(
            scheduler.clone(),
            directory,
            queue,
            presence,
            config.queue.clone(),
        ));

        Ok(Self {
            config,
            scheduler,
            scripts,
            devices,
            operator,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn scripts(&self) -> Arc<dyn ScriptRepository> {
        self.scripts.clone()
    }

    pub fn devices(&self) -> Arc<DeviceService> {
        self.devices.clone()
    }

    pub fn operator(&self) -> Arc<OperatorService> {
        self.operator.clone()
    }

    pub async fn scan_once(&self) -> Result<ScanSummary> {
        self.scheduler
            .scan_due_tasks()
            .await
            .context("到期任务扫描失败")
    }

    /// 按配置的间隔循环扫描到期任务，直到收到关闭信号
    pub async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) -> Result<()> {
        let mut interval = tokio::time::interval(self.config.scheduler.scan_interval());
        info!(
            "启动到期任务扫描，间隔 {} 秒",
            self.config.scheduler.scan_interval_seconds
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.scheduler.scan_due_tasks().await {
                        Ok(summary) if summary.examined > 0 => {
                            info!(
                                examined = summary.examined,
                                dispatched = summary.dispatched(),
                                errors = summary.errors,
                                "到期任务扫描完成"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => error!("到期任务扫描失败: {}", e),
                    }
                }
                _ = async { shutdown_rx.wait_for(|stopped| *stopped).await.map(|_| ()) } => {
                    info!("扫描循环收到关闭信号");
                    break;
                }
            }
        }

        Ok(())
    }
}
