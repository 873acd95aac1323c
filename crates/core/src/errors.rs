use thiserror::Error;

/// 系统错误类型定义
#[derive(Debug, Error)]
pub enum FleetError {
    #[error("认证失败: {0}")]
    Authentication(String),

    #[error("无效的任务目标: {0}")]
    InvalidTarget(String),

    #[error("非法的状态转换: 任务 {task_id} 当前状态 {from} 不允许执行 {action}")]
    InvalidTransition {
        task_id: String,
        from: String,
        action: String,
    },

    #[error("任务未找到: {id}")]
    TaskNotFound { id: String },

    #[error("设备未找到: {code}")]
    DeviceNotFound { code: String },

    #[error("设备分组未找到: {id}")]
    GroupNotFound { id: String },

    #[error("脚本未找到: {id}")]
    ScriptNotFound { id: String },

    #[error("无效的 cron 表达式: {expr} - {message}")]
    InvalidCron { expr: String, message: String },

    #[error("参数校验失败: {0}")]
    Validation(String),

    #[error("共享存储错误: {0}")]
    Store(String),

    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("获取锁超时: {key}")]
    LockTimeout { key: String },

    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("内部错误: {0}")]
    Internal(String),
}

impl FleetError {
    pub fn invalid_transition(
        task_id: impl Into<String>,
        from: impl std::fmt::Display,
        action: impl Into<String>,
    ) -> Self {
        Self::InvalidTransition {
            task_id: task_id.into(),
            from: from.to_string(),
            action: action.into(),
        }
    }

    /// 瞬时错误可以重试，认证和配置类错误永远不自动重试
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Store(_) | Self::LockTimeout { .. })
    }

    pub fn is_authentication(&self) -> bool {
        matches!(self, Self::Authentication(_))
    }
}

/// 统一的Result类型
pub type FleetResult<T> = std::result::Result<T, FleetError>;
