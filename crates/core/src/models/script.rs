use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 自动化脚本，任务通过 `script_id` 引用
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Script {
    pub id: String,
    pub name: String,
    pub content: String,
    pub version: String,
    /// 执行指令的过期时间（秒），为空时使用队列默认值
    pub timeout_seconds: Option<u64>,
    pub created_at: DateTime<Utc>,
}

impl Script {
    pub fn new(name: &str, content: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            content: content.to_string(),
            version: "1".to_string(),
            timeout_seconds: None,
            created_at: Utc::now(),
        }
    }
}
