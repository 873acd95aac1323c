//! 共享存储键名

/// 按命名空间生成共享存储中的键和频道名
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreKeys {
    namespace: String,
}

impl Default for StoreKeys {
    fn default() -> Self {
        Self::new("fleet")
    }
}

impl StoreKeys {
    pub fn new(namespace: &str) -> Self {
        Self {
            namespace: namespace.trim_end_matches(':').to_string(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// 设备指令队列
    pub fn instruction_queue(&self, device_code: &str) -> String {
        format!("{}:queue:{}", self.namespace, device_code)
    }

    pub fn instruction_queue_prefix(&self) -> String {
        format!("{}:queue:", self.namespace)
    }

    /// 从队列键中还原设备编码
    pub fn device_from_queue_key<'a>(&self, key: &'a str) -> Option<&'a str> {
        key.strip_prefix(&self.instruction_queue_prefix())
    }

    /// 长轮询唤醒频道
    pub fn queue_channel(&self, device_code: &str) -> String {
        format!("{}:notify:{}", self.namespace, device_code)
    }

    pub fn presence(&self, device_code: &str) -> String {
        format!("{}:online:{}", self.namespace, device_code)
    }

    pub fn presence_prefix(&self) -> String {
        format!("{}:online:", self.namespace)
    }

    pub fn device_from_presence_key<'a>(&self, key: &'a str) -> Option<&'a str> {
        key.strip_prefix(&self.presence_prefix())
    }

    pub fn device_metrics(&self, device_code: &str) -> String {
        format!("{}:metrics:{}", self.namespace, device_code)
    }

    pub fn instruction_status(&self, instruction_id: &str) -> String {
        format!("{}:instruction:{}", self.namespace, instruction_id)
    }

    /// 任务已分发指令索引：设备编码 -> 指令ID
    pub fn task_instructions(&self, task_id: &str) -> String {
        format!("{}:task:{}:instructions", self.namespace, task_id)
    }

    pub fn dispatch_lock(&self, task_id: &str) -> String {
        format!("{}:lock:dispatch:{}", self.namespace, task_id)
    }

    pub fn report_lock(&self, device_code: &str, instruction_id: &str) -> String {
        format!(
            "{}:lock:report:{}:{}",
            self.namespace, device_code, instruction_id
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_key_round_trip() {
        let keys = StoreKeys::new("fleet:");
        let key = keys.instruction_queue("D1");
        assert_eq!(key, "fleet:queue:D1");
        assert_eq!(keys.device_from_queue_key(&key), Some("D1"));
        assert_eq!(keys.device_from_queue_key("fleet:online:D1"), None);
    }

    #[test]
    fn test_lock_keys_are_distinct() {
        let keys = StoreKeys::default();
        assert_ne!(keys.dispatch_lock("a"), keys.report_lock("a", "b"));
        assert_eq!(keys.report_lock("D1", "i1"), "fleet:lock:report:D1:i1");
    }
}
