use std::collections::HashMap;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;

use crate::FleetResult;

/// 订阅返回的消息流，流结束表示订阅已断开
pub type MessageStream = Pin<Box<dyn Stream<Item = String> + Send>>;

/// 共享存储抽象接口
///
/// 跨进程协调的唯一通道：列表（队头/队尾推入、队头弹出）、带TTL的标量、
/// 哈希、键扫描和发布订阅。每个方法都是对存储的一次原子操作，
/// 调用方不需要额外的进程内锁。
///
/// 列表的"队头"是出队端：`push_head` 插入的元素最先被 `pop_head` 取出。
#[async_trait]
pub trait SharedStore: Send + Sync {
    /// 追加到队尾，返回列表长度
    async fn push_tail(&self, key: &str, value: &str) -> FleetResult<u64>;

    /// 插入到队头，返回列表长度
    async fn push_head(&self, key: &str, value: &str) -> FleetResult<u64>;

    /// 从队头弹出一个元素
    async fn pop_head(&self, key: &str) -> FleetResult<Option<String>>;

    /// 从队头开始读取至多 `count` 个元素，不修改列表
    async fn range(&self, key: &str, start: usize, count: usize) -> FleetResult<Vec<String>>;

    /// 列表长度
    async fn len(&self, key: &str) -> FleetResult<u64>;

    /// 从队头开始删除至多 `count` 个等于 `value` 的元素，返回删除数量
    async fn remove_value(&self, key: &str, value: &str, count: usize) -> FleetResult<u64>;

    async fn set(&self, key: &str, value: &str) -> FleetResult<()>;

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> FleetResult<()>;

    async fn get(&self, key: &str) -> FleetResult<Option<String>>;

    /// 仅当键不存在时写入，成功返回 true
    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> FleetResult<bool>;

    /// 删除键（任意类型），返回键是否存在
    async fn delete(&self, key: &str) -> FleetResult<bool>;

    /// 仅当当前值等于 `expected` 时删除
    async fn delete_if_equals(&self, key: &str, expected: &str) -> FleetResult<bool>;

    async fn exists(&self, key: &str) -> FleetResult<bool>;

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> FleetResult<()>;

    async fn hash_set_all(&self, key: &str, entries: &[(String, String)]) -> FleetResult<()>;

    async fn hash_get_all(&self, key: &str) -> FleetResult<HashMap<String, String>>;

    /// 为已有的键设置过期时间，键不存在返回 false
    async fn expire(&self, key: &str, ttl: Duration) -> FleetResult<bool>;

    /// 扫描以 `prefix` 开头的全部键
    async fn scan_prefix(&self, prefix: &str) -> FleetResult<Vec<String>>;

    /// 发布消息，返回收到消息的订阅者数量
    async fn publish(&self, channel: &str, message: &str) -> FleetResult<u64>;

    /// 订阅频道；返回时订阅已经生效
    async fn subscribe(&self, channel: &str) -> FleetResult<MessageStream>;
}
