//! 设备指令队列
//!
//! 每台设备一个列表，队头为出队端。普通指令追加到队尾，高优先级指令插入队头；
//! 出队是破坏性的，因此每条指令至多交付一次。入队后向设备的唤醒频道发布通知，
//! 正在长轮询的请求收到通知后立即取走指令。

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use fleet_core::models::Instruction;
use fleet_core::traits::SharedStore;
use fleet_core::{FleetResult, StoreKeys};
use futures::StreamExt;
use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

/// 单台设备的排队深度
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueueDepth {
    pub device_code: String,
    pub pending: u64,
}

#[derive(Clone)]
pub struct InstructionQueue {
    store: Arc<dyn SharedStore>,
    keys: StoreKeys,
}

impl InstructionQueue {
    pub fn new(store: Arc<dyn SharedStore>, keys: StoreKeys) -> Self {
        Self { store, keys }
    }

    /// 入队并唤醒该设备的长轮询，返回入队后的队列长度
    #[instrument(skip(self, instruction), fields(instruction_id = %instruction.id))]
    pub async fn enqueue(
        &self,
        device_code: &str,
        instruction: &Instruction,
        high_priority: bool,
    ) -> FleetResult<u64> {
        let key = self.keys.instruction_queue(device_code);
        let raw = serde_json::to_string(instruction)?;

        let len = if high_priority {
            self.store.push_head(&key, &raw).await?
        } else {
            self.store.push_tail(&key, &raw).await?
        };

        counter!(
            "fleet_instructions_enqueued_total",
            "type" => instruction.instruction_type.as_str()
        )
        .increment(1);

        // 通知失败不影响入队结果，设备下一次轮询仍能取到
        if let Err(e) = self
            .store
            .publish(&self.keys.queue_channel(device_code), &instruction.id)
            .await
        {
            warn!("发布设备 {} 的唤醒通知失败: {}", device_code, e);
        }

        debug!(
            "指令 {} ({}) 已入队，设备 {}，高优先级 {}，队列长度 {}",
            instruction.id, instruction.instruction_type, device_code, high_priority, len
        );
        Ok(len)
    }

    /// 取走队列中全部指令，过期的指令直接丢弃
    pub async fn dequeue_all(&self, device_code: &str) -> FleetResult<Vec<Instruction>> {
        self.dequeue_all_at(device_code, Utc::now()).await
    }

    pub async fn dequeue_all_at(
        &self,
        device_code: &str,
        now: DateTime<Utc>,
    ) -> FleetResult<Vec<Instruction>> {
        let key = self.keys.instruction_queue(device_code);
        let mut delivered = Vec::new();
        let mut expired = 0u64;

        while let Some(raw) = self.store.pop_head(&key).await? {
            let instruction = match serde_json::from_str::<Instruction>(&raw) {
                Ok(instruction) => instruction,
                Err(e) => {
                    warn!("丢弃设备 {} 队列中无法解析的指令: {}", device_code, e);
                    continue;
                }
            };

            if instruction.is_expired(now) {
                expired += 1;
                debug!("指令 {} 已过期，丢弃", instruction.id);
                continue;
            }
            delivered.push(instruction);
        }

        if expired > 0 {
            counter!("fleet_instructions_expired_total").increment(expired);
        }
        if !delivered.is_empty() {
            debug!("设备 {} 取走 {} 条指令", device_code, delivered.len());
        }
        Ok(delivered)
    }

    /// 长轮询：队列非空时立即返回，否则等待唤醒通知或超时后再取一次
    ///
    /// 先订阅再读取队列，读取与等待之间入队的指令一定会产生一次唤醒。
    #[instrument(skip(self))]
    pub async fn long_poll(
        &self,
        device_code: &str,
        timeout: Duration,
    ) -> FleetResult<Vec<Instruction>> {
        let mut wake_ups = self
            .store
            .subscribe(&self.keys.queue_channel(device_code))
            .await?;

        let ready = self.dequeue_all(device_code).await?;
        if !ready.is_empty() || timeout.is_zero() {
            return Ok(ready);
        }

        match tokio::time::timeout(timeout, wake_ups.next()).await {
            Ok(Some(_)) => {
                counter!("fleet_long_poll_wakeups_total").increment(1);
                debug!("设备 {} 的长轮询被唤醒", device_code);
            }
            Ok(None) => warn!("设备 {} 的唤醒订阅已断开", device_code),
            Err(_) => debug!("设备 {} 的长轮询超时", device_code),
        }
        drop(wake_ups);

        self.dequeue_all(device_code).await
    }

    /// 只读预览，不移除任何指令
    pub async fn preview(&self, device_code: &str, limit: usize) -> FleetResult<Vec<Instruction>> {
        let raws = self
            .store
            .range(&self.keys.instruction_queue(device_code), 0, limit)
            .await?;

        Ok(raws
            .iter()
            .filter_map(|raw| match serde_json::from_str::<Instruction>(raw) {
                Ok(instruction) => Some(instruction),
                Err(e) => {
                    warn!("预览时跳过无法解析的指令: {}", e);
                    None
                }
            })
            .collect())
    }

    pub async fn len(&self, device_code: &str) -> FleetResult<u64> {
        self.store
            .len(&self.keys.instruction_queue(device_code))
            .await
    }

    /// 清空队列，返回丢弃的条数
    pub async fn clear(&self, device_code: &str) -> FleetResult<u64> {
        let key = self.keys.instruction_queue(device_code);
        let mut removed = 0u64;
        while self.store.pop_head(&key).await?.is_some() {
            removed += 1;
        }
        debug!("已清空设备 {} 的队列，共 {} 条", device_code, removed);
        Ok(removed)
    }

    /// 移除第一条ID匹配的指令
    pub async fn cancel(&self, device_code: &str, instruction_id: &str) -> FleetResult<bool> {
        let key = self.keys.instruction_queue(device_code);
        let len = self.store.len(&key).await?;
        let raws = self.store.range(&key, 0, len as usize).await?;

        let target = raws.into_iter().find(|raw| {
            serde_json::from_str::<Instruction>(raw)
                .map(|instruction| instruction.id == instruction_id)
                .unwrap_or(false)
        });

        let Some(raw) = target else {
            return Ok(false);
        };
        // 扫描之后被取走的指令不会被重复删除
        let removed = self.store.remove_value(&key, &raw, 1).await? > 0;
        if removed {
            debug!("已从设备 {} 的队列移除指令 {}", device_code, instruction_id);
        }
        Ok(removed)
    }

    /// 所有有待交付指令的设备及其队列深度，按深度降序
    pub async fn queue_depths(&self) -> FleetResult<Vec<QueueDepth>> {
        let keys = self
            .store
            .scan_prefix(&self.keys.instruction_queue_prefix())
            .await?;

        let mut depths = Vec::with_capacity(keys.len());
        for key in &keys {
            let Some(device_code) = self.keys.device_from_queue_key(key) else {
                continue;
            };
            let pending = self.store.len(key).await?;
            if pending > 0 {
                depths.push(QueueDepth {
                    device_code: device_code.to_string(),
                    pending,
                });
            }
        }

        depths.sort_by(|a, b| {
            b.pending
                .cmp(&a.pending)
                .then_with(|| a.device_code.cmp(&b.device_code))
        });
        Ok(depths)
    }
}
