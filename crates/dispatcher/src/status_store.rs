use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use fleet_core::models::InstructionStatusRecord;
use fleet_core::traits::SharedStore;
use fleet_core::{FleetResult, StoreKeys};
use tracing::warn;

/// 指令状态记录和任务指令索引
///
/// 状态记录按指令ID存放，整体覆盖；索引记录任务本轮分发给每台设备的指令ID，
/// 用于取消时定位指令，以及识别上一轮遗留的回报。
#[derive(Clone)]
pub struct ExecutionStatusStore {
    store: Arc<dyn SharedStore>,
    keys: StoreKeys,
    ttl: Duration,
}

impl ExecutionStatusStore {
    pub fn new(store: Arc<dyn SharedStore>, keys: StoreKeys, ttl: Duration) -> Self {
        Self { store, keys, ttl }
    }

    pub fn keys(&self) -> &StoreKeys {
        &self.keys
    }

    pub async fn put(&self, record: &InstructionStatusRecord) -> FleetResult<()> {
        let raw = serde_json::to_string(record)?;
        self.store
            .set_ex(
                &self.keys.instruction_status(&record.instruction_id),
                &raw,
                self.ttl,
            )
            .await
    }

    pub async fn get(&self, instruction_id: &str) -> FleetResult<Option<InstructionStatusRecord>> {
        let Some(raw) = self
            .store
            .get(&self.keys.instruction_status(instruction_id))
            .await?
        else {
            return Ok(None);
        };

        match serde_json::from_str(&raw) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                warn!("指令 {} 的状态记录无法解析: {}", instruction_id, e);
                Ok(None)
            }
        }
    }

    pub async fn index_instruction(
        &self,
        task_id: &str,
        device_code: &str,
        instruction_id: &str,
    ) -> FleetResult<()> {
        let key = self.keys.task_instructions(task_id);
        self.store.hash_set(&key, device_code, instruction_id).await?;
        self.store.expire(&key, self.ttl).await?;
        Ok(())
    }

    /// 设备编码 -> 本轮指令ID
    pub async fn task_instructions(&self, task_id: &str) -> FleetResult<HashMap<String, String>> {
        self.store
            .hash_get_all(&self.keys.task_instructions(task_id))
            .await
    }

    pub async fn reset_task_index(&self, task_id: &str) -> FleetResult<()> {
        self.store
            .delete(&self.keys.task_instructions(task_id))
            .await?;
        Ok(())
    }
}
