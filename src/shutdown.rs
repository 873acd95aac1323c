use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, info};

/// 停止信号
///
/// 扫描循环持有接收端，状态翻到 `true` 后退出；信号是状态而非事件，晚订阅的一方也能看到。
#[derive(Clone)]
pub struct ShutdownManager {
    stopped: Arc<watch::Sender<bool>>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        let (stopped, _) = watch::channel(false);
        Self {
            stopped: Arc::new(stopped),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.stopped.subscribe()
    }

    /// 触发停止，重复调用无效果
    pub fn shutdown(&self) {
        let changed = self.stopped.send_if_modified(|stopped| !std::mem::replace(stopped, true));
        if changed {
            info!(receivers = self.stopped.receiver_count(), "停止信号已发送");
        } else {
            debug!("停止信号已经发送过");
        }
    }

    pub fn is_shutdown(&self) -> bool {
        *self.stopped.borrow()
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}
