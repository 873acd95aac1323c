//! # 数据模型
//!
//! 设备集群调度的核心数据结构：下发给设备的指令、编排任务、设备与分组、
//! 脚本以及设备回报的执行记录。所有模型都实现了 serde 序列化，
//! 以便写入共享存储或经由外部接口传输。

pub mod device;
pub mod execution;
pub mod instruction;
pub mod script;
pub mod task;

pub use device::*;
pub use execution::*;
pub use instruction::*;
pub use script::*;
pub use task::*;

/// 设备上报的临时指标（cpu、内存、电量等）
pub type MetricMap = serde_json::Map<String, serde_json::Value>;
