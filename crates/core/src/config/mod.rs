//! 配置管理
//!
//! 配置按关注点拆分为多个段（共享存储、指令队列、在线状态、认证、重试、
//! 调度、可观测性），由 [`AppConfig::load`] 按"默认值 → TOML 文件 →
//! `FLEET_` 前缀环境变量"的顺序合并并校验。

pub mod models;

pub use models::*;
