//! # Fleet API
//!
//! 面向设备和运维的服务层。HTTP/RPC 路由不在本 crate 中，接入层把请求解析成
//! [`types`] 中的结构后直接调用这里的服务。
//!
//! - [`DeviceService`]：注册、心跳长轮询、执行结果回报，全部经过签名校验
//! - [`OperatorService`]：任务创建与控制、队列检查、设备在线监控
//! - [`SignatureAuthenticator`]：证书签发与 HMAC-SHA256 签名校验

pub mod auth;
pub mod device_service;
pub mod operator_service;
pub mod types;

pub use auth::{SignatureAuthenticator, SignedFields};
pub use device_service::DeviceService;
pub use operator_service::OperatorService;
pub use types::*;
