//! # Fleet Testing Utils
//!
//! 工作区内共享的测试工具：测试数据构建器、内存后端组合，
//! 以及可以按设备注入写入失败的共享存储包装。
//!
//! ```toml
//! [dev-dependencies]
//! fleet-testing-utils = { path = "../testing-utils" }
//! ```

pub mod builders;
pub mod helpers;
pub mod mocks;

pub use builders::*;
pub use helpers::*;
pub use mocks::*;
