//! 领域服务接口
//!
//! 存储与注册表的抽象，由基础设施层提供内存或 Redis 实现。

pub mod admission_service;
pub mod auth_service;
pub mod websocket_service;

pub use admission_service::*;
pub use auth_service::*;
pub use websocket_service::*;
