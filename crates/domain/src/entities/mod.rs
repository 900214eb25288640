//! 领域实体定义
//!
//! 包含实时核心的实体：身份、令牌、准入记录和连接。

pub mod admission;
pub mod auth;
pub mod user;
pub mod websocket;

pub use admission::*;
pub use auth::*;
pub use user::*;
pub use websocket::*;
