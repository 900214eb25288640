//! 社区论坛实时核心的领域模型
//!
//! 包含身份、令牌声明、实时消息信封、准入记录等实体，
//! 以及由基础设施层实现的存储与连接注册接口。

pub mod entities;
pub mod errors;
pub mod services;
pub mod value_objects;

// 重新导出常用类型
pub use entities::*;
pub use errors::*;
pub use services::*;
pub use value_objects::*;
