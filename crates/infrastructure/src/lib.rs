//! 基础设施层实现。
//!
//! 提供吊销集合、限流窗口、幂等记录的内存与 Redis 存储，
//! 内存连接注册表、bcrypt 密码哈希以及内存身份目录。

pub mod admission;
pub mod auth;
pub mod builder;
pub mod directory;
pub mod password;
pub mod websocket;

pub use admission::{InMemoryIdempotencyStore, InMemoryRateWindowStore, RedisRateWindowStore};
pub use auth::{InMemoryRevocationStore, RedisRevocationStore};
pub use builder::{Infrastructure, InfrastructureError};
pub use directory::{DirectoryError, InMemoryIdentityDirectory, SeedIdentity};
pub use password::BcryptPasswordHasher;
pub use websocket::InMemoryConnectionRegistry;
