//! 领域模型错误定义

use thiserror::Error;

/// 存储层错误
///
/// 内存实现不会产生此错误；外部共享存储（如 Redis）不可用时返回。
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store returned malformed data: {0}")]
    Corrupted(String),
}

impl StoreError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable(message.into())
    }

    pub fn corrupted(message: impl Into<String>) -> Self {
        Self::Corrupted(message.into())
    }
}

/// 存储操作结果类型
pub type StoreResult<T> = Result<T, StoreError>;
