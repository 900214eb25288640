//! 认证相关接口
//!
//! 吊销集合、身份目录、凭证校验与密码哈希，均由基础设施层实现。

use async_trait::async_trait;
use thiserror::Error;

use crate::entities::auth::AuthError;
use crate::entities::user::{Identity, PasswordHash};
use crate::errors::StoreError;
use crate::value_objects::{Timestamp, UserId};

/// 刷新令牌吊销集合
///
/// 条目只需保留到令牌自身过期，之后令牌因过期而被拒绝。
#[cfg_attr(feature = "testing", mockall::automock)]
#[async_trait]
pub trait TokenRevocationStore: Send + Sync {
    /// 吊销令牌，重复吊销是幂等的
    async fn revoke(&self, token: &str, expires_at: Timestamp) -> Result<(), StoreError>;

    /// 令牌是否已被吊销
    async fn is_revoked(&self, token: &str) -> Result<bool, StoreError>;

    /// 清理已过期的条目，返回清理数量
    async fn purge_expired(&self, now: Timestamp) -> Result<usize, StoreError>;
}

/// 身份目录，只读
#[cfg_attr(feature = "testing", mockall::automock)]
#[async_trait]
pub trait IdentityDirectory: Send + Sync {
    async fn find(&self, user_id: UserId) -> Result<Option<Identity>, StoreError>;
}

/// 登录凭证校验
#[cfg_attr(feature = "testing", mockall::automock)]
#[async_trait]
pub trait CredentialVerifier: Send + Sync {
    /// 校验邮箱和密码，成功返回身份
    async fn verify(&self, email: &str, password: &str) -> Result<Identity, AuthError>;
}

#[derive(Debug, Error)]
pub enum PasswordHasherError {
    #[error("hash error: {0}")]
    Hash(String),
    #[error("verify error: {0}")]
    Verify(String),
}

impl PasswordHasherError {
    pub fn hash_error(message: impl Into<String>) -> Self {
        Self::Hash(message.into())
    }

    pub fn verify_error(message: impl Into<String>) -> Self {
        Self::Verify(message.into())
    }
}

#[cfg_attr(feature = "testing", mockall::automock)]
#[async_trait]
pub trait PasswordHasher: Send + Sync {
    async fn hash(&self, plaintext: &str) -> Result<PasswordHash, PasswordHasherError>;
    async fn verify(
        &self,
        plaintext: &str,
        hashed: &PasswordHash,
    ) -> Result<bool, PasswordHasherError>;
}
