//! JWT认证相关实体
//!
//! 定义访问令牌、刷新令牌的声明以及认证错误。

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::entities::user::Role;
use crate::errors::StoreError;
use crate::value_objects::{Timestamp, UserId};

/// 访问令牌声明
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AccessClaims {
    /// 主题（用户ID）
    pub sub: String,
    /// 邮箱
    pub email: String,
    /// 角色列表
    pub roles: Vec<Role>,
    /// 签发时间
    pub iat: i64,
    /// 过期时间
    pub exp: i64,
    /// 签发者
    pub iss: String,
}

impl AccessClaims {
    pub fn user_id(&self) -> Result<UserId, AuthError> {
        self.sub.parse().map_err(|_| AuthError::Malformed)
    }
}

/// 刷新令牌声明
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RefreshClaims {
    /// 主题（用户ID）
    pub sub: String,
    /// 令牌唯一标识符，保证同一秒内签发的刷新令牌互不相同
    pub jti: String,
    /// 签发时间
    pub iat: i64,
    /// 过期时间
    pub exp: i64,
    /// 签发者
    pub iss: String,
}

impl RefreshClaims {
    pub fn user_id(&self) -> Result<UserId, AuthError> {
        self.sub.parse().map_err(|_| AuthError::Malformed)
    }
}

/// 已签发的令牌及其过期时间
#[derive(Debug, Clone, PartialEq)]
pub struct IssuedToken {
    pub token: String,
    pub expires_at: Timestamp,
}

/// 令牌对
#[derive(Debug, Clone, PartialEq)]
pub struct TokenPair {
    /// 访问令牌
    pub access: IssuedToken,
    /// 刷新令牌
    pub refresh: IssuedToken,
}

/// 认证错误
///
/// 除 `Store` 外都是当前凭证的终态，调用方需要重新认证或刷新。
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    /// 令牌已过期
    #[error("token expired")]
    Expired,
    /// 令牌格式错误或声明缺失
    #[error("token malformed")]
    Malformed,
    /// 签名验证失败
    #[error("invalid token signature")]
    BadSignature,
    /// 刷新令牌已被撤销
    #[error("token revoked")]
    Revoked,
    /// 凭证无效
    #[error("invalid credentials")]
    InvalidCredentials,
    /// 令牌主体在身份目录中不存在
    #[error("identity not found")]
    UnknownIdentity,
    /// 签名失败
    #[error("token signing failed: {0}")]
    Signing(String),
    /// 吊销集合不可用
    #[error("revocation store error: {0}")]
    Store(#[from] StoreError),
}
