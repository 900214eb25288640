//! 准入控制实体
//!
//! 限流分类、请求主体、幂等记录与预留结果。

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use thiserror::Error;

use crate::errors::StoreError;
use crate::value_objects::{LeaseId, Timestamp, UserId};

/// 限流分类，每类有独立的配额和窗口
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RateClass {
    /// 所有请求
    General,
    /// 登录、刷新等认证端点
    Auth,
    /// 携带有效访问令牌的请求
    Authenticated,
    /// 发帖、评论等内容创建
    Content,
}

impl RateClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            RateClass::General => "general",
            RateClass::Auth => "auth",
            RateClass::Authenticated => "authenticated",
            RateClass::Content => "content",
        }
    }
}

impl fmt::Display for RateClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 限流计数的主体：已认证用户，或者来源地址
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Principal {
    User(UserId),
    Address(IpAddr),
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Principal::User(id) => write!(f, "user:{id}"),
            Principal::Address(ip) => write!(f, "ip:{ip}"),
        }
    }
}

/// 单次限流判定
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    /// 当前窗口内已计数的请求数（含本次）
    pub count: u32,
    pub limit: u32,
}

impl RateDecision {
    pub fn remaining(&self) -> u32 {
        self.limit.saturating_sub(self.count)
    }
}

/// 请求指纹，用于判定同一幂等键下请求是否相同
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// 已完成请求的响应，重复请求时原样回放
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

/// 幂等记录状态
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdempotencyStatus {
    /// 首个请求仍在执行；只有持有 `lease` 的请求能完成或释放它
    Pending {
        lease: LeaseId,
        lease_expires_at: Timestamp,
    },
    /// 已完成，保存的响应可回放
    Completed(StoredResponse),
}

/// 幂等记录
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdempotencyRecord {
    pub key: String,
    pub fingerprint: Fingerprint,
    pub status: IdempotencyStatus,
    pub created_at: Timestamp,
    /// 记录整体过期时间，过期后键可被重新使用
    pub expires_at: Timestamp,
}

/// 预留幂等键的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reservation {
    /// 本请求获得执行权，完成或释放时需出示租约
    Acquired(LeaseId),
    /// 相同请求已完成，回放保存的响应
    Replay(StoredResponse),
    /// 相同键但请求不同
    Conflict,
    /// 相同请求仍在执行
    InFlight,
}

/// 准入错误
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdmissionError {
    #[error("rate limit exceeded for {class} requests")]
    RateLimited { class: RateClass },

    #[error("idempotency key reused with a different request")]
    IdempotencyConflict,

    #[error("a request with this idempotency key is still in progress")]
    IdempotencyInFlight,

    #[error("admission store error: {0}")]
    Store(#[from] StoreError),
}
