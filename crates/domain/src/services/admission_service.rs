//! 准入控制存储接口

use async_trait::async_trait;
use std::time::Duration;

use crate::entities::admission::{Fingerprint, Reservation, StoredResponse};
use crate::errors::StoreError;
use crate::value_objects::{LeaseId, Timestamp};

/// 固定窗口计数存储
///
/// 先计数后比较：被拒绝的请求同样计入当前窗口，窗口只在到期后重置。
#[cfg_attr(feature = "testing", mockall::automock)]
#[async_trait]
pub trait RateWindowStore: Send + Sync {
    /// 对 `key` 的当前窗口计数加一，返回加一后的计数
    async fn hit(&self, key: &str, window: Duration, now: Timestamp) -> Result<u32, StoreError>;

    /// 清理已到期的窗口，返回清理数量
    async fn purge_expired(&self, now: Timestamp) -> Result<usize, StoreError>;
}

/// 幂等记录存储
///
/// `reserve` 对同一 `(scope, key)` 必须是原子的：并发调用中最多一个得到 `Acquired`。
#[cfg_attr(feature = "testing", mockall::automock)]
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// 预留幂等键
    ///
    /// 键不存在、记录已过期，或挂起租约超时时获得执行权。
    async fn reserve(
        &self,
        scope: &str,
        key: &str,
        fingerprint: &Fingerprint,
        now: Timestamp,
        pending_timeout: Duration,
        ttl: Duration,
    ) -> Result<Reservation, StoreError>;

    /// 保存完成的响应
    ///
    /// 只有记录仍处于 `lease` 对应的挂起状态时才写入；租约已被他人接管时返回 `false`。
    async fn complete(
        &self,
        scope: &str,
        key: &str,
        lease: &LeaseId,
        response: StoredResponse,
        now: Timestamp,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    /// 放弃挂起的预留，使键可以被重试；租约不匹配时不做任何事并返回 `false`
    async fn release(&self, scope: &str, key: &str, lease: &LeaseId) -> Result<bool, StoreError>;

    /// 清理已过期的记录，返回清理数量
    async fn purge_expired(&self, now: Timestamp) -> Result<usize, StoreError>;
}
