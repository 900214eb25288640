//! 幂等键去重
//!
//! 同一作用域（通常是请求主体）下，同一个键只执行一次处理器：
//! 相同指纹的重复请求回放保存的响应，不同指纹返回冲突，
//! 首个请求尚未完成时的重复请求直接拒绝。

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use config::IdempotencyConfig;
use domain::{
    AdmissionError, Fingerprint, IdempotencyStore, LeaseId, Reservation, StoredResponse,
};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::clock::Clock;

/// 已获得执行权的请求凭据
///
/// 携带预留时分配的租约；租约被接管后，凭据的完成和释放都不再生效。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdempotencyTicket {
    scope: String,
    key: String,
    lease: LeaseId,
}

impl IdempotencyTicket {
    pub fn key(&self) -> &str {
        &self.key
    }
}

/// `begin` 的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Execute(IdempotencyTicket),
    Replay(StoredResponse),
}

/// `execute` 的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Executed(StoredResponse),
    Replayed(StoredResponse),
}

impl Outcome {
    pub fn response(&self) -> &StoredResponse {
        match self {
            Outcome::Executed(response) | Outcome::Replayed(response) => response,
        }
    }
}

pub struct IdempotencyGuard {
    store: Arc<dyn IdempotencyStore>,
    clock: Arc<dyn Clock>,
    record_ttl: Duration,
    pending_timeout: Duration,
}

impl IdempotencyGuard {
    pub fn new(
        config: &IdempotencyConfig,
        store: Arc<dyn IdempotencyStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            clock,
            record_ttl: Duration::from_secs(config.record_ttl_seconds),
            pending_timeout: Duration::from_secs(config.pending_timeout_seconds),
        }
    }

    /// 计算请求指纹：各部分带长度前缀后做 SHA-256
    pub fn fingerprint(parts: &[&[u8]]) -> Fingerprint {
        let mut hasher = Sha256::new();
        for part in parts {
            hasher.update((part.len() as u64).to_be_bytes());
            hasher.update(part);
        }
        Fingerprint::new(format!("{:x}", hasher.finalize()))
    }

    pub async fn begin(
        &self,
        scope: &str,
        key: &str,
        fingerprint: &Fingerprint,
    ) -> Result<Admission, AdmissionError> {
        let reservation = self
            .store
            .reserve(
                scope,
                key,
                fingerprint,
                self.clock.now(),
                self.pending_timeout,
                self.record_ttl,
            )
            .await?;

        match reservation {
            Reservation::Acquired(lease) => Ok(Admission::Execute(IdempotencyTicket {
                scope: scope.to_string(),
                key: key.to_string(),
                lease,
            })),
            Reservation::Replay(response) => {
                debug!(scope, key, status = response.status, "replaying stored response");
                Ok(Admission::Replay(response))
            }
            Reservation::Conflict => {
                warn!(scope, key, "idempotency key reused with a different payload");
                Err(AdmissionError::IdempotencyConflict)
            }
            Reservation::InFlight => {
                debug!(scope, key, "duplicate submission while original is in flight");
                Err(AdmissionError::IdempotencyInFlight)
            }
        }
    }

    /// 保存处理结果，之后的重复请求回放它
    pub async fn complete(
        &self,
        ticket: IdempotencyTicket,
        response: StoredResponse,
    ) -> Result<(), AdmissionError> {
        let stored = self
            .store
            .complete(
                &ticket.scope,
                &ticket.key,
                &ticket.lease,
                response,
                self.clock.now(),
                self.record_ttl,
            )
            .await?;
        if !stored {
            warn!(
                scope = %ticket.scope,
                key = %ticket.key,
                "idempotency lease lost, response not recorded"
            );
        }
        Ok(())
    }

    /// 放弃执行权，键可以被立即重试
    pub async fn release(&self, ticket: IdempotencyTicket) -> Result<(), AdmissionError> {
        let released = self
            .store
            .release(&ticket.scope, &ticket.key, &ticket.lease)
            .await?;
        if !released {
            debug!(scope = %ticket.scope, key = %ticket.key, "idempotency lease already reclaimed");
        }
        Ok(())
    }

    /// 在幂等保护下执行处理器
    ///
    /// 状态码 >= 500 的结果不保存，键被释放。
    pub async fn execute<F, Fut>(
        &self,
        scope: &str,
        key: &str,
        fingerprint: &Fingerprint,
        handler: F,
    ) -> Result<Outcome, AdmissionError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = StoredResponse>,
    {
        let ticket = match self.begin(scope, key, fingerprint).await? {
            Admission::Execute(ticket) => ticket,
            Admission::Replay(response) => return Ok(Outcome::Replayed(response)),
        };

        let response = handler().await;
        if response.status >= 500 {
            self.release(ticket).await?;
        } else {
            self.complete(ticket, response.clone()).await?;
        }
        Ok(Outcome::Executed(response))
    }
}
