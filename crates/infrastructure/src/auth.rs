//! 刷新令牌吊销集合
//!
//! 令牌以 SHA-256 摘要存储，条目保留到令牌自然过期。

use async_trait::async_trait;
use chrono::Utc;
use domain::{StoreError, Timestamp, TokenRevocationStore};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

fn token_digest(token: &str) -> String {
    format!("{:x}", Sha256::digest(token.as_bytes()))
}

/// Redis吊销集合，依赖键过期自动清理
pub struct RedisRevocationStore {
    connection: redis::aio::ConnectionManager,
    key_prefix: String,
}

impl RedisRevocationStore {
    pub fn new(connection: redis::aio::ConnectionManager) -> Self {
        Self {
            connection,
            key_prefix: "revoked_refresh:".to_string(),
        }
    }

    fn revocation_key(&self, token: &str) -> String {
        format!("{}{}", self.key_prefix, token_digest(token))
    }
}

#[async_trait]
impl TokenRevocationStore for RedisRevocationStore {
    async fn revoke(&self, token: &str, expires_at: Timestamp) -> Result<(), StoreError> {
        // Redis 使用自己的时钟计算剩余时间，向上取整避免提前删除
        let remaining = expires_at - Utc::now();
        let ttl = remaining.num_seconds() + i64::from(remaining.subsec_nanos() > 0);
        if ttl <= 0 {
            debug!("token already expired, skipping revocation entry");
            return Ok(());
        }

        let mut conn = self.connection.clone();
        let _: () = redis::cmd("SET")
            .arg(self.revocation_key(token))
            .arg(1)
            .arg("EX")
            .arg(ttl)
            .query_async(&mut conn)
            .await
            .map_err(|e| StoreError::unavailable(format!("failed to record revocation: {e}")))?;
        Ok(())
    }

    async fn is_revoked(&self, token: &str) -> Result<bool, StoreError> {
        let mut conn = self.connection.clone();
        let exists: bool = redis::cmd("EXISTS")
            .arg(self.revocation_key(token))
            .query_async(&mut conn)
            .await
            .map_err(|e| StoreError::unavailable(format!("failed to check revocation: {e}")))?;
        Ok(exists)
    }

    async fn purge_expired(&self, _now: Timestamp) -> Result<usize, StoreError> {
        Ok(0)
    }
}

/// 内存吊销集合
#[derive(Default)]
pub struct InMemoryRevocationStore {
    revoked: Arc<RwLock<HashMap<String, Timestamp>>>,
}

impl InMemoryRevocationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.revoked.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.revoked.read().await.is_empty()
    }
}

#[async_trait]
impl TokenRevocationStore for InMemoryRevocationStore {
    async fn revoke(&self, token: &str, expires_at: Timestamp) -> Result<(), StoreError> {
        let mut revoked = self.revoked.write().await;
        let entry = revoked.entry(token_digest(token)).or_insert(expires_at);
        // 重复吊销只会延长保留时间
        if *entry < expires_at {
            *entry = expires_at;
        }
        Ok(())
    }

    async fn is_revoked(&self, token: &str) -> Result<bool, StoreError> {
        let revoked = self.revoked.read().await;
        Ok(revoked.contains_key(&token_digest(token)))
    }

    async fn purge_expired(&self, now: Timestamp) -> Result<usize, StoreError> {
        let mut revoked = self.revoked.write().await;
        let before = revoked.len();
        revoked.retain(|_, expires_at| *expires_at > now);
        let purged = before - revoked.len();
        if purged > 0 {
            info!(purged, "purged expired revocation entries");
        }
        Ok(purged)
    }
}
