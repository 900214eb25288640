//! 准入控制存储实现
//!
//! 限流窗口提供内存与 Redis 两种实现；幂等记录保存在进程内。

use async_trait::async_trait;
use domain::{
    Fingerprint, IdempotencyRecord, IdempotencyStatus, IdempotencyStore, LeaseId,
    RateWindowStore, Reservation, StoreError, StoredResponse, Timestamp,
};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, warn};

fn span(duration: Duration) -> Result<chrono::Duration, StoreError> {
    chrono::Duration::from_std(duration)
        .map_err(|e| StoreError::corrupted(format!("window out of range: {e}")))
}

fn lock_poisoned() -> StoreError {
    StoreError::corrupted("admission state lock poisoned")
}

#[derive(Debug, Clone, Copy)]
struct RateWindow {
    count: u32,
    resets_at: Timestamp,
}

/// 内存固定窗口计数
#[derive(Default)]
pub struct InMemoryRateWindowStore {
    windows: Mutex<HashMap<String, RateWindow>>,
}

impl InMemoryRateWindowStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RateWindowStore for InMemoryRateWindowStore {
    async fn hit(&self, key: &str, window: Duration, now: Timestamp) -> Result<u32, StoreError> {
        let window = span(window)?;
        let mut windows = self.windows.lock().map_err(|_| lock_poisoned())?;
        let entry = windows.entry(key.to_string()).or_insert(RateWindow {
            count: 0,
            resets_at: now + window,
        });
        if now >= entry.resets_at {
            entry.count = 0;
            entry.resets_at = now + window;
        }
        entry.count = entry.count.saturating_add(1);
        Ok(entry.count)
    }

    async fn purge_expired(&self, now: Timestamp) -> Result<usize, StoreError> {
        let mut windows = self.windows.lock().map_err(|_| lock_poisoned())?;
        let before = windows.len();
        windows.retain(|_, window| window.resets_at > now);
        Ok(before - windows.len())
    }
}

/// Redis固定窗口计数
///
/// 窗口首次计数时以 `SET NX PX` 建立键并设置过期时间，随后 `INCR`，两步在同一事务内执行。
pub struct RedisRateWindowStore {
    connection: redis::aio::ConnectionManager,
    key_prefix: String,
}

impl RedisRateWindowStore {
    pub fn new(connection: redis::aio::ConnectionManager) -> Self {
        Self {
            connection,
            key_prefix: "rate:".to_string(),
        }
    }
}

#[async_trait]
impl RateWindowStore for RedisRateWindowStore {
    async fn hit(&self, key: &str, window: Duration, _now: Timestamp) -> Result<u32, StoreError> {
        let key = format!("{}{}", self.key_prefix, key);
        let window_ms = u64::try_from(window.as_millis()).unwrap_or(u64::MAX).max(1);

        let mut conn = self.connection.clone();
        let (count,): (u32,) = redis::pipe()
            .atomic()
            .cmd("SET")
            .arg(&key)
            .arg(0)
            .arg("PX")
            .arg(window_ms)
            .arg("NX")
            .ignore()
            .cmd("INCR")
            .arg(&key)
            .query_async(&mut conn)
            .await
            .map_err(|e| StoreError::unavailable(format!("rate window update failed: {e}")))?;
        Ok(count)
    }

    async fn purge_expired(&self, _now: Timestamp) -> Result<usize, StoreError> {
        Ok(0)
    }
}

fn holds_lease(record: &IdempotencyRecord, lease: &LeaseId) -> bool {
    matches!(&record.status, IdempotencyStatus::Pending { lease: current, .. } if current == lease)
}

/// 内存幂等记录
///
/// 所有状态转换在同一把锁内完成，保证同一键的并发预留最多一个成功。
#[derive(Default)]
pub struct InMemoryIdempotencyStore {
    records: Mutex<HashMap<(String, String), IdempotencyRecord>>,
}

impl InMemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|records| records.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn reserve(
        &self,
        scope: &str,
        key: &str,
        fingerprint: &Fingerprint,
        now: Timestamp,
        pending_timeout: Duration,
        ttl: Duration,
    ) -> Result<Reservation, StoreError> {
        let pending_timeout = span(pending_timeout)?;
        let ttl = span(ttl)?;
        let mut records = self.records.lock().map_err(|_| lock_poisoned())?;
        let record_key = (scope.to_string(), key.to_string());

        if let Some(existing) = records.get(&record_key) {
            let abandoned = matches!(
                existing.status,
                IdempotencyStatus::Pending { lease_expires_at, .. } if now >= lease_expires_at
            );
            if now < existing.expires_at && !abandoned {
                if existing.fingerprint != *fingerprint {
                    return Ok(Reservation::Conflict);
                }
                return Ok(match &existing.status {
                    IdempotencyStatus::Completed(response) => Reservation::Replay(response.clone()),
                    IdempotencyStatus::Pending { .. } => Reservation::InFlight,
                });
            }
            if abandoned {
                debug!(scope, key, "reclaiming abandoned idempotency key");
            }
        }

        let lease = LeaseId::random();
        records.insert(
            record_key,
            IdempotencyRecord {
                key: key.to_string(),
                fingerprint: fingerprint.clone(),
                status: IdempotencyStatus::Pending {
                    lease,
                    lease_expires_at: now + pending_timeout,
                },
                created_at: now,
                expires_at: now + ttl,
            },
        );
        Ok(Reservation::Acquired(lease))
    }

    async fn complete(
        &self,
        scope: &str,
        key: &str,
        lease: &LeaseId,
        response: StoredResponse,
        now: Timestamp,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let ttl = span(ttl)?;
        let mut records = self.records.lock().map_err(|_| lock_poisoned())?;
        match records.get_mut(&(scope.to_string(), key.to_string())) {
            Some(record) if holds_lease(record, lease) => {
                record.status = IdempotencyStatus::Completed(response);
                record.expires_at = now + ttl;
                Ok(true)
            }
            Some(_) => {
                warn!(scope, key, "idempotency lease was reclaimed before completion");
                Ok(false)
            }
            None => {
                debug!(scope, key, "idempotency record vanished before completion");
                Ok(false)
            }
        }
    }

    async fn release(&self, scope: &str, key: &str, lease: &LeaseId) -> Result<bool, StoreError> {
        let mut records = self.records.lock().map_err(|_| lock_poisoned())?;
        let record_key = (scope.to_string(), key.to_string());
        if records
            .get(&record_key)
            .is_some_and(|record| holds_lease(record, lease))
        {
            records.remove(&record_key);
            return Ok(true);
        }
        Ok(false)
    }

    async fn purge_expired(&self, now: Timestamp) -> Result<usize, StoreError> {
        let mut records = self.records.lock().map_err(|_| lock_poisoned())?;
        let before = records.len();
        records.retain(|_, record| {
            let abandoned = matches!(
                record.status,
                IdempotencyStatus::Pending { lease_expires_at, .. } if now >= lease_expires_at
            );
            now < record.expires_at && !abandoned
        });
        Ok(before - records.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    const LEASE: Duration = Duration::from_secs(30);
    const TTL: Duration = Duration::from_secs(3600);

    fn response(status: u16) -> StoredResponse {
        StoredResponse {
            status,
            content_type: None,
            body: b"{}".to_vec(),
        }
    }

    #[tokio::test]
    async fn test_rate_window_counts_then_resets() {
        let store = InMemoryRateWindowStore::new();
        let now = Utc::now();
        let window = Duration::from_secs(60);

        assert_eq!(store.hit("k", window, now).await.unwrap(), 1);
        assert_eq!(store.hit("k", window, now).await.unwrap(), 2);
        assert_eq!(store.hit("other", window, now).await.unwrap(), 1);

        let later = now + chrono::Duration::seconds(60);
        assert_eq!(store.hit("k", window, later).await.unwrap(), 1);
        assert_eq!(store.purge_expired(later).await.unwrap(), 1);
    }

    fn lease(reservation: Reservation) -> LeaseId {
        match reservation {
            Reservation::Acquired(lease) => lease,
            other => panic!("expected acquired reservation, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_reservation_lifecycle() {
        let store = InMemoryIdempotencyStore::new();
        let now = Utc::now();
        let fp = Fingerprint::new("fp-1");

        let owner = lease(store.reserve("s", "k", &fp, now, LEASE, TTL).await.unwrap());
        assert_eq!(
            store.reserve("s", "k", &fp, now, LEASE, TTL).await.unwrap(),
            Reservation::InFlight
        );
        assert_eq!(
            store
                .reserve("s", "k", &Fingerprint::new("fp-2"), now, LEASE, TTL)
                .await
                .unwrap(),
            Reservation::Conflict
        );

        assert!(store
            .complete("s", "k", &owner, response(201), now, TTL)
            .await
            .unwrap());
        assert_eq!(
            store.reserve("s", "k", &fp, now, LEASE, TTL).await.unwrap(),
            Reservation::Replay(response(201))
        );

        // 记录过期后键可以重新使用
        let expired = now + chrono::Duration::seconds(3600);
        assert!(matches!(
            store.reserve("s", "k", &fp, expired, LEASE, TTL).await.unwrap(),
            Reservation::Acquired(_)
        ));
    }

    #[tokio::test]
    async fn test_release_only_removes_own_pending() {
        let store = InMemoryIdempotencyStore::new();
        let now = Utc::now();
        let fp = Fingerprint::new("fp");

        let pending = lease(store.reserve("s", "pending", &fp, now, LEASE, TTL).await.unwrap());
        assert!(!store.release("s", "pending", &LeaseId::random()).await.unwrap());
        assert_eq!(store.len(), 1);
        assert!(store.release("s", "pending", &pending).await.unwrap());
        assert!(store.is_empty());

        let done = lease(store.reserve("s", "done", &fp, now, LEASE, TTL).await.unwrap());
        store
            .complete("s", "done", &done, response(200), now, TTL)
            .await
            .unwrap();
        assert!(!store.release("s", "done", &done).await.unwrap());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_reclaimed_lease_ignores_previous_owner() {
        let store = InMemoryIdempotencyStore::new();
        let now = Utc::now();
        let first = lease(
            store
                .reserve("s", "k", &Fingerprint::new("fp-1"), now, LEASE, TTL)
                .await
                .unwrap(),
        );

        let later = now + chrono::Duration::seconds(30);
        let fp2 = Fingerprint::new("fp-2");
        let second = lease(store.reserve("s", "k", &fp2, later, LEASE, TTL).await.unwrap());
        assert_ne!(first, second);

        assert!(!store
            .complete("s", "k", &first, response(201), later, TTL)
            .await
            .unwrap());
        assert!(!store.release("s", "k", &first).await.unwrap());
        assert_eq!(
            store.reserve("s", "k", &fp2, later, LEASE, TTL).await.unwrap(),
            Reservation::InFlight
        );

        assert!(store
            .complete("s", "k", &second, response(202), later, TTL)
            .await
            .unwrap());
        assert_eq!(
            store.reserve("s", "k", &fp2, later, LEASE, TTL).await.unwrap(),
            Reservation::Replay(response(202))
        );
    }

    #[tokio::test]
    async fn test_concurrent_reservations_acquire_once() {
        let store = std::sync::Arc::new(InMemoryIdempotencyStore::new());
        let now = Utc::now();
        let mut tasks = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                store
                    .reserve("s", "k", &Fingerprint::new("fp"), now, LEASE, TTL)
                    .await
                    .unwrap()
            }));
        }

        let mut acquired = 0;
        for task in tasks {
            if matches!(task.await.unwrap(), Reservation::Acquired(_)) {
                acquired += 1;
            }
        }
        assert_eq!(acquired, 1);
    }
}
