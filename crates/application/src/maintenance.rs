use std::sync::Arc;
use std::time::Duration;

use domain::{IdempotencyStore, RateWindowStore, TokenRevocationStore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clock::Clock;

/// 一次清理的结果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub revocations: usize,
    pub rate_windows: usize,
    pub idempotency_records: usize,
}

impl SweepReport {
    pub fn total(&self) -> usize {
        self.revocations + self.rate_windows + self.idempotency_records
    }
}

/// 后台清理过期的吊销条目、限流窗口与幂等记录
///
/// 读路径本身会惰性判断过期，这里只负责回收内存。
pub struct MaintenanceSweeper {
    revocations: Arc<dyn TokenRevocationStore>,
    rate_windows: Arc<dyn RateWindowStore>,
    idempotency: Arc<dyn IdempotencyStore>,
    clock: Arc<dyn Clock>,
}

impl MaintenanceSweeper {
    pub fn new(
        revocations: Arc<dyn TokenRevocationStore>,
        rate_windows: Arc<dyn RateWindowStore>,
        idempotency: Arc<dyn IdempotencyStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            revocations,
            rate_windows,
            idempotency,
            clock,
        }
    }

    /// 执行一次清理；单个存储失败只记录日志，不影响其它存储
    pub async fn sweep_once(&self) -> SweepReport {
        let now = self.clock.now();
        let mut report = SweepReport::default();

        match self.revocations.purge_expired(now).await {
            Ok(count) => report.revocations = count,
            Err(err) => warn!(error = %err, "failed to purge revocation entries"),
        }
        match self.rate_windows.purge_expired(now).await {
            Ok(count) => report.rate_windows = count,
            Err(err) => warn!(error = %err, "failed to purge rate windows"),
        }
        match self.idempotency.purge_expired(now).await {
            Ok(count) => report.idempotency_records = count,
            Err(err) => warn!(error = %err, "failed to purge idempotency records"),
        }

        if report.total() > 0 {
            info!(
                revocations = report.revocations,
                rate_windows = report.rate_windows,
                idempotency_records = report.idempotency_records,
                "maintenance sweep completed"
            );
        } else {
            debug!("maintenance sweep found nothing to purge");
        }
        report
    }

    /// 按固定间隔运行，直到 `shutdown` 被取消
    pub fn spawn(self: Arc<Self>, interval: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // interval 的第一次 tick 立即返回
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!("maintenance sweeper stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        self.sweep_once().await;
                    }
                }
            }
        })
    }
}
