use std::sync::Arc;

use config::{RateLimitConfig, RateRule};
use domain::{AdmissionError, Principal, RateClass, RateDecision, RateWindowStore};
use tracing::warn;

use crate::clock::Clock;

/// 固定窗口限流器
///
/// 每个 (分类, 主体) 组合有独立窗口；计数先加一再与上限比较，
/// 窗口只在到期后重置，与请求本身成功与否无关。
pub struct RateLimiter {
    rules: RateLimitConfig,
    store: Arc<dyn RateWindowStore>,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    pub fn new(
        rules: RateLimitConfig,
        store: Arc<dyn RateWindowStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            rules,
            store,
            clock,
        }
    }

    pub fn rule(&self, class: RateClass) -> RateRule {
        match class {
            RateClass::General => self.rules.general,
            RateClass::Auth => self.rules.auth,
            RateClass::Authenticated => self.rules.authenticated,
            RateClass::Content => self.rules.content,
        }
    }

    /// 记录一次请求并给出判定
    pub async fn evaluate(
        &self,
        class: RateClass,
        principal: &Principal,
    ) -> Result<RateDecision, AdmissionError> {
        let rule = self.rule(class);
        let key = format!("{class}:{principal}");
        let count = self.store.hit(&key, rule.window(), self.clock.now()).await?;

        Ok(RateDecision {
            allowed: count <= rule.max_requests,
            count,
            limit: rule.max_requests,
        })
    }

    /// 超过上限时返回 `RateLimited`
    pub async fn check(&self, class: RateClass, principal: &Principal) -> Result<(), AdmissionError> {
        let decision = self.evaluate(class, principal).await?;
        if decision.allowed {
            Ok(())
        } else {
            warn!(
                class = %class,
                principal = %principal,
                count = decision.count,
                limit = decision.limit,
                "rate limit exceeded"
            );
            Err(AdmissionError::RateLimited { class })
        }
    }
}
