use std::sync::Arc;

use application::{
    Clock, EventFanout, IdempotencyGuard, RateLimiter, SessionService, TokenService,
};
use config::{AppConfig, Environment};
use domain::ConnectionRegistry;
use infrastructure::Infrastructure;

#[derive(Clone)]
pub struct AppState {
    pub sessions: Arc<SessionService>,
    pub tokens: Arc<TokenService>,
    pub rate_limiter: Arc<RateLimiter>,
    pub idempotency: Arc<IdempotencyGuard>,
    pub registry: Arc<dyn ConnectionRegistry>,
    pub fanout: Arc<EventFanout>,
    /// 每个连接的出站缓冲容量
    pub outbound_buffer: usize,
    /// 刷新令牌 Cookie 是否带 `Secure`
    pub secure_cookies: bool,
    pub refresh_ttl_days: i64,
}

impl AppState {
    pub fn new(config: &AppConfig, infrastructure: &Infrastructure, clock: Arc<dyn Clock>) -> Self {
        let tokens = Arc::new(TokenService::new(
            &config.jwt,
            infrastructure.revocations.clone(),
            clock.clone(),
        ));
        let sessions = Arc::new(SessionService::new(
            tokens.clone(),
            infrastructure.credential_verifier(),
            infrastructure.identity_directory(),
        ));
        let rate_limiter = Arc::new(RateLimiter::new(
            config.rate_limit.clone(),
            infrastructure.rate_windows.clone(),
            clock.clone(),
        ));
        let idempotency = Arc::new(IdempotencyGuard::new(
            &config.idempotency,
            infrastructure.idempotency.clone(),
            clock,
        ));
        let fanout = Arc::new(EventFanout::new(
            infrastructure.registry.clone(),
            config.realtime.report_audience,
        ));

        Self {
            sessions,
            tokens,
            rate_limiter,
            idempotency,
            registry: infrastructure.registry.clone(),
            fanout,
            outbound_buffer: config.realtime.outbound_buffer,
            secure_cookies: config.server.environment == Environment::Production,
            refresh_ttl_days: config.jwt.refresh_ttl_days,
        }
    }
}
