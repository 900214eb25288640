//! 统一配置中心
//!
//! 提供应用的全局配置管理，包括：
//! - JWT 访问令牌与刷新令牌
//! - 限流规则与幂等记录窗口
//! - 实时推送通道
//! - 可选的 Redis 共享存储

use figment::{
    providers::{Env, Format, Json, Serialized, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};

/// 开发环境密钥的标记，生产环境禁止使用
const DEV_SECRET_MARKERS: [&str; 3] = ["dev-secret", "not-for-production", "please-change"];

/// 原系统沿用的扁平环境变量及其在配置树中的位置
const LEGACY_ENV_KEYS: [(&str, &str); 5] = [
    ("JWT_ACCESS_SECRET", "jwt.access_secret"),
    ("JWT_REFRESH_SECRET", "jwt.refresh_secret"),
    ("REFRESH_TOKEN_TTL_DAYS", "jwt.refresh_ttl_days"),
    ("REDIS_URL", "redis.url"),
    ("PORT", "server.port"),
];

/// 全局应用配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// 服务配置
    pub server: ServerConfig,
    /// JWT认证配置
    pub jwt: JwtConfig,
    /// 限流配置
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    /// 幂等配置
    #[serde(default)]
    pub idempotency: IdempotencyConfig,
    /// 实时推送配置
    #[serde(default)]
    pub realtime: RealtimeConfig,
    /// Redis配置
    #[serde(default)]
    pub redis: RedisConfig,
    /// 后台清理配置
    #[serde(default)]
    pub maintenance: MaintenanceConfig,
    /// 身份目录配置
    #[serde(default)]
    pub directory: DirectoryConfig,
}

/// 运行环境
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Development,
    Production,
}

/// 服务器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub environment: Environment,
}

/// JWT配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JwtConfig {
    pub access_secret: String,
    pub refresh_secret: String,
    pub access_ttl_minutes: i64,
    pub refresh_ttl_days: i64,
    pub issuer: String,
}

/// 单个限流规则：窗口内的请求上限
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateRule {
    pub max_requests: u32,
    pub window_seconds: u64,
}

impl RateRule {
    pub const fn new(max_requests: u32, window_seconds: u64) -> Self {
        Self {
            max_requests,
            window_seconds,
        }
    }

    pub fn window(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.window_seconds)
    }
}

/// 各路由类别的限流规则
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// 全部请求，按来源地址计数
    pub general: RateRule,
    /// 登录尝试，按来源地址计数
    pub auth: RateRule,
    /// 已认证请求，按身份计数
    pub authenticated: RateRule,
    /// 内容写入，按身份计数
    pub content: RateRule,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            general: RateRule::new(100, 60),
            auth: RateRule::new(5, 15 * 60),
            authenticated: RateRule::new(500, 60),
            content: RateRule::new(10, 5 * 60),
        }
    }
}

/// 幂等记录配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencyConfig {
    /// 记录保留时长
    pub record_ttl_seconds: u64,
    /// 处理中记录的租约时长，超时后视为已放弃
    pub pending_timeout_seconds: u64,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            record_ttl_seconds: 24 * 60 * 60,
            pending_timeout_seconds: 30,
        }
    }
}

/// 举报事件的推送范围
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ReportAudience {
    /// 推送给所有在线身份
    #[default]
    All,
    /// 只推送给 `role:moderator` 房间
    Moderators,
}

/// 实时推送配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealtimeConfig {
    /// 每个连接的出站缓冲容量
    pub outbound_buffer: usize,
    #[serde(default)]
    pub report_audience: ReportAudience,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            outbound_buffer: 64,
            report_audience: ReportAudience::All,
        }
    }
}

/// Redis配置，未设置时所有存储都在进程内
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RedisConfig {
    pub url: Option<String>,
}

/// 后台清理配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaintenanceConfig {
    pub sweep_interval_seconds: u64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            sweep_interval_seconds: 60,
        }
    }
}

/// 内置身份目录配置
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DirectoryConfig {
    /// YAML 种子文件路径
    pub seed_file: Option<String>,
}

impl Default for AppConfig {
    /// 默认配置使用开发环境版本
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 5000,
                environment: Environment::Development,
            },
            jwt: JwtConfig {
                access_secret: "dev-secret-access-key-not-for-production-use".to_string(),
                refresh_secret: "dev-secret-refresh-key-not-for-production-use".to_string(),
                access_ttl_minutes: 15,
                refresh_ttl_days: 30,
                issuer: "community-hub".to_string(),
            },
            rate_limit: RateLimitConfig::default(),
            idempotency: IdempotencyConfig::default(),
            realtime: RealtimeConfig::default(),
            redis: RedisConfig::default(),
            maintenance: MaintenanceConfig::default(),
            directory: DirectoryConfig::default(),
        }
    }
}

impl AppConfig {
    /// 加载配置，优先级：默认值 -> 配置文件(APP_CONFIG_FILE) -> APP_* 环境变量 -> 原系统环境变量
    pub fn load() -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()));
        if let Ok(path) = std::env::var("APP_CONFIG_FILE") {
            figment = if path.ends_with(".json") {
                figment.merge(Json::file(path))
            } else {
                figment.merge(Yaml::file(path))
            };
        }
        figment = figment
            .merge(Env::prefixed("APP_").split("__"))
            .merge(legacy_env());

        Self::from_figment(figment)
    }

    /// 从给定的 figment 提取并校验配置
    pub fn from_figment(figment: Figment) -> Result<Self, ConfigError> {
        let config: AppConfig = figment
            .extract()
            .map_err(|err| ConfigError::Extract(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// 验证配置有效性
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, secret) in [
            ("access", &self.jwt.access_secret),
            ("refresh", &self.jwt.refresh_secret),
        ] {
            // 至少256位/32字节
            if secret.len() < 32 {
                return Err(ConfigError::InvalidJwtSecret(format!(
                    "{name} secret must be at least 32 characters long"
                )));
            }
            if self.server.environment == Environment::Production
                && DEV_SECRET_MARKERS.iter().any(|marker| secret.contains(marker))
            {
                return Err(ConfigError::InvalidJwtSecret(format!(
                    "cannot use development {name} secret in production"
                )));
            }
        }

        if self.jwt.access_secret == self.jwt.refresh_secret {
            return Err(ConfigError::InvalidJwtSecret(
                "access and refresh secrets must differ".to_string(),
            ));
        }

        if self.jwt.access_ttl_minutes <= 0 || self.jwt.refresh_ttl_days <= 0 {
            return Err(ConfigError::InvalidJwtLifetime);
        }

        for (class, rule) in [
            ("general", self.rate_limit.general),
            ("auth", self.rate_limit.auth),
            ("authenticated", self.rate_limit.authenticated),
            ("content", self.rate_limit.content),
        ] {
            if rule.max_requests == 0 || rule.window_seconds == 0 {
                return Err(ConfigError::InvalidRateRule(class.to_string()));
            }
        }

        if self.idempotency.record_ttl_seconds == 0 || self.idempotency.pending_timeout_seconds == 0
        {
            return Err(ConfigError::InvalidIdempotencyWindow);
        }

        if self.realtime.outbound_buffer == 0 {
            return Err(ConfigError::InvalidRealtimeConfig(
                "outbound buffer must be greater than 0".to_string(),
            ));
        }

        if self.maintenance.sweep_interval_seconds == 0 {
            return Err(ConfigError::InvalidServerConfig(
                "sweep interval must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// 日志用的脱敏表示
    pub fn sanitize(&self) -> String {
        let mut copy = self.clone();
        copy.jwt.access_secret = "[REDACTED]".to_string();
        copy.jwt.refresh_secret = "[REDACTED]".to_string();
        if copy.redis.url.is_some() {
            copy.redis.url = Some("[REDACTED]".to_string());
        }
        format!("{:?}", copy)
    }
}

fn legacy_env() -> Env {
    let names: Vec<&'static str> = LEGACY_ENV_KEYS.iter().map(|(name, _)| *name).collect();
    Env::raw().only(&names).map(|key| {
        LEGACY_ENV_KEYS
            .iter()
            .find(|(name, _)| key.as_str().eq_ignore_ascii_case(name))
            .map(|(_, path)| (*path).into())
            .unwrap_or_else(|| key.as_str().to_owned().into())
    })
}

/// 配置错误类型
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to extract configuration: {0}")]
    Extract(String),
    #[error("Invalid JWT secret: {0}")]
    InvalidJwtSecret(String),
    #[error("Token lifetimes must be greater than 0")]
    InvalidJwtLifetime,
    #[error("Invalid rate limit rule for class {0}: ceiling and window must be greater than 0")]
    InvalidRateRule(String),
    #[error("Idempotency windows must be greater than 0")]
    InvalidIdempotencyWindow,
    #[error("Invalid realtime configuration: {0}")]
    InvalidRealtimeConfig(String),
    #[error("Invalid server configuration: {0}")]
    InvalidServerConfig(String),
}
