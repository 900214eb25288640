use std::sync::Arc;

use config::AppConfig;
use domain::{
    ConnectionRegistry, CredentialVerifier, IdempotencyStore, IdentityDirectory, RateWindowStore,
    TokenRevocationStore,
};
use thiserror::Error;
use tracing::info;

use crate::{
    admission::{InMemoryIdempotencyStore, InMemoryRateWindowStore, RedisRateWindowStore},
    auth::{InMemoryRevocationStore, RedisRevocationStore},
    directory::{DirectoryError, InMemoryIdentityDirectory},
    password::BcryptPasswordHasher,
    websocket::InMemoryConnectionRegistry,
};

#[derive(Debug, Error)]
pub enum InfrastructureError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("directory error: {0}")]
    Directory(#[from] DirectoryError),
}

/// 按配置组装的存储与注册表
#[derive(Clone)]
pub struct Infrastructure {
    pub revocations: Arc<dyn TokenRevocationStore>,
    pub rate_windows: Arc<dyn RateWindowStore>,
    pub idempotency: Arc<dyn IdempotencyStore>,
    pub registry: Arc<dyn ConnectionRegistry>,
    pub directory: Arc<InMemoryIdentityDirectory>,
}

impl Infrastructure {
    /// 全部使用进程内实现
    pub fn in_memory() -> Self {
        let hasher = Arc::new(BcryptPasswordHasher::default());
        Self {
            revocations: Arc::new(InMemoryRevocationStore::new()),
            rate_windows: Arc::new(InMemoryRateWindowStore::new()),
            idempotency: Arc::new(InMemoryIdempotencyStore::new()),
            registry: Arc::new(InMemoryConnectionRegistry::new()),
            directory: Arc::new(InMemoryIdentityDirectory::new(hasher)),
        }
    }

    /// 配置了 Redis 时吊销集合和限流窗口使用 Redis，其余保持进程内
    pub async fn connect(config: &AppConfig) -> Result<Self, InfrastructureError> {
        let mut infrastructure = Self::in_memory();

        if let Some(url) = &config.redis.url {
            let client = redis::Client::open(url.as_str())?;
            let connection = client.get_connection_manager().await?;
            infrastructure.revocations = Arc::new(RedisRevocationStore::new(connection.clone()));
            infrastructure.rate_windows = Arc::new(RedisRateWindowStore::new(connection));
            info!("revocation set and rate windows backed by redis");
        }

        if let Some(seed_file) = &config.directory.seed_file {
            infrastructure.directory.load_seed_file(seed_file).await?;
        }

        Ok(infrastructure)
    }

    pub fn identity_directory(&self) -> Arc<dyn IdentityDirectory> {
        self.directory.clone()
    }

    pub fn credential_verifier(&self) -> Arc<dyn CredentialVerifier> {
        self.directory.clone()
    }
}
