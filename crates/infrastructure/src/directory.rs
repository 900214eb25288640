//! 内存身份目录
//!
//! 真实部署中身份由外部用户存储维护；这里提供可从 YAML 种子文件加载的进程内实现，
//! 同时承担邮箱密码登录的凭证校验。

use async_trait::async_trait;
use domain::{
    AuthError, CommunityId, CredentialVerifier, Identity, IdentityDirectory, PasswordHash,
    PasswordHasher, PasswordHasherError, Role, StoreError, UserId,
};
use serde::Deserialize;
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{OnceCell, RwLock};
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("failed to read seed file {path}: {message}")]
    Io { path: String, message: String },
    #[error("invalid seed file {path}: {message}")]
    Parse { path: String, message: String },
    #[error("seed entry {email} has neither password nor password_hash")]
    MissingCredential { email: String },
    #[error(transparent)]
    Hash(#[from] PasswordHasherError),
}

/// 种子文件中的一条身份
#[derive(Debug, Clone, Deserialize)]
pub struct SeedIdentity {
    #[serde(default)]
    pub id: Option<UserId>,
    pub email: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub password_hash: Option<String>,
    #[serde(default)]
    pub roles: BTreeSet<Role>,
    #[serde(default)]
    pub communities: BTreeSet<CommunityId>,
}

struct DirectoryEntry {
    identity: Identity,
    password_hash: PasswordHash,
}

#[derive(Default)]
struct DirectoryState {
    entries: HashMap<UserId, DirectoryEntry>,
    by_email: HashMap<String, UserId>,
}

/// 未知邮箱登录时用于比对的占位明文
const DUMMY_PASSWORD: &str = "community-hub-unknown-account";

pub struct InMemoryIdentityDirectory {
    state: RwLock<DirectoryState>,
    hasher: Arc<dyn PasswordHasher>,
    /// 未知邮箱同样走一次哈希比对，响应时间不暴露邮箱是否存在
    dummy_hash: OnceCell<PasswordHash>,
}

impl InMemoryIdentityDirectory {
    pub fn new(hasher: Arc<dyn PasswordHasher>) -> Self {
        Self {
            state: RwLock::new(DirectoryState::default()),
            hasher,
            dummy_hash: OnceCell::new(),
        }
    }

    /// 写入身份与已哈希的密码，同一用户ID会被覆盖
    pub async fn insert(&self, identity: Identity, password_hash: PasswordHash) {
        let mut state = self.state.write().await;
        let email = identity.email.to_lowercase();
        if let Some(previous) = state.entries.get(&identity.user_id) {
            let previous_email = previous.identity.email.to_lowercase();
            state.by_email.remove(&previous_email);
        }
        state.by_email.insert(email, identity.user_id);
        state.entries.insert(
            identity.user_id,
            DirectoryEntry {
                identity,
                password_hash,
            },
        );
    }

    /// 用明文密码写入身份
    pub async fn register(&self, identity: Identity, password: &str) -> Result<(), DirectoryError> {
        let password_hash = self.hasher.hash(password).await?;
        self.insert(identity, password_hash).await;
        Ok(())
    }

    /// 从 YAML 种子文件加载身份列表，返回加载数量
    pub async fn load_seed_file(&self, path: impl AsRef<Path>) -> Result<usize, DirectoryError> {
        let path = path.as_ref();
        let shown = path.display().to_string();
        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| DirectoryError::Io {
                path: shown.clone(),
                message: e.to_string(),
            })?;
        let seeds: Vec<SeedIdentity> =
            serde_yaml::from_str(&contents).map_err(|e| DirectoryError::Parse {
                path: shown.clone(),
                message: e.to_string(),
            })?;

        let count = seeds.len();
        for seed in seeds {
            self.load_seed(seed).await?;
        }
        info!(path = %shown, identities = count, "identity directory seeded");
        Ok(count)
    }

    pub async fn load_seed(&self, seed: SeedIdentity) -> Result<UserId, DirectoryError> {
        let mut identity = Identity::new(seed.id.unwrap_or_else(UserId::random), seed.email);
        identity.roles = seed.roles;
        identity.communities = seed.communities;
        let user_id = identity.user_id;

        match (seed.password_hash, seed.password) {
            (Some(hash), _) => self.insert(identity, PasswordHash::new(hash)).await,
            (None, Some(password)) => self.register(identity, &password).await?,
            (None, None) => {
                return Err(DirectoryError::MissingCredential {
                    email: identity.email,
                })
            }
        }
        Ok(user_id)
    }

    async fn burn_verification(&self, password: &str) {
        let dummy = self
            .dummy_hash
            .get_or_try_init(|| self.hasher.hash(DUMMY_PASSWORD))
            .await;
        match dummy {
            Ok(hash) => {
                let _ = self.hasher.verify(password, hash).await;
            }
            Err(err) => warn!(error = %err, "failed to prepare placeholder password hash"),
        }
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl IdentityDirectory for InMemoryIdentityDirectory {
    async fn find(&self, user_id: UserId) -> Result<Option<Identity>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .entries
            .get(&user_id)
            .map(|entry| entry.identity.clone()))
    }
}

#[async_trait]
impl CredentialVerifier for InMemoryIdentityDirectory {
    async fn verify(&self, email: &str, password: &str) -> Result<Identity, AuthError> {
        let found = {
            let state = self.state.read().await;
            state
                .by_email
                .get(&email.to_lowercase())
                .and_then(|user_id| state.entries.get(user_id))
                .map(|entry| (entry.identity.clone(), entry.password_hash.clone()))
        };
        let Some((identity, password_hash)) = found else {
            self.burn_verification(password).await;
            return Err(AuthError::InvalidCredentials);
        };

        match self.hasher.verify(password, &password_hash).await {
            Ok(true) => Ok(identity),
            Ok(false) => Err(AuthError::InvalidCredentials),
            Err(err) => {
                warn!(user_id = %identity.user_id, error = %err, "stored password hash unusable");
                Err(AuthError::Store(StoreError::corrupted(err.to_string())))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::password::BcryptPasswordHasher;

    fn directory() -> InMemoryIdentityDirectory {
        InMemoryIdentityDirectory::new(Arc::new(BcryptPasswordHasher::new(Some(4))))
    }

    #[tokio::test]
    async fn test_verify_credentials() {
        let directory = directory();
        let identity = Identity::new(UserId::random(), "Dana@Example.com").with_role(Role::Admin);
        directory.register(identity.clone(), "s3cret-pass").await.unwrap();

        let verified = directory.verify("dana@example.com", "s3cret-pass").await.unwrap();
        assert_eq!(verified, identity);
        assert_eq!(
            directory.verify("dana@example.com", "wrong").await,
            Err(AuthError::InvalidCredentials)
        );
        assert_eq!(
            directory.verify("nobody@example.com", "s3cret-pass").await,
            Err(AuthError::InvalidCredentials)
        );
        assert_eq!(
            directory.find(identity.user_id).await.unwrap(),
            Some(identity)
        );
        assert_eq!(directory.find(UserId::random()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_unknown_email_still_runs_hash_comparison() {
        let mut hasher = domain::MockPasswordHasher::new();
        hasher
            .expect_hash()
            .times(1)
            .returning(|_| Ok(PasswordHash::new("placeholder")));
        hasher.expect_verify().times(2).returning(|_, _| Ok(false));
        let directory = InMemoryIdentityDirectory::new(Arc::new(hasher));

        for _ in 0..2 {
            assert_eq!(
                directory.verify("ghost@example.com", "guess").await,
                Err(AuthError::InvalidCredentials)
            );
        }
    }

    #[tokio::test]
    async fn test_load_seed_file() {
        let community = CommunityId::random();
        let user_id = UserId::random();
        let yaml = format!(
            r#"
- id: "{user_id}"
  email: mod@example.com
  password: moderator-pass
  roles: [moderator]
  communities: ["{community}"]
- email: resident@example.com
  password: resident-pass
"#
        );
        let path = std::env::temp_dir().join(format!("seed-{}.yaml", UserId::random()));
        tokio::fs::write(&path, yaml).await.unwrap();

        let directory = directory();
        assert_eq!(directory.load_seed_file(&path).await.unwrap(), 2);
        tokio::fs::remove_file(&path).await.unwrap();

        let moderator = directory.find(user_id).await.unwrap().unwrap();
        assert!(moderator.can_moderate());
        assert!(moderator.communities.contains(&community));
        assert!(directory
            .verify("resident@example.com", "resident-pass")
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_seed_without_credential_is_rejected() {
        let directory = directory();
        let seed = SeedIdentity {
            id: None,
            email: "x@example.com".to_string(),
            password: None,
            password_hash: None,
            roles: BTreeSet::new(),
            communities: BTreeSet::new(),
        };
        assert!(matches!(
            directory.load_seed(seed).await,
            Err(DirectoryError::MissingCredential { .. })
        ));
        assert!(directory
            .load_seed_file("/nonexistent/seed.yaml")
            .await
            .is_err());
    }
}
