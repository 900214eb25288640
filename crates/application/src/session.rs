//! 会话用例
//!
//! 组合凭证校验、身份目录与令牌服务，供认证路由和实时握手使用。

use std::sync::Arc;

use domain::{AuthError, CredentialVerifier, Identity, IdentityDirectory, TokenPair, UserId};
use tracing::{info, warn};

use crate::error::ApplicationError;
use crate::tokens::TokenService;

/// 已认证的会话：身份快照与新签发的令牌对
#[derive(Debug, Clone)]
pub struct Session {
    pub identity: Identity,
    pub tokens: TokenPair,
}

pub struct SessionService {
    tokens: Arc<TokenService>,
    credentials: Arc<dyn CredentialVerifier>,
    directory: Arc<dyn IdentityDirectory>,
}

impl SessionService {
    pub fn new(
        tokens: Arc<TokenService>,
        credentials: Arc<dyn CredentialVerifier>,
        directory: Arc<dyn IdentityDirectory>,
    ) -> Self {
        Self {
            tokens,
            credentials,
            directory,
        }
    }

    pub fn tokens(&self) -> &TokenService {
        &self.tokens
    }

    /// 邮箱密码登录
    pub async fn login(&self, email: &str, password: &str) -> Result<Session, ApplicationError> {
        let identity = self.credentials.verify(email, password).await?;
        let tokens = self.tokens.issue_pair(&identity)?;
        info!(user_id = %identity.user_id, "user logged in");
        Ok(Session { identity, tokens })
    }

    /// 用刷新令牌换取新的令牌对，旧刷新令牌随即吊销
    pub async fn refresh(&self, refresh_token: &str) -> Result<Session, ApplicationError> {
        let claims = self.tokens.verify_refresh_token(refresh_token).await?;
        let identity = self.resolve(claims.user_id()?).await?;
        let tokens = self.tokens.issue_pair(&identity)?;
        self.tokens.revoke(refresh_token).await?;
        info!(user_id = %identity.user_id, "refresh token rotated");
        Ok(Session { identity, tokens })
    }

    /// 登出，吊销刷新令牌
    pub async fn logout(&self, refresh_token: &str) -> Result<(), ApplicationError> {
        self.tokens.revoke(refresh_token).await?;
        Ok(())
    }

    /// 校验访问令牌并从目录解析当前身份
    pub async fn authenticate(&self, access_token: &str) -> Result<Identity, ApplicationError> {
        let claims = self.tokens.verify_access_token(access_token)?;
        self.resolve(claims.user_id()?).await
    }

    async fn resolve(&self, user_id: UserId) -> Result<Identity, ApplicationError> {
        match self.directory.find(user_id).await? {
            Some(identity) => Ok(identity),
            None => {
                warn!(user_id = %user_id, "token subject missing from identity directory");
                Err(AuthError::UnknownIdentity.into())
            }
        }
    }
}
