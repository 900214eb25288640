//! 令牌生命周期
//!
//! 访问令牌无状态，只校验签名和过期时间；刷新令牌额外查询吊销集合。
//! 路由层只能通过这里签发和校验令牌，不直接解析令牌。

use std::sync::Arc;

use chrono::Duration;
use config::JwtConfig;
use domain::{
    AccessClaims, AuthError, Identity, IssuedToken, RefreshClaims, TokenPair,
    TokenRevocationStore,
};
use jsonwebtoken::{
    decode, encode, errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header, Validation,
};
use serde::de::DeserializeOwned;
use tracing::{debug, info};
use uuid::Uuid;

use crate::clock::Clock;

struct SigningKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl SigningKeys {
    fn from_secret(secret: &str) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
        }
    }
}

/// JWT 令牌服务
pub struct TokenService {
    access_keys: SigningKeys,
    refresh_keys: SigningKeys,
    access_ttl: Duration,
    refresh_ttl: Duration,
    issuer: String,
    revocations: Arc<dyn TokenRevocationStore>,
    clock: Arc<dyn Clock>,
}

impl TokenService {
    pub fn new(
        config: &JwtConfig,
        revocations: Arc<dyn TokenRevocationStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            access_keys: SigningKeys::from_secret(&config.access_secret),
            refresh_keys: SigningKeys::from_secret(&config.refresh_secret),
            access_ttl: Duration::minutes(config.access_ttl_minutes),
            refresh_ttl: Duration::days(config.refresh_ttl_days),
            issuer: config.issuer.clone(),
            revocations,
            clock,
        }
    }

    /// 签发访问令牌
    pub fn issue_access_token(&self, identity: &Identity) -> Result<IssuedToken, AuthError> {
        let now = self.clock.now();
        let expires_at = now + self.access_ttl;
        let claims = AccessClaims {
            sub: identity.user_id.to_string(),
            email: identity.email.clone(),
            roles: identity.roles.iter().copied().collect(),
            iat: now.timestamp(),
            exp: expires_at.timestamp(),
            iss: self.issuer.clone(),
        };
        let token = self.sign(&claims, &self.access_keys)?;
        Ok(IssuedToken { token, expires_at })
    }

    /// 签发刷新令牌
    pub fn issue_refresh_token(&self, identity: &Identity) -> Result<IssuedToken, AuthError> {
        let now = self.clock.now();
        let expires_at = now + self.refresh_ttl;
        let claims = RefreshClaims {
            sub: identity.user_id.to_string(),
            jti: Uuid::new_v4().to_string(),
            iat: now.timestamp(),
            exp: expires_at.timestamp(),
            iss: self.issuer.clone(),
        };
        let token = self.sign(&claims, &self.refresh_keys)?;
        Ok(IssuedToken { token, expires_at })
    }

    pub fn issue_pair(&self, identity: &Identity) -> Result<TokenPair, AuthError> {
        Ok(TokenPair {
            access: self.issue_access_token(identity)?,
            refresh: self.issue_refresh_token(identity)?,
        })
    }

    /// 校验访问令牌
    pub fn verify_access_token(&self, token: &str) -> Result<AccessClaims, AuthError> {
        let claims: AccessClaims = self.decode_claims(token, &self.access_keys)?;
        self.ensure_unexpired(claims.exp)?;
        Ok(claims)
    }

    /// 校验刷新令牌，先查吊销集合再做签名校验
    pub async fn verify_refresh_token(&self, token: &str) -> Result<RefreshClaims, AuthError> {
        if self.revocations.is_revoked(token).await? {
            debug!("rejected revoked refresh token");
            return Err(AuthError::Revoked);
        }
        let claims: RefreshClaims = self.decode_claims(token, &self.refresh_keys)?;
        self.ensure_unexpired(claims.exp)?;
        Ok(claims)
    }

    /// 吊销刷新令牌
    ///
    /// 重复吊销是幂等的。签名无效或已自然过期的令牌无需记录，直接返回成功。
    pub async fn revoke(&self, token: &str) -> Result<(), AuthError> {
        let claims: RefreshClaims = match self.decode_claims(token, &self.refresh_keys) {
            Ok(claims) => claims,
            Err(err) => {
                debug!(error = %err, "ignoring revocation of unverifiable token");
                return Ok(());
            }
        };
        if self.ensure_unexpired(claims.exp).is_err() {
            return Ok(());
        }

        let expires_at = chrono::DateTime::from_timestamp(claims.exp, 0)
            .ok_or(AuthError::Malformed)?;
        self.revocations.revoke(token, expires_at).await?;
        info!(user_id = %claims.sub, jti = %claims.jti, "refresh token revoked");
        Ok(())
    }

    fn sign<T: serde::Serialize>(&self, claims: &T, keys: &SigningKeys) -> Result<String, AuthError> {
        encode(&Header::new(Algorithm::HS256), claims, &keys.encoding)
            .map_err(|e| AuthError::Signing(e.to_string()))
    }

    /// 只校验签名、算法和签发者；过期由 `ensure_unexpired` 按注入的时钟判断
    fn decode_claims<T: DeserializeOwned>(
        &self,
        token: &str,
        keys: &SigningKeys,
    ) -> Result<T, AuthError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.validate_exp = false;
        validation.validate_aud = false;
        validation.set_issuer(&[&self.issuer]);

        decode::<T>(token, &keys.decoding, &validation)
            .map(|data| data.claims)
            .map_err(|err| match err.kind() {
                ErrorKind::InvalidSignature => AuthError::BadSignature,
                _ => AuthError::Malformed,
            })
    }

    fn ensure_unexpired(&self, exp: i64) -> Result<(), AuthError> {
        if self.clock.now().timestamp() >= exp {
            Err(AuthError::Expired)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::{TimeZone, Utc};
    use domain::{CommunityId, Role, UserId};
    use infrastructure::InMemoryRevocationStore;

    fn jwt_config() -> JwtConfig {
        JwtConfig {
            access_secret: "access-secret-for-token-service-tests-0001".to_string(),
            refresh_secret: "refresh-secret-for-token-service-tests-0002".to_string(),
            access_ttl_minutes: 15,
            refresh_ttl_days: 30,
            issuer: "community-hub".to_string(),
        }
    }

    fn setup() -> (TokenService, Arc<ManualClock>, Identity) {
        let clock = Arc::new(ManualClock::new(
            Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
        ));
        let service = TokenService::new(
            &jwt_config(),
            Arc::new(InMemoryRevocationStore::new()),
            clock.clone(),
        );
        let identity = Identity::new(UserId::random(), "alice@example.com")
            .with_role(Role::Resident)
            .with_community(CommunityId::random());
        (service, clock, identity)
    }

    #[tokio::test]
    async fn test_access_token_valid_until_ttl_elapses() {
        let (service, clock, identity) = setup();
        let issued = service.issue_access_token(&identity).unwrap();

        let claims = service.verify_access_token(&issued.token).unwrap();
        assert_eq!(claims.user_id().unwrap(), identity.user_id);
        assert_eq!(claims.email, "alice@example.com");
        assert_eq!(claims.roles, vec![Role::Resident]);

        clock.advance(Duration::minutes(15) - Duration::seconds(1));
        assert!(service.verify_access_token(&issued.token).is_ok());

        clock.advance(Duration::seconds(1));
        assert_eq!(
            service.verify_access_token(&issued.token),
            Err(AuthError::Expired)
        );
    }

    #[tokio::test]
    async fn test_tokens_are_not_interchangeable() {
        let (service, _clock, identity) = setup();
        let pair = service.issue_pair(&identity).unwrap();

        assert_eq!(
            service.verify_access_token(&pair.refresh.token),
            Err(AuthError::BadSignature)
        );
        assert_eq!(
            service.verify_refresh_token(&pair.access.token).await,
            Err(AuthError::BadSignature)
        );
        assert_eq!(
            service.verify_access_token("not.a.jwt"),
            Err(AuthError::Malformed)
        );
    }

    #[tokio::test]
    async fn test_revoked_refresh_token_is_rejected() {
        let (service, _clock, identity) = setup();
        let refresh = service.issue_refresh_token(&identity).unwrap();
        assert!(service.verify_refresh_token(&refresh.token).await.is_ok());

        service.revoke(&refresh.token).await.unwrap();
        service.revoke(&refresh.token).await.unwrap();
        assert_eq!(
            service.verify_refresh_token(&refresh.token).await,
            Err(AuthError::Revoked)
        );

        let other = service.issue_refresh_token(&identity).unwrap();
        assert_ne!(other.token, refresh.token);
        assert!(service.verify_refresh_token(&other.token).await.is_ok());
    }

    #[tokio::test]
    async fn test_concurrent_revocation_is_idempotent() {
        let (service, _clock, identity) = setup();
        let service = Arc::new(service);
        let refresh = service.issue_refresh_token(&identity).unwrap();

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let service = service.clone();
            let token = refresh.token.clone();
            tasks.push(tokio::spawn(async move { service.revoke(&token).await }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(
            service.verify_refresh_token(&refresh.token).await,
            Err(AuthError::Revoked)
        );
    }

    #[tokio::test]
    async fn test_refresh_token_expires() {
        let (service, clock, identity) = setup();
        let refresh = service.issue_refresh_token(&identity).unwrap();

        clock.advance(Duration::days(30));
        assert_eq!(
            service.verify_refresh_token(&refresh.token).await,
            Err(AuthError::Expired)
        );
        // 已过期的令牌无需进入吊销集合
        service.revoke(&refresh.token).await.unwrap();
        service.revoke("garbage").await.unwrap();
    }
}
