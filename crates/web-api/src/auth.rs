//! 认证路由与提取器
//!
//! 路由只调用会话用例，不直接解析或构造令牌。刷新令牌放在 `refreshToken` Cookie 中，
//! 也可由非浏览器客户端在请求体中提交。

use axum::{
    body::Bytes,
    extract::{FromRequestParts, State},
    http::{header::AUTHORIZATION, request::Parts, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use chrono::{DateTime, Utc};
use domain::{CommunityId, Identity, Role, UserId};
use serde::{Deserialize, Serialize};
use validator::Validate;

use application::Session;

use crate::{error::ApiError, state::AppState};

pub const REFRESH_COOKIE: &str = "refreshToken";

/// 从 `Authorization: Bearer` 头中取出令牌
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

fn refresh_token_cookie(jar: &CookieJar) -> Option<String> {
    jar.get(REFRESH_COOKIE)
        .map(|cookie| cookie.value().to_string())
        .filter(|value| !value.is_empty())
}

/// 已认证的请求身份
#[derive(Debug, Clone)]
pub struct AuthenticatedUser(pub Identity);

impl FromRequestParts<AppState> for AuthenticatedUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = bearer_token(&parts.headers)
            .ok_or_else(|| ApiError::unauthorized("missing bearer token"))?;
        let identity = state.sessions.authenticate(token).await?;
        Ok(Self(identity))
    }
}

#[derive(Debug, Deserialize, Validate)]
pub struct LoginPayload {
    #[validate(email)]
    pub email: String,
    #[validate(length(min = 1, max = 256))]
    pub password: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshPayload {
    #[serde(default)]
    pub refresh_token: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserView {
    pub id: UserId,
    pub email: String,
    pub roles: Vec<Role>,
    pub communities: Vec<CommunityId>,
}

impl From<&Identity> for UserView {
    fn from(identity: &Identity) -> Self {
        Self {
            id: identity.user_id,
            email: identity.email.clone(),
            roles: identity.roles.iter().copied().collect(),
            communities: identity.communities.iter().copied().collect(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionResponse {
    pub user: UserView,
    pub access_token: String,
    pub access_token_expires_at: DateTime<Utc>,
    pub refresh_token: String,
    pub refresh_token_expires_at: DateTime<Utc>,
}

impl From<&Session> for SessionResponse {
    fn from(session: &Session) -> Self {
        Self {
            user: UserView::from(&session.identity),
            access_token: session.tokens.access.token.clone(),
            access_token_expires_at: session.tokens.access.expires_at,
            refresh_token: session.tokens.refresh.token.clone(),
            refresh_token_expires_at: session.tokens.refresh.expires_at,
        }
    }
}

fn refresh_cookie(state: &AppState, token: String, max_age: time::Duration) -> Cookie<'static> {
    Cookie::build((REFRESH_COOKIE, token))
        .http_only(true)
        .secure(state.secure_cookies)
        .same_site(SameSite::Lax)
        .path("/")
        .max_age(max_age)
        .build()
}

fn session_response(state: &AppState, jar: CookieJar, session: &Session) -> Response {
    let cookie = refresh_cookie(
        state,
        session.tokens.refresh.token.clone(),
        time::Duration::days(state.refresh_ttl_days),
    );
    (jar.add(cookie), Json(SessionResponse::from(session))).into_response()
}

pub async fn login(
    State(state): State<AppState>,
    jar: CookieJar,
    Json(payload): Json<LoginPayload>,
) -> Result<Response, ApiError> {
    payload
        .validate()
        .map_err(|err| ApiError::bad_request(err.to_string()))?;

    let session = state.sessions.login(&payload.email, &payload.password).await?;
    Ok(session_response(&state, jar, &session))
}

/// 轮换令牌对：旧刷新令牌被吊销
pub async fn refresh(
    State(state): State<AppState>,
    jar: CookieJar,
    body: Bytes,
) -> Result<Response, ApiError> {
    let payload: RefreshPayload = if body.is_empty() {
        RefreshPayload::default()
    } else {
        serde_json::from_slice(&body).map_err(|err| ApiError::bad_request(err.to_string()))?
    };
    let token = payload
        .refresh_token
        .or_else(|| refresh_token_cookie(&jar))
        .ok_or_else(|| ApiError::unauthorized("refresh token required"))?;

    let session = state.sessions.refresh(&token).await?;
    Ok(session_response(&state, jar, &session))
}

/// 登出总是返回 204
pub async fn logout(
    State(state): State<AppState>,
    jar: CookieJar,
) -> Result<Response, ApiError> {
    if let Some(token) = refresh_token_cookie(&jar) {
        state.sessions.logout(&token).await?;
    }
    let cleared = refresh_cookie(&state, String::new(), time::Duration::ZERO);
    Ok((StatusCode::NO_CONTENT, jar.add(cleared)).into_response())
}
