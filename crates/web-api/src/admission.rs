//! 准入中间件
//!
//! `rate_limit` 按路由分类计数；`idempotency` 读取 `Idempotency-Key` 头，
//! 对变更请求去重并回放保存的响应。

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use axum::{
    body::{to_bytes, Body},
    extract::{ConnectInfo, Request, State},
    http::{header::CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue, Method, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    Router,
};
use domain::{Principal, RateClass, StoredResponse};
use tracing::{error, warn};

use application::{Admission, IdempotencyGuard};

use crate::{auth::bearer_token, error::ApiError, state::AppState};

pub const IDEMPOTENCY_KEY: HeaderName = HeaderName::from_static("idempotency-key");
pub const IDEMPOTENT_REPLAYED: HeaderName = HeaderName::from_static("idempotent-replayed");

const MAX_IDEMPOTENCY_KEY_LEN: usize = 255;
const MAX_BUFFERED_BODY: usize = 1024 * 1024;

/// 请求来源地址：连接信息优先，其次 `X-Forwarded-For` 的第一个地址
pub fn client_address(request: &Request) -> IpAddr {
    if let Some(ConnectInfo(addr)) = request.extensions().get::<ConnectInfo<SocketAddr>>() {
        return addr.ip();
    }
    forwarded_for(request.headers()).unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
}

fn forwarded_for(headers: &HeaderMap) -> Option<IpAddr> {
    headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .and_then(|value| value.trim().parse().ok())
}

/// 请求主体：携带有效访问令牌时为用户，否则为来源地址
fn identity_or_address(state: &AppState, request: &Request) -> Principal {
    bearer_token(request.headers())
        .and_then(|token| state.tokens.verify_access_token(token).ok())
        .and_then(|claims| claims.user_id().ok())
        .map(Principal::User)
        .unwrap_or_else(|| Principal::Address(client_address(request)))
}

fn principal_for(class: RateClass, state: &AppState, request: &Request) -> Principal {
    match class {
        RateClass::General | RateClass::Auth => Principal::Address(client_address(request)),
        RateClass::Authenticated | RateClass::Content => identity_or_address(state, request),
    }
}

pub async fn rate_limit(
    State((state, class)): State<(AppState, RateClass)>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let principal = principal_for(class, &state, &request);
    state.rate_limiter.check(class, &principal).await?;
    Ok(next.run(request).await)
}

fn is_mutating(method: &Method) -> bool {
    matches!(
        *method,
        Method::POST | Method::PUT | Method::PATCH | Method::DELETE
    )
}

fn replay(stored: StoredResponse) -> Response {
    let status = StatusCode::from_u16(stored.status).unwrap_or(StatusCode::OK);
    let mut response = (status, Body::from(stored.body)).into_response();
    let headers = response.headers_mut();
    if let Some(value) = stored
        .content_type
        .and_then(|content_type| HeaderValue::from_str(&content_type).ok())
    {
        headers.insert(CONTENT_TYPE, value);
    }
    headers.insert(IDEMPOTENT_REPLAYED, HeaderValue::from_static("true"));
    response
}

pub async fn idempotency(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if !is_mutating(request.method()) {
        return Ok(next.run(request).await);
    }
    let Some(key) = request.headers().get(&IDEMPOTENCY_KEY) else {
        return Ok(next.run(request).await);
    };
    let key = key
        .to_str()
        .ok()
        .map(str::trim)
        .filter(|key| !key.is_empty() && key.len() <= MAX_IDEMPOTENCY_KEY_LEN)
        .ok_or_else(|| ApiError::bad_request("invalid Idempotency-Key header"))?
        .to_string();

    let scope = identity_or_address(&state, &request).to_string();
    let (parts, body) = request.into_parts();
    let body = to_bytes(body, MAX_BUFFERED_BODY).await.map_err(|_| {
        ApiError::new(
            StatusCode::PAYLOAD_TOO_LARGE,
            "PAYLOAD_TOO_LARGE",
            "request body too large",
        )
    })?;
    let path = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or_else(|| parts.uri.path());
    let fingerprint = IdempotencyGuard::fingerprint(&[
        parts.method.as_str().as_bytes(),
        path.as_bytes(),
        body.as_ref(),
    ]);

    let ticket = match state.idempotency.begin(&scope, &key, &fingerprint).await? {
        Admission::Replay(stored) => return Ok(replay(stored)),
        Admission::Execute(ticket) => ticket,
    };

    let response = next.run(Request::from_parts(parts, Body::from(body))).await;
    let (parts, body) = response.into_parts();
    let bytes = match to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(err) => {
            error!(error = %err, key = %key, "failed to buffer response for idempotency record");
            state.idempotency.release(ticket).await?;
            return Err(ApiError::internal_server_error("failed to read response"));
        }
    };

    if parts.status.is_server_error() {
        if let Err(err) = state.idempotency.release(ticket).await {
            warn!(error = %err, key = %key, "failed to release idempotency key");
        }
    } else {
        let stored = StoredResponse {
            status: parts.status.as_u16(),
            content_type: parts
                .headers
                .get(CONTENT_TYPE)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string),
            body: bytes.to_vec(),
        };
        state.idempotency.complete(ticket, stored).await?;
    }

    Ok(Response::from_parts(parts, Body::from(bytes)))
}

/// 给变更路由加上限流和幂等保护；限流先于幂等预留执行
pub fn guard_mutations(router: Router<AppState>, state: &AppState, class: RateClass) -> Router<AppState> {
    router
        .route_layer(middleware::from_fn_with_state(state.clone(), idempotency))
        .route_layer(middleware::from_fn_with_state(
            (state.clone(), class),
            rate_limit,
        ))
}

/// 只加限流
pub fn rate_limited(router: Router<AppState>, state: &AppState, class: RateClass) -> Router<AppState> {
    router.route_layer(middleware::from_fn_with_state(
        (state.clone(), class),
        rate_limit,
    ))
}
