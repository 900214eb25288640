use axum::{
    extract::{Path, State},
    http::StatusCode,
    middleware,
    routing::{get, post, put},
    Json, Router,
};
use serde::Serialize;
use tower_http::trace::TraceLayer;

use domain::{PostId, RateClass, RegistryStats, Room};

use crate::{
    admission::{self, guard_mutations, rate_limited},
    auth::{self, AuthenticatedUser},
    error::ApiError,
    state::AppState,
    websocket,
};

pub fn router(state: AppState) -> Router {
    let general = middleware::from_fn_with_state(
        (state.clone(), RateClass::General),
        admission::rate_limit,
    );

    Router::new()
        .route("/health", get(health))
        .route("/ws", get(websocket::handle_upgrade))
        .nest("/api/v1", api_routes(&state))
        .layer(general)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn api_routes(state: &AppState) -> Router<AppState> {
    let auth_routes = rate_limited(
        Router::new()
            .route("/auth/login", post(auth::login))
            .route("/auth/refresh", post(auth::refresh))
            .route("/auth/logout", post(auth::logout)),
        state,
        RateClass::Auth,
    );

    let realtime_routes = guard_mutations(
        Router::new().route(
            "/realtime/posts/{post_id}",
            put(join_post_room).delete(leave_post_room),
        ),
        state,
        RateClass::Authenticated,
    );

    Router::new()
        .merge(auth_routes)
        .merge(realtime_routes)
        .route("/realtime/stats", get(realtime_stats))
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

/// 将当前连接加入帖子房间；身份没有打开的连接时返回 409
async fn join_post_room(
    State(state): State<AppState>,
    AuthenticatedUser(identity): AuthenticatedUser,
    Path(post_id): Path<PostId>,
) -> Result<StatusCode, ApiError> {
    if state
        .registry
        .connection(identity.user_id)
        .await
        .is_none()
    {
        return Err(ApiError::new(
            StatusCode::CONFLICT,
            "NOT_CONNECTED",
            "no open realtime connection",
        ));
    }
    state.registry.join(identity.user_id, Room::Post(post_id)).await;
    Ok(StatusCode::NO_CONTENT)
}

async fn leave_post_room(
    State(state): State<AppState>,
    AuthenticatedUser(identity): AuthenticatedUser,
    Path(post_id): Path<PostId>,
) -> StatusCode {
    state
        .registry
        .leave(identity.user_id, Room::Post(post_id))
        .await;
    StatusCode::NO_CONTENT
}

#[derive(Debug, Serialize)]
struct StatsResponse {
    connections: usize,
    rooms: usize,
}

impl From<RegistryStats> for StatsResponse {
    fn from(stats: RegistryStats) -> Self {
        Self {
            connections: stats.connections,
            rooms: stats.rooms,
        }
    }
}

/// 版主可查看的实时连接统计
async fn realtime_stats(
    State(state): State<AppState>,
    AuthenticatedUser(identity): AuthenticatedUser,
) -> Result<Json<StatsResponse>, ApiError> {
    if !identity.can_moderate() {
        return Err(ApiError::new(
            StatusCode::FORBIDDEN,
            "FORBIDDEN",
            "moderator role required",
        ));
    }
    Ok(Json(state.registry.stats().await.into()))
}
