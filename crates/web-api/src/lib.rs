//! Web API 层。
//!
//! 提供 Axum 路由：认证端点、准入中间件以及实时 WebSocket 入口，
//! 请求委托给应用层的用例服务。

mod admission;
mod auth;
mod error;
mod routes;
mod state;
mod websocket;

pub use admission::{
    client_address, guard_mutations, idempotency, rate_limit, rate_limited, IDEMPOTENCY_KEY,
    IDEMPOTENT_REPLAYED,
};
pub use auth::{bearer_token, AuthenticatedUser, SessionResponse, UserView, REFRESH_COOKIE};
pub use error::{ApiError, ErrorBody};
pub use routes::router;
pub use state::AppState;
pub use websocket::WebSocketQuery;
