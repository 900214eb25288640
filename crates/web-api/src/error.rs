use application::ApplicationError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use domain::{AdmissionError, AuthError, RealtimeError, StoreError};
use serde::Serialize;
use tracing::error;

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: ErrorBody,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            body: ErrorBody {
                code,
                message: message.into(),
            },
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "AUTH_REQUIRED", message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "INVALID_ARGUMENT", message)
    }

    pub fn internal_server_error(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", message)
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn code(&self) -> &'static str {
        self.body.code
    }
}

impl From<StoreError> for ApiError {
    fn from(error: StoreError) -> Self {
        error!(error = %error, "store failure");
        ApiError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "STORE_UNAVAILABLE",
            "backing store unavailable",
        )
    }
}

impl From<AuthError> for ApiError {
    fn from(error: AuthError) -> Self {
        match error {
            AuthError::Expired => {
                ApiError::new(StatusCode::UNAUTHORIZED, "AUTH_EXPIRED", "token expired")
            }
            AuthError::Malformed | AuthError::BadSignature => {
                ApiError::new(StatusCode::UNAUTHORIZED, "AUTH_MALFORMED", "token invalid")
            }
            AuthError::Revoked => {
                ApiError::new(StatusCode::UNAUTHORIZED, "AUTH_REVOKED", "token revoked")
            }
            AuthError::InvalidCredentials => ApiError::new(
                StatusCode::UNAUTHORIZED,
                "INVALID_CREDENTIALS",
                "invalid email or password",
            ),
            AuthError::UnknownIdentity => {
                ApiError::new(StatusCode::UNAUTHORIZED, "UNKNOWN_IDENTITY", "invalid user")
            }
            AuthError::Signing(message) => {
                error!(error = %message, "token signing failed");
                ApiError::internal_server_error("failed to issue token")
            }
            AuthError::Store(err) => err.into(),
        }
    }
}

impl From<AdmissionError> for ApiError {
    fn from(error: AdmissionError) -> Self {
        match error {
            AdmissionError::RateLimited { .. } => ApiError::new(
                StatusCode::TOO_MANY_REQUESTS,
                "RATE_LIMITED",
                "too many requests, please try again later",
            ),
            AdmissionError::IdempotencyConflict => ApiError::new(
                StatusCode::CONFLICT,
                "IDEMPOTENCY_CONFLICT",
                "idempotency key was already used with a different request",
            ),
            AdmissionError::IdempotencyInFlight => ApiError::new(
                StatusCode::CONFLICT,
                "IDEMPOTENCY_IN_FLIGHT",
                "a request with this idempotency key is still being processed",
            ),
            AdmissionError::Store(err) => err.into(),
        }
    }
}

impl From<RealtimeError> for ApiError {
    fn from(error: RealtimeError) -> Self {
        match error {
            RealtimeError::ConnectionRejected(reason) => {
                ApiError::new(StatusCode::UNAUTHORIZED, "CONNECTION_REJECTED", reason.description())
            }
            RealtimeError::InvalidTransition { from, to } => {
                error!(?from, ?to, "connection state violated");
                ApiError::internal_server_error("connection state error")
            }
        }
    }
}

impl From<ApplicationError> for ApiError {
    fn from(error: ApplicationError) -> Self {
        match error {
            ApplicationError::Auth(err) => err.into(),
            ApplicationError::Admission(err) => err.into(),
            ApplicationError::Realtime(err) => err.into(),
            ApplicationError::Store(err) => err.into(),
            ApplicationError::Password(err) => {
                error!(error = %err, "password hashing failed");
                ApiError::internal_server_error("password processing failed")
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}
