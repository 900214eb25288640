use domain::{AdmissionError, AuthError, PasswordHasherError, RealtimeError, StoreError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApplicationError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Admission(#[from] AdmissionError),
    #[error(transparent)]
    Realtime(#[from] RealtimeError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("password error: {0}")]
    Password(#[from] PasswordHasherError),
}
