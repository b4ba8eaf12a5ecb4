//! Export distro error abstractions.

use axum::http::StatusCode;
use thiserror::Error;

/// Application error variants.
#[derive(Debug, Error)]
pub enum AppError {
    /// The given input was invalid.
    #[error("validation error: {0}")]
    InvalidInput(String),
    /// The server has hit an internal error, but will remain online.
    #[error("internal server error")]
    Ise(anyhow::Error),
}

/// An extension trait for the `AppError`.
pub trait AppErrorExt {
    /// Get the HTTP status code and message for this error.
    fn into_status(self) -> (StatusCode, String);
}

impl AppErrorExt for AppError {
    fn into_status(self) -> (StatusCode, String) {
        match self {
            AppError::InvalidInput(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            AppError::Ise(_) => (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()),
        }
    }
}

/// The error type used to indicate that a system shutdown is required.
#[derive(Debug, Error)]
#[error("fatal error: {0}")]
pub struct ShutdownError(#[from] pub anyhow::Error);

/// A result type where the error is a `ShutdownError`.
pub type ShutdownResult<T> = ::std::result::Result<T, ShutdownError>;
