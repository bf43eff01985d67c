use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("Invalid Argument - {0}")]
    InvalidArgument(String),

    #[error("Not Found - {0}")]
    NotFound(String),

    #[error("Permission Denied - {0}")]
    PermissionDenied(String),

    #[error("Deadline Exceeded - {0}")]
    DeadlineExceeded(String),

    /// Network failures, throttling and server side errors of the remote APIs. The transport
    /// layer may retry these within the call's deadline.
    #[error("Transient Error - {0}")]
    Transient(String),

    #[error("Cancelled - {0}")]
    Cancelled(String),

    /// The listening socket could not be set up.
    #[error("Unavailable - {0}")]
    Unavailable(String),

    #[error("Config Error - {0}")]
    Config(String),

    #[error("Internal Error - {0}")]
    Internal(String),
}

impl Error {
    pub(crate) fn is_transient(&self) -> bool {
        matches!(self, Error::Transient(_))
    }
}

impl From<Error> for tonic::Status {
    fn from(error: Error) -> Self {
        let msg = error.to_string();
        match error {
            Error::InvalidArgument(_) => tonic::Status::invalid_argument(msg),
            Error::NotFound(_) => tonic::Status::not_found(msg),
            Error::PermissionDenied(_) => tonic::Status::permission_denied(msg),
            Error::DeadlineExceeded(_) => tonic::Status::deadline_exceeded(msg),
            Error::Transient(_) | Error::Unavailable(_) => tonic::Status::unavailable(msg),
            Error::Cancelled(_) => tonic::Status::cancelled(msg),
            Error::Config(_) | Error::Internal(_) => tonic::Status::internal(msg),
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() || error.is_connect() {
            Error::Transient(format!("request failed: {error}"))
        } else {
            Error::Internal(format!("request failed: {error}"))
        }
    }
}

#[derive(Deserialize)]
struct GoogleErrorBody {
    error: GoogleErrorDetails,
}

#[derive(Deserialize)]
struct GoogleErrorDetails {
    #[serde(default)]
    message: String,
}

/// Classifies a non-2xx response of a Google API. The error message of the JSON error body is
/// preferred over the raw body when it is present.
pub(crate) fn api_error(api: &str, status: StatusCode, body: &str) -> Error {
    let message = serde_json::from_str::<GoogleErrorBody>(body)
        .map(|b| b.error.message)
        .unwrap_or_else(|_| body.trim().to_string());
    let msg = format!("{api} returned {status}: {message}");

    match status {
        StatusCode::BAD_REQUEST => Error::InvalidArgument(msg),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Error::PermissionDenied(msg),
        StatusCode::NOT_FOUND => Error::NotFound(msg),
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => Error::Transient(msg),
        s if s.is_server_error() => Error::Transient(msg),
        _ => Error::Internal(msg),
    }
}
