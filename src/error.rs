use http::StatusCode;
use thiserror::Error;

/// Unified error type for the Egret proxy
#[derive(Error, Debug)]
pub enum EgretError {
    // Configuration errors (fatal at startup, never at runtime)
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // Selection errors
    #[error("no available IPs")]
    NoAvailableIps,

    // Limiter errors
    #[error("connection limit reached for IP")]
    IpLimitReached,

    #[error("total connection limit reached")]
    TotalLimitReached,

    // Upstream errors
    #[error("upstream connection failed: {0}")]
    UpstreamConnectFailed(String),

    #[error("operation timed out")]
    Timeout,

    // Authentication errors
    #[error("authentication failed")]
    AuthenticationFailed,

    // Request errors
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    // I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // HTTP errors
    #[error("HTTP error: {0}")]
    Http(String),

    // Internal errors
    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type alias for Egret operations
pub type Result<T> = std::result::Result<T, EgretError>;

impl EgretError {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            EgretError::InvalidRequest(_) | EgretError::InvalidConfig(_) => {
                StatusCode::BAD_REQUEST
            }

            EgretError::AuthenticationFailed => StatusCode::PROXY_AUTHENTICATION_REQUIRED,

            // Selection and limit failures are recoverable by the client
            EgretError::NoAvailableIps
            | EgretError::IpLimitReached
            | EgretError::TotalLimitReached => StatusCode::SERVICE_UNAVAILABLE,

            EgretError::UpstreamConnectFailed(_) => StatusCode::BAD_GATEWAY,

            EgretError::Timeout => StatusCode::GATEWAY_TIMEOUT,

            EgretError::Io(_) | EgretError::Http(_) | EgretError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Check if this error is a limit rejection (per-IP or total)
    pub fn is_limit_rejection(&self) -> bool {
        matches!(
            self,
            EgretError::IpLimitReached | EgretError::TotalLimitReached
        )
    }
}

impl From<hyper::Error> for EgretError {
    fn from(err: hyper::Error) -> Self {
        EgretError::Http(err.to_string())
    }
}

impl From<url::ParseError> for EgretError {
    fn from(err: url::ParseError) -> Self {
        EgretError::InvalidConfig(err.to_string())
    }
}
