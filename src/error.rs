//! Error taxonomy shared by the transport, rate limiter, dispatcher and client.

use std::time::Duration;

use thiserror::Error;

use crate::types::ErrorInfo;

/// Result type alias using the crate error type.
pub type Result<T> = std::result::Result<T, ApiError>;

/// Terminal failure of a request, or a failure to build one.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    /// Connectivity failure (DNS, TLS, connection reset, ...)
    #[error("network error: {0}")]
    Network(String),

    /// The transport gave up waiting for a response
    #[error("request timed out")]
    Timeout,

    /// Non-success HTTP status
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    /// No rate-limit permit became available within the caller's timeout
    #[error("no rate limit permit granted within {0:?}")]
    RateLimited(Duration),

    /// The request was cancelled before it produced a result
    #[error("request cancelled")]
    Cancelled,

    /// The response body could not be decoded as JSON
    #[error("failed to decode response body: {0}")]
    Decode(String),

    /// Endpoint binding or parameter validation failed
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Configuration is missing or inconsistent
    #[error("configuration error: {0}")]
    Config(String),

    /// The dispatcher is no longer running
    #[error("dispatcher is shut down")]
    Shutdown,
}

impl ApiError {
    /// Failures the dispatcher retries with exponential backoff.
    pub fn is_transient(&self) -> bool {
        match self {
            ApiError::Network(_) | ApiError::Timeout => true,
            ApiError::Http { status, .. } => (500..600).contains(status),
            _ => false,
        }
    }

    /// HTTP 429, handled by the rate limiter rather than plain backoff.
    pub fn is_too_many_requests(&self) -> bool {
        matches!(self, ApiError::Http { status: 429, .. })
    }

    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::Network(_) => "network_error",
            ApiError::Timeout => "timeout",
            ApiError::Http { status, .. } => match *status {
                400 => "bad_request",
                401 => "unauthorized",
                403 => "forbidden",
                404 => "not_found",
                409 => "conflict",
                422 => "unprocessable",
                429 => "rate_limited",
                s if (500..600).contains(&s) => "upstream_error",
                _ => "client_error",
            },
            ApiError::RateLimited(_) => "rate_limited",
            ApiError::Cancelled => "cancelled",
            ApiError::Decode(_) => "decode_error",
            ApiError::InvalidRequest(_) => "invalid_request",
            ApiError::Config(_) => "config_error",
            ApiError::Shutdown => "shutdown",
        }
    }

    /// Whether submitting the same request again later could succeed.
    pub fn retriable(&self) -> bool {
        self.is_transient()
            || self.is_too_many_requests()
            || matches!(self, ApiError::RateLimited(_))
    }

    pub fn to_info(&self) -> ErrorInfo {
        ErrorInfo {
            code: self.code().to_string(),
            message: self.to_string(),
            retriable: self.retriable(),
        }
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ApiError::Timeout
        } else if e.is_builder() {
            // Bad header values or URLs never reach the wire.
            ApiError::InvalidRequest(e.to_string())
        } else {
            ApiError::Network(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn http(status: u16) -> ApiError {
        ApiError::Http {
            status,
            message: String::new(),
        }
    }

    #[test]
    fn error_code_matrix() {
        assert_eq!(http(400).code(), "bad_request");
        assert_eq!(http(401).code(), "unauthorized");
        assert_eq!(http(403).code(), "forbidden");
        assert_eq!(http(404).code(), "not_found");
        assert_eq!(http(409).code(), "conflict");
        assert_eq!(http(418).code(), "client_error");
        let rl = http(429);
        assert_eq!(rl.code(), "rate_limited");
        assert!(rl.retriable());
        assert!(!rl.is_transient());
        let s5 = http(503);
        assert_eq!(s5.code(), "upstream_error");
        assert!(s5.retriable());
    }

    #[test]
    fn transient_classification() {
        assert!(ApiError::Timeout.is_transient());
        assert!(ApiError::Network("reset".into()).is_transient());
        assert!(http(500).is_transient());
        assert!(!http(404).is_transient());
        assert!(!http(429).is_transient());
        assert!(!ApiError::Cancelled.is_transient());
        assert!(!ApiError::Decode("eof".into()).retriable());
    }

    #[test]
    fn info_carries_display_message() {
        let info = ApiError::Http {
            status: 404,
            message: "Channel not found".into(),
        }
        .to_info();
        assert_eq!(info.code, "not_found");
        assert_eq!(info.message, "HTTP 404: Channel not found");
        assert!(!info.retriable);
    }
}
