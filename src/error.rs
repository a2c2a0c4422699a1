//! Error types for the storefront gateway

use std::io;

use axum::{
    Json,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

/// Result type alias for gateway startup and configuration
pub type Result<T> = std::result::Result<T, Error>;

/// Process-level gateway errors (startup, configuration, I/O)
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Request-level failures, each terminal for the request that raised it.
///
/// Every variant renders as a JSON object with an `error` field.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    /// No `Authorization: Bearer` credential on a protected route
    #[error("Authorization header is missing")]
    MissingCredential,

    /// Token header names an algorithm outside the HMAC family
    #[error("Unexpected signing method: {0}")]
    UnexpectedSigningMethod(String),

    /// Bad signature, malformed structure, or expired token
    #[error("Invalid token: {0}")]
    InvalidToken(String),

    /// Claims present but missing required fields or carrying the wrong types
    #[error("Invalid token claims: {0}")]
    MalformedClaims(String),

    /// Client bucket is empty
    #[error("Rate limit exceeded")]
    RateLimitExceeded {
        /// Seconds until one token is available again
        retry_after: u64,
    },

    /// Logical service has no entry in the route table
    #[error("Service not found")]
    RouteNotFound(String),

    /// Connection to the backend failed
    #[error("Upstream service unavailable")]
    UpstreamUnreachable(String),

    /// Backend did not answer within the request timeout
    #[error("Upstream request timed out")]
    UpstreamTimeout(String),

    /// Inbound body exceeded the configured limit
    #[error("Request body too large")]
    PayloadTooLarge,

    /// Inbound request could not be turned into an upstream request
    #[error("Bad request: {0}")]
    BadRequest(String),
}

impl GatewayError {
    /// HTTP status for this failure
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::MissingCredential
            | Self::UnexpectedSigningMethod(_)
            | Self::InvalidToken(_)
            | Self::MalformedClaims(_) => StatusCode::UNAUTHORIZED,
            Self::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::RouteNotFound(_) | Self::UpstreamUnreachable(_) => StatusCode::BAD_GATEWAY,
            Self::UpstreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        match self {
            Self::RateLimitExceeded { retry_after } => {
                let mut response = (
                    status,
                    Json(json!({
                        "error": "Rate limit exceeded",
                        "retry_after": retry_after,
                    })),
                )
                    .into_response();
                response
                    .headers_mut()
                    .insert(header::RETRY_AFTER, HeaderValue::from(retry_after));
                response
            }
            Self::MissingCredential
            | Self::UnexpectedSigningMethod(_)
            | Self::InvalidToken(_)
            | Self::MalformedClaims(_) => (
                status,
                [(header::WWW_AUTHENTICATE, "Bearer")],
                Json(json!({ "error": self.to_string() })),
            )
                .into_response(),
            // Upstream details stay in the logs
            _ => (status, Json(json!({ "error": self.to_string() }))).into_response(),
        }
    }
}
