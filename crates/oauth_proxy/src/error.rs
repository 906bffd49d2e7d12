use std::net::SocketAddr;

use axum::http::StatusCode;
use thiserror::Error;

use crate::config::ConfigError;

pub type Result<T> = std::result::Result<T, GatewayError>;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Unknown or disabled provider: {0}")]
    UnknownProvider(String),

    #[error("CSRF state mismatch")]
    CsrfMismatch,

    #[error("Identity provider error: {0}")]
    ProviderError(String),

    #[error("Session missing or expired")]
    SessionExpired,

    #[error("Organization not allowed for user: {0}")]
    OrgNotAllowed(String),

    #[error("Upstream unavailable after {attempts} attempt(s)")]
    UpstreamUnavailable { attempts: usize },

    #[error("Request body exceeds {limit} bytes")]
    PayloadTooLarge { limit: usize },

    #[error("Failed to bind {name} listener on {addr}: {source}")]
    ListenerBindFailure {
        name: &'static str,
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("{name} listener on {addr} stopped: {reason}")]
    ListenerFailed {
        name: &'static str,
        addr: SocketAddr,
        reason: String,
    },

    #[error("Certificate error: {0}")]
    CertificateError(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl GatewayError {
    /// Status code the auth gate answers with when this error ends a request.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::CsrfMismatch | Self::SessionExpired => StatusCode::UNAUTHORIZED,
            Self::OrgNotAllowed(_) => StatusCode::FORBIDDEN,
            Self::UnknownProvider(_) => StatusCode::NOT_FOUND,
            Self::ProviderError(_) | Self::UpstreamUnavailable { .. } => StatusCode::BAD_GATEWAY,
            Self::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::ListenerBindFailure { .. }
            | Self::ListenerFailed { .. }
            | Self::CertificateError(_)
            | Self::Internal(_)
            | Self::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Generic, user-facing description. Never includes provider or upstream internals.
    pub fn public_message(&self) -> &'static str {
        match self {
            Self::UnknownProvider(_) => "The selected login provider is not available.",
            Self::CsrfMismatch => "The login attempt could not be verified. Please sign in again.",
            Self::ProviderError(_) => "The identity provider could not complete the login.",
            Self::SessionExpired => "Your session has expired. Please sign in again.",
            Self::OrgNotAllowed(_) => "Your account is not a member of an allowed organization.",
            Self::UpstreamUnavailable { .. } => "The upstream service is currently unavailable.",
            Self::PayloadTooLarge { .. } => "The request body is too large.",
            _ => "An internal error occurred.",
        }
    }
}
