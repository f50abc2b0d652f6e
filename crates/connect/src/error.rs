use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Rate limited. Retry after {retry_after}s")]
    RateLimited { retry_after: u64 },

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("API error: {0}")]
    Api(String),

    #[error("Timeout: {0}")]
    Timeout(String),
}

impl ApiError {
    pub fn user_message(&self) -> &'static str {
        match self {
            ApiError::Auth(_) => "You are signed out. Please sign in again.",
            ApiError::RateLimited { .. } => "Too many requests. Please slow down.",
            ApiError::Network(_) => "Network error. Check your connection.",
            ApiError::Validation(_) => "The server sent an unexpected response.",
            ApiError::Api(_) => "Server error. Please try again later.",
            ApiError::Timeout(_) => "Request timed out. Please try again.",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ApiError::RateLimited { .. } | ApiError::Network(_) | ApiError::Timeout(_)
        )
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

/// Recovers the typed error from an `anyhow` chain built by the client. Any
/// other error is reported as a generic API failure.
pub fn map_anyhow_error(e: anyhow::Error) -> ApiError {
    let e = match e.downcast::<ApiError>() {
        Ok(api) => return api,
        Err(e) => e,
    };
    match e.downcast::<reqwest::Error>() {
        Ok(req) if req.is_timeout() => ApiError::Timeout(req.to_string()),
        Ok(req) => ApiError::Network(req),
        Err(e) => ApiError::Api(format!("{e:#}")),
    }
}

/// Failure modes of a single connection attempt.
///
/// Every variant ends up inside a [`crate::ConnectionOutcome`]; none of them
/// escape the coordinator as an `Err`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectError {
    #[error("Could not start authorization: {0}")]
    AuthInitiation(String),

    #[error("Popup blocked")]
    PopupBlocked,

    #[error("Window closed")]
    WindowClosed,

    #[error("OAuth timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("Provider reported an error: {}", .0.as_deref().unwrap_or("unknown"))]
    ProviderReported(Option<String>),
}

impl ConnectError {
    pub fn user_message(&self) -> &'static str {
        match self {
            ConnectError::AuthInitiation(_) => {
                "Could not start the connection. Please sign in and try again."
            }
            ConnectError::PopupBlocked => {
                "The sign-in window was blocked. Allow popups and try again."
            }
            ConnectError::WindowClosed => "The sign-in window was closed before finishing.",
            ConnectError::Timeout(_) => "Connecting took too long. Please try again.",
            ConnectError::ProviderReported(_) => "The provider refused the connection.",
        }
    }

    /// Rank used when both channels failed and one error has to be reported.
    /// Lower wins.
    pub(crate) fn precedence(&self) -> u8 {
        match self {
            ConnectError::ProviderReported(_) => 0,
            ConnectError::Timeout(_) => 1,
            ConnectError::WindowClosed => 2,
            ConnectError::AuthInitiation(_) | ConnectError::PopupBlocked => 3,
        }
    }
}
