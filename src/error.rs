use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

/// Application-wide error types with appropriate HTTP status codes.
///
/// The webhook endpoint never returns these directly: it maps processing
/// failures to a 200 body with an error flag. The `IntoResponse` mapping
/// below serves the admin and health surface.
///
/// # Marketplace Errors
///
/// Marketplace failures are split so the client can decide what to retry:
///
/// - `MarketplaceTransport` - network failure or timeout (retryable)
/// - `MarketplaceStatus` - the API answered with a non-success status
/// - `MarketplaceDecode` - the API answered 2xx with a body we cannot read
/// - `CircuitOpen` - the breaker is failing fast
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Store operation failed: {0}")]
    StoreError(String),

    #[error("Marketplace API request failed: {0}")]
    MarketplaceTransport(String),

    #[error("Marketplace API returned status {status}: {message}")]
    MarketplaceStatus { status: u16, message: String },

    #[error("Marketplace API returned an unreadable body: {0}")]
    MarketplaceDecode(String),

    #[error("Marketplace circuit breaker is open: {0}")]
    CircuitOpen(String),

    #[error("No usable credentials for marketplace user {0}")]
    CredentialsUnavailable(u64),

    #[error("Cannot derive an entity id from resource '{0}'")]
    InvalidResource(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Rate limit exceeded, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Internal server error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Operation timed out: {0}")]
    OperationTimeout(String),
}

impl AppError {
    /// Whether a marketplace call failing with this error is worth one more try.
    pub fn is_transient(&self) -> bool {
        match self {
            AppError::MarketplaceTransport(_) | AppError::OperationTimeout(_) => true,
            AppError::MarketplaceStatus { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }

    /// Short machine-readable label, used in metrics and security event details.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::StoreError(_) => "store_error",
            AppError::MarketplaceTransport(_) => "marketplace_transport",
            AppError::MarketplaceStatus { .. } => "marketplace_status",
            AppError::MarketplaceDecode(_) => "marketplace_decode",
            AppError::CircuitOpen(_) => "circuit_open",
            AppError::CredentialsUnavailable(_) => "credentials_unavailable",
            AppError::InvalidResource(_) => "invalid_resource",
            AppError::SerializationError(_) => "serialization_error",
            AppError::NotFound(_) => "not_found",
            AppError::BadRequest(_) => "bad_request",
            AppError::RateLimited { .. } => "rate_limited",
            AppError::Internal(_) => "internal_error",
            AppError::ConfigError(_) => "config_error",
            AppError::OperationTimeout(_) => "timeout",
        }
    }
}

/// Error response body for API endpoints.
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        // Full detail stays in the logs; clients get a sanitized message
        tracing::error!(error = %self, "Request failed");

        let (status, message) = match &self {
            AppError::StoreError(_) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "Backing store is temporarily unavailable. Please try again later.".to_string(),
            ),
            AppError::MarketplaceTransport(_)
            | AppError::MarketplaceStatus { .. }
            | AppError::MarketplaceDecode(_)
            | AppError::CircuitOpen(_) => (
                StatusCode::BAD_GATEWAY,
                "Marketplace API is unavailable. Please try again later.".to_string(),
            ),
            AppError::CredentialsUnavailable(user_id) => (
                StatusCode::CONFLICT,
                format!("Marketplace credentials for user {user_id} are missing or expired"),
            ),
            AppError::OperationTimeout(_) => (
                StatusCode::GATEWAY_TIMEOUT,
                "Operation timed out. Please try again.".to_string(),
            ),
            AppError::RateLimited { retry_after_secs } => {
                let mut response = (
                    StatusCode::TOO_MANY_REQUESTS,
                    axum::Json(ErrorResponse {
                        error: self.kind().to_string(),
                        message: "Rate limit exceeded".to_string(),
                    }),
                )
                    .into_response();
                if let Ok(value) = HeaderValue::from_str(&retry_after_secs.to_string()) {
                    response.headers_mut().insert(header::RETRY_AFTER, value);
                }
                return response;
            }
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            AppError::BadRequest(msg) | AppError::InvalidResource(msg) => {
                (StatusCode::BAD_REQUEST, msg.clone())
            }
            AppError::SerializationError(_) => (
                StatusCode::BAD_REQUEST,
                "Malformed JSON in request body".to_string(),
            ),
            AppError::Internal(_) | AppError::ConfigError(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "An internal error occurred. Please contact support if the issue persists."
                    .to_string(),
            ),
        };

        let body = ErrorResponse {
            error: self.kind().to_string(),
            message,
        };

        (status, axum::Json(body)).into_response()
    }
}

/// Convenience type alias for Results with AppError.
pub type AppResult<T> = Result<T, AppError>;
