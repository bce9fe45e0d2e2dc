use axum::{
    Json,
    http::{HeaderValue, StatusCode, header::RETRY_AFTER},
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

use crate::collaborators::{CollaboratorError, GenerationError};
use crate::entitlement::{DenyReason, ResolveError};

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Denied: {0}")]
    Denied(DenyReason),

    #[error("Rate limit exceeded")]
    RateLimited { retry_after: u64 },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Dependency error: {0}")]
    Dependency(#[from] CollaboratorError),

    #[error(transparent)]
    Generation(#[from] GenerationError),
}

impl From<ResolveError> for AppError {
    fn from(err: ResolveError) -> Self {
        match err {
            ResolveError::Denied(reason) => AppError::Denied(reason),
            ResolveError::Dependency(e) => AppError::Dependency(e),
        }
    }
}

pub fn deny_status(reason: DenyReason) -> StatusCode {
    match reason {
        DenyReason::Unauthenticated => StatusCode::UNAUTHORIZED,
        DenyReason::TrialEnded | DenyReason::PremiumRequired => StatusCode::PAYMENT_REQUIRED,
        DenyReason::LimitExceeded => StatusCode::FORBIDDEN,
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message, reason) = match self {
            AppError::Denied(reason) => (
                deny_status(reason),
                reason.message().to_string(),
                Some(reason.as_str()),
            ),
            AppError::RateLimited { .. } => (
                StatusCode::TOO_MANY_REQUESTS,
                "Too many requests. Please try again later.".to_string(),
                Some("rate_limited"),
            ),
            AppError::Validation(ref message) => (StatusCode::BAD_REQUEST, message.clone(), None),
            AppError::Dependency(ref e) => {
                tracing::error!("Dependency error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Unable to verify your account right now".to_string(),
                    None,
                )
            }
            AppError::Generation(ref e) => {
                tracing::error!("Generation error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("Failed to generate reading: {}", e),
                    None,
                )
            }
        };

        let body = Json(json!({
            "error": {
                "message": message,
                "status": status.as_u16(),
                "reason": reason,
            }
        }));

        let mut response = (status, body).into_response();
        if let AppError::RateLimited { retry_after } = self {
            response
                .headers_mut()
                .insert(RETRY_AFTER, HeaderValue::from(retry_after));
        }
        response
    }
}
