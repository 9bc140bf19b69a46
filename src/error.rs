use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Authentication required")]
    Unauthorized,

    #[error("Token exchange failed: {0}")]
    TokenExchangeError(String),

    #[error("Token refresh failed: {0}")]
    TokenRefreshError(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Rate limited after {attempts} attempts")]
    RateLimited { attempts: u32 },

    #[error("Spotify API error ({status}): {message}")]
    Upstream { status: u16, message: String },

    #[error("Request error: {0}")]
    RequestError(#[from] reqwest::Error),

    #[error("Internal server error")]
    InternalError(#[from] anyhow::Error),
}

impl AppError {
    /// HTTP status reported by Spotify, when the failure came from the API.
    pub fn status(&self) -> Option<u16> {
        match self {
            AppError::Unauthorized => Some(401),
            AppError::RateLimited { .. } => Some(429),
            AppError::Upstream { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match &self {
            AppError::Unauthorized => (StatusCode::UNAUTHORIZED, self.to_string()),
            AppError::TokenExchangeError(_) | AppError::TokenRefreshError(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Authentication failed".to_string(),
            ),
            AppError::RateLimited { .. } => (StatusCode::TOO_MANY_REQUESTS, self.to_string()),
            AppError::Upstream { status, message } => (
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY),
                message.clone(),
            ),
            AppError::RequestError(_) => (StatusCode::BAD_GATEWAY, "Upstream error".to_string()),
            AppError::Storage(_) | AppError::InternalError(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
            ),
        };

        let body = Json(json!({
            "error": error_message
        }));

        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
