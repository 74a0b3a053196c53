use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::db::StoreError;

/// Every failure the `/api` endpoint can report. The `Display` string of each
/// variant is its wire code.
#[derive(Debug, Error, PartialEq)]
pub enum ApiError {
    #[error("validation failed")]
    Validation(Vec<&'static str>),

    #[error("unauthorized")]
    Unauthorized,

    #[error("missing_site")]
    MissingSite,

    #[error("site_not_found")]
    SiteNotFound,

    #[error("missing_email_or_password")]
    MissingEmailOrPassword,

    #[error("missing_siteSlug")]
    MissingSiteSlug,

    #[error("missing_siteSlug_header")]
    MissingSiteSlugHeader,

    #[error("missing_email")]
    MissingEmail,

    #[error("missing_params")]
    MissingParams,

    #[error("not_found")]
    NotFound,

    #[error("invalid_credentials")]
    InvalidCredentials,

    #[error("invalid_token")]
    InvalidToken,

    #[error("expired_token")]
    ExpiredToken,

    #[error("forbidden_onboarding")]
    ForbiddenOnboarding,

    #[error("too_many_attempts")]
    TooManyAttempts,

    #[error("unknown_action")]
    UnknownAction,

    #[error("invalid_json")]
    InvalidJson,

    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation(_)
            | ApiError::MissingSite
            | ApiError::MissingEmailOrPassword
            | ApiError::MissingSiteSlug
            | ApiError::MissingSiteSlugHeader
            | ApiError::MissingEmail
            | ApiError::MissingParams
            | ApiError::InvalidToken
            | ApiError::ExpiredToken
            | ApiError::UnknownAction
            | ApiError::InvalidJson => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized | ApiError::InvalidCredentials => StatusCode::UNAUTHORIZED,
            ApiError::ForbiddenOnboarding => StatusCode::FORBIDDEN,
            ApiError::SiteNotFound | ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::TooManyAttempts => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        ApiError::Internal(e.to_string())
    }
}

impl From<bcrypt::BcryptError> for ApiError {
    fn from(e: bcrypt::BcryptError) -> Self {
        ApiError::Internal(format!("password hashing failed: {e}"))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match &self {
            ApiError::Validation(errors) => json!({ "ok": false, "errors": errors }),
            ApiError::Internal(message) => {
                tracing::error!("request failed: {message}");
                json!({ "ok": false, "error": message })
            }
            other => json!({ "ok": false, "error": other.to_string() }),
        };
        (status, Json(body)).into_response()
    }
}
