use std::convert::Infallible;

use axum::{extract::FromRequestParts, http::request::Parts};

use crate::{error::ApiError, AppState};

/// Optional admin token sent in the `X-Admin-Token` header. Admin operations
/// also accept the token in the request body, so a missing header is not a
/// rejection here.
pub struct AdminToken(pub Option<String>);

impl FromRequestParts<AppState> for AdminToken {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &AppState) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get("X-Admin-Token")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        Ok(AdminToken(token))
    }
}

/// Compare a presented token with the configured one. An empty configured
/// token disables every admin operation.
pub fn verify_admin_token(configured: &str, presented: Option<&str>) -> Result<(), ApiError> {
    match presented {
        Some(token) if !configured.is_empty() && token.trim() == configured => Ok(()),
        _ => Err(ApiError::Unauthorized),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_must_match_exactly() {
        assert!(verify_admin_token("secret", Some("secret")).is_ok());
        assert!(verify_admin_token("secret", Some(" secret ")).is_ok());
        assert_eq!(verify_admin_token("secret", Some("Secret")), Err(ApiError::Unauthorized));
        assert_eq!(verify_admin_token("secret", None), Err(ApiError::Unauthorized));
        assert_eq!(verify_admin_token("", Some("")), Err(ApiError::Unauthorized));
    }
}
