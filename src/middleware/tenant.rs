use std::convert::Infallible;

use axum::{extract::FromRequestParts, http::request::Parts};

use crate::{services::validation::normalize_slug, AppState};

/// Site slug from the `X-Site-Slug` header, normalized. Public pages call
/// `get_status` with the header instead of a body field.
#[derive(Debug, Clone)]
pub struct SiteHeader(pub Option<String>);

impl FromRequestParts<AppState> for SiteHeader {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &AppState) -> Result<Self, Self::Rejection> {
        let slug = parts
            .headers
            .get("X-Site-Slug")
            .and_then(|v| v.to_str().ok())
            .map(normalize_slug)
            .filter(|s| !s.is_empty());
        Ok(SiteHeader(slug))
    }
}
