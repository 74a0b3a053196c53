pub mod health;
pub mod metrics;
pub mod store;

use axum::{
    http::{header, HeaderValue, Method},
    routing::get,
    Router,
};
use tower_http::{
    cors::{AllowHeaders, AllowOrigin, CorsLayer},
    trace::TraceLayer,
};

use crate::AppState;

/// Allow the configured base URL, its subdomains (one per site) and local
/// development origins.
fn cors_layer(base_url: &str) -> CorsLayer {
    let base = base_url.trim_end_matches('/').to_string();
    let origin = AllowOrigin::predicate(move |origin: &HeaderValue, _| {
        let Ok(o) = origin.to_str() else {
            return false;
        };
        if o.starts_with("http://localhost") || o.starts_with("http://127.0.0.1") {
            return true;
        }
        if o == base {
            return true;
        }
        if let Some(idx) = base.find("://") {
            let after_scheme = &base[idx + 3..];
            let domain = after_scheme.split('/').next().unwrap_or(after_scheme);
            let domain = domain.split(':').next().unwrap_or(domain);
            if o.ends_with(&format!(".{domain}")) {
                return true;
            }
        }
        false
    });

    CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(AllowHeaders::list([
            header::CONTENT_TYPE,
            header::ACCEPT,
            header::HeaderName::from_static("x-site-slug"),
            header::HeaderName::from_static("x-admin-token"),
        ]))
        .allow_origin(origin)
}

pub fn router(state: AppState) -> Router {
    let cors = cors_layer(&state.config.app_base_url);

    Router::new()
        .route("/health", get(health::health_check))
        .route("/metrics", get(metrics::metrics_handler))
        .route("/api", get(store::api_get).post(store::api_post))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
